use std::fmt;
use std::str::FromStr;

/// Variant assumed when a graph ref carries no `@variant` suffix.
pub const DEFAULT_VARIANT: &str = "current";

/// Names one supergraph: `graph_id@variant`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GraphRef {
    graph_id: String,
    variant: String,
}

impl GraphRef {
    pub fn new<G, V>(graph_id: G, variant: V) -> Result<Self, GraphRefError>
    where
        G: Into<String>,
        V: Into<String>,
    {
        let graph_ref = GraphRef {
            graph_id: graph_id.into(),
            variant: variant.into(),
        };

        if graph_ref.graph_id.is_empty() || graph_ref.variant.is_empty() {
            return Err(GraphRefError::Malformed(graph_ref.to_string()));
        }

        let is_invalid = |c: char| c.is_whitespace() || c == '/' || c == '\\' || c == '@';
        if graph_ref.graph_id.contains(is_invalid) || graph_ref.variant.contains(is_invalid) {
            return Err(GraphRefError::InvalidCharacter(graph_ref.to_string()));
        }

        Ok(graph_ref)
    }

    /// Graph ref of a build notification. Studio sends the full `graph@variant`
    /// in `variantID`; a bare variant name is qualified with `graphID`.
    pub fn from_build_event(graph_id: &str, variant_id: &str) -> Result<Self, GraphRefError> {
        if !variant_id.contains('@') {
            return GraphRef::new(graph_id, variant_id);
        }

        let graph_ref: GraphRef = variant_id.parse()?;
        if graph_ref.graph_id != graph_id {
            return Err(GraphRefError::GraphMismatch {
                graph_id: graph_id.to_string(),
                variant_id: variant_id.to_string(),
            });
        }
        Ok(graph_ref)
    }

    pub fn graph_id(&self) -> &str {
        &self.graph_id
    }

    pub fn variant(&self) -> &str {
        &self.variant
    }
}

impl FromStr for GraphRef {
    type Err = GraphRefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(GraphRefError::Empty);
        }

        match s.split_once('@') {
            Some((graph_id, variant)) => GraphRef::new(graph_id, variant),
            None => GraphRef::new(s, DEFAULT_VARIANT),
        }
    }
}

impl fmt::Display for GraphRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.graph_id, self.variant)
    }
}

/// Storage key of a supergraph in the fallback store.
///
/// The webhook writer and every reader derive keys through
/// [`ObjectKey::for_graph_ref`] only, so the same graph ref always maps to the
/// same object.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectKey(String);

impl ObjectKey {
    pub fn for_graph_ref(graph_ref: &GraphRef) -> Self {
        ObjectKey(format!("{graph_ref}.graphql"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum GraphRefError {
    #[error("graph ref is empty")]
    Empty,
    #[error("invalid graph ref {0:?}: graph id and variant must be non-empty")]
    Malformed(String),
    #[error("invalid character in graph ref {0:?}")]
    InvalidCharacter(String),
    #[error("variant {variant_id:?} does not belong to graph {graph_id:?}")]
    GraphMismatch {
        graph_id: String,
        variant_id: String,
    },
}
