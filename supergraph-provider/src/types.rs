use std::sync::Arc;

/// A supergraph as served to the host: SDL text plus an opaque freshness
/// marker (uplink id, build timestamp or `"file"`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchemaDocument {
    pub id: String,
    pub sdl: Arc<str>,
}

impl SchemaDocument {
    pub fn new(id: impl Into<String>, sdl: impl Into<Arc<str>>) -> Self {
        SchemaDocument {
            id: id.into(),
            sdl: sdl.into(),
        }
    }

    pub fn same_sdl(&self, other: &SchemaDocument) -> bool {
        self.sdl == other.sdl
    }
}
