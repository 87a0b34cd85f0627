//! Common types for metrics definitions.
//!
//! Every crate declares its metrics as `MetricDef` constants in its own
//! `metrics_defs.rs` and lists them in an `ALL_METRICS` slice, which the
//! binary passes to [`describe_all`] once a recorder is installed.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

impl MetricType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "Counter",
            MetricType::Gauge => "Gauge",
            MetricType::Histogram => "Histogram",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MetricDef {
    pub name: &'static str,
    pub metric_type: MetricType,
    pub description: &'static str,
}

impl MetricDef {
    /// Registers the description with the installed recorder.
    pub fn describe(&self) {
        match self.metric_type {
            MetricType::Counter => metrics::describe_counter!(self.name, self.description),
            MetricType::Gauge => metrics::describe_gauge!(self.name, self.description),
            MetricType::Histogram => metrics::describe_histogram!(self.name, self.description),
        }
    }
}

pub fn describe_all(defs: &[MetricDef]) {
    for def in defs {
        def.describe();
    }
}

#[macro_export]
macro_rules! counter {
    ($def:expr $(, $label:literal => $value:expr)* $(,)?) => {
        metrics::counter!($def.name $(, $label => $value)*)
    };
}

#[macro_export]
macro_rules! gauge {
    ($def:expr $(, $label:literal => $value:expr)* $(,)?) => {
        metrics::gauge!($def.name $(, $label => $value)*)
    };
}

#[macro_export]
macro_rules! histogram {
    ($def:expr $(, $label:literal => $value:expr)* $(,)?) => {
        metrics::histogram!($def.name $(, $label => $value)*)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_COUNTER: MetricDef = MetricDef {
        name: "test.counter",
        metric_type: MetricType::Counter,
        description: "Counter used by the macro tests",
    };

    #[test]
    fn test_macros_without_recorder() {
        // Without an installed recorder the handles are no-ops.
        counter!(TEST_COUNTER).increment(1);
        counter!(TEST_COUNTER, "outcome" => "ok").increment(1);
        describe_all(&[TEST_COUNTER]);
        assert_eq!(TEST_COUNTER.metric_type.as_str(), "Counter");
    }
}
