//! Metrics definitions for the supergraph provider.

use shared::metrics_defs::{MetricDef, MetricType};

pub const UPLINK_FETCH_DURATION: MetricDef = MetricDef {
    name: "uplink.fetch.duration",
    metric_type: MetricType::Histogram,
    description: "Time to complete one uplink fetch cycle, including retries, in seconds",
};

pub const UPLINK_FETCH_FAILURE: MetricDef = MetricDef {
    name: "uplink.fetch.failure",
    metric_type: MetricType::Counter,
    description: "Failed uplink requests, tagged by endpoint",
};

pub const FALLBACK_USED: MetricDef = MetricDef {
    name: "provider.fallback_used",
    metric_type: MetricType::Counter,
    description: "Startups that served the fallback supergraph because uplink was unavailable",
};

pub const POLL_FAILURE: MetricDef = MetricDef {
    name: "provider.poll.failure",
    metric_type: MetricType::Counter,
    description: "Background polls that failed, tagged by reason",
};

pub const SUPERGRAPH_UPDATED: MetricDef = MetricDef {
    name: "provider.supergraph.updated",
    metric_type: MetricType::Counter,
    description: "Supergraph updates delivered to the host",
};

pub const ALL_METRICS: &[MetricDef] = &[
    UPLINK_FETCH_DURATION,
    UPLINK_FETCH_FAILURE,
    FALLBACK_USED,
    POLL_FAILURE,
    SUPERGRAPH_UPDATED,
];
