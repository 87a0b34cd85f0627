//! Metrics definitions for the fallback store.

use shared::metrics_defs::{MetricDef, MetricType};

pub const WEBHOOK_REJECTED: MetricDef = MetricDef {
    name: "webhook.rejected",
    metric_type: MetricType::Counter,
    description: "Webhook requests rejected during validation, tagged by reason",
};

pub const WEBHOOK_STORED: MetricDef = MetricDef {
    name: "webhook.stored",
    metric_type: MetricType::Counter,
    description: "Supergraphs written to the fallback store by the webhook",
};

pub const WEBHOOK_SKIPPED: MetricDef = MetricDef {
    name: "webhook.skipped",
    metric_type: MetricType::Counter,
    description: "Valid webhook events that did not result in a write, tagged by reason",
};

pub const FALLBACK_READ_HIT: MetricDef = MetricDef {
    name: "fallback_read.hit",
    metric_type: MetricType::Counter,
    description: "Fallback reads that found a stored supergraph",
};

pub const FALLBACK_READ_MISS: MetricDef = MetricDef {
    name: "fallback_read.miss",
    metric_type: MetricType::Counter,
    description: "Fallback reads for a graph ref with no stored supergraph",
};

pub const ALL_METRICS: &[MetricDef] = &[
    WEBHOOK_REJECTED,
    WEBHOOK_STORED,
    WEBHOOK_SKIPPED,
    FALLBACK_READ_HIT,
    FALLBACK_READ_MISS,
];
