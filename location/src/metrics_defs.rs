//! Metrics definitions for the location resolver.

use shared::metrics_defs::{MetricDef, MetricType};

pub const RULE_RELOADS: MetricDef = MetricDef {
    name: "relay_rule.reloads",
    metric_type: MetricType::Counter,
    description: "Relay rule reload attempts. Tagged with result (ok, error).",
};

pub const RULE_LOCATIONS: MetricDef = MetricDef {
    name: "relay_rule.locations",
    metric_type: MetricType::Gauge,
    description: "Number of locations in the active relay rule snapshot",
};

pub const RULE_STALE: MetricDef = MetricDef {
    name: "relay_rule.stale",
    metric_type: MetricType::Gauge,
    description: "1 while the latest relay rule reload failed, 0 otherwise",
};

pub const ALL_METRICS: &[MetricDef] = &[RULE_RELOADS, RULE_LOCATIONS, RULE_STALE];
