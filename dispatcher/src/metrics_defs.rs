use shared::metrics_defs::{MetricDef, MetricType};

pub const REQUEST_DURATION: MetricDef = MetricDef {
    name: "dispatcher.request.duration",
    metric_type: MetricType::Histogram,
    description: "Time to produce the response head, in seconds. Tagged with mode and status.",
};

pub const REQUESTS_INFLIGHT: MetricDef = MetricDef {
    name: "dispatcher.requests.inflight",
    metric_type: MetricType::Gauge,
    description: "Number of requests currently being processed",
};

pub const RELAY_ATTEMPTS: MetricDef = MetricDef {
    name: "dispatcher.relay.attempts",
    metric_type: MetricType::Counter,
    description: "Requests sent to a backend server. Tagged with result (ok or an error kind).",
};

pub const RELAY_FAILOVERS: MetricDef = MetricDef {
    name: "dispatcher.relay.failovers",
    metric_type: MetricType::Counter,
    description: "Attempts abandoned in favour of the next replica. Tagged with the error kind.",
};

pub const MERGED_REQUESTS: MetricDef = MetricDef {
    name: "dispatcher.merged.requests",
    metric_type: MetricType::Counter,
    description: "Requests handled in merged locations. Tagged with kind (auth, listing, object, copy).",
};

pub const ALL_METRICS: &[MetricDef] = &[
    REQUEST_DURATION,
    REQUESTS_INFLIGHT,
    RELAY_ATTEMPTS,
    RELAY_FAILOVERS,
    MERGED_REQUESTS,
];
