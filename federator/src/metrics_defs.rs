use shared::metrics_defs::{MetricDef, MetricType};

pub const REQUEST_DURATION: MetricDef = MetricDef {
    name: "request.duration",
    metric_type: MetricType::Histogram,
    description: "Client request duration in seconds",
};

pub const REQUESTS_INFLIGHT: MetricDef = MetricDef {
    name: "requests.inflight",
    metric_type: MetricType::Gauge,
    description: "Number of client requests currently being processed",
};

pub const CACHE_HIT: MetricDef = MetricDef {
    name: "cache.hit",
    metric_type: MetricType::Counter,
    description: "Federation requests answered from the response cache",
};

pub const CACHE_MISS: MetricDef = MetricDef {
    name: "cache.miss",
    metric_type: MetricType::Counter,
    description: "Federation requests that missed the response cache",
};

pub const ROUTES_RESOLVED: MetricDef = MetricDef {
    name: "routing.routes",
    metric_type: MetricType::Histogram,
    description: "Number of routes resolved per federation request",
};

pub const ENDPOINT_ERRORS: MetricDef = MetricDef {
    name: "endpoint.errors",
    metric_type: MetricType::Counter,
    description: "Endpoint sub-requests that failed permanently",
};

pub const ENDPOINT_SUPPRESSED: MetricDef = MetricDef {
    name: "endpoint.suppressed",
    metric_type: MetricType::Counter,
    description: "Routes dropped because the endpoint exceeded its retry budget",
};

pub const EPOCH_SPLITS: MetricDef = MetricDef {
    name: "epoch.splits",
    metric_type: MetricType::Counter,
    description: "Stream epochs split after a payload-too-large rejection",
};

pub const BUFFER_SPILLS: MetricDef = MetricDef {
    name: "buffer.spills",
    metric_type: MetricType::Counter,
    description: "Buffer slots that rolled over from memory to disk",
};

pub const ALL_METRICS: &[MetricDef] = &[
    REQUEST_DURATION,
    REQUESTS_INFLIGHT,
    CACHE_HIT,
    CACHE_MISS,
    ROUTES_RESOLVED,
    ENDPOINT_ERRORS,
    ENDPOINT_SUPPRESSED,
    EPOCH_SPLITS,
    BUFFER_SPILLS,
];
