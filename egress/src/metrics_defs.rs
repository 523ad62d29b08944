use shared::metrics_defs::{MetricDef, MetricType};

pub const PATH_SELECTED: MetricDef = MetricDef {
    name: "egress.path_selected",
    metric_type: MetricType::Counter,
    description: "Number of requests routed through an egress path",
};

pub const PATH_EXHAUSTED: MetricDef = MetricDef {
    name: "egress.exhausted",
    metric_type: MetricType::Counter,
    description: "Selections that fell back to direct because every path was cooling down",
};

pub const PATH_COOLDOWN: MetricDef = MetricDef {
    name: "egress.cooldown",
    metric_type: MetricType::Counter,
    description: "Cooldowns applied to egress paths. Tagged with class.",
};

pub const PATHS_AVAILABLE: MetricDef = MetricDef {
    name: "egress.available",
    metric_type: MetricType::Gauge,
    description: "Egress paths outside cooldown at the last keepalive pass",
};

pub const ALL_METRICS: &[MetricDef] = &[PATH_SELECTED, PATH_EXHAUSTED, PATH_COOLDOWN, PATHS_AVAILABLE];
