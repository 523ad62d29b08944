use shared::metrics_defs::{MetricDef, MetricType};

pub const CONFIG_RELOADED: MetricDef = MetricDef {
    name: "config.reloaded",
    metric_type: MetricType::Counter,
    description: "Shared configuration reloads applied to this process",
};

pub const CONFIG_REFRESH_FAILED: MetricDef = MetricDef {
    name: "config.refresh_failed",
    metric_type: MetricType::Counter,
    description: "Shared configuration reads that failed",
};

pub const LOOP_ITERATION: MetricDef = MetricDef {
    name: "scheduler.iteration",
    metric_type: MetricType::Counter,
    description: "Background loop iterations. Tagged with loop, result.",
};

pub const LOOPS_RUNNING: MetricDef = MetricDef {
    name: "scheduler.running",
    metric_type: MetricType::Gauge,
    description: "Background loops currently running",
};

pub const OUTCOME_RECORDED: MetricDef = MetricDef {
    name: "outcome.recorded",
    metric_type: MetricType::Counter,
    description: "Upstream outcomes fed back into credential health. Tagged with class.",
};

pub const ALL_METRICS: &[MetricDef] = &[
    CONFIG_RELOADED,
    CONFIG_REFRESH_FAILED,
    LOOP_ITERATION,
    LOOPS_RUNNING,
    OUTCOME_RECORDED,
];
