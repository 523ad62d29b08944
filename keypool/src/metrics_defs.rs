//! Metrics definitions for the credential pool.

use shared::metrics_defs::{MetricDef, MetricType};

pub const CREDENTIAL_SELECTED: MetricDef = MetricDef {
    name: "credential.selected",
    metric_type: MetricType::Counter,
    description: "Number of requests that were assigned a credential",
};

pub const CREDENTIAL_UNAVAILABLE: MetricDef = MetricDef {
    name: "credential.unavailable",
    metric_type: MetricType::Counter,
    description: "Number of selections that found no eligible credential",
};

pub const CREDENTIAL_TRANSITION: MetricDef = MetricDef {
    name: "credential.transition",
    metric_type: MetricType::Counter,
    description: "Credential status changes. Tagged with status.",
};

pub const ADMISSION_REJECTED: MetricDef = MetricDef {
    name: "admission.rejected",
    metric_type: MetricType::Counter,
    description: "Requests rejected before credential selection. Tagged with reason.",
};

pub const HEALTH_CHECK_DURATION: MetricDef = MetricDef {
    name: "health_check.duration",
    metric_type: MetricType::Histogram,
    description: "Time to probe every credential in seconds",
};

pub const HEALTH_CHECK_PROBED: MetricDef = MetricDef {
    name: "health_check.probed",
    metric_type: MetricType::Counter,
    description: "Number of credentials probed",
};

pub const ALL_METRICS: &[MetricDef] = &[
    CREDENTIAL_SELECTED,
    CREDENTIAL_UNAVAILABLE,
    CREDENTIAL_TRANSITION,
    ADMISSION_REJECTED,
    HEALTH_CHECK_DURATION,
    HEALTH_CHECK_PROBED,
];
