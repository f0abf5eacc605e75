use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

#[derive(Clone, Copy)]
pub(crate) struct Metric {
    pub name: &'static str,
    description: &'static str,
}

pub(crate) const COUNTERS: [Metric; 5] = [
    REBUILDS_TOTAL,
    REBUILD_FAILURES_TOTAL,
    RULES_INSTALLED_TOTAL,
    RULES_REMOVED_TOTAL,
    DISPATCH_FAILURES_TOTAL,
];
pub(crate) const GAUGES: [Metric; 3] = [
    ASSIGNMENT_LEAVES,
    CONNECTED_SWITCHES,
    LAST_REBUILD_TRANSITIONS,
];
pub(crate) const HISTOGRAMS: [Metric; 2] =
    [REBUILD_DURATION_SECONDS, DISPATCH_BATCH_DURATION_SECONDS];

// REBUILD Metrics --------------------------

pub(crate) const REBUILDS_TOTAL: Metric = Metric {
    name: "estuary_rebuilds_total",
    description: "Total number of assignment tree rebuilds committed",
};

pub(crate) const REBUILD_FAILURES_TOTAL: Metric = Metric {
    name: "estuary_rebuild_failures_total",
    description: "Total number of rebuilds abandoned with the previous tree left active",
};

pub(crate) const ASSIGNMENT_LEAVES: Metric = Metric {
    name: "estuary_assignment_leaves",
    description: "Number of leaves in the committed assignment tree",
};

pub(crate) const LAST_REBUILD_TRANSITIONS: Metric = Metric {
    name: "estuary_last_rebuild_transitions",
    description: "Number of transitions the most recent rebuild rolled out",
};

pub(crate) const REBUILD_DURATION_SECONDS: Metric = Metric {
    name: "estuary_rebuild_duration_seconds",
    description: "End-to-end duration of a rebuild including rule rollout",
};

// DISPATCH Metrics --------------------------

pub(crate) const RULES_INSTALLED_TOTAL: Metric = Metric {
    name: "estuary_rules_installed_total",
    description: "Total number of forwarding rules pushed to switches",
};

pub(crate) const RULES_REMOVED_TOTAL: Metric = Metric {
    name: "estuary_rules_removed_total",
    description: "Total number of stale forwarding rules removed from switches",
};

pub(crate) const DISPATCH_FAILURES_TOTAL: Metric = Metric {
    name: "estuary_dispatch_failures_total",
    description: "Total number of per-switch dispatch units that failed",
};

pub(crate) const CONNECTED_SWITCHES: Metric = Metric {
    name: "estuary_connected_switches",
    description: "Number of switches currently registered with the dispatcher",
};

pub(crate) const DISPATCH_BATCH_DURATION_SECONDS: Metric = Metric {
    name: "estuary_dispatch_batch_duration_seconds",
    description: "Duration of one concurrent dispatch batch across all switches",
};

pub(crate) fn init_metrics(prom_addr: Option<std::net::SocketAddr>) {
    info!("initializing metrics exporter");

    if let Some(addr) = prom_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .expect("failed to install Prometheus recorder");
    }

    for metric in COUNTERS {
        register_counter(metric)
    }

    for metric in GAUGES {
        register_gauge(metric)
    }

    for metric in HISTOGRAMS {
        register_histogram(metric)
    }
}

/// Registers a counter with the given name.
fn register_counter(metric: Metric) {
    metrics::describe_counter!(metric.name, metric.description);
    let _counter = metrics::counter!(metric.name);
}

/// Registers a gauge with the given name.
fn register_gauge(metric: Metric) {
    metrics::describe_gauge!(metric.name, metric.description);
    let _gauge = metrics::gauge!(metric.name);
}

/// Registers a histogram with the given name.
fn register_histogram(metric: Metric) {
    metrics::describe_histogram!(metric.name, metric.description);
    let _histogram = metrics::histogram!(metric.name);
}
