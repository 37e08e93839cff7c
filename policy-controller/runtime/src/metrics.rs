use crate::provisioner::Report;
use prometheus_client::{metrics::counter::Counter, registry::Registry};

#[derive(Clone, Debug, Default)]
pub struct Metrics {
    evaluated: Counter,
    unmanaged: Counter,
    provisioned: Counter,
    failed: Counter,
    rules_installed: Counter,
    rules_failed: Counter,
}

// === impl Metrics ===

impl Metrics {
    pub fn register(reg: &mut Registry) -> Self {
        let metrics = Self::default();
        reg.register(
            "workloads_evaluated",
            "Total number of local workloads evaluated against network policies",
            metrics.evaluated.clone(),
        );
        reg.register(
            "workloads_unmanaged",
            "Total number of evaluated workloads to which no network policy applies",
            metrics.unmanaged.clone(),
        );
        reg.register(
            "workloads_provisioned",
            "Total number of workloads whose rules were provisioned",
            metrics.provisioned.clone(),
        );
        reg.register(
            "workloads_failed",
            "Total number of workloads whose provisioning was aborted",
            metrics.failed.clone(),
        );
        reg.register(
            "rules_installed",
            "Total number of packet-filter rules installed",
            metrics.rules_installed.clone(),
        );
        reg.register(
            "rules_failed",
            "Total number of packet-filter rules that could not be installed",
            metrics.rules_failed.clone(),
        );
        metrics
    }

    pub(crate) fn evaluated(&self) {
        self.evaluated.inc();
    }

    pub(crate) fn unmanaged(&self) {
        self.unmanaged.inc();
    }

    pub(crate) fn provisioned(&self, report: &Report) {
        self.provisioned.inc();
        self.rules_installed.inc_by(report.installed as u64);
        self.rules_failed.inc_by(report.failed as u64);
    }

    pub(crate) fn failed(&self) {
        self.failed.inc();
    }

    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> [u64; 6] {
        [
            self.evaluated.get(),
            self.unmanaged.get(),
            self.provisioned.get(),
            self.failed.get(),
            self.rules_installed.get(),
            self.rules_failed.get(),
        ]
    }
}
