//! ---
//! mnf_section: "03-persistence-logging"
//! mnf_subsection: "module"
//! mnf_type: "source"
//! mnf_scope: "code"
//! mnf_description: "Prometheus counters for provisioning stages and fleet dispatch."
//! mnf_version: "v0.1.0"
//! mnf_owner: "tbd"
//! ---
use std::sync::Arc;

use anyhow::{Context, Result};
use prometheus::{IntCounterVec, Opts, Registry, TextEncoder};

/// Shared registry type used across the workspace.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Counters recorded by instance controllers and the fleet dispatcher.
#[derive(Clone)]
pub struct FleetMetrics {
    registry: SharedRegistry,
    stage_total: IntCounterVec,
    dispatch_hosts_total: IntCounterVec,
    poll_attempts_total: IntCounterVec,
}

impl FleetMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let stage_total = IntCounterVec::new(
            Opts::new(
                "mnfleet_stage_total",
                "Provisioning stages completed, partitioned by stage and outcome",
            ),
            &["stage", "outcome"],
        )?;
        registry.register(Box::new(stage_total.clone()))?;

        let dispatch_hosts_total = IntCounterVec::new(
            Opts::new(
                "mnfleet_dispatch_hosts_total",
                "Per-host results of fleet dispatch operations",
            ),
            &["operation", "outcome"],
        )?;
        registry.register(Box::new(dispatch_hosts_total.clone()))?;

        let poll_attempts_total = IntCounterVec::new(
            Opts::new(
                "mnfleet_poll_attempts_total",
                "Readiness predicate evaluations, partitioned by wait kind",
            ),
            &["wait"],
        )?;
        registry.register(Box::new(poll_attempts_total.clone()))?;

        Ok(Self {
            registry,
            stage_total,
            dispatch_hosts_total,
            poll_attempts_total,
        })
    }

    pub fn record_stage(&self, stage: &str, success: bool) {
        self.stage_total
            .with_label_values(&[stage, outcome_label(success)])
            .inc();
    }

    pub fn record_dispatch(&self, operation: &str, success: bool) {
        self.dispatch_hosts_total
            .with_label_values(&[operation, outcome_label(success)])
            .inc();
    }

    pub fn record_poll_attempts(&self, wait: &str, attempts: u32) {
        self.poll_attempts_total
            .with_label_values(&[wait])
            .inc_by(u64::from(attempts));
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String> {
        TextEncoder::new()
            .encode_to_string(&self.registry.gather())
            .context("failed to encode metrics")
    }
}

fn outcome_label(success: bool) -> &'static str {
    if success {
        "success"
    } else {
        "failure"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_render_with_labels() {
        let metrics = FleetMetrics::new(new_registry()).unwrap();
        metrics.record_stage("create", true);
        metrics.record_stage("create", false);
        metrics.record_dispatch("run_command", true);
        metrics.record_poll_attempts("built", 4);

        let text = metrics.render().unwrap();
        assert!(text.contains(r#"mnfleet_stage_total{outcome="success",stage="create"} 1"#));
        assert!(text.contains(r#"mnfleet_stage_total{outcome="failure",stage="create"} 1"#));
        assert!(text.contains(r#"mnfleet_poll_attempts_total{wait="built"} 4"#));
    }

    #[test]
    fn double_registration_fails() {
        let registry = new_registry();
        FleetMetrics::new(registry.clone()).unwrap();
        assert!(FleetMetrics::new(registry).is_err());
    }
}
