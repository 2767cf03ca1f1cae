//! Operational counters recorded through the `metrics` facade.
//!
//! Nothing is exported unless a recorder is installed, either by the host
//! application or by [`install_exporter`] with the `prometheus` feature.

use metrics::increment_counter;
use tracing::trace;

/// Counters for the instance engine
pub struct LimsMetrics;

impl LimsMetrics {
    /// An EUID was handed out
    pub fn record_euid_allocated(prefix: &str) {
        trace!(prefix, "euid allocated");
        increment_counter!("lims_euid_allocations_total", "prefix" => prefix.to_string());
    }

    /// Allocation failed (unknown prefix, exhaustion, store error)
    pub fn record_allocation_failure(prefix: &str, error_code: &'static str) {
        increment_counter!(
            "lims_euid_allocation_failures_total",
            "prefix" => prefix.to_string(),
            "error_code" => error_code
        );
    }

    /// An instance was persisted
    pub fn record_instance_created(category: &str) {
        increment_counter!("lims_instances_created_total", "category" => category.to_string());
    }

    /// A new lineage edge was inserted
    pub fn record_link_created(relationship_type: &str) {
        increment_counter!(
            "lims_links_created_total",
            "relationship_type" => relationship_type.to_string()
        );
    }

    /// A link request was rejected
    pub fn record_link_rejected(error_code: &'static str) {
        increment_counter!("lims_link_rejections_total", "error_code" => error_code);
    }

    /// Workflow state cache lookup
    pub fn record_workflow_cache(hit: bool) {
        if hit {
            increment_counter!("lims_workflow_cache_hits_total");
        } else {
            increment_counter!("lims_workflow_cache_misses_total");
        }
    }
}

/// Install the Prometheus recorder
#[cfg(feature = "prometheus")]
pub fn install_exporter() -> anyhow::Result<()> {
    use anyhow::Context;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")?;
    Ok(())
}

/// Without the `prometheus` feature there is no exporter to install
#[cfg(not(feature = "prometheus"))]
pub fn install_exporter() -> anyhow::Result<()> {
    tracing::warn!("Metrics requested but the prometheus feature is disabled; counters are not exported");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_a_no_op() {
        LimsMetrics::record_euid_allocated("CON");
        LimsMetrics::record_allocation_failure("CON", "ERR_CORE_UNKNOWN_PREFIX");
        LimsMetrics::record_instance_created("container");
        LimsMetrics::record_link_created("derived_from");
        LimsMetrics::record_link_rejected("ERR_CORE_CYCLE_DETECTED");
        LimsMetrics::record_workflow_cache(true);
        LimsMetrics::record_workflow_cache(false);
    }
}
