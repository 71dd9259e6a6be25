//! Prometheus metrics exposition
//!
//! The library crates emit through the `metrics` facade:
//!
//! - `harvest_fetch_total` (counter): label `outcome`
//! - `harvest_quota_units_total`, `harvest_key_rotations_total` (counters)
//! - `harvest_batches_total` (counter): label `result`
//! - `harvest_batch_duration_seconds` (histogram)
//! - `upload_commits_total` (counter): label `kind`
//! - `upload_files_total` (counter), `upload_pending_batches` (gauge)
//!
//! This module only installs the recorder those calls land in.

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

const BATCH_DURATION: &str = "harvest_batch_duration_seconds";

/// Batch wall-clock time, from a fast cached batch to a slow fully enriched one.
const BATCH_DURATION_BUCKETS: &[f64] = &[0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(BATCH_DURATION.to_string()),
            BATCH_DURATION_BUCKETS,
        )
        .expect("failed to set histogram buckets")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// `harvest_batch_duration_seconds` gets explicit buckets so it renders as a
/// histogram with `_bucket` lines rather than the default summary.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusRecorder;

    /// Isolated recorder/handle pair; only one global recorder can exist per process.
    fn isolated_recorder() -> (PrometheusRecorder, PrometheusHandle) {
        let recorder = builder().build_recorder();
        let handle = recorder.handle();
        (recorder, handle)
    }

    #[test]
    fn batch_duration_renders_as_histogram() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        metrics::histogram!(BATCH_DURATION).record(3.2);
        metrics::histogram!(BATCH_DURATION).record(45.0);

        let output = handle.render();
        assert!(
            output.contains("harvest_batch_duration_seconds_bucket"),
            "histogram must render _bucket lines, got:\n{output}"
        );
    }

    #[test]
    fn labelled_counters_render() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        metrics::counter!("harvest_fetch_total", "outcome" => "fetched").increment(2);
        metrics::counter!("upload_commits_total", "kind" => "bulk").increment(1);
        metrics::gauge!("upload_pending_batches").set(7.0);

        let output = handle.render();
        assert!(output.contains("harvest_fetch_total{outcome=\"fetched\"}"), "got:\n{output}");
        assert!(output.contains("upload_commits_total{kind=\"bulk\"}"), "got:\n{output}");
        assert!(output.contains("upload_pending_batches"), "got:\n{output}");
    }
}
