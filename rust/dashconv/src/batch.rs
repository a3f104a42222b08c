//! Runs a converter over many dashboards and aggregates the results.

use crate::{
    dashboard::DashboardMeta,
    error::Result,
    registry::Converter,
    report::{ErrorLevel, ErrorSink, Reporter},
    usage::MetricUsageIndex,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{error, info};

/// One dashboard as exported from Grafana, with its search metadata.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DashboardEnvelope {
    pub dashboard: Json,
    #[serde(default)]
    pub meta: DashboardMeta,
}

impl DashboardEnvelope {
    pub fn title(&self) -> &str {
        self.dashboard
            .get("title")
            .and_then(Json::as_str)
            .unwrap_or_default()
    }
}

/// Parses a JSON array of envelopes.
pub fn load_envelopes(body: &str) -> Result<Vec<DashboardEnvelope>> {
    Ok(serde_json::from_str(body)?)
}

#[derive(Debug, Default, Serialize)]
pub struct BatchReport {
    pub converted: usize,
    /// Titles of dashboards that could not be converted at all.
    pub invalid: Vec<String>,
    /// dashboard title -> PromQL metrics it now depends on
    pub unreplaced_metrics: BTreeMap<String, BTreeSet<String>>,
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub dashboards: Vec<DashboardEnvelope>,
    pub usage: MetricUsageIndex,
    pub report: BatchReport,
}

/// Converts `envelopes` in order. A dashboard-fatal error excludes that
/// dashboard from the output and lists it as invalid; the run continues.
pub fn run(
    converter: &dyn Converter,
    envelopes: Vec<DashboardEnvelope>,
    sink: &mut dyn ErrorSink,
) -> BatchOutcome {
    let total = envelopes.len();
    info!(converter = converter.name(), dashboards = total, "starting conversion run");

    let mut outcome = BatchOutcome::default();
    let mut reporter = Reporter::new(sink);
    for envelope in envelopes {
        let title = envelope.title().to_string();
        match converter.convert_dashboard(envelope.dashboard, &envelope.meta, &mut reporter) {
            Ok(converted) => {
                outcome.usage.merge(converted.usage);
                outcome.dashboards.push(DashboardEnvelope {
                    dashboard: converted.dashboard,
                    meta: envelope.meta,
                });
            }
            Err(err) => {
                error!(dashboard = %title, error = %err, "dashboard conversion failed");
                reporter.add_error(
                    "Error converting dashboard - skipping",
                    ErrorLevel::Error,
                    err.to_string(),
                );
                outcome.report.invalid.push(title);
            }
        }
    }

    outcome.report.converted = outcome.dashboards.len();
    outcome.report.unreplaced_metrics = outcome.usage.metrics_by_dashboard();
    info!(
        converted = outcome.report.converted,
        invalid = outcome.report.invalid.len(),
        metrics = outcome.usage.len(),
        "conversion run finished"
    );
    outcome
}
