//! Whole-dashboard conversion.
//!
//! Panels are converted before templating so that template variables can be
//! pointed at metrics the panels turned out to use. A templating failure
//! aborts the dashboard with [`ConvertError::InvalidDashboard`]; everything
//! a panel does wrong stays inside that panel.

use crate::{
    config::ConverterConfig,
    datasource::DatasourceRegistry,
    error::{ConvertError, Result},
    panel::{PanelConverter, PanelScope},
    report::{DashboardRef, Reporter},
    templating::{apply_backfill, TemplatingTranslator},
    usage::MetricUsageIndex,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionState {
    NotStarted,
    PanelsConverted,
    TemplatingConverted,
    Done,
}

impl ConversionState {
    fn next(self) -> Self {
        match self {
            ConversionState::NotStarted => ConversionState::PanelsConverted,
            ConversionState::PanelsConverted => ConversionState::TemplatingConverted,
            ConversionState::TemplatingConverted | ConversionState::Done => ConversionState::Done,
        }
    }
}

/// Folder and last editor of a dashboard, as reported by the Grafana API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DashboardMeta {
    #[serde(default, rename = "folderTitle")]
    pub folder_title: String,
    #[serde(default, rename = "updatedBy")]
    pub updated_by: String,
}

#[derive(Debug, Clone)]
pub struct ConvertedDashboard {
    pub dashboard: Json,
    /// Metrics referenced by this dashboard only.
    pub usage: MetricUsageIndex,
}

pub struct DashboardConverter<'a> {
    panels: PanelConverter<'a>,
    templating: TemplatingTranslator<'a>,
}

impl<'a> DashboardConverter<'a> {
    pub fn new(config: &'a ConverterConfig, registry: &'a DatasourceRegistry) -> Self {
        Self {
            panels: PanelConverter::new(config, registry),
            templating: TemplatingTranslator::new(config),
        }
    }

    pub fn convert(
        &self,
        mut dashboard: Json,
        meta: &DashboardMeta,
        reporter: &mut Reporter<'_>,
    ) -> Result<ConvertedDashboard> {
        let title = string_field(&dashboard, "title");
        reporter.enter_dashboard(DashboardRef {
            uid: string_field(&dashboard, "uid"),
            title: title.clone(),
            folder: meta.folder_title.clone(),
            updater: meta.updated_by.clone(),
        });
        if !dashboard.is_object() {
            return Err(ConvertError::InvalidDashboard {
                title,
                source: Box::new(ConvertError::MissingRequiredField("dashboard object".into())),
            });
        }
        info!(dashboard = %title, "started dashboard conversion");

        let mut state = ConversionState::NotStarted;
        let mut usage = MetricUsageIndex::new();

        let templating = dashboard.get("templating").cloned().unwrap_or(Json::Null);
        let scope = PanelScope {
            dashboard: &title,
            templating: &templating,
        };
        if let Some(panels) = dashboard.get_mut("panels").and_then(Json::as_array_mut) {
            self.panels.convert_panels(panels, &scope, &mut usage, reporter);
        }
        // Pre-5.0 dashboards keep panels under rows.
        if let Some(rows) = dashboard.get_mut("rows").and_then(Json::as_array_mut) {
            for row in rows {
                if let Some(panels) = row.get_mut("panels").and_then(Json::as_array_mut) {
                    self.panels.convert_panels(panels, &scope, &mut usage, reporter);
                }
            }
        }
        state = advance(state, &title);

        let pending = match dashboard.get_mut("templating") {
            Some(templating) if !templating.is_null() => self
                .templating
                .convert(templating, reporter)
                .map_err(|source| ConvertError::InvalidDashboard {
                    title: title.clone(),
                    source: Box::new(source),
                })?,
            _ => Vec::new(),
        };
        state = advance(state, &title);

        if let Some(templating) = dashboard.get_mut("templating") {
            apply_backfill(templating, &pending, &mut usage, &title);
        }
        state = advance(state, &title);
        debug_assert_eq!(state, ConversionState::Done);

        info!(dashboard = %title, metrics = usage.len(), "finished dashboard conversion");
        Ok(ConvertedDashboard { dashboard, usage })
    }
}

fn advance(state: ConversionState, title: &str) -> ConversionState {
    let next = state.next();
    debug!(dashboard = %title, from = ?state, to = ?next, "dashboard conversion state");
    next
}

fn string_field(dashboard: &Json, key: &str) -> String {
    dashboard
        .get(key)
        .and_then(Json::as_str)
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{report::ErrorCollector, usage::UsageEntry};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn convert(dashboard: Json) -> (Result<ConvertedDashboard>, ErrorCollector) {
        let config = ConverterConfig::default();
        let registry = DatasourceRegistry::default();
        let mut collector = ErrorCollector::new();
        let result = {
            let mut reporter = Reporter::new(&mut collector);
            DashboardConverter::new(&config, &registry).convert(
                dashboard,
                &DashboardMeta {
                    folder_title: "Infra".into(),
                    updated_by: "admin".into(),
                },
                &mut reporter,
            )
        };
        (result, collector)
    }

    fn raw_target(ref_id: &str, query: &str) -> Json {
        json!({"refId": ref_id, "rawQuery": true, "query": query})
    }

    #[test]
    fn states_advance_in_fixed_order() {
        let mut state = ConversionState::NotStarted;
        let mut seen = vec![state];
        for _ in 0..3 {
            state = state.next();
            seen.push(state);
        }
        assert_eq!(
            seen,
            vec![
                ConversionState::NotStarted,
                ConversionState::PanelsConverted,
                ConversionState::TemplatingConverted,
                ConversionState::Done,
            ]
        );
        assert_eq!(ConversionState::Done.next(), ConversionState::Done);
    }

    #[test]
    fn template_backfill_links_all_instantiations() {
        let dashboard = json!({
            "uid": "net",
            "title": "Network",
            "panels": [{
                "id": 1,
                "title": "Traffic",
                "type": "graph",
                "targets": [
                    raw_target("A", r#"SELECT non_negative_derivative(mean("bytes_recv"), 1s) FROM "net" WHERE "host" =~ /^$host$/ AND $timeFilter GROUP BY time($__interval)"#),
                    raw_target("B", r#"SELECT non_negative_derivative(mean("bytes_sent"), 1s) FROM "net" WHERE "host" =~ /^$host$/ AND $timeFilter GROUP BY time($__interval)"#)
                ]
            }],
            "templating": {"list": [
                {"name": "host", "type": "query", "query": "SHOW TAG VALUES FROM \"net\" WITH KEY = \"host\""}
            ]}
        });
        let (result, _) = convert(dashboard);
        let converted = result.unwrap();

        let query = "label_values(net_bytes_recv,host)";
        assert_eq!(converted.dashboard["templating"]["list"][0]["query"], query);
        let template = UsageEntry::Template {
            name: "host".into(),
            query: query.into(),
        };
        assert!(converted.usage.entries("net_bytes_recv", "Network").contains(&template));
        assert!(converted.usage.entries("net_bytes_sent", "Network").contains(&template));
    }

    #[test]
    fn templating_failure_is_fatal() {
        let dashboard = json!({
            "uid": "x",
            "title": "Broken",
            "panels": [],
            "templating": {"list": [{"name": "f", "type": "adhoc"}]}
        });
        let (result, _) = convert(dashboard);
        let err = result.unwrap_err();
        assert!(err.is_dashboard_fatal());
        assert!(matches!(err, ConvertError::InvalidDashboard { ref title, .. } if title == "Broken"));
    }

    #[test]
    fn panel_failures_are_contained() {
        let dashboard = json!({
            "uid": "mixed",
            "title": "Mixed",
            "panels": [
                {"id": 1, "type": "graph", "targets": [raw_target("A", r#"SELECT mean("a") / mean("b") FROM "m""#)]},
                {"id": 2, "type": "graph", "targets": [raw_target("A", r#"SELECT max("v") FROM "m""#)]}
            ]
        });
        let (result, collector) = convert(dashboard);
        let converted = result.unwrap();
        assert!(converted.dashboard["panels"][0].get("targets").is_none());
        assert_eq!(converted.dashboard["panels"][1]["targets"][0]["expr"], "max(m_v)");
        assert_eq!(collector.errors().len(), 1);
        let attributed = collector.errors()[0].dashboard.as_ref().map(|d| d.folder.as_str());
        assert_eq!(attributed, Some("Infra"));
    }

    #[test]
    fn legacy_rows_are_converted() {
        let dashboard = json!({
            "uid": "old",
            "title": "Old",
            "rows": [{"panels": [
                {"id": 1, "type": "graph", "targets": [raw_target("A", r#"SELECT max("v") FROM "m""#)]}
            ]}]
        });
        let (result, _) = convert(dashboard);
        let converted = result.unwrap();
        assert_eq!(converted.dashboard["rows"][0]["panels"][0]["targets"][0]["expr"], "max(m_v)");
        assert_eq!(converted.usage.metrics().collect::<Vec<_>>(), vec!["m_v"]);
    }
}
