use dashconv::{
    batch::{self, BatchOutcome, DashboardEnvelope},
    config::ConverterConfig,
    dashboard::DashboardMeta,
    datasource::DatasourceRegistry,
    registry::{ConverterRegistry, INFLUXQL},
    report::ErrorCollector,
};
use serde_json::{json, Value};
use std::sync::Once;

static TRACING_INIT: Once = Once::new();

pub const DATASOURCES: &str = r#"{
    "InfluxUid": {"type": "influxdb", "name": "InfluxDatasource"},
    "FluxUid": {"type": "influxdb", "name": "FluxDatasource", "jsonData": {"version": "Flux"}},
    "PromUid": {"type": "prometheus", "name": "PrometheusDatasource"}
}"#;

/// Runs dashboards through the registered InfluxQL converter against a
/// fixed datasource registry.
pub struct ConversionHarness {
    config: ConverterConfig,
    datasources: DatasourceRegistry,
}

impl ConversionHarness {
    pub fn new() -> Self {
        Self::with_config(ConverterConfig::default())
    }

    pub fn with_config(config: ConverterConfig) -> Self {
        TRACING_INIT.call_once(|| {
            let _ = tracing_subscriber::fmt::try_init();
        });
        Self {
            config,
            datasources: DatasourceRegistry::from_json(DATASOURCES)
                .expect("fixture datasources should parse"),
        }
    }

    pub fn run(&self, dashboards: Vec<Value>) -> (BatchOutcome, ErrorCollector) {
        let converter = ConverterRegistry::with_defaults()
            .create(INFLUXQL, self.config.clone(), self.datasources.clone())
            .expect("influxql converter should be registered");
        let mut collector = ErrorCollector::with_links("https://grafana.example", "1");
        let envelopes = dashboards.into_iter().map(envelope).collect();
        let outcome = batch::run(converter.as_ref(), envelopes, &mut collector);
        (outcome, collector)
    }
}

pub fn envelope(dashboard: Value) -> DashboardEnvelope {
    DashboardEnvelope {
        dashboard,
        meta: DashboardMeta {
            folder_title: "Infrastructure".into(),
            updated_by: "grafana-admin".into(),
        },
    }
}

pub fn raw_target(ref_id: &str, query: &str) -> Value {
    json!({"refId": ref_id, "rawQuery": true, "query": query, "resultFormat": "time_series"})
}

/// Messages recorded at the given level, in order.
pub fn messages_at(collector: &ErrorCollector, level: &str) -> Vec<String> {
    collector
        .errors()
        .iter()
        .filter(|err| err.level.as_str() == level)
        .map(|err| err.message.clone())
        .collect()
}
