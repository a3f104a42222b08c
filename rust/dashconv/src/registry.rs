//! Registry of dashboard converters by source query language.

use crate::{
    config::ConverterConfig,
    dashboard::{ConvertedDashboard, DashboardConverter, DashboardMeta},
    datasource::DatasourceRegistry,
    error::Result,
    report::Reporter,
};
use serde_json::Value as Json;
use std::collections::BTreeMap;

pub const INFLUXQL: &str = "influxql";

/// Converts whole dashboards from one query language to PromQL.
pub trait Converter: Send + Sync {
    fn name(&self) -> &'static str;

    fn convert_dashboard(
        &self,
        dashboard: Json,
        meta: &DashboardMeta,
        reporter: &mut Reporter<'_>,
    ) -> Result<ConvertedDashboard>;
}

pub struct InfluxQlConverter {
    config: ConverterConfig,
    datasources: DatasourceRegistry,
}

impl InfluxQlConverter {
    pub fn new(config: ConverterConfig, datasources: DatasourceRegistry) -> Self {
        Self { config, datasources }
    }
}

impl Converter for InfluxQlConverter {
    fn name(&self) -> &'static str {
        INFLUXQL
    }

    fn convert_dashboard(
        &self,
        dashboard: Json,
        meta: &DashboardMeta,
        reporter: &mut Reporter<'_>,
    ) -> Result<ConvertedDashboard> {
        DashboardConverter::new(&self.config, &self.datasources).convert(dashboard, meta, reporter)
    }
}

fn influxql_converter(config: ConverterConfig, datasources: DatasourceRegistry) -> Box<dyn Converter> {
    Box::new(InfluxQlConverter::new(config, datasources))
}

pub type ConverterFactory = fn(ConverterConfig, DatasourceRegistry) -> Box<dyn Converter>;

pub struct ConverterRegistry {
    factories: BTreeMap<&'static str, ConverterFactory>,
}

impl ConverterRegistry {
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with every built-in converter.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(INFLUXQL, influxql_converter);
        registry
    }

    pub fn register(&mut self, key: &'static str, factory: ConverterFactory) {
        self.factories.insert(key, factory);
    }

    /// Lookup is case-insensitive.
    pub fn create(
        &self,
        key: &str,
        config: ConverterConfig,
        datasources: DatasourceRegistry,
    ) -> Option<Box<dyn Converter>> {
        let key = key.to_ascii_lowercase();
        self.factories
            .get(key.as_str())
            .map(|factory| factory(config, datasources))
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }
}

impl Default for ConverterRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::ErrorCollector;
    use serde_json::json;

    #[test]
    fn creates_registered_converters() {
        let registry = ConverterRegistry::default();
        assert_eq!(registry.names(), vec![INFLUXQL]);

        let converter = registry
            .create("InfluxQL", ConverterConfig::default(), DatasourceRegistry::default())
            .unwrap();
        assert_eq!(converter.name(), INFLUXQL);
        assert!(registry
            .create("flux", ConverterConfig::default(), DatasourceRegistry::default())
            .is_none());
    }

    #[test]
    fn converter_runs_dashboard_pipeline() {
        let converter = ConverterRegistry::with_defaults()
            .create(INFLUXQL, ConverterConfig::default(), DatasourceRegistry::default())
            .unwrap();
        let mut collector = ErrorCollector::new();
        let mut reporter = Reporter::new(&mut collector);
        let converted = converter
            .convert_dashboard(
                json!({
                    "uid": "d",
                    "title": "D",
                    "panels": [{"id": 1, "type": "graph", "targets": [
                        {"refId": "A", "rawQuery": true, "query": "SELECT max(\"v\") FROM \"m\""}
                    ]}]
                }),
                &DashboardMeta::default(),
                &mut reporter,
            )
            .unwrap();
        assert_eq!(converted.dashboard["panels"][0]["targets"][0]["expr"], "max(m_v)");
        assert!(converted.usage.contains("m_v"));
    }

    #[test]
    fn empty_registry_has_no_converters() {
        let registry = ConverterRegistry::new();
        assert!(registry.names().is_empty());
    }
}
