//! Decides whether a panel target queries an InfluxQL datasource.

use crate::{
    error::Result,
    report::{ErrorLevel, Reporter},
};
use serde::Deserialize;
use serde_json::Value as Json;
use std::collections::BTreeMap;

pub const SOURCE_TYPE: &str = "influxdb";
const FLUX_VERSION: &str = "Flux";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatasourceInfo {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, rename = "jsonData")]
    pub json_data: DatasourceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatasourceSettings {
    #[serde(default)]
    pub version: Option<String>,
}

impl DatasourceInfo {
    pub fn is_flux(&self) -> bool {
        self.json_data.version.as_deref() == Some(FLUX_VERSION)
    }

    fn is_influxql(&self) -> bool {
        self.kind == SOURCE_TYPE && !self.is_flux()
    }
}

/// Datasources of the Grafana instance, keyed by uid.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct DatasourceRegistry {
    by_uid: BTreeMap<String, DatasourceInfo>,
}

impl DatasourceRegistry {
    pub fn from_json(body: &str) -> Result<Self> {
        Ok(serde_json::from_str(body)?)
    }

    pub fn insert(&mut self, uid: impl Into<String>, info: DatasourceInfo) {
        self.by_uid.insert(uid.into(), info);
    }

    pub fn get(&self, uid: &str) -> Option<&DatasourceInfo> {
        self.by_uid.get(uid)
    }

    pub fn by_name(&self, name: &str) -> Option<&DatasourceInfo> {
        self.by_uid.values().find(|info| info.name == name)
    }

    pub fn len(&self) -> usize {
        self.by_uid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_uid.is_empty()
    }
}

/// Uid of a target or panel datasource reference with variable syntax
/// (`$`, `{`, `}`) removed. Accepts both `{"uid": ..}` objects and bare
/// strings.
pub fn normalize_uid(datasource: &Json) -> String {
    let raw = match datasource {
        Json::String(uid) => uid.as_str(),
        Json::Object(map) => match map.get("uid").and_then(Json::as_str) {
            Some(uid) => uid,
            None => return String::new(),
        },
        _ => return String::new(),
    };
    raw.replace(['$', '{', '}'], "")
}

pub struct DatasourceClassifier<'a> {
    registry: &'a DatasourceRegistry,
}

impl<'a> DatasourceClassifier<'a> {
    pub fn new(registry: &'a DatasourceRegistry) -> Self {
        Self { registry }
    }

    /// Falls back to the panel datasource once when the target's own
    /// datasource is inconclusive.
    pub fn is_source_target(
        &self,
        target: &Json,
        templating: &Json,
        panel_datasource: Option<&Json>,
        reporter: &mut Reporter<'_>,
    ) -> bool {
        let ds_type = target.get("dsType").and_then(Json::as_str);
        if self.matches(ds_type, target.get("datasource"), templating, reporter) {
            return true;
        }
        match panel_datasource {
            Some(datasource) if !datasource.is_null() => {
                self.matches(None, Some(datasource), templating, reporter)
            }
            _ => false,
        }
    }

    fn matches(
        &self,
        ds_type: Option<&str>,
        datasource: Option<&Json>,
        templating: &Json,
        reporter: &mut Reporter<'_>,
    ) -> bool {
        let declared = datasource
            .and_then(|ds| ds.get("type"))
            .and_then(Json::as_str);
        if ds_type == Some(SOURCE_TYPE) || declared == Some(SOURCE_TYPE) {
            return true;
        }

        // Registry lookups exclude Flux, which also reports type "influxdb".
        let uid = datasource.map(normalize_uid).unwrap_or_default();
        let known = self.registry.get(&uid).or_else(|| self.registry.by_name(&uid));
        if known.is_some_and(DatasourceInfo::is_flux) {
            return false;
        }

        self.matches_uid(&uid, declared, reporter)
            || templating_declares_source(&uid, templating)
            || datasource
                .and_then(Json::as_str)
                .is_some_and(|name| self.matches_name(name))
            || self.matches_name(&uid)
    }

    fn matches_uid(&self, uid: &str, declared: Option<&str>, reporter: &mut Reporter<'_>) -> bool {
        let Some(info) = self.registry.get(uid) else {
            return false;
        };
        if info.kind != SOURCE_TYPE {
            return false;
        }
        if declared.is_some_and(|kind| kind != info.kind) {
            reporter.add_error(
                "Panel Datasource Type mismatches the Grafana DS type - wrong panel, won't import",
                ErrorLevel::Warn,
                format!("uid={uid}"),
            );
            return false;
        }
        info.is_influxql()
    }

    fn matches_name(&self, name: &str) -> bool {
        self.registry
            .by_name(name)
            .is_some_and(DatasourceInfo::is_influxql)
    }
}

/// A `$ds` reference resolves through a datasource template variable whose
/// query selects the InfluxDB plugin.
fn templating_declares_source(uid: &str, templating: &Json) -> bool {
    if uid.is_empty() {
        return false;
    }
    templating
        .get("list")
        .and_then(Json::as_array)
        .is_some_and(|list| {
            list.iter().any(|item| {
                item.get("name").and_then(Json::as_str) == Some(uid)
                    && item.get("type").and_then(Json::as_str) == Some("datasource")
                    && item.get("query").and_then(Json::as_str) == Some(SOURCE_TYPE)
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::ErrorCollector;
    use serde_json::json;

    fn registry() -> DatasourceRegistry {
        DatasourceRegistry::from_json(
            r#"{
                "InfluxUid": {"type": "influxdb", "name": "InfluxDatasource"},
                "FluxUid": {"type": "influxdb", "name": "FluxDatasource", "jsonData": {"version": "Flux"}},
                "OtherUid": {"type": "prometheus", "name": "PrometheusDatasource"}
            }"#,
        )
        .unwrap()
    }

    fn templating() -> Json {
        json!({"list": [{"name": "InfluxDS", "query": "influxdb", "type": "datasource"}]})
    }

    fn classify(target: Json, panel_datasource: Option<Json>) -> (bool, ErrorCollector) {
        let registry = registry();
        let classifier = DatasourceClassifier::new(&registry);
        let mut collector = ErrorCollector::new();
        let result = {
            let mut reporter = Reporter::new(&mut collector);
            classifier.is_source_target(
                &target,
                &templating(),
                panel_datasource.as_ref(),
                &mut reporter,
            )
        };
        (result, collector)
    }

    #[test]
    fn declared_type_matches() {
        assert!(classify(json!({"dsType": "influxdb", "query": "x"}), None).0);
        assert!(classify(json!({"datasource": {"type": "influxdb", "uid": "$Anything"}}), None).0);
    }

    #[test]
    fn uid_and_name_lookups() {
        assert!(classify(json!({"datasource": {"uid": "InfluxUid"}}), None).0);
        assert!(classify(json!({"datasource": "InfluxUid"}), None).0);
        assert!(classify(json!({"datasource": "InfluxDatasource"}), None).0);
        assert!(classify(json!({"datasource": {"uid": "${InfluxUid}"}}), None).0);
        assert!(!classify(json!({"datasource": {"uid": "OtherUid"}}), None).0);
    }

    #[test]
    fn templating_variable_matches() {
        assert!(classify(json!({"datasource": {"uid": "$InfluxDS"}}), None).0);
        assert!(!classify(json!({"datasource": {"uid": "$PromDS"}}), None).0);
    }

    #[test]
    fn flux_registry_entries_are_not_sources() {
        assert!(!classify(json!({"datasource": {"uid": "FluxUid"}}), None).0);
        assert!(!classify(json!({"datasource": "FluxDatasource"}), None).0);
        assert!(!classify(json!({"refId": "A"}), Some(json!({"uid": "FluxUid"}))).0);
    }

    #[test]
    fn declared_type_wins_over_flux_registry_entry() {
        assert!(classify(json!({"datasource": {"uid": "FluxUid", "type": "influxdb"}}), None).0);
        assert!(classify(json!({"dsType": "influxdb", "datasource": {"uid": "FluxUid"}}), None).0);
        assert!(classify(json!({"dsType": "influxdb", "datasource": "FluxDatasource"}), None).0);
    }

    #[test]
    fn declared_type_mismatch_warns() {
        let (result, collector) =
            classify(json!({"datasource": {"uid": "InfluxUid", "type": "prometheus"}}), None);
        assert!(!result);
        assert_eq!(collector.errors().len(), 1);
        assert_eq!(collector.errors()[0].level, ErrorLevel::Warn);
    }

    #[test]
    fn panel_datasource_is_consulted_once() {
        assert!(classify(json!({"refId": "A"}), Some(json!({"uid": "InfluxUid"}))).0);
        assert!(classify(json!({"refId": "A"}), Some(json!("InfluxDatasource"))).0);
        assert!(!classify(json!({"refId": "A"}), Some(json!({"uid": "OtherUid"}))).0);
        assert!(!classify(json!({"refId": "A"}), None).0);
    }

    #[test]
    fn normalizes_uids() {
        assert_eq!(normalize_uid(&json!({"uid": "${ds}"})), "ds");
        assert_eq!(normalize_uid(&json!("$ds")), "ds");
        assert_eq!(normalize_uid(&json!({"type": "influxdb"})), "");
        assert_eq!(normalize_uid(&json!(null)), "");
    }
}
