//! Template variable conversion.
//!
//! InfluxQL tag discovery queries become `label_values(...)` calls. The
//! measurement named in a discovery query is rarely a metric name on its
//! own, so variables that reference one are remembered and pointed at a
//! concrete metric once the panels have been converted.

use crate::{
    config::ConverterConfig,
    error::{ConvertError, Result},
    influxql::{parse, QueryShape},
    promql::sanitize_metric,
    report::{ErrorLevel, Reporter},
    usage::{MetricUsageIndex, UsageEntry},
};
use serde_json::{json, Value as Json};
use tracing::debug;

/// Numerical ascending.
const NUMERIC_SORT: u64 = 3;

/// A converted variable that still names a measurement token instead of a
/// metric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingBackfill {
    pub name: String,
    /// Position in the converted templating list.
    pub position: usize,
    pub token: String,
    pub key: String,
}

enum QueryVariable {
    Dropped,
    Converted,
    NeedsBackfill { token: String, key: String },
}

pub struct TemplatingTranslator<'a> {
    config: &'a ConverterConfig,
}

impl<'a> TemplatingTranslator<'a> {
    pub fn new(config: &'a ConverterConfig) -> Self {
        Self { config }
    }

    /// Converts `templating.list` in place. Any error aborts the dashboard.
    pub fn convert(&self, templating: &mut Json, reporter: &mut Reporter<'_>) -> Result<Vec<PendingBackfill>> {
        let Some(list) = templating.get_mut("list").and_then(Json::as_array_mut) else {
            return Ok(Vec::new());
        };

        let mut kept = Vec::with_capacity(list.len());
        let mut pending = Vec::new();
        for mut item in list.drain(..) {
            let kind = item
                .get("type")
                .and_then(Json::as_str)
                .unwrap_or_default()
                .to_string();
            match kind.as_str() {
                "query" => match self.convert_query_variable(&mut item, reporter)? {
                    QueryVariable::Dropped => {}
                    QueryVariable::Converted => kept.push(item),
                    QueryVariable::NeedsBackfill { token, key } => {
                        pending.push(PendingBackfill {
                            name: variable_name(&item),
                            position: kept.len(),
                            token,
                            key,
                        });
                        kept.push(item);
                    }
                },
                "custom" | "interval" | "datasource" => kept.push(item),
                other => return Err(ConvertError::UnknownTemplateKind(other.to_string())),
            }
        }
        *list = kept;
        Ok(pending)
    }

    fn convert_query_variable(
        &self,
        item: &mut Json,
        reporter: &mut Reporter<'_>,
    ) -> Result<QueryVariable> {
        let query = match item.get("query") {
            Some(Json::String(query)) => query.clone(),
            Some(Json::Object(map)) => match map.get("query").and_then(Json::as_str) {
                Some(query) => query.to_string(),
                None => {
                    return Err(ConvertError::UnrecognizedTemplatingShape(
                        "query object without query text".into(),
                    ))
                }
            },
            _ => {
                return Err(ConvertError::UnrecognizedTemplatingShape(format!(
                    "variable {} has no query",
                    variable_name(item)
                )))
            }
        };

        if query.trim().to_lowercase().starts_with("show field keys") {
            reporter.add_error(
                "Dropping SHOW FIELD KEYS template variable",
                ErrorLevel::Info,
                variable_name(item),
            );
            return Ok(QueryVariable::Dropped);
        }

        let discovery = match parse(&query) {
            Ok(QueryShape::Discovery(discovery)) => discovery,
            Ok(_) => return Err(ConvertError::UnrecognizedTemplatingShape(query)),
            Err(err) => {
                return Err(ConvertError::UnrecognizedTemplatingShape(format!(
                    "{query}: {err}"
                )))
            }
        };
        if discovery.regex_key {
            reporter.add_error(
                "REGEXP show tag values is not supported in Prometheus, converting to STATIC",
                ErrorLevel::Warn,
                query.as_str(),
            );
        }

        let key = sanitize_metric(&discovery.key);
        let metric = discovery
            .measurement
            .as_deref()
            .map(measurement_token)
            .filter(|token| !token.is_empty())
            .map(|token| {
                self.config
                    .template_metric_overrides
                    .get(&token)
                    .cloned()
                    .unwrap_or(token)
            });

        let new_query = label_values(metric.as_deref(), &key);
        debug!(variable = %variable_name(item), %query, %new_query, "converted template variable");

        if let Some(datasource) = &self.config.replacement_datasource {
            item["datasource"] = json!({"uid": datasource.uid, "type": datasource.kind});
        }
        item["sort"] = json!(NUMERIC_SORT);
        item["query"] = json!(new_query);
        item["definition"] = json!(new_query);
        if item.get("allValue").and_then(Json::as_str) == Some("*") {
            item["allValue"] = json!(".*");
        }

        Ok(match metric {
            Some(token) => QueryVariable::NeedsBackfill { token, key },
            None => QueryVariable::Converted,
        })
    }
}

/// Points backfilled variables at the first metric instantiating their
/// token and records the variable against every instantiation.
pub fn apply_backfill(
    templating: &mut Json,
    pending: &[PendingBackfill],
    index: &mut MetricUsageIndex,
    dashboard: &str,
) {
    for backfill in pending {
        let metrics = index.instantiations_of(&backfill.token);
        let Some(first) = metrics.first() else {
            debug!(token = %backfill.token, "no metric instantiates template token");
            continue;
        };
        let Some(item) = templating
            .get_mut("list")
            .and_then(Json::as_array_mut)
            .and_then(|list| list.get_mut(backfill.position))
        else {
            continue;
        };

        let query = label_values(Some(first.as_str()), &backfill.key);
        item["query"] = json!(query);
        item["definition"] = json!(query);
        for metric in &metrics {
            index.record(
                metric,
                dashboard,
                UsageEntry::Template {
                    name: backfill.name.clone(),
                    query: query.clone(),
                },
            );
        }
    }
}

fn label_values(metric: Option<&str>, key: &str) -> String {
    match metric {
        Some(metric) => format!("label_values({metric},{key})"),
        None => format!("label_values({key})"),
    }
}

/// Regex measurements such as `/^disk.*$/` are reduced to their literal stem.
fn measurement_token(measurement: &str) -> String {
    let stem = measurement.replace(".*", "").replace(['/', '(', ')'], "");
    sanitize_metric(stem.trim_start_matches('^').trim_end_matches('$'))
}

fn variable_name(item: &Json) -> String {
    item.get("name")
        .and_then(Json::as_str)
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::DatasourceRef, report::ErrorCollector};
    use pretty_assertions::assert_eq;

    fn convert_with(config: &ConverterConfig, templating: &mut Json) -> (Result<Vec<PendingBackfill>>, ErrorCollector) {
        let mut collector = ErrorCollector::new();
        let result = {
            let mut reporter = Reporter::new(&mut collector);
            TemplatingTranslator::new(config).convert(templating, &mut reporter)
        };
        (result, collector)
    }

    fn convert(templating: &mut Json) -> (Result<Vec<PendingBackfill>>, ErrorCollector) {
        convert_with(&ConverterConfig::default(), templating)
    }

    #[test]
    fn discovery_queries_become_label_values() {
        let mut templating = json!({"list": [
            {"name": "host", "type": "query", "query": "SHOW TAG VALUES FROM \"net\" WITH KEY = \"host\"", "allValue": "*"},
            {"name": "dc", "type": "query", "query": {"query": "SHOW TAG VALUES WITH KEY = \"data-center\"", "refId": "A"}},
            {"name": "ds", "type": "datasource", "query": "influxdb"},
            {"name": "step", "type": "interval", "query": "1m,5m"}
        ]});
        let (result, collector) = convert(&mut templating);
        let pending = result.unwrap();

        assert_eq!(templating["list"][0]["query"], "label_values(net,host)");
        assert_eq!(templating["list"][0]["definition"], "label_values(net,host)");
        assert_eq!(templating["list"][0]["sort"], 3);
        assert_eq!(templating["list"][0]["allValue"], ".*");
        assert_eq!(templating["list"][1]["query"], "label_values(data_center)");
        assert_eq!(templating["list"][2]["query"], "influxdb");
        assert_eq!(templating["list"][3]["query"], "1m,5m");
        assert_eq!(
            pending,
            vec![PendingBackfill {
                name: "host".into(),
                position: 0,
                token: "net".into(),
                key: "host".into(),
            }]
        );
        assert!(collector.is_empty());
    }

    #[test]
    fn field_key_queries_are_dropped() {
        let mut templating = json!({"list": [
            {"name": "field", "type": "query", "query": "SHOW FIELD KEYS FROM \"cpu\""},
            {"name": "host", "type": "query", "query": "SHOW TAG VALUES FROM \"cpu\" WITH KEY = \"host\""}
        ]});
        let (result, _) = convert(&mut templating);
        let pending = result.unwrap();
        assert_eq!(templating["list"].as_array().map(Vec::len), Some(1));
        assert_eq!(pending[0].position, 0);
        assert_eq!(pending[0].token, "cpu");
    }

    #[test]
    fn regex_discovery_warns_and_strips_measurement() {
        let mut templating = json!({"list": [
            {"name": "path", "type": "query", "query": "SHOW TAG VALUES FROM /^disk.*$/ WITH KEY =~ /path/"}
        ]});
        let (result, collector) = convert(&mut templating);
        assert!(result.is_ok());
        assert_eq!(templating["list"][0]["query"], "label_values(disk,path)");
        assert_eq!(collector.errors().len(), 1);
        assert_eq!(collector.errors()[0].level, ErrorLevel::Warn);
    }

    #[test]
    fn overrides_and_replacement_datasource_apply() {
        let mut config = ConverterConfig::default();
        config
            .template_metric_overrides
            .insert("procstat".into(), "procstat_cpu_usage".into());
        config.replacement_datasource = Some(DatasourceRef {
            uid: "prom".into(),
            kind: "prometheus".into(),
        });
        let mut templating = json!({"list": [
            {"name": "proc", "type": "query", "datasource": "influx", "query": "SHOW TAG VALUES FROM procstat WITH KEY = \"exe\""}
        ]});
        let (result, _) = convert_with(&config, &mut templating);
        assert_eq!(result.unwrap()[0].token, "procstat_cpu_usage");
        assert_eq!(templating["list"][0]["query"], "label_values(procstat_cpu_usage,exe)");
        assert_eq!(
            templating["list"][0]["datasource"],
            json!({"uid": "prom", "type": "prometheus"})
        );
    }

    #[test]
    fn unknown_kinds_and_shapes_are_fatal() {
        let mut adhoc = json!({"list": [{"name": "f", "type": "adhoc"}]});
        let (result, _) = convert(&mut adhoc);
        let err = result.unwrap_err();
        assert!(matches!(err, ConvertError::UnknownTemplateKind(ref kind) if kind == "adhoc"));
        assert!(err.is_dashboard_fatal());

        let mut measurements = json!({"list": [{"name": "m", "type": "query", "query": "SHOW MEASUREMENTS"}]});
        let (result, _) = convert(&mut measurements);
        assert!(matches!(
            result,
            Err(ConvertError::UnrecognizedTemplatingShape(_))
        ));
    }

    #[test]
    fn backfill_points_variable_at_concrete_metric() {
        let mut templating = json!({"list": [
            {"name": "host", "type": "query", "query": "label_values(net,host)"}
        ]});
        let pending = vec![PendingBackfill {
            name: "host".into(),
            position: 0,
            token: "net".into(),
            key: "host".into(),
        }];
        let mut index = MetricUsageIndex::new();
        for metric in ["net_bytes_recv", "net_bytes_sent", "netstat_tcp"] {
            index.record(
                metric,
                "Hosts",
                UsageEntry::Target {
                    panel_id: "1".into(),
                    panel_title: "Net".into(),
                    ref_id: "A".into(),
                    expr: format!("avg({metric})"),
                },
            );
        }

        apply_backfill(&mut templating, &pending, &mut index, "Hosts");
        assert_eq!(templating["list"][0]["query"], "label_values(net_bytes_recv,host)");
        let expected = UsageEntry::Template {
            name: "host".into(),
            query: "label_values(net_bytes_recv,host)".into(),
        };
        assert!(index.entries("net_bytes_recv", "Hosts").contains(&expected));
        assert!(index.entries("net_bytes_sent", "Hosts").contains(&expected));
        assert_eq!(index.entries("netstat_tcp", "Hosts").len(), 1);
    }

    #[test]
    fn measurement_tokens() {
        assert_eq!(measurement_token("^disk.*$"), "disk");
        assert_eq!(measurement_token("(cpu|mem)"), "cpu|mem");
        assert_eq!(measurement_token("system-load"), "system_load");
        assert_eq!(measurement_token("$measurement"), "$measurement");
    }
}
