use anyhow::{bail, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs, path::PathBuf};

pub const DEFAULT_SCRAPE_INTERVAL_SECS: u64 = 30;

/// Metric-name patterns that pick a better default than `avg`. Matched at the
/// start of the metric name, first hit wins.
static DEFAULT_AGGREGATION_RULES: Lazy<Vec<AggregationRule>> = Lazy::new(|| {
    [
        (r".*_remaining_(percent_|)value", "min"),
        (r"(disk|swap)_free", "min"),
        (r"mem_available", "min"),
        (r".*_error_value", "max"),
        (r".*_size(_value|$)", "max"),
        (r"disk_used.*", "max"),
    ]
    .into_iter()
    .map(|(pattern, aggregation)| {
        AggregationRule::new(pattern, aggregation).expect("valid default aggregation regex")
    })
    .collect()
});

/// Destination datasource written into converted panels and template variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasourceRef {
    pub uid: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Lookup tables from source alert notification ids/uids to destination uids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct NotificationMaps {
    #[serde(default)]
    pub by_id: BTreeMap<String, String>,
    #[serde(default)]
    pub by_uid: BTreeMap<String, String>,
}

impl NotificationMaps {
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty() && self.by_uid.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct AggregationRule {
    pattern: Regex,
    pub aggregation: String,
}

impl AggregationRule {
    pub fn new(pattern: &str, aggregation: &str) -> Result<Self> {
        let pattern = Regex::new(&format!("^(?:{pattern})"))
            .with_context(|| format!("invalid aggregation pattern {pattern:?}"))?;
        Ok(Self {
            pattern,
            aggregation: aggregation.to_string(),
        })
    }

    pub fn matches(&self, metric: &str) -> bool {
        self.pattern.is_match(metric)
    }
}

/// Knobs of the translation engine itself.
#[derive(Debug, Clone)]
pub struct ConverterConfig {
    pub scrape_interval_secs: u64,
    /// Metric-name prefixes scraped at a non-default cadence. The last
    /// matching prefix wins.
    pub prefix_scrape_intervals: Vec<(String, u64)>,
    pub replacement_datasource: Option<DatasourceRef>,
    pub notifications: NotificationMaps,
    pub alert_name_suffix: String,
    /// Measurement tokens from template discovery queries that should be
    /// pinned to a known metric name.
    pub template_metric_overrides: BTreeMap<String, String>,
    pub default_aggregations: Vec<AggregationRule>,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            scrape_interval_secs: DEFAULT_SCRAPE_INTERVAL_SECS,
            prefix_scrape_intervals: Vec::new(),
            replacement_datasource: None,
            notifications: NotificationMaps::default(),
            alert_name_suffix: default_alert_name_suffix(),
            template_metric_overrides: BTreeMap::new(),
            default_aggregations: DEFAULT_AGGREGATION_RULES.clone(),
        }
    }
}

impl ConverterConfig {
    pub fn scrape_interval_for(&self, metric: &str) -> u64 {
        self.prefix_scrape_intervals
            .iter()
            .filter(|(prefix, _)| metric.starts_with(prefix.as_str()))
            .map(|(_, secs)| *secs)
            .last()
            .unwrap_or(self.scrape_interval_secs)
    }

    pub fn default_aggregation_for(&self, metric: &str) -> &str {
        self.default_aggregations
            .iter()
            .find(|rule| rule.matches(metric))
            .map(|rule| rule.aggregation.as_str())
            .unwrap_or("avg")
    }
}

/// Process-level configuration of the `dashconv` binary.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub input: PathBuf,
    pub output: PathBuf,
    pub errors_csv: PathBuf,
    pub usage_output: PathBuf,
    pub report_output: PathBuf,
    pub converter: String,
    pub datasources_file: Option<PathBuf>,
    pub grafana_url: Option<String>,
    pub grafana_org_id: Option<String>,
    pub converter_config: ConverterConfig,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    dashconv_input: Option<String>,
    #[serde(default = "default_output")]
    dashconv_output: String,
    #[serde(default = "default_errors_csv")]
    dashconv_errors_csv: String,
    #[serde(default = "default_usage_output")]
    dashconv_usage_output: String,
    #[serde(default = "default_report_output")]
    dashconv_report_output: String,
    #[serde(default = "default_converter")]
    dashconv_converter: String,
    #[serde(default = "default_scrape_interval_secs")]
    dashconv_scrape_interval_secs: u64,
    #[serde(default)]
    dashconv_prefix_scrape_intervals: Option<String>,
    #[serde(default)]
    dashconv_datasource_uid: Option<String>,
    #[serde(default)]
    dashconv_datasource_type: Option<String>,
    #[serde(default)]
    dashconv_datasources_file: Option<String>,
    #[serde(default)]
    dashconv_notifications_file: Option<String>,
    #[serde(default)]
    dashconv_grafana_url: Option<String>,
    #[serde(default)]
    dashconv_grafana_org_id: Option<String>,
    #[serde(default = "default_alert_name_suffix")]
    dashconv_alert_name_suffix: String,
}

fn default_output() -> String {
    "converted_dashboards.json".to_string()
}

fn default_errors_csv() -> String {
    "errors.csv".to_string()
}

fn default_usage_output() -> String {
    "metric_usage.json".to_string()
}

fn default_report_output() -> String {
    "result_report.json".to_string()
}

fn default_converter() -> String {
    "influxql".to_string()
}

fn default_alert_name_suffix() -> String {
    " (PromQL)".to_string()
}

const fn default_scrape_interval_secs() -> u64 {
    DEFAULT_SCRAPE_INTERVAL_SECS
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let raw: RawConfig =
            envy::from_env().context("failed to parse DASHCONV_* environment variables")?;

        let input = raw
            .dashconv_input
            .filter(|value| !value.trim().is_empty())
            .context("DASHCONV_INPUT must be set")?;

        if raw.dashconv_scrape_interval_secs == 0 {
            bail!("DASHCONV_SCRAPE_INTERVAL_SECS must be greater than zero");
        }

        let replacement_datasource = match (raw.dashconv_datasource_uid, raw.dashconv_datasource_type) {
            (Some(uid), Some(kind)) => Some(DatasourceRef { uid, kind }),
            (None, None) => None,
            _ => bail!("DASHCONV_DATASOURCE_UID and DASHCONV_DATASOURCE_TYPE must be set together"),
        };

        let prefix_scrape_intervals = raw
            .dashconv_prefix_scrape_intervals
            .as_deref()
            .map(parse_prefix_intervals)
            .transpose()?
            .unwrap_or_default();

        let notifications = match raw.dashconv_notifications_file {
            Some(path) => {
                let body = fs::read_to_string(&path)
                    .with_context(|| format!("failed to read notifications file {path}"))?;
                serde_json::from_str(&body)
                    .with_context(|| format!("invalid notifications file {path}"))?
            }
            None => NotificationMaps::default(),
        };

        Ok(Self {
            input: PathBuf::from(input),
            output: PathBuf::from(raw.dashconv_output),
            errors_csv: PathBuf::from(raw.dashconv_errors_csv),
            usage_output: PathBuf::from(raw.dashconv_usage_output),
            report_output: PathBuf::from(raw.dashconv_report_output),
            converter: raw.dashconv_converter.trim().to_lowercase(),
            datasources_file: raw.dashconv_datasources_file.map(PathBuf::from),
            grafana_url: raw.dashconv_grafana_url,
            grafana_org_id: raw.dashconv_grafana_org_id,
            converter_config: ConverterConfig {
                scrape_interval_secs: raw.dashconv_scrape_interval_secs,
                prefix_scrape_intervals,
                replacement_datasource,
                notifications,
                alert_name_suffix: raw.dashconv_alert_name_suffix,
                ..ConverterConfig::default()
            },
        })
    }
}

/// Parses `prefix=secs` pairs separated by commas.
fn parse_prefix_intervals(csv: &str) -> Result<Vec<(String, u64)>> {
    csv.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (prefix, secs) = entry
                .split_once('=')
                .with_context(|| format!("expected prefix=seconds, got {entry:?}"))?;
            let secs = secs
                .trim()
                .parse::<u64>()
                .with_context(|| format!("invalid scrape interval in {entry:?}"))?;
            Ok((prefix.trim().to_string(), secs))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    const VARS: &[&str] = &[
        "DASHCONV_INPUT",
        "DASHCONV_OUTPUT",
        "DASHCONV_CONVERTER",
        "DASHCONV_SCRAPE_INTERVAL_SECS",
        "DASHCONV_PREFIX_SCRAPE_INTERVALS",
        "DASHCONV_DATASOURCE_UID",
        "DASHCONV_DATASOURCE_TYPE",
        "DASHCONV_NOTIFICATIONS_FILE",
        "DASHCONV_ALERT_NAME_SUFFIX",
    ];

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn reads_defaults() {
        clear_env();
        env::set_var("DASHCONV_INPUT", "dashboards.json");

        let config = AppConfig::from_env().unwrap();
        assert_eq!(config.input, PathBuf::from("dashboards.json"));
        assert_eq!(config.output, PathBuf::from("converted_dashboards.json"));
        assert_eq!(config.converter, "influxql");
        assert_eq!(config.converter_config.scrape_interval_secs, 30);
        assert_eq!(config.converter_config.alert_name_suffix, " (PromQL)");
        assert!(config.converter_config.replacement_datasource.is_none());
        clear_env();
    }

    #[test]
    #[serial]
    fn requires_input() {
        clear_env();
        let err = AppConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("DASHCONV_INPUT"));
    }

    #[test]
    #[serial]
    fn datasource_requires_both_halves() {
        clear_env();
        env::set_var("DASHCONV_INPUT", "in.json");
        env::set_var("DASHCONV_DATASOURCE_UID", "prom");
        assert!(AppConfig::from_env().is_err());

        env::set_var("DASHCONV_DATASOURCE_TYPE", "prometheus");
        let config = AppConfig::from_env().unwrap();
        assert_eq!(
            config.converter_config.replacement_datasource,
            Some(DatasourceRef {
                uid: "prom".into(),
                kind: "prometheus".into(),
            })
        );
        clear_env();
    }

    #[test]
    #[serial]
    fn parses_prefix_scrape_intervals() {
        clear_env();
        env::set_var("DASHCONV_INPUT", "in.json");
        env::set_var("DASHCONV_PREFIX_SCRAPE_INTERVALS", "busy_metric_=1, slow_=120");
        let config = AppConfig::from_env().unwrap();
        let engine = &config.converter_config;
        assert_eq!(engine.scrape_interval_for("busy_metric_x"), 1);
        assert_eq!(engine.scrape_interval_for("slow_y"), 120);
        assert_eq!(engine.scrape_interval_for("cpu_usage"), 30);

        env::set_var("DASHCONV_PREFIX_SCRAPE_INTERVALS", "broken");
        assert!(AppConfig::from_env().is_err());
        clear_env();
    }

    #[test]
    fn default_aggregation_table() {
        let config = ConverterConfig::default();
        assert_eq!(config.default_aggregation_for("disk_free"), "min");
        assert_eq!(config.default_aggregation_for("swap_free"), "min");
        assert_eq!(config.default_aggregation_for("quota_remaining_percent_value"), "min");
        assert_eq!(config.default_aggregation_for("mem_available"), "min");
        assert_eq!(config.default_aggregation_for("kafka_error_value"), "max");
        assert_eq!(config.default_aggregation_for("queue_size"), "max");
        assert_eq!(config.default_aggregation_for("disk_used_percent"), "max");
        assert_eq!(config.default_aggregation_for("cpu_usage_idle"), "avg");
        // Anchored at the start of the name only.
        assert_eq!(config.default_aggregation_for("host_disk_free"), "avg");
    }

    #[test]
    fn notification_maps_deserialize() {
        let maps: NotificationMaps =
            serde_json::from_str(r#"{"by_id": {"1": "new-a"}, "by_uid": {"old": "new-b"}}"#).unwrap();
        assert_eq!(maps.by_id.get("1").map(String::as_str), Some("new-a"));
        assert!(!maps.is_empty());
        assert!(NotificationMaps::default().is_empty());
    }
}
