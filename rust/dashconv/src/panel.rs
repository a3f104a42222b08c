//! Per-panel conversion: targets, legends, alerts and display hints.
//!
//! A failing target takes the whole panel's queries down with it, but never
//! the dashboard: the targets and alert are removed, one ERROR record is
//! written and conversion moves on to the next panel.

use crate::{
    config::ConverterConfig,
    datasource::{DatasourceClassifier, DatasourceRegistry, SOURCE_TYPE},
    duration::{format_seconds, parse_seconds, INTERVAL, RANGE, RATE_INTERVAL},
    error::{ConvertError, Result},
    influxql::lower_target,
    promql::{ExpressionBuilder, Translation},
    report::{ErrorLevel, PanelRef, Reporter},
    rewrite::translate_raw,
    usage::{MetricUsageIndex, UsageEntry},
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value as Json};
use std::collections::BTreeSet;
use tracing::debug;

/// Marks a target that was left in its source form.
pub const SKIPPED_TARGET_FLAG: &str = "notInfluxTarget";
const DEFAULT_RESULT_FORMAT: &str = "time_series";

static TAG_ALIAS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\[\[|\$)tag_([a-zA-Z_]+)(\]\]|)").expect("valid tag alias regex")
});

static PERCENTILE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d+\w+\spercentile").expect("valid percentile regex"));

/// What the dashboard needs to know about the surroundings of a panel.
pub struct PanelScope<'s> {
    pub dashboard: &'s str,
    pub templating: &'s Json,
}

#[derive(Debug)]
pub enum TargetOutcome {
    Converted { target: Json, translation: Translation },
    /// Not an InfluxQL target; kept as is and flagged.
    Skipped(Json),
}

pub struct PanelConverter<'a> {
    config: &'a ConverterConfig,
    classifier: DatasourceClassifier<'a>,
    builder: ExpressionBuilder<'a>,
}

impl<'a> PanelConverter<'a> {
    pub fn new(config: &'a ConverterConfig, registry: &'a DatasourceRegistry) -> Self {
        Self {
            config,
            classifier: DatasourceClassifier::new(registry),
            builder: ExpressionBuilder::new(config),
        }
    }

    pub fn convert_panels(
        &self,
        panels: &mut [Json],
        scope: &PanelScope<'_>,
        index: &mut MetricUsageIndex,
        reporter: &mut Reporter<'_>,
    ) {
        for panel in panels {
            self.convert_panel(panel, scope, index, reporter);
        }
    }

    pub fn convert_panel(
        &self,
        panel: &mut Json,
        scope: &PanelScope<'_>,
        index: &mut MetricUsageIndex,
        reporter: &mut Reporter<'_>,
    ) {
        let panel_ref = panel_ref(panel);
        reporter.enter_panel(panel_ref.clone());

        if panel.get("type").and_then(Json::as_str) == Some("row") {
            // Collapsed rows keep their panels nested.
            if let Some(nested) = panel.get_mut("panels").and_then(Json::as_array_mut) {
                self.convert_panels(nested, scope, index, reporter);
            }
            reporter.leave_panel();
            return;
        }

        let source_datasource = match panel.get("datasource") {
            Some(datasource) if !datasource.is_null() => datasource.clone(),
            _ => json!({"type": SOURCE_TYPE}),
        };
        if let Some(replacement) = &self.config.replacement_datasource {
            if panel.get("datasource").is_some() {
                panel["datasource"] = json!({"uid": replacement.uid, "type": replacement.kind});
            }
        }

        match self.convert_targets(panel, &source_datasource, scope, reporter) {
            Ok(usage) => {
                for (metric, entry) in usage {
                    index.record(&metric, scope.dashboard, entry);
                }
            }
            Err(err) => {
                if let Some(object) = panel.as_object_mut() {
                    object.remove("targets");
                    object.remove("alert");
                }
                reporter.add_error(
                    format!("Unable to convert - {err}"),
                    ErrorLevel::Error,
                    err.to_string(),
                );
            }
        }

        if let Some(alert) = panel.get_mut("alert") {
            if let Err(err) = self.convert_alert(alert, reporter) {
                if let Some(object) = panel.as_object_mut() {
                    object.remove("alert");
                }
                reporter.add_error(
                    format!("Unable to convert alert - {err}"),
                    ErrorLevel::Error,
                    err.to_string(),
                );
            }
        }

        if let Some(overrides) = panel.get_mut("seriesOverrides").and_then(Json::as_array_mut) {
            for alias in overrides.iter_mut().filter_map(|o| o.get_mut("alias")) {
                let Some(text) = alias.as_str() else {
                    continue;
                };
                let renamed = PERCENTILE.replace_all(text, "Mean").into_owned();
                *alias = Json::String(renamed);
            }
        }

        debug!(panel = %panel_ref.id, title = %panel_ref.title, "converted panel");
        reporter.leave_panel();
    }

    /// Returns the usage entries to index once every target converted.
    fn convert_targets(
        &self,
        panel: &mut Json,
        source_datasource: &Json,
        scope: &PanelScope<'_>,
        reporter: &mut Reporter<'_>,
    ) -> Result<Vec<(String, UsageEntry)>> {
        let Some(targets) = panel.get("targets").and_then(Json::as_array) else {
            return Ok(Vec::new());
        };
        let panel_ref = panel_ref(panel);

        let mut converted = Vec::with_capacity(targets.len());
        let mut usage = Vec::new();
        let mut windows = Vec::new();
        let mut fills = Vec::new();
        for target in targets {
            match self.convert_target(target, Some(source_datasource), scope.templating, reporter)? {
                TargetOutcome::Skipped(target) => converted.push(target),
                TargetOutcome::Converted {
                    target: new_target,
                    translation,
                } => {
                    windows.extend(translation.windows.iter().cloned());
                    fills.extend(translation.fills.iter().cloned());
                    usage.push((
                        translation.metric.clone(),
                        UsageEntry::Target {
                            panel_id: panel_ref.id.clone(),
                            panel_title: panel_ref.title.clone(),
                            ref_id: ref_id(target),
                            expr: translation.expr.clone(),
                        },
                    ));
                    converted.push(new_target);
                }
            }
        }

        panel["targets"] = Json::Array(converted);
        self.infer_interval(panel, windows, reporter);
        apply_fills(panel, fills, reporter);
        Ok(usage)
    }

    pub fn convert_target(
        &self,
        target: &Json,
        panel_datasource: Option<&Json>,
        templating: &Json,
        reporter: &mut Reporter<'_>,
    ) -> Result<TargetOutcome> {
        if !target.is_object() {
            return Err(ConvertError::shape(format!("target {target} is not an object")));
        }
        if target.get(SKIPPED_TARGET_FLAG).and_then(Json::as_bool) == Some(true) {
            return Ok(TargetOutcome::Skipped(target.clone()));
        }

        if !self
            .classifier
            .is_source_target(target, templating, panel_datasource, reporter)
        {
            let notes = match target.get("refId").and_then(Json::as_str) {
                Some(ref_id) => format!("target={ref_id}"),
                None => "target unknown".to_string(),
            };
            reporter.add_error("Skipping target - not Influx or is Flux", ErrorLevel::Debug, notes);
            let mut skipped = target.clone();
            skipped[SKIPPED_TARGET_FLAG] = json!(true);
            return Ok(TargetOutcome::Skipped(skipped));
        }

        let translation = if target.get("rawQuery").and_then(Json::as_bool) == Some(true) {
            let query = target
                .get("query")
                .and_then(Json::as_str)
                .ok_or_else(|| ConvertError::MissingRequiredField("query".into()))?;
            translate_raw(&self.builder, query)?
        } else {
            let lowered = lower_target(target)?;
            for dropped in &lowered.dropped {
                reporter.add_error(
                    format!("Dropping unsupported {dropped}"),
                    ErrorLevel::Info,
                    ref_id(target),
                );
            }
            self.builder.translate_select(&lowered.query)?
        };
        for warning in &translation.warnings {
            reporter.add_error(warning.as_str(), ErrorLevel::Warn, translation.expr.as_str());
        }

        let legend = legend_format(target, &translation, reporter);
        let format = target
            .get("resultFormat")
            .and_then(Json::as_str)
            .unwrap_or(DEFAULT_RESULT_FORMAT);
        let mut converted = json!({
            "expr": translation.expr,
            "format": format,
            "instant": format == "table",
            "intervalFactor": 1,
            "legendFormat": legend,
        });
        if let Some(ref_id) = target.get("refId") {
            converted["refId"] = ref_id.clone();
        }
        if let Some(hide) = target.get("hide") {
            converted["hide"] = hide.clone();
        }

        Ok(TargetOutcome::Converted {
            target: converted,
            translation,
        })
    }

    /// Picks a panel interval from the widest literal window, unless the
    /// scrape cadence or an interval placeholder already covers it.
    fn infer_interval(&self, panel: &mut Json, windows: Vec<String>, reporter: &mut Reporter<'_>) {
        let mut windows: BTreeSet<String> = windows.into_iter().collect();
        for covered in [INTERVAL, RATE_INTERVAL, "$interval"] {
            windows.remove(covered);
        }
        if windows.contains(RANGE) {
            return;
        }

        let mut widest: Option<u64> = None;
        for window in &windows {
            match parse_seconds(window) {
                Some(secs) => widest = widest.max(Some(secs)),
                None => reporter.add_error("Dropping unsupported interval", ErrorLevel::Info, window.as_str()),
            }
        }

        let has_interval = panel
            .get("interval")
            .is_some_and(|interval| !interval.is_null() && interval.as_str() != Some(""));
        if let Some(secs) = widest {
            if !has_interval && secs != self.config.scrape_interval_secs {
                panel["interval"] = json!(format_seconds(secs));
            }
        }
    }

    fn convert_alert(&self, alert: &mut Json, reporter: &mut Reporter<'_>) -> Result<()> {
        if !alert.is_object() {
            return Err(ConvertError::shape(format!("alert {alert} is not an object")));
        }
        let maps = &self.config.notifications;
        if maps.is_empty() {
            if let Some(object) = alert.as_object_mut() {
                object.remove("notifications");
            }
            reporter.add_error(
                "No alert notification mapping defined, deleting alert notifications array",
                ErrorLevel::Warn,
                "",
            );
            return Ok(());
        }

        if let Some(name) = alert.get("name").and_then(Json::as_str) {
            let renamed = format!("{name}{}", self.config.alert_name_suffix);
            alert["name"] = Json::String(renamed);
        }

        let mut remapped: Vec<Json> = Vec::new();
        let notifications = alert
            .get("notifications")
            .and_then(Json::as_array)
            .cloned()
            .unwrap_or_default();
        for notification in &notifications {
            let by_id = notification
                .get("id")
                .and_then(json_key)
                .and_then(|id| maps.by_id.get(&id));
            let uid = by_id.or_else(|| {
                let uid = notification.get("uid").and_then(Json::as_str)?;
                if uid.parse::<u64>().is_ok() {
                    maps.by_id.get(uid)
                } else {
                    maps.by_uid.get(uid)
                }
            });
            let Some(uid) = uid else {
                return Err(ConvertError::NotificationMappingMissing(notification.to_string()));
            };
            let entry = json!({"uid": uid});
            if !remapped.contains(&entry) {
                remapped.push(entry);
            }
        }
        alert["notifications"] = Json::Array(remapped);
        Ok(())
    }
}

fn apply_fills(panel: &mut Json, fills: Vec<String>, reporter: &mut Reporter<'_>) {
    let mut fills: BTreeSet<String> = fills.into_iter().collect();
    fills.remove("null");
    if fills.remove("0") {
        panel["nullPointMode"] = json!("null as zero");
    }
    if !fills.is_empty() {
        let notes = fills.into_iter().collect::<Vec<_>>().join(" ");
        reporter.add_error("Unsupported fills", ErrorLevel::Warn, notes);
    }
}

fn legend_format(target: &Json, translation: &Translation, reporter: &mut Reporter<'_>) -> String {
    let alias = target.get("alias").and_then(Json::as_str).unwrap_or_default();
    let legend = TAG_ALIAS.replace_all(alias, "{{ ${2} }}");
    let mut legend = PERCENTILE.replace_all(&legend, "Mean").into_owned();

    if legend.is_empty() && !translation.group_labels.is_empty() {
        legend = translation
            .group_labels
            .iter()
            .map(|label| format!("{{{{{label}}}}}"))
            .collect::<Vec<_>>()
            .join(" ");
    }

    if legend.contains("$col") {
        match &translation.alias {
            Some(name) => legend = legend.replace("$col", name),
            None => reporter.add_error(
                "Alias not detected, not replacing $col",
                ErrorLevel::Warn,
                legend.as_str(),
            ),
        }
    }
    legend
}

fn panel_ref(panel: &Json) -> PanelRef {
    let id = panel.get("id").and_then(json_key).unwrap_or_default();
    let title = panel
        .get("title")
        .and_then(Json::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| id.clone());
    PanelRef { id, title }
}

fn ref_id(target: &Json) -> String {
    target
        .get("refId")
        .and_then(Json::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Ids show up both as numbers and as strings.
fn json_key(value: &Json) -> Option<String> {
    match value {
        Json::String(s) => Some(s.clone()),
        Json::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
