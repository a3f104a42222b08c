//! PromQL code generation from parsed InfluxQL shapes.
//!
//! Parsing decides whether a query is understood at all; this module only
//! decides how an understood query is rendered. The rendered form is
//!
//! ```text
//! <aggregation>[ by (<labels>)](<over-time-fn>(<metric>{<matchers>}[<window>]) <condition>) <modifications>
//! ```
//!
//! with the over-time function, window and condition present only when the
//! source query calls for them. OR-ed value conditions produce one such
//! expression per alternative, joined with `or`.

use crate::{
    config::ConverterConfig,
    duration::{format_seconds, to_interval_placeholder, INTERVAL, RANGE, RATE_INTERVAL},
    error::{ConvertError, Result},
    influxql::ast::{
        map_aggregation, CompareOp, Comparison, Predicate, QueryShape, SelectQuery,
        SubqueryDownsample, Value,
    },
};
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::debug;

/// Aggregations that have a `<name>_over_time` range-vector form.
pub const OVER_TIME_AGGREGATIONS: [&str; 8] =
    ["avg", "min", "max", "sum", "quantile", "stddev", "stdvar", "count"];

const INVALID_METRIC_CHARACTERS: [char; 4] = ['.', '-', ' ', '%'];

/// Aggregations that stay correct when a condition filters samples first.
const FILTER_SAFE_AGGREGATIONS: [&str; 3] = ["avg", "max", "min"];

/// Result of translating one query.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Translation {
    pub expr: String,
    /// Primary metric referenced by the expression.
    pub metric: String,
    /// Windows and scrape cadences the expression depends on.
    pub windows: Vec<String>,
    pub fills: Vec<String>,
    pub alias: Option<String>,
    pub group_labels: Vec<String>,
    /// Recoverable oddities the caller should surface for review.
    pub warnings: Vec<String>,
}

pub fn sanitize_metric(name: &str) -> String {
    name.replace(INVALID_METRIC_CHARACTERS, "_")
}

pub struct ExpressionBuilder<'a> {
    config: &'a ConverterConfig,
}

#[derive(Debug, Default)]
struct Filters {
    labels: BTreeSet<String>,
    /// Value conditions that must all hold.
    conditions: Vec<String>,
    /// Value conditions of which any may hold.
    alternatives: Vec<String>,
    warnings: Vec<String>,
}

impl Filters {
    fn condition_count(&self) -> usize {
        self.conditions.len() + self.alternatives.len()
    }

    /// One condition string per expression to render.
    fn variants(&self) -> Vec<String> {
        let all = self.conditions.join(" ");
        if self.alternatives.is_empty() {
            return vec![all];
        }
        self.alternatives
            .iter()
            .map(|alternative| {
                if all.is_empty() {
                    alternative.clone()
                } else {
                    format!("{alternative} {all}")
                }
            })
            .collect()
    }
}

enum Filter {
    Label(String),
    Condition(String),
}

impl<'a> ExpressionBuilder<'a> {
    pub fn new(config: &'a ConverterConfig) -> Self {
        Self { config }
    }

    pub fn translate(&self, shape: &QueryShape) -> Result<Translation> {
        match shape {
            QueryShape::Select(select) => self.translate_select(select),
            QueryShape::Subquery(subquery) => self.translate_subquery(subquery),
            QueryShape::Discovery(_) => Err(ConvertError::shape(
                "tag discovery query used as a panel target",
            )),
        }
    }

    pub fn translate_select(&self, query: &SelectQuery) -> Result<Translation> {
        self.render(query, None)
    }

    /// The inner query is rendered with the outer grouping, then its outer
    /// aggregation is replaced by `sum`.
    fn translate_subquery(&self, subquery: &SubqueryDownsample) -> Result<Translation> {
        let translation = self.render(&subquery.inner, Some("sum"))?;
        if translation.windows.is_empty() || translation.group_labels.is_empty() {
            return Err(ConvertError::shape(format!(
                "unsupported downsampling subquery over {}",
                subquery.outer_field
            )));
        }
        Ok(translation)
    }

    fn render(&self, query: &SelectQuery, grouped_override: Option<&str>) -> Result<Translation> {
        let series = query
            .measurement
            .rsplit('.')
            .next()
            .unwrap_or(query.measurement.as_str());
        let metric = sanitize_metric(&format!("{series}_{}", query.field.replace('.', "_")));
        let mut warnings = Vec::new();

        let mut aggregations = query
            .aggregations
            .iter()
            .map(|name| {
                map_aggregation(name)
                    .ok_or_else(|| ConvertError::shape(format!("unsupported function {name}()")))
            })
            .collect::<Result<Vec<&str>>>()?;
        if aggregations == ["avg"] {
            aggregations = vec![self.config.default_aggregation_for(&metric)];
        }

        let group_by = query.group_by.as_ref();
        let group_labels: Vec<String> = group_by
            .map(|g| g.labels.iter().map(|label| sanitize_metric(label)).collect())
            .unwrap_or_default();

        if aggregations.is_empty() && !group_labels.is_empty() {
            let fallback = self.config.default_aggregation_for(&metric);
            if fallback == "avg" {
                warnings.push(format!("Using default aggregation of avg for {metric}"));
            }
            aggregations = vec![fallback];
        }

        let filters = classify(&query.predicates, &query.field, query.divide_by_self)?;
        if query.divide_by_self && (filters.condition_count() > 1 || !query.modifications.is_empty())
        {
            return Err(ConvertError::UnsupportedCombination(format!(
                "{}({}) divided by itself combined with conditions or arithmetic",
                query.aggregations.first().map(String::as_str).unwrap_or_default(),
                query.field
            )));
        }
        warnings.extend(filters.warnings.iter().cloned());

        let matchers = filters.labels.iter().cloned().collect::<Vec<_>>().join(",");
        let mut windows = Vec::new();
        let mut expressions = Vec::new();

        for condition in filters.variants() {
            let mut window = group_by.and_then(|g| g.window.clone());
            let mut over_time_fn: Option<String> = None;
            let mut aggregation = aggregations.last().copied().unwrap_or("");

            if group_by.is_some() {
                if window.is_none() {
                    if aggregations.contains(&"count") {
                        window = Some(RANGE.to_string());
                    }
                } else {
                    over_time_fn = over_time_function(&aggregations);
                }
            }

            let mut condition = condition;
            if query.divide_by_self {
                if condition.is_empty() {
                    condition = "!= 0".to_string();
                }
                condition = condition.replacen(' ', " bool ", 1);
            }
            if condition == "> 0" && aggregation == "sum" {
                // Extra zero samples do not change a sum.
                condition.clear();
            }

            let mut outer = String::new();
            if !aggregation.is_empty() {
                if matches!(aggregation, "rate" | "increase") && over_time_fn.is_none() {
                    over_time_fn = Some(aggregation.to_string());
                    aggregation = self.config.default_aggregation_for(&metric);
                    window.get_or_insert_with(|| RATE_INTERVAL.to_string());
                }

                if group_by.is_some() && (!group_labels.is_empty() || over_time_fn.is_some()) {
                    if condition.is_empty() && aggregation == "count" {
                        aggregation = "sum";
                        over_time_fn = Some("count_over_time".to_string());
                    }
                    outer = if group_labels.is_empty() {
                        aggregation.to_string()
                    } else {
                        let name = grouped_override.unwrap_or(aggregation);
                        format!("{name} by ({})", group_labels.join(","))
                    };
                } else {
                    outer = aggregation.to_string();
                }
            }

            if !condition.is_empty()
                && aggregations
                    .iter()
                    .any(|agg| !FILTER_SAFE_AGGREGATIONS.contains(agg))
            {
                // The over-time step would run before the filter.
                over_time_fn = None;
            }

            let mut selector = metric.clone();
            if !matchers.is_empty() {
                selector.push_str(&format!("{{{matchers}}}"));
            }

            if let Some(window) = window.as_mut() {
                let scrape = self.config.scrape_interval_for(&metric);
                if aggregations.iter().any(|agg| matches!(*agg, "rate" | "increase")) {
                    if (window.as_str() == RATE_INTERVAL || window.as_str() == INTERVAL)
                        && scrape == self.config.scrape_interval_secs
                    {
                        *window = RATE_INTERVAL.to_string();
                    } else {
                        windows.push(format_seconds(scrape * 4));
                    }
                } else {
                    windows.push(format_seconds(scrape));
                }
                if over_time_fn.is_some() {
                    selector.push_str(&format!("[{}]", to_interval_placeholder(window)));
                }
                windows.push(window.clone());
            }

            let condition = if condition.is_empty() {
                String::new()
            } else {
                format!(" {condition}")
            };
            let body = match &over_time_fn {
                Some(function) => format!("{function}({selector}){condition}"),
                None => format!("{selector}{condition}"),
            };
            let mut expr = format!("{outer}({body})");
            if !query.modifications.is_empty() {
                expr.push(' ');
                expr.push_str(&query.modifications.join(" "));
            }
            expressions.push(expr);
        }

        let expr = expressions.join(" or ");
        debug!(%metric, %expr, "rendered expression");

        Ok(Translation {
            expr,
            metric,
            windows,
            fills: group_by.map(|g| g.fills.clone()).unwrap_or_default(),
            alias: query.alias.clone(),
            group_labels,
            warnings,
        })
    }
}

/// Picks the range function from the innermost aggregation that has one.
/// `rate`/`increase` anywhere in the chain take precedence.
fn over_time_function(aggregations: &[&str]) -> Option<String> {
    let capable = aggregations
        .iter()
        .rev()
        .find(|agg| OVER_TIME_AGGREGATIONS.contains(*agg))?;
    if aggregations.contains(&"rate") {
        Some("rate".to_string())
    } else if aggregations.contains(&"increase") {
        Some("increase".to_string())
    } else {
        Some(format!("{capable}_over_time"))
    }
}

fn classify(predicates: &[Predicate], field: &str, divide_by_self: bool) -> Result<Filters> {
    let mut filters = Filters::default();
    for predicate in predicates {
        match predicate {
            Predicate::Compare(comparison) => {
                match classify_comparison(comparison, field, divide_by_self)? {
                    Filter::Label(label) => {
                        filters.labels.insert(label);
                    }
                    Filter::Condition(condition) => filters.conditions.push(condition),
                }
            }
            Predicate::Any(comparisons) => {
                let conditions = comparisons
                    .iter()
                    .filter(|c| is_condition(c, field, divide_by_self))
                    .count();
                if conditions == 0 {
                    let label = label_alternation(comparisons, &mut filters.warnings)?;
                    filters.labels.insert(label);
                } else if conditions == comparisons.len() {
                    if !filters.alternatives.is_empty() {
                        return Err(ConvertError::UnsupportedOrGroup(
                            "more than one OR group of value conditions".into(),
                        ));
                    }
                    for comparison in comparisons {
                        if let Filter::Condition(condition) =
                            classify_comparison(comparison, field, divide_by_self)?
                        {
                            filters.alternatives.push(condition);
                        }
                    }
                } else {
                    return Err(ConvertError::UnsupportedOrGroup(
                        "OR mixes tag filters and value conditions".into(),
                    ));
                }
            }
        }
    }
    Ok(filters)
}

fn is_condition(comparison: &Comparison, field: &str, divide_by_self: bool) -> bool {
    comparison.key == field || (divide_by_self && comparison.op.is_ordering())
}

fn classify_comparison(comparison: &Comparison, field: &str, divide_by_self: bool) -> Result<Filter> {
    let Comparison { key, op, value } = comparison;

    if is_condition(comparison, field, divide_by_self) {
        let operator = match op {
            CompareOp::Eq => "==",
            CompareOp::RegexMatch | CompareOp::RegexNotMatch => {
                return Err(ConvertError::shape(format!(
                    "regex condition on selected field {key}"
                )))
            }
            other => other.as_str(),
        };
        return match value {
            Value::Number(number) => Ok(Filter::Condition(format!("{operator} {number}"))),
            Value::Param(param) => Ok(Filter::Condition(format!("{operator} {param}"))),
            other => Err(ConvertError::shape(format!(
                "non-numeric condition {key} {} {}",
                op.as_str(),
                other.text()
            ))),
        };
    }

    if op.is_ordering() {
        return Err(ConvertError::AmbiguousLabelFilter(format!(
            "{key} {} {} does not filter the selected field {field}",
            op.as_str(),
            value.text()
        )));
    }

    let label = label_name(key);
    let rendered = if op.is_regex() {
        escape_regex(&anchor_regex(value.text()).pattern)
    } else {
        quote_label_value(value.text())
    };
    Ok(Filter::Label(format!("{label}{}\"{rendered}\"", op.as_str())))
}

fn label_name(key: &str) -> String {
    key.replace('-', "_")
}

/// Unifies `key = a OR key = b` (or the `=~` equivalent) into one regex
/// matcher.
fn label_alternation(comparisons: &[Comparison], warnings: &mut Vec<String>) -> Result<String> {
    let mut keys = comparisons.iter().map(|c| c.key.as_str());
    let key = keys.next().unwrap_or_default();
    if keys.any(|other| other != key) {
        return Err(ConvertError::UnsupportedOrGroup(
            "OR over different tag keys".into(),
        ));
    }
    let label = label_name(key);

    if comparisons.iter().all(|c| c.op == CompareOp::Eq) {
        let values = comparisons
            .iter()
            .map(|c| quote_label_value(c.value.text()))
            .collect::<Vec<_>>()
            .join("|");
        return Ok(format!("{label}=~\"{values}\""));
    }

    if comparisons.iter().all(|c| c.op == CompareOp::RegexMatch) {
        let anchored: Vec<AnchoredRegex> = comparisons
            .iter()
            .map(|c| anchor_regex(c.value.text()))
            .collect();
        let starts = anchored.iter().filter(|a| a.anchored_start).count();
        let ends = anchored.iter().filter(|a| a.anchored_end).count();
        if starts != 0 && starts != anchored.len() {
            warnings.push(format!(
                "Start boundaries differ in OR group on {key} - resulting regex may match more than intended"
            ));
        }
        if ends != 0 && ends != anchored.len() {
            warnings.push(format!(
                "End boundaries differ in OR group on {key} - resulting regex may match more than intended"
            ));
        }
        let union = anchored
            .into_iter()
            .map(|a| a.pattern)
            .collect::<Vec<_>>()
            .join("|");
        return Ok(format!("{label}=~\"{}\"", escape_regex(&format!("({union})"))));
    }

    Err(ConvertError::UnsupportedOrGroup(format!(
        "OR on {key} mixes operators"
    )))
}

struct AnchoredRegex {
    pattern: String,
    anchored_start: bool,
    anchored_end: bool,
}

/// InfluxQL regexes match anywhere while PromQL matchers are fully
/// anchored, so unanchored ends are padded with `.*`.
fn anchor_regex(raw: &str) -> AnchoredRegex {
    let mut pattern = raw.to_string();

    let anchored_start = pattern.starts_with('^');
    if anchored_start {
        pattern.remove(0);
    } else if !pattern.starts_with(".*") {
        pattern.insert_str(0, ".*");
    }

    let anchored_end = pattern.ends_with('$') && !pattern.ends_with("\\$");
    if anchored_end {
        pattern.pop();
    } else if !pattern.ends_with(".*") {
        pattern.push_str(".*");
    }

    AnchoredRegex {
        pattern,
        anchored_start,
        anchored_end,
    }
}

/// Escapes a value for a double-quoted PromQL string.
fn quote_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Escaped slashes are only needed inside InfluxQL `/.../` literals; what
/// remains is quoted for a PromQL string.
fn escape_regex(pattern: &str) -> String {
    quote_label_value(&pattern.replace("\\/", "/"))
}
