//! Lowering of Grafana's structured InfluxQL query editor targets.
//!
//! A structured target describes the query as JSON (`measurement`, `select`,
//! `tags`, `groupBy`) instead of a query string. It is lowered straight into
//! a [`SelectQuery`] so both target flavors share one code generator.

use super::{
    ast::{map_aggregation, CompareOp, Comparison, GroupBy, Predicate, SelectQuery, Value},
    lexer::{tokenize, Token},
};
use crate::{
    duration::normalize_window,
    error::{ConvertError, Result},
};
use serde_json::Value as Json;

#[derive(Debug, Clone, PartialEq)]
pub struct LoweredTarget {
    pub query: SelectQuery,
    /// Editor items that were dropped because they have no counterpart.
    pub dropped: Vec<String>,
}

pub fn lower_target(target: &Json) -> Result<LoweredTarget> {
    let measurement = target
        .get("measurement")
        .and_then(Json::as_str)
        .filter(|m| !m.is_empty())
        .ok_or_else(|| ConvertError::MissingRequiredField("measurement".into()))?;

    let selects = target
        .get("select")
        .and_then(Json::as_array)
        .ok_or_else(|| ConvertError::MissingRequiredField("select".into()))?;
    let items = match selects.as_slice() {
        [single] => single
            .as_array()
            .ok_or_else(|| ConvertError::shape("select entry is not a list"))?,
        [] => return Err(ConvertError::MissingRequiredField("select".into())),
        _ => return Err(ConvertError::shape("multiple select projections")),
    };

    let mut query = SelectQuery {
        measurement: measurement.to_string(),
        ..SelectQuery::default()
    };
    let mut dropped = Vec::new();

    for item in items {
        let kind = item_type(item)?;
        match kind.as_str() {
            "field" => {
                query.field = strip_type_hint(&first_param(item).unwrap_or_default()).to_string();
            }
            "math" => {
                let expression = first_param(item).unwrap_or_default();
                query.modifications.extend(parse_math(&expression)?);
            }
            "alias" => query.alias = first_param(item),
            "distinct" => dropped.push("distinct".to_string()),
            name if map_aggregation(name).is_some() => query.aggregations.push(name.to_string()),
            other => {
                return Err(ConvertError::shape(format!("unknown select item type {other:?}")))
            }
        }
    }
    if query.field.is_empty() {
        return Err(ConvertError::MissingRequiredField("field".into()));
    }
    // The editor lists functions innermost first.
    query.aggregations.reverse();

    query.predicates = lower_tags(target.get("tags"))?;
    query.group_by = lower_group_by(target.get("groupBy"))?;

    Ok(LoweredTarget { query, dropped })
}

fn item_type(item: &Json) -> Result<String> {
    item.get("type")
        .and_then(Json::as_str)
        .map(str::to_ascii_lowercase)
        .ok_or_else(|| ConvertError::shape("select item without a type"))
}

fn first_param(item: &Json) -> Option<String> {
    let param = item.get("params")?.as_array()?.first()?;
    match param {
        Json::String(s) => Some(s.clone()),
        Json::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn strip_type_hint(name: &str) -> &str {
    name.trim_end_matches("::tag").trim_end_matches("::field")
}

/// Parses editor math such as `* 8` or `/ 1024 * 100`.
fn parse_math(expression: &str) -> Result<Vec<String>> {
    let mut tokens = tokenize(expression)?.into_iter().peekable();
    let mut modifications = Vec::new();
    while let Some(token) = tokens.next() {
        let op = match token {
            Token::Star => "*",
            Token::Slash => "/",
            Token::Plus => "+",
            Token::Minus => "-",
            other => return Err(ConvertError::shape(format!("unsupported math {other:?}"))),
        };
        let operand = match tokens.next() {
            Some(Token::Number(n) | Token::Param(n)) => n,
            Some(Token::Minus) => match tokens.next() {
                Some(Token::Number(n)) => format!("-{n}"),
                _ => return Err(ConvertError::shape(format!("unsupported math {expression:?}"))),
            },
            _ => return Err(ConvertError::shape(format!("unsupported math {expression:?}"))),
        };
        modifications.push(format!("{op} {operand}"));
    }
    Ok(modifications)
}

fn lower_tags(tags: Option<&Json>) -> Result<Vec<Predicate>> {
    let Some(tags) = tags.and_then(Json::as_array) else {
        return Ok(Vec::new());
    };

    let comparisons = tags.iter().map(lower_tag).collect::<Result<Vec<_>>>()?;
    let any_or = tags
        .iter()
        .any(|tag| tag.get("condition").and_then(Json::as_str) == Some("OR"));

    if any_or && comparisons.len() > 1 {
        Ok(vec![Predicate::Any(comparisons)])
    } else {
        Ok(comparisons.into_iter().map(Predicate::Compare).collect())
    }
}

fn lower_tag(tag: &Json) -> Result<Comparison> {
    let key = tag
        .get("key")
        .and_then(Json::as_str)
        .ok_or_else(|| ConvertError::MissingRequiredField("tag key".into()))?;
    let raw_value = tag.get("value").and_then(Json::as_str).unwrap_or_default();
    let op = match tag.get("operator").and_then(Json::as_str).unwrap_or("=") {
        "=" => CompareOp::Eq,
        "!=" | "<>" => CompareOp::NotEq,
        "=~" => CompareOp::RegexMatch,
        "!~" => CompareOp::RegexNotMatch,
        "<" => CompareOp::Lt,
        ">" => CompareOp::Gt,
        "<=" => CompareOp::LtEq,
        ">=" => CompareOp::GtEq,
        other => return Err(ConvertError::shape(format!("unknown tag operator {other:?}"))),
    };

    let value = if op.is_regex() {
        let trimmed = raw_value.trim();
        let body = trimmed
            .strip_prefix('/')
            .and_then(|rest| rest.strip_suffix('/'))
            .unwrap_or(trimmed);
        Value::Regex(body.to_string())
    } else if op.is_ordering() && raw_value.trim().parse::<f64>().is_ok() {
        Value::Number(raw_value.trim().to_string())
    } else {
        Value::Str(strip_type_hint(raw_value).to_string())
    };

    Ok(Comparison {
        key: strip_type_hint(key).to_string(),
        op,
        value,
    })
}

fn lower_group_by(groups: Option<&Json>) -> Result<Option<GroupBy>> {
    let Some(groups) = groups.and_then(Json::as_array) else {
        return Ok(None);
    };

    let mut group_by = GroupBy::default();
    for group in groups {
        let param = first_param(group).unwrap_or_default();
        match item_type(group)?.as_str() {
            "time" => group_by.window = Some(normalize_window(&param)),
            "tag" => group_by.labels.push(strip_type_hint(&param).to_string()),
            "fill" => group_by.fills.push(param),
            other => return Err(ConvertError::shape(format!("unknown group type {other:?}"))),
        }
    }

    // A lone fill() does not make a grouped query.
    if group_by.window.is_none() && group_by.labels.is_empty() {
        return Ok(None);
    }
    Ok(Some(group_by))
}
