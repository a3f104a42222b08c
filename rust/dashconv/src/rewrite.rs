//! Query rewrites applied before the general parser.
//!
//! A few projection shapes that dashboards use are outside what the parser
//! accepts but have a known PromQL rendering. Each rule matches the
//! projection (the text between `SELECT` and `FROM`), translates a simpler
//! query through the regular pipeline and patches the result. A rule may
//! decline by returning `Ok(None)`, in which case the next rule, and finally
//! the parser, gets the query.

use crate::{
    error::{ConvertError, Result},
    influxql::parse,
    promql::{ExpressionBuilder, Translation},
};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::debug;

type RewriteFn = fn(&ExpressionBuilder<'_>, &Captures<'_>, &str) -> Result<Option<Translation>>;

pub struct RewriteRule {
    pub name: &'static str,
    matcher: &'static Lazy<Regex>,
    rewrite: RewriteFn,
}

static SELECT_SPLIT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)^\s*SELECT\s+(.*?)\s+FROM\s+(.*)$").expect("valid select split regex")
});

static WHITESPACE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));

/// `f("a") / f("b") * N`
static FIELD_RATIO: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^(\w+)\("([^"]+)"\) ?/ ?(\w+)\("([^"]+)"\) ?\* ?([0-9]+(?:\.[0-9]+)?)$"#)
        .expect("valid ratio regex")
});

/// `N op <expression>`
static CONSTANT_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([0-9]+(?:\.[0-9]+)?) ?([-+*/]) ?(.+)$").expect("valid constant prefix regex")
});

pub static RULES: &[RewriteRule] = &[
    RewriteRule {
        name: "field_ratio",
        matcher: &FIELD_RATIO,
        rewrite: field_ratio,
    },
    RewriteRule {
        name: "constant_prefix",
        matcher: &CONSTANT_PREFIX,
        rewrite: constant_prefix,
    },
];

/// Translates a raw InfluxQL query string, trying the rewrite table first.
pub fn translate_raw(builder: &ExpressionBuilder<'_>, query: &str) -> Result<Translation> {
    if let Some(split) = SELECT_SPLIT.captures(query) {
        let projection = WHITESPACE.replace_all(split[1].trim(), " ");
        let from_tail = &split[2];
        for rule in RULES {
            let Some(captures) = rule.matcher.captures(&projection) else {
                continue;
            };
            if let Some(translation) = (rule.rewrite)(builder, &captures, from_tail)? {
                debug!(rule = rule.name, expr = %translation.expr, "applied rewrite rule");
                return Ok(translation);
            }
        }
    }
    builder.translate(&parse(query)?)
}

fn translate_projection(
    builder: &ExpressionBuilder<'_>,
    projection: &str,
    from_tail: &str,
) -> Result<Translation> {
    builder.translate(&parse(&format!("SELECT {projection} FROM {from_tail}"))?)
}

/// Both fields are windowed the same way and divided inside the outer
/// aggregation. A missing denominator sample yields `+Inf`, which is
/// filtered out.
fn field_ratio(
    builder: &ExpressionBuilder<'_>,
    captures: &Captures<'_>,
    from_tail: &str,
) -> Result<Option<Translation>> {
    let (function, numerator) = (&captures[1], &captures[2]);
    let (divisor_function, denominator) = (&captures[3], &captures[4]);
    let factor = &captures[5];
    if !function.eq_ignore_ascii_case(divisor_function) || numerator == denominator {
        return Ok(None);
    }

    let mut translation =
        translate_projection(builder, &format!("{function}(\"{numerator}\")"), from_tail)?;
    let denominator_metric =
        translate_projection(builder, &format!("{function}(\"{denominator}\")"), from_tail)?.metric;

    let selector = Regex::new(&format!(
        r"(\w+)\({}((?:\{{[^}}]*\}})?\[[^\]]+\])\)",
        regex::escape(&translation.metric)
    ))
    .map_err(|err| ConvertError::shape(format!("ratio selector: {err}")))?;
    if !selector.is_match(&translation.expr) {
        return Err(ConvertError::shape(format!(
            "ratio of {numerator} and {denominator} needs a time-windowed aggregation"
        )));
    }

    let numerator_metric = translation.metric.clone();
    let expr = selector
        .replacen(&translation.expr, 1, |window: &Captures<'_>| {
            let (over_time, range) = (&window[1], &window[2]);
            format!(
                "{over_time}({numerator_metric}{range}) / {over_time}({denominator_metric}{range}) * {factor}"
            )
        })
        .into_owned();
    translation.expr = format!("{expr} != Inf");
    Ok(Some(translation))
}

fn constant_prefix(
    builder: &ExpressionBuilder<'_>,
    captures: &Captures<'_>,
    from_tail: &str,
) -> Result<Option<Translation>> {
    let (constant, op, rest) = (&captures[1], &captures[2], &captures[3]);
    let mut translation = translate_projection(builder, rest, from_tail)?;
    translation.expr = format!("{constant} {op} {}", translation.expr);
    Ok(Some(translation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConverterConfig;
    use pretty_assertions::assert_eq;

    fn translate(query: &str) -> Result<Translation> {
        let config = ConverterConfig::default();
        translate_raw(&ExpressionBuilder::new(&config), query)
    }

    #[test]
    fn ratio_of_two_fields_divides_inside_aggregation() {
        let translation = translate(
            r#"SELECT mean("num_fds") / mean("rlimit_num_fds_soft") * 100 FROM "procstat" WHERE "host" = 'a' AND $timeFilter GROUP BY time($__interval), "host""#,
        )
        .unwrap();
        assert_eq!(
            translation.expr,
            r#"avg by (host)(avg_over_time(procstat_num_fds{host="a"}[$__interval]) / avg_over_time(procstat_rlimit_num_fds_soft{host="a"}[$__interval]) * 100) != Inf"#
        );
        assert_eq!(translation.metric, "procstat_num_fds");
    }

    #[test]
    fn ratio_without_window_is_rejected() {
        let err = translate(r#"SELECT mean("a") / mean("b") * 100 FROM "m""#).unwrap_err();
        assert!(matches!(err, ConvertError::UnrecognizedShape(_)));
    }

    #[test]
    fn ratio_of_a_field_with_itself_falls_through() {
        let err = translate(r#"SELECT max("a") / max("a") * 100 FROM "m""#).unwrap_err();
        assert!(matches!(err, ConvertError::UnsupportedCombination(_)));
    }

    #[test]
    fn constant_prefix_wraps_translated_expression() {
        let translation = translate(
            r#"SELECT 100 - mean("usage_idle") FROM "cpu" WHERE $timeFilter GROUP BY time($__interval)"#,
        )
        .unwrap();
        assert_eq!(
            translation.expr,
            "100 - avg(avg_over_time(cpu_usage_idle[$__interval]))"
        );
    }

    #[test]
    fn other_queries_use_the_parser() {
        let translation = translate(r#"SELECT max("v")   FROM "m""#).unwrap();
        assert_eq!(translation.expr, "max(m_v)");
        assert!(translate("DROP MEASUREMENT m").is_err());
    }

    #[test]
    fn rules_are_ordered() {
        let names: Vec<_> = RULES.iter().map(|rule| rule.name).collect();
        assert_eq!(names, vec!["field_ratio", "constant_prefix"]);
    }
}
