//! Typed shapes recognized in InfluxQL dashboard queries.

use serde::Serialize;

/// Every query the converter understands is one of these.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryShape {
    Select(SelectQuery),
    Subquery(SubqueryDownsample),
    Discovery(DiscoveryQuery),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SelectQuery {
    /// Last segment of the `FROM` path; retention policy and database are dropped.
    pub measurement: String,
    pub field: String,
    /// InfluxQL function names applied to the field, outermost first.
    pub aggregations: Vec<String>,
    /// `f(x) / f(x)`: the result is a 0/1 presence signal.
    pub divide_by_self: bool,
    /// Trailing arithmetic such as `* 8` or `/ 1024`.
    pub modifications: Vec<String>,
    pub alias: Option<String>,
    /// Conjunction of `WHERE` predicates, time filters removed.
    pub predicates: Vec<Predicate>,
    pub group_by: Option<GroupBy>,
}

/// `SELECT SUM("k") FROM (<inner> GROUP BY ...) GROUP BY ...`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubqueryDownsample {
    pub outer_field: String,
    /// Inner select with the outer grouping applied in place of its own.
    pub inner: SelectQuery,
    pub inner_group_by: GroupBy,
}

/// `SHOW TAG VALUES [FROM <m>] WITH KEY (=|=~) <key>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveryQuery {
    pub measurement: Option<String>,
    pub key: String,
    pub regex_key: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GroupBy {
    pub labels: Vec<String>,
    /// Canonical window token, e.g. `5m` or `$__interval`.
    pub window: Option<String>,
    pub fills: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    Compare(Comparison),
    /// Comparisons joined by `OR`.
    Any(Vec<Comparison>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Comparison {
    pub key: String,
    pub op: CompareOp,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CompareOp {
    Eq,
    NotEq,
    RegexMatch,
    RegexNotMatch,
    Lt,
    Gt,
    LtEq,
    GtEq,
}

impl CompareOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::NotEq => "!=",
            CompareOp::RegexMatch => "=~",
            CompareOp::RegexNotMatch => "!~",
            CompareOp::Lt => "<",
            CompareOp::Gt => ">",
            CompareOp::LtEq => "<=",
            CompareOp::GtEq => ">=",
        }
    }

    pub fn is_ordering(&self) -> bool {
        matches!(
            self,
            CompareOp::Lt | CompareOp::Gt | CompareOp::LtEq | CompareOp::GtEq
        )
    }

    pub fn is_regex(&self) -> bool {
        matches!(self, CompareOp::RegexMatch | CompareOp::RegexNotMatch)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Str(String),
    Regex(String),
    Number(String),
    Ident(String),
    Param(String),
}

impl Value {
    pub fn text(&self) -> &str {
        match self {
            Value::Str(v) | Value::Regex(v) | Value::Number(v) | Value::Ident(v) | Value::Param(v) => {
                v.as_str()
            }
        }
    }
}

/// Maps an InfluxQL function to the PromQL aggregation approximating it.
pub fn map_aggregation(name: &str) -> Option<&'static str> {
    let mapped = match name.to_ascii_lowercase().as_str() {
        "count" => "count",
        "max" => "max",
        "min" => "min",
        "median" => "avg",
        "mean" => "avg",
        "non_negative_derivative" => "rate",
        "non_negative_difference" => "increase",
        "percentile" => "avg",
        "stddev" => "stddev",
        "sum" => "sum",
        "last" => "avg",
        "moving_average" => "avg",
        "derivative" => "rate",
        "difference" => "delta",
        _ => return None,
    };
    Some(mapped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregation_table_is_total_and_stable() {
        let expected = [
            ("count", "count"),
            ("max", "max"),
            ("min", "min"),
            ("median", "avg"),
            ("mean", "avg"),
            ("non_negative_derivative", "rate"),
            ("non_negative_difference", "increase"),
            ("percentile", "avg"),
            ("stddev", "stddev"),
            ("sum", "sum"),
            ("last", "avg"),
            ("moving_average", "avg"),
            ("derivative", "rate"),
            ("difference", "delta"),
        ];
        for (name, mapped) in expected {
            for _ in 0..3 {
                assert_eq!(map_aggregation(name), Some(mapped), "{name}");
            }
            assert_eq!(map_aggregation(&name.to_uppercase()), Some(mapped));
        }
        assert_eq!(map_aggregation("spread"), None);
    }

    #[test]
    fn ordering_operators() {
        assert!(CompareOp::Gt.is_ordering());
        assert!(!CompareOp::Eq.is_ordering());
        assert!(CompareOp::RegexNotMatch.is_regex());
    }
}
