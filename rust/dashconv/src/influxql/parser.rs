//! Recursive-descent parser producing a [`QueryShape`].
//!
//! Only the shapes dashboards actually use are accepted: a single projected
//! field wrapped in known functions, optional arithmetic with a constant or a
//! division by itself, a `WHERE` tree of tag/value comparisons, and a
//! `GROUP BY` of time, fill and tag items. Anything else is rejected with
//! [`ConvertError::UnrecognizedShape`] instead of being guessed at.

use super::{
    ast::{
        map_aggregation, CompareOp, Comparison, DiscoveryQuery, GroupBy, Predicate, QueryShape,
        SelectQuery, SubqueryDownsample, Value,
    },
    lexer::{tokenize, Token},
};
use crate::{
    duration::normalize_window,
    error::{ConvertError, Result},
};

pub fn parse(query: &str) -> Result<QueryShape> {
    let mut parser = Parser::new(tokenize(query)?);
    if parser.eat_keyword("SELECT") {
        let shape = parser.parse_select()?;
        parser.finish()?;
        Ok(shape)
    } else if parser.eat_keyword("SHOW") {
        parser.parse_discovery().map(QueryShape::Discovery)
    } else {
        Err(ConvertError::shape(format!(
            "expected SELECT or SHOW in {query:?}"
        )))
    }
}

#[derive(Debug, PartialEq)]
struct Operand {
    field: String,
    aggregations: Vec<String>,
}

#[derive(Debug)]
struct Projection {
    operand: Operand,
    divide_by_self: bool,
    modifications: Vec<String>,
    alias: Option<String>,
}

#[derive(Debug)]
enum Condition {
    Always,
    Compare(Comparison),
    And(Vec<Condition>),
    Or(Vec<Condition>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        self.peek().is_some_and(|token| token.is_keyword(keyword))
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.at_keyword(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<()> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.unexpected(keyword))
        }
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<()> {
        if self.eat(&expected) {
            Ok(())
        } else {
            Err(self.unexpected(what))
        }
    }

    fn unexpected(&self, wanted: &str) -> ConvertError {
        match self.peek() {
            Some(token) => ConvertError::shape(format!("expected {wanted}, found {token:?}")),
            None => ConvertError::shape(format!("expected {wanted}, found end of query")),
        }
    }

    fn finish(&mut self) -> Result<()> {
        while self.eat(&Token::Semicolon) {}
        match self.peek() {
            None => Ok(()),
            Some(token) => Err(ConvertError::shape(format!(
                "unexpected trailing {token:?}"
            ))),
        }
    }

    /// Called with `SELECT` already consumed.
    fn parse_select(&mut self) -> Result<QueryShape> {
        let projection = self.parse_projection()?;
        if self.peek() == Some(&Token::Comma) {
            return Err(ConvertError::shape("multiple select projections"));
        }
        self.expect_keyword("FROM")?;

        if self.eat(&Token::LParen) {
            return self.parse_subquery(projection);
        }

        let measurement = self.parse_measurement()?;
        let predicates = self.parse_where()?;
        let group_by = self.parse_group_by()?;
        self.skip_trailing_clauses()?;

        Ok(QueryShape::Select(SelectQuery {
            measurement,
            field: projection.operand.field,
            aggregations: projection.operand.aggregations,
            divide_by_self: projection.divide_by_self,
            modifications: projection.modifications,
            alias: projection.alias,
            predicates,
            group_by,
        }))
    }

    fn parse_subquery(&mut self, outer: Projection) -> Result<QueryShape> {
        let downsampled = outer.operand.aggregations.len() == 1
            && outer.operand.aggregations[0] == "sum"
            && !outer.divide_by_self
            && outer.modifications.is_empty();
        if !downsampled {
            return Err(ConvertError::shape(
                "only SUM over a grouped subquery is supported",
            ));
        }

        self.expect_keyword("SELECT")?;
        let mut inner = match self.parse_select()? {
            QueryShape::Select(select) => select,
            _ => return Err(ConvertError::shape("nested subqueries are not supported")),
        };
        self.expect(Token::RParen, "closing parenthesis of subquery")?;

        if !self.parse_where()?.is_empty() {
            return Err(ConvertError::shape("conditions outside a subquery"));
        }
        let outer_group_by = self
            .parse_group_by()?
            .ok_or_else(|| ConvertError::shape("subquery without outer GROUP BY"))?;
        self.skip_trailing_clauses()?;

        let inner_group_by = inner
            .group_by
            .replace(outer_group_by)
            .ok_or_else(|| ConvertError::shape("subquery without inner GROUP BY"))?;

        Ok(QueryShape::Subquery(SubqueryDownsample {
            outer_field: outer.operand.field,
            inner,
            inner_group_by,
        }))
    }

    fn parse_projection(&mut self) -> Result<Projection> {
        let operand = self.parse_operand()?;
        let mut divide_by_self = false;
        let mut modifications = Vec::new();

        loop {
            let op = match self.peek() {
                Some(Token::Star) => "*",
                Some(Token::Slash) => "/",
                Some(Token::Plus) => "+",
                Some(Token::Minus) => "-",
                _ => break,
            };
            self.pos += 1;

            if let Some(constant) = self.parse_constant() {
                modifications.push(format!("{op} {constant}"));
                continue;
            }

            if op == "/" && !divide_by_self && modifications.is_empty() {
                let divisor = self.parse_operand()?;
                if divisor == operand {
                    divide_by_self = true;
                    continue;
                }
            }
            return Err(ConvertError::shape(
                "arithmetic between different fields is not supported",
            ));
        }

        let alias = if self.eat_keyword("AS") {
            match self.advance() {
                Some(Token::Ident(name) | Token::QuotedIdent(name) | Token::Str(name)) => {
                    Some(name)
                }
                _ => return Err(ConvertError::shape("AS without an alias name")),
            }
        } else {
            None
        };

        Ok(Projection {
            operand,
            divide_by_self,
            modifications,
            alias,
        })
    }

    fn parse_operand(&mut self) -> Result<Operand> {
        let call = self.peek_at(1) == Some(&Token::LParen);
        match (self.peek().cloned(), call) {
            (Some(Token::Ident(name)), true) => {
                if map_aggregation(&name).is_none() {
                    return Err(ConvertError::shape(format!(
                        "unsupported function {name}()"
                    )));
                }
                self.pos += 2;
                if self.peek() == Some(&Token::Star) {
                    return Err(ConvertError::shape(format!(
                        "wildcard {name}(*) selections are not supported"
                    )));
                }
                let inner = self.parse_operand()?;
                while self.eat(&Token::Comma) {
                    self.skip_function_argument()?;
                }
                self.expect(Token::RParen, "closing parenthesis of function call")?;

                let mut aggregations = vec![name.to_ascii_lowercase()];
                aggregations.extend(inner.aggregations);
                Ok(Operand {
                    field: inner.field,
                    aggregations,
                })
            }
            (Some(Token::QuotedIdent(field) | Token::Ident(field)), _) => {
                self.pos += 1;
                self.skip_type_hint();
                Ok(Operand {
                    field,
                    aggregations: Vec::new(),
                })
            }
            (Some(Token::Star), _) => Err(ConvertError::shape(
                "wildcard (*) selections are not supported",
            )),
            _ => Err(self.unexpected("field or function")),
        }
    }

    /// Extra function parameters (`percentile(x, 95)`, `derivative(x, 1s)`)
    /// carry nothing the destination can use.
    fn skip_function_argument(&mut self) -> Result<()> {
        self.eat(&Token::Minus);
        match self.advance() {
            Some(
                Token::Number(_)
                | Token::Duration(_)
                | Token::Str(_)
                | Token::Ident(_)
                | Token::QuotedIdent(_)
                | Token::Param(_),
            ) => Ok(()),
            _ => Err(ConvertError::shape("unsupported function argument")),
        }
    }

    fn skip_type_hint(&mut self) {
        if self.peek() == Some(&Token::DoubleColon) && matches!(self.peek_at(1), Some(Token::Ident(_))) {
            self.pos += 2;
        }
    }

    fn parse_constant(&mut self) -> Option<String> {
        match (self.peek(), self.peek_at(1)) {
            (Some(Token::Number(n) | Token::Param(n)), _) => {
                let constant = n.clone();
                self.pos += 1;
                Some(constant)
            }
            (Some(Token::Minus), Some(Token::Number(n))) => {
                let constant = format!("-{n}");
                self.pos += 2;
                Some(constant)
            }
            _ => None,
        }
    }

    fn parse_measurement(&mut self) -> Result<String> {
        let mut segment = self.parse_path_segment()?;
        while self.eat(&Token::Dot) {
            segment = self.parse_path_segment()?;
        }
        Ok(segment)
    }

    fn parse_path_segment(&mut self) -> Result<String> {
        match self.advance() {
            Some(Token::QuotedIdent(name) | Token::Ident(name) | Token::Param(name)) => Ok(name),
            Some(Token::Regex(_)) => Err(ConvertError::shape(
                "regex measurements are not supported",
            )),
            _ => Err(ConvertError::shape("expected measurement name")),
        }
    }

    fn parse_where(&mut self) -> Result<Vec<Predicate>> {
        if !self.eat_keyword("WHERE") {
            return Ok(Vec::new());
        }
        let condition = self.parse_or()?;
        let mut predicates = Vec::new();
        flatten(condition, &mut predicates)?;
        Ok(predicates)
    }

    fn parse_or(&mut self) -> Result<Condition> {
        let mut items = vec![self.parse_and()?];
        while self.eat_keyword("OR") {
            items.push(self.parse_and()?);
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            Condition::Or(items)
        })
    }

    fn parse_and(&mut self) -> Result<Condition> {
        let mut items = vec![self.parse_primary()?];
        while self.eat_keyword("AND") {
            items.push(self.parse_primary()?);
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            Condition::And(items)
        })
    }

    fn parse_primary(&mut self) -> Result<Condition> {
        if self.eat(&Token::LParen) {
            let inner = self.parse_or()?;
            self.expect(Token::RParen, "closing parenthesis")?;
            return Ok(inner);
        }

        let key = match self.advance() {
            Some(Token::Param(param)) if !self.at_comparison() => {
                return if param.eq_ignore_ascii_case("$timeFilter") {
                    Ok(Condition::Always)
                } else {
                    Err(ConvertError::shape(format!("unexpected variable {param}")))
                };
            }
            Some(Token::QuotedIdent(key) | Token::Ident(key) | Token::Param(key)) => key,
            _ => return Err(ConvertError::shape("expected condition")),
        };
        self.skip_type_hint();

        if key.eq_ignore_ascii_case("time") {
            self.skip_time_bound();
            return Ok(Condition::Always);
        }

        let op = match self.advance() {
            Some(Token::Eq) => CompareOp::Eq,
            Some(Token::NotEq) => CompareOp::NotEq,
            Some(Token::RegexMatch) => CompareOp::RegexMatch,
            Some(Token::RegexNotMatch) => CompareOp::RegexNotMatch,
            Some(Token::Lt) => CompareOp::Lt,
            Some(Token::Gt) => CompareOp::Gt,
            Some(Token::LtEq) => CompareOp::LtEq,
            Some(Token::GtEq) => CompareOp::GtEq,
            Some(Token::LtGt) => {
                return Err(ConvertError::shape("`<>` is not supported, use != instead"))
            }
            _ => return Err(ConvertError::shape(format!("missing operator after {key}"))),
        };

        let value = match self.advance() {
            Some(Token::Str(v)) => Value::Str(v),
            Some(Token::Regex(v)) => Value::Regex(v),
            Some(Token::Number(v)) => Value::Number(v),
            Some(Token::Minus) => match self.advance() {
                Some(Token::Number(v)) => Value::Number(format!("-{v}")),
                _ => return Err(ConvertError::shape("expected number after '-'")),
            },
            Some(Token::Param(v)) => Value::Param(v),
            Some(Token::Ident(v) | Token::QuotedIdent(v) | Token::Duration(v)) => Value::Ident(v),
            _ => return Err(ConvertError::shape(format!("missing value for {key}"))),
        };

        if op.is_regex() != matches!(value, Value::Regex(_)) {
            return Err(ConvertError::shape(format!(
                "operator {} does not fit value {:?}",
                op.as_str(),
                value.text()
            )));
        }

        Ok(Condition::Compare(Comparison { key, op, value }))
    }

    fn at_comparison(&self) -> bool {
        matches!(
            self.peek(),
            Some(
                Token::Eq
                    | Token::NotEq
                    | Token::RegexMatch
                    | Token::RegexNotMatch
                    | Token::Lt
                    | Token::Gt
                    | Token::LtEq
                    | Token::GtEq
                    | Token::LtGt
            )
        )
    }

    /// Consumes `> now() - 1h` style bounds; the dashboard time picker owns
    /// the range after conversion.
    fn skip_time_bound(&mut self) {
        let mut depth = 0usize;
        while let Some(token) = self.peek() {
            match token {
                Token::LParen => depth += 1,
                Token::RParen if depth == 0 => break,
                Token::RParen => depth -= 1,
                token
                    if depth == 0
                        && ["AND", "OR", "GROUP", "ORDER", "LIMIT", "SLIMIT", "FILL"]
                            .iter()
                            .any(|keyword| token.is_keyword(keyword)) =>
                {
                    break
                }
                _ => {}
            }
            self.pos += 1;
        }
    }

    fn parse_group_by(&mut self) -> Result<Option<GroupBy>> {
        if !self.eat_keyword("GROUP") {
            return Ok(None);
        }
        self.expect_keyword("BY")?;

        let mut group_by = GroupBy::default();
        loop {
            let call = self.peek_at(1) == Some(&Token::LParen);
            match (self.peek().cloned(), call) {
                (Some(token), true) if token.is_keyword("time") => {
                    self.pos += 2;
                    let window = match self.advance() {
                        Some(Token::Duration(w) | Token::Param(w) | Token::Ident(w)) => w,
                        _ => return Err(ConvertError::shape("unparseable time() grouping")),
                    };
                    // Offsets such as `time(1h, 15m)` are dropped.
                    while self.eat(&Token::Comma) {
                        self.skip_function_argument()?;
                    }
                    self.expect(Token::RParen, "closing parenthesis of time()")?;
                    group_by.window = Some(normalize_window(&window));
                }
                (Some(token), true) if token.is_keyword("fill") => {
                    self.pos += 2;
                    let fill = match self.advance() {
                        Some(Token::Ident(f) | Token::Number(f)) => f,
                        Some(Token::Minus) => match self.advance() {
                            Some(Token::Number(f)) => format!("-{f}"),
                            _ => return Err(ConvertError::shape("unparseable fill()")),
                        },
                        _ => return Err(ConvertError::shape("unparseable fill()")),
                    };
                    self.expect(Token::RParen, "closing parenthesis of fill()")?;
                    group_by.fills.push(fill);
                }
                (Some(token), true) if token.is_keyword("tz") => break,
                (Some(Token::QuotedIdent(label) | Token::Ident(label) | Token::Param(label)), _)
                    if !is_clause_keyword(&label) =>
                {
                    self.pos += 1;
                    self.skip_type_hint();
                    group_by.labels.push(label);
                }
                (Some(Token::Star), _) => {
                    return Err(ConvertError::shape("GROUP BY * is not supported"))
                }
                _ => break,
            }
            self.eat(&Token::Comma);
        }

        Ok(Some(group_by))
    }

    /// Accepts `ORDER BY time [ASC|DESC]`, `LIMIT n`, `SLIMIT n` and
    /// `tz('...')`; none of them change the converted expression.
    fn skip_trailing_clauses(&mut self) -> Result<()> {
        loop {
            if self.eat_keyword("ORDER") {
                self.expect_keyword("BY")?;
                self.expect_keyword("time")?;
                if !self.eat_keyword("ASC") {
                    self.eat_keyword("DESC");
                }
            } else if self.at_keyword("LIMIT")
                || self.at_keyword("SLIMIT")
                || self.at_keyword("OFFSET")
                || self.at_keyword("SOFFSET")
            {
                self.pos += 1;
                match self.advance() {
                    Some(Token::Number(_) | Token::Param(_)) => {}
                    _ => return Err(ConvertError::shape("expected number after LIMIT")),
                }
            } else if self.at_keyword("tz") && self.peek_at(1) == Some(&Token::LParen) {
                self.pos += 2;
                match self.advance() {
                    Some(Token::Str(_)) => {}
                    _ => return Err(ConvertError::shape("expected time zone name")),
                }
                self.expect(Token::RParen, "closing parenthesis of tz()")?;
            } else {
                return Ok(());
            }
        }
    }

    /// Called with `SHOW` already consumed. Anything after the key (for
    /// instance a `WHERE` on other variables) is ignored.
    fn parse_discovery(&mut self) -> Result<DiscoveryQuery> {
        self.expect_keyword("TAG")?;
        self.expect_keyword("VALUES")?;

        let measurement = if self.eat_keyword("FROM") {
            let mut name = self.parse_discovery_measurement()?;
            while self.eat(&Token::Dot) {
                name = self.parse_discovery_measurement()?;
            }
            Some(name)
        } else {
            None
        };

        self.expect_keyword("WITH")?;
        self.expect_keyword("KEY")?;
        let (key, regex_key) = match (self.advance(), self.advance()) {
            (
                Some(Token::Eq),
                Some(Token::QuotedIdent(key) | Token::Ident(key) | Token::Str(key) | Token::Param(key)),
            ) => (key, false),
            (Some(Token::RegexMatch), Some(Token::Regex(key))) => (key, true),
            _ => return Err(ConvertError::shape("expected WITH KEY = <key>")),
        };

        Ok(DiscoveryQuery {
            measurement,
            key,
            regex_key,
        })
    }

    fn parse_discovery_measurement(&mut self) -> Result<String> {
        match self.advance() {
            Some(Token::Regex(pattern)) => Ok(pattern),
            Some(Token::QuotedIdent(name) | Token::Ident(name) | Token::Param(name)) => Ok(name),
            _ => Err(ConvertError::shape("expected measurement after FROM")),
        }
    }
}

fn is_clause_keyword(word: &str) -> bool {
    ["ORDER", "LIMIT", "SLIMIT", "OFFSET", "SOFFSET"]
        .iter()
        .any(|keyword| word.eq_ignore_ascii_case(keyword))
}

/// Lowers the condition tree to a conjunction of predicates. `OR` is only
/// allowed over plain comparisons.
fn flatten(condition: Condition, out: &mut Vec<Predicate>) -> Result<()> {
    match condition {
        Condition::Always => {}
        Condition::Compare(comparison) => out.push(Predicate::Compare(comparison)),
        Condition::And(items) => {
            for item in items {
                flatten(item, out)?;
            }
        }
        Condition::Or(items) => {
            let mut alternatives = Vec::new();
            collect_alternatives(items, &mut alternatives)?;
            match alternatives.len() {
                0 => {}
                1 => out.push(Predicate::Compare(alternatives.remove(0))),
                _ => out.push(Predicate::Any(alternatives)),
            }
        }
    }
    Ok(())
}

fn collect_alternatives(items: Vec<Condition>, out: &mut Vec<Comparison>) -> Result<()> {
    for item in items {
        match item {
            Condition::Always => {}
            Condition::Compare(comparison) => out.push(comparison),
            Condition::Or(nested) => collect_alternatives(nested, out)?,
            Condition::And(_) => {
                return Err(ConvertError::UnsupportedOrGroup(
                    "AND nested inside OR".into(),
                ))
            }
        }
    }
    Ok(())
}
