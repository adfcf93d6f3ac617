//! Classify InfluxQL statements and find the measurement they address
//!
//! The proxy does not evaluate queries; it only needs to know which kind of statement it was
//! given and which `database.retention_policy.measurement` it reads, so that it can pick the
//! cluster that owns that measurement.
use std::fmt;

use thiserror::Error;

mod lexer;

use lexer::{Token, tokenize};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("invalid query at offset {offset}")]
    Syntax { offset: usize },

    #[error("sql not supported")]
    UnsupportedStatement,

    #[error("no route matched")]
    NoRouteMatched,

    #[error("multi route path found")]
    MultiRoutePath,

    #[error("invalid measurement name: {0}")]
    InvalidMeasurement(String),

    #[error("regex measurement is not supported")]
    RegexMeasurement,

    #[error("missing condition for tag {0}")]
    MissingTagCondition(String),

    #[error("conflicting conditions for tag {0}")]
    ConflictingTagCondition(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The statements the proxy knows how to route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    Select,
    ShowDatabases,
    ShowMeasurements,
    ShowSeries,
    ShowTagKeys,
    ShowTagValues,
    ShowFieldKeys,
}

impl StatementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Select => "select",
            Self::ShowDatabases => "show databases",
            Self::ShowMeasurements => "show measurements",
            Self::ShowSeries => "show series",
            Self::ShowTagKeys => "show tag keys",
            Self::ShowTagValues => "show tag values",
            Self::ShowFieldKeys => "show field keys",
        }
    }

    /// `true` for statements that cannot be answered without a measurement
    fn requires_source(&self) -> bool {
        matches!(self, Self::Select)
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Determine the kind of the statement `q`
pub fn statement_kind(q: &str) -> Result<StatementKind> {
    let tokens = tokenize(q)?;
    kind_of(&tokens)
}

fn kind_of(tokens: &[Token<'_>]) -> Result<StatementKind> {
    let keyword = |i: usize, kw: &str| tokens.get(i).is_some_and(|t| t.is_keyword(kw));

    if keyword(0, "select") {
        return Ok(StatementKind::Select);
    }
    if !keyword(0, "show") {
        return Err(Error::UnsupportedStatement);
    }

    let kind = if keyword(1, "databases") {
        StatementKind::ShowDatabases
    } else if keyword(1, "measurements") {
        StatementKind::ShowMeasurements
    } else if keyword(1, "series") {
        StatementKind::ShowSeries
    } else if keyword(1, "tag") && keyword(2, "keys") {
        StatementKind::ShowTagKeys
    } else if keyword(1, "tag") && keyword(2, "values") {
        StatementKind::ShowTagValues
    } else if keyword(1, "field") && keyword(2, "keys") {
        StatementKind::ShowFieldKeys
    } else {
        return Err(Error::UnsupportedStatement);
    };
    Ok(kind)
}

/// The measurement a statement reads; empty strings stand for "not named"
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DataSource {
    pub database: String,
    pub retention_policy: String,
    pub table: String,
}

impl DataSource {
    fn from_parts(mut parts: Vec<String>) -> Result<Self> {
        let invalid = |parts: &[String]| Error::InvalidMeasurement(parts.join("."));
        let source = match parts.len() {
            1 => Self {
                table: parts.remove(0),
                ..Default::default()
            },
            2 => Self {
                retention_policy: parts.remove(0),
                table: parts.remove(0),
                ..Default::default()
            },
            3 => Self {
                database: parts.remove(0),
                retention_policy: parts.remove(0),
                table: parts.remove(0),
            },
            _ => return Err(invalid(&parts)),
        };
        if source.table.is_empty() {
            return Err(invalid(&[
                source.database,
                source.retention_policy,
                source.table,
            ]));
        }
        Ok(source)
    }
}

/// Find the single data source read by `q`
///
/// The database comes from `ON <db>` or from a three part measurement name, the measurement
/// from the `FROM` clauses of the statement and of any subqueries. A statement reading more
/// than one distinct measurement cannot be routed to one cluster.
pub fn single_data_source(q: &str) -> Result<DataSource> {
    let tokens = tokenize(q)?;
    let kind = kind_of(&tokens)?;

    let mut on_database = None;
    let mut sources: Vec<DataSource> = vec![];

    let mut i = 0;
    while i < tokens.len() {
        if kind != StatementKind::Select && tokens[i].is_keyword("on") {
            if let Some(db) = tokens.get(i + 1).and_then(Token::name) {
                on_database.get_or_insert_with(|| db.to_string());
            }
            i += 1;
            continue;
        }
        if !tokens[i].is_keyword("from") {
            i += 1;
            continue;
        }

        i += 1;
        loop {
            match tokens.get(i) {
                // a subquery supplies its own FROM clause
                Some(Token::Punct('(')) => break,
                Some(Token::Regex(_)) => return Err(Error::RegexMeasurement),
                _ => {}
            }
            let (parts, next) = measurement_name(&tokens, i);
            let source = DataSource::from_parts(parts)?;
            if !sources.contains(&source) {
                sources.push(source);
            }
            i = next;
            match tokens.get(i) {
                Some(Token::Punct(',')) => i += 1,
                _ => break,
            }
        }
    }

    let mut source = match sources.len() {
        0 if kind.requires_source() => return Err(Error::NoRouteMatched),
        0 => DataSource::default(),
        1 => sources.remove(0),
        _ => return Err(Error::MultiRoutePath),
    };
    if source.database.is_empty() {
        if let Some(db) = on_database {
            source.database = db;
        }
    }
    Ok(source)
}

/// Read a dotted name starting at `i`, returning its segments and the index after it
fn measurement_name(tokens: &[Token<'_>], mut i: usize) -> (Vec<String>, usize) {
    let mut parts = vec![];
    let mut current: Option<String> = None;
    loop {
        match tokens.get(i) {
            Some(Token::Punct('.')) => parts.push(current.take().unwrap_or_default()),
            Some(t) if current.is_none() && t.name().is_some() => {
                current = t.name().map(ToString::to_string);
            }
            _ => break,
        }
        i += 1;
    }
    parts.push(current.unwrap_or_default());
    (parts, i)
}

/// Extract the value each of `tag_names` is compared to with `=` in the WHERE clause of `q`
///
/// The result follows the order of `tag_names`. Every tag must be constrained to exactly one
/// value.
pub fn select_tags(tag_names: &[String], q: &str) -> Result<Vec<(String, String)>> {
    let tokens = tokenize(q)?;

    let mut found: Vec<Option<String>> = vec![None; tag_names.len()];
    let mut in_where = false;
    for (i, token) in tokens.iter().enumerate() {
        if token.is_keyword("where") {
            in_where = true;
            continue;
        }
        if !in_where || tokens.get(i + 1) != Some(&Token::Punct('=')) {
            continue;
        }
        let Some(name) = token.name() else {
            continue;
        };
        let Some(position) = tag_names.iter().position(|t| t == name) else {
            continue;
        };
        let Some(value) = tokens.get(i + 2).and_then(Token::literal) else {
            continue;
        };

        match &found[position] {
            Some(existing) if existing != value => {
                return Err(Error::ConflictingTagCondition(name.to_string()));
            }
            Some(_) => {}
            None => found[position] = Some(value.to_string()),
        }
    }

    tag_names
        .iter()
        .zip(found)
        .map(|(name, value)| match value {
            Some(value) => Ok((name.clone(), value)),
            None => Err(Error::MissingTagCondition(name.clone())),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn statement_kinds() {
        let cases = [
            ("select * from cpu", StatementKind::Select),
            ("  SELECT value FROM cpu", StatementKind::Select),
            ("show databases", StatementKind::ShowDatabases),
            ("SHOW MEASUREMENTS ON db1", StatementKind::ShowMeasurements),
            ("show series from cpu", StatementKind::ShowSeries),
            ("show tag keys", StatementKind::ShowTagKeys),
            ("show tag values with key = host", StatementKind::ShowTagValues),
            ("show field keys on db1", StatementKind::ShowFieldKeys),
        ];
        for (q, expected) in cases {
            assert_eq!(statement_kind(q).unwrap(), expected, "{q}");
        }

        for q in ["drop database db1", "show retention policies", "show tag", ""] {
            assert_matches!(statement_kind(q), Err(Error::UnsupportedStatement), "{q}");
        }
    }

    fn source(db: &str, rp: &str, table: &str) -> DataSource {
        DataSource {
            database: db.to_string(),
            retention_policy: rp.to_string(),
            table: table.to_string(),
        }
    }

    #[test]
    fn data_sources() {
        let cases = [
            ("select * from test", source("", "", "test")),
            ("select * from re1.test", source("", "re1", "test")),
            ("select * from db1.re1.test", source("db1", "re1", "test")),
            ("select * from db1..test", source("db1", "", "test")),
            (r#"select * from "tsd_11""#, source("", "", "tsd_11")),
            ("show databases", source("", "", "")),
            ("show measurements", source("", "", "")),
            ("show measurements on system", source("system", "", "")),
            ("show series on db1 from tt1", source("db1", "", "tt1")),
            ("show tag keys from t1", source("", "", "t1")),
            ("show field keys on db1", source("db1", "", "")),
            (
                "show tag values on db1 from t1 with key=bb",
                source("db1", "", "t1"),
            ),
            (
                r#"SELECT sum("cnt") FROM "autogen"."kafka_topic_message_cnt" WHERE ("topic" =~ /^()$/) AND time >= 1573488000000ms GROUP BY time(1m), "partition" fill(null)"#,
                source("", "autogen", "kafka_topic_message_cnt"),
            ),
            (
                r#"SELECT NON_NEGATIVE_DERIVATIVE(sum("Value")) / 3 as incre FROM (select sum("Value") as Value from "storage_kafka_log" WHERE "name" = 'LogEndOffset' AND "topic" =~ /^undefined$/ AND time >= 1573488000000ms AND Value > 0 group by time(3m)) WHERE time >= 1573488000000ms group by topic, time(3m)"#,
                source("", "", "storage_kafka_log"),
            ),
            (
                r#"SELECT min("Value") as "最小Offset", max("Value") as "最大Offset" FROM "storage_kafka_log" WHERE "setid" =~ /^$SetID/ AND Value > 0 group by partition, setid"#,
                source("", "", "storage_kafka_log"),
            ),
            (
                r#"SELECT sum("data_inc") FROM "rp_InfluxDB"."data_loss_input_total" WHERE ("logical_tag" =~ /^$RT$/) AND time >= 1573488000000ms GROUP BY time(1m) fill(null);"#,
                source("", "rp_InfluxDB", "data_loss_input_total"),
            ),
            (
                "select * from cpu where host = 'from'",
                source("", "", "cpu"),
            ),
            (
                "select * from (select * from cpu), (select max(v) from cpu)",
                source("", "", "cpu"),
            ),
        ];
        for (q, expected) in cases {
            assert_eq!(single_data_source(q).unwrap(), expected, "{q}");
        }
    }

    #[test]
    fn data_source_errors() {
        assert_matches!(
            single_data_source("select 1"),
            Err(Error::NoRouteMatched)
        );
        assert_matches!(
            single_data_source("select * from cpu, mem"),
            Err(Error::MultiRoutePath)
        );
        assert_matches!(
            single_data_source("select * from (select * from cpu), (select * from mem)"),
            Err(Error::MultiRoutePath)
        );
        assert_matches!(
            single_data_source("select * from /cpu.*/"),
            Err(Error::RegexMeasurement)
        );
        assert_matches!(
            single_data_source("select * from a.b.c.d"),
            Err(Error::InvalidMeasurement(name)) if name == "a.b.c.d"
        );
        assert_matches!(
            single_data_source("select * from db.rp."),
            Err(Error::InvalidMeasurement(_))
        );
        assert_matches!(
            single_data_source("delete from cpu"),
            Err(Error::UnsupportedStatement)
        );
    }

    #[test]
    fn tags_from_where_clause() {
        let tag_names = vec!["bk_biz_id".to_string(), "host".to_string()];

        let got = select_tags(
            &tag_names,
            r#"select * from cpu where "host" = 'h1' and time > now() - 1h and bk_biz_id = 2"#,
        )
        .unwrap();
        assert_eq!(
            got,
            vec![
                ("bk_biz_id".to_string(), "2".to_string()),
                ("host".to_string(), "h1".to_string()),
            ]
        );

        assert_matches!(
            select_tags(&tag_names, "select * from cpu where host = 'h1'"),
            Err(Error::MissingTagCondition(tag)) if tag == "bk_biz_id"
        );
        assert_matches!(
            select_tags(
                &tag_names,
                "select * from cpu where host = 'a' or host = 'b' and bk_biz_id = '1'"
            ),
            Err(Error::ConflictingTagCondition(tag)) if tag == "host"
        );
        // conditions outside of WHERE are ignored
        assert_matches!(
            select_tags(&["host".to_string()], "select host = 'a' from cpu"),
            Err(Error::MissingTagCondition(_))
        );
        assert_eq!(select_tags(&[], "select * from cpu").unwrap(), vec![]);
    }
}
