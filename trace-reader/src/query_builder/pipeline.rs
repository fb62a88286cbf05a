use super::{column_ref, string_literal, time_literal};
use crate::error::BuildError;
use chrono::{DateTime, Duration, Utc};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ge,
    Le,
}

impl Operator {
    fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "==",
            Operator::Ge => ">=",
            Operator::Le => "<=",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    String(String),
    Int(i64),
}

impl Display for Literal {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Literal::String(s) => f.write_str(&string_literal(s)),
            Literal::Int(i) => write!(f, "{i}"),
        }
    }
}

/// Boolean expression over the row `r` of a `filter` stage.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Compare {
        column: String,
        operator: Operator,
        value: Literal,
    },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
}

impl Predicate {
    pub fn eq<C: Into<String>, V: Into<String>>(column: C, value: V) -> Self {
        Predicate::Compare {
            column: column.into(),
            operator: Operator::Eq,
            value: Literal::String(value.into()),
        }
    }

    pub fn int<C: Into<String>>(column: C, operator: Operator, value: i64) -> Self {
        Predicate::Compare {
            column: column.into(),
            operator,
            value: Literal::Int(value),
        }
    }

    fn is_compound(&self) -> bool {
        match self {
            Predicate::Compare { .. } => false,
            Predicate::And(terms) | Predicate::Or(terms) => terms.len() > 1,
        }
    }

    fn write_terms(f: &mut Formatter<'_>, terms: &[Predicate], joiner: &str) -> std::fmt::Result {
        if terms.is_empty() {
            return f.write_str("true");
        }
        for (idx, term) in terms.iter().enumerate() {
            if idx > 0 {
                f.write_str(joiner)?;
            }
            if term.is_compound() {
                write!(f, "({term})")?;
            } else {
                write!(f, "{term}")?;
            }
        }
        Ok(())
    }
}

impl Display for Predicate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Predicate::Compare {
                column,
                operator,
                value,
            } => write!(f, "{} {} {}", column_ref(column), operator.as_str(), value),
            Predicate::And(terms) => Self::write_terms(f, terms, " and "),
            Predicate::Or(terms) => Self::write_terms(f, terms, " or "),
        }
    }
}

/// `from(bucket:)` followed by `|>` stages, one per line.
#[derive(Debug, Clone)]
#[must_use = "pipelines do nothing until .build() is called"]
pub struct Pipeline {
    source: String,
    stages: Vec<String>,
}

impl Pipeline {
    pub fn from_bucket(bucket: &str) -> Self {
        Self {
            source: format!("from(bucket: {})", string_literal(bucket)),
            stages: vec![],
        }
    }

    fn stage(mut self, stage: String) -> Self {
        self.stages.push(stage);
        self
    }

    /// Both bounds inclusive. No `stop` means up to now.
    pub fn range(
        self,
        start: DateTime<Utc>,
        stop: Option<DateTime<Utc>>,
    ) -> Result<Self, BuildError> {
        let stop = match stop {
            // range() excludes its stop
            Some(stop) => time_literal(
                stop.checked_add_signed(Duration::nanoseconds(1))
                    .ok_or(BuildError::StopTimeOutOfRange)?,
            ),
            None => "now()".to_string(),
        };
        Ok(self.stage(format!(
            "range(start: {}, stop: {})",
            time_literal(start),
            stop
        )))
    }

    pub fn filter(self, predicate: &Predicate) -> Self {
        self.stage(format!("filter(fn: (r) => {predicate})"))
    }

    /// One row per point time with every field as its own column.
    pub fn pivot_fields(self) -> Self {
        self.stage(
            "pivot(rowKey: [\"_time\"], columnKey: [\"_field\"], valueColumn: \"_value\")"
                .to_string(),
        )
    }

    /// Merges every table into one.
    pub fn ungroup(self) -> Self {
        self.stage("group()".to_string())
    }

    pub fn keep(self, columns: &[&str]) -> Self {
        let columns: Vec<String> = columns.iter().map(|c| string_literal(c)).collect();
        self.stage(format!("keep(columns: [{}])", columns.join(", ")))
    }

    pub fn distinct(self, column: &str) -> Self {
        self.stage(format!("distinct(column: {})", string_literal(column)))
    }

    pub fn limit(self, n: usize) -> Self {
        self.stage(format!("limit(n: {n})"))
    }

    pub fn build(self) -> String {
        let mut query = self.source;
        for stage in self.stages {
            query.push_str("\n  |> ");
            query.push_str(&stage);
        }
        query
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn compound_terms_are_parenthesized() {
        let predicate = Predicate::And(vec![
            Predicate::Or(vec![
                Predicate::eq("_measurement", "span"),
                Predicate::eq("_measurement", "log"),
            ]),
            Predicate::Or(vec![Predicate::eq("trace_id", "ab")]),
            Predicate::int("_value", Operator::Ge, 10),
        ]);
        assert_eq!(
            predicate.to_string(),
            r#"(r._measurement == "span" or r._measurement == "log") and r.trace_id == "ab" and r._value >= 10"#
        );
    }

    #[test]
    fn empty_conjunction_matches_everything() {
        assert_eq!(Predicate::And(vec![]).to_string(), "true");
    }

    #[test]
    fn stages_render_one_per_line() {
        let query = Pipeline::from_bucket("b")
            .ungroup()
            .keep(&["trace_id", "span_id"])
            .limit(3)
            .build();
        assert_eq!(
            query,
            "from(bucket: \"b\")\n  |> group()\n  |> keep(columns: [\"trace_id\", \"span_id\"])\n  |> limit(n: 3)"
        );
    }

    #[test]
    fn range_stop_at_the_end_of_time_is_rejected() {
        use chrono::TimeZone;
        let start = DateTime::<Utc>::MIN_UTC;
        assert!(matches!(
            Pipeline::from_bucket("b").range(start, Some(DateTime::<Utc>::MAX_UTC)),
            Err(BuildError::StopTimeOutOfRange)
        ));
        let query = Pipeline::from_bucket("b")
            .range(Utc.timestamp_opt(0, 0).unwrap(), None)
            .unwrap()
            .build();
        assert_eq!(
            query,
            "from(bucket: \"b\")\n  |> range(start: 1970-01-01T00:00:00.000000000Z, stop: now())"
        );
    }
}
