use super::{optional_i64, optional_str, required_str, required_time, tag_value};
use crate::error::DecodeError;
use crate::flux::{FluxResult, Row};
use crate::schema::{
    is_reserved_column, parse_references, DURATION_KEY, FLAGS_KEY, MEASUREMENT_COLUMN,
    OPERATION_NAME_KEY, REFERENCES_KEY, SERVICE_NAME_KEY, SPAN_ID_KEY, TIME_COLUMN, TRACE_ID_KEY,
};
use api_structs::time_conversion::duration_from_nanos;
use api_structs::{KeyValue, Log, Process, Span, SpanId, Trace, TraceId};
use std::collections::HashMap;
use tracing::warn;

#[derive(Debug)]
struct PartialTrace {
    trace_id: TraceId,
    spans: Vec<Span>,
    span_index: HashMap<SpanId, usize>,
}

/// Groups span and log rows into traces, whatever order the rows come in.
///
/// Logs seen before their span wait in `pending_logs` until the span shows up. Traces keep the
/// order their id was first seen in, spans the order they were added in.
#[derive(Debug)]
pub struct TraceAssembler<'a> {
    span_measurement: &'a str,
    log_measurement: &'a str,
    traces: Vec<PartialTrace>,
    trace_index: HashMap<TraceId, usize>,
    pending_logs: HashMap<(TraceId, SpanId), Vec<Log>>,
}

fn row_fields(row: &Row<'_>) -> Vec<KeyValue> {
    row.iter()
        .filter(|(column, _)| !is_reserved_column(&column.name))
        .filter_map(|(column, value)| {
            tag_value(value).map(|value| KeyValue {
                key: column.name.clone(),
                value,
            })
        })
        .collect()
}

fn span_from_row(row: &Row<'_>) -> Result<Span, DecodeError> {
    let trace_id: TraceId = required_str(row, TRACE_ID_KEY)?.parse()?;
    let span_id: SpanId = required_str(row, SPAN_ID_KEY)?.parse()?;
    let service_name = required_str(row, SERVICE_NAME_KEY)?.to_string();
    let operation_name = optional_str(row, OPERATION_NAME_KEY)?
        .unwrap_or_default()
        .to_string();
    let start_time = required_time(row, TIME_COLUMN)?;
    let duration_nanos = optional_i64(row, DURATION_KEY)?.unwrap_or(0);
    let duration = duration_from_nanos(duration_nanos).ok_or(DecodeError::ValueOutOfRange {
        column: DURATION_KEY,
        value: duration_nanos,
    })?;
    let flags = optional_i64(row, FLAGS_KEY)?.unwrap_or(0);
    let flags = u32::try_from(flags).map_err(|_| DecodeError::ValueOutOfRange {
        column: FLAGS_KEY,
        value: flags,
    })?;
    let references = match optional_str(row, REFERENCES_KEY)? {
        Some(encoded) => parse_references(encoded)
            .ok_or_else(|| DecodeError::InvalidReference(encoded.to_string()))?,
        None => vec![],
    };
    Ok(Span {
        trace_id,
        span_id,
        operation_name,
        references,
        flags,
        start_time,
        duration,
        tags: row_fields(row),
        logs: vec![],
        process: Process {
            service_name,
            tags: vec![],
        },
    })
}

fn log_from_row(row: &Row<'_>) -> Result<(TraceId, SpanId, Log), DecodeError> {
    let trace_id: TraceId = required_str(row, TRACE_ID_KEY)?.parse()?;
    let span_id: SpanId = required_str(row, SPAN_ID_KEY)?.parse()?;
    let log = Log {
        timestamp: required_time(row, TIME_COLUMN)?,
        fields: row_fields(row),
    };
    Ok((trace_id, span_id, log))
}

impl<'a> TraceAssembler<'a> {
    pub fn new(span_measurement: &'a str, log_measurement: &'a str) -> Self {
        Self {
            span_measurement,
            log_measurement,
            traces: vec![],
            trace_index: HashMap::new(),
            pending_logs: HashMap::new(),
        }
    }

    pub fn add_row(&mut self, row: &Row<'_>) -> Result<(), DecodeError> {
        let measurement = required_str(row, MEASUREMENT_COLUMN)?;
        if measurement == self.span_measurement {
            self.add_span(span_from_row(row)?);
        } else if measurement == self.log_measurement {
            let (trace_id, span_id, log) = log_from_row(row)?;
            self.add_log(trace_id, span_id, log);
        } else {
            return Err(DecodeError::UnknownMeasurement(measurement.to_string()));
        }
        Ok(())
    }

    fn trace_mut(&mut self, trace_id: TraceId) -> &mut PartialTrace {
        let idx = *self.trace_index.entry(trace_id).or_insert_with(|| {
            self.traces.push(PartialTrace {
                trace_id,
                spans: vec![],
                span_index: HashMap::new(),
            });
            self.traces.len() - 1
        });
        &mut self.traces[idx]
    }

    fn add_span(&mut self, mut span: Span) {
        let key = (span.trace_id, span.span_id);
        let pending = self.pending_logs.remove(&key);
        let trace = self.trace_mut(span.trace_id);
        if trace.span_index.contains_key(&span.span_id) {
            warn!(
                trace_id = %span.trace_id,
                span_id = %span.span_id,
                "Span stored more than once, keeping the first copy"
            );
            if let (Some(logs), Some(&idx)) = (pending, trace.span_index.get(&span.span_id)) {
                trace.spans[idx].logs.extend(logs);
            }
            return;
        }
        if let Some(logs) = pending {
            span.logs.extend(logs);
        }
        trace.span_index.insert(span.span_id, trace.spans.len());
        trace.spans.push(span);
    }

    fn add_log(&mut self, trace_id: TraceId, span_id: SpanId, log: Log) {
        let trace = self.trace_mut(trace_id);
        if let Some(&idx) = trace.span_index.get(&span_id) {
            trace.spans[idx].logs.push(log);
            return;
        }
        self.pending_logs
            .entry((trace_id, span_id))
            .or_default()
            .push(log);
    }

    /// Logs whose span never showed up are dropped, as are traces left without spans.
    pub fn finish(self) -> Vec<Trace> {
        let mut orphans_by_trace: HashMap<TraceId, usize> = HashMap::new();
        for ((trace_id, span_id), logs) in &self.pending_logs {
            warn!(
                trace_id = %trace_id,
                span_id = %span_id,
                count = logs.len(),
                "Dropping logs of a span that is not in the result"
            );
            *orphans_by_trace.entry(*trace_id).or_default() += logs.len();
        }

        let mut traces = Vec::with_capacity(self.traces.len());
        for partial in self.traces {
            if partial.spans.is_empty() {
                warn!(trace_id = %partial.trace_id, "Dropping trace without spans");
                continue;
            }
            let mut warnings = vec![];
            if let Some(orphans) = orphans_by_trace.get(&partial.trace_id) {
                warnings.push(format!(
                    "{orphans} log(s) reference spans missing from this trace"
                ));
            }
            let mut spans = partial.spans;
            for span in &mut spans {
                span.logs.sort_by_key(|log| log.timestamp);
            }
            traces.push(Trace { spans, warnings });
        }
        traces
    }
}

pub fn traces_from_result(
    result: FluxResult,
    span_measurement: &str,
    log_measurement: &str,
) -> Result<Vec<Trace>, DecodeError> {
    let mut assembler = TraceAssembler::new(span_measurement, log_measurement);
    for table in result {
        let table = table?;
        for row in table.rows() {
            assembler.add_row(&row)?;
        }
    }
    Ok(assembler.finish())
}

/// `None` when the result holds no trace.
pub fn single_trace_from_result(
    result: FluxResult,
    span_measurement: &str,
    log_measurement: &str,
) -> Result<Option<Trace>, DecodeError> {
    let mut traces = traces_from_result(result, span_measurement, log_measurement)?;
    if traces.len() > 1 {
        return Err(DecodeError::MultipleTraces {
            returned: traces.len(),
        });
    }
    Ok(traces.pop())
}

#[cfg(test)]
mod test {
    use super::*;
    use api_structs::{RefType, TagValue};
    use proptest::prelude::*;
    use std::time::Duration;

    const HEADER: &str = "\
#group,false,false,true,true,true,true,false,false,false,false,false,true,false
#datatype,string,long,string,string,string,string,dateTime:RFC3339,string,long,long,string,string,boolean
#default,_result,,,,,,,,,,,,
,result,table,_measurement,trace_id,service_name,operation_name,_time,span_id,duration,flags,references,http.method,level_error
";

    fn result(rows: &[&str]) -> FluxResult {
        let mut body = HEADER.to_string();
        for row in rows {
            body.push_str(row);
            body.push('\n');
        }
        FluxResult::from_csv(body)
    }

    const ROOT: &str = ",,0,span,ab,frontend,GET /,2023-01-01T00:00:00Z,1,5000000,1,,GET,";
    const CHILD: &str =
        ",,1,span,ab,backend,query,2023-01-01T00:00:00.001Z,2,1000000,1,child-of:ab:1,,";
    const OTHER_ROOT: &str = ",,2,span,cd,frontend,GET /x,2023-01-01T00:00:01Z,1,2000,0,,,";
    const ROOT_LOG_LATE: &str = ",,3,log,ab,frontend,,2023-01-01T00:00:00.004Z,1,,,,,true";
    const ROOT_LOG_EARLY: &str = ",,3,log,ab,frontend,,2023-01-01T00:00:00.002Z,1,,,,,false";
    const OTHER_LOG: &str = ",,4,log,cd,frontend,,2023-01-01T00:00:01.001Z,1,,,,,";

    #[test]
    fn spans_and_logs_land_in_their_own_trace() {
        let rows = [ROOT_LOG_LATE, OTHER_LOG, CHILD, ROOT, ROOT_LOG_EARLY, OTHER_ROOT];
        let traces = traces_from_result(result(&rows), "span", "log").unwrap();
        assert_eq!(traces.len(), 2);

        let first = &traces[0];
        assert_eq!(first.trace_id(), Some(TraceId::new(0, 0xab)));
        let span_ids: Vec<SpanId> = first.spans.iter().map(|s| s.span_id).collect();
        assert_eq!(span_ids, [SpanId(2), SpanId(1)]);
        let root = &first.spans[1];
        assert_eq!(root.operation_name, "GET /");
        assert_eq!(root.process.service_name, "frontend");
        assert_eq!(root.duration, Duration::from_millis(5));
        assert_eq!(root.tags, vec![KeyValue::string("http.method", "GET")]);
        assert_eq!(root.logs.len(), 2);
        assert!(root.logs[0].timestamp < root.logs[1].timestamp);
        assert_eq!(
            root.logs[0].fields,
            vec![KeyValue {
                key: "level_error".to_string(),
                value: TagValue::Bool(false),
            }]
        );
        let child = &first.spans[0];
        assert!(child.logs.is_empty());
        assert_eq!(child.references[0].ref_type, RefType::ChildOf);
        assert_eq!(child.parent_span_id(), Some(SpanId(1)));

        let second = &traces[1];
        assert_eq!(second.trace_id(), Some(TraceId::new(0, 0xcd)));
        assert_eq!(second.spans.len(), 1);
        assert_eq!(second.spans[0].logs.len(), 1);
        assert!(second.warnings.is_empty());
    }

    #[test]
    fn row_order_does_not_change_the_result() {
        let forward = [ROOT, CHILD, ROOT_LOG_EARLY, ROOT_LOG_LATE];
        let backward = [ROOT_LOG_LATE, ROOT_LOG_EARLY, ROOT, CHILD];
        let a = traces_from_result(result(&forward), "span", "log").unwrap();
        let b = traces_from_result(result(&backward), "span", "log").unwrap();
        assert_eq!(a, b);
    }

    /// Rows for `shape[t][s]` logs on span `s + 1` of trace `t`. Every log carries its own
    /// coordinates in `http.method`.
    fn shaped_rows(shape: &[Vec<usize>]) -> Vec<String> {
        let mut rows = vec![];
        for (t, spans) in shape.iter().enumerate() {
            let trace_id = 0xa0 + t;
            for (s, logs) in spans.iter().enumerate() {
                let span_id = s + 1;
                rows.push(format!(
                    ",,0,span,{trace_id:x},svc{t},op{s},2023-01-01T00:00:0{t}Z,{span_id},1000,1,,,"
                ));
                for l in 0..*logs {
                    rows.push(format!(
                        ",,0,log,{trace_id:x},svc{t},,2023-01-01T00:00:0{t}.00{l}Z,{span_id},,,,t{t}s{s}l{l},"
                    ));
                }
            }
        }
        rows
    }

    proptest! {
        #[test]
        fn shuffled_rows_assemble_into_the_same_traces(
            rows in prop::collection::vec(prop::collection::vec(0..3usize, 1..4), 1..4)
                .prop_flat_map(|shape| {
                    let rows = shaped_rows(&shape);
                    (Just(shape), Just(rows).prop_shuffle())
                })
        ) {
            let (shape, rows) = rows;
            let rows: Vec<&str> = rows.iter().map(String::as_str).collect();
            let traces = traces_from_result(result(&rows), "span", "log").unwrap();
            prop_assert_eq!(traces.len(), shape.len());

            for (t, spans) in shape.iter().enumerate() {
                let trace_id = TraceId::new(0, 0xa0 + t as u64);
                let trace = traces
                    .iter()
                    .find(|trace| trace.trace_id() == Some(trace_id))
                    .unwrap();
                prop_assert!(trace.warnings.is_empty());
                let mut span_ids: Vec<SpanId> = trace.spans.iter().map(|s| s.span_id).collect();
                span_ids.sort();
                let expected: Vec<SpanId> = (1..=spans.len() as u64).map(SpanId).collect();
                prop_assert_eq!(span_ids, expected);

                for span in &trace.spans {
                    prop_assert_eq!(span.trace_id, trace_id);
                    let s = (span.span_id.0 - 1) as usize;
                    prop_assert_eq!(&span.process.service_name, &format!("svc{t}"));
                    let markers: Vec<KeyValue> = span
                        .logs
                        .iter()
                        .flat_map(|log| log.fields.iter().cloned())
                        .collect();
                    let expected: Vec<KeyValue> = (0..spans[s])
                        .map(|l| KeyValue::string("http.method", format!("t{t}s{s}l{l}")))
                        .collect();
                    prop_assert_eq!(markers, expected);
                }
            }
        }
    }

    #[test]
    fn orphan_logs_are_dropped_with_a_warning() {
        let orphan = ",,3,log,ab,frontend,,2023-01-01T00:00:00.004Z,9,,,,,true";
        let traces = traces_from_result(result(&[ROOT, orphan]), "span", "log").unwrap();
        assert_eq!(traces.len(), 1);
        assert!(traces[0].spans[0].logs.is_empty());
        assert_eq!(traces[0].warnings.len(), 1);
    }

    #[test]
    fn traces_made_only_of_logs_are_dropped() {
        let traces = traces_from_result(result(&[OTHER_LOG, ROOT]), "span", "log").unwrap();
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].trace_id(), Some(TraceId::new(0, 0xab)));
    }

    #[test]
    fn duplicated_span_rows_keep_the_first() {
        let copy = ",,0,span,ab,frontend,renamed,2023-01-01T00:00:00Z,1,5000000,1,,GET,";
        let traces = traces_from_result(result(&[ROOT, copy]), "span", "log").unwrap();
        assert_eq!(traces[0].spans.len(), 1);
        assert_eq!(traces[0].spans[0].operation_name, "GET /");
    }

    #[test]
    fn single_trace_lookup_rejects_a_second_trace() {
        let err = single_trace_from_result(result(&[ROOT, OTHER_ROOT]), "span", "log").unwrap_err();
        assert!(matches!(err, DecodeError::MultipleTraces { returned: 2 }));
        let none = single_trace_from_result(result(&[]), "span", "log").unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn malformed_rows_fail_the_request() {
        let bad_span_id = ",,0,span,ab,frontend,GET /,2023-01-01T00:00:00Z,zz,5000000,1,,GET,";
        assert!(matches!(
            traces_from_result(result(&[ROOT, bad_span_id]), "span", "log"),
            Err(DecodeError::InvalidId(_))
        ));
        let bad_ref = ",,0,span,ab,frontend,GET /,2023-01-01T00:00:00Z,3,5000000,1,parent:ab:1,GET,";
        assert!(matches!(
            traces_from_result(result(&[bad_ref]), "span", "log"),
            Err(DecodeError::InvalidReference(_))
        ));
        let negative = ",,0,span,ab,frontend,GET /,2023-01-01T00:00:00Z,3,-5,1,,GET,";
        assert!(matches!(
            traces_from_result(result(&[negative]), "span", "log"),
            Err(DecodeError::ValueOutOfRange { column: "duration", value: -5 })
        ));
        let unknown = ",,0,metric,ab,frontend,GET /,2023-01-01T00:00:00Z,3,5,1,,GET,";
        assert!(matches!(
            traces_from_result(result(&[unknown]), "span", "log"),
            Err(DecodeError::UnknownMeasurement(m)) if m == "metric"
        ));
    }
}
