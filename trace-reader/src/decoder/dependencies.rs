use super::{optional_str, required_str};
use crate::error::DecodeError;
use crate::flux::FluxResult;
use crate::schema::{parse_references, REFERENCES_KEY, SERVICE_NAME_KEY, SPAN_ID_KEY};
use api_structs::{DependencyLink, SpanId, SpanRef};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug)]
struct SpanRow {
    span_id: SpanId,
    service_name: String,
    references: Vec<SpanRef>,
}

/// Counts references between spans of different services.
///
/// Rows come in any order, so every span is indexed before any reference is resolved.
/// References to spans outside the result are ignored.
pub fn dependency_links_from_result(result: FluxResult) -> Result<Vec<DependencyLink>, DecodeError> {
    let mut rows = vec![];
    for table in result {
        let table = table?;
        for row in table.rows() {
            let span_id: SpanId = required_str(&row, SPAN_ID_KEY)?.parse()?;
            let service_name = required_str(&row, SERVICE_NAME_KEY)?.to_string();
            let references = match optional_str(&row, REFERENCES_KEY)? {
                Some(encoded) => parse_references(encoded)
                    .ok_or_else(|| DecodeError::InvalidReference(encoded.to_string()))?,
                None => vec![],
            };
            rows.push(SpanRow {
                span_id,
                service_name,
                references,
            });
        }
    }

    let service_by_span: HashMap<SpanId, &str> = rows
        .iter()
        .map(|row| (row.span_id, row.service_name.as_str()))
        .collect();
    let mut call_counts: BTreeMap<(&str, &str), u64> = BTreeMap::new();
    for row in &rows {
        for reference in &row.references {
            let Some(&parent) = service_by_span.get(&reference.span_id) else {
                continue;
            };
            if parent != row.service_name {
                *call_counts
                    .entry((parent, row.service_name.as_str()))
                    .or_default() += 1;
            }
        }
    }
    Ok(call_counts
        .into_iter()
        .map(|((parent, child), call_count)| DependencyLink {
            parent: parent.to_string(),
            child: child.to_string(),
            call_count,
        })
        .collect())
}
