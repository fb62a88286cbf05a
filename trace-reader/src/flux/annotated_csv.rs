//! Reader for the annotated CSV dialect the query service answers with.
//!
//! ```text
//! #group,false,false,true,false
//! #datatype,string,long,string,long
//! #default,_result,,,
//! ,result,table,service_name,_value
//! ,,0,frontend,12
//! ,,1,backend,7
//! ```
//! Annotation rows start a schema block, the next row is the header and data rows follow.
//! Rows of one block are split into tables whenever the `table` column changes.

use crate::flux::{Column, DataType, FluxTable, TableError, Value};
use csv::StringRecord;
use std::io::Read;

const RESULT_COLUMN: &str = "result";
const TABLE_COLUMN: &str = "table";

#[derive(Debug, Default)]
struct Annotations {
    datatypes: Option<StringRecord>,
    groups: Option<StringRecord>,
    defaults: Option<StringRecord>,
}

impl Annotations {
    fn set(&mut self, record: StringRecord) -> Result<(), TableError> {
        match record.get(0).unwrap_or_default() {
            "#datatype" => self.datatypes = Some(record),
            "#group" => self.groups = Some(record),
            "#default" => self.defaults = Some(record),
            other => return Err(TableError::UnknownAnnotation(other.to_string())),
        }
        Ok(())
    }
}

/// Schema of the rows following one header.
#[derive(Debug)]
struct Block {
    width: usize,
    /// The engine reports a failed query as a block with an `error,reference` header.
    error: bool,
    columns: Vec<Column>,
    /// Position of each exposed column in the raw record.
    positions: Vec<usize>,
    defaults: Vec<Value>,
    table_position: Option<usize>,
    table_default: String,
}

impl Block {
    fn from_header(header: &StringRecord, annotations: Annotations) -> Result<Self, TableError> {
        let names: Vec<&str> = header.iter().skip(1).collect();
        if names == ["error", "reference"] {
            return Ok(Self {
                width: header.len(),
                error: true,
                columns: vec![],
                positions: vec![],
                defaults: vec![],
                table_position: None,
                table_default: String::new(),
            });
        }
        let datatypes = annotations
            .datatypes
            .ok_or(TableError::MissingDatatypeAnnotation)?;
        if datatypes.len() != header.len() {
            return Err(TableError::ColumnCount {
                expected: header.len(),
                found: datatypes.len(),
            });
        }
        let annotation_cell = |annotation: &Option<StringRecord>, idx: usize| -> String {
            annotation
                .as_ref()
                .and_then(|record| record.get(idx))
                .unwrap_or_default()
                .to_string()
        };

        let mut block = Self {
            width: header.len(),
            error: false,
            columns: Vec::with_capacity(header.len()),
            positions: Vec::with_capacity(header.len()),
            defaults: Vec::with_capacity(header.len()),
            table_position: None,
            table_default: String::new(),
        };
        for (idx, name) in header.iter().enumerate().skip(1) {
            let default_cell = annotation_cell(&annotations.defaults, idx);
            match name {
                TABLE_COLUMN => {
                    block.table_position = Some(idx);
                    block.table_default = default_cell;
                }
                RESULT_COLUMN => {}
                _ => {
                    let data_type: DataType = datatypes.get(idx).unwrap_or_default().parse()?;
                    let default = if default_cell.is_empty() {
                        Value::Null
                    } else {
                        data_type.parse(name, &default_cell)?
                    };
                    block.columns.push(Column {
                        name: name.to_string(),
                        data_type,
                        group: annotation_cell(&annotations.groups, idx) == "true",
                    });
                    block.positions.push(idx);
                    block.defaults.push(default);
                }
            }
        }
        Ok(block)
    }

    fn table_key(&self, record: &StringRecord) -> String {
        match self.table_position.and_then(|idx| record.get(idx)) {
            Some(cell) if !cell.is_empty() => cell.to_string(),
            _ => self.table_default.clone(),
        }
    }

    fn parse_row(&self, record: &StringRecord) -> Result<Vec<Value>, TableError> {
        self.positions
            .iter()
            .zip(&self.columns)
            .zip(&self.defaults)
            .map(|((&idx, column), default)| match record.get(idx).unwrap_or_default() {
                "" => Ok(default.clone()),
                cell => column.data_type.parse(&column.name, cell),
            })
            .collect()
    }
}

#[derive(Debug)]
struct PartialTable {
    key: String,
    columns: Vec<Column>,
    rows: Vec<Vec<Value>>,
}

impl PartialTable {
    fn finish(self) -> FluxTable {
        FluxTable::new(self.columns, self.rows)
    }
}

/// Yields tables as soon as the row that closes them is read.
/// Stops after the first error.
pub struct TableReader<R: Read> {
    records: csv::StringRecordsIntoIter<R>,
    annotations: Annotations,
    block: Option<Block>,
    current: Option<PartialTable>,
    finished: bool,
}

impl<R: Read> TableReader<R> {
    pub fn new(reader: R) -> Self {
        let records = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(reader)
            .into_records();
        Self {
            records,
            annotations: Annotations::default(),
            block: None,
            current: None,
            finished: false,
        }
    }

    fn advance(&mut self) -> Result<Option<FluxTable>, TableError> {
        loop {
            let Some(record) = self.records.next() else {
                return Ok(self.current.take().map(PartialTable::finish));
            };
            let record = record?;

            if record.get(0).unwrap_or_default().starts_with('#') {
                self.block = None;
                self.annotations.set(record)?;
                if let Some(done) = self.current.take() {
                    return Ok(Some(done.finish()));
                }
                continue;
            }

            let Some(block) = &self.block else {
                let annotations = std::mem::take(&mut self.annotations);
                self.block = Some(Block::from_header(&record, annotations)?);
                continue;
            };
            if record.len() != block.width {
                return Err(TableError::ColumnCount {
                    expected: block.width,
                    found: record.len(),
                });
            }
            if block.error {
                return Err(TableError::QueryFailed {
                    message: record.get(1).unwrap_or_default().to_string(),
                    reference: record.get(2).unwrap_or_default().to_string(),
                });
            }

            let key = block.table_key(&record);
            let row = block.parse_row(&record)?;
            match &mut self.current {
                Some(current) if current.key == key => current.rows.push(row),
                _ => {
                    let closed = self.current.replace(PartialTable {
                        key,
                        columns: block.columns.clone(),
                        rows: vec![row],
                    });
                    if let Some(closed) = closed {
                        return Ok(Some(closed.finish()));
                    }
                }
            }
        }
    }
}

impl<R: Read> Iterator for TableReader<R> {
    type Item = Result<FluxTable, TableError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.advance() {
            Ok(Some(table)) => Some(Ok(table)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use crate::flux::{DataType, FluxResult, FluxTable, TableError, Value};

    fn tables(body: &str) -> Vec<FluxTable> {
        FluxResult::from_csv(body)
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn splits_tables_on_the_table_column() {
        let body = "\
#group,false,false,true,false
#datatype,string,long,string,long
#default,_result,,,
,result,table,service_name,_value
,,0,frontend,12
,,0,frontend,13
,,1,backend,7
";
        let tables = tables(body);
        assert_eq!(tables.len(), 2);
        let names: Vec<&str> = tables[0].columns().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["service_name", "_value"]);
        assert!(tables[0].columns()[0].group);
        assert_eq!(tables[0].columns()[1].data_type, DataType::Long);
        assert_eq!(tables[0].len(), 2);
        let row = tables[1].rows().next().unwrap();
        assert_eq!(row.get("service_name"), Some(&Value::String("backend".to_string())));
        assert_eq!(row.get("_value"), Some(&Value::Long(7)));
        assert_eq!(row.get("table"), None);
    }

    #[test]
    fn a_new_annotation_block_starts_a_new_schema() {
        let body = "\
#group,false,false,false
#datatype,string,long,string
#default,_result,,
,result,table,_value
,,0,frontend

#group,false,false,false,false
#datatype,string,long,double,boolean
#default,_result,,,
,result,table,load,healthy
,,1,0.5,true
";
        let tables = tables(body);
        assert_eq!(tables.len(), 2);
        assert_eq!(tables[0].columns().len(), 1);
        let row = tables[1].rows().next().unwrap();
        assert_eq!(row.get("load"), Some(&Value::Double(0.5)));
        assert_eq!(row.get("healthy"), Some(&Value::Boolean(true)));
    }

    #[test]
    fn empty_cells_use_the_default_or_become_null() {
        let body = "\
#group,false,false,false,false
#datatype,string,long,string,long
#default,_result,,unknown,
,result,table,kind,count
,,0,,
";
        let tables = tables(body);
        let row = tables[0].rows().next().unwrap();
        assert_eq!(row.get("kind"), Some(&Value::String("unknown".to_string())));
        assert_eq!(row.get("count"), Some(&Value::Null));
    }

    #[test]
    fn quoted_cells_keep_their_commas() {
        let body = "\
#group,false,false,false
#datatype,string,long,string
#default,_result,,
,result,table,references
,,0,\"child-of:1:2,follows-from:1:3\"
";
        let tables = tables(body);
        let row = tables[0].rows().next().unwrap();
        assert_eq!(
            row.get("references").and_then(Value::as_str),
            Some("child-of:1:2,follows-from:1:3")
        );
    }

    #[test]
    fn empty_body_has_no_tables() {
        assert!(tables("").is_empty());
        assert!(tables("\r\n").is_empty());
    }

    #[test]
    fn error_block_is_reported_as_a_failed_query() {
        let body = "\
#datatype,string,string
#group,true,true
#default,,
,error,reference
,\"error calling function \"\"filter\"\"\",897
";
        let mut result = FluxResult::from_csv(body);
        match result.next() {
            Some(Err(TableError::QueryFailed { message, reference })) => {
                assert_eq!(message, "error calling function \"filter\"");
                assert_eq!(reference, "897");
            }
            other => panic!("expected a failed query, got {other:?}"),
        }
        assert!(result.next().is_none());
    }

    #[test]
    fn header_without_datatypes_is_rejected() {
        let body = ",result,table,_value\n,,0,x\n";
        let err = FluxResult::from_csv(body).next().unwrap().unwrap_err();
        assert!(matches!(err, TableError::MissingDatatypeAnnotation));
    }

    #[test]
    fn short_rows_are_rejected() {
        let body = "\
#datatype,string,long,string
,result,table,_value
,,0
";
        let err = FluxResult::from_csv(body).next().unwrap().unwrap_err();
        assert!(matches!(
            err,
            TableError::ColumnCount {
                expected: 4,
                found: 3
            }
        ));
    }

    #[test]
    fn unparsable_cells_stop_the_stream() {
        let body = "\
#datatype,string,long,dateTime:RFC3339
,result,table,_time
,,0,yesterday
,,1,2023-01-01T00:00:00Z
";
        let mut result = FluxResult::from_csv(body);
        assert!(matches!(
            result.next(),
            Some(Err(TableError::InvalidValue { .. }))
        ));
        assert!(result.next().is_none());
    }
}
