//! Codec binario de particiones.
//!
//! Cada partición se escribe como un stream Arrow IPC: mensaje de esquema,
//! a lo sumo un record batch y marca de fin. El esquema viaja dentro del
//! buffer, así que decodificar no necesita contexto externo, y una tabla
//! sin filas sigue siendo un buffer válido.
//!
//! La versión del formato va en la metadata del esquema; un buffer de otra
//! versión se rechaza al decodificar (queda invalidado, no se reinterpreta).

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, Date32Array, Float64Array, Int64Array, StringArray,
    TimestampMicrosecondArray,
};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::error::ArrowError;
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use chrono::{DateTime, Datelike, NaiveDate};
use thiserror::Error;

use crate::table::{Column, ColumnType, Row, Table, TableError, TableSchema, Value};

pub const CODEC_VERSION: u32 = 1;

/// Clave de metadata del esquema Arrow donde se guarda la versión.
pub const CODEC_VERSION_KEY: &str = "cache.codec.version";

/// MIME con el que el master sirve los buffers.
pub const ARROW_STREAM_MIME: &str = "application/vnd.apache.arrow.stream";

const TIMEZONE: &str = "UTC";

// Días entre 0001-01-01 (CE) y 1970-01-01
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("error de arrow: {0}")]
    Arrow(#[from] ArrowError),

    #[error("tipo no soportado en la columna '{column}': {data_type}")]
    UnsupportedType { column: String, data_type: String },

    #[error("valor inválido en la columna '{column}', se esperaba {expected:?}")]
    ValueType { column: String, expected: ColumnType },

    #[error("valor fuera de rango en la columna '{column}'")]
    OutOfRange { column: String },

    #[error("versión de codec incompatible: {found:?} (esperada {expected})")]
    VersionMismatch { found: Option<String>, expected: u32 },

    #[error(transparent)]
    Table(#[from] TableError),
}

/// Serializa una tabla a un buffer Arrow IPC.
pub fn encode(table: &Table) -> Result<Vec<u8>, CodecError> {
    let schema = Arc::new(arrow_schema(table.schema()));

    let columns = table
        .schema()
        .columns()
        .iter()
        .enumerate()
        .map(|(i, column)| build_array(column, i, table.rows()))
        .collect::<Result<Vec<_>, _>>()?;

    let mut buffer = Vec::new();
    {
        let mut writer = StreamWriter::try_new(&mut buffer, &schema)?;
        if !table.is_empty() {
            let options = RecordBatchOptions::new().with_row_count(Some(table.num_rows()));
            let batch = RecordBatch::try_new_with_options(schema.clone(), columns, &options)?;
            writer.write(&batch)?;
        }
        writer.finish()?;
    }

    Ok(buffer)
}

/// Reconstruye la tabla desde un buffer producido por [`encode`].
pub fn decode(bytes: &[u8]) -> Result<Table, CodecError> {
    let reader = StreamReader::try_new(bytes, None)?;

    let arrow_schema = reader.schema();
    check_version(&arrow_schema)?;
    let schema = table_schema(&arrow_schema)?;

    let mut rows: Vec<Row> = Vec::new();
    for batch in reader {
        let batch = batch?;
        append_rows(&schema, &batch, &mut rows)?;
    }

    Ok(Table::try_new(schema, rows)?)
}

fn arrow_schema(schema: &TableSchema) -> Schema {
    let fields: Vec<Field> = schema
        .columns()
        .iter()
        .map(|c| Field::new(c.name.as_str(), arrow_type(c.column_type), true))
        .collect();

    let metadata = HashMap::from([(CODEC_VERSION_KEY.to_string(), CODEC_VERSION.to_string())]);
    Schema::new(fields).with_metadata(metadata)
}

fn arrow_type(column_type: ColumnType) -> DataType {
    match column_type {
        ColumnType::Int64 => DataType::Int64,
        ColumnType::Float64 => DataType::Float64,
        ColumnType::Utf8 => DataType::Utf8,
        ColumnType::Boolean => DataType::Boolean,
        ColumnType::Date => DataType::Date32,
        ColumnType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, Some(TIMEZONE.into())),
    }
}

fn check_version(schema: &Schema) -> Result<(), CodecError> {
    let found = schema.metadata().get(CODEC_VERSION_KEY);
    if found.map(String::as_str) == Some(CODEC_VERSION.to_string().as_str()) {
        Ok(())
    } else {
        Err(CodecError::VersionMismatch {
            found: found.cloned(),
            expected: CODEC_VERSION,
        })
    }
}

fn table_schema(schema: &Schema) -> Result<TableSchema, CodecError> {
    let columns = schema
        .fields()
        .iter()
        .map(|field| {
            let column_type = match field.data_type() {
                DataType::Int64 => ColumnType::Int64,
                DataType::Float64 => ColumnType::Float64,
                DataType::Utf8 => ColumnType::Utf8,
                DataType::Boolean => ColumnType::Boolean,
                DataType::Date32 => ColumnType::Date,
                DataType::Timestamp(TimeUnit::Microsecond, _) => ColumnType::Timestamp,
                other => {
                    return Err(CodecError::UnsupportedType {
                        column: field.name().clone(),
                        data_type: other.to_string(),
                    })
                }
            };
            Ok(Column::new(field.name().as_str(), column_type))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(TableSchema::new(columns))
}

/* ---------- escritura: filas -> columnas ---------- */

fn build_array(column: &Column, index: usize, rows: &[Row]) -> Result<ArrayRef, CodecError> {
    let cells = || rows.iter().map(move |row| &row[index]);

    let array: ArrayRef = match column.column_type {
        ColumnType::Int64 => Arc::new(Int64Array::from(collect_cells(column, cells(), |v| {
            match v {
                Value::Int64(x) => Some(*x),
                _ => None,
            }
        })?)),
        ColumnType::Float64 => Arc::new(Float64Array::from(collect_cells(column, cells(), |v| {
            match v {
                Value::Float64(x) => Some(*x),
                _ => None,
            }
        })?)),
        ColumnType::Utf8 => Arc::new(StringArray::from(collect_cells(column, cells(), |v| match v {
            Value::Utf8(x) => Some(x.clone()),
            _ => None,
        })?)),
        ColumnType::Boolean => Arc::new(BooleanArray::from(collect_cells(column, cells(), |v| {
            match v {
                Value::Boolean(x) => Some(*x),
                _ => None,
            }
        })?)),
        ColumnType::Date => Arc::new(Date32Array::from(collect_cells(column, cells(), |v| match v {
            Value::Date(d) => Some(d.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE),
            _ => None,
        })?)),
        ColumnType::Timestamp => Arc::new(
            TimestampMicrosecondArray::from(collect_cells(column, cells(), |v| match v {
                Value::Timestamp(t) => Some(t.timestamp_micros()),
                _ => None,
            })?)
            .with_timezone(TIMEZONE),
        ),
    };

    Ok(array)
}

fn collect_cells<'a, T>(
    column: &Column,
    cells: impl Iterator<Item = &'a Value>,
    extract: impl Fn(&Value) -> Option<T>,
) -> Result<Vec<Option<T>>, CodecError> {
    cells
        .map(|value| {
            if value.is_null() {
                return Ok(None);
            }
            extract(value).map(Some).ok_or_else(|| CodecError::ValueType {
                column: column.name.clone(),
                expected: column.column_type,
            })
        })
        .collect()
}

/* ---------- lectura: columnas -> filas ---------- */

fn append_rows(
    schema: &TableSchema,
    batch: &RecordBatch,
    rows: &mut Vec<Row>,
) -> Result<(), CodecError> {
    let columns: Vec<Vec<Value>> = schema
        .columns()
        .iter()
        .zip(batch.columns())
        .map(|(column, array)| column_values(column, array.as_ref()))
        .collect::<Result<_, _>>()?;

    for r in 0..batch.num_rows() {
        rows.push(columns.iter().map(|values| values[r].clone()).collect());
    }
    Ok(())
}

fn column_values(column: &Column, array: &dyn Array) -> Result<Vec<Value>, CodecError> {
    match column.column_type {
        ColumnType::Int64 => read::<Int64Array>(column, array, |a, i| Some(Value::Int64(a.value(i)))),
        ColumnType::Float64 => {
            read::<Float64Array>(column, array, |a, i| Some(Value::Float64(a.value(i))))
        }
        ColumnType::Utf8 => {
            read::<StringArray>(column, array, |a, i| Some(Value::Utf8(a.value(i).to_string())))
        }
        ColumnType::Boolean => {
            read::<BooleanArray>(column, array, |a, i| Some(Value::Boolean(a.value(i))))
        }
        ColumnType::Date => read::<Date32Array>(column, array, |a, i| {
            a.value(i)
                .checked_add(UNIX_EPOCH_DAYS_FROM_CE)
                .and_then(NaiveDate::from_num_days_from_ce_opt)
                .map(Value::Date)
        }),
        ColumnType::Timestamp => read::<TimestampMicrosecondArray>(column, array, |a, i| {
            DateTime::from_timestamp_micros(a.value(i)).map(Value::Timestamp)
        }),
    }
}

fn read<A: Array + 'static>(
    column: &Column,
    array: &dyn Array,
    value_at: impl Fn(&A, usize) -> Option<Value>,
) -> Result<Vec<Value>, CodecError> {
    let typed = array
        .as_any()
        .downcast_ref::<A>()
        .ok_or_else(|| CodecError::UnsupportedType {
            column: column.name.clone(),
            data_type: array.data_type().to_string(),
        })?;

    (0..typed.len())
        .map(|i| {
            if typed.is_null(i) {
                Ok(Value::Null)
            } else {
                value_at(typed, i).ok_or_else(|| CodecError::OutOfRange {
                    column: column.name.clone(),
                })
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn assignee_schema() -> TableSchema {
        TableSchema::new(vec![
            Column::new("pull_request_id", ColumnType::Int64),
            Column::new("id", ColumnType::Int64),
            Column::new("created", ColumnType::Date),
            Column::new("assign_date", ColumnType::Timestamp),
            Column::new("assign", ColumnType::Utf8),
            Column::new("score", ColumnType::Float64),
            Column::new("merged", ColumnType::Boolean),
        ])
    }

    fn sample_table() -> Table {
        let ts = chrono::Utc
            .with_ymd_and_hms(2023, 5, 17, 8, 30, 0)
            .unwrap()
            + chrono::Duration::microseconds(123_456);

        Table::try_new(
            assignee_schema(),
            vec![
                vec![
                    Value::Int64(9001),
                    Value::Int64(101),
                    Value::Date(NaiveDate::from_ymd_opt(2023, 5, 16).unwrap()),
                    Value::Timestamp(ts),
                    Value::Utf8("assigned".into()),
                    Value::Float64(0.75),
                    Value::Boolean(true),
                ],
                vec![
                    Value::Int64(9002),
                    Value::Int64(101),
                    Value::Date(NaiveDate::from_ymd_opt(1969, 12, 31).unwrap()),
                    Value::Null,
                    Value::Null,
                    Value::Null,
                    Value::Boolean(false),
                ],
            ],
        )
        .unwrap()
    }

    #[test]
    fn decode_reproduces_rows_names_and_nulls() {
        let table = sample_table();
        let buf = encode(&table).unwrap();
        let back = decode(&buf).unwrap();

        assert_eq!(back, table);
        let names: Vec<&str> = back.schema().columns().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["pull_request_id", "id", "created", "assign_date", "assign", "score", "merged"]
        );
    }

    #[test]
    fn zero_row_table_is_still_decodable() {
        let table = Table::new(assignee_schema());
        let buf = encode(&table).unwrap();
        assert!(!buf.is_empty());

        let back = decode(&buf).unwrap();
        assert!(back.is_empty());
        assert_eq!(back.schema(), table.schema());
    }

    #[test]
    fn buffer_carries_codec_version() {
        let buf = encode(&sample_table()).unwrap();
        let reader = StreamReader::try_new(buf.as_slice(), None).unwrap();
        assert_eq!(
            reader.schema().metadata().get(CODEC_VERSION_KEY).map(String::as_str),
            Some("1")
        );
    }

    #[test]
    fn rejects_buffers_from_other_versions() {
        // Stream escrito a mano sin la metadata de versión
        let schema = Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, true)]));
        let mut buf = Vec::new();
        {
            let mut writer = StreamWriter::try_new(&mut buf, &schema).unwrap();
            writer.finish().unwrap();
        }

        assert!(matches!(
            decode(&buf),
            Err(CodecError::VersionMismatch { found: None, expected: 1 })
        ));
    }

    #[test]
    fn date_beyond_chrono_range_is_out_of_range() {
        let metadata = HashMap::from([(CODEC_VERSION_KEY.to_string(), CODEC_VERSION.to_string())]);
        let schema = Arc::new(
            Schema::new(vec![Field::new("created", DataType::Date32, true)]).with_metadata(metadata),
        );
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![Arc::new(Date32Array::from(vec![Some(i32::MAX)])) as ArrayRef],
        )
        .unwrap();

        let mut buf = Vec::new();
        {
            let mut writer = StreamWriter::try_new(&mut buf, &schema).unwrap();
            writer.write(&batch).unwrap();
            writer.finish().unwrap();
        }

        assert!(matches!(
            decode(&buf),
            Err(CodecError::OutOfRange { column }) if column == "created"
        ));
    }

    #[test]
    fn garbage_input_is_an_arrow_error() {
        // marca de continuación + largo 8, seguido de bytes que no son un mensaje IPC
        let buf = b"\xff\xff\xff\xff\x08\x00\x00\x00garbage!";
        assert!(matches!(decode(buf), Err(CodecError::Arrow(_))));
    }
}
