//! Transformaciones nombradas que una métrica aplica al resultado
//! combinado antes de partirlo. Cada paso es explícito y se prueba solo.

use chrono::{NaiveDate, Utc};
use thiserror::Error;

use crate::table::{Column, ColumnType, ResultSet, Table, TableSchema, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DateCutoff {
    /// Fecha UTC del momento en que se aplica
    Today,
    Fixed(NaiveDate),
}

impl DateCutoff {
    fn resolve(&self) -> NaiveDate {
        match self {
            DateCutoff::Today => Utc::now().date_naive(),
            DateCutoff::Fixed(d) => *d,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transform {
    /// Deja los primeros `width` caracteres de un texto (no bytes).
    TruncateText { column: String, width: usize },

    /// Pasa una columna Timestamp a Date (fecha UTC).
    TimestampToDate { column: String },

    /// Descarta las filas cuya fecha es nula o `>= cutoff`.
    KeepDateBefore { column: String, cutoff: DateCutoff },
}

#[derive(Debug, Error, PartialEq)]
pub enum TransformError {
    #[error("{transform}: la columna '{column}' no existe")]
    MissingColumn {
        transform: &'static str,
        column: String,
    },

    #[error("{transform}: la columna '{column}' es {found:?}, se esperaba {expected:?}")]
    ColumnType {
        transform: &'static str,
        column: String,
        expected: ColumnType,
        found: ColumnType,
    },
}

impl Transform {
    pub fn name(&self) -> &'static str {
        match self {
            Transform::TruncateText { .. } => "truncate_text",
            Transform::TimestampToDate { .. } => "timestamp_to_date",
            Transform::KeepDateBefore { .. } => "keep_date_before",
        }
    }

    fn column(&self) -> &str {
        match self {
            Transform::TruncateText { column, .. }
            | Transform::TimestampToDate { column }
            | Transform::KeepDateBefore { column, .. } => column,
        }
    }

    fn expected_type(&self) -> ColumnType {
        match self {
            Transform::TruncateText { .. } => ColumnType::Utf8,
            Transform::TimestampToDate { .. } => ColumnType::Timestamp,
            Transform::KeepDateBefore { .. } => ColumnType::Date,
        }
    }

    pub fn apply(&self, table: Table) -> Result<Table, TransformError> {
        let index = self.locate(table.schema())?;
        let (schema, rows) = table.into_parts();

        let table = match self {
            Transform::TruncateText { width, .. } => {
                let rows = rows
                    .into_iter()
                    .map(|mut row| {
                        if let Value::Utf8(s) = &mut row[index] {
                            let cut = s.char_indices().nth(*width).map(|(i, _)| i);
                            if let Some(cut) = cut {
                                s.truncate(cut);
                            }
                        }
                        row
                    })
                    .collect();
                Table::from_validated(schema, rows)
            }

            Transform::TimestampToDate { .. } => {
                let mut columns: Vec<Column> = schema.columns().to_vec();
                columns[index].column_type = ColumnType::Date;

                let rows = rows
                    .into_iter()
                    .map(|mut row| {
                        if let Value::Timestamp(t) = row[index] {
                            row[index] = Value::Date(t.date_naive());
                        }
                        row
                    })
                    .collect();
                Table::from_validated(TableSchema::new(columns), rows)
            }

            Transform::KeepDateBefore { cutoff, .. } => {
                let cutoff = cutoff.resolve();
                let rows = rows
                    .into_iter()
                    .filter(|row| matches!(row[index], Value::Date(d) if d < cutoff))
                    .collect();
                Table::from_validated(schema, rows)
            }
        };

        Ok(table)
    }

    fn locate(&self, schema: &TableSchema) -> Result<usize, TransformError> {
        let column = self.column();
        let index = schema
            .index_of(column)
            .ok_or_else(|| TransformError::MissingColumn {
                transform: self.name(),
                column: column.to_string(),
            })?;

        let found = schema.columns()[index].column_type;
        if found != self.expected_type() {
            return Err(TransformError::ColumnType {
                transform: self.name(),
                column: column.to_string(),
                expected: self.expected_type(),
                found,
            });
        }
        Ok(index)
    }
}

/// Aplica las transformaciones en orden.
pub fn apply_all(result: ResultSet, transforms: &[Transform]) -> Result<ResultSet, TransformError> {
    let ResultSet {
        mut table,
        entity_column,
    } = result;

    for t in transforms {
        table = t.apply(table)?;
    }

    Ok(ResultSet {
        table,
        entity_column,
    })
}
