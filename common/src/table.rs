use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Tipos de columna soportados por las métricas.
/// Todas las columnas admiten nulos.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Int64,
    Float64,
    Utf8,
    Boolean,
    Date,
    /// Instante UTC con precisión de microsegundos
    Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int64(i64),
    Float64(f64),
    Utf8(String),
    Boolean(bool),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
}

impl Value {
    /// Tipo del valor; `None` para nulos (compatibles con cualquier columna).
    pub fn column_type(&self) -> Option<ColumnType> {
        match self {
            Value::Null => None,
            Value::Int64(_) => Some(ColumnType::Int64),
            Value::Float64(_) => Some(ColumnType::Float64),
            Value::Utf8(_) => Some(ColumnType::Utf8),
            Value::Boolean(_) => Some(ColumnType::Boolean),
            Value::Date(_) => Some(ColumnType::Date),
            Value::Timestamp(_) => Some(ColumnType::Timestamp),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::Float64(v) => write!(f, "{v}"),
            Value::Utf8(v) => write!(f, "{v}"),
            Value::Boolean(v) => write!(f, "{v}"),
            Value::Date(v) => write!(f, "{v}"),
            Value::Timestamp(v) => write!(f, "{}", v.to_rfc3339_opts(SecondsFormat::Micros, true)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// Esquema fijo (nombres y tipos, en orden) de una tabla de resultados.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TableSchema {
    columns: Vec<Column>,
}

impl TableSchema {
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }
}

pub type Row = Vec<Value>;

#[derive(Debug, Error, PartialEq)]
pub enum TableError {
    #[error("la fila {row} tiene {found} valores, se esperaban {expected}")]
    WidthMismatch {
        row: usize,
        expected: usize,
        found: usize,
    },

    #[error("fila {row}, columna '{column}': se esperaba {expected:?}, llegó {found:?}")]
    TypeMismatch {
        row: usize,
        column: String,
        expected: ColumnType,
        found: ColumnType,
    },
}

/// Tabla tipada: cada fila tiene exactamente una celda por columna
/// y cada celda no nula coincide con el tipo de su columna.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    schema: TableSchema,
    rows: Vec<Row>,
}

impl Table {
    /// Tabla vacía (cero filas) con el esquema dado.
    pub fn new(schema: TableSchema) -> Self {
        Self {
            schema,
            rows: Vec::new(),
        }
    }

    pub fn try_new(schema: TableSchema, rows: Vec<Row>) -> Result<Self, TableError> {
        for (i, row) in rows.iter().enumerate() {
            validate_row(&schema, i, row)?;
        }
        Ok(Self { schema, rows })
    }

    /// Sólo para filas que ya vienen de una tabla validada con el mismo esquema.
    pub(crate) fn from_validated(schema: TableSchema, rows: Vec<Row>) -> Self {
        Self { schema, rows }
    }

    pub fn push_row(&mut self, row: Row) -> Result<(), TableError> {
        validate_row(&self.schema, self.rows.len(), &row)?;
        self.rows.push(row);
        Ok(())
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn into_parts(self) -> (TableSchema, Vec<Row>) {
        (self.schema, self.rows)
    }
}

fn validate_row(schema: &TableSchema, index: usize, row: &Row) -> Result<(), TableError> {
    if row.len() != schema.len() {
        return Err(TableError::WidthMismatch {
            row: index,
            expected: schema.len(),
            found: row.len(),
        });
    }

    for (column, value) in schema.columns().iter().zip(row) {
        if let Some(found) = value.column_type() {
            if found != column.column_type {
                return Err(TableError::TypeMismatch {
                    row: index,
                    column: column.name.clone(),
                    expected: column.column_type,
                    found,
                });
            }
        }
    }

    Ok(())
}

/// Resultado combinado de una consulta: la tabla más el nombre de la
/// columna que identifica a qué entidad pertenece cada fila.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultSet {
    pub table: Table,
    pub entity_column: String,
}

impl ResultSet {
    pub fn new(table: Table, entity_column: impl Into<String>) -> Self {
        Self {
            table,
            entity_column: entity_column.into(),
        }
    }
}
