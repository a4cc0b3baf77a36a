use std::env;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use tokio_postgres::error::SqlState;
use tokio_postgres::types::{FromSql, Type};
use tokio_postgres::{Client, Config, NoTls, Row};
use tracing::{debug, warn};

use common::{ColumnType, EntityId, Fault, MetricQuery, QueryExecutor, ResultSet, Table, Value};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type Lookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Datos de conexión al origen analítico.
#[derive(Clone, PartialEq, Eq)]
pub struct PgSettings {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub schema: String,
}

// La contraseña no sale en los logs
impl std::fmt::Debug for PgSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

impl PgSettings {
    pub fn from_env() -> Result<Self, Fault> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Fault> {
        let var = |key: &str| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| Fault::Configuration(format!("falta la variable {key}")))
        };

        let port_raw = var("AUGUR_PORT")?;
        let port = port_raw.parse::<u16>().map_err(|_| {
            Fault::Configuration(format!("AUGUR_PORT no es un puerto válido: {port_raw}"))
        })?;

        Ok(Self {
            host: var("AUGUR_HOST")?,
            port,
            database: var("AUGUR_DATABASE")?,
            username: var("AUGUR_USERNAME")?,
            password: var("AUGUR_PASSWORD")?,
            schema: var("AUGUR_SCHEMA")?,
        })
    }

    fn to_config(&self) -> Config {
        let mut config = Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .dbname(&self.database)
            .user(&self.username)
            .password(&self.password)
            .options(&format!("-c search_path={}", self.schema))
            .connect_timeout(CONNECT_TIMEOUT);
        config
    }
}

/// Ejecuta las métricas contra Postgres. El entorno se relee en cada
/// intento, así un entorno incompleto se reporta como fallo de configuración
/// de la invocación y no tumba el worker.
pub struct PostgresExecutor {
    lookup: Lookup,
}

impl PostgresExecutor {
    pub fn from_env() -> Self {
        Self {
            lookup: Arc::new(|key: &str| env::var(key).ok()),
        }
    }

    async fn connect(&self) -> Result<Client, Fault> {
        let settings = PgSettings::from_lookup(|key| (self.lookup)(key))?;
        debug!("conectando a {:?}", settings);

        let (client, connection) = settings
            .to_config()
            .connect(NoTls)
            .await
            .map_err(|e| connect_fault(&e))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("conexión a Postgres terminó con error: {}", e);
            }
        });

        Ok(client)
    }
}

#[async_trait]
impl QueryExecutor for PostgresExecutor {
    async fn execute(
        &self,
        query: &MetricQuery,
        entity_ids: &[EntityId],
    ) -> Result<ResultSet, Fault> {
        let client = self.connect().await?;

        let ids: Vec<i64> = entity_ids.to_vec();
        let rows = client
            .query(query.sql.as_str(), &[&ids])
            .await
            .map_err(|e| query_fault(&e))?;

        debug!("{}: {} filas para {} entidades", query.name, rows.len(), ids.len());

        let mut table = Table::new(query.schema.clone());
        for row in &rows {
            table
                .push_row(convert_row(query, row)?)
                .map_err(|e| Fault::Unclassified(e.to_string()))?;
        }

        Ok(ResultSet::new(table, query.entity_column.clone()))
    }
}

/* ---------------- clasificación de errores ---------------- */

fn connect_fault(e: &tokio_postgres::Error) -> Fault {
    classify_connect(e.code().map(SqlState::code), &e.to_string())
}

fn query_fault(e: &tokio_postgres::Error) -> Fault {
    classify_query(e.code().map(SqlState::code), e.is_closed(), &e.to_string())
}

/// Credenciales inválidas o base inexistente son de configuración;
/// cualquier otro error al conectar es de conectividad.
fn classify_connect(code: Option<&str>, message: &str) -> Fault {
    match code {
        Some("28P01") | Some("28000") | Some("3D000") => Fault::Configuration(message.to_string()),
        _ => Fault::Connectivity(message.to_string()),
    }
}

fn classify_query(code: Option<&str>, closed: bool, message: &str) -> Fault {
    if closed {
        return Fault::Connectivity(message.to_string());
    }
    match code {
        // clase 08: connection exception; 57P0x: el servidor se está cerrando
        Some(c) if c.starts_with("08") || c.starts_with("57P0") => {
            Fault::Connectivity(message.to_string())
        }
        _ => Fault::Unclassified(message.to_string()),
    }
}

/* ---------------- conversión de filas ---------------- */

fn convert_row(query: &MetricQuery, row: &Row) -> Result<Vec<Value>, Fault> {
    let expected = query.schema.columns();
    if row.len() < expected.len() {
        return Err(Fault::Unclassified(format!(
            "{}: la consulta devolvió {} columnas, se esperaban {}",
            query.name,
            row.len(),
            expected.len()
        )));
    }

    expected
        .iter()
        .enumerate()
        .map(|(idx, column)| {
            let pg_type = row.columns()[idx].type_();
            convert_cell(row, idx, pg_type, column.column_type).map_err(|msg| {
                Fault::Unclassified(format!("{}: columna {}: {}", query.name, column.name, msg))
            })
        })
        .collect()
}

fn convert_cell(row: &Row, idx: usize, pg_type: &Type, target: ColumnType) -> Result<Value, String> {
    let value = match target {
        ColumnType::Int64 => {
            if *pg_type == Type::INT8 {
                get::<i64>(row, idx)?.map(Value::Int64)
            } else if *pg_type == Type::INT4 {
                get::<i32>(row, idx)?.map(|v| Value::Int64(v.into()))
            } else if *pg_type == Type::INT2 {
                get::<i16>(row, idx)?.map(|v| Value::Int64(v.into()))
            } else {
                return Err(incompatible(pg_type, target));
            }
        }
        ColumnType::Float64 => {
            if *pg_type == Type::FLOAT8 {
                get::<f64>(row, idx)?.map(Value::Float64)
            } else if *pg_type == Type::FLOAT4 {
                get::<f32>(row, idx)?.map(|v| Value::Float64(v.into()))
            } else {
                return Err(incompatible(pg_type, target));
            }
        }
        ColumnType::Utf8 => get::<String>(row, idx)?.map(Value::Utf8),
        ColumnType::Boolean => get::<bool>(row, idx)?.map(Value::Boolean),
        ColumnType::Date => get::<NaiveDate>(row, idx)?.map(Value::Date),
        ColumnType::Timestamp => {
            if *pg_type == Type::TIMESTAMPTZ {
                get::<DateTime<Utc>>(row, idx)?.map(Value::Timestamp)
            } else if *pg_type == Type::TIMESTAMP {
                get::<NaiveDateTime>(row, idx)?.map(|v| Value::Timestamp(v.and_utc()))
            } else {
                return Err(incompatible(pg_type, target));
            }
        }
    };
    Ok(value.unwrap_or(Value::Null))
}

fn get<'a, T: FromSql<'a>>(row: &'a Row, idx: usize) -> Result<Option<T>, String> {
    row.try_get::<_, Option<T>>(idx).map_err(|e| e.to_string())
}

fn incompatible(pg_type: &Type, target: ColumnType) -> String {
    format!("tipo {} incompatible con {:?}", pg_type.name(), target)
}
