use async_trait::async_trait;

use crate::fault::Fault;
use crate::metrics::MetricQuery;
use crate::table::ResultSet;
use crate::task::EntityId;

/// Origen de datos analítico.
///
/// Ejecuta la consulta de una métrica una sola vez para todo el lote y
/// devuelve el resultado combinado con el esquema de la métrica.
/// Los errores deben llegar clasificados: `Configuration` para entorno o
/// credenciales, `Connectivity` para fallos transitorios de red.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(
        &self,
        query: &MetricQuery,
        entity_ids: &[EntityId],
    ) -> Result<ResultSet, Fault>;
}
