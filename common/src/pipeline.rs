use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::cache::CacheStore;
use crate::codec::{self, CodecError};
use crate::executor::QueryExecutor;
use crate::fault::Fault;
use crate::metrics::MetricCatalog;
use crate::partition::partition;
use crate::retry::RetryPolicy;
use crate::task::{Acknowledgment, EntityId, TaskInvocation};
use crate::transform;

/// Dependencias de un worker, inyectadas al construirlo.
#[derive(Clone)]
pub struct WorkerContext {
    pub executor: Arc<dyn QueryExecutor>,
    pub cache: Arc<dyn CacheStore>,
    pub retry: RetryPolicy,
    pub catalog: MetricCatalog,
}

/// Invocación abandonada: se agotaron los intentos o el fallo no admite
/// reintento. Siempre se reporta, nunca se descarta en silencio.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("tarea {task_name} abandonada tras {attempts} intento(s): {last_fault}")]
pub struct TaskFailure {
    pub task_name: String,
    pub attempts: u32,

    /// Demoras aplicadas entre intentos, en orden
    pub delays: Vec<Duration>,

    pub last_fault: Fault,
}

/// Ejecuta el pipeline consulta -> partición -> codec -> cache.
pub struct TaskWorker {
    ctx: WorkerContext,
}

impl TaskWorker {
    pub fn new(ctx: WorkerContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &WorkerContext {
        &self.ctx
    }

    /// Corre una invocación completa, reintentando con backoff los fallos
    /// reintentables hasta `max_attempts` intentos en total.
    pub async fn run(
        &self,
        task_name: &str,
        entity_ids: &[EntityId],
    ) -> Result<Acknowledgment, TaskFailure> {
        self.run_counted(task_name, entity_ids)
            .await
            .map(|(ack, _)| ack)
    }

    /// Igual que `run`, pero devuelve también cuántos intentos hicieron falta.
    pub async fn run_counted(
        &self,
        task_name: &str,
        entity_ids: &[EntityId],
    ) -> Result<(Acknowledgment, u32), TaskFailure> {
        let mut invocation = TaskInvocation::new(task_name, entity_ids.to_vec());
        let mut delays = Vec::new();

        loop {
            match self.attempt(&invocation).await {
                Ok(ack) => {
                    info!(
                        "{} terminó con {:?} (intento {})",
                        task_name, ack, invocation.attempt
                    );
                    return Ok((ack, invocation.attempt));
                }
                Err(fault) => {
                    if !self.ctx.retry.should_retry(&fault, invocation.attempt) {
                        let failure = TaskFailure {
                            task_name: task_name.to_string(),
                            attempts: invocation.attempt,
                            delays,
                            last_fault: fault,
                        };
                        error!("{}", failure);
                        return Err(failure);
                    }

                    let delay = self.ctx.retry.delay_for(invocation.attempt);
                    warn!(
                        "{} falló en el intento {}/{} ({}), reintentando en {:?}",
                        task_name, invocation.attempt, self.ctx.retry.max_attempts, fault, delay
                    );
                    delays.push(delay);
                    tokio::time::sleep(delay).await;
                    invocation.attempt += 1;
                }
            }
        }
    }

    /// Un solo intento.
    ///
    /// `Ok` lleva un resultado terminal (Success, FatalFailure o NoOp);
    /// `Err` es un fallo que el runtime puede reintentar.
    pub async fn attempt(&self, invocation: &TaskInvocation) -> Result<Acknowledgment, Fault> {
        let task_name = invocation.task_name.as_str();
        info!("{}_DATA_QUERY - START (intento {})", task_name, invocation.attempt);

        if invocation.entity_ids.is_empty() {
            debug!("{} sin entidades, nada que hacer", task_name);
            return Ok(Acknowledgment::NoOp);
        }

        let Some(query) = self.ctx.catalog.get(task_name) else {
            error!("{}_DATA_QUERY - MÉTRICA DESCONOCIDA", task_name);
            return Ok(Acknowledgment::FatalFailure);
        };

        // 1) Consulta única para todo el lote
        let result = match self.ctx.executor.execute(query, &invocation.entity_ids).await {
            Ok(result) => result,
            Err(Fault::Configuration(msg)) => {
                error!("{}_DATA_QUERY - ENTORNO INCOMPLETO: {}", task_name, msg);
                return Ok(Acknowledgment::FatalFailure);
            }
            Err(fault) => {
                warn!("{}_DATA_QUERY - FALLÓ LA CONSULTA: {}", task_name, fault);
                return Err(fault);
            }
        };

        if result.table.schema() != &query.schema {
            return Err(Fault::Unclassified(format!(
                "el resultado de {} no coincide con el esquema de la métrica",
                task_name
            )));
        }

        // 2) Normalización y partición por entidad
        let result = transform::apply_all(result, &query.transforms)?;
        let partitions = partition(&result, &invocation.entity_ids)?;
        drop(result);

        // 3) Codificar cada partición
        let entries = partitions
            .into_iter()
            .map(|p| codec::encode(&p.table).map(|bytes| (p.entity_id, bytes)))
            .collect::<Result<Vec<_>, CodecError>>()?;

        // 4) Un único lote al cache, sobrescribiendo las claves de esta invocación
        let identity = invocation.identity();
        let count = entries.len();
        let committed = self.ctx.cache.write_batch(&identity, entries).await?;
        if !committed {
            return Err(Fault::Connectivity(format!(
                "el cache no confirmó el lote {}",
                identity
            )));
        }

        info!("{}_DATA_QUERY - END ({} particiones en {})", task_name, count, identity);
        Ok(Acknowledgment::Success)
    }
}
