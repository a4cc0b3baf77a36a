use anyhow::{Context, Result};
use common::{
    Acknowledgment, MetricCatalog, QueuedInvocation, TaskAssignmentRequest,
    TaskAssignmentResponse, TaskCompleteRequest, TaskFailure, TaskOutcome, TaskWorker,
    WorkerContext, WorkerHeartbeatRequest, WorkerRegisterRequest, WorkerRegisterResponse,
};
use reqwest::Client;
use std::{sync::Arc, time::Duration};
use sysinfo::{CpuExt, System, SystemExt};
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::cache_client::HttpCacheStore;
use crate::config::WorkerConfig;
use crate::postgres::{PgSettings, PostgresExecutor};

/// Loop principal del worker.
/// - Se registra en el master.
/// - Hace heartbeats periódicos.
/// - Pide invocaciones mientras tenga "slots" libres.
/// - Corre cada invocación en paralelo (hasta WORKER_CONCURRENCY).
pub async fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("worker=debug,common=debug,reqwest=info")),
        )
        .init();

    let config = WorkerConfig::from_env();
    let base_url = config.master_base_url.clone();
    let client = Client::new();

    // Sólo aviso: el entorno se vuelve a leer en cada intento
    if let Err(fault) = PgSettings::from_env() {
        warn!("{} (las invocaciones terminarán en FATAL_FAILURE)", fault);
    }

    let hostname = hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();

    // Registro de worker (enviando max_concurrency)
    let register_url = format!("{}/api/v1/workers/register", base_url);
    let res = client
        .post(&register_url)
        .json(&WorkerRegisterRequest {
            hostname,
            max_concurrency: config.max_concurrency,
        })
        .send()
        .await
        .with_context(|| format!("no se pudo registrar en {register_url}"))?;
    let WorkerRegisterResponse { worker_id } = res.json().await?;

    info!(
        "worker {} registrado con concurrency={} contra {} (reintentos: {:?})",
        worker_id, config.max_concurrency, base_url, config.retry
    );

    let task_worker = Arc::new(TaskWorker::new(WorkerContext {
        executor: Arc::new(PostgresExecutor::from_env()),
        cache: Arc::new(HttpCacheStore::new(client.clone(), base_url.clone())),
        retry: config.retry.clone(),
        catalog: MetricCatalog::builtin(),
    }));

    let sem = Arc::new(Semaphore::new(config.max_concurrency as usize));

    // System para leer CPU y memoria
    let mut sys = System::new_all();

    loop {
        // --------- Heartbeat al master con CPU/MEM ---------
        sys.refresh_cpu();
        sys.refresh_memory();

        let cpu_percent = sys.global_cpu_info().cpu_usage();
        // used_memory devuelve KB -> lo pasamos a bytes
        let mem_bytes = sys.used_memory() * 1024;

        let hb_url = format!("{}/api/v1/workers/heartbeat", base_url);
        if let Err(e) = client
            .post(&hb_url)
            .json(&WorkerHeartbeatRequest {
                worker_id: worker_id.clone(),
                cpu_percent: Some(cpu_percent),
                mem_bytes: Some(mem_bytes),
            })
            .send()
            .await
        {
            warn!("heartbeat falló: {}", e);
        }

        // --------- Control de concurrencia local ---------
        let permit = match sem.clone().try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                // No hay capacidad para nuevas invocaciones; esperamos un poco
                sleep(Duration::from_millis(500)).await;
                continue;
            }
        };

        // Pedimos invocación al master
        let assignment = match claim(&client, &base_url, &worker_id).await {
            Ok(a) => a,
            Err(e) => {
                drop(permit);
                warn!("no se pudo pedir tarea al master: {:#}", e);
                sleep(Duration::from_secs(2)).await;
                continue;
            }
        };

        if let Some(invocation) = assignment.invocation {
            info!(
                "tengo invocación {} ({} sobre {} entidades, entrega {})",
                invocation.id,
                invocation.task_name,
                invocation.entity_ids.len(),
                invocation.delivery
            );

            let client_cloned = client.clone();
            let base_url_cloned = base_url.clone();
            let worker_id_cloned = worker_id.clone();
            let task_worker = task_worker.clone();

            tokio::spawn(async move {
                let result = task_worker
                    .run_counted(&invocation.task_name, &invocation.entity_ids)
                    .await;
                let outcome = outcome_of(result);

                // Reportar al master el resultado final
                if let Err(e) =
                    report(&client_cloned, &base_url_cloned, &worker_id_cloned, &invocation, outcome).await
                {
                    error!(
                        "no se pudo reportar el resultado de la invocación {}: {:#}",
                        invocation.id, e
                    );
                }

                // Liberar el "slot" de concurrencia al terminar
                drop(permit);
            });
        } else {
            // No hay invocación: devolvemos el permiso y dormimos
            drop(permit);
            info!("worker {} pidió tarea pero no hay", worker_id);
            sleep(Duration::from_secs(2)).await;
        }
    }
}

async fn claim(client: &Client, base_url: &str, worker_id: &str) -> Result<TaskAssignmentResponse> {
    let assign_url = format!("{}/api/v1/tasks/next", base_url);
    let res = client
        .post(&assign_url)
        .json(&TaskAssignmentRequest {
            worker_id: worker_id.to_string(),
        })
        .send()
        .await?
        .error_for_status()?;
    Ok(res.json().await?)
}

async fn report(
    client: &Client,
    base_url: &str,
    worker_id: &str,
    invocation: &QueuedInvocation,
    outcome: TaskOutcome,
) -> Result<()> {
    let complete_url = format!("{}/api/v1/tasks/complete", base_url);
    client
        .post(&complete_url)
        .json(&TaskCompleteRequest {
            worker_id: worker_id.to_string(),
            invocation_id: invocation.id.clone(),
            outcome,
        })
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}

/// Traduce el resultado del pipeline al mensaje que espera el master.
fn outcome_of(result: Result<(Acknowledgment, u32), TaskFailure>) -> TaskOutcome {
    match result {
        Ok((ack, attempts)) => TaskOutcome::Acknowledged { ack, attempts },
        Err(failure) => TaskOutcome::Failed {
            attempts: failure.attempts,
            fault: failure.last_fault,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Fault;

    #[test]
    fn acknowledgment_keeps_the_attempt_count() {
        assert_eq!(
            outcome_of(Ok((Acknowledgment::Success, 2))),
            TaskOutcome::Acknowledged {
                ack: Acknowledgment::Success,
                attempts: 2
            }
        );
    }

    #[test]
    fn exhausted_retries_carry_the_last_fault() {
        let failure = TaskFailure {
            task_name: "PR_FILE".into(),
            attempts: 5,
            delays: vec![Duration::from_secs(1); 4],
            last_fault: Fault::Connectivity("timeout".into()),
        };
        assert_eq!(
            outcome_of(Err(failure)),
            TaskOutcome::Failed {
                attempts: 5,
                fault: Fault::Connectivity("timeout".into())
            }
        );
    }
}
