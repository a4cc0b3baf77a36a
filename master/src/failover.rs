use std::collections::{HashMap, HashSet};
use std::time::{Duration, SystemTime};

use chrono::Utc;
use tokio::time::sleep;
use tracing::{error, info, warn};

use common::{Fault, InvocationStatus, QueuedInvocation, WorkerId};

use crate::state::{lock, AppState};
use crate::{FAILOVER_SWEEP_INTERVAL_SECS, MAX_DELIVERIES, WORKER_HEARTBEAT_TIMEOUT_SECS};

/// Loop principal de tolerancia a fallos:
/// - detecta workers muertos (sin heartbeat)
/// - reencola sus invocaciones en vuelo
pub async fn run_failover_loop(state: AppState) {
    loop {
        sleep(Duration::from_secs(FAILOVER_SWEEP_INTERVAL_SECS)).await;
        sweep_once(&state, SystemTime::now());
    }
}

/// Una pasada de chequeo:
/// 1. marca workers muertos
/// 2. saca de in_flight las invocaciones de esos workers
/// 3. las reencola (si no superan MAX_DELIVERIES) o las marca Failed
///
/// Devuelve los workers marcados como muertos en esta pasada.
pub fn sweep_once(state: &AppState, now: SystemTime) -> Vec<WorkerId> {
    // 1) Detectar qué workers están muertos
    let mut newly_dead: Vec<WorkerId> = Vec::new();
    {
        let mut workers = lock(&state.workers);
        for (worker_id, meta) in workers.iter_mut() {
            if meta.dead {
                continue;
            }
            // last_heartbeat en el futuro: se ignora
            let Ok(elapsed) = now.duration_since(meta.last_heartbeat) else {
                continue;
            };
            if elapsed > Duration::from_secs(WORKER_HEARTBEAT_TIMEOUT_SECS) {
                meta.dead = true;
                newly_dead.push(worker_id.clone());
                warn!(
                    "marcando worker {} como DEAD (sin heartbeat hace {:?})",
                    worker_id, elapsed
                );
            }
        }
    }

    if newly_dead.is_empty() {
        return newly_dead;
    }

    let dead_set: HashSet<&WorkerId> = newly_dead.iter().collect();

    // 2) Separar las invocaciones en vuelo de los workers caídos
    let mut to_requeue: Vec<QueuedInvocation> = Vec::new();
    let mut to_fail: Vec<(QueuedInvocation, WorkerId)> = Vec::new();
    {
        let mut in_flight = lock(&state.in_flight);
        let mut alive = HashMap::new();

        for (id, inflight) in in_flight.drain() {
            if !dead_set.contains(&inflight.worker_id) {
                alive.insert(id, inflight);
                continue;
            }
            let invocation = inflight.invocation;
            if invocation.delivery < MAX_DELIVERIES {
                info!(
                    "reencolando invocación {} ({}) por caída del worker {} (entrega {})",
                    invocation.id, invocation.task_name, inflight.worker_id, invocation.delivery
                );
                to_requeue.push(invocation);
            } else {
                to_fail.push((invocation, inflight.worker_id));
            }
        }

        *in_flight = alive;
    }

    // 3) Reencolar al frente: ya esperaron su turno una vez
    if !to_requeue.is_empty() {
        let mut invocations = lock(&state.invocations);
        let mut queue = lock(&state.queue);
        for invocation in to_requeue.into_iter().rev() {
            if let Some(info) = invocations.get_mut(&invocation.id) {
                info.status = InvocationStatus::Queued;
            }
            queue.push_front(invocation);
        }
    }

    // 4) Las que agotaron las entregas quedan como Failed
    if !to_fail.is_empty() {
        let mut invocations = lock(&state.invocations);
        for (invocation, worker_id) in to_fail {
            error!(
                "TAREA FALLIDA: invocación {} ({}) superó {} entregas, último worker caído: {}",
                invocation.id, invocation.task_name, MAX_DELIVERIES, worker_id
            );
            if let Some(info) = invocations.get_mut(&invocation.id) {
                info.status = InvocationStatus::Failed;
                info.finished_at = Some(Utc::now());
                info.last_fault = Some(Fault::Connectivity(format!(
                    "worker {worker_id} caído durante la entrega {}",
                    invocation.delivery
                )));
            }
        }
    }

    newly_dead
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{InFlight, WorkerMeta};
    use common::{InvocationInfo, MetricCatalog};

    fn seed(state: &AppState, worker: &str, delivery: u32) -> String {
        let id = format!("inv-{delivery}");
        let queued = QueuedInvocation {
            id: id.clone(),
            task_name: "PR_FILE".into(),
            entity_ids: vec![1, 2],
            delivery,
        };
        lock(&state.invocations).insert(
            id.clone(),
            InvocationInfo {
                id: id.clone(),
                task_name: "PR_FILE".into(),
                entity_ids: vec![1, 2],
                fingerprint: "fp".into(),
                status: InvocationStatus::Running,
                submitted_at: Utc::now(),
                started_at: Some(Utc::now()),
                finished_at: None,
                attempts: 0,
                deliveries: delivery,
                last_fault: None,
            },
        );
        lock(&state.in_flight).insert(
            id.clone(),
            InFlight {
                invocation: queued,
                worker_id: worker.into(),
                started_at: SystemTime::now(),
            },
        );
        id
    }

    fn later() -> SystemTime {
        SystemTime::now() + Duration::from_secs(WORKER_HEARTBEAT_TIMEOUT_SECS + 1)
    }

    #[test]
    fn live_workers_are_left_alone() {
        let state = AppState::new(MetricCatalog::builtin());
        lock(&state.workers).insert("w1".into(), WorkerMeta::new("h".into(), 1));
        seed(&state, "w1", 1);

        assert!(sweep_once(&state, SystemTime::now()).is_empty());
        assert_eq!(lock(&state.in_flight).len(), 1);
    }

    #[test]
    fn dead_worker_invocation_is_requeued() {
        let state = AppState::new(MetricCatalog::builtin());
        lock(&state.workers).insert("w1".into(), WorkerMeta::new("h".into(), 1));
        let id = seed(&state, "w1", 1);

        assert_eq!(sweep_once(&state, later()), vec!["w1".to_string()]);

        assert!(lock(&state.in_flight).is_empty());
        assert_eq!(lock(&state.queue).front().map(|q| q.id.clone()), Some(id.clone()));
        assert_eq!(lock(&state.invocations)[&id].status, InvocationStatus::Queued);
        assert!(lock(&state.workers)["w1"].dead);
    }

    #[test]
    fn exhausted_deliveries_fail_the_invocation() {
        let state = AppState::new(MetricCatalog::builtin());
        lock(&state.workers).insert("w1".into(), WorkerMeta::new("h".into(), 1));
        let id = seed(&state, "w1", MAX_DELIVERIES);

        sweep_once(&state, later());

        assert!(lock(&state.queue).is_empty());
        let info = lock(&state.invocations)[&id].clone();
        assert_eq!(info.status, InvocationStatus::Failed);
        assert!(matches!(info.last_fault, Some(Fault::Connectivity(_))));
    }
}
