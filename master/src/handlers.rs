use axum::{
    extract::{DefaultBodyLimit, Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use common::codec::ARROW_STREAM_MIME;
use common::task::fingerprint;
use common::{
    Acknowledgment, CacheBatchRequest, CacheBatchResponse, CacheKey, CacheStore, EntityId,
    InvocationInfo, InvocationRequest, InvocationStatus, QueuedInvocation, TaskAssignmentRequest,
    TaskAssignmentResponse, TaskCompleteRequest, TaskCompleteResponse, TaskIdentity, TaskOutcome,
    WorkerHeartbeatRequest, WorkerHeartbeatResponse, WorkerId, WorkerMetrics,
    WorkerRegisterRequest, WorkerRegisterResponse,
};
use std::collections::HashMap;
use std::time::SystemTime;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::state::{lock, AppState, InFlight, WorkerMeta};

// Los lotes de cache traen buffers en base64; el límite por defecto de axum (2MB) queda corto
const CACHE_BODY_LIMIT: usize = 64 * 1024 * 1024;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/metrics", get(list_metrics))
        .route("/api/v1/tasks", post(create_invocation))
        .route("/api/v1/tasks/:id", get(get_invocation))
        .route("/api/v1/tasks/next", post(assign_task))
        .route("/api/v1/tasks/complete", post(complete_task))
        .route("/api/v1/workers", get(list_workers))
        .route("/api/v1/workers/register", post(register_worker))
        .route("/api/v1/workers/heartbeat", post(worker_heartbeat))
        .route("/api/v1/cache/batch", put(write_cache_batch))
        .route(
            "/api/v1/cache/:task_name/:fingerprint/:entity_id",
            get(read_cache_entry),
        )
        .layer(DefaultBodyLimit::max(CACHE_BODY_LIMIT))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

async fn list_metrics(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.catalog.names())
}

// Encola una invocación nueva; el caller consulta el estado después
async fn create_invocation(
    State(state): State<AppState>,
    Json(req): Json<InvocationRequest>,
) -> Result<Json<InvocationInfo>, StatusCode> {
    if !state.catalog.contains(&req.task_name) {
        warn!("invocación rechazada: métrica {} desconocida", req.task_name);
        return Err(StatusCode::NOT_FOUND);
    }

    let id = uuid::Uuid::new_v4().to_string();
    let info = InvocationInfo {
        id: id.clone(),
        fingerprint: fingerprint(&req.task_name, &req.entity_ids),
        task_name: req.task_name.clone(),
        entity_ids: req.entity_ids.clone(),
        status: InvocationStatus::Queued,
        submitted_at: Utc::now(),
        started_at: None,
        finished_at: None,
        attempts: 0,
        deliveries: 0,
        last_fault: None,
    };

    lock(&state.invocations).insert(id.clone(), info.clone());
    lock(&state.queue).push_back(QueuedInvocation {
        id: id.clone(),
        task_name: req.task_name,
        entity_ids: req.entity_ids,
        delivery: 0,
    });

    info!(
        "invocación {} encolada ({} sobre {} entidades)",
        id,
        info.task_name,
        info.entity_ids.len()
    );
    Ok(Json(info))
}

// Devuelve el estado de una invocación
async fn get_invocation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<InvocationInfo>, StatusCode> {
    lock(&state.invocations)
        .get(&id)
        .cloned()
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

// Registra un worker nuevo
async fn register_worker(
    State(state): State<AppState>,
    Json(req): Json<WorkerRegisterRequest>,
) -> Json<WorkerRegisterResponse> {
    let worker_id = uuid::Uuid::new_v4().to_string();
    let max_concurrency = req.max_concurrency.max(1);

    lock(&state.workers).insert(
        worker_id.clone(),
        WorkerMeta::new(req.hostname, max_concurrency),
    );

    info!(
        "worker registrado: {} (max_concurrency={})",
        worker_id, max_concurrency
    );
    Json(WorkerRegisterResponse { worker_id })
}

// Heartbeat de worker
async fn worker_heartbeat(
    State(state): State<AppState>,
    Json(req): Json<WorkerHeartbeatRequest>,
) -> Result<Json<WorkerHeartbeatResponse>, StatusCode> {
    let mut workers = lock(&state.workers);
    if let Some(meta) = workers.get_mut(&req.worker_id) {
        meta.last_heartbeat = SystemTime::now();
        meta.last_cpu_percent = req.cpu_percent;
        meta.last_mem_bytes = req.mem_bytes;
        Ok(Json(WorkerHeartbeatResponse { ok: true }))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

// Asigna la siguiente invocación en cola (si hay)
async fn assign_task(
    State(state): State<AppState>,
    Json(req): Json<TaskAssignmentRequest>,
) -> Result<Json<TaskAssignmentResponse>, StatusCode> {
    // 1) Capacidad máxima de este worker; un worker desconocido o muerto no recibe nada
    let max_for_worker: u32 = {
        let workers = lock(&state.workers);
        match workers.get(&req.worker_id) {
            Some(meta) if !meta.dead => meta.max_concurrency,
            Some(_) => return Ok(Json(TaskAssignmentResponse { invocation: None })),
            None => return Err(StatusCode::NOT_FOUND),
        }
    };

    // 2) Cuántas invocaciones tiene ya en vuelo
    let active_for_worker = lock(&state.in_flight)
        .values()
        .filter(|entry| entry.worker_id == req.worker_id)
        .count() as u32;

    if active_for_worker >= max_for_worker {
        info!(
            "worker {} pidió tarea pero ya tiene {}/{} en vuelo",
            req.worker_id, active_for_worker, max_for_worker
        );
        return Ok(Json(TaskAssignmentResponse { invocation: None }));
    }

    // 3) Sacar la siguiente de la cola global
    let Some(mut queued) = lock(&state.queue).pop_front() else {
        return Ok(Json(TaskAssignmentResponse { invocation: None }));
    };

    // 4) Actualizar la invocación: Running, started_at y número de entrega
    {
        let mut invocations = lock(&state.invocations);
        if let Some(info) = invocations.get_mut(&queued.id) {
            info.deliveries += 1;
            info.status = InvocationStatus::Running;
            if info.started_at.is_none() {
                info.started_at = Some(Utc::now());
            }
            queued.delivery = info.deliveries;
        }
    }

    info!(
        "asignando invocación {} ({}, entrega {}) al worker {} ({}/{} en vuelo -> +1)",
        queued.id,
        queued.task_name,
        queued.delivery,
        req.worker_id,
        active_for_worker,
        max_for_worker,
    );

    // 5) Registrar en in_flight con timestamp de inicio
    lock(&state.in_flight).insert(
        queued.id.clone(),
        InFlight {
            invocation: queued.clone(),
            worker_id: req.worker_id.clone(),
            started_at: SystemTime::now(),
        },
    );

    // 6) Métricas del worker
    if let Some(meta) = lock(&state.workers).get_mut(&req.worker_id) {
        meta.tasks_started += 1;
    }

    Ok(Json(TaskAssignmentResponse {
        invocation: Some(queued),
    }))
}

// Worker reporta el resultado final de una invocación
async fn complete_task(
    State(state): State<AppState>,
    Json(req): Json<TaskCompleteRequest>,
) -> Result<Json<TaskCompleteResponse>, StatusCode> {
    // Sólo el worker que tiene la entrega vigente puede cerrarla; un worker
    // dado por muerto que reporta tarde no pisa la re-entrega
    let inflight = {
        let mut in_flight = lock(&state.in_flight);
        match in_flight.get(&req.invocation_id) {
            None => return Err(StatusCode::NOT_FOUND),
            Some(entry) if entry.worker_id != req.worker_id => {
                warn!(
                    "reporte descartado: invocación {} está asignada a {}, no a {}",
                    req.invocation_id, entry.worker_id, req.worker_id
                );
                return Err(StatusCode::CONFLICT);
            }
            Some(_) => {}
        }
        in_flight
            .remove(&req.invocation_id)
            .ok_or(StatusCode::NOT_FOUND)?
    };

    let ok = matches!(
        req.outcome,
        TaskOutcome::Acknowledged {
            ack: Acknowledgment::Success | Acknowledgment::NoOp,
            ..
        }
    );

    // ---- Métricas de worker: duración y resultado ----
    let duration_ms: u64 = inflight
        .started_at
        .elapsed()
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);

    if let Some(meta) = lock(&state.workers).get_mut(&inflight.worker_id) {
        meta.total_task_time_ms += duration_ms;
        if ok {
            meta.tasks_succeeded += 1;
        } else {
            meta.tasks_failed += 1;
        }
    }

    // ---- Estado de la invocación ----
    let mut invocations = lock(&state.invocations);
    let Some(info) = invocations.get_mut(&req.invocation_id) else {
        return Err(StatusCode::NOT_FOUND);
    };
    info.finished_at = Some(Utc::now());

    match req.outcome {
        TaskOutcome::Acknowledged { ack, attempts } => {
            info.status = ack.into();
            info.attempts = attempts;
            if ack == Acknowledgment::FatalFailure {
                warn!(
                    "invocación {} ({}) terminó en FATAL_FAILURE, no se reintenta",
                    info.id, info.task_name
                );
            } else {
                info!(
                    "invocación {} ({}) terminó en {:?} tras {} intento(s)",
                    info.id, info.task_name, info.status, attempts
                );
            }
        }
        TaskOutcome::Failed { attempts, fault } => {
            error!(
                "TAREA FALLIDA: invocación {} ({}) abandonada tras {} intento(s): {}",
                info.id, info.task_name, attempts, fault
            );
            info.status = InvocationStatus::Failed;
            info.attempts = attempts;
            info.last_fault = Some(fault);
        }
    }

    Ok(Json(TaskCompleteResponse { ok: true }))
}

async fn list_workers(State(state): State<AppState>) -> Json<Vec<WorkerMetrics>> {
    let now = SystemTime::now();

    // Contar invocaciones activas por worker (desde in_flight)
    let mut active_by_worker: HashMap<WorkerId, u32> = HashMap::new();
    for inf in lock(&state.in_flight).values() {
        *active_by_worker.entry(inf.worker_id.clone()).or_insert(0) += 1;
    }

    let workers = lock(&state.workers);
    let mut out: Vec<WorkerMetrics> = workers
        .iter()
        .map(|(wid, meta)| {
            let finished = meta.tasks_succeeded + meta.tasks_failed;
            WorkerMetrics {
                worker_id: wid.clone(),
                hostname: meta.hostname.clone(),
                dead: meta.dead,
                max_concurrency: meta.max_concurrency,
                last_heartbeat_secs_ago: now
                    .duration_since(meta.last_heartbeat)
                    .unwrap_or_default()
                    .as_secs(),
                active_tasks: active_by_worker.get(wid).copied().unwrap_or(0),
                tasks_started: meta.tasks_started,
                tasks_succeeded: meta.tasks_succeeded,
                tasks_failed: meta.tasks_failed,
                avg_task_ms: (finished > 0)
                    .then(|| meta.total_task_time_ms as f64 / finished as f64),
                cpu_percent: meta.last_cpu_percent,
                mem_bytes: meta.last_mem_bytes,
            }
        })
        .collect();

    out.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
    Json(out)
}

/* ---------------- cache compartido ---------------- */

// Escribe un lote completo de particiones (sobrescribe las claves del lote)
async fn write_cache_batch(
    State(state): State<AppState>,
    Json(req): Json<CacheBatchRequest>,
) -> Result<Json<CacheBatchResponse>, StatusCode> {
    let identity = TaskIdentity {
        task_name: req.task_name,
        fingerprint: req.fingerprint,
    };
    let entries: Vec<(EntityId, Vec<u8>)> = req
        .entries
        .into_iter()
        .map(|e| (e.entity_id, e.data))
        .collect();

    let committed = state
        .cache
        .write_batch(&identity, entries)
        .await
        .map_err(|e| {
            warn!("no se pudo escribir el lote {}: {}", identity, e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    Ok(Json(CacheBatchResponse { committed }))
}

// Devuelve el buffer Arrow de una partición
async fn read_cache_entry(
    State(state): State<AppState>,
    Path((task_name, fingerprint, entity_id)): Path<(String, String, EntityId)>,
) -> Result<impl IntoResponse, StatusCode> {
    let key = CacheKey::new(&task_name, &fingerprint, entity_id);
    match state.cache.read(&key).await {
        Ok(Some(data)) => Ok(([(header::CONTENT_TYPE, ARROW_STREAM_MIME)], data)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            warn!("error leyendo {} del cache: {}", key, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
