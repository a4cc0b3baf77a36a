// master/src/state.rs

use common::{
    InvocationId, InvocationInfo, MemoryCacheStore, MetricCatalog, QueuedInvocation, WorkerId,
};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::SystemTime,
};

#[derive(Clone)]
pub struct AppState {
    pub invocations: Arc<Mutex<HashMap<InvocationId, InvocationInfo>>>,
    pub workers: Arc<Mutex<HashMap<WorkerId, WorkerMeta>>>,
    // invocaciones pendientes de asignar
    pub queue: Arc<Mutex<VecDeque<QueuedInvocation>>>,
    // invocaciones ya asignadas pero no completadas
    pub in_flight: Arc<Mutex<HashMap<InvocationId, InFlight>>>,

    // cache compartido donde los workers dejan las particiones
    pub cache: Arc<MemoryCacheStore>,
    pub catalog: Arc<MetricCatalog>,
}

impl AppState {
    pub fn new(catalog: MetricCatalog) -> Self {
        Self {
            invocations: Arc::new(Mutex::new(HashMap::new())),
            workers: Arc::new(Mutex::new(HashMap::new())),
            queue: Arc::new(Mutex::new(VecDeque::new())),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            cache: Arc::new(MemoryCacheStore::new()),
            catalog: Arc::new(catalog),
        }
    }
}

/// Toma el lock aunque otro hilo haya entrado en pánico con él tomado;
/// el estado sigue siendo utilizable para responder.
pub fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone)]
pub struct WorkerMeta {
    pub hostname: String,
    pub last_heartbeat: SystemTime,
    pub dead: bool,
    pub max_concurrency: u32,

    // Métricas
    pub tasks_started: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub total_task_time_ms: u64,

    pub last_cpu_percent: Option<f32>,
    pub last_mem_bytes: Option<u64>,
}

impl WorkerMeta {
    pub fn new(hostname: String, max_concurrency: u32) -> Self {
        Self {
            hostname,
            last_heartbeat: SystemTime::now(),
            dead: false,
            max_concurrency,
            tasks_started: 0,
            tasks_succeeded: 0,
            tasks_failed: 0,
            total_task_time_ms: 0,
            last_cpu_percent: None,
            last_mem_bytes: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InFlight {
    pub invocation: QueuedInvocation,
    pub worker_id: WorkerId,
    pub started_at: SystemTime,
}
