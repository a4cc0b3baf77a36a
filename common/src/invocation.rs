use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fault::Fault;
use crate::task::{Acknowledgment, EntityId};

pub type InvocationId = String;

/// Pedido de invocación que llega al master.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub task_name: String,
    pub entity_ids: Vec<EntityId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvocationStatus {
    Queued,
    Running,
    Succeeded,
    NoOp,
    FatalFailure,
    /// Se agotaron los reintentos (o las re-entregas)
    Failed,
}

impl InvocationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, InvocationStatus::Queued | InvocationStatus::Running)
    }
}

impl From<Acknowledgment> for InvocationStatus {
    fn from(ack: Acknowledgment) -> Self {
        match ack {
            Acknowledgment::Success => InvocationStatus::Succeeded,
            Acknowledgment::NoOp => InvocationStatus::NoOp,
            Acknowledgment::FatalFailure => InvocationStatus::FatalFailure,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationInfo {
    pub id: InvocationId,
    pub task_name: String,
    pub entity_ids: Vec<EntityId>,

    /// Huella del lote; junto con task_name y el id de entidad forma la clave de cache
    pub fingerprint: String,

    pub status: InvocationStatus,

    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    /// Intentos del pipeline reportados por el worker
    pub attempts: u32,
    /// Veces que el master entregó la invocación a un worker
    pub deliveries: u32,

    /// Último fallo registrado (sólo si terminó en Failed)
    pub last_fault: Option<Fault>,
}

/// Invocación tal como viaja en la cola hacia un worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedInvocation {
    pub id: InvocationId,
    pub task_name: String,
    pub entity_ids: Vec<EntityId>,
    pub delivery: u32,
}

/// Resultado final que el worker reporta al master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Acknowledged { ack: Acknowledgment, attempts: u32 },
    Failed { attempts: u32, fault: Fault },
}
