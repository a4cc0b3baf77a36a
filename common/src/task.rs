use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Identificador de entidad (ej: repo_id).
pub type EntityId = i64;

/// Una invocación de tarea: nombre de la métrica + lote de entidades.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInvocation {
    pub task_name: String,
    pub entity_ids: Vec<EntityId>,

    /// Número de intento, empieza en 1
    pub attempt: u32,
}

impl TaskInvocation {
    pub fn new(task_name: impl Into<String>, entity_ids: Vec<EntityId>) -> Self {
        Self {
            task_name: task_name.into(),
            entity_ids,
            attempt: 1,
        }
    }

    pub fn identity(&self) -> TaskIdentity {
        TaskIdentity::new(&self.task_name, &self.entity_ids)
    }
}

/// Identidad de una invocación frente al cache: el nombre de la tarea más
/// la huella del lote de entidades. No cambia entre reintentos.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskIdentity {
    pub task_name: String,
    pub fingerprint: String,
}

impl TaskIdentity {
    pub fn new(task_name: &str, entity_ids: &[EntityId]) -> Self {
        Self {
            task_name: task_name.to_string(),
            fingerprint: fingerprint(task_name, entity_ids),
        }
    }

    pub fn key_for(&self, entity_id: EntityId) -> CacheKey {
        CacheKey {
            task_name: self.task_name.clone(),
            fingerprint: self.fingerprint.clone(),
            entity_id,
        }
    }
}

impl fmt::Display for TaskIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.task_name, self.fingerprint)
    }
}

/// Huella estable del lote: SHA-256 sobre el nombre y los ids en el orden
/// recibido, truncada a 16 caracteres hex.
pub fn fingerprint(task_name: &str, entity_ids: &[EntityId]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(task_name.as_bytes());
    hasher.update([0u8]);
    for id in entity_ids {
        hasher.update(id.to_be_bytes());
    }
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

/// Clave de cache de una partición: `{task}:{fingerprint}:{entity}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub task_name: String,
    pub fingerprint: String,
    pub entity_id: EntityId,
}

impl CacheKey {
    pub fn new(task_name: &str, fingerprint: &str, entity_id: EntityId) -> Self {
        Self {
            task_name: task_name.to_string(),
            fingerprint: fingerprint.to_string(),
            entity_id,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.task_name, self.fingerprint, self.entity_id)
    }
}

/// Resultado de un intento que terminó (con o sin escritura).
/// Un fallo reintentable NO es un Acknowledgment: viaja como `Fault`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Acknowledgment {
    /// Todas las particiones quedaron escritas
    Success,
    /// Precondición no reintentable (config/entorno); no se tocó el cache
    FatalFailure,
    /// Lista de entidades vacía; no se consultó ni se escribió nada
    NoOp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_for_same_batch() {
        let a = fingerprint("PR_FILE", &[101, 102]);
        let b = fingerprint("PR_FILE", &[101, 102]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn fingerprint_differs_across_batches_and_tasks() {
        let base = fingerprint("PR_FILE", &[101, 102]);
        assert_ne!(base, fingerprint("PR_FILE", &[101]));
        assert_ne!(base, fingerprint("PR_FILE", &[102, 101]));
        assert_ne!(base, fingerprint("PR_ASSIGNEE", &[101, 102]));
    }

    #[test]
    fn cache_key_includes_task_and_entity() {
        let identity = TaskIdentity::new("PR_FILE", &[101, 102]);
        let k1 = identity.key_for(101);
        let k2 = identity.key_for(102);

        assert_ne!(k1, k2);
        assert_eq!(
            k1.to_string(),
            format!("PR_FILE:{}:101", identity.fingerprint)
        );
        assert_eq!(k1, TaskInvocation::new("PR_FILE", vec![101, 102]).identity().key_for(101));
    }

    #[test]
    fn acknowledgment_serializes_in_screaming_case() {
        let json = serde_json::to_string(&Acknowledgment::FatalFailure).unwrap();
        assert_eq!(json, "\"FATAL_FAILURE\"");
    }
}
