use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::fault::Fault;
use crate::task::{CacheKey, EntityId, TaskIdentity};

/// Cache compartido donde las tareas dejan sus particiones codificadas.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Escribe un lote completo para una invocación.
    ///
    /// Cada entrada reemplaza por completo lo que hubiera bajo su clave.
    /// `Ok(true)` significa que el lote quedó confirmado; `Ok(false)` que
    /// el cache no lo aceptó (el intento se considera fallido).
    async fn write_batch(
        &self,
        task: &TaskIdentity,
        entries: Vec<(EntityId, Vec<u8>)>,
    ) -> Result<bool, Fault>;

    async fn read(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, Fault>;
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub data: Arc<Vec<u8>>,
    pub written_at: DateTime<Utc>,
}

/// Cache en memoria. Cada lote se aplica bajo un único lock, así que un
/// lector nunca ve un lote a medias; entre lotes gana la última escritura.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
    batches: AtomicU64,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Claves presentes, ordenadas.
    pub fn keys(&self) -> Vec<CacheKey> {
        let mut keys: Vec<CacheKey> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Cantidad de lotes confirmados desde que se creó.
    pub fn batches_written(&self) -> u64 {
        self.batches.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CacheKey, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn write_batch(
        &self,
        task: &TaskIdentity,
        entries: Vec<(EntityId, Vec<u8>)>,
    ) -> Result<bool, Fault> {
        let now = Utc::now();
        let count = entries.len();
        {
            let mut map = self.lock();
            for (entity_id, data) in entries {
                map.insert(
                    task.key_for(entity_id),
                    CacheEntry {
                        data: Arc::new(data),
                        written_at: now,
                    },
                );
            }
        }
        self.batches.fetch_add(1, Ordering::SeqCst);

        debug!("lote {} confirmado ({} entradas)", task, count);
        Ok(true)
    }

    async fn read(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, Fault> {
        Ok(self.lock().get(key).map(|e| e.data.as_ref().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn batch_write_then_read_each_key() {
        let cache = MemoryCacheStore::new();
        let identity = TaskIdentity::new("PR_FILE", &[1, 2]);

        let committed = cache
            .write_batch(&identity, vec![(1, vec![1, 1]), (2, vec![2])])
            .await
            .unwrap();

        assert!(committed);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.read(&identity.key_for(1)).await.unwrap(), Some(vec![1, 1]));
        assert_eq!(cache.read(&identity.key_for(2)).await.unwrap(), Some(vec![2]));
        assert_eq!(cache.read(&identity.key_for(3)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn rewriting_a_batch_overwrites_instead_of_appending() {
        let cache = MemoryCacheStore::new();
        let identity = TaskIdentity::new("PR_FILE", &[1]);

        cache.write_batch(&identity, vec![(1, vec![9, 9, 9])]).await.unwrap();
        cache.write_batch(&identity, vec![(1, vec![7])]).await.unwrap();

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.batches_written(), 2);
        assert_eq!(cache.read(&identity.key_for(1)).await.unwrap(), Some(vec![7]));
    }

    #[tokio::test]
    async fn different_batches_do_not_collide() {
        let cache = MemoryCacheStore::new();
        let a = TaskIdentity::new("PR_FILE", &[1, 2]);
        let b = TaskIdentity::new("PR_FILE", &[1]);
        let c = TaskIdentity::new("PR_ASSIGNEE", &[1, 2]);

        cache.write_batch(&a, vec![(1, vec![1])]).await.unwrap();
        cache.write_batch(&b, vec![(1, vec![2])]).await.unwrap();
        cache.write_batch(&c, vec![(1, vec![3])]).await.unwrap();

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.read(&a.key_for(1)).await.unwrap(), Some(vec![1]));
    }
}
