use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::debug;

use common::{
    CacheBatchEntry, CacheBatchRequest, CacheBatchResponse, CacheKey, CacheStore, EntityId, Fault,
    TaskIdentity,
};

/// Cache compartido del master, visto desde el worker.
/// Errores de transporte y respuestas no exitosas son de conectividad.
#[derive(Clone)]
pub struct HttpCacheStore {
    client: Client,
    base_url: String,
}

impl HttpCacheStore {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    fn batch_url(&self) -> String {
        format!("{}/api/v1/cache/batch", self.base_url)
    }

    fn entry_url(&self, key: &CacheKey) -> String {
        format!(
            "{}/api/v1/cache/{}/{}/{}",
            self.base_url, key.task_name, key.fingerprint, key.entity_id
        )
    }
}

fn transport(e: reqwest::Error) -> Fault {
    Fault::Connectivity(format!("cache inaccesible: {e}"))
}

#[async_trait]
impl CacheStore for HttpCacheStore {
    async fn write_batch(
        &self,
        task: &TaskIdentity,
        entries: Vec<(EntityId, Vec<u8>)>,
    ) -> Result<bool, Fault> {
        let req = CacheBatchRequest {
            task_name: task.task_name.clone(),
            fingerprint: task.fingerprint.clone(),
            entries: entries
                .into_iter()
                .map(|(entity_id, data)| CacheBatchEntry { entity_id, data })
                .collect(),
        };

        let resp = self
            .client
            .put(self.batch_url())
            .json(&req)
            .send()
            .await
            .map_err(transport)?;

        if !resp.status().is_success() {
            return Err(Fault::Connectivity(format!(
                "el master respondió {} al escribir el lote {}",
                resp.status(),
                task
            )));
        }

        let CacheBatchResponse { committed } = resp.json().await.map_err(transport)?;
        debug!("lote {} enviado (committed={})", task, committed);
        Ok(committed)
    }

    async fn read(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, Fault> {
        let resp = self
            .client
            .get(self.entry_url(key))
            .send()
            .await
            .map_err(transport)?;

        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let bytes = resp.bytes().await.map_err(transport)?;
                Ok(Some(bytes.to_vec()))
            }
            status => Err(Fault::Connectivity(format!(
                "el master respondió {status} al leer {key}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Master falso: atiende una sola conexión, consume el pedido completo
    /// y contesta con la respuesta HTTP dada.
    async fn canned_master(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&chunk[..n]);
                if request_complete(&request) {
                    break;
                }
            }

            let response = format!(
                "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
        });

        format!("http://{addr}")
    }

    fn request_complete(request: &[u8]) -> bool {
        let Some(head_end) = request.windows(4).position(|w| w == b"\r\n\r\n") else {
            return false;
        };
        let head = String::from_utf8_lossy(&request[..head_end]).to_ascii_lowercase();
        let content_length = head
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        request.len() >= head_end + 4 + content_length
    }

    #[tokio::test]
    async fn server_error_is_a_connectivity_fault() {
        let base = canned_master("500 Internal Server Error", "").await;
        let store = HttpCacheStore::new(Client::new(), base);
        let identity = TaskIdentity::new("PR_FILE", &[1]);

        let err = store.write_batch(&identity, vec![(1, vec![0])]).await.unwrap_err();
        assert!(matches!(err, Fault::Connectivity(_)));
    }

    #[tokio::test]
    async fn uncommitted_batch_is_passed_through() {
        let base = canned_master("200 OK", r#"{"committed":false}"#).await;
        let store = HttpCacheStore::new(Client::new(), base);
        let identity = TaskIdentity::new("PR_FILE", &[1, 2]);

        let committed = store
            .write_batch(&identity, vec![(1, vec![1]), (2, vec![2])])
            .await
            .unwrap();
        assert!(!committed);
    }

    #[tokio::test]
    async fn missing_entry_reads_as_none() {
        let base = canned_master("404 Not Found", "").await;
        let store = HttpCacheStore::new(Client::new(), base);

        let read = store.read(&CacheKey::new("PR_FILE", "fp", 101)).await.unwrap();
        assert_eq!(read, None);
    }

    #[test]
    fn urls_follow_the_cache_key_scheme() {
        let store = HttpCacheStore::new(Client::new(), "http://master:8080");
        let key = CacheKey::new("PR_FILE", "0011223344556677", 101);

        assert_eq!(store.batch_url(), "http://master:8080/api/v1/cache/batch");
        assert_eq!(
            store.entry_url(&key),
            "http://master:8080/api/v1/cache/PR_FILE/0011223344556677/101"
        );
    }

    #[tokio::test]
    async fn unreachable_master_is_a_connectivity_fault() {
        // puerto 9 (discard) en loopback: la conexión se rechaza enseguida
        let store = HttpCacheStore::new(Client::new(), "http://127.0.0.1:9");
        let identity = TaskIdentity::new("PR_FILE", &[1]);

        let err = store.write_batch(&identity, vec![(1, vec![0])]).await.unwrap_err();
        assert!(matches!(err, Fault::Connectivity(_)));
    }
}
