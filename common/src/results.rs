use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::task::EntityId;

/// Lote de particiones codificadas que un worker escribe en el cache del master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheBatchRequest {
    pub task_name: String,
    pub fingerprint: String,
    pub entries: Vec<CacheBatchEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheBatchEntry {
    pub entity_id: EntityId,

    /// Buffer Arrow IPC, en base64 dentro del JSON
    #[serde(serialize_with = "to_base64", deserialize_with = "from_base64")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheBatchResponse {
    pub committed: bool,
}

fn to_base64<S: Serializer>(data: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&STANDARD.encode(data))
}

fn from_base64<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(d)?;
    STANDARD.decode(encoded).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_data_travels_as_base64() {
        let req = CacheBatchRequest {
            task_name: "PR_FILE".into(),
            fingerprint: "abcd".into(),
            entries: vec![CacheBatchEntry {
                entity_id: 101,
                data: vec![0xff, 0x00, 0x10],
            }],
        };

        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["entries"][0]["data"], "/wAQ");

        let back: CacheBatchRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back, req);
    }
}
