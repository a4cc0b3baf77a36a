use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::CodecError;
use crate::partition::PartitionError;
use crate::transform::TransformError;

/// Clasificación de fallos de un intento.
/// Sólo `Configuration` es terminal; el resto entra al camino de reintentos.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum Fault {
    /// Falta configuración o credenciales inválidas
    #[error("configuración inválida: {0}")]
    Configuration(String),

    /// No se pudo llegar al origen de datos o al cache
    #[error("error de conectividad: {0}")]
    Connectivity(String),

    /// Cualquier otra cosa (datos malformados, codec, ...)
    #[error("fallo no clasificado: {0}")]
    Unclassified(String),
}

impl Fault {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Fault::Configuration(_))
    }
}

impl From<CodecError> for Fault {
    fn from(e: CodecError) -> Self {
        Fault::Unclassified(e.to_string())
    }
}

impl From<PartitionError> for Fault {
    fn from(e: PartitionError) -> Self {
        Fault::Unclassified(e.to_string())
    }
}

impl From<TransformError> for Fault {
    fn from(e: TransformError) -> Self {
        Fault::Unclassified(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_configuration_is_terminal() {
        assert!(!Fault::Configuration("AUGUR_HOST".into()).is_retryable());
        assert!(Fault::Connectivity("timeout".into()).is_retryable());
        assert!(Fault::Unclassified("bad row".into()).is_retryable());
    }

    #[test]
    fn serializes_with_kind_tag() {
        let json = serde_json::to_value(Fault::Connectivity("refused".into())).unwrap();
        assert_eq!(json["kind"], "connectivity");
        assert_eq!(json["message"], "refused");
    }
}
