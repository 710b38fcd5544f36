use thiserror::Error;

use crate::sync::transport::TransportError;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Collection '{0}' is not registered")]
    UnknownCollection(String),

    #[error("Collection '{0}' is registered twice")]
    DuplicateCollection(String),

    #[error("Collection '{identifier}' has no dirty-record hooks")]
    MissingHooks { identifier: String },

    #[error("Record in '{identifier}' has no externalId")]
    MissingExternalId { identifier: String },

    #[error("Not connected to a leader")]
    NotConnected,

    #[error("Operation cancelled by shutdown")]
    Cancelled,

    #[error("Pending operation {identifier}/{external_id} was dropped before completion")]
    Superseded { identifier: String, external_id: i64 },

    #[error("Broadcast of {identifier}/{external_id} timed out waiting for acknowledgements")]
    BroadcastTimeout { identifier: String, external_id: i64 },

    #[error("Adapter error: {0}")]
    Adapter(#[from] anyhow::Error),

    #[error("Discovery error: {0}")]
    Discovery(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type SyncResult<T> = Result<T, SyncError>;

impl From<rocksdb::Error> for SyncError {
    fn from(err: rocksdb::Error) -> Self {
        SyncError::Storage(err.into_string())
    }
}

impl SyncError {
    /// Errors that end the current scheduler cycle instead of moving on to the next collection.
    pub fn is_interruption(&self) -> bool {
        matches!(
            self,
            SyncError::Cancelled | SyncError::NotConnected | SyncError::Superseded { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = SyncError::UnknownCollection("messages".to_string());
        assert_eq!(err.to_string(), "Collection 'messages' is not registered");

        let err = SyncError::MissingHooks {
            identifier: "messages".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Collection 'messages' has no dirty-record hooks"
        );

        let err = SyncError::BroadcastTimeout {
            identifier: "messages".to_string(),
            external_id: 7,
        };
        assert_eq!(
            err.to_string(),
            "Broadcast of messages/7 timed out waiting for acknowledgements"
        );

        let err = SyncError::Adapter(anyhow::anyhow!("disk full"));
        assert_eq!(err.to_string(), "Adapter error: disk full");
    }

    #[test]
    fn test_interruptions() {
        assert!(SyncError::Cancelled.is_interruption());
        assert!(SyncError::NotConnected.is_interruption());
        assert!(SyncError::Superseded {
            identifier: "a".to_string(),
            external_id: 1
        }
        .is_interruption());
        assert!(!SyncError::MissingHooks {
            identifier: "a".to_string()
        }
        .is_interruption());
    }
}
