//! Wire protocol types for the master↔worker control socket.

use serde::{Deserialize, Serialize};

/// Control messages from master to worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MasterMessage {
    /// Hand off one accepted TCP connection. The socket's file descriptor
    /// rides along as ancillary data on the frame; the worker must attach it
    /// to its transport server exactly as a local accept would.
    ///
    /// Serialized as the bare string `"balancing"`.
    Balancing,
}

/// Control messages from worker to master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// The worker's server is closing voluntarily. Sent before the close
    /// actually runs so the master can respawn or shrink the pool.
    Close,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balancing_serializes_as_bare_string() {
        let json = serde_json::to_string(&MasterMessage::Balancing).unwrap();
        assert_eq!(json, "\"balancing\"");
    }

    #[test]
    fn balancing_roundtrips() {
        let parsed: MasterMessage = serde_json::from_str("\"balancing\"").unwrap();
        assert_eq!(parsed, MasterMessage::Balancing);
    }

    #[test]
    fn close_serializes_as_tagged_object() {
        let json = serde_json::to_value(WorkerMessage::Close).unwrap();
        assert_eq!(json, serde_json::json!({"type": "close"}));
    }

    #[test]
    fn close_roundtrips() {
        let parsed: WorkerMessage = serde_json::from_str(r#"{"type":"close"}"#).unwrap();
        assert_eq!(parsed, WorkerMessage::Close);
    }

    #[test]
    fn unknown_worker_message_is_rejected() {
        let parsed = serde_json::from_str::<WorkerMessage>(r#"{"type":"reload"}"#);
        assert!(parsed.is_err());
    }
}
