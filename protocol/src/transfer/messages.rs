//! File transfer control messages.
//!
//! JSON objects discriminated by `type`. Chunks are not messages: they
//! travel as binary frames on the same channel, in order, with no header.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FileMessage {
    #[serde(rename_all = "camelCase")]
    FileRequest {
        transfer_id: Uuid,
        file_name: String,
        file_size: u64,
        mime_type: String,
        chunk_size: u32,
        total_chunks: u64,
        /// Lower-case hex SHA-256 of the whole file, when the sender has one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sha256: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    FileResponse {
        transfer_id: Uuid,
        accepted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    FileComplete { transfer_id: Uuid },
    #[serde(rename_all = "camelCase")]
    FileCancel {
        transfer_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl FileMessage {
    pub fn transfer_id(&self) -> Uuid {
        match self {
            FileMessage::FileRequest { transfer_id, .. }
            | FileMessage::FileResponse { transfer_id, .. }
            | FileMessage::FileComplete { transfer_id }
            | FileMessage::FileCancel { transfer_id, .. } => *transfer_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FileMessage::FileRequest { .. } => "file_request",
            FileMessage::FileResponse { .. } => "file_response",
            FileMessage::FileComplete { .. } => "file_complete",
            FileMessage::FileCancel { .. } => "file_cancel",
        }
    }
}
