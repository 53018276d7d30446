//! Stream metadata collaborator

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{ParticipantId, StreamId};

/// Fields of a stream record created when a broadcast starts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewStreamRecord {
    pub host_id: ParticipantId,
    pub title: String,
    pub description: Option<String>,
    pub is_public: bool,
}

impl NewStreamRecord {
    pub fn new(host_id: ParticipantId, title: impl Into<String>) -> Self {
        Self {
            host_id,
            title: title.into(),
            description: None,
            is_public: true,
        }
    }
}

/// Persistence of stream records, owned by the surrounding application
#[async_trait]
pub trait StreamRecordStore: Send + Sync {
    async fn create_stream_record(&self, record: NewStreamRecord) -> Result<StreamId>;

    async fn update_viewer_count(&self, stream_id: &StreamId, count: u64) -> Result<()>;

    async fn end_stream(&self, stream_id: &StreamId) -> Result<()>;
}
