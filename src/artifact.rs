use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::GenerationError;

/// One captured photograph, owned by the cycle that produced it.
/// Immutable once created; later stages only ever borrow it.
#[derive(Debug, Clone)]
pub struct CaptureArtifact {
    cycle_id: Uuid,
    data: Bytes,
    created_at: DateTime<Utc>,
}

impl CaptureArtifact {
    pub fn new(cycle_id: Uuid, data: Bytes) -> Self {
        Self {
            cycle_id,
            data,
            created_at: Utc::now(),
        }
    }

    pub fn cycle_id(&self) -> Uuid {
        self.cycle_id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// The poem generated for a cycle. Construction rejects empty text,
/// so a cycle can never reach the printing stage with nothing to print.
#[derive(Debug, Clone)]
pub struct PoemResult {
    cycle_id: Uuid,
    text: String,
    generated_at: DateTime<Utc>,
}

impl PoemResult {
    pub fn new(cycle_id: Uuid, text: String) -> Result<Self, GenerationError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(GenerationError::MalformedResponse(
                "empty poem text".to_string(),
            ));
        }
        Ok(Self {
            cycle_id,
            text: trimmed.to_string(),
            generated_at: Utc::now(),
        })
    }

    pub fn cycle_id(&self) -> Uuid {
        self.cycle_id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn generated_at(&self) -> DateTime<Utc> {
        self.generated_at
    }
}
