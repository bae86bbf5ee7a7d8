//! Read offset into an append-only record source

use super::RecordSource;
use crate::error::Result;
use crate::models::TrafficRecord;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Whether the cursor has established its starting offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// Starting offset not established yet (initial read failed)
    Uninitialized,
    /// Source absent at startup; everything that appears later is new
    WaitingForData,
    /// Tailing an existing source
    Tailing,
}

/// Tracks how many records of a source have been consumed
pub struct StreamCursor {
    source: Arc<dyn RecordSource>,
    position: u64,
    state: CursorState,
}

impl StreamCursor {
    pub fn new(source: Arc<dyn RecordSource>) -> Self {
        Self {
            source,
            position: 0,
            state: CursorState::Uninitialized,
        }
    }

    /// Create a cursor positioned at the current end of the source
    pub async fn open(source: Arc<dyn RecordSource>) -> Result<Self> {
        let mut cursor = Self::new(source);
        cursor.initialize().await?;
        Ok(cursor)
    }

    /// Skip everything already in the source. On failure the cursor stays
    /// uninitialized and the next poll retries.
    pub async fn initialize(&mut self) -> Result<()> {
        match self.source.record_count().await? {
            Some(count) => {
                self.position = count;
                self.state = CursorState::Tailing;
                info!(source = %self.source.id(), position = count, "Starting from position");
            }
            None => {
                self.position = 0;
                self.state = CursorState::WaitingForData;
                warn!(source = %self.source.id(), "Record source not found, waiting for data");
            }
        }
        Ok(())
    }

    /// Return the records appended since the last poll and advance past them.
    /// A failed read leaves the position untouched.
    pub async fn poll(&mut self) -> Result<Vec<TrafficRecord>> {
        if self.state == CursorState::Uninitialized {
            self.initialize().await?;
            return Ok(Vec::new());
        }

        let records = match self.source.read_from(self.position).await? {
            Some(records) => records,
            None => return Ok(Vec::new()),
        };

        if records.is_empty() {
            return Ok(records);
        }

        self.position += records.len() as u64;
        self.state = CursorState::Tailing;
        debug!(
            source = %self.source.id(),
            new_records = records.len(),
            position = self.position,
            "Polled new records"
        );
        Ok(records)
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    pub fn source_id(&self) -> &str {
        self.source.id()
    }
}
