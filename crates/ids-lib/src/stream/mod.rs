//! Append-only record sources and the cursor that tails them
//!
//! A source is addressed by a stable identifier and only ever grows by
//! appending records. The cursor remembers how many records have been
//! consumed and hands out only the new ones on each poll.

mod csv;
mod cursor;

pub use self::csv::{parse_csv, read_dataset, CsvFileSource};
pub use cursor::{CursorState, StreamCursor};

use crate::error::Result;
use crate::models::TrafficRecord;

pub use async_trait::async_trait;

/// Trait for append-only record sources
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Stable identifier (path, stream name)
    fn id(&self) -> &str;

    /// All data records at index `offset` and beyond, or `None` if the source
    /// does not exist yet. Header/preamble lines are not records.
    async fn read_from(&self, offset: u64) -> Result<Option<Vec<TrafficRecord>>>;

    /// Current number of data records, or `None` if the source does not exist
    async fn record_count(&self) -> Result<Option<u64>>;
}
