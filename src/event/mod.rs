//! The application-facing pipeline contracts.
//!
//! An application configures one [`XGraph`]: an [`EventFilter`] selecting the
//! raw logs, an [`EventIndexer`] decoding them into [`IndexedEvent`]s, and an
//! ordered list of [`ProcessorStage`]s materializing records from committed
//! events.
//!
//! [`IndexedEvent`]: crate::types::IndexedEvent

mod filter;
mod indexer;
mod processor;

pub use filter::{AddressTopicFilter, EventFilter};
pub use indexer::{EventIndexer, IndexedBatch, Sequencer, index_logs};
pub use processor::{MaterializedRecord, ProcessorStage, XGraph};
