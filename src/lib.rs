//! Tidemark: a query and indexing layer over a partitioned wide-column
//! backend.
//!
//! The stores in this crate share one storage model: items keyed by a
//! partition key and a sort key, with secondary indexes over derived sort
//! attributes. The [`Backend`] trait is the seam to the actual database;
//! [`backend::memory::MemoryBackend`] is a faithful in-process stand-in used
//! throughout the test suites.

pub mod backend;
pub mod blob;
pub mod config;
pub mod content;
pub mod cursor;
pub mod error;
pub mod event_log;
pub mod filter;
pub mod lease;
pub mod message_index;
pub mod sortkey;
pub mod watermark;

pub use backend::{AttrValue, Backend, BatchDeleteOutcome, Item, ItemKey};
pub use blob::BlobStore;
pub use config::{ReadErrorPolicy, StoreConfig};
pub use content::{ContentAddresser, Sha256Addresser};
pub use error::{Result, StoreError};
pub use event_log::{EventLogStore, EventPage};
pub use filter::{FilterCondition, FilterGroup, RangeFilter, TranslatedFilter};
pub use lease::{LeaseQueue, TaskRecord};
pub use message_index::{
    IndexMap, IndexValue, Message, MessageIndexStore, MessagePage, SortField, SortSpec,
};
pub use watermark::WatermarkAllocator;
