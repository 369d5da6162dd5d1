// Persistence: per-workspace SQLite stores, snapshot compaction, blobs.

pub mod blob;
pub mod db;
pub mod doc;

pub use blob::{blob_key_for, BlobStore};
pub use db::DocDb;
pub use doc::{
    CompactionOutcome, CompactionPolicy, CompactionResult, CompactionSkipReason, DocStorage,
};
