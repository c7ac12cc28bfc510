//! Filtering pipeline for audit-log objects.
//!
//! One invocation of [`Copier::copy`] moves a single object end to end:
//! blob read, optional gunzip, record extraction, rule evaluation, gzip
//! re-encode and streaming upload. Two pipeline paths exist, selected by the
//! multipart-download flag: a batch path that decodes the whole record array
//! at once, and a streaming path whose memory use is bounded by the largest
//! single record regardless of object size.

mod copier;
mod extract;
mod pipeline;
mod pool;
mod store;

pub use copier::{Copier, CopierConfig, CopyReport};
pub use extract::{RecordExtractor, MAX_RECORD_BYTES};
pub use pipeline::{FilterPipeline, PipelineReport, MAX_MULTIPART_BYTES, MAX_PLAIN_BYTES};
pub use pool::ObjectPool;
pub use store::{
    decompressed_reader, BlobBody, BlobStore, BlobStoreConfig, Compression, ObjectStoreBlobStore,
};
