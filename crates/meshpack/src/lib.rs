//! Compress triangle meshes and reorder them for GPU caches.
//!
//! This crate provides pure synchronous functions that re-encode vertex and
//! index buffers into compact binary blobs, expand quantized normals and
//! rotations after decoding, and reorder triangles and vertices so that GPUs
//! hit their post-transform and fetch caches more often. All functions are
//! designed to be called from any threading context - the library user
//! controls parallelism.
//!
//! # Design principles
//!
//! - **Synchronous**: No async, no threading primitives, no global state
//! - **User-controlled parallelism**: Client decides how to parallelize
//! - **Untrusted input**: Decoders return errors, they never panic
//!
//! # Key functions
//!
//! - [`encode_index_buffer`] / [`decode_index_buffer`]: Triangle list codec
//! - [`encode_vertex_buffer`] / [`decode_vertex_buffer`]: Fixed-stride vertex codec
//! - [`decode_filter_oct`] / [`decode_filter_quat`]: Expand quantized normals and quaternions
//! - [`optimize_vertex_cache`]: Reorder triangles for the post-transform cache
//! - [`optimize_vertex_fetch`]: Reorder vertices into first-use order
//! - [`MeshBuffers`]: Run the whole pipeline on one mesh

mod error;

pub mod bitstream;
pub mod filters;
pub mod index_codec;
pub mod pipeline;
pub mod vcache;
pub mod vertex_codec;
pub mod vfetch;

pub use error::{Error, Precondition, Result, StreamError};
pub use filters::{
    decode_filter_oct, decode_filter_quat, encode_filter_oct, encode_filter_quat, quantize_snorm,
};
pub use index_codec::{
    IndexEncodingVersion, IndexType, decode_index_buffer, decode_index_buffer_checked,
    decode_index_buffer_into, encode_index_buffer, encode_index_buffer_bound,
    encode_index_buffer_into,
};
pub use pipeline::{CacheStrategy, EncodedMesh, MeshBuffers, PipelineOptions};
pub use vcache::{
    VertexCacheStatistics, VertexScoreTable, analyze_vertex_cache, optimize_vertex_cache,
    optimize_vertex_cache_fifo, optimize_vertex_cache_fifo_in_place,
    optimize_vertex_cache_in_place, optimize_vertex_cache_strip,
    optimize_vertex_cache_strip_in_place, optimize_vertex_cache_with_table,
};
pub use vertex_codec::{
    VertexBlockDecoder, VertexEncodingVersion, decode_vertex_buffer, decode_vertex_buffer_into,
    decode_vertices, encode_vertex_buffer, encode_vertex_buffer_bound, encode_vertex_buffer_into,
    encode_vertices,
};
pub use vfetch::{
    FetchOutput, RemapTable, VertexFetchStatistics, analyze_vertex_fetch, optimize_vertex_fetch,
    optimize_vertex_fetch_in_place,
};
