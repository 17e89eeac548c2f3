//! Optimize, encode and decode a whole mesh in one call.
//!
//! ```
//! use meshpack::{MeshBuffers, PipelineOptions};
//!
//! let vertices: Vec<u8> = (0..4u8).flat_map(|i| [i, i * 2, 0, 255]).collect();
//! let mut mesh = MeshBuffers::new(vertices, vec![0, 1, 2, 2, 1, 3], 4)?;
//!
//! let options = PipelineOptions::default();
//! mesh.optimize(&options)?;
//! let encoded = mesh.encode(&options)?;
//! assert_eq!(encoded.decode()?, mesh);
//! # Ok::<(), meshpack::Error>(())
//! ```

use crate::error::{Precondition, Result};
use crate::index_codec::{
    IndexEncodingVersion, decode_index_buffer_checked, encode_index_buffer, validate_indices,
};
use crate::vcache::{
    optimize_vertex_cache_fifo_in_place, optimize_vertex_cache_in_place,
    optimize_vertex_cache_strip_in_place,
};
use crate::vertex_codec::{
    MAX_STRIDE, VertexEncodingVersion, decode_vertex_buffer, encode_vertex_buffer,
};
use crate::vfetch::optimize_vertex_fetch_in_place;

/// Triangle ordering used by [`MeshBuffers::optimize`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CacheStrategy {
    /// Scored optimizer with the triangle list weights.
    #[default]
    List,
    /// Scored optimizer with the strip weights.
    Strip,
    /// Tipsify for a FIFO cache of the given size.
    Fifo { cache_size: usize },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineOptions {
    pub cache_strategy: CacheStrategy,
    pub index_version: IndexEncodingVersion,
    pub vertex_version: VertexEncodingVersion,
}

/// A raw mesh: fixed-stride vertex records and a triangle list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeshBuffers {
    pub vertices: Vec<u8>,
    pub indices: Vec<u32>,
    pub stride: usize,
}

impl MeshBuffers {
    pub fn new(vertices: Vec<u8>, indices: Vec<u32>, stride: usize) -> Result<Self> {
        let mesh = Self {
            vertices,
            indices,
            stride,
        };
        mesh.validate()?;
        Ok(mesh)
    }

    /// Check stride, buffer sizes and index ranges.
    pub fn validate(&self) -> Result<()> {
        if self.stride == 0 || self.stride > MAX_STRIDE {
            return Err(Precondition::InvalidStride(self.stride).into());
        }
        if self.vertices.len() % self.stride != 0 {
            return Err(Precondition::BufferSizeMismatch {
                expected: self.vertex_count() * self.stride,
                actual: self.vertices.len(),
            }
            .into());
        }
        validate_indices(&self.indices, self.vertex_count())
    }

    #[must_use]
    pub fn vertex_count(&self) -> usize {
        self.vertices.len().checked_div(self.stride).unwrap_or(0)
    }

    /// Reorder triangles for the vertex cache, then vertices for fetch
    /// locality. Returns the number of referenced vertices.
    pub fn optimize(&mut self, options: &PipelineOptions) -> Result<usize> {
        self.validate()?;
        let vertex_count = self.vertex_count();

        match options.cache_strategy {
            CacheStrategy::List => optimize_vertex_cache_in_place(&mut self.indices, vertex_count)?,
            CacheStrategy::Strip => {
                optimize_vertex_cache_strip_in_place(&mut self.indices, vertex_count)?;
            }
            CacheStrategy::Fifo { cache_size } => {
                optimize_vertex_cache_fifo_in_place(&mut self.indices, vertex_count, cache_size)?;
            }
        }

        optimize_vertex_fetch_in_place(&mut self.vertices, &mut self.indices, self.stride)
    }

    pub fn encode(&self, options: &PipelineOptions) -> Result<EncodedMesh> {
        self.validate()?;
        let vertex_count = self.vertex_count();

        let encoded = EncodedMesh {
            vertex_count,
            index_count: self.indices.len(),
            stride: self.stride,
            vertices: encode_vertex_buffer(&self.vertices, self.stride, options.vertex_version)?,
            indices: encode_index_buffer(&self.indices, vertex_count, options.index_version)?,
        };

        tracing::debug!(
            vertex_count,
            index_count = encoded.index_count,
            raw = self.vertices.len() + self.indices.len() * 4,
            encoded = encoded.encoded_len(),
            "encoded mesh"
        );
        Ok(encoded)
    }
}

/// Encoded vertex and index blobs plus the counts needed to decode them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedMesh {
    pub vertex_count: usize,
    pub index_count: usize,
    pub stride: usize,
    pub vertices: Vec<u8>,
    pub indices: Vec<u8>,
}

impl EncodedMesh {
    /// Combined size of both blobs.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        self.vertices.len() + self.indices.len()
    }

    /// Decode both blobs, rejecting indices outside the vertex buffer.
    pub fn decode(&self) -> Result<MeshBuffers> {
        let vertices = decode_vertex_buffer(&self.vertices, self.vertex_count, self.stride)?;
        let indices = decode_index_buffer_checked(&self.indices, self.index_count, self.vertex_count)?;
        Ok(MeshBuffers {
            vertices,
            indices,
            stride: self.stride,
        })
    }
}
