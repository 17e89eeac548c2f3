//! Vertex reordering for memory locality.
//!
//! Vertices are renumbered in the order the index buffer first references
//! them, so a GPU walking the triangles reads the vertex buffer mostly
//! sequentially. Unreferenced vertices keep their relative order after the
//! referenced ones; the vertex count never changes.

use crate::error::{Precondition, Result};
use crate::index_codec::validate_indices;

const CACHE_LINE: usize = 64;
const CACHE_SIZE: usize = 128 * 1024;

const UNASSIGNED: u32 = u32::MAX;

/// Old vertex index to new vertex index, as produced by the fetch optimizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemapTable {
    slots: Vec<u32>,
    referenced: usize,
}

impl RemapTable {
    /// Assign new slots in first-use order of `indices`.
    pub fn from_indices(indices: &[u32], vertex_count: usize) -> Result<Self> {
        validate_indices(indices, vertex_count)?;

        let mut slots = vec![UNASSIGNED; vertex_count];
        let mut next = 0u32;
        for &index in indices {
            let slot = &mut slots[index as usize];
            if *slot == UNASSIGNED {
                *slot = next;
                next += 1;
            }
        }

        let referenced = next as usize;
        for slot in slots.iter_mut().filter(|slot| **slot == UNASSIGNED) {
            *slot = next;
            next += 1;
        }

        Ok(Self { slots, referenced })
    }

    /// Number of vertices covered by the table.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of vertices referenced by the indices the table was built from.
    #[must_use]
    pub fn referenced_count(&self) -> usize {
        self.referenced
    }

    /// New index of a referenced vertex, `None` if `old` was never used.
    #[must_use]
    pub fn get(&self, old: u32) -> Option<u32> {
        self.slots
            .get(old as usize)
            .copied()
            .filter(|&slot| (slot as usize) < self.referenced)
    }

    /// Full permutation, unreferenced vertices included.
    #[must_use]
    pub fn as_slice(&self) -> &[u32] {
        &self.slots
    }

    /// Rewrite indices through the table.
    pub fn remap_indices(&self, indices: &[u32]) -> Result<Vec<u32>> {
        indices
            .iter()
            .map(|&index| {
                self.slots.get(index as usize).copied().ok_or_else(|| {
                    Precondition::IndexOutOfRange {
                        index,
                        vertex_count: self.len(),
                    }
                    .into()
                })
            })
            .collect()
    }

    /// Move each record of `stride` bytes to its new slot.
    pub fn remap_vertices(&self, vertices: &[u8], stride: usize) -> Result<Vec<u8>> {
        if stride == 0 {
            return Err(Precondition::InvalidStride(stride).into());
        }
        let expected = self.len() * stride;
        if vertices.len() != expected {
            return Err(Precondition::BufferSizeMismatch {
                expected,
                actual: vertices.len(),
            }
            .into());
        }

        let mut remapped = vec![0u8; expected];
        for (record, &slot) in vertices.chunks_exact(stride).zip(&self.slots) {
            let start = slot as usize * stride;
            remapped[start..start + stride].copy_from_slice(record);
        }
        Ok(remapped)
    }
}

/// Result of [`optimize_vertex_fetch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutput {
    pub vertices: Vec<u8>,
    pub indices: Vec<u32>,
    /// Vertices referenced by `indices`; they occupy the front of `vertices`.
    pub referenced: usize,
}

/// Fetch efficiency of an index buffer against a vertex buffer layout.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct VertexFetchStatistics {
    /// Bytes pulled through a 128 KiB direct-mapped cache of 64-byte lines.
    pub bytes_fetched: usize,
    /// `bytes_fetched` over the size of the referenced vertices; 1 is ideal.
    pub overfetch: f32,
}

fn vertex_count_of(vertices: &[u8], stride: usize) -> Result<usize> {
    if stride == 0 {
        return Err(Precondition::InvalidStride(stride).into());
    }
    if vertices.len() % stride != 0 {
        return Err(Precondition::BufferSizeMismatch {
            expected: vertices.len() / stride * stride,
            actual: vertices.len(),
        }
        .into());
    }
    Ok(vertices.len() / stride)
}

/// Reorder vertices into first-use order and rewrite the indices to match.
pub fn optimize_vertex_fetch(vertices: &[u8], indices: &[u32], stride: usize) -> Result<FetchOutput> {
    let vertex_count = vertex_count_of(vertices, stride)?;
    let remap = RemapTable::from_indices(indices, vertex_count)?;

    let output = FetchOutput {
        vertices: remap.remap_vertices(vertices, stride)?,
        indices: remap.remap_indices(indices)?,
        referenced: remap.referenced_count(),
    };

    tracing::debug!(
        vertex_count,
        referenced = output.referenced,
        stride,
        "optimized vertex fetch"
    );
    Ok(output)
}

/// In-place form of [`optimize_vertex_fetch`]; returns the referenced count.
pub fn optimize_vertex_fetch_in_place(
    vertices: &mut [u8],
    indices: &mut [u32],
    stride: usize,
) -> Result<usize> {
    let output = optimize_vertex_fetch(vertices, indices, stride)?;
    vertices.copy_from_slice(&output.vertices);
    indices.copy_from_slice(&output.indices);
    Ok(output.referenced)
}

/// Estimate memory traffic of fetching vertices of `stride` bytes in index
/// order.
pub fn analyze_vertex_fetch(
    indices: &[u32],
    vertex_count: usize,
    stride: usize,
) -> Result<VertexFetchStatistics> {
    if stride == 0 {
        return Err(Precondition::InvalidStride(stride).into());
    }
    validate_indices(indices, vertex_count)?;

    let mut visited = vec![false; vertex_count];
    // Tags are stored plus one so that zero means an empty line.
    let mut cache = vec![0usize; CACHE_SIZE / CACHE_LINE];
    let mut bytes_fetched = 0;

    for &index in indices {
        visited[index as usize] = true;

        let start = index as usize * stride;
        let end = start + stride;
        for tag in start / CACHE_LINE..end.div_ceil(CACHE_LINE) {
            let line = &mut cache[tag % (CACHE_SIZE / CACHE_LINE)];
            if *line != tag + 1 {
                bytes_fetched += CACHE_LINE;
                *line = tag + 1;
            }
        }
    }

    let unique = visited.iter().filter(|&&v| v).count();
    Ok(VertexFetchStatistics {
        bytes_fetched,
        overfetch: if unique == 0 {
            0.0
        } else {
            bytes_fetched as f32 / (unique * stride) as f32
        },
    })
}
