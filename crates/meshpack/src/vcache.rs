//! Triangle reordering for the post-transform vertex cache.
//!
//! The scored optimizer simulates a 16-entry LRU cache and greedily emits the
//! adjacent triangle whose vertices score highest; the FIFO optimizer
//! (Tipsify) fans around one vertex at a time and prefers next vertices that
//! will still be cached. Both keep every triangle and its winding.

use crate::error::{Precondition, Result};
use crate::index_codec::validate_indices;

/// Entries in the simulated LRU cache of the scored optimizer.
pub const CACHE_SIZE: usize = 16;

/// Live triangle counts above this share the last score bucket.
pub const VALENCE_MAX: usize = 8;

/// Largest cache the FIFO optimizer and the analyzer simulate.
pub const MAX_FIFO_CACHE_SIZE: usize = 1 << 16;

/// Triangle ids, adjacency offsets and cache timestamps are `u32`; this
/// keeps all of them, plus a maximal cache size, below `u32::MAX`.
const MAX_INDEX_COUNT: usize = (u32::MAX / 2) as usize;

fn check_index_count(index_count: usize) -> Result<()> {
    if index_count > MAX_INDEX_COUNT {
        return Err(Precondition::TooManyIndices {
            count: index_count,
            max: MAX_INDEX_COUNT,
        }
        .into());
    }
    Ok(())
}

fn check_input(indices: &[u32], vertex_count: usize) -> Result<()> {
    check_index_count(indices.len())?;
    validate_indices(indices, vertex_count)
}

fn check_cache_size(cache_size: usize, minimum: usize) -> Result<u32> {
    if !(minimum..=MAX_FIFO_CACHE_SIZE).contains(&cache_size) {
        return Err(Precondition::InvalidCacheSize(cache_size).into());
    }
    Ok(cache_size as u32)
}

/// Vertex score weights for the scored optimizer.
///
/// `cache[0]` scores vertices outside the cache, `cache[1 + i]` a vertex at
/// cache position `i`. `live[n]` scores a vertex with `n` triangles left to
/// emit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VertexScoreTable {
    pub cache: [f32; CACHE_SIZE + 1],
    pub live: [f32; VALENCE_MAX + 1],
}

impl VertexScoreTable {
    /// Weights tuned for triangle lists.
    pub const LIST: Self = Self {
        cache: [
            0.0, 0.779, 0.791, 0.789, 0.981, 0.843, 0.726, 0.847, 0.882, 0.867, 0.799, 0.642,
            0.613, 0.600, 0.568, 0.372, 0.234,
        ],
        live: [0.0, 0.995, 0.713, 0.450, 0.404, 0.059, 0.005, 0.147, 0.006],
    };

    /// Weights tuned for output that is later converted to strips.
    pub const STRIP: Self = Self {
        cache: [
            0.0, 1.0, 1.0, 1.0, 0.453, 0.561, 0.490, 0.459, 0.179, 0.526, 0.0, 0.227, 0.184,
            0.490, 0.112, 0.050, 0.131,
        ],
        live: [0.0, 0.956, 0.786, 0.577, 0.558, 0.618, 0.549, 0.499, 0.489],
    };

    #[must_use]
    pub const fn new(cache: [f32; CACHE_SIZE + 1], live: [f32; VALENCE_MAX + 1]) -> Self {
        Self { cache, live }
    }

    fn score(&self, cache_position: Option<usize>, live_triangles: u32) -> f32 {
        let cache = cache_position.map_or(0, |position| position + 1);
        let live = (live_triangles as usize).min(VALENCE_MAX);
        self.cache[cache] + self.live[live]
    }
}

impl Default for VertexScoreTable {
    fn default() -> Self {
        Self::LIST
    }
}

/// Cache efficiency of an index buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct VertexCacheStatistics {
    /// Vertex shader invocations with a FIFO cache of the analyzed size.
    pub vertices_transformed: usize,
    /// Average cache miss ratio: transformed vertices per triangle.
    pub acmr: f32,
    /// Average transformed vertex ratio: transformed per referenced vertex.
    pub atvr: f32,
}

/// Per-vertex lists of the triangles that use the vertex.
///
/// Callers keep the index count within `MAX_INDEX_COUNT`, so offsets and
/// triangle ids fit in `u32`.
struct TriangleAdjacency {
    counts: Vec<u32>,
    offsets: Vec<u32>,
    data: Vec<u32>,
}

impl TriangleAdjacency {
    fn build(indices: &[u32], vertex_count: usize) -> Self {
        let mut counts = vec![0u32; vertex_count];
        for &index in indices {
            counts[index as usize] += 1;
        }

        let mut offsets = vec![0u32; vertex_count];
        let mut offset = 0;
        for (slot, &count) in offsets.iter_mut().zip(&counts) {
            *slot = offset;
            offset += count;
        }

        let mut data = vec![0u32; indices.len()];
        let mut fill = offsets.clone();
        for (triangle, corners) in indices.chunks_exact(3).enumerate() {
            for &index in corners {
                let slot = &mut fill[index as usize];
                data[*slot as usize] = triangle as u32;
                *slot += 1;
            }
        }

        Self {
            counts,
            offsets,
            data,
        }
    }

    fn neighbors(&self, vertex: usize) -> &[u32] {
        let start = self.offsets[vertex] as usize;
        &self.data[start..start + self.counts[vertex] as usize]
    }

    /// Drop one occurrence of `triangle` from the list of `vertex`.
    fn remove(&mut self, vertex: usize, triangle: u32) {
        let start = self.offsets[vertex] as usize;
        let count = self.counts[vertex] as usize;
        let list = &mut self.data[start..start + count];
        if let Some(i) = list.iter().position(|&t| t == triangle) {
            list.swap(i, count - 1);
            self.counts[vertex] -= 1;
        }
    }
}

fn triangle(indices: &[u32], triangle: usize) -> [u32; 3] {
    [
        indices[triangle * 3],
        indices[triangle * 3 + 1],
        indices[triangle * 3 + 2],
    ]
}

/// Reorder triangles for the vertex cache using the list score table.
pub fn optimize_vertex_cache(indices: &[u32], vertex_count: usize) -> Result<Vec<u32>> {
    optimize_vertex_cache_with_table(indices, vertex_count, &VertexScoreTable::LIST)
}

/// Reorder triangles using the strip score table.
pub fn optimize_vertex_cache_strip(indices: &[u32], vertex_count: usize) -> Result<Vec<u32>> {
    optimize_vertex_cache_with_table(indices, vertex_count, &VertexScoreTable::STRIP)
}

pub fn optimize_vertex_cache_in_place(indices: &mut [u32], vertex_count: usize) -> Result<()> {
    let optimized = optimize_vertex_cache(indices, vertex_count)?;
    indices.copy_from_slice(&optimized);
    Ok(())
}

pub fn optimize_vertex_cache_strip_in_place(indices: &mut [u32], vertex_count: usize) -> Result<()> {
    let optimized = optimize_vertex_cache_strip(indices, vertex_count)?;
    indices.copy_from_slice(&optimized);
    Ok(())
}

/// Reorder triangles with custom score weights.
///
/// Deterministic: ties keep the first candidate found, and dead ends resume
/// at the lowest input triangle not yet emitted.
pub fn optimize_vertex_cache_with_table(
    indices: &[u32],
    vertex_count: usize,
    table: &VertexScoreTable,
) -> Result<Vec<u32>> {
    check_input(indices, vertex_count)?;

    let mut destination = vec![0; indices.len()];
    if !indices.is_empty() {
        optimize_scored(&mut destination, indices, vertex_count, table);
    }

    tracing::debug!(
        index_count = indices.len(),
        vertex_count,
        "optimized vertex cache"
    );
    Ok(destination)
}

fn optimize_scored(
    destination: &mut [u32],
    indices: &[u32],
    vertex_count: usize,
    table: &VertexScoreTable,
) {
    let face_count = indices.len() / 3;

    // Adjacency lists shrink as triangles are emitted, so their lengths
    // double as live triangle counts.
    let mut adjacency = TriangleAdjacency::build(indices, vertex_count);
    let mut emitted = vec![false; face_count];

    let mut vertex_scores: Vec<f32> = adjacency
        .counts
        .iter()
        .map(|&live| table.score(None, live))
        .collect();
    let mut triangle_scores: Vec<f32> = indices
        .chunks_exact(3)
        .map(|t| t.iter().map(|&v| vertex_scores[v as usize]).sum())
        .collect();

    let mut cache = [0u32; CACHE_SIZE + 3];
    let mut cache_new = [0u32; CACHE_SIZE + 3];
    let mut cache_count = 0;

    let mut current = Some(0);
    let mut input_cursor = 1;
    let mut output = 0;

    while let Some(current_triangle) = current {
        let corners = triangle(indices, current_triangle);
        destination[output * 3..output * 3 + 3].copy_from_slice(&corners);
        output += 1;

        emitted[current_triangle] = true;
        triangle_scores[current_triangle] = 0.0;

        // The new triangle goes to the front, older entries follow.
        cache_new[..3].copy_from_slice(&corners);
        let mut cache_write = 3;
        for &index in &cache[..cache_count] {
            cache_new[cache_write] = index;
            cache_write += usize::from(!corners.contains(&index));
        }
        std::mem::swap(&mut cache, &mut cache_new);
        cache_count = cache_write.min(CACHE_SIZE);

        for &index in &corners {
            adjacency.remove(index as usize, current_triangle as u32);
        }

        let mut best = None;
        let mut best_score = 0.0;

        // Entries past the cache size just fell out; rescore them too.
        for (position, &index) in cache[..cache_write].iter().enumerate() {
            let index = index as usize;
            let live = adjacency.counts[index];
            if live == 0 {
                continue;
            }

            let score = table.score((position < CACHE_SIZE).then_some(position), live);
            let diff = score - vertex_scores[index];
            vertex_scores[index] = score;

            for &neighbor in adjacency.neighbors(index) {
                let neighbor = neighbor as usize;
                let tri_score = triangle_scores[neighbor] + diff;
                if best_score < tri_score {
                    best = Some(neighbor);
                    best_score = tri_score;
                }
                triangle_scores[neighbor] = tri_score;
            }
        }

        current = best.or_else(|| {
            while input_cursor < face_count {
                if !emitted[input_cursor] {
                    return Some(input_cursor);
                }
                input_cursor += 1;
            }
            None
        });
    }

    debug_assert_eq!(output, face_count);
}

/// Reorder triangles for a FIFO cache of `cache_size` entries (Tipsify).
///
/// `cache_size` must be in `3..=MAX_FIFO_CACHE_SIZE`.
pub fn optimize_vertex_cache_fifo(
    indices: &[u32],
    vertex_count: usize,
    cache_size: usize,
) -> Result<Vec<u32>> {
    check_input(indices, vertex_count)?;
    let cache_size = check_cache_size(cache_size, 3)?;

    let mut destination = vec![0; indices.len()];
    if !indices.is_empty() {
        optimize_fifo(&mut destination, indices, vertex_count, cache_size);
    }

    tracing::debug!(
        index_count = indices.len(),
        vertex_count,
        cache_size,
        "optimized vertex cache (fifo)"
    );
    Ok(destination)
}

pub fn optimize_vertex_cache_fifo_in_place(
    indices: &mut [u32],
    vertex_count: usize,
    cache_size: usize,
) -> Result<()> {
    let optimized = optimize_vertex_cache_fifo(indices, vertex_count, cache_size)?;
    indices.copy_from_slice(&optimized);
    Ok(())
}

fn optimize_fifo(destination: &mut [u32], indices: &[u32], vertex_count: usize, cache_size: u32) {
    let face_count = indices.len() / 3;

    let adjacency = TriangleAdjacency::build(indices, vertex_count);
    let mut live = adjacency.counts.clone();
    let mut timestamps = vec![0u32; vertex_count];
    let mut dead_end: Vec<u32> = Vec::with_capacity(indices.len());
    let mut emitted = vec![false; face_count];

    let mut current = Some(0);
    let mut timestamp = cache_size + 1;
    let mut input_cursor = 1;
    let mut output = 0;

    while let Some(vertex) = current {
        let candidates_start = dead_end.len();

        for &neighbor in adjacency.neighbors(vertex) {
            let neighbor = neighbor as usize;
            if emitted[neighbor] {
                continue;
            }

            let corners = triangle(indices, neighbor);
            destination[output * 3..output * 3 + 3].copy_from_slice(&corners);
            output += 1;
            dead_end.extend_from_slice(&corners);

            for &index in &corners {
                let index = index as usize;
                live[index] -= 1;
                if timestamp - timestamps[index] > cache_size {
                    timestamps[index] = timestamp;
                    timestamp += 1;
                }
            }
            emitted[neighbor] = true;
        }

        current = next_vertex_neighbor(
            &dead_end[candidates_start..],
            &live,
            &timestamps,
            timestamp,
            cache_size,
        )
        .or_else(|| next_vertex_dead_end(&mut dead_end, &mut input_cursor, &live));
    }

    debug_assert_eq!(output, face_count);
}

/// Pick the candidate that stays cached after fanning, preferring the
/// oldest cache entry.
fn next_vertex_neighbor(
    candidates: &[u32],
    live: &[u32],
    timestamps: &[u32],
    timestamp: u32,
    cache_size: u32,
) -> Option<usize> {
    let mut best = None;
    let mut best_priority = -1i64;

    for &candidate in candidates {
        let candidate = candidate as usize;
        if live[candidate] == 0 {
            continue;
        }

        let age = timestamp - timestamps[candidate];
        let priority = if 2 * live[candidate] + age <= cache_size {
            i64::from(age)
        } else {
            0
        };
        if priority > best_priority {
            best = Some(candidate);
            best_priority = priority;
        }
    }
    best
}

fn next_vertex_dead_end(dead_end: &mut Vec<u32>, input_cursor: &mut usize, live: &[u32]) -> Option<usize> {
    while let Some(vertex) = dead_end.pop() {
        if live[vertex as usize] > 0 {
            return Some(vertex as usize);
        }
    }
    while *input_cursor < live.len() {
        if live[*input_cursor] > 0 {
            return Some(*input_cursor);
        }
        *input_cursor += 1;
    }
    None
}

/// Simulate a FIFO cache of `cache_size` entries over `indices`.
///
/// `cache_size` must be in `1..=MAX_FIFO_CACHE_SIZE`.
pub fn analyze_vertex_cache(
    indices: &[u32],
    vertex_count: usize,
    cache_size: usize,
) -> Result<VertexCacheStatistics> {
    check_input(indices, vertex_count)?;
    let cache_size = check_cache_size(cache_size, 1)?;

    let mut timestamps = vec![0u32; vertex_count];
    let mut timestamp = cache_size + 1;
    let mut vertices_transformed = 0;

    for &index in indices {
        let index = index as usize;
        if timestamp - timestamps[index] > cache_size {
            timestamps[index] = timestamp;
            timestamp += 1;
            vertices_transformed += 1;
        }
    }

    let unique = timestamps.iter().filter(|&&t| t > 0).count();
    let face_count = indices.len() / 3;

    Ok(VertexCacheStatistics {
        vertices_transformed,
        acmr: if face_count == 0 {
            0.0
        } else {
            vertices_transformed as f32 / face_count as f32
        },
        atvr: if unique == 0 {
            0.0
        } else {
            vertices_transformed as f32 / unique as f32
        },
    })
}
