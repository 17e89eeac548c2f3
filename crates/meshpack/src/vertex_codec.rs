//! Fixed-stride vertex buffer compression.
//!
//! Vertices are processed in blocks of up to 256 records. Within a block
//! every byte lane (byte `k` of each record) is predicted from the same lane
//! of the previous vertex, and the residuals are bit-packed in groups of 16.
//!
//! Every four blocks form an anchor group that starts with its first vertex
//! stored raw and its byte length. Prediction restarts at each anchor, so a
//! damaged group never affects the groups after it, and a decoder can skip
//! a group it failed to decode.
//!
//! # Format
//!
//! ```text
//! [0xA0 | version] [varint vertex_count] [varint stride]
//! anchor group*:
//!   [u32 le group length] [anchor vertex]
//!   block*, at most 4:
//!     v1 only: 2-bit channel mode per lane, 4 lanes per byte
//!     per lane: [2-bit group selectors] [group payloads]
//! tail: 32 zero bytes
//! ```
//!
//! Group selectors: `0` all zero, `1` two bits per value, `2` four bits per
//! value, `3` raw bytes. Packed values equal to the all-ones sentinel are
//! followed by the full byte after the packed part of the group.

use crate::bitstream::{ByteReader, ByteWriter, header_byte, unzigzag8, varint_len, zigzag8};
use crate::error::{Precondition, Result, StreamError};

/// Header tag of encoded vertex buffers.
pub const VERTEX_HEADER: u8 = 0xa0;

/// Largest supported vertex stride in bytes.
pub const MAX_STRIDE: usize = 256;

const BLOCK_SIZE_BYTES: usize = 8192;
const BLOCK_MAX_SIZE: usize = 256;
const BYTE_GROUP_SIZE: usize = 16;
const MAX_GROUPS: usize = BLOCK_MAX_SIZE / BYTE_GROUP_SIZE;
const TAIL_SIZE: usize = 32;
const ANCHOR_INTERVAL: usize = 4;

/// Vertex buffer wire format revision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum VertexEncodingVersion {
    /// Byte delta prediction on every lane.
    #[default]
    V0,
    /// Per block and lane choice between byte delta and XOR prediction.
    V1,
}

impl VertexEncodingVersion {
    /// Newest version this crate can decode.
    pub const LATEST: Self = Self::V1;

    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::V0 => 0,
            Self::V1 => 1,
        }
    }

    #[must_use]
    pub fn from_u8(version: u8) -> Option<Self> {
        match version {
            0 => Some(Self::V0),
            1 => Some(Self::V1),
            _ => None,
        }
    }
}

/// How a lane's residuals are derived from the previous vertex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelMode {
    Delta,
    Xor,
}

impl ChannelMode {
    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::Delta),
            1 => Some(Self::Xor),
            _ => None,
        }
    }

    fn bits(self) -> u8 {
        match self {
            Self::Delta => 0,
            Self::Xor => 1,
        }
    }

    #[inline]
    fn residual(self, value: u8, previous: u8) -> u8 {
        match self {
            Self::Delta => zigzag8(value.wrapping_sub(previous)),
            Self::Xor => value ^ previous,
        }
    }

    #[inline]
    fn reconstruct(self, residual: u8, previous: u8) -> u8 {
        match self {
            Self::Delta => unzigzag8(residual).wrapping_add(previous),
            Self::Xor => residual ^ previous,
        }
    }
}

/// Vertices per block for a given stride; always a multiple of 16.
fn block_size(stride: usize) -> usize {
    ((BLOCK_SIZE_BYTES / stride) & !(BYTE_GROUP_SIZE - 1)).min(BLOCK_MAX_SIZE)
}

fn align_to_group(count: usize) -> usize {
    (count + BYTE_GROUP_SIZE - 1) & !(BYTE_GROUP_SIZE - 1)
}

fn group_header_size(aligned: usize) -> usize {
    (aligned / BYTE_GROUP_SIZE).div_ceil(4)
}

fn mode_bytes(stride: usize) -> usize {
    stride.div_ceil(4)
}

fn header_len(vertex_count: usize, stride: usize) -> usize {
    1 + varint_len(vertex_count as u64) + varint_len(stride as u64)
}

fn check_stride(stride: usize) -> Result<()> {
    if stride == 0 || stride > MAX_STRIDE {
        return Err(Precondition::InvalidStride(stride).into());
    }
    Ok(())
}

/// Upper bound on the encoded size of `vertex_count` records of `stride` bytes.
///
/// Covers every [`VertexEncodingVersion`]. Returns 0 for unsupported strides.
#[must_use]
pub fn encode_vertex_buffer_bound(vertex_count: usize, stride: usize) -> usize {
    if stride == 0 || stride > MAX_STRIDE {
        return 0;
    }

    let block = block_size(stride);
    let block_count = vertex_count.div_ceil(block);
    let anchor_count = block_count.div_ceil(ANCHOR_INTERVAL);
    let per_block = mode_bytes(stride) + stride * (group_header_size(block) + block);

    header_len(vertex_count, stride)
        + block_count * per_block
        + anchor_count * (4 + stride)
        + TAIL_SIZE
}

/// Encoded size of one group with the given selector, or `None` if the
/// selector can not represent the group.
fn measure_group(group: &[u8], selector: u8) -> Option<usize> {
    match selector {
        0 => group.iter().all(|&b| b == 0).then_some(0),
        3 => Some(BYTE_GROUP_SIZE),
        _ => {
            let bits = 1usize << selector;
            let sentinel = (1u8 << bits) - 1;
            let escaped = group.iter().filter(|&&b| b >= sentinel).count();
            Some(BYTE_GROUP_SIZE * bits / 8 + escaped)
        }
    }
}

/// Cheapest selector for a group; ties keep the raw encoding.
fn choose_selector(group: &[u8]) -> (u8, usize) {
    let mut best = (3, BYTE_GROUP_SIZE);
    for selector in 0..3 {
        if let Some(size) = measure_group(group, selector) {
            if size < best.1 {
                best = (selector, size);
            }
        }
    }
    best
}

fn encoded_lane_size(buffer: &[u8]) -> usize {
    group_header_size(buffer.len())
        + buffer
            .chunks_exact(BYTE_GROUP_SIZE)
            .map(|group| choose_selector(group).1)
            .sum::<usize>()
}

fn encode_group(writer: &mut ByteWriter<'_>, group: &[u8], selector: u8) -> Result<()> {
    match selector {
        0 => {}
        3 => writer.write_bytes(group)?,
        _ => {
            let bits = 1usize << selector;
            let per_byte = 8 / bits;
            let sentinel = (1u8 << bits) - 1;

            for chunk in group.chunks_exact(per_byte) {
                let packed = chunk
                    .iter()
                    .fold(0u8, |acc, &b| (acc << bits) | b.min(sentinel));
                writer.write_u8(packed)?;
            }
            for &b in group.iter().filter(|&&b| b >= sentinel) {
                writer.write_u8(b)?;
            }
        }
    }
    Ok(())
}

/// Encode one lane of a block; `buffer` is padded to a multiple of 16.
fn encode_lane(writer: &mut ByteWriter<'_>, buffer: &[u8]) -> Result<()> {
    debug_assert_eq!(buffer.len() % BYTE_GROUP_SIZE, 0);

    let mut selectors = [0u8; MAX_GROUPS];
    for (selector, group) in selectors.iter_mut().zip(buffer.chunks_exact(BYTE_GROUP_SIZE)) {
        *selector = choose_selector(group).0;
    }

    let groups = buffer.len() / BYTE_GROUP_SIZE;
    for quad in selectors[..groups].chunks(4) {
        let header = quad
            .iter()
            .enumerate()
            .fold(0u8, |acc, (i, &s)| acc | (s << (i * 2)));
        writer.write_u8(header)?;
    }

    for (group, &selector) in buffer.chunks_exact(BYTE_GROUP_SIZE).zip(&selectors) {
        encode_group(writer, group, selector)?;
    }
    Ok(())
}

fn lane_residuals(
    buffer: &mut [u8; BLOCK_MAX_SIZE],
    block: &[u8],
    stride: usize,
    lane: usize,
    previous: u8,
    mode: ChannelMode,
) {
    let mut p = previous;
    for (slot, vertex) in buffer.iter_mut().zip(block.chunks_exact(stride)) {
        let value = vertex[lane];
        *slot = mode.residual(value, p);
        p = value;
    }
}

fn encode_block(
    writer: &mut ByteWriter<'_>,
    block: &[u8],
    stride: usize,
    last_vertex: &mut [u8; MAX_STRIDE],
    version: VertexEncodingVersion,
) -> Result<()> {
    let count = block.len() / stride;
    let aligned = align_to_group(count);

    // Lanes past `count` stay zero so padding compresses to nothing.
    let mut buffer = [0u8; BLOCK_MAX_SIZE];
    let mut modes = [ChannelMode::Delta; MAX_STRIDE];

    if version == VertexEncodingVersion::V1 {
        for (lane, mode) in modes[..stride].iter_mut().enumerate() {
            lane_residuals(&mut buffer, block, stride, lane, last_vertex[lane], ChannelMode::Delta);
            let delta = encoded_lane_size(&buffer[..aligned]);
            lane_residuals(&mut buffer, block, stride, lane, last_vertex[lane], ChannelMode::Xor);
            let xor = encoded_lane_size(&buffer[..aligned]);
            if xor < delta {
                *mode = ChannelMode::Xor;
            }
        }

        for quad in modes[..stride].chunks(4) {
            let byte = quad
                .iter()
                .enumerate()
                .fold(0u8, |acc, (i, m)| acc | (m.bits() << (i * 2)));
            writer.write_u8(byte)?;
        }
    }

    for lane in 0..stride {
        lane_residuals(&mut buffer, block, stride, lane, last_vertex[lane], modes[lane]);
        encode_lane(writer, &buffer[..aligned])?;
    }

    last_vertex[..stride].copy_from_slice(&block[block.len() - stride..]);

    tracing::trace!(count, stride, written = writer.position(), "encoded vertex block");
    Ok(())
}

/// Encode `vertices` (records of `stride` bytes) into a new buffer.
pub fn encode_vertex_buffer(
    vertices: &[u8],
    stride: usize,
    version: VertexEncodingVersion,
) -> Result<Vec<u8>> {
    check_stride(stride)?;
    let vertex_count = vertices.len() / stride;
    let mut buffer = vec![0; encode_vertex_buffer_bound(vertex_count, stride)];
    let written = encode_vertex_buffer_into(&mut buffer, vertices, stride, version)?;
    buffer.truncate(written);
    Ok(buffer)
}

/// Encode a slice of plain-old-data records.
pub fn encode_vertices<T: bytemuck::Pod>(
    vertices: &[T],
    version: VertexEncodingVersion,
) -> Result<Vec<u8>> {
    encode_vertex_buffer(
        bytemuck::cast_slice(vertices),
        std::mem::size_of::<T>(),
        version,
    )
}

/// Encode into `destination`, returning the number of bytes written.
///
/// `destination` should hold [`encode_vertex_buffer_bound`] bytes. Padding
/// bytes inside records are encoded verbatim.
pub fn encode_vertex_buffer_into(
    destination: &mut [u8],
    vertices: &[u8],
    stride: usize,
    version: VertexEncodingVersion,
) -> Result<usize> {
    check_stride(stride)?;
    if vertices.len() % stride != 0 {
        return Err(Precondition::BufferSizeMismatch {
            expected: vertices.len() / stride * stride,
            actual: vertices.len(),
        }
        .into());
    }
    let vertex_count = vertices.len() / stride;

    let mut writer = ByteWriter::new(destination);
    writer.write_u8(header_byte(VERTEX_HEADER, version.as_u8()))?;
    writer.write_varint(vertex_count as u64)?;
    writer.write_varint(stride as u64)?;

    let block_bytes = block_size(stride) * stride;
    for group in vertices.chunks(block_bytes * ANCHOR_INTERVAL) {
        let start = writer.position();
        writer.write_u32_le(0)?;

        let anchor = &group[..stride];
        writer.write_bytes(anchor)?;
        let mut last_vertex = [0u8; MAX_STRIDE];
        last_vertex[..stride].copy_from_slice(anchor);

        for block in group.chunks(block_bytes) {
            encode_block(&mut writer, block, stride, &mut last_vertex, version)?;
        }

        // A group is at most four blocks, far below 4 GiB.
        let len = writer.position() - start - 4;
        writer.patch_u32_le(start, len as u32)?;
    }

    writer.fill(TAIL_SIZE, 0)?;

    let written = writer.position();
    tracing::debug!(
        vertex_count,
        stride,
        version = version.as_u8(),
        written,
        "encoded vertex buffer"
    );
    Ok(written)
}

/// Streaming decoder that yields one block of vertices at a time.
///
/// Blocks decode strictly in order, so stopping early leaves a valid prefix
/// of the vertex buffer. The stream layout (header and tail) is validated
/// up front; anchor groups and block payloads are validated as they are
/// decoded. After a failed block the iterator stops;
/// [`skip_to_next_anchor`](Self::skip_to_next_anchor) resumes it at the
/// next anchor group.
#[derive(Debug, Clone)]
pub struct VertexBlockDecoder<'a> {
    data: ByteReader<'a>,
    group: ByteReader<'a>,
    group_blocks: usize,
    version: VertexEncodingVersion,
    stride: usize,
    block_size: usize,
    remaining: usize,
    last_vertex: [u8; MAX_STRIDE],
    failed: bool,
}

impl<'a> VertexBlockDecoder<'a> {
    pub fn new(encoded: &'a [u8], vertex_count: usize, stride: usize) -> Result<Self> {
        check_stride(stride)?;

        let mut reader = ByteReader::new(encoded);
        let version = reader.read_header(VERTEX_HEADER, VertexEncodingVersion::LATEST.as_u8())?;
        let version =
            VertexEncodingVersion::from_u8(version).ok_or(StreamError::UnsupportedVersion {
                newest: VertexEncodingVersion::LATEST.as_u8(),
                found: version,
            })?;

        let stored_count = reader.read_len()?;
        if stored_count != vertex_count {
            return Err(StreamError::CountMismatch {
                expected: vertex_count,
                found: stored_count,
            }
            .into());
        }
        let stored_stride = reader.read_len()?;
        if stored_stride != stride {
            return Err(StreamError::StrideMismatch {
                expected: stride,
                found: stored_stride,
            }
            .into());
        }

        if reader.remaining() < TAIL_SIZE {
            return Err(StreamError::UnexpectedEof {
                position: encoded.len(),
            }
            .into());
        }
        let data_end = encoded.len() - TAIL_SIZE;
        if let Some(offset) = encoded[data_end..].iter().position(|&b| b != 0) {
            return Err(StreamError::NonZeroPadding {
                position: data_end + offset,
            }
            .into());
        }

        Ok(Self {
            data: ByteReader::new(&encoded[reader.position()..data_end]),
            group: ByteReader::new(&[]),
            group_blocks: 0,
            version,
            stride,
            block_size: block_size(stride),
            remaining: vertex_count,
            last_vertex: [0; MAX_STRIDE],
            failed: false,
        })
    }

    /// Format version of the stream.
    #[must_use]
    pub fn version(&self) -> VertexEncodingVersion {
        self.version
    }

    /// Vertices not yet decoded.
    #[must_use]
    pub fn remaining_vertices(&self) -> usize {
        self.remaining
    }

    /// Number of vertices the next block holds (0 when done).
    #[must_use]
    pub fn next_block_len(&self) -> usize {
        self.remaining.min(self.block_size)
    }

    /// Decode the next block into the front of `out`, returning the number
    /// of vertices written (0 once the stream is exhausted).
    pub fn decode_next_into(&mut self, out: &mut [u8]) -> Result<usize> {
        let count = self.next_block_len();
        if count == 0 {
            return self.finish().map(|()| 0);
        }

        let stride = self.stride;
        let required = count * stride;
        if out.len() < required {
            return Err(Precondition::DestinationTooSmall {
                required,
                actual: out.len(),
            }
            .into());
        }

        let result = self.decode_block(&mut out[..required], count);
        if result.is_err() {
            self.failed = true;
        }
        result?;

        self.remaining -= count;
        self.group_blocks -= 1;
        if self.group_blocks == 0 || self.remaining == 0 {
            self.end_group()?;
        }
        if self.remaining == 0 {
            self.finish()?;
        }
        Ok(count)
    }

    /// Skip the rest of the current anchor group, or the next group when
    /// between groups, returning the number of vertices skipped.
    ///
    /// Decoding resumes at the following anchor, so a corrupt block only
    /// costs the vertices of its own group. The skipped group's length field
    /// must be intact.
    pub fn skip_to_next_anchor(&mut self) -> Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        if self.group_blocks == 0 {
            self.start_group()?;
        }

        let skipped = self.remaining.min(self.group_blocks * self.block_size);
        self.remaining -= skipped;
        self.group_blocks = 0;
        self.group = ByteReader::new(&[]);
        self.failed = false;
        if self.remaining == 0 {
            self.finish()?;
        }

        tracing::debug!(skipped, remaining = self.remaining, "skipped vertex anchor group");
        Ok(skipped)
    }

    fn start_group(&mut self) -> Result<()> {
        let len = self.data.read_u32_le()? as usize;
        let mut group = ByteReader::new(self.data.read_bytes(len)?);
        let anchor = group.read_bytes(self.stride)?;
        self.last_vertex[..self.stride].copy_from_slice(anchor);
        self.group = group;
        self.group_blocks = ANCHOR_INTERVAL;
        Ok(())
    }

    /// Every byte of the finished group must have been consumed.
    fn end_group(&mut self) -> Result<()> {
        self.group_blocks = 0;
        if self.group.remaining() != 0 {
            return Err(StreamError::TrailingBytes {
                count: self.group.remaining(),
            }
            .into());
        }
        Ok(())
    }

    fn decode_block(&mut self, out: &mut [u8], count: usize) -> Result<()> {
        if self.group_blocks == 0 {
            self.start_group()?;
        }

        let stride = self.stride;
        let aligned = align_to_group(count);

        let mut modes = [ChannelMode::Delta; MAX_STRIDE];
        if self.version == VertexEncodingVersion::V1 {
            let packed = self.group.read_bytes(mode_bytes(stride))?;
            for (lane, mode) in modes[..stride].iter_mut().enumerate() {
                let bits = (packed[lane / 4] >> ((lane % 4) * 2)) & 3;
                *mode = ChannelMode::from_bits(bits)
                    .ok_or(StreamError::InvalidChannelMode { mode: bits })?;
            }
        }

        let mut buffer = [0u8; BLOCK_MAX_SIZE];
        for lane in 0..stride {
            decode_lane(&mut self.group, &mut buffer[..aligned])?;

            let mode = modes[lane];
            let mut p = self.last_vertex[lane];
            for (&residual, vertex) in buffer.iter().zip(out.chunks_exact_mut(stride)) {
                let value = mode.reconstruct(residual, p);
                vertex[lane] = value;
                p = value;
            }
        }

        self.last_vertex[..stride].copy_from_slice(&out[out.len() - stride..]);
        tracing::trace!(count, stride, "decoded vertex block");
        Ok(())
    }

    /// Every anchor group must have been consumed.
    fn finish(&self) -> Result<()> {
        if self.data.remaining() != 0 {
            return Err(StreamError::TrailingBytes {
                count: self.data.remaining(),
            }
            .into());
        }
        Ok(())
    }
}

impl Iterator for VertexBlockDecoder<'_> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if self.remaining == 0 {
            return None;
        }

        let mut block = vec![0u8; self.next_block_len() * self.stride];
        match self.decode_next_into(&mut block) {
            Ok(_) => Some(Ok(block)),
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

fn decode_group(reader: &mut ByteReader<'_>, out: &mut [u8], selector: u8) -> Result<()> {
    match selector {
        0 => out.fill(0),
        3 => out.copy_from_slice(reader.read_bytes(BYTE_GROUP_SIZE)?),
        _ => {
            let bits = 1usize << selector;
            let per_byte = 8 / bits;
            let sentinel = (1u8 << bits) - 1;

            let packed = reader.read_bytes(BYTE_GROUP_SIZE / per_byte)?;
            for (byte, chunk) in packed.iter().zip(out.chunks_exact_mut(per_byte)) {
                let mut byte = *byte;
                for slot in chunk {
                    let value = byte >> (8 - bits);
                    byte <<= bits;
                    *slot = if value == sentinel { reader.read_u8()? } else { value };
                }
            }
        }
    }
    Ok(())
}

fn decode_lane(reader: &mut ByteReader<'_>, buffer: &mut [u8]) -> Result<()> {
    debug_assert_eq!(buffer.len() % BYTE_GROUP_SIZE, 0);

    let header = reader.read_bytes(group_header_size(buffer.len()))?;
    for (i, group) in buffer.chunks_exact_mut(BYTE_GROUP_SIZE).enumerate() {
        let selector = (header[i / 4] >> ((i % 4) * 2)) & 3;
        decode_group(reader, group, selector)?;
    }
    Ok(())
}

/// Decode `vertex_count` records of `stride` bytes into a new buffer.
pub fn decode_vertex_buffer(encoded: &[u8], vertex_count: usize, stride: usize) -> Result<Vec<u8>> {
    check_stride(stride)?;
    let mut vertices = vec![0u8; vertex_count * stride];
    decode_vertex_buffer_into(&mut vertices, encoded, stride)?;
    Ok(vertices)
}

/// Decode into plain-old-data records.
pub fn decode_vertices<T: bytemuck::Pod>(encoded: &[u8], vertex_count: usize) -> Result<Vec<T>> {
    let mut vertices = vec![T::zeroed(); vertex_count];
    decode_vertex_buffer_into(
        bytemuck::cast_slice_mut(&mut vertices),
        encoded,
        std::mem::size_of::<T>(),
    )?;
    Ok(vertices)
}

/// Decode into `destination`, whose length fixes the vertex count.
pub fn decode_vertex_buffer_into(destination: &mut [u8], encoded: &[u8], stride: usize) -> Result<()> {
    check_stride(stride)?;
    if destination.len() % stride != 0 {
        return Err(Precondition::BufferSizeMismatch {
            expected: destination.len() / stride * stride,
            actual: destination.len(),
        }
        .into());
    }
    let vertex_count = destination.len() / stride;

    let mut decoder = VertexBlockDecoder::new(encoded, vertex_count, stride)?;
    let version = decoder.version();

    let mut offset = 0;
    loop {
        let count = decoder.decode_next_into(&mut destination[offset..])?;
        if count == 0 {
            break;
        }
        offset += count * stride;
    }

    tracing::debug!(
        vertex_count,
        stride,
        version = version.as_u8(),
        encoded = encoded.len(),
        "decoded vertex buffer"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
    #[repr(C)]
    struct PackedVertex {
        position: [u16; 3],
        normal: [i8; 2],
        uv: [u16; 2],
    }

    fn quad() -> [PackedVertex; 4] {
        [
            PackedVertex::default(),
            PackedVertex {
                position: [300, 0, 0],
                uv: [500, 0],
                ..PackedVertex::default()
            },
            PackedVertex {
                position: [0, 300, 0],
                uv: [0, 500],
                ..PackedVertex::default()
            },
            PackedVertex {
                position: [300, 300, 0],
                uv: [500, 500],
                ..PackedVertex::default()
            },
        ]
    }

    fn both_versions() -> [VertexEncodingVersion; 2] {
        [VertexEncodingVersion::V0, VertexEncodingVersion::V1]
    }

    #[test]
    fn typed_roundtrip() {
        for version in both_versions() {
            let encoded = encode_vertices(&quad(), version).unwrap();
            assert_eq!(encoded[0], VERTEX_HEADER | version.as_u8());
            let decoded: Vec<PackedVertex> = decode_vertices(&encoded, 4).unwrap();
            assert_eq!(decoded, quad());
        }
    }

    #[test]
    fn bit_groups_and_sentinels() {
        // 0, 2, 4 and 8 bit groups with two outliers forcing sentinels.
        let mut data = Vec::new();
        for i in 0u8..16 {
            if i == 7 || i == 13 {
                data.extend_from_slice(&[42; 4]);
            } else {
                data.extend_from_slice(&[0, i, i * 2, i * 8]);
            }
        }
        for version in both_versions() {
            let encoded = encode_vertex_buffer(&data, 4, version).unwrap();
            assert_eq!(decode_vertex_buffer(&encoded, 16, 4).unwrap(), data);
        }
    }

    #[test]
    fn multiple_blocks() {
        let data: Vec<u8> = (0..1000u32).flat_map(|i| (i * 7).to_le_bytes()).collect();
        let encoded = encode_vertex_buffer(&data, 4, VertexEncodingVersion::V0).unwrap();
        assert!(encoded.len() < data.len());
        assert_eq!(decode_vertex_buffer(&encoded, 1000, 4).unwrap(), data);
    }

    #[test]
    fn odd_stride() {
        let data: Vec<u8> = (0..3 * 77).map(|i| (i % 251) as u8).collect();
        for version in both_versions() {
            let encoded = encode_vertex_buffer(&data, 3, version).unwrap();
            assert_eq!(decode_vertex_buffer(&encoded, 77, 3).unwrap(), data);
        }
    }

    #[test]
    fn xor_mode_helps_bit_flags() {
        // A toggling flag bit costs 2 bits as XOR residual, 4 bits as delta.
        let data: Vec<u8> = (0..256u32)
            .map(|i| if i % 2 == 0 { 0x01 } else { 0x03 })
            .collect();
        let v0 = encode_vertex_buffer(&data, 1, VertexEncodingVersion::V0).unwrap();
        let v1 = encode_vertex_buffer(&data, 1, VertexEncodingVersion::V1).unwrap();
        assert!(v1.len() < v0.len());
        assert_eq!(decode_vertex_buffer(&v1, 256, 1).unwrap(), data);
    }

    #[test]
    fn empty_buffer() {
        let encoded = encode_vertex_buffer(&[], 16, VertexEncodingVersion::V0).unwrap();
        assert_eq!(encoded.len(), 3 + TAIL_SIZE);
        assert!(decode_vertex_buffer(&encoded, 0, 16).unwrap().is_empty());
    }

    #[test]
    fn rejects_bad_stride() {
        assert!(encode_vertex_buffer(&[0; 4], 0, VertexEncodingVersion::V0).is_err());
        assert!(encode_vertex_buffer(&[0; 512], 512, VertexEncodingVersion::V0).is_err());
        assert_eq!(
            encode_vertex_buffer(&[0; 10], 4, VertexEncodingVersion::V0).unwrap_err(),
            Precondition::BufferSizeMismatch {
                expected: 8,
                actual: 10
            }
            .into()
        );
    }

    #[test]
    fn rejects_mismatched_shape() {
        let encoded = encode_vertices(&quad(), VertexEncodingVersion::V0).unwrap();
        let stride = std::mem::size_of::<PackedVertex>();
        assert_eq!(
            decode_vertex_buffer(&encoded, 3, stride).unwrap_err(),
            StreamError::CountMismatch {
                expected: 3,
                found: 4
            }
            .into()
        );
        assert_eq!(
            decode_vertex_buffer(&encoded, 4, 8).unwrap_err(),
            StreamError::StrideMismatch {
                expected: 8,
                found: stride
            }
            .into()
        );
    }

    #[test]
    fn rejects_malformed_header() {
        let mut encoded = encode_vertices(&quad(), VertexEncodingVersion::V0).unwrap();
        encoded[0] = 0;
        assert!(decode_vertices::<PackedVertex>(&encoded, 4).unwrap_err().is_corrupt_stream());

        encoded[0] = VERTEX_HEADER | 9;
        assert_eq!(
            decode_vertices::<PackedVertex>(&encoded, 4).unwrap_err(),
            StreamError::UnsupportedVersion {
                newest: 1,
                found: 9
            }
            .into()
        );
    }

    #[test]
    fn rejects_every_truncation_and_extra_bytes() {
        let encoded = encode_vertices(&quad(), VertexEncodingVersion::V1).unwrap();
        for len in 0..encoded.len() {
            assert!(
                decode_vertices::<PackedVertex>(&encoded[..len], 4).is_err(),
                "length {len}"
            );
        }

        let mut extended = encoded.clone();
        extended.push(0);
        assert!(decode_vertices::<PackedVertex>(&extended, 4).is_err());
    }

    #[test]
    fn destination_too_small() {
        let data = [1u8; 64];
        let mut destination = [0u8; 8];
        let err = encode_vertex_buffer_into(&mut destination, &data, 4, VertexEncodingVersion::V0)
            .unwrap_err();
        assert!(err.is_precondition_violation());
    }

    #[test]
    fn block_decoder_yields_prefixes() {
        let data: Vec<u8> = (0..600u32).flat_map(|i| [i as u8, (i >> 8) as u8]).collect();
        let encoded = encode_vertex_buffer(&data, 2, VertexEncodingVersion::V1).unwrap();

        let decoder = VertexBlockDecoder::new(&encoded, 600, 2).unwrap();
        assert_eq!(decoder.next_block_len(), 256);

        let mut prefix = Vec::new();
        for block in decoder {
            prefix.extend(block.unwrap());
            assert_eq!(prefix[..], data[..prefix.len()]);
        }
        assert_eq!(prefix, data);
    }

    #[test]
    fn block_decoder_stops_after_error() {
        let data = [7u8; 64];
        let encoded = encode_vertex_buffer(&data, 4, VertexEncodingVersion::V0).unwrap();
        let truncated = [&encoded[..4], &encoded[encoded.len() - 32..]].concat();
        let mut decoder = VertexBlockDecoder::new(&truncated, 16, 4).unwrap();
        assert!(decoder.next().unwrap().is_err());
        assert!(decoder.next().is_none());
    }

    /// 2048 one-word records: eight blocks, two anchor groups.
    fn two_anchor_groups() -> Vec<u8> {
        (0..2048u32).flat_map(|i| (i * 3).to_le_bytes()).collect()
    }

    #[test]
    fn damaged_anchor_group_leaves_later_groups_intact() {
        let data = two_anchor_groups();
        let group_bytes = ANCHOR_INTERVAL * block_size(4) * 4;
        assert_eq!(data.len(), 2 * group_bytes);

        let mut encoded = encode_vertex_buffer(&data, 4, VertexEncodingVersion::V0).unwrap();
        // One bit of the first group's anchor vertex.
        encoded[header_len(2048, 4) + 4] ^= 1;

        let decoded = decode_vertex_buffer(&encoded, 2048, 4).unwrap();
        assert_ne!(decoded[..group_bytes], data[..group_bytes]);
        assert_eq!(decoded[group_bytes..], data[group_bytes..]);
    }

    #[test]
    fn block_decoder_resumes_at_next_anchor() {
        let data = two_anchor_groups();
        let mut encoded = encode_vertex_buffer(&data, 4, VertexEncodingVersion::V1).unwrap();
        // Channel mode byte of the first block, after length and anchor.
        encoded[header_len(2048, 4) + 4 + 4] = 0xff;

        let mut decoder = VertexBlockDecoder::new(&encoded, 2048, 4).unwrap();
        assert_eq!(
            decoder.next().unwrap().unwrap_err(),
            StreamError::InvalidChannelMode { mode: 3 }.into()
        );
        assert!(decoder.next().is_none());

        assert_eq!(decoder.skip_to_next_anchor().unwrap(), 1024);
        let rest: Vec<u8> = decoder.by_ref().flat_map(Result::unwrap).collect();
        assert_eq!(rest, data[4096..]);
        assert_eq!(decoder.remaining_vertices(), 0);
        assert_eq!(decoder.skip_to_next_anchor().unwrap(), 0);
    }

    #[test]
    fn rejects_non_zero_tail() {
        let mut encoded = encode_vertices(&quad(), VertexEncodingVersion::V0).unwrap();
        let last = encoded.len() - 1;
        encoded[last] = 1;
        assert_eq!(
            decode_vertices::<PackedVertex>(&encoded, 4).unwrap_err(),
            StreamError::NonZeroPadding { position: last }.into()
        );
    }

    proptest! {
        #[test]
        fn roundtrip_any_bytes(
            stride in 1usize..40,
            records in prop::collection::vec(any::<u8>(), 0..2000),
            v1 in any::<bool>(),
        ) {
            let len = records.len() / stride * stride;
            let data = &records[..len];
            let version = if v1 { VertexEncodingVersion::V1 } else { VertexEncodingVersion::V0 };

            let encoded = encode_vertex_buffer(data, stride, version).unwrap();
            prop_assert!(encoded.len() <= encode_vertex_buffer_bound(len / stride, stride));
            prop_assert_eq!(decode_vertex_buffer(&encoded, len / stride, stride).unwrap(), data);
        }

        #[test]
        fn decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..256), count in 0usize..64) {
            let _ = decode_vertex_buffer(&bytes, count, 4);
        }
    }
}
