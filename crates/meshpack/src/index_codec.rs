//! Triangle index buffer compression.
//!
//! Triangles are coded against two small ring buffers: the 16 most recent
//! edges and the 16 most recent vertices. After vertex cache optimization
//! most triangles share an edge with a recent one and reference either a
//! recent vertex or the next never-seen vertex, so they cost a single code
//! byte. Everything else falls back to zigzag varint deltas.
//!
//! Triangles are coded starting at whichever corner suits the FIFOs best.
//! The starting corner is kept in a 2-bit rotation field, so decoding gives
//! back the original corner order.
//!
//! # Format
//!
//! ```text
//! [0xE0 | version] [varint index_count]
//! [code byte per triangle]
//! [2-bit rotation per triangle, 4 triangles per byte]
//! [variable data: aux bytes and varint deltas]
//! [16-byte aux table]
//! ```

use crate::bitstream::{ByteReader, ByteWriter, header_byte, unzigzag32, varint_len, zigzag32};
use crate::error::{Precondition, Result, StreamError};

/// Header tag of encoded index buffers.
pub const INDEX_HEADER: u8 = 0xe0;

const FIFO_SIZE: usize = 16;

/// Aux codes (`feb << 4 | fec`) that fit in the low nibble of a code byte.
///
/// Built from symbol frequencies on typical meshes. The last two entries are
/// never referenced by codes but pad the stream tail.
const CODE_AUX_TABLE: [u8; 16] = [
    0x00, 0x76, 0x87, 0x56, 0x67, 0x78, 0xa9, 0x86, 0x65, 0x89, 0x68, 0x98, 0x01, 0x69, 0x00, 0x00,
];

const TRIANGLE_ROTATIONS: [[usize; 3]; 3] = [[0, 1, 2], [1, 2, 0], [2, 0, 1]];

/// Index buffer wire format revision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum IndexEncodingVersion {
    /// Original format, decodable by every decoder.
    V0,
    /// Adds ±1 free-index codes and explicit strip restarts.
    #[default]
    V1,
}

impl IndexEncodingVersion {
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

    /// First vertex FIFO code that is not a FIFO reference.
    fn fec_max(self) -> usize {
        match self {
            Self::V0 => 15,
            Self::V1 => 13,
        }
    }
}

/// Integer types an index buffer can be decoded into.
pub trait IndexType: Copy + Default {
    /// Number of distinct vertices the type can address.
    const CAPACITY: usize;

    fn try_from_u32(value: u32) -> Option<Self>;
}

impl IndexType for u32 {
    const CAPACITY: usize = usize::MAX;

    fn try_from_u32(value: u32) -> Option<Self> {
        Some(value)
    }
}

impl IndexType for u16 {
    const CAPACITY: usize = 1 << 16;

    fn try_from_u32(value: u32) -> Option<Self> {
        u16::try_from(value).ok()
    }
}

struct EdgeFifo {
    entries: [[u32; 2]; FIFO_SIZE],
    offset: usize,
}

impl EdgeFifo {
    fn new() -> Self {
        Self {
            entries: [[u32::MAX; 2]; FIFO_SIZE],
            offset: 0,
        }
    }

    /// Find a recent edge of triangle `abc`, returning its age and the
    /// rotation that moves the matched edge to the front.
    fn find(&self, a: u32, b: u32, c: u32) -> Option<(usize, usize)> {
        (0..FIFO_SIZE).find_map(|age| {
            let [e0, e1] = self.get(age);
            if e0 == a && e1 == b {
                Some((age, 0))
            } else if e0 == b && e1 == c {
                Some((age, 1))
            } else if e0 == c && e1 == a {
                Some((age, 2))
            } else {
                None
            }
        })
    }

    fn get(&self, age: usize) -> [u32; 2] {
        self.entries[self.offset.wrapping_sub(1 + age) & (FIFO_SIZE - 1)]
    }

    fn push(&mut self, a: u32, b: u32) {
        self.entries[self.offset] = [a, b];
        self.offset = (self.offset + 1) & (FIFO_SIZE - 1);
    }
}

struct VertexFifo {
    entries: [u32; FIFO_SIZE],
    offset: usize,
}

impl VertexFifo {
    fn new() -> Self {
        Self {
            entries: [u32::MAX; FIFO_SIZE],
            offset: 0,
        }
    }

    fn reset(&mut self) {
        self.entries = [u32::MAX; FIFO_SIZE];
    }

    fn find(&self, v: u32) -> Option<usize> {
        (0..FIFO_SIZE).find(|&age| self.get(age) == v)
    }

    fn get(&self, age: usize) -> u32 {
        self.entries[self.offset.wrapping_sub(1 + age) & (FIFO_SIZE - 1)]
    }

    fn push(&mut self, v: u32) {
        self.push_if(v, true);
    }

    /// Always stores `v`, but only advances when `cond` holds; keeps the
    /// decoder free of branches on the hot path.
    fn push_if(&mut self, v: u32, cond: bool) {
        self.entries[self.offset] = v;
        self.offset = (self.offset + usize::from(cond)) & (FIFO_SIZE - 1);
    }
}

fn rotate(tri: &[u32], rotation: usize) -> [u32; 3] {
    let order = TRIANGLE_ROTATIONS[rotation];
    [tri[order[0]], tri[order[1]], tri[order[2]]]
}

/// Inverse of [`rotate`].
fn unrotate(coded: [u32; 3], rotation: usize) -> [u32; 3] {
    rotate(&coded, (3 - rotation) % 3)
}

fn rotation_bytes(triangle_count: usize) -> usize {
    triangle_count.div_ceil(4)
}

fn header_len(index_count: usize) -> usize {
    1 + varint_len(index_count as u64)
}

/// Upper bound on the encoded size of any valid index buffer of this shape.
#[must_use]
pub fn encode_index_buffer_bound(index_count: usize, vertex_count: usize) -> usize {
    // Bits needed per index.
    let mut vertex_bits = 1;
    while vertex_bits < 32 && vertex_count > 1usize << vertex_bits {
        vertex_bits += 1;
    }

    // Worst case per triangle: code byte, aux byte and three zigzag deltas.
    let vertex_groups = (vertex_bits + 1 + 6) / 7;

    let triangle_count = index_count / 3;
    header_len(index_count)
        + triangle_count * (2 + 3 * vertex_groups)
        + rotation_bytes(triangle_count)
        + FIFO_SIZE
}

pub(crate) fn validate_indices(indices: &[u32], vertex_count: usize) -> Result<()> {
    if indices.len() % 3 != 0 {
        return Err(Precondition::IndexCountNotTriangles(indices.len()).into());
    }
    if let Some(&index) = indices.iter().find(|&&i| i as usize >= vertex_count) {
        return Err(Precondition::IndexOutOfRange {
            index,
            vertex_count,
        }
        .into());
    }
    Ok(())
}

/// Encode a triangle list into a freshly allocated buffer.
///
/// Output is deterministic for a given input and version.
pub fn encode_index_buffer(
    indices: &[u32],
    vertex_count: usize,
    version: IndexEncodingVersion,
) -> Result<Vec<u8>> {
    let mut buffer = vec![0; encode_index_buffer_bound(indices.len(), vertex_count)];
    let written = encode_index_buffer_into(&mut buffer, indices, vertex_count, version)?;
    buffer.truncate(written);
    Ok(buffer)
}

/// Encode a triangle list into `destination`, returning the bytes written.
///
/// `destination` should hold [`encode_index_buffer_bound`] bytes.
pub fn encode_index_buffer_into(
    destination: &mut [u8],
    indices: &[u32],
    vertex_count: usize,
    version: IndexEncodingVersion,
) -> Result<usize> {
    validate_indices(indices, vertex_count)?;

    let triangle_count = indices.len() / 3;
    let head = header_len(indices.len());

    // Header, code bytes, rotations and the aux table are mandatory.
    let minimum = head + triangle_count + rotation_bytes(triangle_count) + FIFO_SIZE;
    if destination.len() < minimum {
        return Err(Precondition::DestinationTooSmall {
            required: minimum,
            actual: destination.len(),
        }
        .into());
    }

    let (header, rest) = destination.split_at_mut(head);
    let mut header = ByteWriter::new(header);
    header.write_u8(header_byte(INDEX_HEADER, version.as_u8()))?;
    header.write_varint(indices.len() as u64)?;

    let (codes, rest) = rest.split_at_mut(triangle_count);
    let (rotations, data) = rest.split_at_mut(rotation_bytes(triangle_count));
    rotations.fill(0);
    let mut data = ByteWriter::new(data);

    let mut edges = EdgeFifo::new();
    let mut vertices = VertexFifo::new();
    let mut next = 0u32;
    let mut last = 0u32;
    let fec_max = version.fec_max();
    let v1 = version == IndexEncodingVersion::V1;

    for (triangle, (code, tri)) in codes.iter_mut().zip(indices.chunks_exact(3)).enumerate() {
        let edge = edges
            .find(tri[0], tri[1], tri[2])
            .filter(|&(age, _)| age < 15);

        let rotation = if let Some((fe, rotation)) = edge {
            let [a, b, c] = rotate(tri, rotation);

            let mut fec = match vertices.find(c) {
                Some(fc) if fc >= 1 && fc < fec_max => fc,
                _ if c == next => {
                    next = next.wrapping_add(1);
                    0
                }
                _ => 15,
            };

            if fec == 15 && v1 {
                // Strip-like sequences step the free index by one.
                if c.wrapping_add(1) == last {
                    fec = 13;
                    last = c;
                }
                if c == last.wrapping_add(1) {
                    fec = 14;
                    last = c;
                }
            }

            *code = ((fe << 4) | fec) as u8;

            if fec == 15 {
                data.write_varint(u64::from(zigzag32(c.wrapping_sub(last))))?;
                last = c;
            }

            if fec == 0 || fec >= fec_max {
                vertices.push(c);
            }

            // The matched edge a-b is already in the FIFO.
            edges.push(c, b);
            edges.push(a, c);
            rotation
        } else {
            let rotation = if tri[1] == next {
                1
            } else if tri[2] == next {
                2
            } else {
                0
            };
            let [a, b, c] = rotate(tri, rotation);

            let mut reset = false;
            if v1 && a == 0 && b == 1 && c == 2 && next > 0 {
                reset = true;
                next = 0;
                // Stale entries could otherwise be referenced after the restart.
                vertices.reset();
            }

            let fb = vertices.find(b);
            let fc = vertices.find(c);

            let fea = if a == next {
                next = next.wrapping_add(1);
                0
            } else {
                15
            };
            let feb = match fb {
                Some(fb) if fb < 14 => fb + 1,
                _ if b == next => {
                    next = next.wrapping_add(1);
                    0
                }
                _ => 15,
            };
            let fec = match fc {
                Some(fc) if fc < 14 => fc + 1,
                _ if c == next => {
                    next = next.wrapping_add(1);
                    0
                }
                _ => 15,
            };

            let code_aux = ((feb << 4) | fec) as u8;
            let table_slot = CODE_AUX_TABLE[..14].iter().position(|&e| e == code_aux);

            match table_slot {
                Some(slot) if fea == 0 && !reset => *code = 0xf0 | slot as u8,
                _ => {
                    *code = (0xf0 | 14 | fea) as u8;
                    data.write_u8(code_aux)?;
                }
            }

            for (vertex, fe) in [(a, fea), (b, feb), (c, fec)] {
                if fe == 15 {
                    data.write_varint(u64::from(zigzag32(vertex.wrapping_sub(last))))?;
                    last = vertex;
                }
            }

            vertices.push(a);
            if feb == 0 || feb == 15 {
                vertices.push(b);
            }
            if fec == 0 || fec == 15 {
                vertices.push(c);
            }

            edges.push(b, a);
            edges.push(c, b);
            edges.push(a, c);
            rotation
        };

        rotations[triangle / 4] |= (rotation as u8) << ((triangle % 4) * 2);
    }

    // The table doubles as tail padding for the decoder.
    data.write_bytes(&CODE_AUX_TABLE)?;

    let written = head + triangle_count + rotations.len() + data.position();
    tracing::debug!(
        index_count = indices.len(),
        vertex_count,
        version = version.as_u8(),
        written,
        "encoded index buffer"
    );
    Ok(written)
}

fn decode_free_index(reader: &mut ByteReader<'_>, last: u32) -> Result<u32> {
    let position = reader.position();
    let value = u32::try_from(reader.read_varint()?)
        .map_err(|_| StreamError::MalformedVarint { position })?;
    Ok(last.wrapping_add(unzigzag32(value)))
}

/// Decode `index_count` indices into a new `u32` buffer.
pub fn decode_index_buffer(encoded: &[u8], index_count: usize) -> Result<Vec<u32>> {
    let mut indices = vec![0u32; index_count];
    decode_index_buffer_into(&mut indices, encoded)?;
    Ok(indices)
}

/// Decode like [`decode_index_buffer`] and reject indices outside the vertex buffer.
pub fn decode_index_buffer_checked(
    encoded: &[u8],
    index_count: usize,
    vertex_count: usize,
) -> Result<Vec<u32>> {
    let indices = decode_index_buffer(encoded, index_count)?;
    if let Some(&index) = indices.iter().find(|&&i| i as usize >= vertex_count) {
        return Err(StreamError::IndexOutOfRange {
            index,
            vertex_count,
        }
        .into());
    }
    Ok(indices)
}

/// Decode into `destination`; its length must equal the encoded index count.
pub fn decode_index_buffer_into<T: IndexType>(destination: &mut [T], encoded: &[u8]) -> Result<()> {
    let index_count = destination.len();
    if index_count % 3 != 0 {
        return Err(Precondition::IndexCountNotTriangles(index_count).into());
    }

    let mut reader = ByteReader::new(encoded);
    let version = reader.read_header(INDEX_HEADER, IndexEncodingVersion::LATEST.as_u8())?;
    let version = IndexEncodingVersion::from_u8(version).ok_or(StreamError::UnsupportedVersion {
        newest: IndexEncodingVersion::LATEST.as_u8(),
        found: version,
    })?;

    let stored = reader.read_len()?;
    if stored != index_count {
        return Err(StreamError::CountMismatch {
            expected: index_count,
            found: stored,
        }
        .into());
    }

    let triangle_count = index_count / 3;
    if reader.remaining() < triangle_count + rotation_bytes(triangle_count) + FIFO_SIZE {
        return Err(StreamError::UnexpectedEof {
            position: encoded.len(),
        }
        .into());
    }

    let codes = reader.read_bytes(triangle_count)?;
    let rotations = reader.read_bytes(rotation_bytes(triangle_count))?;
    // Unused fields of the last rotation byte stay zero.
    if triangle_count % 4 != 0 && rotations[triangle_count / 4] >> ((triangle_count % 4) * 2) != 0 {
        return Err(StreamError::InvalidRotation {
            triangle: triangle_count,
        }
        .into());
    }
    let data_end = encoded.len() - FIFO_SIZE;
    let table: [u8; FIFO_SIZE] = encoded[data_end..]
        .try_into()
        .map_err(|_| StreamError::UnexpectedEof { position: data_end })?;
    // Table entries never name an escaped index.
    if table.iter().any(|&e| e >> 4 == 15 || e & 15 == 15) {
        return Err(StreamError::InvalidCodeTable.into());
    }
    let data_start = reader.position();
    let mut data = ByteReader::new(&encoded[data_start..data_end]);

    let mut edges = EdgeFifo::new();
    let mut vertices = VertexFifo::new();
    let mut next = 0u32;
    let mut last = 0u32;
    let fec_max = version.fec_max();

    for (triangle, (&code, out)) in codes.iter().zip(destination.chunks_exact_mut(3)).enumerate() {
        let rotation = usize::from((rotations[triangle / 4] >> ((triangle % 4) * 2)) & 3);
        if rotation == 3 {
            return Err(StreamError::InvalidRotation { triangle }.into());
        }

        let coded = if code < 0xf0 {
            let fe = usize::from(code >> 4);
            let [a, b] = edges.get(fe);

            let fec = usize::from(code & 15);
            let c = if fec < fec_max {
                let fresh = fec == 0;
                let c = if fresh { next } else { vertices.get(fec) };
                next = next.wrapping_add(u32::from(fresh));
                vertices.push_if(c, fresh);
                c
            } else {
                let c = match fec {
                    13 => last.wrapping_sub(1),
                    14 => last.wrapping_add(1),
                    _ => decode_free_index(&mut data, last)?,
                };
                last = c;
                vertices.push(c);
                c
            };

            edges.push(c, b);
            edges.push(a, c);
            [a, b, c]
        } else if code < 0xfe {
            let aux = table[usize::from(code & 15)];
            let feb = usize::from(aux >> 4);
            let fec = usize::from(aux & 15);

            let a = next;
            next = next.wrapping_add(1);

            let b = if feb == 0 { next } else { vertices.get(feb - 1) };
            next = next.wrapping_add(u32::from(feb == 0));

            let c = if fec == 0 { next } else { vertices.get(fec - 1) };
            next = next.wrapping_add(u32::from(fec == 0));

            vertices.push(a);
            vertices.push_if(b, feb == 0);
            vertices.push_if(c, fec == 0);

            edges.push(b, a);
            edges.push(c, b);
            edges.push(a, c);
            [a, b, c]
        } else {
            let aux = data.read_u8()?;
            let fea = if code == 0xfe { 0 } else { 15 };
            let feb = usize::from(aux >> 4);
            let fec = usize::from(aux & 15);

            // A zero aux byte outside the table marks a restart.
            if aux == 0 {
                next = 0;
                vertices.reset();
            }

            let mut take_next = || {
                let v = next;
                next = next.wrapping_add(1);
                v
            };

            let mut a = if fea == 0 { take_next() } else { 0 };
            let mut b = match feb {
                0 => take_next(),
                15 => 0,
                _ => vertices.get(feb - 1),
            };
            let mut c = match fec {
                0 => take_next(),
                15 => 0,
                _ => vertices.get(fec - 1),
            };

            if fea == 15 {
                a = decode_free_index(&mut data, last)?;
                last = a;
            }
            if feb == 15 {
                b = decode_free_index(&mut data, last)?;
                last = b;
            }
            if fec == 15 {
                c = decode_free_index(&mut data, last)?;
                last = c;
            }

            vertices.push(a);
            vertices.push_if(b, feb == 0 || feb == 15);
            vertices.push_if(c, fec == 0 || fec == 15);

            edges.push(b, a);
            edges.push(c, b);
            edges.push(a, c);
            [a, b, c]
        };

        for (slot, index) in out.iter_mut().zip(unrotate(coded, rotation)) {
            *slot = T::try_from_u32(index).ok_or(StreamError::IndexOutOfRange {
                index,
                vertex_count: T::CAPACITY,
            })?;
        }
    }

    if data.remaining() != 0 {
        return Err(StreamError::TrailingBytes {
            count: data.remaining(),
        }
        .into());
    }

    tracing::debug!(
        index_count,
        version = version.as_u8(),
        encoded = encoded.len(),
        "decoded index buffer"
    );
    Ok(())
}
