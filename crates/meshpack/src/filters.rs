//! Post-decode filters that expand quantized normals and rotations.
//!
//! Filters run in place over decoded vertex records. Octahedral normals are
//! stored as four signed 8 or 16 bit lanes `(u, v, one, w)`; quaternions as
//! four signed 16 bit lanes, three components plus a lane carrying the scale
//! and the index of the dropped component. Lanes are little-endian.
//!
//! Decoders accept every bit pattern: there is no early exit and no data
//! dependent loop, lengths are clamped away from zero, and float to integer
//! conversions saturate.

use glam::{Vec3, Vec4};

use crate::error::{Precondition, Result};

const QUAT_STRIDE: usize = 8;

/// A signed lane type normalized to `[-1, 1]`.
trait SnormLane {
    const SIZE: usize;
    const BITS: u32;

    fn read(bytes: &[u8]) -> f32;
    fn write(bytes: &mut [u8], value: f32);

    /// Largest positive value of the lane.
    fn scale() -> f32 {
        ((1i32 << (Self::BITS - 1)) - 1) as f32
    }
}

impl SnormLane for i8 {
    const SIZE: usize = 1;
    const BITS: u32 = 8;

    fn read(bytes: &[u8]) -> f32 {
        f32::from(bytes[0] as i8)
    }

    fn write(bytes: &mut [u8], value: f32) {
        bytes[0] = value.round() as i8 as u8;
    }
}

impl SnormLane for i16 {
    const SIZE: usize = 2;
    const BITS: u32 = 16;

    fn read(bytes: &[u8]) -> f32 {
        f32::from(i16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn write(bytes: &mut [u8], value: f32) {
        bytes[..2].copy_from_slice(&(value.round() as i16).to_le_bytes());
    }
}

fn check_len(len: usize, count: usize, stride: usize) -> Result<()> {
    let expected = count * stride;
    if len != expected {
        return Err(Precondition::BufferSizeMismatch {
            expected,
            actual: len,
        }
        .into());
    }
    Ok(())
}

/// Expand octahedral normals in place.
///
/// `stride` is 4 for 8-bit lanes or 8 for 16-bit lanes. The third lane holds
/// the quantized value of 1.0 used during encoding; the fourth lane is left
/// untouched.
pub fn decode_filter_oct(data: &mut [u8], count: usize, stride: usize) -> Result<()> {
    check_len(data.len(), count, stride)?;
    match stride {
        4 => decode_oct::<i8>(data),
        8 => decode_oct::<i16>(data),
        _ => return Err(Precondition::InvalidStride(stride).into()),
    }
    tracing::debug!(count, stride, "decoded octahedral filter");
    Ok(())
}

fn decode_oct<T: SnormLane>(data: &mut [u8]) {
    let max = T::scale();
    for record in data.chunks_exact_mut(T::SIZE * 4) {
        let x = T::read(&record[0..]);
        let y = T::read(&record[T::SIZE..]);
        let z = T::read(&record[T::SIZE * 2..]) - x.abs() - y.abs();

        // Fold the lower hemisphere back onto the octahedron.
        let t = z.min(0.0);
        let x = x + if x >= 0.0 { t } else { -t };
        let y = y + if y >= 0.0 { t } else { -t };

        let n = Vec3::new(x, y, z);
        let n = n * (max / n.length().max(1.0));

        T::write(&mut record[0..], n.x);
        T::write(&mut record[T::SIZE..], n.y);
        T::write(&mut record[T::SIZE * 2..], n.z);
    }
}

/// Expand quaternions in place. `stride` must be 8.
///
/// Output is a unit quaternion scaled to the `i16` range in `(x, y, z, w)`
/// order.
pub fn decode_filter_quat(data: &mut [u8], count: usize, stride: usize) -> Result<()> {
    if stride != QUAT_STRIDE {
        return Err(Precondition::InvalidStride(stride).into());
    }
    check_len(data.len(), count, stride)?;

    let scale = std::f32::consts::FRAC_1_SQRT_2;
    for record in data.chunks_exact_mut(QUAT_STRIDE) {
        let last = i16::from_le_bytes([record[6], record[7]]);

        // Bits above the component index carry the quantization scale.
        let sf = i32::from(last) | 3;
        let ss = scale / sf as f32;

        let x = i16::read(&record[0..]) * ss;
        let y = i16::read(&record[2..]) * ss;
        let z = i16::read(&record[4..]) * ss;
        let w = (1.0 - x * x - y * y - z * z).max(0.0).sqrt();

        let qc = (last & 3) as usize;
        let max = i16::scale();
        let mut out = [0.0f32; 4];
        out[(qc + 1) & 3] = x * max;
        out[(qc + 2) & 3] = y * max;
        out[(qc + 3) & 3] = z * max;
        out[qc] = w * max;

        for (lane, value) in record.chunks_exact_mut(2).zip(out) {
            i16::write(lane, value);
        }
    }

    tracing::debug!(count, "decoded quaternion filter");
    Ok(())
}

/// Quantize `v` in `[-1, 1]` to a signed integer with `bits` bits.
///
/// `bits` is clamped to `1..=32`; one bit leaves only zero.
#[must_use]
pub fn quantize_snorm(v: f32, bits: u32) -> i32 {
    let bits = bits.clamp(1, 32);
    let scale = ((1i64 << (bits - 1)) - 1) as f32;
    (v.clamp(-1.0, 1.0) * scale).round() as i32
}

/// Encode unit vectors (`xyz`, plus a `w` in `[-1, 1]` kept as a plain snorm)
/// into octahedral records of `stride` bytes.
///
/// `bits` is the precision of the octahedral coordinates, between 2 and the
/// lane width.
pub fn encode_filter_oct(
    destination: &mut [u8],
    stride: usize,
    bits: u32,
    data: &[[f32; 4]],
) -> Result<()> {
    let lane_bits = match stride {
        4 | 8 => stride as u32 * 2,
        _ => return Err(Precondition::InvalidStride(stride).into()),
    };
    if !(2..=lane_bits).contains(&bits) {
        return Err(Precondition::InvalidBits(bits).into());
    }
    check_len(destination.len(), data.len(), stride)?;

    let lane = stride / 4;
    for (record, n) in destination.chunks_exact_mut(stride).zip(data) {
        let n = Vec4::from_array(*n);
        let l1 = n.x.abs() + n.y.abs() + n.z.abs();
        let s = if l1 == 0.0 { 0.0 } else { 1.0 / l1 };
        let (nx, ny) = (n.x * s, n.y * s);

        let (u, v) = if n.z >= 0.0 {
            (nx, ny)
        } else {
            (
                (1.0 - ny.abs()).copysign(nx),
                (1.0 - nx.abs()).copysign(ny),
            )
        };

        let lanes = [
            quantize_snorm(u, bits),
            quantize_snorm(v, bits),
            quantize_snorm(1.0, bits),
            quantize_snorm(n.w, lane_bits),
        ];
        for (out, value) in record.chunks_exact_mut(lane).zip(lanes) {
            if lane == 1 {
                out[0] = value as i8 as u8;
            } else {
                out.copy_from_slice(&(value as i16).to_le_bytes());
            }
        }
    }

    tracing::debug!(count = data.len(), stride, bits, "encoded octahedral filter");
    Ok(())
}

/// Encode unit quaternions `(x, y, z, w)` into 8-byte records.
///
/// The largest component is dropped and reconstructed on decode; `bits` is
/// the precision of the remaining three, between 4 and 16.
pub fn encode_filter_quat(destination: &mut [u8], bits: u32, data: &[[f32; 4]]) -> Result<()> {
    if !(4..=16).contains(&bits) {
        return Err(Precondition::InvalidBits(bits).into());
    }
    check_len(destination.len(), data.len(), QUAT_STRIDE)?;

    let scaler = std::f32::consts::SQRT_2;
    for (record, q) in destination.chunks_exact_mut(QUAT_STRIDE).zip(data) {
        let q = Vec4::from_array(*q);
        let magnitudes = q.abs();

        let mut qc = 0;
        for i in 1..4 {
            if magnitudes[i] > magnitudes[qc] {
                qc = i;
            }
        }

        // q and -q are the same rotation, so the dropped component is
        // always reconstructed as positive.
        let sign = if q[qc] < 0.0 { -1.0 } else { 1.0 };

        let lanes = [
            quantize_snorm(q[(qc + 1) & 3] * scaler * sign, bits),
            quantize_snorm(q[(qc + 2) & 3] * scaler * sign, bits),
            quantize_snorm(q[(qc + 3) & 3] * scaler * sign, bits),
            (quantize_snorm(1.0, bits) & !3) | qc as i32,
        ];
        for (out, value) in record.chunks_exact_mut(2).zip(lanes) {
            out.copy_from_slice(&(value as i16).to_le_bytes());
        }
    }

    tracing::debug!(count = data.len(), bits, "encoded quaternion filter");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn i16_lanes(record: &[u8]) -> [i16; 4] {
        let mut lanes = [0; 4];
        for (lane, bytes) in lanes.iter_mut().zip(record.chunks_exact(2)) {
            *lane = i16::from_le_bytes([bytes[0], bytes[1]]);
        }
        lanes
    }

    fn normalize(v: [f32; 3]) -> [f32; 4] {
        let n = Vec3::from_array(v).normalize();
        [n.x, n.y, n.z, 0.0]
    }

    #[test]
    fn oct8_axis_vectors() {
        let normals = [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, -1.0, 0.0],
        ];
        let mut data = vec![0u8; 16];
        encode_filter_oct(&mut data, 4, 8, &normals).unwrap();
        decode_filter_oct(&mut data, 4, 4).unwrap();

        let lanes: Vec<i8> = data.iter().map(|&b| b as i8).collect();
        assert_eq!(&lanes[0..3], &[127, 0, 0]);
        assert_eq!(&lanes[4..7], &[0, 127, 0]);
        assert_eq!(&lanes[8..11], &[0, 0, 127]);
        assert_eq!(&lanes[12..15], &[0, 0, -127]);
    }

    #[test]
    fn oct16_roundtrip_is_close() {
        let normals = [
            normalize([1.0, 2.0, 3.0]),
            normalize([-0.3, 0.8, -0.5]),
            normalize([0.0, -1.0, -0.01]),
        ];
        let mut data = vec![0u8; 24];
        encode_filter_oct(&mut data, 8, 16, &normals).unwrap();
        decode_filter_oct(&mut data, 3, 8).unwrap();

        for (record, n) in data.chunks_exact(8).zip(&normals) {
            let lanes = i16_lanes(record);
            for axis in 0..3 {
                let decoded = f32::from(lanes[axis]) / 32767.0;
                assert!((decoded - n[axis]).abs() < 1e-3, "{decoded} vs {}", n[axis]);
            }
        }
    }

    #[test]
    fn oct_keeps_w_lane() {
        let mut data = vec![0u8; 8];
        encode_filter_oct(&mut data, 8, 12, &[[0.0, 0.0, 1.0, -1.0]]).unwrap();
        decode_filter_oct(&mut data, 1, 8).unwrap();
        assert_eq!(i16_lanes(&data)[3], -32767);
    }

    #[test]
    fn oct_all_zero_is_defined() {
        let mut data = vec![0u8; 16];
        decode_filter_oct(&mut data, 4, 4).unwrap();
        assert!(data.iter().all(|&b| b == 0));
    }

    #[test]
    fn quat_roundtrip_is_close() {
        let half = std::f32::consts::FRAC_1_SQRT_2;
        let quats = [
            [0.0, 0.0, 0.0, 1.0],
            [half, 0.0, 0.0, half],
            [-0.5, 0.5, -0.5, 0.5],
            [0.1, -0.9, 0.3, -0.3],
        ];
        let mut data = vec![0u8; 32];
        encode_filter_quat(&mut data, 12, &quats).unwrap();
        decode_filter_quat(&mut data, 4, 8).unwrap();

        for (record, q) in data.chunks_exact(8).zip(&quats) {
            let q = Vec4::from_array(*q).normalize();
            let lanes = i16_lanes(record);
            let d = Vec4::from_array(lanes.map(|v| f32::from(v) / 32767.0));
            // q and -q encode the same rotation.
            assert!(d.dot(q).abs() > 0.999, "{d} vs {q}");
        }
    }

    #[test]
    fn quat_all_zero_is_identity() {
        let mut data = vec![0u8; 8];
        decode_filter_quat(&mut data, 1, 8).unwrap();
        assert_eq!(i16_lanes(&data), [32767, 0, 0, 0]);
    }

    #[test]
    fn rejects_bad_parameters() {
        let mut data = vec![0u8; 12];
        assert_eq!(
            decode_filter_oct(&mut data, 2, 6).unwrap_err(),
            Precondition::InvalidStride(6).into()
        );
        assert_eq!(
            decode_filter_oct(&mut data, 2, 4).unwrap_err(),
            Precondition::BufferSizeMismatch {
                expected: 8,
                actual: 12
            }
            .into()
        );
        assert!(decode_filter_quat(&mut data, 3, 4).is_err());

        let mut dest = vec![0u8; 8];
        assert_eq!(
            encode_filter_oct(&mut dest, 4, 9, &[[0.0; 4]; 2]).unwrap_err(),
            Precondition::InvalidBits(9).into()
        );
        assert_eq!(
            encode_filter_quat(&mut dest, 3, &[[0.0; 4]]).unwrap_err(),
            Precondition::InvalidBits(3).into()
        );
    }

    #[test]
    fn quantize_matches_rounding() {
        assert_eq!(quantize_snorm(1.0, 8), 127);
        assert_eq!(quantize_snorm(-1.0, 8), -127);
        assert_eq!(quantize_snorm(0.5, 8), 64);
        assert_eq!(quantize_snorm(2.0, 10), 511);
        assert_eq!(quantize_snorm(0.5, 0), 0);
        assert_eq!(quantize_snorm(0.5, 1), 0);
        assert_eq!(quantize_snorm(-1.0, 16), -32767);
        assert_eq!(quantize_snorm(1.0, 200), i32::MAX);
    }

    proptest! {
        #[test]
        fn oct8_decodes_any_bits(data in prop::collection::vec(any::<u8>(), 64)) {
            let mut data = data;
            decode_filter_oct(&mut data, 16, 4).unwrap();
        }

        #[test]
        fn oct16_decodes_any_bits(data in prop::collection::vec(any::<u8>(), 64)) {
            let mut data = data;
            let before = data.clone();
            decode_filter_oct(&mut data, 8, 8).unwrap();
            for (after, before) in data.chunks_exact(8).zip(before.chunks_exact(8)) {
                prop_assert_eq!(&after[6..], &before[6..]);
            }
        }

        #[test]
        fn quat_decodes_any_bits(data in prop::collection::vec(any::<u8>(), 64)) {
            let mut data = data;
            decode_filter_quat(&mut data, 8, 8).unwrap();
        }
    }
}
