//! Element formats and their fixed parameters.
//!
//! Every weight or activation buffer in the engine is tagged with a
//! [`GgmlType`]. The tag determines block geometry (elements per block,
//! bytes per block), the format a matmul expects its B operand in
//! (`vec_dot_type`), and the FP32 converters used at phase boundaries.
//! Bit layouts follow the GGML catalog; F8_E4M3 is the engine's own
//! extension (one byte per element, FP32 scale per 128×128 tile stored
//! in a separate matrix).

use bytemuck::{Pod, Zeroable};
use half::{bf16, f16};
use serde::{Deserialize, Serialize};

/// Super-block granularity used to carve conversion work.
pub const QK_K: usize = 256;

/// Elements per Q8_0 / Q4_0 quantization block.
pub const QK8_0: usize = 32;
pub const QK4_0: usize = 32;

/// Column width of one FP8 scale block (one FP32 scale per 128×128 tile).
pub const FP8_BLOCK: usize = 128;

/// An 8-bit quantization block: f16 scale + 32 signed bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct BlockQ8_0 {
    pub d: f16,
    pub qs: [i8; QK8_0],
}

/// A 4-bit quantization block: f16 scale + 32 nibbles.
///
/// Element j lives in the low nibble of qs[j] for j < 16 and in the
/// high nibble of qs[j - 16] otherwise, matching the GGML layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct BlockQ4_0 {
    pub d: f16,
    pub qs: [u8; QK4_0 / 2],
}

const _: () = assert!(std::mem::size_of::<BlockQ8_0>() == 34);
const _: () = assert!(std::mem::size_of::<BlockQ4_0>() == 18);

/// Element format tags. Values follow the external catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
#[allow(non_camel_case_types)]
pub enum GgmlType {
    F32 = 0,
    F16 = 1,
    Q4_0 = 2,
    Q8_0 = 8,
    BF16 = 30,
    F8_E4M3 = 31,
}

impl GgmlType {
    pub fn from_u32(v: u32) -> Result<Self, u32> {
        match v {
            0 => Ok(GgmlType::F32),
            1 => Ok(GgmlType::F16),
            2 => Ok(GgmlType::Q4_0),
            8 => Ok(GgmlType::Q8_0),
            30 => Ok(GgmlType::BF16),
            31 => Ok(GgmlType::F8_E4M3),
            other => Err(other),
        }
    }

    /// Elements per quantization block.
    pub fn block_elems(self) -> usize {
        match self {
            GgmlType::F32 | GgmlType::F16 | GgmlType::BF16 | GgmlType::F8_E4M3 => 1,
            GgmlType::Q4_0 | GgmlType::Q8_0 => 32,
        }
    }

    /// Bytes per quantization block.
    pub fn block_bytes(self) -> usize {
        match self {
            GgmlType::F32 => 4,
            GgmlType::F16 | GgmlType::BF16 => 2,
            GgmlType::F8_E4M3 => 1,
            GgmlType::Q8_0 => std::mem::size_of::<BlockQ8_0>(),
            GgmlType::Q4_0 => std::mem::size_of::<BlockQ4_0>(),
        }
    }

    /// The format operand B must be supplied in to multiply against an
    /// A operand of this format.
    pub fn vec_dot_type(self) -> GgmlType {
        match self {
            GgmlType::F32 => GgmlType::F32,
            GgmlType::F16 => GgmlType::F16,
            GgmlType::BF16 => GgmlType::BF16,
            GgmlType::F8_E4M3 => GgmlType::BF16,
            GgmlType::Q8_0 | GgmlType::Q4_0 => GgmlType::Q8_0,
        }
    }

    /// Bytes occupied by `n` contiguous elements of this format.
    /// `n` must be a multiple of `block_elems`.
    pub fn row_bytes(self, n: usize) -> usize {
        debug_assert!(n % self.block_elems() == 0);
        n / self.block_elems() * self.block_bytes()
    }

    pub fn name(self) -> &'static str {
        match self {
            GgmlType::F32 => "f32",
            GgmlType::F16 => "f16",
            GgmlType::BF16 => "bf16",
            GgmlType::F8_E4M3 => "f8_e4m3",
            GgmlType::Q8_0 => "q8_0",
            GgmlType::Q4_0 => "q4_0",
        }
    }
}

// ── FP8 E4M3 codec ──────────────────────────────────────────────────
//
// Decoded as (-1)^s · 2^(e-7) · (1 + m/8) for every exponent, which is
// exactly what the vectorized BF16 expansion in the matmul kernel
// produces. E4M3 subnormals and NaN are not distinguished.

/// Expand one F8_E4M3 byte to BF16 bits:
/// shift the 7 exponent+mantissa bits into BF16 position and add the
/// exponent bias adjustment (127 - 7), keeping the sign in bit 15.
#[inline]
pub fn f8_e4m3_to_bf16_bits(v: u8) -> u16 {
    let v = v as u16;
    let sign = (v & 0x80) << 8;
    let e_m = (v & 0x7F) << 4;
    sign | (e_m + ((127 - 7) << 7))
}

#[inline]
pub fn f8_e4m3_to_f32(v: u8) -> f32 {
    bf16::from_bits(f8_e4m3_to_bf16_bits(v)).to_f32()
}

/// Quantize an f32 to the nearest F8_E4M3 value under the decode
/// formula above. Saturates at the format's largest magnitude.
pub fn f32_to_f8_e4m3(x: f32) -> u8 {
    let sign = if x.is_sign_negative() { 0x80u8 } else { 0 };
    let a = x.abs();
    if !a.is_finite() {
        return sign | 0x7F;
    }
    // Smallest representable magnitude is 2^-7; round-to-zero below half of it.
    if a < 2.0f32.powi(-7) * 0.5 {
        return sign;
    }
    let mut e = a.log2().floor() as i32;
    e = e.clamp(-7, 8);
    let mut m = ((a / 2.0f32.powi(e) - 1.0) * 8.0).round() as i32;
    if m >= 8 {
        e += 1;
        m = 0;
        if e > 8 {
            return sign | 0x7F; // saturate
        }
    }
    if m < 0 {
        m = 0;
    }
    sign | (((e + 7) as u8) << 3) | (m as u8)
}

// ── FP32 boundary converters ────────────────────────────────────────

/// Convert `n` elements of format `ty` at `src` into FP32 at `dst`.
///
/// # Safety
/// `src` must hold `ty.row_bytes(n)` readable bytes and `dst` must hold
/// `n` writable floats. `n` must be a multiple of `ty.block_elems()`.
pub unsafe fn to_float(ty: GgmlType, src: *const u8, dst: *mut f32, n: usize) {
    match ty {
        GgmlType::F32 => {
            std::ptr::copy_nonoverlapping(src as *const f32, dst, n);
        }
        GgmlType::F16 => {
            let s = std::slice::from_raw_parts(src as *const u16, n);
            for (i, &v) in s.iter().enumerate() {
                *dst.add(i) = f16::from_bits(v).to_f32();
            }
        }
        GgmlType::BF16 => {
            let s = std::slice::from_raw_parts(src as *const u16, n);
            for (i, &v) in s.iter().enumerate() {
                *dst.add(i) = bf16::from_bits(v).to_f32();
            }
        }
        GgmlType::F8_E4M3 => {
            let s = std::slice::from_raw_parts(src, n);
            for (i, &v) in s.iter().enumerate() {
                *dst.add(i) = f8_e4m3_to_f32(v);
            }
        }
        GgmlType::Q8_0 => {
            let blocks = std::slice::from_raw_parts(src as *const BlockQ8_0, n / QK8_0);
            for (b, blk) in blocks.iter().enumerate() {
                let d = blk.d.to_f32();
                for j in 0..QK8_0 {
                    *dst.add(b * QK8_0 + j) = blk.qs[j] as f32 * d;
                }
            }
        }
        GgmlType::Q4_0 => {
            let blocks = std::slice::from_raw_parts(src as *const BlockQ4_0, n / QK4_0);
            for (b, blk) in blocks.iter().enumerate() {
                let d = blk.d.to_f32();
                for j in 0..QK4_0 / 2 {
                    let lo = (blk.qs[j] & 0x0F) as i32 - 8;
                    let hi = (blk.qs[j] >> 4) as i32 - 8;
                    *dst.add(b * QK4_0 + j) = lo as f32 * d;
                    *dst.add(b * QK4_0 + j + QK4_0 / 2) = hi as f32 * d;
                }
            }
        }
    }
}

/// Convert `n` FP32 elements at `src` into format `ty` at `dst`.
///
/// # Safety
/// `src` must hold `n` readable floats and `dst` must hold
/// `ty.row_bytes(n)` writable bytes. `n` must be a multiple of
/// `ty.block_elems()`.
pub unsafe fn from_float(ty: GgmlType, src: *const f32, dst: *mut u8, n: usize) {
    match ty {
        GgmlType::F32 => {
            std::ptr::copy_nonoverlapping(src, dst as *mut f32, n);
        }
        GgmlType::F16 => {
            let d = std::slice::from_raw_parts_mut(dst as *mut u16, n);
            for (i, out) in d.iter_mut().enumerate() {
                *out = f16::from_f32(*src.add(i)).to_bits();
            }
        }
        GgmlType::BF16 => {
            let d = std::slice::from_raw_parts_mut(dst as *mut u16, n);
            for (i, out) in d.iter_mut().enumerate() {
                *out = bf16::from_f32(*src.add(i)).to_bits();
            }
        }
        GgmlType::F8_E4M3 => {
            let d = std::slice::from_raw_parts_mut(dst, n);
            for (i, out) in d.iter_mut().enumerate() {
                *out = f32_to_f8_e4m3(*src.add(i));
            }
        }
        GgmlType::Q8_0 => {
            let blocks = std::slice::from_raw_parts_mut(dst as *mut BlockQ8_0, n / QK8_0);
            for (b, blk) in blocks.iter_mut().enumerate() {
                let x = std::slice::from_raw_parts(src.add(b * QK8_0), QK8_0);
                let amax = x.iter().fold(0.0f32, |m, &v| m.max(v.abs()));
                let d = amax / 127.0;
                let id = if d != 0.0 { 1.0 / d } else { 0.0 };
                blk.d = f16::from_f32(d);
                for j in 0..QK8_0 {
                    blk.qs[j] = (x[j] * id).round() as i8;
                }
            }
        }
        GgmlType::Q4_0 => {
            let blocks = std::slice::from_raw_parts_mut(dst as *mut BlockQ4_0, n / QK4_0);
            for (b, blk) in blocks.iter_mut().enumerate() {
                let x = std::slice::from_raw_parts(src.add(b * QK4_0), QK4_0);
                // Scale from the signed value of largest magnitude, so the
                // extreme maps to -8.
                let mut max = 0.0f32;
                let mut amax = 0.0f32;
                for &v in x {
                    if v.abs() > amax {
                        amax = v.abs();
                        max = v;
                    }
                }
                let d = max / -8.0;
                let id = if d != 0.0 { 1.0 / d } else { 0.0 };
                blk.d = f16::from_f32(d);
                for j in 0..QK4_0 / 2 {
                    let lo = ((x[j] * id + 8.5) as i32).clamp(0, 15) as u8;
                    let hi = ((x[j + QK4_0 / 2] * id + 8.5) as i32).clamp(0, 15) as u8;
                    blk.qs[j] = lo | (hi << 4);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_geometry() {
        assert_eq!(GgmlType::F32.row_bytes(256), 1024);
        assert_eq!(GgmlType::BF16.row_bytes(256), 512);
        assert_eq!(GgmlType::F8_E4M3.row_bytes(256), 256);
        assert_eq!(GgmlType::Q8_0.row_bytes(256), 8 * 34);
        assert_eq!(GgmlType::Q4_0.row_bytes(256), 8 * 18);
    }

    #[test]
    fn test_vec_dot_mapping() {
        assert_eq!(GgmlType::F32.vec_dot_type(), GgmlType::F32);
        assert_eq!(GgmlType::BF16.vec_dot_type(), GgmlType::BF16);
        assert_eq!(GgmlType::F8_E4M3.vec_dot_type(), GgmlType::BF16);
        assert_eq!(GgmlType::Q8_0.vec_dot_type(), GgmlType::Q8_0);
        assert_eq!(GgmlType::Q4_0.vec_dot_type(), GgmlType::Q8_0);
    }

    #[test]
    fn test_bf16_round_trip_error() {
        // BF16 keeps 8 mantissa bits; relative error is bounded by 2^-8
        // on round-to-nearest, comfortably within the 2^-7 contract.
        let mut max_rel: f32 = 0.0;
        for i in 0..4096 {
            let x = ((i * 37 + 11) as f32 / 4096.0 - 0.5) * 20.0;
            if x == 0.0 {
                continue;
            }
            let y = bf16::from_f32(x).to_f32();
            max_rel = max_rel.max(((x - y) / x).abs());
        }
        eprintln!("BF16 round-trip max relative error: {max_rel:.6}");
        assert!(max_rel <= 2.0f32.powi(-7));
    }

    #[test]
    fn test_f8_expansion_formula() {
        for v in 0..=255u8 {
            let sign = if v & 0x80 != 0 { -1.0f32 } else { 1.0 };
            let e = ((v >> 3) & 0xF) as i32;
            let m = (v & 7) as f32;
            let expected = sign * 2.0f32.powi(e - 7) * (1.0 + m / 8.0);
            let got = f8_e4m3_to_f32(v);
            let rel = ((got - expected) / expected).abs();
            assert!(
                rel < 1e-2,
                "byte {v:#04x}: expected {expected}, got {got}"
            );
        }
    }

    #[test]
    fn test_f8_encode_decode() {
        // Values decodable exactly should survive the round trip.
        for e in 0..=15i32 {
            for m in 0..8i32 {
                let x = 2.0f32.powi(e - 7) * (1.0 + m as f32 / 8.0);
                let b = f32_to_f8_e4m3(x);
                let y = f8_e4m3_to_f32(b);
                let rel = ((x - y) / x).abs();
                assert!(rel < 0.01, "e={e} m={m}: {x} -> {y}");
            }
        }
        // Saturation
        assert_eq!(f32_to_f8_e4m3(1e9), 0x7F);
        assert_eq!(f32_to_f8_e4m3(-1e9), 0xFF);
    }

    #[test]
    fn test_q8_0_round_trip() {
        let n = 256;
        let src: Vec<f32> = (0..n)
            .map(|i| ((i * 7 + 3) as f32 / n as f32 - 0.5) * 4.0)
            .collect();
        let mut packed = vec![0u8; GgmlType::Q8_0.row_bytes(n)];
        let mut back = vec![0.0f32; n];
        unsafe {
            from_float(GgmlType::Q8_0, src.as_ptr(), packed.as_mut_ptr(), n);
            to_float(GgmlType::Q8_0, packed.as_ptr(), back.as_mut_ptr(), n);
        }
        let max_err = src
            .iter()
            .zip(&back)
            .fold(0.0f32, |m, (&a, &b)| m.max((a - b).abs()));
        eprintln!("Q8_0 round-trip max abs error: {max_err:.6}");
        assert!(max_err < 0.02);
    }

    #[test]
    fn test_q4_0_round_trip() {
        let n = 128;
        let src: Vec<f32> = (0..n)
            .map(|i| ((i * 11 + 5) as f32 / n as f32 - 0.5) * 2.0)
            .collect();
        let mut packed = vec![0u8; GgmlType::Q4_0.row_bytes(n)];
        let mut back = vec![0.0f32; n];
        unsafe {
            from_float(GgmlType::Q4_0, src.as_ptr(), packed.as_mut_ptr(), n);
            to_float(GgmlType::Q4_0, packed.as_ptr(), back.as_mut_ptr(), n);
        }
        let max_err = src
            .iter()
            .zip(&back)
            .fold(0.0f32, |m, (&a, &b)| m.max((a - b).abs()));
        eprintln!("Q4_0 round-trip max abs error: {max_err:.6}");
        // 4-bit symmetric quantization of range ±1: step ≈ 0.125
        assert!(max_err < 0.1);
    }

    #[test]
    fn test_f16_f32_identity_paths() {
        let n = 64;
        let src: Vec<f32> = (0..n).map(|i| i as f32 * 0.25 - 8.0).collect();
        let mut half_buf = vec![0u8; GgmlType::F16.row_bytes(n)];
        let mut back = vec![0.0f32; n];
        unsafe {
            from_float(GgmlType::F16, src.as_ptr(), half_buf.as_mut_ptr(), n);
            to_float(GgmlType::F16, half_buf.as_ptr(), back.as_mut_ptr(), n);
        }
        // These values are exactly representable in f16.
        assert_eq!(src, back);
    }
}
