//! Block-quantized matmul kernels: Q8_0×Q8_0 and Q4_0×Q8_0.
//!
//! Both operands are 32-element blocks with an f16 scale. The inner
//! product is an 8-bit integer dot per block pair scaled by the
//! product of the two block scales. `k`, `lda`, `ldb` are counted in
//! blocks. Tile shapes prefer 3×2, falling through to 2×2, 2×1, 1×2,
//! 1×1.

use crate::ggml::{BlockQ4_0, BlockQ8_0, QK8_0};

use super::floats::duty_range;

fn pick_tile_q(mr: usize, nr: usize) -> (usize, usize) {
    match (mr.min(3), nr.min(2)) {
        (3, 2) => (3, 2),
        (2, 2) => (2, 2),
        (m, 1) if m >= 2 => (2, 1),
        (1, 2) => (1, 2),
        _ => (1, 1),
    }
}

/// Unpack a Q4_0 block to 32 signed values in element order.
#[inline]
fn unpack_q4(blk: &BlockQ4_0) -> [i32; QK8_0] {
    let mut out = [0i32; QK8_0];
    for j in 0..QK8_0 / 2 {
        out[j] = (blk.qs[j] & 0x0F) as i32 - 8;
        out[j + QK8_0 / 2] = (blk.qs[j] >> 4) as i32 - 8;
    }
    out
}

// ── Scalar reference path ───────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
unsafe fn gemm_q8_q8_scalar(
    m: usize,
    n: usize,
    k: usize,
    a: *const BlockQ8_0,
    lda: usize,
    b: *const BlockQ8_0,
    ldb: usize,
    c: *mut f32,
    ldc: usize,
    ith: usize,
    nth: usize,
) {
    let (start, end) = duty_range(m, ith, nth);
    for i in start..end {
        for j in 0..n {
            let mut acc = 0.0f32;
            for l in 0..k {
                let ba = &*a.add(i * lda + l);
                let bb = &*b.add(j * ldb + l);
                let mut dot = 0i32;
                for e in 0..QK8_0 {
                    dot += ba.qs[e] as i32 * bb.qs[e] as i32;
                }
                acc += dot as f32 * (ba.d.to_f32() * bb.d.to_f32());
            }
            *c.add(j * ldc + i) = acc;
        }
    }
}

#[allow(clippy::too_many_arguments)]
unsafe fn gemm_q4_q8_scalar(
    m: usize,
    n: usize,
    k: usize,
    a: *const BlockQ4_0,
    lda: usize,
    b: *const BlockQ8_0,
    ldb: usize,
    c: *mut f32,
    ldc: usize,
    ith: usize,
    nth: usize,
) {
    let (start, end) = duty_range(m, ith, nth);
    for i in start..end {
        for j in 0..n {
            let mut acc = 0.0f32;
            for l in 0..k {
                let ba = &*a.add(i * lda + l);
                let bb = &*b.add(j * ldb + l);
                let qa = unpack_q4(ba);
                let mut dot = 0i32;
                for e in 0..QK8_0 {
                    dot += qa[e] * bb.qs[e] as i32;
                }
                acc += dot as f32 * (ba.d.to_f32() * bb.d.to_f32());
            }
            *c.add(j * ldc + i) = acc;
        }
    }
}

// ── AVX2 production path ────────────────────────────────────────────

#[cfg(target_arch = "x86_64")]
mod avx2 {
    use super::*;
    use std::arch::x86_64::*;

    #[target_feature(enable = "avx2,fma,f16c")]
    #[inline]
    unsafe fn hsum(x: __m256) -> f32 {
        let lo = _mm256_castps256_ps128(x);
        let hi = _mm256_extractf128_ps(x, 1);
        let mut s = _mm_add_ps(lo, hi);
        s = _mm_add_ps(s, _mm_movehl_ps(s, s));
        s = _mm_add_ss(s, _mm_movehdup_ps(s));
        _mm_cvtss_f32(s)
    }

    /// Integer dot of 32 byte pairs: `u` is made non-negative, `s`
    /// carries the sign, maddubs multiplies u8×i8 pairs.
    #[target_feature(enable = "avx2,fma,f16c")]
    #[inline]
    unsafe fn updot(u: __m256i, s: __m256i) -> __m256 {
        let d16 = _mm256_maddubs_epi16(u, s);
        let d32 = _mm256_madd_epi16(_mm256_set1_epi16(1), d16);
        _mm256_cvtepi32_ps(d32)
    }

    #[target_feature(enable = "avx2,fma,f16c")]
    #[inline]
    unsafe fn load_q8(blk: *const BlockQ8_0) -> __m256i {
        _mm256_loadu_si256((*blk).qs.as_ptr() as *const __m256i)
    }

    /// Low nibbles are elements 0..16, high nibbles 16..32.
    #[target_feature(enable = "avx2,fma,f16c")]
    #[inline]
    unsafe fn load_q4(blk: *const BlockQ4_0) -> __m256i {
        let x = _mm_loadu_si128((*blk).qs.as_ptr() as *const __m128i);
        let both = _mm256_insertf128_si256(_mm256_castsi128_si256(x), _mm_srli_epi16(x, 4), 1);
        _mm256_sub_epi8(_mm256_and_si256(_mm256_set1_epi8(15), both), _mm256_set1_epi8(8))
    }

    macro_rules! q0_walker {
        ($mnpack:ident, $entry:ident, $ta:ty, $load_a:ident) => {
            #[target_feature(enable = "avx2,fma,f16c")]
            #[allow(clippy::too_many_arguments)]
            pub unsafe fn $entry(
                m: usize,
                n: usize,
                k: usize,
                a: *const $ta,
                lda: usize,
                b: *const BlockQ8_0,
                ldb: usize,
                c: *mut f32,
                ldc: usize,
                ith: usize,
                nth: usize,
            ) {
                $mnpack(a, lda, b, ldb, c, ldc, k, ith, nth, 0, m, 0, n);
            }

            #[target_feature(enable = "avx2,fma,f16c")]
            #[allow(clippy::too_many_arguments)]
            unsafe fn $mnpack(
                a: *const $ta,
                lda: usize,
                b: *const BlockQ8_0,
                ldb: usize,
                c: *mut f32,
                ldc: usize,
                k: usize,
                ith: usize,
                nth: usize,
                m0: usize,
                m: usize,
                n0: usize,
                n: usize,
            ) {
                if m0 >= m || n0 >= n {
                    return;
                }
                let (mc, nc) = pick_tile_q(m - m0, n - n0);

                let ytiles = (m - m0) / mc;
                let xtiles = (n - n0) / nc;
                let tiles = ytiles * xtiles;
                let (start, end) = duty_range(tiles, ith, nth);
                for job in start..end {
                    let ii = m0 + job / xtiles * mc;
                    let jj = n0 + job % xtiles * nc;
                    let mut cv = [[_mm256_setzero_ps(); 3]; 2];
                    for l in 0..k {
                        for j in 0..nc {
                            let bb = b.add((jj + j) * ldb + l);
                            let bq = load_q8(bb);
                            let bd = (*bb).d.to_f32();
                            for i in 0..mc {
                                let ba = a.add((ii + i) * lda + l);
                                let aq = $load_a(ba);
                                let scale = _mm256_set1_ps((*ba).d.to_f32() * bd);
                                let dot = updot(
                                    _mm256_sign_epi8(aq, aq),
                                    _mm256_sign_epi8(bq, aq),
                                );
                                cv[j][i] = _mm256_fmadd_ps(scale, dot, cv[j][i]);
                            }
                        }
                    }
                    for j in 0..nc {
                        for i in 0..mc {
                            *c.add((jj + j) * ldc + ii + i) = hsum(cv[j][i]);
                        }
                    }
                }

                let mp = m0 + (m - m0) / mc * mc;
                let np = n0 + (n - n0) / nc * nc;
                $mnpack(a, lda, b, ldb, c, ldc, k, ith, nth, mp, m, n0, np);
                $mnpack(a, lda, b, ldb, c, ldc, k, ith, nth, m0, m, np, n);
            }
        };
    }

    q0_walker!(mnpack_q8, gemm_q8_q8, BlockQ8_0, load_q8);
    q0_walker!(mnpack_q4, gemm_q4_q8, BlockQ4_0, load_q4);
}

// ── Public entries ──────────────────────────────────────────────────

/// # Safety
/// `a`/`b` must hold `m`/`n` rows of `k` blocks at strides
/// `lda`/`ldb`; `c` must hold an `m × n` column-major matrix.
#[allow(clippy::too_many_arguments)]
pub unsafe fn gemm_q8_q8(
    m: usize,
    n: usize,
    k: usize,
    a: *const u8,
    lda: usize,
    b: *const u8,
    ldb: usize,
    c: *mut f32,
    ldc: usize,
    ith: usize,
    nth: usize,
) {
    let a = a as *const BlockQ8_0;
    let b = b as *const BlockQ8_0;
    #[cfg(target_arch = "x86_64")]
    if super::simd_available() {
        return avx2::gemm_q8_q8(m, n, k, a, lda, b, ldb, c, ldc, ith, nth);
    }
    gemm_q8_q8_scalar(m, n, k, a, lda, b, ldb, c, ldc, ith, nth);
}

/// # Safety
/// As `gemm_q8_q8`, with `a` holding Q4_0 blocks.
#[allow(clippy::too_many_arguments)]
pub unsafe fn gemm_q4_q8(
    m: usize,
    n: usize,
    k: usize,
    a: *const u8,
    lda: usize,
    b: *const u8,
    ldb: usize,
    c: *mut f32,
    ldc: usize,
    ith: usize,
    nth: usize,
) {
    let a = a as *const BlockQ4_0;
    let b = b as *const BlockQ8_0;
    #[cfg(target_arch = "x86_64")]
    if super::simd_available() {
        return avx2::gemm_q4_q8(m, n, k, a, lda, b, ldb, c, ldc, ith, nth);
    }
    gemm_q4_q8_scalar(m, n, k, a, lda, b, ldb, c, ldc, ith, nth);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ggml::{from_float, to_float, GgmlType};

    fn synth(len: usize, seed: usize) -> Vec<f32> {
        (0..len)
            .map(|i| ((i * 11 + seed * 29 + 5) % 89) as f32 / 89.0 - 0.5)
            .collect()
    }

    fn quantize(ty: GgmlType, src: &[f32]) -> Vec<u8> {
        let mut out = vec![0u8; ty.row_bytes(src.len())];
        unsafe { from_float(ty, src.as_ptr(), out.as_mut_ptr(), src.len()) };
        out
    }

    fn dequantize(ty: GgmlType, src: &[u8], n: usize) -> Vec<f32> {
        let mut out = vec![0.0f32; n];
        unsafe { to_float(ty, src.as_ptr(), out.as_mut_ptr(), n) };
        out
    }

    fn naive(m: usize, n: usize, k: usize, a: &[f32], b: &[f32]) -> Vec<f32> {
        let mut c = vec![0.0f32; m * n];
        for i in 0..m {
            for j in 0..n {
                let mut acc = 0.0f64;
                for l in 0..k {
                    acc += a[i * k + l] as f64 * b[j * k + l] as f64;
                }
                c[j * m + i] = acc as f32;
            }
        }
        c
    }

    #[test]
    fn test_q8_q8_matches_dequantized_reference() {
        let (m, n, k) = (7, 3, 128);
        let kb = k / QK8_0;
        let af = synth(m * k, 1);
        let bf = synth(n * k, 2);
        let aq = quantize(GgmlType::Q8_0, &af);
        let bq = quantize(GgmlType::Q8_0, &bf);
        let want = naive(
            m, n, k,
            &dequantize(GgmlType::Q8_0, &aq, m * k),
            &dequantize(GgmlType::Q8_0, &bq, n * k),
        );
        let mut c = vec![0.0f32; m * n];
        unsafe {
            gemm_q8_q8(m, n, kb, aq.as_ptr(), kb, bq.as_ptr(), kb, c.as_mut_ptr(), m, 0, 1);
        }
        let mut max_err: f32 = 0.0;
        for i in 0..m * n {
            max_err = max_err.max((c[i] - want[i]).abs());
        }
        eprintln!("Q8_0×Q8_0 vs dequantized reference: max abs {max_err:.6}");
        assert!(max_err < 1e-2);
    }

    #[test]
    fn test_q4_q8_matches_dequantized_reference() {
        let (m, n, k) = (5, 4, 96);
        let kb = k / QK8_0;
        let af = synth(m * k, 3);
        let bf = synth(n * k, 4);
        let aq = quantize(GgmlType::Q4_0, &af);
        let bq = quantize(GgmlType::Q8_0, &bf);
        let want = naive(
            m, n, k,
            &dequantize(GgmlType::Q4_0, &aq, m * k),
            &dequantize(GgmlType::Q8_0, &bq, n * k),
        );
        let mut c = vec![0.0f32; m * n];
        unsafe {
            gemm_q4_q8(m, n, kb, aq.as_ptr(), kb, bq.as_ptr(), kb, c.as_mut_ptr(), m, 0, 1);
        }
        let mut max_err: f32 = 0.0;
        for i in 0..m * n {
            max_err = max_err.max((c[i] - want[i]).abs());
        }
        eprintln!("Q4_0×Q8_0 vs dequantized reference: max abs {max_err:.6}");
        assert!(max_err < 2e-2);
    }

    #[test]
    fn test_q8_slicing_is_identical() {
        let (m, n, k) = (9, 5, 64);
        let kb = k / QK8_0;
        let aq = quantize(GgmlType::Q8_0, &synth(m * k, 5));
        let bq = quantize(GgmlType::Q8_0, &synth(n * k, 6));
        let mut c1 = vec![0.0f32; m * n];
        let mut c4 = vec![f32::NAN; m * n];
        unsafe {
            gemm_q8_q8(m, n, kb, aq.as_ptr(), kb, bq.as_ptr(), kb, c1.as_mut_ptr(), m, 0, 1);
            for ith in 0..4 {
                gemm_q8_q8(m, n, kb, aq.as_ptr(), kb, bq.as_ptr(), kb, c4.as_mut_ptr(), m, ith, 4);
            }
        }
        assert_eq!(c1, c4);
    }
}
