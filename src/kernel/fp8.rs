//! Scale-aware F8_E4M3 × BF16 matmul.
//!
//! A holds one byte per element; every 128×128 tile of A has one FP32
//! scale in a separate row-major grid. `scales` points at the grid row
//! covering A's first row and `bias_m` is A's global row offset, so a
//! caller may hand in any row slab as long as the slab's scale row is
//! supplied. The row walker splits `m` into segments that never cross
//! a 128-row scale boundary; each 128-column partial sum is multiplied
//! by its block scale before joining the accumulator.
//!
//! F8 bytes expand to BF16 in-register: shift the 7 exponent+mantissa
//! bits into BF16 position and add the (127 - 7) exponent bias.
//!
//! When `n == 1` the tile walker is replaced by a row-strided GEMV
//! over row tiles of 10, 2, then 1.

use crate::ggml::{f8_e4m3_to_f32, FP8_BLOCK};

use super::floats::duty_range;

/// # Safety
/// `a` must hold `m` rows of `k` F8 bytes at stride `lda`; `b` must
/// hold `n` rows of `k` BF16 values at stride `ldb`; `c` must hold an
/// `m × n` column-major FP32 matrix; `scales` must cover the slab's
/// scale rows with `lda / 128` columns each. `k % 128 == 0`.
#[allow(clippy::too_many_arguments)]
pub unsafe fn gemm(
    m: usize,
    n: usize,
    k: usize,
    a: *const u8,
    lda: usize,
    b: *const u16,
    ldb: usize,
    c: *mut f32,
    ldc: usize,
    ith: usize,
    nth: usize,
    scales: *const f32,
    bias_m: usize,
) {
    if m == 0 || n == 0 {
        return;
    }
    // Segments of rows that stay inside one 128-row scale block.
    let mut l = 0;
    while l < m {
        let r = (((l + bias_m) / FP8_BLOCK + 1) * FP8_BLOCK - bias_m).min(m);
        #[cfg(target_arch = "x86_64")]
        if super::simd_available() {
            avx2::mnpack(a, lda, b, ldb, c, ldc, k, ith, nth, scales, bias_m, l, r, 0, n);
            l = r;
            continue;
        }
        scalar_segment(a, lda, b, ldb, c, ldc, k, ith, nth, scales, bias_m, l, r, n);
        l = r;
    }
}

#[allow(clippy::too_many_arguments)]
unsafe fn scalar_segment(
    a: *const u8,
    lda: usize,
    b: *const u16,
    ldb: usize,
    c: *mut f32,
    ldc: usize,
    k: usize,
    ith: usize,
    nth: usize,
    scales: *const f32,
    bias_m: usize,
    m0: usize,
    m: usize,
    n: usize,
) {
    let lbo = bias_m % FP8_BLOCK;
    let srow_stride = lda / FP8_BLOCK;
    let (start, end) = duty_range(m - m0, ith, nth);
    for i in (m0 + start)..(m0 + end) {
        let srow = (i + lbo) / FP8_BLOCK;
        for j in 0..n {
            let mut acc = 0.0f32;
            for blk in (0..k).step_by(FP8_BLOCK) {
                let scale = *scales.add(srow * srow_stride + blk / FP8_BLOCK);
                let mut blksum = 0.0f32;
                for e in 0..FP8_BLOCK {
                    let av = f8_e4m3_to_f32(*a.add(i * lda + blk + e));
                    let bv = f32::from_bits((*b.add(j * ldb + blk + e) as u32) << 16);
                    blksum += av * bv;
                }
                acc += blksum * scale;
            }
            *c.add(j * ldc + i) = acc;
        }
    }
}

#[cfg(target_arch = "x86_64")]
mod avx2 {
    use super::{duty_range, FP8_BLOCK};
    use crate::kernel::floats::pick_tile;
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

    /// Expand 8 F8 bytes to f32 through the BF16 bit rewrite.
    #[target_feature(enable = "avx2,fma,f16c")]
    #[inline]
    unsafe fn load8_f8(p: *const u8) -> __m256 {
        let raw = _mm_loadl_epi64(p as *const __m128i);
        let v16 = _mm_cvtepu8_epi16(raw);
        let sign = _mm_slli_epi16(_mm_and_si128(v16, _mm_set1_epi16(0x80)), 8);
        let e_m = _mm_slli_epi16(_mm_and_si128(v16, _mm_set1_epi16(0x7F)), 4);
        let bf16 = _mm_or_si128(sign, _mm_add_epi16(e_m, _mm_set1_epi16((127 - 7) << 7)));
        _mm256_castsi256_ps(_mm256_slli_epi32(_mm256_cvtepu16_epi32(bf16), 16))
    }

    #[target_feature(enable = "avx2,fma,f16c")]
    #[inline]
    unsafe fn load8_bf16(p: *const u16) -> __m256 {
        _mm256_castsi256_ps(_mm256_slli_epi32(
            _mm256_cvtepu16_epi32(_mm_loadu_si128(p as *const __m128i)),
            16,
        ))
    }

    #[target_feature(enable = "avx2,fma,f16c")]
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn mnpack(
        a: *const u8,
        lda: usize,
        b: *const u16,
        ldb: usize,
        c: *mut f32,
        ldc: usize,
        k: usize,
        ith: usize,
        nth: usize,
        scales: *const f32,
        bias_m: usize,
        m0: usize,
        m: usize,
        n0: usize,
        n: usize,
    ) {
        if m0 >= m || n0 >= n {
            return;
        }

        let (mc, nc);
        if n - n0 == 1 {
            mc = match m - m0 {
                x if x >= 10 => 10,
                x if x >= 2 => 2,
                _ => 1,
            };
            nc = 1;
            gemv(a, lda, b, ldb, c, ldc, k, scales, bias_m, mc, m0, m, n0);
        } else {
            let (tm, tn) = pick_tile(m - m0, n - n0);
            mc = tm;
            nc = tn;
            gemm_tiles(
                a, lda, b, ldb, c, ldc, k, ith, nth, scales, bias_m, mc, nc, m0, m, n0, n,
            );
        }

        let mp = m0 + (m - m0) / mc * mc;
        let np = n0 + (n - n0) / nc * nc;
        mnpack(a, lda, b, ldb, c, ldc, k, ith, nth, scales, bias_m, mp, m, n0, np);
        mnpack(a, lda, b, ldb, c, ldc, k, ith, nth, scales, bias_m, m0, m, np, n);
    }

    /// Row-strided single-column walk; each 128-column chunk is reduced
    /// then folded in with its block scale.
    #[target_feature(enable = "avx2,fma,f16c")]
    #[allow(clippy::too_many_arguments)]
    unsafe fn gemv(
        a: *const u8,
        lda: usize,
        b: *const u16,
        ldb: usize,
        c: *mut f32,
        ldc: usize,
        k: usize,
        scales: *const f32,
        bias_m: usize,
        tilesz: usize,
        m0: usize,
        m: usize,
        n0: usize,
    ) {
        let lbo = bias_m % FP8_BLOCK;
        let srow_stride = lda / FP8_BLOCK;
        let mut ii = m0;
        while ii + tilesz - 1 < m {
            for i in 0..tilesz {
                let row = ii + i;
                let srow = (row + lbo) / FP8_BLOCK;
                let mut cv = _mm256_setzero_ps();
                let mut ll = 0;
                while ll < k {
                    let scale =
                        _mm256_set1_ps(*scales.add(srow * srow_stride + ll / FP8_BLOCK));
                    let mut blksum = _mm256_setzero_ps();
                    let mut l = 0;
                    while l < FP8_BLOCK {
                        blksum = _mm256_fmadd_ps(
                            load8_f8(a.add(row * lda + ll + l)),
                            load8_bf16(b.add(n0 * ldb + ll + l)),
                            blksum,
                        );
                        l += 8;
                    }
                    cv = _mm256_fmadd_ps(blksum, scale, cv);
                    ll += FP8_BLOCK;
                }
                *c.add(n0 * ldc + row) = hsum(cv);
            }
            ii += tilesz;
        }
    }

    #[target_feature(enable = "avx2,fma,f16c")]
    #[allow(clippy::too_many_arguments)]
    unsafe fn gemm_tiles(
        a: *const u8,
        lda: usize,
        b: *const u16,
        ldb: usize,
        c: *mut f32,
        ldc: usize,
        k: usize,
        ith: usize,
        nth: usize,
        scales: *const f32,
        bias_m: usize,
        mc: usize,
        nc: usize,
        m0: usize,
        m: usize,
        n0: usize,
        n: usize,
    ) {
        let lbo = bias_m % FP8_BLOCK;
        let srow_stride = lda / FP8_BLOCK;

        let ytiles = (m - m0) / mc;
        let xtiles = (n - n0) / nc;
        let tiles = ytiles * xtiles;
        let (start, end) = duty_range(tiles, ith, nth);
        for job in start..end {
            let ii = m0 + job / xtiles * mc;
            let jj = n0 + job % xtiles * nc;
            // All rows of the tile share a scale row: the caller's
            // segment splitter keeps tiles inside one 128-row block.
            let srow = (ii + lbo) / FP8_BLOCK;
            let mut cv = [[_mm256_setzero_ps(); 4]; 3];
            let mut l = 0;
            while l < k {
                let scale = _mm256_set1_ps(*scales.add(srow * srow_stride + l / FP8_BLOCK));
                for j in 0..nc {
                    let bv = load8_bf16(b.add((jj + j) * ldb + l));
                    for i in 0..mc {
                        let av = load8_f8(a.add((ii + i) * lda + l));
                        let prod = _mm256_mul_ps(av, bv);
                        cv[j][i] = _mm256_fmadd_ps(prod, scale, cv[j][i]);
                    }
                }
                l += 8;
            }
            for j in 0..nc {
                for i in 0..mc {
                    *c.add((jj + j) * ldc + ii + i) = hsum(cv[j][i]);
                }
            }
        }
    }
}
