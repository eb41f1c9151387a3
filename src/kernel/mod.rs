//! Tiled matrix-multiply micro-kernels.
//!
//! Computes `C = Aᵀ · B` with column-major C. A is "rows of the
//! transposed view": `lda` is the stride between consecutive rows in
//! A-format block units (elements for float formats, 32-element blocks
//! for Q8_0/Q4_0); likewise `ldb` for B. Work is only performed when a
//! handwritten kernel exists for the format pair — otherwise the
//! caller is told to re-quantize B or that the pair is unsupported.
//!
//! Thread slicing: a kernel given `(ith, nth)` walks only its
//! contiguous share of the output tiles, so the same call can be
//! issued from `nth` workers to cover the matrix.

pub mod floats;
pub mod fp8;
pub mod q0;

use crate::ggml::GgmlType;

/// Result of a kernel dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GemmOutcome {
    /// The product was computed into C.
    Computed,
    /// B must be re-packed into A's `vec_dot_type` first.
    WantQuantization,
    /// No kernel exists for this format pair.
    NotSupported,
}

/// Dispatch a matmul over the closed format × format table.
///
/// `m`/`n`/`k`: rows of A and C, columns of B and C, and the shared
/// inner extent in A-format block units. `scales`/`bias_m` feed the
/// FP8 path: the per-128×128-tile scale slab for A's row range and
/// A's global row offset within the scale grid.
///
/// # Safety
/// All pointers must be valid for the extents implied by
/// `(m, n, k, lda, ldb, ldc)` in their respective formats, and C must
/// be writable. For F8_E4M3, `scales` must cover the row slab.
#[allow(clippy::too_many_arguments)]
pub unsafe fn sgemm(
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
    a_type: GgmlType,
    b_type: GgmlType,
    scales: *const f32,
    bias_m: usize,
) -> GemmOutcome {
    debug_assert!(nth > 0 && ith < nth);
    debug_assert!(lda >= k && ldb >= k && ldc >= m);

    match a_type {
        GgmlType::F32 => {
            if b_type != GgmlType::F32 {
                return GemmOutcome::NotSupported;
            }
            if k % 8 != 0 {
                return GemmOutcome::NotSupported;
            }
            floats::gemm_f32(m, n, k, a as *const f32, lda, b as *const f32, ldb, c, ldc, ith, nth);
            GemmOutcome::Computed
        }
        GgmlType::BF16 => {
            if k % 8 != 0 {
                return GemmOutcome::NotSupported;
            }
            if b_type == GgmlType::F32 {
                if n < 2 {
                    floats::gemv_bf16_f32(m, k, a as *const u16, lda, b as *const f32, c, ith, nth);
                    return GemmOutcome::Computed;
                }
                return GemmOutcome::WantQuantization;
            }
            if b_type != GgmlType::BF16 {
                return GemmOutcome::NotSupported;
            }
            floats::gemm_bf16(m, n, k, a as *const u16, lda, b as *const u16, ldb, c, ldc, ith, nth);
            GemmOutcome::Computed
        }
        GgmlType::F16 => {
            if k % 8 != 0 {
                return GemmOutcome::NotSupported;
            }
            if b_type == GgmlType::F32 {
                if n < 2 {
                    floats::gemv_f16_f32(m, k, a as *const u16, lda, b as *const f32, c, ith, nth);
                    return GemmOutcome::Computed;
                }
                return GemmOutcome::WantQuantization;
            }
            if b_type != GgmlType::F16 {
                return GemmOutcome::NotSupported;
            }
            floats::gemm_f16(m, n, k, a as *const u16, lda, b as *const u16, ldb, c, ldc, ith, nth);
            GemmOutcome::Computed
        }
        GgmlType::F8_E4M3 => {
            if b_type != GgmlType::BF16 {
                return GemmOutcome::NotSupported;
            }
            if k % 128 != 0 || scales.is_null() {
                return GemmOutcome::NotSupported;
            }
            fp8::gemm(m, n, k, a, lda, b as *const u16, ldb, c, ldc, ith, nth, scales, bias_m);
            GemmOutcome::Computed
        }
        GgmlType::Q8_0 => {
            if b_type == GgmlType::F32 {
                return GemmOutcome::WantQuantization;
            }
            if b_type != GgmlType::Q8_0 {
                return GemmOutcome::NotSupported;
            }
            q0::gemm_q8_q8(m, n, k, a, lda, b, ldb, c, ldc, ith, nth);
            GemmOutcome::Computed
        }
        GgmlType::Q4_0 => {
            if b_type == GgmlType::F32 {
                return GemmOutcome::WantQuantization;
            }
            if b_type != GgmlType::Q8_0 {
                return GemmOutcome::NotSupported;
            }
            q0::gemm_q4_q8(m, n, k, a, lda, b, ldb, c, ldc, ith, nth);
            GemmOutcome::Computed
        }
    }
}

/// Whether the AVX2+FMA+F16C production kernels can run on this host.
#[inline]
pub(crate) fn simd_available() -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        is_x86_feature_detected!("avx2")
            && is_x86_feature_detected!("fma")
            && is_x86_feature_detected!("f16c")
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        false
    }
}
