//! MoE forward dispatch — runs the expert feed-forward block on CPU.
//!
//! For each token:
//!   1. the GPU-side router selects top-k experts and blending weights
//!   2. this module receives the activation + expert ids + weights
//!   3. for each selected expert: gate+up matmul → SiLU·up → down matmul
//!   4. the weighted sum of expert outputs is written back
//!
//! Two hot paths: `forward_one` fuses gate/up/activation across all
//! selected experts in a single pool dispatch, synchronizing through
//! the pool's stripe barriers; `forward_many` buckets a token group by
//! expert and runs batched GEMMs per expert. `forward` picks between
//! them by group length.

use std::sync::atomic::Ordering;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::{Backend, MAX_ROUTED_EXPERTS, MAX_STRIPES};
use crate::ggml::{from_float, to_float, GgmlType, FP8_BLOCK, QK_K};
use crate::kernel::{sgemm, GemmOutcome};
use crate::numa::{self, NumaAlloc};
use crate::shared_mem::shared_mem_buffer;
use crate::trace::{self, Category};

#[derive(Debug, Error)]
pub enum MoeError {
    #[error("hidden_size {0} is not a multiple of 128")]
    HiddenSize(usize),
    #[error("intermediate_size {0} is not a multiple of 128")]
    IntermediateSize(usize),
    #[error("expert_num {expert_num} < routed_expert_num {routed_expert_num}")]
    ExpertCount {
        expert_num: usize,
        routed_expert_num: usize,
    },
    #[error("routed_expert_num {0} exceeds barrier capacity {MAX_ROUTED_EXPERTS}")]
    RoutedExpertCap(usize),
    #[error("group_min_len {min}..group_max_len {max} is not a valid range")]
    GroupRange { min: usize, max: usize },
    #[error("missing weight pointer for {0}")]
    NullWeight(&'static str),
    #[error("{0} is F8_E4M3 but its scale pointer is missing")]
    NullScale(&'static str),
    #[error("k = {0} is out of range for this layer")]
    BadK(usize),
    #[error("thread_num {thread_num} cannot run k = {k} experts (needs k <= threads)")]
    ThreadCount { thread_num: usize, k: usize },
    #[error("NUMA mode requires thread_num {thread_num} % (2 * k = {k}) == 0")]
    NumaThreadCount { thread_num: usize, k: usize },
    #[error("conversion stripes {0} exceed barrier capacity {MAX_STRIPES}")]
    StripeCap(usize),
}

/// Layer configuration. Weight and scale fields are raw host
/// addresses (`data_ptr()`-style); scales are only read for F8_E4M3
/// matrices and hold one FP32 per 128×128 weight tile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoeConfig {
    pub expert_num: usize,
    pub routed_expert_num: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub group_min_len: usize,
    pub group_max_len: usize,
    pub gate_proj: usize,
    pub up_proj: usize,
    pub down_proj: usize,
    pub gate_type: GgmlType,
    pub up_type: GgmlType,
    pub down_type: GgmlType,
    pub hidden_type: GgmlType,
    #[serde(default)]
    pub gate_scale: usize,
    #[serde(default)]
    pub up_scale: usize,
    #[serde(default)]
    pub down_scale: usize,
}

impl MoeConfig {
    /// Parse a config from its JSON representation (weight addresses
    /// included, as emitted by the host-side launcher).
    pub fn from_json(raw: &str) -> Result<MoeConfig, serde_json::Error> {
        serde_json::from_str(raw)
    }

    fn validate(&self) -> Result<(), MoeError> {
        if self.hidden_size == 0 || self.hidden_size % 128 != 0 {
            return Err(MoeError::HiddenSize(self.hidden_size));
        }
        if self.intermediate_size == 0 || self.intermediate_size % 128 != 0 {
            return Err(MoeError::IntermediateSize(self.intermediate_size));
        }
        if self.routed_expert_num < 1 || self.expert_num < self.routed_expert_num {
            return Err(MoeError::ExpertCount {
                expert_num: self.expert_num,
                routed_expert_num: self.routed_expert_num,
            });
        }
        if self.routed_expert_num > MAX_ROUTED_EXPERTS {
            return Err(MoeError::RoutedExpertCap(self.routed_expert_num));
        }
        if self.group_min_len < 1 || self.group_max_len < self.group_min_len {
            return Err(MoeError::GroupRange {
                min: self.group_min_len,
                max: self.group_max_len,
            });
        }
        for (ptr, name) in [
            (self.gate_proj, "gate_proj"),
            (self.up_proj, "up_proj"),
            (self.down_proj, "down_proj"),
        ] {
            if ptr == 0 {
                return Err(MoeError::NullWeight(name));
            }
        }
        for (ty, scale, name) in [
            (self.gate_type, self.gate_scale, "gate_proj"),
            (self.up_type, self.up_scale, "up_proj"),
            (self.down_type, self.down_scale, "down_proj"),
        ] {
            if ty == GgmlType::F8_E4M3 && scale == 0 {
                return Err(MoeError::NullScale(name));
            }
        }
        Ok(())
    }
}

/// Disjoint slice of `[0, size)` for worker `ith` of `nth`:
/// returns `(count, offset)`.
#[inline]
pub fn get_slice(size: usize, nth: usize, ith: usize) -> (usize, usize) {
    let bias = ith * size / nth;
    ((ith + 1) * size / nth - bias, bias)
}

#[inline]
fn act_fn(x: f32) -> f32 {
    x / (1.0 + (-x).exp())
}

// ── Weight matrices ─────────────────────────────────────────────────

/// One of the three expert weight matrices, optionally sharded into
/// equal row-slabs across NUMA nodes along its strided dimension.
struct Weight {
    base: *const u8,
    shards: Vec<NumaAlloc>,
    /// Rows per shard; equals `strided` when unsharded.
    slab_rows: usize,
    strided: usize,
    row_bytes: usize,
}

// SAFETY: weights are read-only during inference.
unsafe impl Send for Weight {}
unsafe impl Sync for Weight {}

impl Weight {
    /// Build from the caller's single-block source, copying into
    /// per-node slabs when more than one node is present. The source
    /// is not referenced afterwards in the sharded case.
    fn new(
        base: usize,
        expert_num: usize,
        strided: usize,
        non_strided: usize,
        ty: GgmlType,
        numa_nodes: usize,
    ) -> Weight {
        let row_bytes = ty.row_bytes(non_strided);
        let base = base as *const u8;

        if numa_nodes > 1 && strided % numa_nodes == 0 {
            let slab_rows = strided / numa_nodes;
            let slab_bytes = expert_num * slab_rows * row_bytes;
            let shards: Option<Vec<NumaAlloc>> = (0..numa_nodes)
                .map(|node| numa::alloc_on_node(slab_bytes, node))
                .collect();
            if let Some(shards) = shards {
                use rayon::prelude::*;
                let shard_addrs: Vec<usize> =
                    shards.iter().map(|s| s.as_mut_ptr() as usize).collect();
                let src_addr = base as usize;
                (0..numa_nodes * expert_num).into_par_iter().for_each(|idx| {
                    let node = idx / expert_num;
                    let expert = idx % expert_num;
                    let src = (src_addr
                        + (expert * strided + node * slab_rows) * row_bytes)
                        as *const u8;
                    let dst =
                        (shard_addrs[node] + expert * slab_rows * row_bytes) as *mut u8;
                    // SAFETY: every (node, expert) pair owns a disjoint
                    // destination slab and reads a disjoint source range.
                    unsafe {
                        std::ptr::copy_nonoverlapping(src, dst, slab_rows * row_bytes)
                    };
                });
                return Weight {
                    base,
                    shards,
                    slab_rows,
                    strided,
                    row_bytes,
                };
            }
            log::warn!("NUMA shard allocation failed, using unsharded weights");
        }

        Weight {
            base,
            shards: Vec::new(),
            slab_rows: strided,
            strided,
            row_bytes,
        }
    }

    fn sharded(&self) -> bool {
        !self.shards.is_empty()
    }

    /// Pointer to `(expert, row)` with `row` counted along the strided
    /// dimension. Exactly one shard holds any given row.
    #[inline]
    fn row_ptr(&self, expert: usize, row: usize) -> *const u8 {
        if self.shards.is_empty() {
            unsafe { self.base.add((expert * self.strided + row) * self.row_bytes) }
        } else {
            let shard = row / self.slab_rows;
            let local = row % self.slab_rows;
            unsafe {
                self.shards[shard]
                    .as_ptr()
                    .add((expert * self.slab_rows + local) * self.row_bytes)
            }
        }
    }

    /// Gather one expert's rows into `dst` in original row order,
    /// parallelised over the pool.
    fn merge_into(&self, expert: usize, dst: *mut u8, backend: &Backend) {
        let nth = backend.thread_num();
        let expert_bytes = self.strided * self.row_bytes;
        let dst_addr = dst as usize;

        if !self.sharded() {
            let src_addr = self.row_ptr(expert, 0) as usize;
            backend.run(
                nth,
                None,
                &|ith| {
                    let (len, off) = get_slice(expert_bytes, nth, ith);
                    // SAFETY: byte ranges are disjoint across threads.
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            (src_addr + off) as *const u8,
                            (dst_addr + off) as *mut u8,
                            len,
                        );
                    }
                },
                None,
            );
            return;
        }

        let nodes = self.shards.len();
        let slab_bytes = self.slab_rows * self.row_bytes;
        let shard_addrs: Vec<usize> = self.shards.iter().map(|s| s.as_ptr() as usize).collect();
        backend.run(
            nth,
            None,
            &|ith| {
                let node = ith * nodes / nth;
                let (node_threads, node_first) = get_slice(nth, nodes, node);
                let ith_on_node = ith - node_first;
                let (len, off) = get_slice(slab_bytes, node_threads, ith_on_node);
                let src = shard_addrs[node] + expert * slab_bytes + off;
                let dst = dst_addr + node * slab_bytes + off;
                // SAFETY: (node, byte range) pairs are disjoint.
                unsafe {
                    std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, len)
                };
            },
            None,
        );
    }
}

// ── The orchestrator ────────────────────────────────────────────────

pub struct Moe {
    config: MoeConfig,
    client_id: usize,
    gate: Weight,
    up: Weight,
    down: Weight,

    // Single-token scratch.
    s_input_fp32: *mut f32,
    s_gate_input: *mut u8,
    // Reserved for layers whose up projection wants a different
    // vec-dot format than the gate; the fused path shares s_gate_input
    // whenever the two agree.
    #[allow(dead_code)]
    s_up_input: *mut u8,
    s_gate_output: Vec<*mut f32>,
    s_up_output: Vec<*mut f32>,
    s_intermediate_fp32: Vec<*mut f32>,
    s_down_input: Vec<*mut u8>,
    s_down_output: Vec<*mut f32>,
    s_output_fp32: *mut f32,

    // Grouped scratch.
    m_input_fp32: Vec<*mut f32>,
    m_gate_input: Vec<*mut u8>,
    m_up_input: Vec<*mut u8>,
    m_local_gate_input: *mut u8,
    m_local_up_input: *mut u8,
    m_local_gate_output: *mut f32,
    m_local_up_output: *mut f32,
    m_local_intermediate_fp32: *mut f32,
    m_local_down_input: *mut u8,
    m_local_down_output: *mut f32,
    m_output_fp32: Vec<*mut f32>,

    // Per-call bucket state.
    m_local_pos: Vec<Vec<usize>>,
    m_local_num: Vec<usize>,
    m_local_gate_input_ptr: Vec<usize>,
    m_local_up_input_ptr: Vec<usize>,
    m_local_gate_output_ptr: Vec<usize>,
    m_local_up_output_ptr: Vec<usize>,
    m_local_intermediate_fp32_ptr: Vec<usize>,
    m_local_down_input_ptr: Vec<usize>,
    m_local_down_output_ptr: Vec<usize>,
}

// SAFETY: scratch is owned by this instance and only touched during
// its own externally-serialized dispatches; weights are read-only.
unsafe impl Send for Moe {}
unsafe impl Sync for Moe {}

impl Drop for Moe {
    fn drop(&mut self) {
        shared_mem_buffer().dealloc(self.client_id);
    }
}

impl Moe {
    pub fn new(config: MoeConfig) -> Result<Moe, MoeError> {
        config.validate()?;

        let numa_nodes = numa::topology().num_nodes;
        let gate = Weight::new(
            config.gate_proj,
            config.expert_num,
            config.intermediate_size,
            config.hidden_size,
            config.gate_type,
            numa_nodes,
        );
        let up = Weight::new(
            config.up_proj,
            config.expert_num,
            config.intermediate_size,
            config.hidden_size,
            config.up_type,
            numa_nodes,
        );
        let down = Weight::new(
            config.down_proj,
            config.expert_num,
            config.hidden_size,
            config.intermediate_size,
            config.down_type,
            numa_nodes,
        );
        if gate.sharded() {
            log::info!(
                "weights sharded across {numa_nodes} NUMA nodes ({} experts)",
                config.expert_num
            );
        }

        let hidden = config.hidden_size;
        let inter = config.intermediate_size;
        let routed = config.routed_expert_num;
        let gmax = config.group_max_len;
        let gate_vd = config.gate_type.vec_dot_type();
        let up_vd = config.up_type.vec_dot_type();
        let down_vd = config.down_type.vec_dot_type();

        // One arena for both the single-token and grouped regions.
        let mut sizes: Vec<usize> = Vec::new();
        sizes.push(hidden * 4); // s_input_fp32
        sizes.push(gate_vd.row_bytes(hidden)); // s_gate_input
        sizes.push(up_vd.row_bytes(hidden)); // s_up_input
        for _ in 0..routed {
            sizes.push(inter * 4); // s_gate_output[i]
            sizes.push(inter * 4); // s_up_output[i]
            sizes.push(inter * 4); // s_intermediate_fp32[i]
            sizes.push(down_vd.row_bytes(inter)); // s_down_input[i]
            sizes.push(hidden * 4); // s_down_output[i]
        }
        sizes.push(hidden * 4); // s_output_fp32
        for _ in 0..gmax {
            sizes.push(hidden * 4); // m_input_fp32[i]
            sizes.push(gate_vd.row_bytes(hidden)); // m_gate_input[i]
            sizes.push(up_vd.row_bytes(hidden)); // m_up_input[i]
        }
        sizes.push(routed * gmax * gate_vd.row_bytes(hidden)); // m_local_gate_input
        sizes.push(routed * gmax * up_vd.row_bytes(hidden)); // m_local_up_input
        sizes.push(routed * gmax * inter * 4); // m_local_gate_output
        sizes.push(routed * gmax * inter * 4); // m_local_up_output
        sizes.push(routed * gmax * inter * 4); // m_local_intermediate_fp32
        sizes.push(routed * gmax * down_vd.row_bytes(inter)); // m_local_down_input
        sizes.push(routed * gmax * hidden * 4); // m_local_down_output
        for _ in 0..gmax {
            sizes.push(hidden * 4); // m_output_fp32[i]
        }

        use std::sync::atomic::AtomicUsize;
        static NEXT_CLIENT: AtomicUsize = AtomicUsize::new(1);
        let client_id = NEXT_CLIENT.fetch_add(1, Ordering::Relaxed);
        let regions = shared_mem_buffer().alloc(client_id, &sizes);
        let mut it = regions.into_iter();
        let mut next = || it.next().expect("scratch region count");

        let s_input_fp32 = next() as *mut f32;
        let s_gate_input = next();
        let s_up_input = next();
        let mut s_gate_output = Vec::with_capacity(routed);
        let mut s_up_output = Vec::with_capacity(routed);
        let mut s_intermediate_fp32 = Vec::with_capacity(routed);
        let mut s_down_input = Vec::with_capacity(routed);
        let mut s_down_output = Vec::with_capacity(routed);
        for _ in 0..routed {
            s_gate_output.push(next() as *mut f32);
            s_up_output.push(next() as *mut f32);
            s_intermediate_fp32.push(next() as *mut f32);
            s_down_input.push(next());
            s_down_output.push(next() as *mut f32);
        }
        let s_output_fp32 = next() as *mut f32;
        let mut m_input_fp32 = Vec::with_capacity(gmax);
        let mut m_gate_input = Vec::with_capacity(gmax);
        let mut m_up_input = Vec::with_capacity(gmax);
        for _ in 0..gmax {
            m_input_fp32.push(next() as *mut f32);
            m_gate_input.push(next());
            m_up_input.push(next());
        }
        let m_local_gate_input = next();
        let m_local_up_input = next();
        let m_local_gate_output = next() as *mut f32;
        let m_local_up_output = next() as *mut f32;
        let m_local_intermediate_fp32 = next() as *mut f32;
        let m_local_down_input = next();
        let m_local_down_output = next() as *mut f32;
        let mut m_output_fp32 = Vec::with_capacity(gmax);
        for _ in 0..gmax {
            m_output_fp32.push(next() as *mut f32);
        }

        Ok(Moe {
            gate,
            up,
            down,
            client_id,
            s_input_fp32,
            s_gate_input,
            s_up_input,
            s_gate_output,
            s_up_output,
            s_intermediate_fp32,
            s_down_input,
            s_down_output,
            s_output_fp32,
            m_input_fp32,
            m_gate_input,
            m_up_input,
            m_local_gate_input,
            m_local_up_input,
            m_local_gate_output,
            m_local_up_output,
            m_local_intermediate_fp32,
            m_local_down_input,
            m_local_down_output,
            m_output_fp32,
            m_local_pos: vec![vec![0; routed]; gmax],
            m_local_num: vec![0; config.expert_num],
            m_local_gate_input_ptr: vec![0; config.expert_num],
            m_local_up_input_ptr: vec![0; config.expert_num],
            m_local_gate_output_ptr: vec![0; config.expert_num],
            m_local_up_output_ptr: vec![0; config.expert_num],
            m_local_intermediate_fp32_ptr: vec![0; config.expert_num],
            m_local_down_input_ptr: vec![0; config.expert_num],
            m_local_down_output_ptr: vec![0; config.expert_num],
            config,
        })
    }

    pub fn config(&self) -> &MoeConfig {
        &self.config
    }

    /// Touch every expert's weight span with a zero token: pages in
    /// NUMA memory and faults scratch before the first real call.
    pub fn warm_up(&self, backend: &Backend) -> Result<(), MoeError> {
        let hidden = self.config.hidden_size;
        let input_fp32 = vec![0.0f32; hidden];
        let mut input = vec![0u8; self.config.hidden_type.row_bytes(hidden)];
        let mut output = vec![0u8; self.config.hidden_type.row_bytes(hidden)];
        unsafe {
            from_float(
                self.config.hidden_type,
                input_fp32.as_ptr(),
                input.as_mut_ptr(),
                hidden,
            );
        }
        for expert in 0..self.config.expert_num as u64 {
            self.forward_one(1, &[expert], &[0.0], input.as_ptr(), output.as_mut_ptr(), backend)?;
        }
        log::debug!("warm-up complete ({} experts)", self.config.expert_num);
        Ok(())
    }

    fn check_dispatch(&self, k: usize, backend: &Backend) -> Result<(), MoeError> {
        let thread_num = backend.thread_num();
        if k < 1 || k > self.config.routed_expert_num {
            return Err(MoeError::BadK(k));
        }
        if k > thread_num {
            return Err(MoeError::ThreadCount { thread_num, k });
        }
        if numa::topology().is_numa() && thread_num % (2 * k) != 0 {
            return Err(MoeError::NumaThreadCount { thread_num, k });
        }
        let nth = (thread_num / k).max(1);
        if nth > MAX_STRIPES {
            return Err(MoeError::StripeCap(nth));
        }
        // Conversion stripes are carved over the dispatched tasks
        // (nth * k of them), all of which run concurrently.
        let conv_threads = nth * k;
        let stride = QK_K * self.config.hidden_size.div_ceil(conv_threads * QK_K);
        if self.config.hidden_size.div_ceil(stride) > MAX_STRIPES {
            return Err(MoeError::StripeCap(self.config.hidden_size.div_ceil(stride)));
        }
        Ok(())
    }

    /// FP8 scale slab for a weight's `(expert, row offset)` slab, or
    /// null for non-FP8 weights.
    fn scale_slab(
        &self,
        ty: GgmlType,
        scale_base: usize,
        expert: usize,
        strided: usize,
        non_strided: usize,
        bias: usize,
    ) -> *const f32 {
        if ty != GgmlType::F8_E4M3 {
            return std::ptr::null();
        }
        let row = expert * strided / FP8_BLOCK + bias / FP8_BLOCK;
        let cols = non_strided / FP8_BLOCK;
        (scale_base as *const f32).wrapping_add(row * cols)
    }

    /// Single-token hot path over `k` experts.
    pub fn forward_one(
        &self,
        k: usize,
        expert_ids: &[u64],
        weights: &[f32],
        input: *const u8,
        output: *mut u8,
        backend: &Backend,
    ) -> Result<(), MoeError> {
        self.check_dispatch(k, backend)?;
        assert!(expert_ids.len() >= k && weights.len() >= k);
        trace::event_begin(Category::Compute, "forward_one");

        let cfg = &self.config;
        let hidden = cfg.hidden_size;
        let inter = cfg.intermediate_size;
        let thread_num = backend.thread_num();
        let gate_vd = cfg.gate_type.vec_dot_type();
        let up_vd = cfg.up_type.vec_dot_type();
        let down_vd = cfg.down_type.vec_dot_type();

        let nth = (thread_num / k).max(1);
        let input_conv_stride = QK_K * hidden.div_ceil(nth * k * QK_K);
        let input_conv_nth = hidden.div_ceil(input_conv_stride);
        let passthrough = cfg.hidden_type == gate_vd && cfg.hidden_type == up_vd;

        let input_addr = input as usize;
        let this = self;

        // Reset the stripe entries this dispatch will use; they are
        // reused across dispatches and may still hold last call's 1s.
        if !passthrough {
            for stripe in &backend.input_conv_syn()[..input_conv_nth] {
                stripe.store(0, Ordering::Relaxed);
            }
        }
        for expert_idx in 0..k {
            for stripe in &backend.interm_conv_grp_syn(expert_idx)[..nth] {
                stripe.store(0, Ordering::Relaxed);
            }
        }

        // Phase A+B fused: input conversion behind the stripe barrier,
        // then each (stripe, expert) task computes its gate/up slice,
        // activates it, and rendezvouses with its expert group before
        // the intermediate row is requantized for the down matmul.
        backend.run(
            nth * k,
            None,
            &|task_id| {
                let gate_input_ptr: usize;
                if passthrough {
                    gate_input_ptr = input_addr;
                } else {
                    if task_id < input_conv_nth {
                        let ith = task_id;
                        let bias = ith * input_conv_stride;
                        let len = input_conv_stride.min(hidden - bias);
                        backend.input_conv_syn()[ith].store(0, Ordering::Release);
                        // SAFETY: each stripe converts a disjoint slice.
                        unsafe {
                            let src = (input_addr as *const u8)
                                .add(cfg.hidden_type.row_bytes(bias));
                            to_float(cfg.hidden_type, src, this.s_input_fp32.add(bias), len);
                            from_float(
                                gate_vd,
                                this.s_input_fp32.add(bias),
                                this.s_gate_input.add(gate_vd.row_bytes(bias)),
                                len,
                            );
                        }
                        backend.input_conv_syn()[ith].store(1, Ordering::Release);
                    }
                    for stripe in &backend.input_conv_syn()[..input_conv_nth] {
                        while stripe.load(Ordering::Acquire) == 0 {
                            std::hint::spin_loop();
                        }
                    }
                    gate_input_ptr = this.s_gate_input as usize;
                }

                let expert_idx = task_id % k;
                let expert_id = expert_ids[expert_idx] as usize;
                let ith = task_id / k;

                backend.interm_conv_grp_syn(expert_idx)[ith].store(0, Ordering::Release);

                let (local, bias) = get_slice(inter, nth, ith);

                // SAFETY: (expert_idx, slice) pairs write disjoint
                // ranges of the per-expert scratch rows.
                unsafe {
                    let outcome = sgemm(
                        local,
                        1,
                        hidden / cfg.gate_type.block_elems(),
                        this.gate.row_ptr(expert_id, bias),
                        hidden / cfg.gate_type.block_elems(),
                        gate_input_ptr as *const u8,
                        hidden / cfg.gate_type.block_elems(),
                        this.s_gate_output[expert_idx].add(bias),
                        local,
                        0,
                        1,
                        cfg.gate_type,
                        gate_vd,
                        this.scale_slab(cfg.gate_type, cfg.gate_scale, expert_id, inter, hidden, bias),
                        bias,
                    );
                    assert_eq!(outcome, GemmOutcome::Computed, "gate matmul unsupported");

                    let outcome = sgemm(
                        local,
                        1,
                        hidden / cfg.up_type.block_elems(),
                        this.up.row_ptr(expert_id, bias),
                        hidden / cfg.up_type.block_elems(),
                        gate_input_ptr as *const u8,
                        hidden / cfg.up_type.block_elems(),
                        this.s_up_output[expert_idx].add(bias),
                        local,
                        0,
                        1,
                        cfg.up_type,
                        up_vd,
                        this.scale_slab(cfg.up_type, cfg.up_scale, expert_id, inter, hidden, bias),
                        bias,
                    );
                    assert_eq!(outcome, GemmOutcome::Computed, "up matmul unsupported");

                    for i in bias..bias + local {
                        *this.s_intermediate_fp32[expert_idx].add(i) =
                            act_fn(*this.s_gate_output[expert_idx].add(i))
                                * *this.s_up_output[expert_idx].add(i);
                    }
                }

                backend.interm_conv_grp_syn(expert_idx)[ith].store(1, Ordering::Release);
                for stripe in &backend.interm_conv_grp_syn(expert_idx)[..nth] {
                    while stripe.load(Ordering::Acquire) == 0 {
                        std::hint::spin_loop();
                    }
                }

                // One stripe per expert requantizes the completed row.
                if ith == 0 {
                    unsafe {
                        from_float(
                            down_vd,
                            this.s_intermediate_fp32[expert_idx],
                            this.s_down_input[expert_idx],
                            inter,
                        );
                    }
                }
            },
            None,
        );

        // Phase C: down projection and weighted reduction, striped
        // over the hidden axis.
        let nth = thread_num;
        backend.run(
            nth,
            None,
            &|ith| {
                let (local, bias) = get_slice(hidden, nth, ith);
                // SAFETY: each task owns a disjoint hidden slice.
                unsafe {
                    for i in bias..bias + local {
                        *this.s_output_fp32.add(i) = 0.0;
                    }
                    for expert_idx in 0..k {
                        let expert_id = expert_ids[expert_idx] as usize;
                        let outcome = sgemm(
                            local,
                            1,
                            inter / cfg.down_type.block_elems(),
                            this.down.row_ptr(expert_id, bias),
                            inter / cfg.down_type.block_elems(),
                            this.s_down_input[expert_idx],
                            inter / cfg.down_type.block_elems(),
                            this.s_down_output[expert_idx].add(bias),
                            local,
                            0,
                            1,
                            cfg.down_type,
                            down_vd,
                            this.scale_slab(
                                cfg.down_type,
                                cfg.down_scale,
                                expert_id,
                                hidden,
                                inter,
                                bias,
                            ),
                            bias,
                        );
                        assert_eq!(outcome, GemmOutcome::Computed, "down matmul unsupported");
                        for i in bias..bias + local {
                            *this.s_output_fp32.add(i) +=
                                *this.s_down_output[expert_idx].add(i) * weights[expert_idx];
                        }
                    }
                }
            },
            None,
        );

        // Phase D: output conversion.
        unsafe { from_float(cfg.hidden_type, self.s_output_fp32, output, hidden) };
        trace::event_end(Category::Compute);
        Ok(())
    }

    /// Grouped path: bucket tokens by expert, pack inputs, then run
    /// batched GEMMs per expert.
    #[allow(clippy::too_many_arguments)]
    pub fn forward_many(
        &mut self,
        qlen: usize,
        k: usize,
        expert_ids: &[u64],
        weights: &[f32],
        input: *const u8,
        output: *mut u8,
        backend: &Backend,
    ) -> Result<(), MoeError> {
        self.check_dispatch(k, backend)?;
        assert!(qlen <= self.config.group_max_len);
        assert!(expert_ids.len() >= qlen * k && weights.len() >= qlen * k);
        trace::event_begin(Category::Compute, "forward_many");

        let cfg = self.config.clone();
        let hidden = cfg.hidden_size;
        let inter = cfg.intermediate_size;
        let expert_num = cfg.expert_num;
        let gate_vd = cfg.gate_type.vec_dot_type();
        let up_vd = cfg.up_type.vec_dot_type();
        let down_vd = cfg.down_type.vec_dot_type();

        // Bucket build: per-expert counts and each (token, slot)'s
        // position within its expert's queue.
        self.m_local_num[..expert_num].fill(0);
        for i in 0..qlen {
            for j in 0..k {
                let e = expert_ids[i * k + j] as usize;
                self.m_local_pos[i][j] = self.m_local_num[e];
                self.m_local_num[e] += 1;
            }
        }

        // Contiguous base pointers per expert into the flat queues.
        let mut offset = 0usize;
        for e in 0..expert_num {
            self.m_local_gate_input_ptr[e] =
                self.m_local_gate_input as usize + offset * gate_vd.row_bytes(hidden);
            self.m_local_up_input_ptr[e] =
                self.m_local_up_input as usize + offset * up_vd.row_bytes(hidden);
            self.m_local_gate_output_ptr[e] =
                self.m_local_gate_output as usize + offset * inter * 4;
            self.m_local_up_output_ptr[e] =
                self.m_local_up_output as usize + offset * inter * 4;
            self.m_local_intermediate_fp32_ptr[e] =
                self.m_local_intermediate_fp32 as usize + offset * inter * 4;
            self.m_local_down_input_ptr[e] =
                self.m_local_down_input as usize + offset * down_vd.row_bytes(inter);
            self.m_local_down_output_ptr[e] =
                self.m_local_down_output as usize + offset * hidden * 4;
            offset += self.m_local_num[e];
        }

        let this: &Moe = self;
        let input_addr = input as usize;
        let output_addr = output as usize;

        // Token pack: convert each input row as needed and scatter it
        // into every selected expert's queue slot.
        backend.run(
            qlen,
            None,
            &|i| {
                let row_in = input_addr + i * cfg.hidden_type.row_bytes(hidden);
                let gate_input_ptr: usize;
                let up_input_ptr: usize;
                // SAFETY: each token owns row i of the shared scratch.
                unsafe {
                    if cfg.hidden_type == gate_vd && cfg.hidden_type == up_vd {
                        gate_input_ptr = row_in;
                        up_input_ptr = row_in;
                    } else {
                        to_float(
                            cfg.hidden_type,
                            row_in as *const u8,
                            this.m_input_fp32[i],
                            hidden,
                        );
                        if gate_vd == up_vd {
                            from_float(gate_vd, this.m_input_fp32[i], this.m_gate_input[i], hidden);
                            gate_input_ptr = this.m_gate_input[i] as usize;
                            up_input_ptr = gate_input_ptr;
                        } else {
                            if cfg.hidden_type != gate_vd {
                                from_float(
                                    gate_vd,
                                    this.m_input_fp32[i],
                                    this.m_gate_input[i],
                                    hidden,
                                );
                                gate_input_ptr = this.m_gate_input[i] as usize;
                            } else {
                                gate_input_ptr = row_in;
                            }
                            if cfg.hidden_type != up_vd {
                                from_float(up_vd, this.m_input_fp32[i], this.m_up_input[i], hidden);
                                up_input_ptr = this.m_up_input[i] as usize;
                            } else {
                                up_input_ptr = row_in;
                            }
                        }
                    }
                    for j in 0..k {
                        let e = expert_ids[i * k + j] as usize;
                        let pos = this.m_local_pos[i][j];
                        std::ptr::copy_nonoverlapping(
                            gate_input_ptr as *const u8,
                            (this.m_local_gate_input_ptr[e]
                                + pos * gate_vd.row_bytes(hidden))
                                as *mut u8,
                            gate_vd.row_bytes(hidden),
                        );
                        std::ptr::copy_nonoverlapping(
                            up_input_ptr as *const u8,
                            (this.m_local_up_input_ptr[e] + pos * up_vd.row_bytes(hidden))
                                as *mut u8,
                            up_vd.row_bytes(hidden),
                        );
                    }
                }
            },
            None,
        );

        let nth = backend.thread_num();

        // Gate + up + activation, striped over the intermediate axis.
        backend.run(
            nth,
            None,
            &|ith| {
                let (local, bias) = get_slice(inter, nth, ith);
                for e in 0..expert_num {
                    let rows = this.m_local_num[e];
                    if rows == 0 {
                        continue;
                    }
                    // SAFETY: each task owns a disjoint intermediate
                    // slice of every expert's output rows.
                    unsafe {
                        let outcome = sgemm(
                            local,
                            rows,
                            hidden / cfg.gate_type.block_elems(),
                            this.gate.row_ptr(e, bias),
                            hidden / cfg.gate_type.block_elems(),
                            this.m_local_gate_input_ptr[e] as *const u8,
                            hidden / cfg.gate_type.block_elems(),
                            (this.m_local_gate_output_ptr[e] as *mut f32).add(bias),
                            inter,
                            0,
                            1,
                            cfg.gate_type,
                            gate_vd,
                            this.scale_slab(cfg.gate_type, cfg.gate_scale, e, inter, hidden, bias),
                            bias,
                        );
                        assert_eq!(outcome, GemmOutcome::Computed, "gate matmul unsupported");

                        let outcome = sgemm(
                            local,
                            rows,
                            hidden / cfg.up_type.block_elems(),
                            this.up.row_ptr(e, bias),
                            hidden / cfg.up_type.block_elems(),
                            this.m_local_up_input_ptr[e] as *const u8,
                            hidden / cfg.up_type.block_elems(),
                            (this.m_local_up_output_ptr[e] as *mut f32).add(bias),
                            inter,
                            0,
                            1,
                            cfg.up_type,
                            up_vd,
                            this.scale_slab(cfg.up_type, cfg.up_scale, e, inter, hidden, bias),
                            bias,
                        );
                        assert_eq!(outcome, GemmOutcome::Computed, "up matmul unsupported");

                        let gate_out = this.m_local_gate_output_ptr[e] as *const f32;
                        let up_out = this.m_local_up_output_ptr[e] as *const f32;
                        let interm = this.m_local_intermediate_fp32_ptr[e] as *mut f32;
                        for row in 0..rows {
                            for j in bias..bias + local {
                                *interm.add(row * inter + j) = act_fn(*gate_out.add(row * inter + j))
                                    * *up_out.add(row * inter + j);
                            }
                        }
                    }
                }
            },
            None,
        );

        // Requantize each bucket row to the down vec-dot format,
        // sliced over experts.
        backend.run(
            nth,
            None,
            &|ith| {
                let (count, bias) = get_slice(expert_num, nth, ith);
                for e in bias..bias + count {
                    // SAFETY: expert slices are disjoint.
                    unsafe {
                        for row in 0..this.m_local_num[e] {
                            from_float(
                                down_vd,
                                (this.m_local_intermediate_fp32_ptr[e] as *const f32)
                                    .add(row * inter),
                                (this.m_local_down_input_ptr[e] as *mut u8)
                                    .add(row * down_vd.row_bytes(inter)),
                                inter,
                            );
                        }
                    }
                }
            },
            None,
        );

        // Down projection, striped over the hidden axis.
        backend.run(
            nth,
            None,
            &|ith| {
                let (local, bias) = get_slice(hidden, nth, ith);
                for e in 0..expert_num {
                    let rows = this.m_local_num[e];
                    if rows == 0 {
                        continue;
                    }
                    // SAFETY: each task owns a disjoint hidden slice.
                    unsafe {
                        let outcome = sgemm(
                            local,
                            rows,
                            inter / cfg.down_type.block_elems(),
                            this.down.row_ptr(e, bias),
                            inter / cfg.down_type.block_elems(),
                            this.m_local_down_input_ptr[e] as *const u8,
                            inter / cfg.down_type.block_elems(),
                            (this.m_local_down_output_ptr[e] as *mut f32).add(bias),
                            hidden,
                            0,
                            1,
                            cfg.down_type,
                            down_vd,
                            this.scale_slab(cfg.down_type, cfg.down_scale, e, hidden, inter, bias),
                            bias,
                        );
                        assert_eq!(outcome, GemmOutcome::Computed, "down matmul unsupported");
                    }
                }
            },
            None,
        );

        // Scatter-reduce: weighted sum of each token's expert rows,
        // then conversion to the output format.
        backend.run(
            qlen,
            None,
            &|i| {
                // SAFETY: each token owns row i of the output scratch.
                unsafe {
                    let out = this.m_output_fp32[i];
                    for e in 0..hidden {
                        *out.add(e) = 0.0;
                    }
                    for j in 0..k {
                        let eid = expert_ids[i * k + j] as usize;
                        let w = weights[i * k + j];
                        let src = (this.m_local_down_output_ptr[eid] as *const f32)
                            .add(this.m_local_pos[i][j] * hidden);
                        for e in 0..hidden {
                            *out.add(e) += *src.add(e) * w;
                        }
                    }
                    from_float(
                        cfg.hidden_type,
                        out,
                        (output_addr + i * cfg.hidden_type.row_bytes(hidden)) as *mut u8,
                        hidden,
                    );
                }
            },
            None,
        );

        trace::event_end(Category::Compute);
        Ok(())
    }

    /// Route a batch: short batches token-by-token through the fused
    /// path, longer ones in `group_max_len` chunks through the
    /// grouped path.
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &mut self,
        qlen: usize,
        k: usize,
        expert_ids: &[u64],
        weights: &[f32],
        input: *const u8,
        output: *mut u8,
        backend: &Backend,
    ) -> Result<(), MoeError> {
        if qlen == 0 {
            return Ok(());
        }
        assert!(expert_ids.len() >= qlen * k && weights.len() >= qlen * k);
        let row = self.config.hidden_type.row_bytes(self.config.hidden_size);

        let mut off = 0usize;
        while off < qlen {
            let remain = qlen - off;
            if remain < self.config.group_min_len {
                for i in off..qlen {
                    self.forward_one(
                        k,
                        &expert_ids[i * k..],
                        &weights[i * k..],
                        unsafe { input.add(i * row) },
                        unsafe { output.add(i * row) },
                        backend,
                    )?;
                }
                return Ok(());
            }
            let len = remain.min(self.config.group_max_len);
            self.forward_many(
                len,
                k,
                &expert_ids[off * k..],
                &weights[off * k..],
                unsafe { input.add(off * row) },
                unsafe { output.add(off * row) },
                backend,
            )?;
            off += len;
        }
        Ok(())
    }

    /// Gather expert `expert`'s three matrices into the caller's
    /// buffers, restoring the original un-sharded row order.
    pub fn get_weight(
        &self,
        expert: usize,
        gate_dst: *mut u8,
        up_dst: *mut u8,
        down_dst: *mut u8,
        backend: &Backend,
    ) {
        assert!(expert < self.config.expert_num);
        self.gate.merge_into(expert, gate_dst, backend);
        self.up.merge_into(expert, up_dst, backend);
        self.down.merge_into(expert, down_dst, backend);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Short spin limit so idle test pools sleep instead of burning
    // the host while other tests run.
    fn backend() -> Backend {
        Backend::with_spin_limit(4, 10_000)
    }

    fn silu(x: f32) -> f32 {
        x / (1.0 + (-x).exp())
    }

    /// Identity matrix, row-major f32.
    fn eye(n: usize) -> Vec<f32> {
        let mut m = vec![0.0f32; n * n];
        for i in 0..n {
            m[i * n + i] = 1.0;
        }
        m
    }

    fn f32_config(
        expert_num: usize,
        routed: usize,
        hidden: usize,
        inter: usize,
        gate: &[f32],
        up: &[f32],
        down: &[f32],
    ) -> MoeConfig {
        MoeConfig {
            expert_num,
            routed_expert_num: routed,
            hidden_size: hidden,
            intermediate_size: inter,
            group_min_len: 2,
            group_max_len: 8,
            gate_proj: gate.as_ptr() as usize,
            up_proj: up.as_ptr() as usize,
            down_proj: down.as_ptr() as usize,
            gate_type: GgmlType::F32,
            up_type: GgmlType::F32,
            down_type: GgmlType::F32,
            hidden_type: GgmlType::F32,
            gate_scale: 0,
            up_scale: 0,
            down_scale: 0,
        }
    }

    #[test]
    fn test_get_slice_partitions_disjointly() {
        for &(size, nth) in &[(128usize, 1usize), (128, 3), (1000, 7), (5, 8), (64, 64)] {
            let mut covered = vec![false; size];
            for ith in 0..nth {
                let (local, bias) = get_slice(size, nth, ith);
                for i in bias..bias + local {
                    assert!(!covered[i], "size={size} nth={nth}: {i} covered twice");
                    covered[i] = true;
                }
            }
            assert!(covered.iter().all(|&c| c), "size={size} nth={nth}: gap");
        }
    }

    #[test]
    fn test_config_validation() {
        let w = vec![0.0f32; 128 * 128];
        let mut cfg = f32_config(1, 1, 128, 128, &w, &w, &w);
        cfg.hidden_size = 100;
        assert!(matches!(Moe::new(cfg).err().unwrap(), MoeError::HiddenSize(100)));

        let mut cfg = f32_config(1, 1, 128, 128, &w, &w, &w);
        cfg.routed_expert_num = 2;
        assert!(matches!(Moe::new(cfg).err().unwrap(), MoeError::ExpertCount { .. }));

        let mut cfg = f32_config(1, 1, 128, 128, &w, &w, &w);
        cfg.gate_proj = 0;
        assert!(matches!(Moe::new(cfg).err().unwrap(), MoeError::NullWeight("gate_proj")));
    }

    #[test]
    fn test_config_json_round_trip() {
        let w = vec![0.0f32; 128 * 128];
        let cfg = f32_config(4, 2, 128, 128, &w, &w, &w);
        let json = serde_json::to_string(&cfg).unwrap();
        let back = MoeConfig::from_json(&json).unwrap();
        assert_eq!(back.expert_num, 4);
        assert_eq!(back.gate_type, GgmlType::F32);
        assert_eq!(back.gate_proj, cfg.gate_proj);
    }

    #[test]
    fn test_identity_expert_silu() {
        let _ = env_logger::try_init();
        // gate = up = down = I, so the output is SiLU(x) · x.
        let hidden = 128;
        let id = eye(hidden);
        let cfg = f32_config(1, 1, hidden, hidden, &id, &id, &id);
        let moe = Moe::new(cfg).unwrap();
        let backend = backend();

        let input: Vec<f32> = (1..=hidden as i32).map(|x| x as f32 * 0.05).collect();
        let mut output = vec![0.0f32; hidden];
        moe.forward_one(
            1,
            &[0],
            &[1.0],
            input.as_ptr() as *const u8,
            output.as_mut_ptr() as *mut u8,
            &backend,
        )
        .unwrap();

        for i in 0..hidden {
            let want = silu(input[i]) * input[i];
            assert!(
                (output[i] - want).abs() <= 1e-5 * want.abs().max(1.0),
                "elem {i}: {} vs {want}",
                output[i]
            );
        }
    }

    #[test]
    fn test_two_identity_experts_weighted_sum() {
        // Both experts produce SiLU(x)·x; weights sum to 1.
        let hidden = 128;
        let id = eye(hidden);
        let mut gate = id.clone();
        gate.extend_from_slice(&id);
        let mut up = id.clone();
        up.extend_from_slice(&id);
        let mut down = id.clone();
        down.extend_from_slice(&id);

        let cfg = f32_config(2, 2, hidden, hidden, &gate, &up, &down);
        let moe = Moe::new(cfg).unwrap();
        let backend = backend();

        let input: Vec<f32> = (0..hidden).map(|x| (x as f32 - 64.0) * 0.03).collect();
        let mut output = vec![0.0f32; hidden];
        moe.forward_one(
            2,
            &[0, 1],
            &[0.25, 0.75],
            input.as_ptr() as *const u8,
            output.as_mut_ptr() as *mut u8,
            &backend,
        )
        .unwrap();

        for i in 0..hidden {
            let want = silu(input[i]) * input[i];
            assert!(
                (output[i] - want).abs() <= 1e-5 * want.abs().max(1.0),
                "elem {i}: {} vs {want}",
                output[i]
            );
        }
    }

    fn synth_weights(rows: usize, cols: usize, seed: usize) -> Vec<f32> {
        (0..rows * cols)
            .map(|i| ((i * 17 + seed * 41 + 3) % 101) as f32 / 101.0 - 0.5)
            .collect()
    }

    #[test]
    fn test_forward_many_matches_forward_one() {
        let hidden = 128;
        let inter = 256;
        let experts = 3;
        let gate = synth_weights(experts * inter, hidden, 1);
        let up = synth_weights(experts * inter, hidden, 2);
        let down = synth_weights(experts * hidden, inter, 3);

        let cfg = f32_config(experts, 2, hidden, inter, &gate, &up, &down);
        let mut moe = Moe::new(cfg).unwrap();
        let backend = backend();

        let qlen = 4;
        let k = 2;
        let ids: Vec<u64> = vec![0, 1, 1, 2, 2, 0, 0, 2];
        let weights: Vec<f32> = vec![0.6, 0.4, 0.3, 0.7, 0.5, 0.5, 0.9, 0.1];
        let input: Vec<f32> = (0..qlen * hidden)
            .map(|i| ((i * 7 + 11) % 53) as f32 / 53.0 - 0.5)
            .collect();

        let mut batched = vec![0.0f32; qlen * hidden];
        moe.forward_many(
            qlen,
            k,
            &ids,
            &weights,
            input.as_ptr() as *const u8,
            batched.as_mut_ptr() as *mut u8,
            &backend,
        )
        .unwrap();

        let mut single = vec![0.0f32; qlen * hidden];
        for i in 0..qlen {
            moe.forward_one(
                k,
                &ids[i * k..],
                &weights[i * k..],
                unsafe { (input.as_ptr() as *const u8).add(i * hidden * 4) },
                unsafe { (single.as_mut_ptr() as *mut u8).add(i * hidden * 4) },
                &backend,
            )
            .unwrap();
        }

        let mut max_rel: f32 = 0.0;
        for i in 0..qlen * hidden {
            max_rel = max_rel.max((batched[i] - single[i]).abs() / single[i].abs().max(1e-3));
        }
        eprintln!("forward_many vs forward_one: max rel {max_rel:.8}");
        assert!(max_rel <= 1e-5);
    }

    #[test]
    fn test_forward_splits_by_group_length() {
        let hidden = 128;
        let id = eye(hidden);
        let cfg = f32_config(1, 1, hidden, hidden, &id, &id, &id);
        let mut moe = Moe::new(cfg).unwrap();
        let backend = backend();

        // group_min_len = 2, group_max_len = 8.
        for qlen in [0usize, 1, 2, 9] {
            let ids = vec![0u64; qlen.max(1)];
            let weights = vec![1.0f32; qlen.max(1)];
            let input: Vec<f32> = (0..qlen * hidden).map(|i| (i % 19) as f32 * 0.01).collect();
            let mut output = vec![0.0f32; qlen * hidden];
            moe.forward(
                qlen,
                1,
                &ids,
                &weights,
                input.as_ptr() as *const u8,
                output.as_mut_ptr() as *mut u8,
                &backend,
            )
            .unwrap();
            for i in 0..qlen * hidden {
                let want = silu(input[i]) * input[i];
                assert!(
                    (output[i] - want).abs() <= 1e-4 * want.abs().max(1.0),
                    "qlen={qlen} elem {i}"
                );
            }
        }
    }

    #[test]
    fn test_quantized_pipeline_q8() {
        // Q8_0 weights with an F32 hidden state: exercises the input
        // conversion barrier and the blockwise integer kernels.
        let hidden = 256;
        let inter = 128;
        let gate_f = synth_weights(inter, hidden, 4);
        let up_f = synth_weights(inter, hidden, 5);
        let down_f = synth_weights(hidden, inter, 6);

        let quant = |src: &[f32], n: usize| -> Vec<u8> {
            let mut out = vec![0u8; GgmlType::Q8_0.row_bytes(src.len())];
            unsafe { from_float(GgmlType::Q8_0, src.as_ptr(), out.as_mut_ptr(), n) };
            out
        };
        let gate_q = quant(&gate_f, inter * hidden);
        let up_q = quant(&up_f, inter * hidden);
        let down_q = quant(&down_f, hidden * inter);

        let cfg = MoeConfig {
            expert_num: 1,
            routed_expert_num: 1,
            hidden_size: hidden,
            intermediate_size: inter,
            group_min_len: 2,
            group_max_len: 4,
            gate_proj: gate_q.as_ptr() as usize,
            up_proj: up_q.as_ptr() as usize,
            down_proj: down_q.as_ptr() as usize,
            gate_type: GgmlType::Q8_0,
            up_type: GgmlType::Q8_0,
            down_type: GgmlType::Q8_0,
            hidden_type: GgmlType::F32,
            gate_scale: 0,
            up_scale: 0,
            down_scale: 0,
        };
        let moe = Moe::new(cfg).unwrap();
        let backend = backend();

        let input: Vec<f32> = (0..hidden).map(|i| ((i * 3 + 1) % 31) as f32 / 31.0 - 0.5).collect();
        let mut output = vec![0.0f32; hidden];
        moe.forward_one(
            1,
            &[0],
            &[1.0],
            input.as_ptr() as *const u8,
            output.as_mut_ptr() as *mut u8,
            &backend,
        )
        .unwrap();

        // Reference in f32 over the dequantized weights.
        let deq = |q: &[u8], n: usize| -> Vec<f32> {
            let mut out = vec![0.0f32; n];
            unsafe { to_float(GgmlType::Q8_0, q.as_ptr(), out.as_mut_ptr(), n) };
            out
        };
        let gate_d = deq(&gate_q, inter * hidden);
        let up_d = deq(&up_q, inter * hidden);
        let down_d = deq(&down_q, hidden * inter);
        // Account for the Q8_0 re-quantization of the input the engine
        // performs before the gate/up matmuls.
        let mut input_q = vec![0u8; GgmlType::Q8_0.row_bytes(hidden)];
        unsafe { from_float(GgmlType::Q8_0, input.as_ptr(), input_q.as_mut_ptr(), hidden) };
        let input_d = deq(&input_q, hidden);

        let mut interm = vec![0.0f32; inter];
        for r in 0..inter {
            let mut g = 0.0f32;
            let mut u = 0.0f32;
            for c in 0..hidden {
                g += gate_d[r * hidden + c] * input_d[c];
                u += up_d[r * hidden + c] * input_d[c];
            }
            interm[r] = silu(g) * u;
        }
        let mut interm_q = vec![0u8; GgmlType::Q8_0.row_bytes(inter)];
        unsafe { from_float(GgmlType::Q8_0, interm.as_ptr(), interm_q.as_mut_ptr(), inter) };
        let interm_d = deq(&interm_q, inter);
        let mut want = vec![0.0f32; hidden];
        for r in 0..hidden {
            let mut acc = 0.0f32;
            for c in 0..inter {
                acc += down_d[r * inter + c] * interm_d[c];
            }
            want[r] = acc;
        }

        let mut max_rel: f32 = 0.0;
        for i in 0..hidden {
            max_rel = max_rel.max((output[i] - want[i]).abs() / want[i].abs().max(1e-2));
        }
        eprintln!("Q8_0 pipeline vs dequantized reference: max rel {max_rel:.6}");
        assert!(max_rel < 2e-2);
    }

    #[test]
    fn test_warm_up_idempotent() {
        let hidden = 128;
        let id = eye(hidden);
        let cfg = f32_config(1, 1, hidden, hidden, &id, &id, &id);
        let moe = Moe::new(cfg).unwrap();
        let backend = backend();

        moe.warm_up(&backend).unwrap();
        let input: Vec<f32> = (0..hidden).map(|x| x as f32 * 0.01).collect();
        let run = |moe: &Moe| -> Vec<f32> {
            let mut out = vec![0.0f32; hidden];
            moe.forward_one(
                1,
                &[0],
                &[1.0],
                input.as_ptr() as *const u8,
                out.as_mut_ptr() as *mut u8,
                &backend,
            )
            .unwrap();
            out
        };
        let first = run(&moe);
        moe.warm_up(&backend).unwrap();
        let second = run(&moe);
        assert_eq!(first, second);
    }

    #[test]
    fn test_get_weight_round_trips_bytes() {
        let hidden = 128;
        let inter = 256;
        let experts = 2;
        let gate = synth_weights(experts * inter, hidden, 7);
        let up = synth_weights(experts * inter, hidden, 8);
        let down = synth_weights(experts * hidden, inter, 9);
        let cfg = f32_config(experts, 2, hidden, inter, &gate, &up, &down);
        let moe = Moe::new(cfg).unwrap();
        let backend = backend();

        for e in 0..experts {
            let mut g = vec![0u8; inter * hidden * 4];
            let mut u = vec![0u8; inter * hidden * 4];
            let mut d = vec![0u8; hidden * inter * 4];
            moe.get_weight(e, g.as_mut_ptr(), u.as_mut_ptr(), d.as_mut_ptr(), &backend);

            let gate_bytes = unsafe {
                std::slice::from_raw_parts(
                    (gate.as_ptr() as *const u8).add(e * inter * hidden * 4),
                    inter * hidden * 4,
                )
            };
            assert_eq!(&g[..], gate_bytes, "expert {e} gate bytes");
            let up_bytes = unsafe {
                std::slice::from_raw_parts(
                    (up.as_ptr() as *const u8).add(e * inter * hidden * 4),
                    inter * hidden * 4,
                )
            };
            assert_eq!(&u[..], up_bytes, "expert {e} up bytes");
            let down_bytes = unsafe {
                std::slice::from_raw_parts(
                    (down.as_ptr() as *const u8).add(e * hidden * inter * 4),
                    hidden * inter * 4,
                )
            };
            assert_eq!(&d[..], down_bytes, "expert {e} down bytes");
        }
    }
}
