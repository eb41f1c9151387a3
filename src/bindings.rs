//! Python bindings.
//!
//! Mirrors the engine's host-bridge surface: a `CpuInfer` handle
//! owning the pool and the task queue, a `MoeConfig` record, and a
//! `Moe` class whose operations are enqueued under caller-allocated
//! task ids and awaited with `CpuInfer.sync`. Tensor data crosses the
//! boundary as raw addresses (`tensor.data_ptr()`); the caller must
//! keep every buffer alive until the matching `sync` returns.

use std::sync::{Arc, Mutex};

use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;

use crate::cpuinfer;
use crate::ggml::GgmlType;
use crate::moe;

#[pyclass]
pub struct CpuInfer {
    inner: Arc<cpuinfer::CpuInfer>,
}

#[pymethods]
impl CpuInfer {
    #[new]
    #[pyo3(signature = (thread_num, max_task_num=1024))]
    fn new(thread_num: usize, max_task_num: usize) -> Self {
        CpuInfer {
            inner: Arc::new(cpuinfer::CpuInfer::new(thread_num, max_task_num)),
        }
    }

    fn start_trace(&self, path: &str) -> PyResult<()> {
        self.inner
            .start_trace(path)
            .map_err(|e| PyRuntimeError::new_err(format!("start_trace: {e}")))
    }

    fn end_trace(&self) {
        self.inner.end_trace();
    }

    fn sync(&self, task_id: usize) {
        self.inner.sync(task_id);
    }

    fn lock(&self) {
        self.inner.lock();
    }

    fn unlock(&self) {
        self.inner.unlock();
    }
}

#[pyclass(name = "MoeConfig")]
#[derive(Clone)]
pub struct MoeConfigPy {
    cfg: moe::MoeConfig,
}

#[pymethods]
impl MoeConfigPy {
    #[new]
    #[pyo3(signature = (
        expert_num, routed_expert_num, hidden_size, intermediate_size,
        group_min_len, group_max_len,
        gate_proj, up_proj, down_proj,
        gate_type, up_type, down_type, hidden_type,
        gate_scale=0, up_scale=0, down_scale=0,
    ))]
    #[allow(clippy::too_many_arguments)]
    fn new(
        expert_num: usize,
        routed_expert_num: usize,
        hidden_size: usize,
        intermediate_size: usize,
        group_min_len: usize,
        group_max_len: usize,
        gate_proj: usize,
        up_proj: usize,
        down_proj: usize,
        gate_type: u32,
        up_type: u32,
        down_type: u32,
        hidden_type: u32,
        gate_scale: usize,
        up_scale: usize,
        down_scale: usize,
    ) -> PyResult<Self> {
        let parse = |v: u32| {
            GgmlType::from_u32(v)
                .map_err(|t| PyValueError::new_err(format!("unknown format tag {t}")))
        };
        Ok(MoeConfigPy {
            cfg: moe::MoeConfig {
                expert_num,
                routed_expert_num,
                hidden_size,
                intermediate_size,
                group_min_len,
                group_max_len,
                gate_proj,
                up_proj,
                down_proj,
                gate_type: parse(gate_type)?,
                up_type: parse(up_type)?,
                down_type: parse(down_type)?,
                hidden_type: parse(hidden_type)?,
                gate_scale,
                up_scale,
                down_scale,
            },
        })
    }
}

#[pyclass]
pub struct Moe {
    inner: Arc<Mutex<moe::Moe>>,
}

fn fatal(op: &str, err: moe::MoeError) -> ! {
    log::error!("{op}: {err}");
    std::process::exit(1);
}

#[pymethods]
impl Moe {
    #[new]
    fn new(config: MoeConfigPy) -> PyResult<Self> {
        let inner = moe::Moe::new(config.cfg)
            .map_err(|e| PyRuntimeError::new_err(format!("invalid MoE config: {e}")))?;
        Ok(Moe {
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    /// Enqueue a warm-up pass over every expert.
    fn warm_up(&self, infer: &CpuInfer, task_id: usize) {
        let moe = self.inner.clone();
        let backend = infer.inner.backend().clone();
        infer.inner.submit(task_id, move || {
            let moe = moe.lock().unwrap();
            if let Err(e) = moe.warm_up(&backend) {
                fatal("warm_up", e);
            }
        });
    }

    /// Enqueue a forward pass. `expert_ids` / `weights` / `input` /
    /// `output` are raw addresses of `u64[qlen*k]`, `f32[qlen*k]`, and
    /// the two `hidden_type[qlen*hidden]` buffers.
    #[pyo3(signature = (infer, task_id, qlen, k, expert_ids, weights, input, output))]
    #[allow(clippy::too_many_arguments)]
    fn forward(
        &self,
        infer: &CpuInfer,
        task_id: usize,
        qlen: usize,
        k: usize,
        expert_ids: usize,
        weights: usize,
        input: usize,
        output: usize,
    ) {
        let moe = self.inner.clone();
        let backend = infer.inner.backend().clone();
        infer.inner.submit(task_id, move || {
            let mut moe = moe.lock().unwrap();
            // SAFETY: the Python caller keeps these buffers alive
            // until sync(task_id) returns.
            let ids = unsafe { std::slice::from_raw_parts(expert_ids as *const u64, qlen * k) };
            let w = unsafe { std::slice::from_raw_parts(weights as *const f32, qlen * k) };
            if let Err(e) =
                moe.forward(qlen, k, ids, w, input as *const u8, output as *mut u8, &backend)
            {
                fatal("forward", e);
            }
        });
    }

    /// Enqueue a NUMA-aware gather of one expert's weight matrices.
    #[pyo3(signature = (infer, task_id, expert, gate_proj, up_proj, down_proj))]
    fn get_weight(
        &self,
        infer: &CpuInfer,
        task_id: usize,
        expert: usize,
        gate_proj: usize,
        up_proj: usize,
        down_proj: usize,
    ) {
        let moe = self.inner.clone();
        let backend = infer.inner.backend().clone();
        infer.inner.submit(task_id, move || {
            let moe = moe.lock().unwrap();
            moe.get_weight(
                expert,
                gate_proj as *mut u8,
                up_proj as *mut u8,
                down_proj as *mut u8,
                &backend,
            );
        });
    }
}

#[pymodule]
fn mixis(m: &Bound<'_, PyModule>) -> PyResult<()> {
    let _ = env_logger::try_init();
    m.add_class::<CpuInfer>()?;
    m.add_class::<MoeConfigPy>()?;
    m.add_class::<Moe>()?;
    Ok(())
}
