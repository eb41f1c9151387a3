//! Enqueue façade: one worker pool plus one serializing task queue.
//!
//! External callers enqueue MoE calls under caller-allocated task ids
//! and block on `sync`. `lock`/`unlock` optionally serialize bursts of
//! submissions from multiple producers; the guard must survive across
//! FFI calls, so it is a spin lock rather than a mutex guard.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::backend::{backoff, Backend, DEFAULT_SPIN_LIMIT};
use crate::task_queue::TaskQueue;
use crate::trace;

pub struct CpuInfer {
    backend: Arc<Backend>,
    task_queue: TaskQueue,
    burst_lock: AtomicBool,
}

impl CpuInfer {
    pub fn new(thread_num: usize, max_task_num: usize) -> CpuInfer {
        CpuInfer {
            backend: Arc::new(Backend::new(thread_num)),
            task_queue: TaskQueue::new(max_task_num),
            burst_lock: AtomicBool::new(false),
        }
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    /// Enqueue a callback under `task_id`. Callbacks run strictly in
    /// insertion order on the queue's consumer thread.
    pub fn submit(&self, task_id: usize, task: impl FnOnce() + Send + 'static) {
        self.task_queue.enqueue(task_id, task);
    }

    /// Block until task `task_id`'s callback has returned.
    pub fn sync(&self, task_id: usize) {
        self.task_queue.sync(task_id);
    }

    /// Serialize a burst of submissions.
    pub fn lock(&self) {
        let mut sleepy = 0u64;
        while self
            .burst_lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            backoff(&mut sleepy, DEFAULT_SPIN_LIMIT);
        }
    }

    pub fn unlock(&self) {
        self.burst_lock.store(false, Ordering::Release);
    }

    pub fn start_trace(&self, path: &str) -> std::io::Result<()> {
        trace::start_trace(path)
    }

    pub fn end_trace(&self) {
        trace::end_trace();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ggml::GgmlType;
    use crate::moe::{Moe, MoeConfig};
    use std::sync::Mutex;

    #[test]
    fn test_submit_sync_round_trip() {
        let infer = CpuInfer::new(2, 8);
        let flag = Arc::new(AtomicBool::new(false));
        let f = flag.clone();
        infer.submit(3, move || f.store(true, Ordering::SeqCst));
        infer.sync(3);
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn test_lock_unlock() {
        let infer = CpuInfer::new(1, 1);
        infer.lock();
        infer.unlock();
        infer.lock();
        infer.unlock();
    }

    #[test]
    fn test_moe_through_queue() {
        // End to end: an identity expert submitted through the queue.
        let hidden = 128;
        let mut id = vec![0.0f32; hidden * hidden];
        for i in 0..hidden {
            id[i * hidden + i] = 1.0;
        }
        let cfg = MoeConfig {
            expert_num: 1,
            routed_expert_num: 1,
            hidden_size: hidden,
            intermediate_size: hidden,
            group_min_len: 2,
            group_max_len: 4,
            gate_proj: id.as_ptr() as usize,
            up_proj: id.as_ptr() as usize,
            down_proj: id.as_ptr() as usize,
            gate_type: GgmlType::F32,
            up_type: GgmlType::F32,
            down_type: GgmlType::F32,
            hidden_type: GgmlType::F32,
            gate_scale: 0,
            up_scale: 0,
            down_scale: 0,
        };
        let infer = CpuInfer::new(4, 4);
        let moe = Arc::new(Mutex::new(Moe::new(cfg).unwrap()));

        let input: Vec<f32> = (0..hidden).map(|x| x as f32 * 0.02).collect();
        let mut output = vec![0.0f32; hidden];
        let ids = [0u64];
        let weights = [1.0f32];

        let backend = infer.backend().clone();
        let moe2 = moe.clone();
        let in_addr = input.as_ptr() as usize;
        let out_addr = output.as_mut_ptr() as usize;
        let ids_addr = ids.as_ptr() as usize;
        let w_addr = weights.as_ptr() as usize;
        infer.submit(0, move || {
            let moe = moe2.lock().unwrap();
            // SAFETY: the caller keeps the buffers alive across sync().
            let ids = unsafe { std::slice::from_raw_parts(ids_addr as *const u64, 1) };
            let w = unsafe { std::slice::from_raw_parts(w_addr as *const f32, 1) };
            moe.forward_one(1, ids, w, in_addr as *const u8, out_addr as *mut u8, &backend)
                .unwrap();
        });
        infer.sync(0);

        for i in 0..hidden {
            let x = input[i];
            let want = x / (1.0 + (-x).exp()) * x;
            assert!((output[i] - want).abs() <= 1e-5 * want.abs().max(1.0));
        }
    }
}
