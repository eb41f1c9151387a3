//! Pinned worker pool with one-shot and striped dispatch.
//!
//! `run` executes a parallel kernel over N logical tasks and returns
//! once every task has completed. Workers are OS threads pinned at
//! startup (one logical CPU each, or one NUMA node each on multi-node
//! hosts) and never migrate. Dispatch is lock-free: the caller flips
//! per-worker status atomics, workers flip them back.
//!
//! The pool also owns two arrays of stripe atomics that kernels use as
//! phase barriers inside a single dispatch (input conversion and the
//! per-expert gate/up → down rendezvous). They are reused across
//! dispatches; every participating stripe must zero its own entry
//! before signalling.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::numa;
use crate::trace::{self, Category};

/// Width of the input-conversion barrier (max conversion stripes).
pub const MAX_STRIPES: usize = 64;
/// Depth of the per-expert barrier (max routed experts per token).
pub const MAX_ROUTED_EXPERTS: usize = 8;

const WAITING: u8 = 0;
const WORKING: u8 = 1;
const EXIT: u8 = 2;

/// Idle iterations before a spinner backs off to 1 ms sleeps.
/// Roughly one second of spinning at 4.4 GHz.
pub const DEFAULT_SPIN_LIMIT: u64 = 4_400_000_000;

/// Spin-then-sleep backoff shared by every waiter in the crate.
#[inline]
pub(crate) fn backoff(sleepy: &mut u64, limit: u64) {
    *sleepy += 1;
    if *sleepy >= limit {
        std::thread::sleep(std::time::Duration::from_millis(1));
    } else {
        std::hint::spin_loop();
    }
}

#[repr(align(64))]
struct ThreadState {
    status: AtomicU8,
    curr: AtomicUsize,
    end: AtomicUsize,
}

type RawTask = *const (dyn Fn(usize) + Sync);

#[derive(Clone, Copy)]
struct Kernel {
    init: Option<RawTask>,
    compute: Option<RawTask>,
    finalize: Option<RawTask>,
}

struct KernelSlot(UnsafeCell<Kernel>);

// SAFETY: the slot is written only while every worker is WAITING and
// read only by workers observing WORKING (release/acquire on status),
// so accesses never overlap.
unsafe impl Sync for KernelSlot {}

struct Inner {
    max_thread_num: usize,
    /// Threads participating in the current dispatch.
    thread_num: AtomicUsize,
    one_shot: AtomicBool,
    /// >1 switches dispatch to NUMA mode (always all threads).
    numa_nodes: usize,
    spin_limit: u64,
    thread_state: Vec<ThreadState>,
    kernel: KernelSlot,
    /// Per-stripe barrier for the input-conversion phase.
    input_conv_syn: Vec<AtomicU32>,
    /// Per-(expert, stripe) barrier between gate/up/act and down.
    interm_conv_grp_syn: Vec<Vec<AtomicU32>>,
}

// SAFETY: the raw task pointers in `kernel` are only dereferenced
// under the dispatch protocol described on KernelSlot.
unsafe impl Send for Inner {}
unsafe impl Sync for Inner {}

/// Fixed-size pool of pinned worker threads.
pub struct Backend {
    inner: Arc<Inner>,
    workers: Vec<JoinHandle<()>>,
}

impl Backend {
    pub fn new(max_thread_num: usize) -> Self {
        Self::with_spin_limit(max_thread_num, DEFAULT_SPIN_LIMIT)
    }

    pub fn with_spin_limit(max_thread_num: usize, spin_limit: u64) -> Self {
        let max_thread_num = max_thread_num.max(1);
        let topo = numa::topology();
        let numa_nodes = topo.num_nodes;

        let thread_state = (0..max_thread_num)
            .map(|_| ThreadState {
                status: AtomicU8::new(WAITING),
                curr: AtomicUsize::new(0),
                end: AtomicUsize::new(0),
            })
            .collect();

        let inner = Arc::new(Inner {
            max_thread_num,
            thread_num: AtomicUsize::new(max_thread_num),
            one_shot: AtomicBool::new(false),
            numa_nodes,
            spin_limit,
            thread_state,
            kernel: KernelSlot(UnsafeCell::new(Kernel {
                init: None,
                compute: None,
                finalize: None,
            })),
            input_conv_syn: (0..MAX_STRIPES).map(|_| AtomicU32::new(0)).collect(),
            interm_conv_grp_syn: (0..MAX_ROUTED_EXPERTS)
                .map(|_| (0..MAX_STRIPES).map(|_| AtomicU32::new(0)).collect())
                .collect(),
        });

        let workers = (0..max_thread_num)
            .map(|i| {
                let inner = inner.clone();
                std::thread::Builder::new()
                    .name(format!("mixis-worker-{i}"))
                    .spawn(move || worker_loop(inner, i))
                    .expect("spawn worker thread")
            })
            .collect();

        log::info!("worker pool: {max_thread_num} threads, {numa_nodes} NUMA node(s)");
        Backend { inner, workers }
    }

    pub fn thread_num(&self) -> usize {
        self.inner.max_thread_num
    }

    /// Stripe barrier for the input-conversion phase.
    pub fn input_conv_syn(&self) -> &[AtomicU32] {
        &self.inner.input_conv_syn
    }

    /// Stripe barrier row for one routed expert slot.
    pub fn interm_conv_grp_syn(&self, expert_idx: usize) -> &[AtomicU32] {
        &self.inner.interm_conv_grp_syn[expert_idx]
    }

    /// Run `compute` over `task_num` tasks and block until all have
    /// completed. `init`/`finalize` run once per participating worker,
    /// before its first and after its last task.
    ///
    /// One-shot mode (`task_num <= thread count`) hands each task to a
    /// distinct worker as its thread id; striped mode pre-slices the
    /// task range per worker, and each worker advances only its own
    /// `curr` counter. Concurrent dispatches are not allowed: this is
    /// a single-producer protocol, externally serialized.
    pub fn run(
        &self,
        task_num: usize,
        init: Option<&(dyn Fn(usize) + Sync)>,
        compute: &(dyn Fn(usize) + Sync),
        finalize: Option<&(dyn Fn(usize) + Sync)>,
    ) {
        if task_num == 0 {
            return;
        }
        let inner = &*self.inner;

        // SAFETY: the pointers are cleared before `run` returns, and
        // `run` does not return until every participating worker is
        // back to WAITING, so the borrows outlive all uses.
        fn erase(f: &(dyn Fn(usize) + Sync)) -> RawTask {
            unsafe { std::mem::transmute::<&(dyn Fn(usize) + Sync), RawTask>(f) }
        }
        let kernel = Kernel {
            init: init.map(erase),
            compute: Some(erase(compute)),
            finalize: finalize.map(erase),
        };
        unsafe { *inner.kernel.0.get() = kernel };

        // NUMA mode always engages every thread so node binding stays
        // stable; otherwise idle threads are left out.
        let thread_num = if inner.numa_nodes > 1 {
            inner.max_thread_num
        } else {
            inner.max_thread_num.min(task_num)
        };
        inner.thread_num.store(thread_num, Ordering::Relaxed);

        let one_shot = task_num <= inner.max_thread_num;
        inner.one_shot.store(one_shot, Ordering::Relaxed);

        if one_shot {
            for i in 0..thread_num.min(task_num) {
                inner.thread_state[i].status.store(WORKING, Ordering::Release);
            }
        } else {
            let base = task_num / thread_num;
            let remain = task_num % thread_num;
            let mut start = 0usize;
            for (i, state) in inner.thread_state[..thread_num].iter().enumerate() {
                let end = start + base + usize::from(i < remain);
                state.curr.store(start, Ordering::Relaxed);
                state.end.store(end, Ordering::Relaxed);
                state.status.store(WORKING, Ordering::Release);
                start = end;
            }
        }

        for state in &inner.thread_state[..thread_num] {
            let mut sleepy = 0u64;
            while state.status.load(Ordering::Acquire) == WORKING {
                backoff(&mut sleepy, inner.spin_limit);
            }
        }

        unsafe {
            *inner.kernel.0.get() = Kernel {
                init: None,
                compute: None,
                finalize: None,
            };
        }
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        for state in &self.inner.thread_state {
            state.status.store(EXIT, Ordering::Release);
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(inner: Arc<Inner>, thread_id: usize) {
    if inner.numa_nodes > 1 {
        let node = thread_id * inner.numa_nodes / inner.max_thread_num;
        let ok = numa::bind_to_node(node);
        log::debug!("worker {thread_id}: bound to NUMA node {node} ({ok})");
    } else {
        let cpus = numa::topology().num_cpus;
        let cpu = thread_id % cpus;
        let ok = numa::pin_to_cpu(cpu);
        log::debug!("worker {thread_id}: pinned to cpu {cpu} ({ok})");
    }

    let mut sleepy = 0u64;
    loop {
        match inner.thread_state[thread_id].status.load(Ordering::Acquire) {
            WORKING => {
                sleepy = 0;
                process_tasks(&inner, thread_id);
            }
            WAITING => backoff(&mut sleepy, inner.spin_limit),
            _ => return, // EXIT
        }
    }
}

fn process_tasks(inner: &Inner, thread_id: usize) {
    // SAFETY: reading the slot is ordered after the dispatcher's writes
    // by the acquire load of WORKING.
    let kernel = unsafe { *inner.kernel.0.get() };

    if let Some(init) = kernel.init {
        unsafe { (&*init)(thread_id) };
    }

    if let Some(compute) = kernel.compute {
        if inner.one_shot.load(Ordering::Relaxed) {
            trace::event_begin(Category::Schedule, "own");
            unsafe { (&*compute)(thread_id) };
            trace::event_end(Category::Schedule);
        } else {
            let state = &inner.thread_state[thread_id];
            loop {
                // Only this thread touches its own counter; acq_rel so a
                // claimed task id also orders the dispatcher's writes.
                let task_id = state.curr.fetch_add(1, Ordering::AcqRel);
                if task_id >= state.end.load(Ordering::Relaxed) {
                    break;
                }
                trace::event_begin(Category::Schedule, "own");
                unsafe { (&*compute)(task_id) };
                trace::event_end(Category::Schedule);
            }
        }
    }

    if let Some(finalize) = kernel.finalize {
        unsafe { (&*finalize)(thread_id) };
    }

    inner.thread_state[thread_id]
        .status
        .store(WAITING, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_one_shot_each_task_once() {
        let backend = Backend::with_spin_limit(16, 10_000);
        let hits: Vec<AtomicUsize> = (0..8).map(|_| AtomicUsize::new(0)).collect();
        backend.run(
            8,
            None,
            &|task_id| {
                hits[task_id].fetch_add(1, Ordering::Relaxed);
            },
            None,
        );
        for (i, h) in hits.iter().enumerate() {
            assert_eq!(h.load(Ordering::Relaxed), 1, "task {i}");
        }
    }

    #[test]
    fn test_striped_fan_out() {
        let backend = Backend::with_spin_limit(16, 10_000);
        let nth = backend.thread_num();
        let hits: Vec<AtomicUsize> = (0..100).map(|_| AtomicUsize::new(0)).collect();
        let inits = AtomicUsize::new(0);
        let finals = AtomicUsize::new(0);
        backend.run(
            100,
            Some(&|_ith| {
                inits.fetch_add(1, Ordering::Relaxed);
            }),
            &|task_id| {
                hits[task_id].fetch_add(1, Ordering::Relaxed);
            },
            Some(&|_ith| {
                finals.fetch_add(1, Ordering::Relaxed);
            }),
        );
        let total: usize = hits.iter().map(|h| h.load(Ordering::Relaxed)).sum();
        assert_eq!(total, 100);
        for (i, h) in hits.iter().enumerate() {
            assert_eq!(h.load(Ordering::Relaxed), 1, "task {i} ran more than once");
        }
        // Every participating worker ran init and finalize exactly once,
        // and each owned a contiguous slab of 6 or 7 tasks.
        assert_eq!(inits.load(Ordering::Relaxed), nth);
        assert_eq!(finals.load(Ordering::Relaxed), nth);
        let base = 100 / nth;
        let remain = 100 % nth;
        for i in 0..nth {
            let duty = base + usize::from(i < remain);
            assert!(duty == 6 || duty == 7);
        }
    }

    #[test]
    fn test_repeated_dispatches() {
        let backend = Backend::with_spin_limit(4, 10_000);
        let counter = AtomicUsize::new(0);
        for _ in 0..50 {
            backend.run(
                13,
                None,
                &|_| {
                    counter.fetch_add(1, Ordering::Relaxed);
                },
                None,
            );
        }
        assert_eq!(counter.load(Ordering::Relaxed), 50 * 13);
    }

    #[test]
    fn test_stripe_barrier_within_dispatch() {
        // Every task publishes its stripe then waits for the whole
        // group; afterwards it must observe every other stripe's write.
        let backend = Backend::with_spin_limit(8, 10_000);
        let nth = 8;
        let seen = AtomicUsize::new(0);
        let syn = backend.input_conv_syn();
        for s in &syn[..nth] {
            s.store(0, Ordering::Relaxed);
        }
        backend.run(
            nth,
            None,
            &|ith| {
                syn[ith].store(1, Ordering::Release);
                for other in &syn[..nth] {
                    while other.load(Ordering::Acquire) == 0 {
                        std::hint::spin_loop();
                    }
                }
                seen.fetch_add(nth, Ordering::Relaxed);
            },
            None,
        );
        assert_eq!(seen.load(Ordering::Relaxed), nth * nth);
    }

    #[test]
    fn test_zero_tasks_returns_immediately() {
        let backend = Backend::with_spin_limit(4, 10_000);
        backend.run(0, None, &|_| panic!("must not run"), None);
    }
}
