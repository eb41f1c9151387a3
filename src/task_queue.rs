//! Serializing task queue.
//!
//! A single consumer thread drains an unbounded FIFO of
//! `(task_id, callback)` pairs. The per-id sync flag flips to pending
//! at enqueue and back to done when the callback returns; `sync`
//! spin-waits on it. Task ids are allocated by the caller in
//! `[0, max_task_num)` and may be reused only after their `sync` has
//! returned.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::backend::{backoff, DEFAULT_SPIN_LIMIT};
use crate::trace::{self, Category};

type Task = Box<dyn FnOnce() + Send>;

struct Shared {
    queue: Mutex<VecDeque<(usize, Task)>>,
    cv: Condvar,
    sync_flags: Vec<AtomicBool>,
    exit: AtomicBool,
    spin_limit: u64,
}

pub struct TaskQueue {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl TaskQueue {
    pub fn new(max_task_num: usize) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            sync_flags: (0..max_task_num).map(|_| AtomicBool::new(true)).collect(),
            exit: AtomicBool::new(false),
            spin_limit: DEFAULT_SPIN_LIMIT,
        });
        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("mixis-taskqueue".to_string())
            .spawn(move || process_tasks(worker_shared))
            .expect("spawn task queue thread");
        TaskQueue {
            shared,
            worker: Some(worker),
        }
    }

    /// Enqueue `task` under `task_id` and mark the id pending.
    pub fn enqueue(&self, task_id: usize, task: impl FnOnce() + Send + 'static) {
        trace::event_begin(Category::TaskQueue, "enque");
        {
            let mut queue = self.shared.queue.lock().unwrap();
            queue.push_back((task_id, Box::new(task)));
            self.shared.sync_flags[task_id].store(false, Ordering::SeqCst);
        }
        self.shared.cv.notify_one();
    }

    /// Block until the task enqueued under `task_id` has returned.
    pub fn sync(&self, task_id: usize) {
        let mut sleepy = 0u64;
        while !self.shared.sync_flags[task_id].load(Ordering::SeqCst) {
            backoff(&mut sleepy, self.shared.spin_limit);
        }
        trace::event_end(Category::TaskQueue);
    }

    pub fn max_task_num(&self) -> usize {
        self.shared.sync_flags.len()
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.shared.exit.store(true, Ordering::SeqCst);
        self.shared.cv.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn process_tasks(shared: Arc<Shared>) {
    loop {
        let (task_id, task) = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if let Some(entry) = queue.pop_front() {
                    break entry;
                }
                if shared.exit.load(Ordering::SeqCst) {
                    return;
                }
                queue = shared.cv.wait(queue).unwrap();
            }
        };
        task();
        shared.sync_flags[task_id].store(true, Ordering::SeqCst);
    }
}
