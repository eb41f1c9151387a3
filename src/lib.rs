//! mixis — CPU compute core for expert-parallel MoE inference.
//!
//! Executes the SwiGLU expert feed-forward block for routed tokens on
//! a multi-socket CPU host: a pinned worker pool with stripe barriers,
//! a family of quantized `C = Aᵀ·B` micro-kernels, and the per-layer
//! orchestrator that composes them. The GPU side of the model, the
//! router, and weight loading live elsewhere; weights arrive as raw
//! host pointers.

pub mod backend;
pub mod cpuinfer;
pub mod ggml;
pub mod kernel;
pub mod moe;
pub mod numa;
pub mod shared_mem;
pub mod task_queue;
pub mod trace;

#[cfg(feature = "python")]
mod bindings;
