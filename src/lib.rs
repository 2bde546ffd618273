//! Analysis of Triton kernel compilation/launch traces.
//!
//! The crate consumes newline-delimited JSON traces emitted by an external
//! instrumentation layer and provides:
//!
//! - [`sourcemap`]: per-line mappings from generated artifacts (SASS, PTX,
//!   TTIR/TTGIR) back to the original kernel source,
//! - [`correlate`]: strict matching of a launch event to its unique
//!   compilation event via the content hash,
//! - [`args`]: rehydration of recorded kernel arguments, loading persisted
//!   tensor blobs or synthesizing type-correct random buffers,
//! - [`blob`]: integrity-checked, content-addressed tensor blob storage,
//! - [`ir_analysis`]: structural analysis of the lowered IR (loop nests,
//!   pipelining schedules, AMD memory-op counts),
//! - [`repro`]: assembly of the context bundle handed to the external
//!   reproducer generator.

pub mod args;
pub mod blob;
pub mod correlate;
pub mod dtype;
pub mod ir_analysis;
pub mod repro;
pub mod sourcemap;
pub mod tensor;
pub mod trace;

pub use args::{ArgValue, ArgumentDescriptor, Capabilities, Synthesizer};
pub use correlate::{correlate, extract_kernel_info, KernelInfo};
pub use dtype::{Device, Dtype};
pub use ir_analysis::{find_inner_loop_bounds, find_loop_bounds, LoopBounds};
pub use repro::{build_context_bundle, ContextBundle};
pub use sourcemap::{Dialect, SourceMap, SourceMapping};
pub use tensor::TensorBuffer;
pub use trace::{EventType, TraceEvent};
