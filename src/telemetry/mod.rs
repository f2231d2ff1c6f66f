//! Telemetry for the control plane.
//!
//! Limiter decisions, breaker transitions and upstream outcomes are emitted as
//! [`ControlEvent`]s into a [`TelemetrySink`], a `tower::Service<ControlEvent>`. Emission is
//! best effort: a slow or failing sink never changes a gating decision.
//!
//! Sinks shipped here: [`NullSink`] (default), [`LogSink`] and [`MemorySink`]. The
//! `quotaguard-jsonl` crate appends events to a file.

pub mod events;
pub mod sinks;

pub use events::{CircuitEvent, ControlEvent, RateLimitEvent, UpstreamEvent};
pub use sinks::{emit_best_effort, BoxSinkFuture, LogSink, MemorySink, NullSink, TelemetrySink};
pub(crate) use sinks::emit;
