//! Host runtime layer.
//!
//! This module defines the hook API the engine consumes and ships an
//! in-memory reference host.

pub mod memory;
pub mod traits;

pub use memory::{CapturedState, MapFrame, MemoryCaptureSink, ProgramImage, RunOutcome, SimulatedHost, Step};
pub use traits::{CaptureRef, CaptureRequest, CaptureSink, CodeInfo, Frame, HostRuntime};
