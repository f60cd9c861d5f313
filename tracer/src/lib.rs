//! Memory-trace tracer.
//!
//! Every application basic block is instrumented to append compact
//! instruction-fetch and memory-reference entries to a thread-local buffer.
//! When the write pointer crosses into the sentinel-filled redzone behind the
//! buffer, inline code branches into a clean call that drains the buffer to a
//! per-thread file (offline mode) or to the named pipe shared with the online
//! simulator. An optional inline direct-mapped cache filter suppresses
//! entries the innermost simulated cache would absorb anyway.
//!
//! The tracer core is a single [`Tracer`] context created at process init;
//! per-thread state lives in [`PerThread`] values owned by the host's TLS
//! field and handed into every callback.

pub mod buffer;
pub mod drain;
pub mod emitter;
pub mod entry;
pub mod instru;
pub mod lifecycle;
pub mod options;

pub use buffer::{OwnedBuffer, PerThread, TraceBuffer};
pub use emitter::{BlockData, MAX_NUM_DELAY_INSTRS};
pub use entry::{TraceType, TRACE_ENTRY_SIZE};
pub use instru::{Instru, InstruField, OfflineInstru, OnlineInstru};
pub use lifecycle::{Collaborators, HandoffFn, Tracer, DRAIN_CALLEE};
pub use options::Options;

use std::path::PathBuf;

/// Max number of entries one buffer holds between clean calls.
pub const MAX_NUM_ENTRIES: usize = 4096;

/// Entry slots reserved at the buffer start for the unit header.
pub const BUF_HDR_SLOTS: usize = 1;

#[derive(Debug, thiserror::Error)]
pub enum TracerError {
    #[error("usage error: {0}")]
    Usage(&'static str),

    #[error("failed to create a unique output directory under {0}")]
    OutputDir(PathBuf),

    #[error("cache filter geometry must have a power-of-two line count")]
    FilterGeometry,

    #[error("i/o error")]
    Io(#[from] std::io::Error),
}
