//! Per-thread trace buffers with a sentinel redzone.
//!
//! A buffer is `trace_buf_size` writable bytes followed by `redzone_size`
//! bytes pre-filled with a non-zero sentinel. Inline code appends entries and
//! checks the word at the write pointer: zero means room remains, non-zero
//! means the pointer has crossed into the redzone and the buffer must drain.

use std::io::Write;

use runtime_api::{RawTls, TlsOffset, TLS_OFFS_BUF_PTR, TLS_SLOT_COUNT};

use crate::lifecycle::Tracer;

pub(crate) const REDZONE_SENTINEL: u8 = 0xff;

/// Heap storage for one trace buffer. The storage never moves, so the
/// address inline code holds in the TLS buffer-pointer slot stays valid for
/// the buffer's lifetime.
#[derive(Debug)]
pub struct TraceBuffer {
    bytes: Box<[u8]>,
}

impl TraceBuffer {
    pub(crate) fn new(bytes: Box<[u8]>) -> TraceBuffer {
        TraceBuffer { bytes }
    }

    /// Address of the first byte, as generated code sees it.
    pub fn base(&self) -> u64 {
        self.bytes.as_ptr() as u64
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn into_bytes(self) -> Box<[u8]> {
        self.bytes
    }
}

/// A drained buffer whose ownership moved to the handoff callback, together
/// with the byte range holding trace data.
pub struct OwnedBuffer {
    pub bytes: Box<[u8]>,
    pub start: usize,
    pub end: usize,
}

impl OwnedBuffer {
    pub fn data(&self) -> &[u8] {
        &self.bytes[self.start..self.end]
    }
}

/// State owned by one instrumented thread.
pub struct PerThread {
    pub(crate) tls: RawTls,
    tid: u32,
    pub(crate) buf: Option<TraceBuffer>,
    pub(crate) reserve_buf: Option<TraceBuffer>,
    pub(crate) num_buffers: u32,
    pub(crate) num_refs: u64,
    pub(crate) bytes_written: u64,
    pub(crate) file: Option<Box<dyn Write + Send>>,
    pub(crate) init_header_size: usize,
    pub(crate) l0_dcache: Option<Box<[u64]>>,
    pub(crate) l0_icache: Option<Box<[u64]>>,
}

impl PerThread {
    pub(crate) fn new(tid: u32) -> PerThread {
        PerThread {
            tls: RawTls::new(TLS_SLOT_COUNT),
            tid,
            buf: None,
            reserve_buf: None,
            num_buffers: 0,
            num_refs: 0,
            bytes_written: 0,
            file: None,
            init_header_size: 0,
            l0_dcache: None,
            l0_icache: None,
        }
    }

    pub fn tid(&self) -> u32 {
        self.tid
    }

    pub fn num_refs(&self) -> u64 {
        self.num_refs
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn buffer(&self) -> Option<&TraceBuffer> {
        self.buf.as_ref()
    }

    /// Current buffer write pointer, as held in the TLS slot.
    pub fn buffer_pointer(&self) -> u64 {
        self.tls.get(TLS_OFFS_BUF_PTR)
    }

    pub fn tls_slot(&self, offs: TlsOffset) -> u64 {
        self.tls.get(offs)
    }

    /// Byte offset of the write pointer inside the current buffer.
    pub fn write_offset(&self) -> usize {
        let base = self.buf.as_ref().map(TraceBuffer::base).unwrap_or(0);
        (self.buffer_pointer() - base) as usize
    }

    /// Append bytes at the write pointer and advance it, the way inline
    /// code does. `f` writes into the tail slice and returns the byte count.
    pub fn append(&mut self, f: impl FnOnce(&mut [u8]) -> usize) {
        let Some(buf) = self.buf.as_mut() else {
            return;
        };
        let base = buf.base();
        let offs = (self.tls.get(TLS_OFFS_BUF_PTR) - base) as usize;
        let written = f(&mut buf.bytes_mut()[offs..]);
        self.tls.set(TLS_OFFS_BUF_PTR, base + (offs + written) as u64);
    }
}

impl Tracer {
    /// Allocate (or, on allocation failure, fall back to the reserve) the
    /// thread's current buffer.
    pub(crate) fn create_buffer(&self, data: &mut PerThread) {
        let trace_buf_size = self.trace_buf_size;
        match self.allocator.alloc_raw(self.max_buf_size) {
            None => {
                // Switch to the reserve buffer.
                let Some(reserve) = data.reserve_buf.take() else {
                    tracing::error!("out of memory and cannot recover");
                    panic!()
                };
                tracing::warn!("out of memory: truncating further tracing");
                data.buf = Some(reserve);
                // Avoid future buffer output.
                self.set_max_trace_size(data.bytes_written.saturating_sub(1).max(1));
            }
            Some(bytes) => {
                let mut buf = TraceBuffer::new(bytes);
                // Allocation hands us zeroed memory; paint the redzone.
                buf.bytes_mut()[trace_buf_size..trace_buf_size + self.redzone_size]
                    .fill(REDZONE_SENTINEL);
                data.buf = Some(buf);
                data.num_buffers += 1;
                if data.num_buffers == 2 {
                    // Reserve buffer for OOM continuation; waiting for the
                    // second buffer keeps idle threads from carrying one.
                    data.reserve_buf = self.allocator.alloc_raw(self.max_buf_size).map(|bytes| {
                        let mut buf = TraceBuffer::new(bytes);
                        buf.bytes_mut()[trace_buf_size..trace_buf_size + self.redzone_size]
                            .fill(REDZONE_SENTINEL);
                        buf
                    });
                }
            }
        }
    }

    /// Zero the trace region, restore the sentinel over any redzone bytes
    /// entries overwrote, and rewind the write pointer to the header slot.
    pub(crate) fn reset_buffer(&self, data: &mut PerThread) {
        let write_offset = data.write_offset();
        let Some(buf) = data.buf.as_mut() else {
            return;
        };
        let bytes = buf.bytes_mut();
        bytes[..self.trace_buf_size].fill(0);
        if write_offset > self.trace_buf_size {
            bytes[self.trace_buf_size..write_offset].fill(REDZONE_SENTINEL);
        }
        let base = buf.base();
        data.tls
            .set(TLS_OFFS_BUF_PTR, base + self.buf_hdr_slots_size as u64);
    }
}
