//! Drain & framing: move a full thread buffer to its file or the pipe.

use runtime_api::TLS_OFFS_BUF_PTR;

use crate::buffer::{OwnedBuffer, PerThread};
use crate::entry::TraceType;
use crate::lifecycle::{lock, Tracer};

impl Tracer {
    /// Drain the thread's buffer: stamp the unit header, apply the size cap,
    /// rewrite physical addresses, frame and write the payload, then reset
    /// (or replace, under handoff) the buffer and rewind the write pointer.
    ///
    /// Runs as the redzone clean call, on pre-syscall events, and once more
    /// at thread exit with `bypass_size_cap`.
    pub fn drain(&self, data: &mut PerThread, bypass_size_cap: bool) {
        let esz = self.instru.sizeof_entry();
        let hdr = self.buf_hdr_slots_size;
        let tid = data.tid();
        let Some(buf) = data.buf.as_mut() else {
            return;
        };
        let base = buf.base();
        let used = (data.tls.get(TLS_OFFS_BUF_PTR) - base) as usize;
        // Nothing beyond the header slot: e.g. a syscall drain under a
        // filter that absorbed everything.
        if used == hdr {
            return;
        }

        // The first slot was reserved for the header entry, added here --
        // except in a thread's very first offline buffer, which already
        // leads with the init header triple.
        let header_size = if data.num_refs == 0 && self.options.offline {
            data.init_header_size
        } else {
            self.instru.append_unit_header(buf.bytes_mut(), tid);
            hdr
        };

        let mut do_write = true;
        let max_size = self.max_trace_size();
        if !bypass_size_cap && max_size > 0 && data.bytes_written > max_size {
            // The limit is not exact: one buffer beyond is allowed, and
            // instrumentation keeps running and draining while suppressed.
            do_write = false;
        } else {
            data.bytes_written += used as u64;
        }

        if do_write {
            let mut pipe_start = 0usize;
            let mut pipe_end = 0usize;
            let mut off = header_size;
            while off < used {
                data.num_refs += 1;
                if self.have_phys() {
                    self.rewrite_physical(&mut buf.bytes_mut()[off..off + esz]);
                }
                if !self.options.offline
                    && self.instru.entry_type(&buf.bytes()[off..off + esz])
                        == Some(TraceType::Instr)
                {
                    // Split only immediately before an instruction entry so
                    // its data entries travel in the same chunk.
                    if off - pipe_start > self.atomic_write_size {
                        pipe_start =
                            self.atomic_pipe_write(buf.bytes_mut(), pipe_start, pipe_end, tid);
                    }
                    pipe_end = off;
                }
                off += esz;
            }
            if self.options.offline {
                if self.handoff.is_none() {
                    let Some(file) = data.file.as_mut() else {
                        tracing::error!("offline thread has no trace file");
                        panic!()
                    };
                    if file.write_all(&buf.bytes()[pipe_start..used]).is_err() {
                        tracing::error!("failed to write trace");
                        panic!()
                    }
                }
            } else {
                // The trailing entries may exceed one atomic write, so up to
                // two more writes finish the buffer.
                if used - pipe_start > self.atomic_write_size {
                    pipe_start = self.atomic_pipe_write(buf.bytes_mut(), pipe_start, pipe_end, tid);
                }
                if used - pipe_start > hdr {
                    self.atomic_pipe_write(buf.bytes_mut(), pipe_start, used, tid);
                }
            }
        }

        if do_write && self.options.offline && self.handoff.is_some() {
            // The callback owns the buffer now; trace on into a fresh one.
            let Some(full) = data.buf.take() else {
                return;
            };
            let owned = OwnedBuffer {
                bytes: full.into_bytes(),
                start: 0,
                end: used,
            };
            let handed = match (self.handoff.as_ref(), data.file.as_mut()) {
                (Some(handoff), Some(file)) => handoff(&mut **file, owned),
                _ => false,
            };
            if !handed {
                tracing::error!("failed to hand off trace");
                panic!()
            }
            self.create_buffer(data);
            if let Some(buf) = data.buf.as_ref() {
                data.tls
                    .set(TLS_OFFS_BUF_PTR, buf.base() + hdr as u64);
            }
        } else {
            // Inline code skips the clean call while the word at the write
            // pointer reads zero, so the trace region must be zero and the
            // redzone non-zero again.
            self.reset_buffer(data);
        }
    }

    /// Rewrite one entry's address to its physical mapping; bookkeeping
    /// entries are left alone, and a failed translation keeps the virtual
    /// address rather than dropping the entry.
    fn rewrite_physical(&self, entry: &mut [u8]) {
        let Some(ty) = self.instru.entry_type(entry) else {
            return;
        };
        if ty.is_thread_bookkeeping() {
            return;
        }
        // Bundles are disabled under physical translation.
        debug_assert!(ty != TraceType::InstrBundle);
        let virt = self.instru.entry_addr(entry);
        let phys = self
            .phys
            .as_ref()
            .map(|p| p.virtual2physical(virt))
            .unwrap_or(0);
        if phys != 0 {
            self.instru.set_entry_addr(entry, phys);
        } else {
            // Vsyscall pages and wild app accesses have no mapping.
            tracing::warn!(
                ty = %ty,
                size = self.instru.entry_size(entry),
                virt,
                "virtual-to-physical translation failure"
            );
        }
    }

    /// One write to the shared pipe, guaranteed atomic with respect to other
    /// threads' chunks, followed by re-stamping the thread header just
    /// before the unwritten tail so the next chunk is framed too.
    fn atomic_pipe_write(
        &self,
        bytes: &mut [u8],
        pipe_start: usize,
        pipe_end: usize,
        tid: u32,
    ) -> usize {
        let towrite = pipe_end - pipe_start;
        debug_assert!(towrite <= self.atomic_write_size);
        debug_assert!(towrite > self.buf_hdr_slots_size);
        self.pipe_write_all(&bytes[pipe_start..pipe_end]);
        debug_assert!(pipe_end - self.buf_hdr_slots_size > pipe_start);
        let new_start = pipe_end - self.buf_hdr_slots_size;
        self.instru.append_tid(&mut bytes[new_start..], tid);
        new_start
    }

    pub(crate) fn pipe_write_all(&self, payload: &[u8]) {
        let Some(pipe) = self.pipe.as_ref() else {
            tracing::error!("online drain without a pipe");
            panic!()
        };
        let mut pipe = lock(pipe, "pipe");
        match pipe.write(payload) {
            Ok(written) if written >= payload.len() => {}
            _ => {
                tracing::error!("failed to write to pipe");
                panic!()
            }
        }
    }
}
