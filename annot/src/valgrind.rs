//! Valgrind client-request numbering and the argument block layout.
//!
//! The numbering mirrors the Valgrind tool-request scheme: memcheck requests
//! live at `('M' << 24 | 'C' << 16)` plus an ordinal. Only requests with an
//! internal id are dispatched; everything else falls back to the block's
//! default result.

use runtime_api::{AppMemory, Arch};

/// Number of rotate instructions forming the client-request preamble.
pub const VALGRIND_ANNOTATION_ROL_COUNT: usize = 4;

const VG_USERREQ_TOOL_BASE_MEMCHECK: u64 = (b'M' as u64) << 24 | (b'C' as u64) << 16;

pub const VG_USERREQ_MAKE_MEM_DEFINED_IF_ADDRESSABLE: u64 = VG_USERREQ_TOOL_BASE_MEMCHECK + 11;

/* Internal request ids, densely indexed for the direct-mapped handler table. */
pub const VG_ID_MAKE_MEM_DEFINED_IF_ADDRESSABLE: usize = 0;
pub const VG_ID_LAST: usize = 1;

/// Translate a wire request number to an internal id; `VG_ID_LAST` when the
/// request is not one we dispatch.
pub fn lookup_valgrind_request(request: u64) -> usize {
    match request {
        VG_USERREQ_MAKE_MEM_DEFINED_IF_ADDRESSABLE => VG_ID_MAKE_MEM_DEFINED_IF_ADDRESSABLE,
        _ => VG_ID_LAST,
    }
}

/// The in-memory argument block the annotated program builds before the
/// rotate preamble: request number, five arguments, and the result to use
/// when nothing handles the request. Words are pointer-sized.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct VgClientRequest {
    pub request: u64,
    pub args: [u64; 5],
    pub default_result: u64,
}

const VG_CLIENT_REQUEST_WORDS: usize = 7;

impl VgClientRequest {
    pub fn size_bytes(arch: Arch) -> usize {
        VG_CLIENT_REQUEST_WORDS * arch.pointer_size()
    }

    /// Fetch the block from the instrumented program's memory; `None` when
    /// the address range is unreadable.
    pub fn safe_read(mem: &dyn AppMemory, arch: Arch, addr: u64) -> Option<VgClientRequest> {
        let word = arch.pointer_size();
        let mut buf = [0u8; VG_CLIENT_REQUEST_WORDS * 8];
        let len = Self::size_bytes(arch);
        if !mem.safe_read(addr, &mut buf[..len]) {
            return None;
        }
        let read_word = |i: usize| -> u64 {
            let mut word_bytes = [0u8; 8];
            word_bytes[..word].copy_from_slice(&buf[i * word..(i + 1) * word]);
            u64::from_le_bytes(word_bytes)
        };
        let mut args = [0u64; 5];
        for (i, arg) in args.iter_mut().enumerate() {
            *arg = read_word(1 + i);
        }
        Some(VgClientRequest {
            request: read_word(0),
            args,
            default_result: read_word(6),
        })
    }
}
