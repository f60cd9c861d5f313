//! Instrumentation strategies.
//!
//! An [`Instru`] implementation owns the trace-entry format: it appends
//! bookkeeping entries into buffers directly and emits the inline code that
//! writes instruction-fetch and memory-reference entries at trace time.
//! Inline code receives the buffer pointer in `reg_ptr` and a scratch in
//! `reg_tmp`; `adjust` accumulates the pending pointer advance so one final
//! add commits a whole instruction's worth of entries.

use runtime_api::{Arch, Instr, InstrList, Opcode, Opnd, Pred, Reg};

use crate::entry::{self, TraceType, TRACE_ENTRY_SIZE};

mod offline;
mod online;

pub use offline::OfflineInstru;
pub use online::OnlineInstru;

/// Per-block analysis summary cached in the block's user data.
#[derive(Debug, Default, Copy, Clone)]
pub struct InstruField {
    pub block_pc: u64,
    pub num_app_instrs: u32,
}

/// Instruction lengths a single bundle entry can carry.
pub const BUNDLE_MAX_INSTRS: usize = 8;

pub trait Instru: Send + Sync {
    fn sizeof_entry(&self) -> usize {
        TRACE_ENTRY_SIZE
    }

    /// One-time header at the start of a thread's output.
    fn append_thread_header(&self, buf: &mut [u8], tid: u32) -> usize;

    /// Header entry re-emitted at the start of every drained unit.
    fn append_unit_header(&self, buf: &mut [u8], tid: u32) -> usize {
        self.append_tid(buf, tid)
    }

    fn append_tid(&self, buf: &mut [u8], tid: u32) -> usize {
        entry::write_entry(buf, TraceType::Thread, 4, tid as u64);
        TRACE_ENTRY_SIZE
    }

    fn append_pid(&self, buf: &mut [u8], pid: u32) -> usize {
        entry::write_entry(buf, TraceType::Pid, 4, pid as u64);
        TRACE_ENTRY_SIZE
    }

    fn append_thread_exit(&self, buf: &mut [u8], tid: u32) -> usize {
        entry::write_entry(buf, TraceType::ThreadExit, 4, tid as u64);
        TRACE_ENTRY_SIZE
    }

    fn append_iflush(&self, buf: &mut [u8], addr: u64, size: usize) -> usize {
        entry::write_entry(buf, TraceType::InstrFlush, size as u16, addr);
        TRACE_ENTRY_SIZE
    }

    fn entry_type(&self, entry: &[u8]) -> Option<TraceType> {
        entry::entry_type(entry).ok()
    }

    fn entry_addr(&self, entry: &[u8]) -> u64 {
        entry::entry_addr(entry)
    }

    fn entry_size(&self, entry: &[u8]) -> u16 {
        entry::entry_size(entry)
    }

    fn set_entry_addr(&self, entry: &mut [u8], addr: u64) {
        entry::set_entry_addr(entry, addr)
    }

    /// Block-level analysis, run once per block before instrumentation.
    fn bb_analysis(&self, bb: &InstrList, repstr: bool) -> InstruField {
        let _ = repstr;
        InstruField {
            block_pc: bb
                .iter()
                .find(|i| i.is_app())
                .and_then(Instr::app_pc)
                .unwrap_or(0),
            num_app_instrs: bb.iter().filter(|i| i.is_app()).count() as u32,
        }
    }

    /// Entry type used for an instruction-fetch entry of `app`.
    fn instr_type(&self, app: &Instr) -> TraceType;

    /// Emit inline code writing an instruction-fetch entry; returns the new
    /// pending adjust.
    fn instrument_instr(
        &self,
        bb: &mut InstrList,
        at: &mut usize,
        reg_ptr: Reg,
        reg_tmp: Reg,
        adjust: i32,
        app: &Instr,
    ) -> i32;

    /// Emit inline code writing a memory-reference entry for one operand.
    fn instrument_memref(
        &self,
        bb: &mut InstrList,
        at: &mut usize,
        reg_ptr: Reg,
        reg_tmp: Reg,
        adjust: i32,
        app: &Instr,
        mem_ref: &Opnd,
        write: bool,
        pred: Option<Pred>,
    ) -> i32;

    /// Emit inline code writing instruction-bundle entries covering the
    /// delayed instructions.
    fn instrument_ibundle(
        &self,
        bb: &mut InstrList,
        at: &mut usize,
        reg_ptr: Reg,
        reg_tmp: Reg,
        adjust: i32,
        delayed: &[Instr],
    ) -> i32;

    /// Materialize the effective address of a memory operand into
    /// `reg_addr`.
    fn insert_obtain_addr(&self, bb: &mut InstrList, at: &mut usize, reg_addr: Reg, mem_ref: &Opnd) {
        match mem_ref {
            Opnd::AbsMem(addr) => {
                bb.insert_before(at, Instr::load_int(reg_addr, *addr as i64));
            }
            _ => {
                bb.insert_before(at, Instr::lea(reg_addr, *mem_ref));
            }
        }
    }
}

/// Branch-kind-specific entry type for an application instruction.
pub fn instr_to_instr_type(app: &Instr) -> TraceType {
    match app.opcode() {
        Opcode::CallDirect => TraceType::InstrDirectCall,
        Opcode::CallIndirect => TraceType::InstrIndirectCall,
        Opcode::JumpDirect | Opcode::Jump => TraceType::InstrDirectJump,
        Opcode::JumpIndirect => TraceType::InstrIndirectJump,
        Opcode::JumpCond | Opcode::Jecxz | Opcode::Cbz | Opcode::Cbnz => {
            TraceType::InstrConditionalJump
        }
        Opcode::Return => TraceType::InstrReturn,
        _ => TraceType::Instr,
    }
}

/// The `type`/`size` halves of an entry as the single 32-bit immediate the
/// inline store writes.
fn header_immed(ty: TraceType, size: u16) -> i64 {
    (ty as u16 as u32 | (size as u32) << 16) as i64
}

/// Inline code for one full entry: a combined type/size store plus an
/// address store from `reg_tmp`.
pub(crate) fn emit_entry(
    arch: Arch,
    bb: &mut InstrList,
    at: &mut usize,
    reg_ptr: Reg,
    reg_tmp: Reg,
    adjust: i32,
    ty: TraceType,
    size: u16,
    addr: EntryAddr<'_>,
    pred: Option<Pred>,
) -> i32 {
    let start = *at;
    bb.insert_before(
        at,
        Instr::store_imm32(Opnd::mem(reg_ptr, adjust), header_immed(ty, size)),
    );
    match addr {
        EntryAddr::Immediate(value) => {
            bb.insert_before(at, Instr::load_int(reg_tmp, value as i64));
        }
        EntryAddr::Memref(mem_ref) => match mem_ref {
            Opnd::AbsMem(a) => {
                bb.insert_before(at, Instr::load_int(reg_tmp, *a as i64));
            }
            _ => {
                bb.insert_before(at, Instr::lea(reg_tmp, *mem_ref));
            }
        },
    }
    bb.insert_before(at, Instr::store(Opnd::mem(reg_ptr, adjust + 4), reg_tmp));

    if arch.has_predication() {
        if let Some(p) = pred {
            if p.is_conditional() {
                for idx in start..*at {
                    if let Some(instr) = bb.get_mut(idx) {
                        instr.set_predicate(p);
                    }
                }
            }
        }
    }

    adjust + TRACE_ENTRY_SIZE as i32
}

pub(crate) enum EntryAddr<'a> {
    Immediate(u64),
    Memref(&'a Opnd),
}

/// Shared bundle emission: one entry per [`BUNDLE_MAX_INSTRS`] delayed
/// instructions, lengths packed byte-wise into the address cell.
pub(crate) fn emit_ibundle(
    arch: Arch,
    bb: &mut InstrList,
    at: &mut usize,
    reg_ptr: Reg,
    reg_tmp: Reg,
    mut adjust: i32,
    delayed: &[Instr],
) -> i32 {
    for chunk in delayed.chunks(BUNDLE_MAX_INSTRS) {
        let mut packed = 0u64;
        for (i, instr) in chunk.iter().enumerate() {
            packed |= (instr.length() as u64) << (8 * i);
        }
        adjust = emit_entry(
            arch,
            bb,
            at,
            reg_ptr,
            reg_tmp,
            adjust,
            TraceType::InstrBundle,
            chunk.len() as u16,
            EntryAddr::Immediate(packed),
            None,
        );
    }
    adjust
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instr_types_follow_branch_kind() {
        let ret = Instr::app(Opcode::Return, 0x100, 1);
        assert_eq!(instr_to_instr_type(&ret), TraceType::InstrReturn);
        let mov = Instr::app(Opcode::Move, 0x100, 3);
        assert_eq!(instr_to_instr_type(&mov), TraceType::Instr);
        let call = Instr::call_direct(0x400100, 0x100, 5);
        assert_eq!(instr_to_instr_type(&call), TraceType::InstrDirectCall);
    }

    #[test]
    fn header_immed_packs_little_endian_halves() {
        let immed = header_immed(TraceType::Read, 8) as u32;
        assert_eq!(immed & 0xffff, TraceType::Read as u16 as u32);
        assert_eq!(immed >> 16, 8);
    }

    #[test]
    fn bundle_splits_past_eight_instrs() {
        let delayed: Vec<Instr> = (0..10)
            .map(|i| Instr::app(Opcode::Move, 0x1000 + i * 2, 2))
            .collect();
        let mut bb = InstrList::new();
        let mut at = 0;
        let adjust = emit_ibundle(
            Arch::X86_64,
            &mut bb,
            &mut at,
            runtime_api::arch::x86::XCX,
            runtime_api::arch::x86::XDX,
            0,
            &delayed,
        );
        // Two bundle entries: 8 + 2 lengths.
        assert_eq!(adjust, 2 * TRACE_ENTRY_SIZE as i32);
        assert_eq!(bb.len(), 6);
    }
}
