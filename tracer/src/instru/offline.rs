//! Offline strategy: per-thread files post-processed into a final trace.

use runtime_api::{Arch, Instr, InstrList, Opnd, Pred, Reg};

use crate::entry::{self, TraceType, TRACE_ENTRY_SIZE};

use super::{emit_entry, emit_ibundle, EntryAddr, Instru};

/// Format version stamped into per-thread file headers.
pub const OFFLINE_FILE_VERSION: u64 = 2;

pub struct OfflineInstru {
    arch: Arch,
}

impl OfflineInstru {
    pub fn new(arch: Arch) -> OfflineInstru {
        OfflineInstru { arch }
    }
}

impl Instru for OfflineInstru {
    fn append_thread_header(&self, buf: &mut [u8], _tid: u32) -> usize {
        entry::write_entry(buf, TraceType::Header, 0, OFFLINE_FILE_VERSION);
        TRACE_ENTRY_SIZE
    }

    /// Offline post-processing keys everything off the file name, so every
    /// instruction entry is a plain fetch regardless of branch kind.
    fn instr_type(&self, _app: &Instr) -> TraceType {
        TraceType::Instr
    }

    fn instrument_instr(
        &self,
        bb: &mut InstrList,
        at: &mut usize,
        reg_ptr: Reg,
        reg_tmp: Reg,
        adjust: i32,
        app: &Instr,
    ) -> i32 {
        emit_entry(
            self.arch,
            bb,
            at,
            reg_ptr,
            reg_tmp,
            adjust,
            self.instr_type(app),
            app.length() as u16,
            EntryAddr::Immediate(app.app_pc().unwrap_or(0)),
            None,
        )
    }

    fn instrument_memref(
        &self,
        bb: &mut InstrList,
        at: &mut usize,
        reg_ptr: Reg,
        reg_tmp: Reg,
        adjust: i32,
        _app: &Instr,
        mem_ref: &Opnd,
        write: bool,
        pred: Option<Pred>,
    ) -> i32 {
        let ty = if write {
            TraceType::Write
        } else {
            TraceType::Read
        };
        emit_entry(
            self.arch,
            bb,
            at,
            reg_ptr,
            reg_tmp,
            adjust,
            ty,
            self.arch.pointer_size() as u16,
            EntryAddr::Memref(mem_ref),
            pred,
        )
    }

    fn instrument_ibundle(
        &self,
        bb: &mut InstrList,
        at: &mut usize,
        reg_ptr: Reg,
        reg_tmp: Reg,
        adjust: i32,
        delayed: &[Instr],
    ) -> i32 {
        emit_ibundle(self.arch, bb, at, reg_ptr, reg_tmp, adjust, delayed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runtime_api::arch::x86;
    use runtime_api::Opcode;

    #[test]
    fn thread_header_carries_version() {
        let instru = OfflineInstru::new(Arch::X86_64);
        let mut buf = [0u8; TRACE_ENTRY_SIZE];
        let n = instru.append_thread_header(&mut buf, 7);
        assert_eq!(n, TRACE_ENTRY_SIZE);
        assert_eq!(entry::entry_type(&buf), Ok(TraceType::Header));
        assert_eq!(entry::entry_addr(&buf), OFFLINE_FILE_VERSION);
    }

    #[test]
    fn instr_entries_are_untyped() {
        let instru = OfflineInstru::new(Arch::X86_64);
        let ret = Instr::app(Opcode::Return, 0x100, 1);
        assert_eq!(instru.instr_type(&ret), TraceType::Instr);
    }

    #[test]
    fn instr_entry_emits_header_and_pc_store() {
        let instru = OfflineInstru::new(Arch::X86_64);
        let mut bb = InstrList::new();
        let mut at = 0;
        let app = Instr::app(Opcode::Move, 0x4000, 3);
        let adjust = instru.instrument_instr(&mut bb, &mut at, x86::XCX, x86::XDX, 0, &app);
        assert_eq!(adjust, TRACE_ENTRY_SIZE as i32);
        assert_eq!(bb.len(), 3);
        assert_eq!(bb.get(0).unwrap().opcode(), Opcode::Store4);
        assert_eq!(bb.get(1).unwrap().opcode(), Opcode::LoadInt);
        assert_eq!(bb.get(1).unwrap().src(0), Some(&Opnd::Immed(0x4000)));
        assert_eq!(bb.get(2).unwrap().opcode(), Opcode::Store);
    }
}
