//! Online strategy: entries stream over the simulator pipe as emitted.

use runtime_api::{Arch, Instr, InstrList, Opnd, Pred, Reg};

use crate::entry::{self, TraceType, TRACE_ENTRY_SIZE};

use super::{emit_entry, emit_ibundle, instr_to_instr_type, EntryAddr, Instru};

pub struct OnlineInstru {
    arch: Arch,
    /// Emit branch-kind-specific instruction entry types.
    instr_types: bool,
}

impl OnlineInstru {
    pub fn new(arch: Arch, instr_types: bool) -> OnlineInstru {
        OnlineInstru { arch, instr_types }
    }
}

impl Instru for OnlineInstru {
    /// The online consumer registers threads from a header/tid/pid triple;
    /// the header is the same thread entry used for unit framing.
    fn append_thread_header(&self, buf: &mut [u8], tid: u32) -> usize {
        entry::write_entry(buf, TraceType::Header, 0, tid as u64);
        TRACE_ENTRY_SIZE
    }

    fn instr_type(&self, app: &Instr) -> TraceType {
        if self.instr_types {
            instr_to_instr_type(app)
        } else {
            TraceType::Instr
        }
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
