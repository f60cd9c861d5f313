//! The instruction object shared between the host runtime and the cores.
//!
//! Application instructions are decoded by the host and carry their
//! application PC and length; instrumentation instructions are constructed by
//! the cores through the same constructors the host builder exposes and are
//! meta (non-application) by default.

use bitflags::bitflags;
use smallvec::SmallVec;

use crate::arch::{Pred, Reg};
use crate::host::CalleeRef;
use crate::ilist::LabelId;
use crate::opnd::Opnd;

/// Opcode set the cores construct or inspect.
///
/// Application code may use any opcode; opcodes the cores never inspect
/// arrive as [`Opcode::Other`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Opcode {
    Label,
    Nop,
    /// Rotate left by an immediate.
    Rol,
    Xchg,
    Xor,
    CallDirect,
    CallIndirect,
    JumpDirect,
    JumpIndirect,
    Return,
    /// Load a word from memory.
    Load,
    /// Store a register word to memory.
    Store,
    /// Store a 16-bit immediate to memory.
    Store2,
    /// Store a 32-bit immediate to memory.
    Store4,
    /// Load an immediate into a register.
    LoadInt,
    Move,
    And,
    Shr,
    Add,
    /// `dst = base + (index << shift)`
    AddScaled,
    Cmp,
    Lea,
    Jump,
    JumpCond,
    /// x86 jump-if-XCX-zero; reaches across an out-of-line clean call.
    Jecxz,
    Cbz,
    Cbnz,
    SaveFlags,
    RestoreFlags,
    /// Pseudo-instruction standing for a host clean-call trampoline.
    CleanCall,
    /// Exclusive (store-conditional) store.
    Strex,
    Other(u16),
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct InstrFlags: u8 {
        /// Application instruction (decoded from app code).
        const APP = 1 << 0;
        /// Synthetic annotation marker; the mangler dispatches on it.
        const ANNOTATION = 1 << 1;
        /// The downstream mangler must leave this instruction untouched.
        const DONT_MANGLE = 1 << 2;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instr {
    opcode: Opcode,
    srcs: SmallVec<[Opnd; 2]>,
    dsts: SmallVec<[Opnd; 2]>,
    app_pc: Option<u64>,
    xl8: Option<u64>,
    length: u8,
    predicate: Option<Pred>,
    flags: InstrFlags,
    note: Option<u64>,
    callee: Option<CalleeRef>,
    save_fpstate: bool,
    label_id: Option<LabelId>,
}

impl Instr {
    pub fn new(opcode: Opcode) -> Instr {
        Instr {
            opcode,
            srcs: SmallVec::new(),
            dsts: SmallVec::new(),
            app_pc: None,
            xl8: None,
            length: 0,
            predicate: None,
            flags: InstrFlags::empty(),
            note: None,
            callee: None,
            save_fpstate: false,
            label_id: None,
        }
    }

    /// An application instruction decoded by the host.
    pub fn app(opcode: Opcode, pc: u64, length: u8) -> Instr {
        let mut instr = Instr::new(opcode);
        instr.app_pc = Some(pc);
        instr.length = length;
        instr.flags |= InstrFlags::APP;
        instr
    }

    pub fn with_src(mut self, opnd: Opnd) -> Instr {
        self.srcs.push(opnd);
        self
    }

    pub fn with_dst(mut self, opnd: Opnd) -> Instr {
        self.dsts.push(opnd);
        self
    }

    pub fn with_pred(mut self, pred: Pred) -> Instr {
        self.predicate = Some(pred);
        self
    }

    /* Builders mirroring the host's instruction-creation API. */

    pub fn label() -> Instr {
        Instr::new(Opcode::Label)
    }

    pub fn rol(dst: Reg, immed: i64) -> Instr {
        Instr::new(Opcode::Rol)
            .with_src(Opnd::Immed(immed))
            .with_dst(Opnd::Reg(dst))
    }

    pub fn xchg(a: Opnd, b: Opnd) -> Instr {
        Instr::new(Opcode::Xchg).with_src(b).with_dst(a)
    }

    pub fn xor(dst: Reg, src: Opnd) -> Instr {
        Instr::new(Opcode::Xor)
            .with_src(src)
            .with_dst(Opnd::Reg(dst))
    }

    pub fn call_direct(target: u64, pc: u64, length: u8) -> Instr {
        let mut instr = Instr::app(Opcode::CallDirect, pc, length);
        instr.srcs.push(Opnd::Pc(target));
        instr
    }

    pub fn load(dst: Reg, src: Opnd) -> Instr {
        Instr::new(Opcode::Load)
            .with_src(src)
            .with_dst(Opnd::Reg(dst))
    }

    pub fn store(dst: Opnd, src: Reg) -> Instr {
        Instr::new(Opcode::Store)
            .with_src(Opnd::Reg(src))
            .with_dst(dst)
    }

    pub fn store_imm16(dst: Opnd, immed: i64) -> Instr {
        Instr::new(Opcode::Store2)
            .with_src(Opnd::Immed(immed))
            .with_dst(dst)
    }

    pub fn store_imm32(dst: Opnd, immed: i64) -> Instr {
        Instr::new(Opcode::Store4)
            .with_src(Opnd::Immed(immed))
            .with_dst(dst)
    }

    pub fn load_int(dst: Reg, immed: i64) -> Instr {
        Instr::new(Opcode::LoadInt)
            .with_src(Opnd::Immed(immed))
            .with_dst(Opnd::Reg(dst))
    }

    pub fn move_reg(dst: Reg, src: Reg) -> Instr {
        Instr::new(Opcode::Move)
            .with_src(Opnd::Reg(src))
            .with_dst(Opnd::Reg(dst))
    }

    pub fn and(dst: Reg, src: Opnd) -> Instr {
        Instr::new(Opcode::And)
            .with_src(src)
            .with_dst(Opnd::Reg(dst))
    }

    pub fn shr(dst: Reg, immed: i64) -> Instr {
        Instr::new(Opcode::Shr)
            .with_src(Opnd::Immed(immed))
            .with_dst(Opnd::Reg(dst))
    }

    pub fn add(dst: Reg, src: Opnd) -> Instr {
        Instr::new(Opcode::Add)
            .with_src(src)
            .with_dst(Opnd::Reg(dst))
    }

    pub fn add_scaled(dst: Reg, base: Reg, index: Reg, shift: u8) -> Instr {
        Instr::new(Opcode::AddScaled)
            .with_src(Opnd::Reg(base))
            .with_src(Opnd::Reg(index))
            .with_src(Opnd::Immed(shift as i64))
            .with_dst(Opnd::Reg(dst))
    }

    pub fn cmp(a: Opnd, b: Opnd) -> Instr {
        Instr::new(Opcode::Cmp).with_src(a).with_src(b)
    }

    pub fn lea(dst: Reg, mem: Opnd) -> Instr {
        Instr::new(Opcode::Lea)
            .with_src(mem)
            .with_dst(Opnd::Reg(dst))
    }

    pub fn jump(target: Opnd) -> Instr {
        Instr::new(Opcode::Jump).with_src(target)
    }

    pub fn jump_cond(pred: Pred, target: Opnd) -> Instr {
        Instr::new(Opcode::JumpCond)
            .with_src(target)
            .with_pred(pred)
    }

    pub fn jecxz(target: Opnd) -> Instr {
        Instr::new(Opcode::Jecxz).with_src(target)
    }

    pub fn cbz(target: Opnd, reg: Reg) -> Instr {
        Instr::new(Opcode::Cbz)
            .with_src(target)
            .with_src(Opnd::Reg(reg))
    }

    pub fn cbnz(target: Opnd, reg: Reg) -> Instr {
        Instr::new(Opcode::Cbnz)
            .with_src(target)
            .with_src(Opnd::Reg(reg))
    }

    pub fn save_flags(dst: Reg) -> Instr {
        Instr::new(Opcode::SaveFlags).with_dst(Opnd::Reg(dst))
    }

    pub fn restore_flags(src: Reg) -> Instr {
        Instr::new(Opcode::RestoreFlags).with_src(Opnd::Reg(src))
    }

    pub fn clean_call(callee: CalleeRef, save_fpstate: bool, args: &[Opnd]) -> Instr {
        let mut instr = Instr::new(Opcode::CleanCall);
        instr.callee = Some(callee);
        instr.save_fpstate = save_fpstate;
        instr.srcs.extend(args.iter().copied());
        instr
    }

    /* Inspection */

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn is_app(&self) -> bool {
        self.flags.contains(InstrFlags::APP)
    }

    pub fn is_label(&self) -> bool {
        self.opcode == Opcode::Label
    }

    pub fn is_call_direct(&self) -> bool {
        self.opcode == Opcode::CallDirect
    }

    pub fn is_exclusive_store(&self) -> bool {
        self.opcode == Opcode::Strex
    }

    /// Target PC of a direct branch.
    pub fn branch_target_pc(&self) -> Option<u64> {
        match self.srcs.first() {
            Some(Opnd::Pc(pc)) => Some(*pc),
            _ => None,
        }
    }

    pub fn app_pc(&self) -> Option<u64> {
        self.app_pc
    }

    pub fn length(&self) -> u8 {
        self.length
    }

    /// Translation PC: where faults in this instruction report to.
    pub fn translation(&self) -> Option<u64> {
        self.xl8.or(self.app_pc)
    }

    pub fn set_translation(&mut self, xl8: u64) {
        self.xl8 = Some(xl8);
    }

    pub fn with_translation(mut self, xl8: u64) -> Instr {
        self.xl8 = Some(xl8);
        self
    }

    pub fn predicate(&self) -> Option<Pred> {
        self.predicate
    }

    pub fn set_predicate(&mut self, pred: Pred) {
        self.predicate = Some(pred);
    }

    pub fn is_predicated(&self) -> bool {
        matches!(self.predicate, Some(p) if p.is_conditional())
    }

    pub fn flags(&self) -> InstrFlags {
        self.flags
    }

    pub fn set_flag(&mut self, flag: InstrFlags) {
        self.flags |= flag;
    }

    pub fn note(&self) -> Option<u64> {
        self.note
    }

    pub fn set_note(&mut self, note: u64) {
        self.note = Some(note);
    }

    pub fn callee(&self) -> Option<CalleeRef> {
        self.callee
    }

    pub fn save_fpstate(&self) -> bool {
        self.save_fpstate
    }

    pub fn label_id(&self) -> Option<LabelId> {
        self.label_id
    }

    pub(crate) fn set_label_id(&mut self, id: LabelId) {
        self.label_id = Some(id);
    }

    pub fn num_srcs(&self) -> usize {
        self.srcs.len()
    }

    pub fn num_dsts(&self) -> usize {
        self.dsts.len()
    }

    pub fn src(&self, i: usize) -> Option<&Opnd> {
        self.srcs.get(i)
    }

    pub fn dst(&self, i: usize) -> Option<&Opnd> {
        self.dsts.get(i)
    }

    pub fn reads_memory(&self) -> bool {
        self.srcs.iter().any(Opnd::is_memory_reference)
    }

    pub fn writes_memory(&self) -> bool {
        self.dsts.iter().any(Opnd::is_memory_reference)
    }

    pub fn memory_srcs(&self) -> impl Iterator<Item = &Opnd> {
        self.srcs.iter().filter(|o| o.is_memory_reference())
    }

    pub fn memory_dsts(&self) -> impl Iterator<Item = &Opnd> {
        self.dsts.iter().filter(|o| o.is_memory_reference())
    }

    /// Whether this instruction writes `reg`, counting conditional
    /// destinations.
    pub fn writes_to_reg(&self, reg: Reg) -> bool {
        self.dsts.iter().any(|o| matches!(o, Opnd::Reg(r) if *r == reg))
    }
}
