//! Instruction operands.

use crate::arch::Reg;
use crate::ilist::LabelId;
use crate::tls::TlsOffset;

/// An instruction operand as the host decodes or the cores construct it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Opnd {
    Reg(Reg),
    Immed(i64),
    /// `[base + disp]`
    MemDisp { base: Reg, disp: i32 },
    /// `[base + index * scale + disp]`
    MemIndex {
        base: Reg,
        index: Reg,
        scale: u8,
        disp: i32,
    },
    /// Absolute memory operand.
    AbsMem(u64),
    /// A raw-TLS slot, reachable from generated code via the segment base.
    TlsSlot(TlsOffset),
    /// A code-cache label inside the same block (branch target).
    Label(LabelId),
    /// A code address (direct branch target).
    Pc(u64),
}

impl Opnd {
    pub fn reg(reg: Reg) -> Opnd {
        Opnd::Reg(reg)
    }

    pub fn immed(value: i64) -> Opnd {
        Opnd::Immed(value)
    }

    pub fn mem(base: Reg, disp: i32) -> Opnd {
        Opnd::MemDisp { base, disp }
    }

    pub fn is_immed(&self) -> bool {
        matches!(self, Opnd::Immed(_))
    }

    pub fn immed_value(&self) -> Option<i64> {
        match self {
            Opnd::Immed(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_memory_reference(&self) -> bool {
        matches!(
            self,
            Opnd::MemDisp { .. } | Opnd::MemIndex { .. } | Opnd::AbsMem(_)
        )
    }

    /// Base register of a base+disp style memory operand.
    pub fn base_reg(&self) -> Option<Reg> {
        match self {
            Opnd::MemDisp { base, .. } | Opnd::MemIndex { base, .. } => Some(*base),
            _ => None,
        }
    }

    pub fn uses_reg(&self, reg: Reg) -> bool {
        match self {
            Opnd::Reg(r) => *r == reg,
            Opnd::MemDisp { base, .. } => *base == reg,
            Opnd::MemIndex { base, index, .. } => *base == reg || *index == reg,
            _ => false,
        }
    }
}
