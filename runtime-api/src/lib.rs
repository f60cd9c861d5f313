//! Contracts between the instrumentation cores and the host DBI runtime.
//!
//! The host runtime decodes application code into [`Instr`] objects grouped
//! into editable [`InstrList`] basic blocks, invokes the client's block and
//! thread event callbacks, and owns the machinery the cores cannot provide
//! themselves: scratch-register reservation, raw TLS, safe reads of the
//! instrumented address space, clean-call trampolines, file and pipe plumbing.
//! Everything here is either an owned data type the host constructs or a
//! trait the host (or a test double) implements.

pub mod arch;
pub mod host;
pub mod ilist;
pub mod instr;
pub mod opnd;
pub mod tls;

pub use arch::{Arch, IsaMode, Pred, Reg, RegSet};
pub use host::{
    AppMemory, BlockEvents, BufferAllocator, CalleeRef, DefaultFileOps, ExpandError, FileOps,
    HostRuntime, MachineContext, ModuleInfo, PhysTranslator, ScratchError, ScratchRegs,
    SystemAllocator, ThreadEvents, TracePipe,
};
pub use ilist::{InstrList, LabelId};
pub use instr::{Instr, InstrFlags, Opcode};
pub use opnd::Opnd;
pub use tls::{RawTls, TlsOffset, TLS_OFFS_BUF_PTR, TLS_OFFS_DCACHE, TLS_OFFS_ICACHE, TLS_SLOT_COUNT};
