//! Traits the host runtime (or a test double) implements for the cores.

use std::io::{self, Write};
use std::path::Path;

use crate::arch::{Arch, IsaMode, Reg, RegSet};
use crate::ilist::InstrList;
use crate::instr::Instr;
use crate::opnd::Opnd;

/// Token naming a clean-call target function.
///
/// The host resolves the token to a trampoline at link time; the cores only
/// construct and compare it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct CalleeRef(pub &'static str);

#[derive(Debug, thiserror::Error)]
pub enum ScratchError {
    #[error("no scratch register available")]
    NoRegister,

    #[error("arithmetic flags cannot be spilled here")]
    NoAflags,

    #[error("register {0:?} was not reserved")]
    NotReserved(Reg),
}

#[derive(Debug, thiserror::Error)]
#[error("repeated-string expansion failed")]
pub struct ExpandError;

/// Scratch-register reservation across an instrumentation sequence.
///
/// Spills and restores are inserted at the cursor; reservation state must be
/// symmetric on every control-flow path through the inserted code, which is
/// why filter code restores its extra scratch after the skip label.
pub trait ScratchRegs {
    fn reserve(
        &mut self,
        bb: &mut InstrList,
        at: &mut usize,
        allowed: Option<&RegSet>,
    ) -> Result<Reg, ScratchError>;

    fn unreserve(&mut self, bb: &mut InstrList, at: &mut usize, reg: Reg)
        -> Result<(), ScratchError>;

    fn reserve_aflags(&mut self, bb: &mut InstrList, at: &mut usize) -> Result<(), ScratchError>;

    fn unreserve_aflags(&mut self, bb: &mut InstrList, at: &mut usize)
        -> Result<(), ScratchError>;

    /// Re-materialize the application value of `app_reg` into `dst`.
    fn restore_app_value(
        &mut self,
        bb: &mut InstrList,
        at: &mut usize,
        app_reg: Reg,
        dst: Reg,
    ) -> Result<(), ScratchError>;
}

/// The host runtime services the cores call during code generation and from
/// clean calls.
pub trait HostRuntime {
    fn arch(&self) -> Arch;

    fn arm_isa_mode(&self) -> IsaMode {
        IsaMode::A32
    }

    fn thread_id(&self) -> u32;

    fn process_id(&self) -> u32;

    /// Short application identifier used in output file names.
    fn app_name(&self) -> &str;

    /// Expand repeated-string loops into explicit iteration; returns whether
    /// the block was such a loop.
    fn expand_rep_string(&self, bb: &mut InstrList) -> Result<bool, ExpandError>;

    /// Host option that enlarges clean-call sequences beyond short-branch
    /// reach on x86.
    fn profile_pcs(&self) -> bool {
        false
    }

    /// Insert a clean call at the cursor.
    fn insert_clean_call(
        &self,
        bb: &mut InstrList,
        at: &mut usize,
        callee: CalleeRef,
        save_fpstate: bool,
        args: &[Opnd],
    ) {
        bb.insert_before(at, Instr::clean_call(callee, save_fpstate, args));
    }

    /// Append a clean call at the end of the block.
    fn append_clean_call(&self, bb: &mut InstrList, callee: CalleeRef, args: &[Opnd]) {
        bb.append(Instr::clean_call(callee, false, args));
    }
}

/// Read access to the instrumented program's address space.
pub trait AppMemory {
    /// Attempt to read `buf.len()` bytes at `addr`; false when the range is
    /// not readable, in which case `buf` contents are unspecified.
    fn safe_read(&self, addr: u64, buf: &mut [u8]) -> bool;
}

/// Integer machine context of the instrumented thread at a clean call.
pub trait MachineContext {
    fn reg(&self, reg: Reg) -> u64;
    fn set_reg(&mut self, reg: Reg, value: u64);
}

/// Raw read/write memory for trace buffers, zeroed on allocation.
pub trait BufferAllocator: Send + Sync {
    fn alloc_raw(&self, size: usize) -> Option<Box<[u8]>>;
}

/// Allocator backed by the host heap; treats exhaustion as unreachable.
pub struct SystemAllocator;

impl BufferAllocator for SystemAllocator {
    fn alloc_raw(&self, size: usize) -> Option<Box<[u8]>> {
        Some(vec![0u8; size].into_boxed_slice())
    }
}

/// File operations, replaceable by embedders that redirect output.
pub trait FileOps: Send + Sync {
    /// Open for writing; must fail if the path already exists.
    fn open_file(&self, path: &Path) -> io::Result<Box<dyn Write + Send>>;

    /// Create a directory; must fail if the path already exists.
    fn create_dir(&self, path: &Path) -> io::Result<()>;
}

pub struct DefaultFileOps;

impl FileOps for DefaultFileOps {
    fn open_file(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        Ok(Box::new(file))
    }

    fn create_dir(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir(path)
    }
}

/// Writer end of the named pipe shared with the online consumer.
pub trait TracePipe: Send {
    /// Largest payload the OS writes atomically with respect to other
    /// writers of the same pipe.
    fn atomic_write_size(&self) -> usize;

    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Grow the kernel buffer to its maximum; best effort.
    fn maximize_buffer(&mut self) -> bool {
        false
    }
}

/// Virtual-to-physical address translation; returns 0 when the mapping is
/// unavailable.
pub trait PhysTranslator: Send + Sync {
    fn virtual2physical(&self, virt: u64) -> u64;
}

/// A loaded module as reported by the host's module events.
#[derive(Debug, Clone)]
pub struct ModuleInfo {
    pub start: u64,
    pub end: u64,
    pub name: String,
    /// Exported annotation entry points: `(symbol, pc)`.
    pub annotation_exports: Vec<(String, u64)>,
}

impl ModuleInfo {
    pub fn export(&self, symbol: &str) -> Option<u64> {
        self.annotation_exports
            .iter()
            .find(|(name, _)| name == symbol)
            .map(|(_, pc)| *pc)
    }
}

/// The four per-block callbacks the host invokes in order for each basic
/// block it translates. Mirrors the multi-phase block event registration of
/// the host runtime.
pub trait BlockEvents {
    type BlockData;

    /// App-to-app transformation stage (runs before analysis).
    fn app2app(&self, host: &dyn HostRuntime, bb: &mut InstrList) -> Self::BlockData;

    /// Block-level analysis; no mutation.
    fn analysis(&self, host: &dyn HostRuntime, bb: &InstrList, data: &mut Self::BlockData);

    /// Per-instruction instrumentation; `at` indexes the application
    /// instruction being visited.
    fn instrument(
        &self,
        host: &dyn HostRuntime,
        scratch: &mut dyn ScratchRegs,
        bb: &mut InstrList,
        at: usize,
        data: &mut Self::BlockData,
    );

    /// Post-instrumentation cleanup; consumes the block data.
    fn post(&self, host: &dyn HostRuntime, data: Self::BlockData) {
        let _ = (host, data);
    }
}

/// Thread lifetime callbacks.
pub trait ThreadEvents {
    type ThreadData;

    fn thread_init(&self, host: &dyn HostRuntime) -> Self::ThreadData;

    fn thread_exit(&self, host: &dyn HostRuntime, data: Self::ThreadData);

    /// Child-side re-initialization after fork (POSIX hosts only).
    fn fork_init(&self, host: &dyn HostRuntime, data: &mut Self::ThreadData);

    /// Pre-syscall hook; returning true lets the syscall proceed.
    fn pre_syscall(
        &self,
        host: &dyn HostRuntime,
        data: &mut Self::ThreadData,
        sysnum: i64,
        params: &[u64],
    ) -> bool {
        let _ = (host, data, sysnum, params);
        true
    }
}
