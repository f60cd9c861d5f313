//! Annotation recognition and dispatch.
//!
//! Applications mark themselves up in two ways: direct calls to exported
//! annotation functions, and the Valgrind rotate/exchange instruction
//! pattern. The registry maps both to client-registered handlers; the
//! matcher rewrites basic blocks so annotation sites reach their handlers
//! instead of executing as application code.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use hashbrown::HashMap;

use runtime_api::{
    AppMemory, Arch, CalleeRef, Instr, InstrFlags, InstrList, MachineContext, ModuleInfo, Opnd,
};

pub mod handler;
pub mod matcher;
pub mod valgrind;

pub use handler::{Handler, HandlerId, HandlerKind, VgCallback};
pub use matcher::{expected_rol_immeds, match_valgrind_pattern};
pub use valgrind::{
    lookup_valgrind_request, VgClientRequest, VALGRIND_ANNOTATION_ROL_COUNT, VG_ID_LAST,
    VG_ID_MAKE_MEM_DEFINED_IF_ADDRESSABLE, VG_USERREQ_MAKE_MEM_DEFINED_IF_ADDRESSABLE,
};

use handler::HandlerArena;

/// Clean-call target dispatching a matched Valgrind request.
pub const VG_ANNOTATION_CALLEE: CalleeRef = CalleeRef("handle_vg_annotation");

/// Annotation export recognized at module load: a program probing whether it
/// runs under instrumentation gets `1` back.
pub const RUNNING_UNDER_SYMBOL: &str = "annotate_running_on_instrumentation";

struct RegistryInner {
    arena: HandlerArena,
    by_pc: HashMap<u64, HandlerId>,
    valgrind: [Option<HandlerId>; VG_ID_LAST],
}

/// Keyed mapping from annotation call-site PC (or Valgrind request id) to
/// handler chains. One reader/writer lock guards both tables: lookups during
/// code generation take read, registrations and unload sweeps take write.
/// This lock is innermost; nothing else is acquired while it is held.
pub struct HandlerRegistry {
    inner: RwLock<RegistryInner>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    pub fn new() -> HandlerRegistry {
        HandlerRegistry {
            inner: RwLock::new(RegistryInner {
                arena: HandlerArena::default(),
                by_pc: HashMap::new(),
                valgrind: [None; VG_ID_LAST],
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryInner> {
        let Ok(guard) = self.inner.read() else {
            tracing::error!("handler table lock is poisoned");
            panic!()
        };
        guard
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryInner> {
        let Ok(guard) = self.inner.write() else {
            tracing::error!("handler table lock is poisoned");
            panic!()
        };
        guard
    }

    /// Register a callback for direct calls to the annotation function at
    /// `func_pc`. A second registration for the same PC is ignored.
    pub fn register_call(
        &self,
        func_pc: u64,
        callback: CalleeRef,
        save_fpstate: bool,
        args: Vec<Opnd>,
    ) {
        let mut inner = self.write();
        if inner.by_pc.contains_key(&func_pc) {
            return; // ignore duplicate registration
        }
        let id = inner.arena.alloc(Handler {
            target_pc: func_pc,
            kind: HandlerKind::Call {
                callback,
                save_fpstate,
                args,
            },
            next: None,
        });
        inner.by_pc.insert(func_pc, id);
    }

    /// Register a constant return value for the annotation function at
    /// `func_pc`. A second registration for the same PC is ignored.
    pub fn register_return(&self, func_pc: u64, value: u64) {
        let mut inner = self.write();
        if inner.by_pc.contains_key(&func_pc) {
            return; // ignore duplicate registration
        }
        let id = inner.arena.alloc(Handler {
            target_pc: func_pc,
            kind: HandlerKind::ReturnValue { value },
            next: None,
        });
        inner.by_pc.insert(func_pc, id);
    }

    /// Register a Valgrind request handler by internal request id.
    /// Out-of-range ids and duplicates are silently dropped.
    pub fn register_valgrind<F>(&self, request_id: usize, callback: F)
    where
        F: Fn(&VgClientRequest) -> u64 + Send + Sync + 'static,
    {
        if request_id >= VG_ID_LAST {
            return;
        }
        let mut inner = self.write();
        if inner.valgrind[request_id].is_some() {
            return;
        }
        let id = inner.arena.alloc(Handler {
            target_pc: request_id as u64,
            kind: HandlerKind::Valgrind {
                callback: Box::new(callback),
            },
            next: None,
        });
        inner.valgrind[request_id] = Some(id);
    }

    /// Module-unload sweep: drop every handler keyed strictly inside
    /// `(low, high)`.
    pub fn sweep_range(&self, low: u64, high: u64) {
        let mut inner = self.write();
        let RegistryInner { arena, by_pc, .. } = &mut *inner;
        by_pc.retain(|pc, id| {
            if *pc > low && *pc < high {
                arena.release_chain(*id);
                false
            } else {
                true
            }
        });
    }

    /// Run `f` on the head of the handler chain for `pc`, if any.
    pub fn lookup<R>(&self, pc: u64, f: impl FnOnce(&Handler) -> R) -> Option<R> {
        let inner = self.read();
        let id = *inner.by_pc.get(&pc)?;
        inner.arena.get(id).map(f)
    }

    /// Direct-call annotation matching: when the call targets a registered
    /// annotation function, return one synthetic marker per chained handler
    /// for the host to splice in at the call site.
    pub fn annotation_markers(&self, instr: &Instr) -> Option<InstrList> {
        if !instr.is_call_direct() {
            return None;
        }
        let target = instr.branch_target_pc()?;

        let inner = self.read();
        let mut cursor = inner.by_pc.get(&target).copied();
        let mut markers = InstrList::new();
        while let Some(id) = cursor {
            let Some(handler) = inner.arena.get(id) else {
                break;
            };
            let mut marker = Instr::label();
            marker.set_flag(InstrFlags::ANNOTATION);
            marker.set_flag(InstrFlags::DONT_MANGLE);
            marker.set_note(id.0 as u64);
            markers.append(marker);
            cursor = handler.next;
        }

        if markers.is_empty() {
            None
        } else {
            Some(markers)
        }
    }

    /// Clean-call target for a matched Valgrind request: fetch the argument
    /// block, run the handler (or fall back to the block's default result),
    /// and leave the result where the program expects it, in "XBX".
    pub fn handle_vg_annotation(
        &self,
        mem: &dyn AppMemory,
        mctx: &mut dyn MachineContext,
        arch: Arch,
        request_args: u64,
    ) {
        let Some(request) = VgClientRequest::safe_read(mem, arch, request_args) else {
            return;
        };

        let mut result = request.default_result;
        let request_id = lookup_valgrind_request(request.request);
        if request_id < VG_ID_LAST {
            let inner = self.read();
            if let Some(id) = inner.valgrind[request_id] {
                if let Some(Handler {
                    kind: HandlerKind::Valgrind { callback },
                    ..
                }) = inner.arena.get(id)
                {
                    result = callback(&request);
                }
            }
        }

        mctx.set_reg(arch.xbx(), result);
    }

    /// Module-load event: auto-register the "running under instrumentation"
    /// probe so annotated programs can detect us.
    pub fn module_load(&self, module: &ModuleInfo) {
        if let Some(pc) = module.export(RUNNING_UNDER_SYMBOL) {
            self.register_return(pc, 1);
        }
    }

    /// Module-unload event: sweep handlers keyed inside the module range.
    pub fn module_unload(&self, module: &ModuleInfo) {
        self.sweep_range(module.start, module.end);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call_args() -> Vec<Opnd> {
        vec![Opnd::Immed(1)]
    }

    #[test]
    fn duplicate_registration_keeps_the_first() {
        let registry = HandlerRegistry::new();
        registry.register_return(0x400100, 1);
        registry.register_return(0x400100, 2);
        registry.register_call(0x400100, CalleeRef("cb"), false, call_args());

        let value = registry.lookup(0x400100, |h| match h.kind {
            HandlerKind::ReturnValue { value } => value,
            _ => panic!("first registration replaced"),
        });
        assert_eq!(value, Some(1));
    }

    #[test]
    fn sweep_removes_only_keys_inside_the_range() {
        let registry = HandlerRegistry::new();
        registry.register_call(0x1000, CalleeRef("a"), false, vec![]);
        registry.register_call(0x2000, CalleeRef("b"), false, vec![]);
        registry.register_call(0x3000, CalleeRef("c"), true, vec![]);

        registry.sweep_range(0x1500, 0x2500);

        assert!(registry.lookup(0x1000, |_| ()).is_some());
        assert!(registry.lookup(0x2000, |_| ()).is_none());
        assert!(registry.lookup(0x3000, |_| ()).is_some());
    }

    #[test]
    fn sweep_bounds_are_exclusive() {
        let registry = HandlerRegistry::new();
        registry.register_return(0x1000, 0);
        registry.register_return(0x2000, 0);
        registry.sweep_range(0x1000, 0x2000);
        assert!(registry.lookup(0x1000, |_| ()).is_some());
        assert!(registry.lookup(0x2000, |_| ()).is_some());
    }

    #[test]
    fn swept_pc_can_be_registered_again() {
        let registry = HandlerRegistry::new();
        registry.register_return(0x2000, 1);
        registry.sweep_range(0x1000, 0x3000);
        registry.register_return(0x2000, 7);
        let value = registry.lookup(0x2000, |h| match h.kind {
            HandlerKind::ReturnValue { value } => value,
            _ => unreachable!(),
        });
        assert_eq!(value, Some(7));
    }

    #[test]
    fn out_of_range_valgrind_id_is_dropped() {
        let registry = HandlerRegistry::new();
        registry.register_valgrind(VG_ID_LAST, |_| 1);
        registry.register_valgrind(VG_ID_LAST + 100, |_| 1);
        // Nothing to observe but the absence of a panic and of a handler.
        let inner = registry.read();
        assert!(inner.valgrind.iter().all(Option::is_none));
    }

    #[test]
    fn markers_for_registered_direct_call() {
        let registry = HandlerRegistry::new();
        registry.register_return(0x400100, 1);

        let call = Instr::call_direct(0x400100, 0x400500, 5);
        let markers = registry.annotation_markers(&call).unwrap();
        assert_eq!(markers.len(), 1);

        let marker = markers.get(0).unwrap();
        assert!(marker.is_label());
        assert!(marker.flags().contains(InstrFlags::ANNOTATION));
        assert!(marker.flags().contains(InstrFlags::DONT_MANGLE));

        let id = registry.read().by_pc[&0x400100];
        assert_eq!(marker.note(), Some(id.0 as u64));
    }

    #[test]
    fn no_markers_for_unregistered_or_indirect_calls() {
        let registry = HandlerRegistry::new();
        registry.register_return(0x400100, 1);

        let other = Instr::call_direct(0x400200, 0x400500, 5);
        assert!(registry.annotation_markers(&other).is_none());

        let indirect = Instr::app(runtime_api::Opcode::CallIndirect, 0x400500, 2);
        assert!(registry.annotation_markers(&indirect).is_none());
    }

    #[test]
    fn module_load_registers_probe_and_unload_sweeps_it() {
        let registry = HandlerRegistry::new();
        let module = ModuleInfo {
            start: 0x7f000000,
            end: 0x7f100000,
            name: "libannotated.so".into(),
            annotation_exports: vec![(RUNNING_UNDER_SYMBOL.into(), 0x7f000480)],
        };
        registry.module_load(&module);
        assert!(registry.lookup(0x7f000480, |_| ()).is_some());

        registry.module_unload(&module);
        assert!(registry.lookup(0x7f000480, |_| ()).is_none());
    }

    struct NoMemory;

    impl AppMemory for NoMemory {
        fn safe_read(&self, _addr: u64, _buf: &mut [u8]) -> bool {
            false
        }
    }

    struct BlockMemory(Vec<u8>);

    impl AppMemory for BlockMemory {
        fn safe_read(&self, addr: u64, buf: &mut [u8]) -> bool {
            let start = addr as usize;
            match self.0.get(start..start + buf.len()) {
                Some(src) => {
                    buf.copy_from_slice(src);
                    true
                }
                None => false,
            }
        }
    }

    #[derive(Default)]
    struct Regs([u64; 16]);

    impl MachineContext for Regs {
        fn reg(&self, reg: runtime_api::Reg) -> u64 {
            self.0[reg.index()]
        }
        fn set_reg(&mut self, reg: runtime_api::Reg, value: u64) {
            self.0[reg.index()] = value;
        }
    }

    fn request_bytes(request: u64, default_result: u64) -> Vec<u8> {
        let mut bytes = Vec::new();
        for w in [request, 0, 0, 0, 0, 0, default_result] {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn unreadable_request_block_leaves_xbx_alone() {
        let registry = HandlerRegistry::new();
        let mut regs = Regs::default();
        regs.set_reg(Arch::X86_64.xbx(), 0x5a5a);
        registry.handle_vg_annotation(&NoMemory, &mut regs, Arch::X86_64, 0x1000);
        assert_eq!(regs.reg(Arch::X86_64.xbx()), 0x5a5a);
    }

    #[test]
    fn unknown_request_yields_default_result() {
        let registry = HandlerRegistry::new();
        let mem = BlockMemory(request_bytes(0x1001, 42));
        let mut regs = Regs::default();
        registry.handle_vg_annotation(&mem, &mut regs, Arch::X86_64, 0);
        assert_eq!(regs.reg(Arch::X86_64.xbx()), 42);
    }

    #[test]
    fn registered_handler_supplies_the_result() {
        let registry = HandlerRegistry::new();
        registry.register_valgrind(VG_ID_MAKE_MEM_DEFINED_IF_ADDRESSABLE, |req| req.args[0] + 1);
        let mem = BlockMemory(request_bytes(VG_USERREQ_MAKE_MEM_DEFINED_IF_ADDRESSABLE, 42));
        let mut regs = Regs::default();
        registry.handle_vg_annotation(&mem, &mut regs, Arch::X86_64, 0);
        // args are all zero in the block above
        assert_eq!(regs.reg(Arch::X86_64.xbx()), 1);
    }
}
