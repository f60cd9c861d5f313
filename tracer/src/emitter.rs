//! Per-block instrumentation emitter.
//!
//! For each application instruction the emitter splices in inline code that
//! appends entries at the thread's buffer pointer, accumulating the pointer
//! advance in `adjust` and committing it with a single add per instruction.
//! At the last instruction of the block it plants the redzone check that
//! branches into the buffer-drain clean call.

use runtime_api::arch::{arm, x86};
use runtime_api::{
    Arch, BlockEvents, HostRuntime, Instr, InstrList, IsaMode, LabelId, Opnd, Pred, Reg, RegSet,
    ScratchRegs, TLS_OFFS_BUF_PTR, TLS_OFFS_DCACHE, TLS_OFFS_ICACHE,
};

use crate::entry::TraceType;
use crate::instru::{instr_to_instr_type, InstruField};
use crate::lifecycle::{Tracer, DRAIN_CALLEE};

/// Upper bound on instruction entries deferred into one bundle.
pub const MAX_NUM_DELAY_INSTRS: usize = 32;

/// Per-block user data threaded through the four block callbacks.
pub struct BlockData {
    pub(crate) last_app_pc: Option<u64>,
    /// Exclusive store whose instrumentation is deferred past the store.
    pub(crate) strex: Option<Instr>,
    pub(crate) delay_instrs: Vec<Instr>,
    /// Block is an expanded repeated-string loop.
    pub(crate) repstr: bool,
    pub(crate) instru_field: InstruField,
}

impl BlockEvents for Tracer {
    type BlockData = BlockData;

    fn app2app(&self, host: &dyn HostRuntime, bb: &mut InstrList) -> BlockData {
        let repstr = match host.expand_rep_string(bb) {
            Ok(repstr) => repstr,
            Err(err) => {
                // Carry on unexpanded; per-iteration refs are lost.
                tracing::error!(error = %err, "failed to expand repeated-string loop");
                false
            }
        };
        BlockData {
            last_app_pc: None,
            strex: None,
            delay_instrs: Vec::new(),
            repstr,
            instru_field: InstruField::default(),
        }
    }

    fn analysis(&self, _host: &dyn HostRuntime, bb: &InstrList, data: &mut BlockData) {
        data.instru_field = self.instru.bb_analysis(bb, data.repstr);
        tracing::trace!(
            block = data.instru_field.block_pc,
            instrs = data.instru_field.num_app_instrs,
            "analyzed block"
        );
    }

    fn instrument(
        &self,
        host: &dyn HostRuntime,
        scratch: &mut dyn ScratchRegs,
        bb: &mut InstrList,
        at: usize,
        data: &mut BlockData,
    ) {
        self.instrument_one(host, scratch, bb, at, data);
    }
}

impl Tracer {
    fn instrument_one(
        &self,
        host: &dyn HostRuntime,
        scratch: &mut dyn ScratchRegs,
        bb: &mut InstrList,
        at: usize,
        data: &mut BlockData,
    ) {
        let arch = host.arch();
        let Some(app) = bb.get(at).cloned() else {
            return;
        };
        let is_first = bb.first_app() == Some(at);
        let is_last = bb.last_app() == Some(at);
        let mut cur = at;

        if self.options.l0_filter && data.repstr && is_first {
            // The expansion's internal jump skips the memref's lazy aflags
            // spill yet reaches its restore; force the spill up front.
            if scratch.reserve_aflags(bb, &mut cur).is_err()
                || scratch.unreserve_aflags(bb, &mut cur).is_err()
            {
                tracing::error!("failed to reserve aflags");
                panic!()
            }
        }

        // Identical app PCs come from repeated-string expansion; their fetch
        // is covered by the pre-expansion entry.
        let same_pc = app.app_pc().is_some() && data.last_app_pc == app.app_pc();
        if (!app.is_app() || same_pc)
            && data.strex.is_none()
            // Offline wants an instr entry at the start of every block.
            && (!self.options.offline || !is_first)
        {
            return;
        }

        // Move exclusive-store instrumentation past the store itself so its
        // memref entry reflects a completed store.
        if data.strex.is_none() && app.is_exclusive_store() {
            let dst = app.dst(0).copied();
            debug_assert!(dst.is_some_and(|d| d.is_memory_reference()));
            if let Some(base) = dst.and_then(|d| d.base_reg()) {
                // A strex overwriting its own base can't be re-examined at
                // the next instruction.
                if !app.writes_to_reg(base) {
                    data.strex = Some(app.clone());
                    data.last_app_pc = app.app_pc();
                }
            }
            return;
        }

        // Delay plain instruction fetches and emit them later as one bundle.
        if (!self.options.offline || !is_first)
            && !(app.reads_memory() || app.writes_memory())
            // Never drop trailing instrs.
            && !is_last
            // Never bundle instrs whose types the stream separates.
            && (instr_to_instr_type(&app) == TraceType::Instr
                || (!self.options.offline && !self.options.online_instr_types))
            && data.strex.is_none()
            // No bundling with a filter.
            && !self.options.l0_filter
            && data.delay_instrs.len() < MAX_NUM_DELAY_INSTRS
        {
            data.delay_instrs.push(app);
            return;
        }

        let pred = app.predicate();

        // Two scratch registers, spilled once per instruction instead of per
        // entry. The first must be XCX on x86 (jecxz) and r7-or-lower on ARM
        // (cbnz).
        let mut rvec1 = RegSet::fill(false);
        let mut rvec2 = RegSet::fill(true);
        match arch {
            Arch::X86 | Arch::X86_64 => {
                rvec1.set(x86::XCX, true);
                if self.options.l0_filter {
                    // The filter preserves flags in XAX.
                    rvec2.set(x86::XAX, false);
                }
            }
            Arch::Arm => {
                for r in 0..=7u16 {
                    rvec1.set(Reg(r), true);
                }
            }
            Arch::Aarch64 => {
                rvec1 = RegSet::fill(true);
            }
        }
        let (Ok(reg_ptr), Ok(reg_tmp)) = (
            scratch.reserve(bb, &mut cur, Some(&rvec1)),
            scratch.reserve(bb, &mut cur, Some(&rvec2)),
        ) else {
            tracing::error!("failed to reserve scratch registers");
            panic!()
        };

        let mut adjust = 0i32;
        if !self.options.l0_filter {
            self.insert_load_buf_ptr(bb, &mut cur, reg_ptr);
        }

        if !data.delay_instrs.is_empty() {
            adjust = self.instrument_delay_instrs(bb, &mut cur, data, reg_ptr, reg_tmp, adjust);
        }

        if let Some(strex) = data.strex.take() {
            debug_assert!(strex.is_exclusive_store());
            adjust = self.instrument_instr_entry(
                arch, scratch, bb, &mut cur, data, reg_ptr, reg_tmp, adjust, &strex,
            );
            if let Some(dst) = strex.dst(0).copied() {
                adjust = self.instrument_memref_entry(
                    arch,
                    scratch,
                    bb,
                    &mut cur,
                    data,
                    reg_ptr,
                    reg_tmp,
                    adjust,
                    &strex,
                    &dst,
                    true,
                    strex.predicate(),
                );
            }
        }

        // The instruction entry doubles as the PC provider for this
        // instruction's data entries.
        let is_memref = app.reads_memory() || app.writes_memory();
        if is_memref || !data.repstr {
            adjust = self.instrument_instr_entry(
                arch, scratch, bb, &mut cur, data, reg_ptr, reg_tmp, adjust, &app,
            );
        }
        data.last_app_pc = app.app_pc();

        if is_memref {
            if matches!(pred, Some(p) if p.is_conditional()) && adjust != 0 {
                // The predicated entries below may not execute; commit the
                // pending advance unconditionally first.
                self.insert_update_buf_ptr(arch, bb, &mut cur, reg_ptr, None, adjust);
                adjust = 0;
            }

            let srcs: Vec<Opnd> = app.memory_srcs().copied().collect();
            for mem_ref in &srcs {
                adjust = self.instrument_memref_entry(
                    arch, scratch, bb, &mut cur, data, reg_ptr, reg_tmp, adjust, &app, mem_ref,
                    false, pred,
                );
            }
            let dsts: Vec<Opnd> = app.memory_dsts().copied().collect();
            for mem_ref in &dsts {
                adjust = self.instrument_memref_entry(
                    arch, scratch, bb, &mut cur, data, reg_ptr, reg_tmp, adjust, &app, mem_ref,
                    true, pred,
                );
            }
            if adjust != 0 {
                self.insert_update_buf_ptr(arch, bb, &mut cur, reg_ptr, pred, adjust);
            }
        } else if adjust != 0 {
            self.insert_update_buf_ptr(arch, bb, &mut cur, reg_ptr, None, adjust);
        }

        if is_last {
            if self.options.l0_filter {
                self.insert_load_buf_ptr(bb, &mut cur, reg_ptr);
            }
            self.instrument_clean_call(host, bb, &mut cur, reg_ptr, reg_tmp);
        }

        if scratch.unreserve(bb, &mut cur, reg_ptr).is_err()
            || scratch.unreserve(bb, &mut cur, reg_tmp).is_err()
        {
            tracing::error!("failed to unreserve scratch registers");
            panic!()
        }
    }

    fn insert_load_buf_ptr(&self, bb: &mut InstrList, at: &mut usize, reg_ptr: Reg) {
        bb.insert_before(at, Instr::load(reg_ptr, Opnd::TlsSlot(TLS_OFFS_BUF_PTR)));
    }

    fn insert_update_buf_ptr(
        &self,
        arch: Arch,
        bb: &mut InstrList,
        at: &mut usize,
        reg_ptr: Reg,
        pred: Option<Pred>,
        adjust: i32,
    ) {
        if adjust == 0 {
            return;
        }
        let start = *at;
        let (_, label) = bb.new_label();
        bb.insert_before(at, label);
        bb.insert_before(at, Instr::add(reg_ptr, Opnd::Immed(adjust as i64)));
        bb.insert_before(at, Instr::store(Opnd::TlsSlot(TLS_OFFS_BUF_PTR), reg_ptr));
        // x86 has no general predicated execution; with a filter the skip
        // branch already jumps over this for a false predicate.
        if arch.has_predication() && !self.options.l0_filter {
            if let Some(p) = pred {
                if p.is_conditional() {
                    for idx in start + 1..*at {
                        if let Some(instr) = bb.get_mut(idx) {
                            debug_assert!(!instr.is_predicated());
                            instr.set_predicate(p);
                        }
                    }
                }
            }
        }
    }

    fn instrument_delay_instrs(
        &self,
        bb: &mut InstrList,
        at: &mut usize,
        data: &mut BlockData,
        reg_ptr: Reg,
        reg_tmp: Reg,
        mut adjust: i32,
    ) -> i32 {
        if data.repstr {
            // The expansion keeps a string loop in a block of its own; the
            // pre-expansion entry already covers its fetch.
            data.delay_instrs.clear();
            return adjust;
        }
        // Full entry for the first delayed instruction, bundle for the rest.
        adjust =
            self.instru
                .instrument_instr(bb, at, reg_ptr, reg_tmp, adjust, &data.delay_instrs[0]);
        if self.have_phys() {
            // Bundles may cross page boundaries.
            for instr in &data.delay_instrs[1..] {
                adjust = self
                    .instru
                    .instrument_instr(bb, at, reg_ptr, reg_tmp, adjust, instr);
            }
        } else {
            adjust = self.instru.instrument_ibundle(
                bb,
                at,
                reg_ptr,
                reg_tmp,
                adjust,
                &data.delay_instrs[1..],
            );
        }
        data.delay_instrs.clear();
        adjust
    }

    #[allow(clippy::too_many_arguments)]
    fn instrument_instr_entry(
        &self,
        arch: Arch,
        scratch: &mut dyn ScratchRegs,
        bb: &mut InstrList,
        at: &mut usize,
        data: &mut BlockData,
        reg_ptr: Reg,
        reg_tmp: Reg,
        adjust: i32,
        app: &Instr,
    ) -> i32 {
        let (skip, skip_label) = bb.new_label();
        let mut reg_third = None;
        if self.options.l0_filter {
            match self.insert_filter_addr(
                arch,
                scratch,
                bb,
                at,
                data,
                reg_ptr,
                reg_tmp,
                None,
                Some(app),
                skip,
                None,
            ) {
                None => return adjust, // same-line fetch: no entry
                Some(reg) => reg_third = Some(reg),
            }
            self.insert_load_buf_ptr(bb, at, reg_ptr); // else already loaded
        }
        let mut adjust = self
            .instru
            .instrument_instr(bb, at, reg_ptr, reg_tmp, adjust, app);
        if self.options.l0_filter && adjust != 0 {
            // Adjustments can't be combined across a filter skip.
            self.insert_update_buf_ptr(arch, bb, at, reg_ptr, None, adjust);
            adjust = 0;
        }
        bb.insert_before(at, skip_label);
        self.unreserve_filter_regs(scratch, bb, at, reg_third);
        adjust
    }

    #[allow(clippy::too_many_arguments)]
    fn instrument_memref_entry(
        &self,
        arch: Arch,
        scratch: &mut dyn ScratchRegs,
        bb: &mut InstrList,
        at: &mut usize,
        data: &mut BlockData,
        reg_ptr: Reg,
        reg_tmp: Reg,
        adjust: i32,
        app: &Instr,
        mem_ref: &Opnd,
        write: bool,
        pred: Option<Pred>,
    ) -> i32 {
        let (skip, skip_label) = bb.new_label();
        let mut reg_third = None;
        if self.options.l0_filter {
            match self.insert_filter_addr(
                arch,
                scratch,
                bb,
                at,
                data,
                reg_ptr,
                reg_tmp,
                Some(mem_ref),
                None,
                skip,
                pred,
            ) {
                None => return adjust,
                Some(reg) => reg_third = Some(reg),
            }
            self.insert_load_buf_ptr(bb, at, reg_ptr);
        }
        let mut adjust = self
            .instru
            .instrument_memref(bb, at, reg_ptr, reg_tmp, adjust, app, mem_ref, write, pred);
        if self.options.l0_filter && adjust != 0 {
            self.insert_update_buf_ptr(arch, bb, at, reg_ptr, pred, adjust);
            adjust = 0;
        }
        bb.insert_before(at, skip_label);
        self.unreserve_filter_regs(scratch, bb, at, reg_third);
        adjust
    }

    /// Register parity on all paths: the filter scratches spill before the
    /// skip branch, so they must restore after the skip target.
    fn unreserve_filter_regs(
        &self,
        scratch: &mut dyn ScratchRegs,
        bb: &mut InstrList,
        at: &mut usize,
        reg_third: Option<Reg>,
    ) {
        if !self.options.l0_filter {
            return;
        }
        if let Some(reg) = reg_third {
            if scratch.unreserve(bb, at, reg).is_err() {
                tracing::error!("failed to unreserve filter scratch register");
                panic!()
            }
        }
        if scratch.unreserve_aflags(bb, at).is_err() {
            tracing::error!("failed to unreserve aflags");
            panic!()
        }
    }

    /// Inline direct-mapped cache lookup in front of an entry write.
    ///
    /// Returns the third scratch register to restore after the skip label,
    /// or `None` when the entry needs no instrumentation at all (an
    /// instruction fetch on the same line as the previous one).
    #[allow(clippy::too_many_arguments)]
    fn insert_filter_addr(
        &self,
        arch: Arch,
        scratch: &mut dyn ScratchRegs,
        bb: &mut InstrList,
        at: &mut usize,
        data: &mut BlockData,
        reg_ptr: Reg,
        reg_addr: Reg,
        mem_ref: Option<&Opnd>,
        app: Option<&Instr>,
        skip: LabelId,
        pred: Option<Pred>,
    ) -> Option<Reg> {
        debug_assert!(self.options.l0_filter);
        let is_icache = mem_ref.is_none();
        let cache_size = if is_icache {
            self.options.l0i_size
        } else {
            self.options.l0d_size
        };
        let mask = (cache_size / self.options.line_size - 1) as i64;
        let line_bits = self.options.line_size.trailing_zeros() as i64;
        let offs = if is_icache {
            TLS_OFFS_ICACHE
        } else {
            TLS_OFFS_DCACHE
        };
        if is_icache {
            // Fetches on the line just probed skip the filter entirely. A
            // fetch straddling two lines gets one lookup only.
            let app_pc = app.and_then(Instr::app_pc);
            if let (Some(last), Some(pc)) = (data.last_app_pc, app_pc) {
                let prior_line = (last >> line_bits) & mask as u64;
                let new_line = (pc >> line_bits) & mask as u64;
                if prior_line == new_line {
                    return None;
                }
            }
            data.last_app_pc = app_pc;
        }
        if scratch.reserve_aflags(bb, at).is_err() {
            tracing::error!("failed to reserve aflags");
            panic!()
        }
        // Third scratch. The tag clobbers reg_addr and the caller recomputes
        // the app address on a miss, keeping the hit path short.
        let Ok(reg_idx) = scratch.reserve(bb, at, None) else {
            tracing::error!("failed to reserve third scratch register");
            panic!()
        };
        if arch.has_predication() {
            if let Some(p) = pred {
                if p.is_conditional() {
                    // The lookup has a branch of its own, so it can't be
                    // predicated wholesale; jump over it when the memref
                    // won't execute. After the spills, for path parity.
                    bb.insert_before(at, Instr::jump_cond(p.invert(), Opnd::Label(skip)));
                }
            }
        }
        match (mem_ref, app) {
            (Some(mem_ref), _) => self.instru.insert_obtain_addr(bb, at, reg_addr, mem_ref),
            (None, Some(app)) => {
                bb.insert_before(
                    at,
                    Instr::load_int(reg_addr, app.app_pc().unwrap_or(0) as i64),
                );
            }
            (None, None) => {}
        }
        bb.insert_before(at, Instr::shr(reg_addr, line_bits));
        bb.insert_before(at, Instr::move_reg(reg_idx, reg_addr));
        if !arch.is_x86_family() {
            // The mask rarely fits an ARM immediate.
            bb.insert_before(at, Instr::load_int(reg_ptr, mask));
        }
        let mask_opnd = if arch.is_x86_family() {
            Opnd::Immed(mask)
        } else {
            Opnd::Reg(reg_ptr)
        };
        bb.insert_before(at, Instr::and(reg_idx, mask_opnd));
        bb.insert_before(at, Instr::load(reg_ptr, Opnd::TlsSlot(offs)));
        // Loading base + scaled index would clobber the index reg, and the
        // slot address is needed again to store on a miss.
        let word_bits = if arch.is_64() { 3 } else { 2 };
        bb.insert_before(at, Instr::add_scaled(reg_ptr, reg_ptr, reg_idx, word_bits));
        bb.insert_before(at, Instr::load(reg_idx, Opnd::mem(reg_ptr, 0)));
        bb.insert_before(at, Instr::cmp(Opnd::Reg(reg_idx), Opnd::Reg(reg_addr)));
        bb.insert_before(at, Instr::jump_cond(Pred::Eq, Opnd::Label(skip)));
        // Miss: install the new line's tag and fall through to the entry.
        bb.insert_before(at, Instr::store(Opnd::mem(reg_ptr, 0), reg_addr));
        if let Some(mem_ref) = mem_ref {
            if mem_ref.uses_reg(reg_idx) {
                let _ = scratch.restore_app_value(bb, at, reg_idx, reg_idx);
            }
        }
        Some(reg_idx)
    }

    /// Redzone check: load the word at the write pointer and call the drain
    /// when it is non-zero (entries have reached the sentinel).
    fn instrument_clean_call(
        &self,
        host: &dyn HostRuntime,
        bb: &mut InstrList,
        at: &mut usize,
        reg_ptr: Reg,
        reg_tmp: Reg,
    ) {
        let arch = host.arch();
        let (skip, skip_label) = bb.new_label();
        bb.insert_before(at, Instr::load(reg_ptr, Opnd::mem(reg_ptr, 0)));
        match arch {
            Arch::X86 | Arch::X86_64 => {
                debug_assert_eq!(reg_ptr, x86::XCX);
                if host.profile_pcs() {
                    // PC profiling pads the clean call beyond jecxz reach;
                    // invert through a long-jump stub.
                    let (should_skip, should_skip_label) = bb.new_label();
                    let (no_skip, no_skip_label) = bb.new_label();
                    bb.insert_before(at, Instr::jecxz(Opnd::Label(should_skip)));
                    bb.insert_before(at, Instr::jump(Opnd::Label(no_skip)));
                    bb.insert_before(at, should_skip_label);
                    bb.insert_before(at, Instr::jump(Opnd::Label(skip)));
                    bb.insert_before(at, no_skip_label);
                } else {
                    bb.insert_before(at, Instr::jecxz(Opnd::Label(skip)));
                }
            }
            Arch::Arm => {
                if host.arm_isa_mode() == IsaMode::Thumb {
                    // The clean call is too long for cbz to skip directly.
                    let (no_skip, no_skip_label) = bb.new_label();
                    debug_assert!(reg_ptr <= arm::R7); // cbnz can't take r8+
                    bb.insert_before(at, Instr::cbnz(Opnd::Label(no_skip), reg_ptr));
                    bb.insert_before(at, Instr::jump(Opnd::Label(skip)));
                    bb.insert_before(at, no_skip_label);
                } else {
                    // A32 has no compare-and-branch; spill the flags around
                    // an explicit compare.
                    bb.insert_before(at, Instr::save_flags(reg_tmp));
                    bb.insert_before(at, Instr::cmp(Opnd::Reg(reg_ptr), Opnd::Immed(0)));
                    bb.insert_before(at, Instr::jump_cond(Pred::Eq, Opnd::Label(skip)));
                }
            }
            Arch::Aarch64 => {
                bb.insert_before(at, Instr::cbz(Opnd::Label(skip), reg_ptr));
            }
        }
        host.insert_clean_call(bb, at, DRAIN_CALLEE, false, &[]);
        bb.insert_before(at, skip_label);
        if arch == Arch::Arm && host.arm_isa_mode() == IsaMode::A32 {
            bb.insert_before(at, Instr::restore_flags(reg_tmp));
        }
    }
}
