//! Recognition of the Valgrind client-request instruction pattern.
//!
//! The annotated program marks a request with four left-rotates of the "XDI"
//! register by architecture-specific immediates, followed by an exchange of
//! the "XBX" register with itself. The rotates are no-ops at full rotation
//! width; the exchange is the trigger the interpreter probes for.

use runtime_api::{Arch, HostRuntime, Instr, InstrList, Opcode, Opnd};

use crate::valgrind::VALGRIND_ANNOTATION_ROL_COUNT;
use crate::VG_ANNOTATION_CALLEE;

/// Immediate operands of the rotate preamble, in program order.
pub fn expected_rol_immeds(arch: Arch) -> [i64; VALGRIND_ANNOTATION_ROL_COUNT] {
    if arch.is_64() {
        [3, 13, 61, 51]
    } else {
        [3, 13, 29, 19]
    }
}

/// Verify the candidate exchange and the preceding rotates; on a match,
/// rewrite the block in place and return true. On no match the block is
/// untouched.
///
/// The caller has already established that `xchg` is an exchange decoded
/// right after the instructions currently in `bb`; it is not part of the
/// block yet and is dropped by the caller on a match.
pub fn match_valgrind_pattern(host: &dyn HostRuntime, bb: &mut InstrList, xchg: &Instr) -> bool {
    let arch = host.arch();
    let xbx = Opnd::Reg(arch.xbx());
    if xchg.src(0) != Some(&xbx) || xchg.dst(0) != Some(&xbx) {
        return false;
    }

    let immeds = expected_rol_immeds(arch);
    if bb.len() < VALGRIND_ANNOTATION_ROL_COUNT {
        return false;
    }
    let xdi = Opnd::Reg(arch.xdi());
    for i in (0..VALGRIND_ANNOTATION_ROL_COUNT).rev() {
        let walk = bb.len() - (VALGRIND_ANNOTATION_ROL_COUNT - i);
        let Some(instr) = bb.get(walk) else {
            return false;
        };
        if instr.opcode() != Opcode::Rol {
            return false;
        }
        let Some(src) = instr.src(0) else {
            return false;
        };
        if !src.is_immed() || src.immed_value() != Some(immeds[i]) {
            return false;
        }
        if instr.dst(0) != Some(&xdi) {
            return false;
        }
    }

    tracing::trace!(
        pc = xchg.translation().unwrap_or(0),
        "matched valgrind client request pattern"
    );

    /* The argument-gathering code before the rotates stays: it writes app
     * registers and must execute as app code. */
    let xchg_xl8 = xchg.translation();

    for _ in 0..VALGRIND_ANNOTATION_ROL_COUNT {
        bb.remove_last();
    }

    /* Write XBX so register-analysis code sees a definite value; the clean
     * callee overwrites it with the request result. */
    let mut zero_xbx = Instr::xor(arch.xbx(), Opnd::Reg(arch.xbx()));
    if let Some(pc) = xchg_xl8 {
        zero_xbx.set_translation(pc);
    }
    bb.append(zero_xbx);

    host.append_clean_call(bb, VG_ANNOTATION_CALLEE, &[Opnd::Reg(arch.xax())]);

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use runtime_api::{ExpandError, InstrFlags};

    struct TestHost(Arch);

    impl HostRuntime for TestHost {
        fn arch(&self) -> Arch {
            self.0
        }
        fn thread_id(&self) -> u32 {
            1
        }
        fn process_id(&self) -> u32 {
            100
        }
        fn app_name(&self) -> &str {
            "app"
        }
        fn expand_rep_string(&self, _bb: &mut InstrList) -> Result<bool, ExpandError> {
            Ok(false)
        }
    }

    fn rol_block(arch: Arch, immeds: [i64; 4]) -> InstrList {
        let mut bb = InstrList::new();
        for (i, immed) in immeds.into_iter().enumerate() {
            let mut rol = Instr::rol(arch.xdi(), immed);
            rol.set_translation(0x400000 + i as u64 * 3);
            bb.append(rol);
        }
        bb
    }

    fn xchg_xbx(arch: Arch) -> Instr {
        let xbx = Opnd::Reg(arch.xbx());
        let mut xchg = Instr::xchg(xbx, xbx);
        xchg.set_translation(0x40000c);
        xchg
    }

    #[test]
    fn matches_x86_immediates() {
        let arch = Arch::X86;
        let mut bb = rol_block(arch, [3, 13, 29, 19]);
        assert!(match_valgrind_pattern(&TestHost(arch), &mut bb, &xchg_xbx(arch)));

        assert_eq!(bb.len(), 2);
        let xor = bb.get(0).unwrap();
        assert_eq!(xor.opcode(), Opcode::Xor);
        assert_eq!(xor.dst(0), Some(&Opnd::Reg(arch.xbx())));
        assert_eq!(xor.translation(), Some(0x40000c));
        let call = bb.get(1).unwrap();
        assert_eq!(call.opcode(), Opcode::CleanCall);
        assert_eq!(call.callee(), Some(VG_ANNOTATION_CALLEE));
        assert_eq!(call.src(0), Some(&Opnd::Reg(arch.xax())));
    }

    #[test]
    fn matches_x64_immediates() {
        let arch = Arch::X86_64;
        let mut bb = rol_block(arch, [3, 13, 61, 51]);
        assert!(match_valgrind_pattern(&TestHost(arch), &mut bb, &xchg_xbx(arch)));
        assert_eq!(bb.len(), 2);
    }

    #[test]
    fn rejects_wrong_immediates_per_arch() {
        // x86 immediates presented to an x64 matcher must not match.
        let arch = Arch::X86_64;
        let mut bb = rol_block(arch, [3, 13, 29, 19]);
        assert!(!match_valgrind_pattern(&TestHost(arch), &mut bb, &xchg_xbx(arch)));
        assert_eq!(bb.len(), 4); // untouched
        assert_eq!(bb.get(0).unwrap().opcode(), Opcode::Rol);
    }

    #[test]
    fn rejects_rotates_of_wrong_register() {
        let arch = Arch::X86;
        let mut bb = InstrList::new();
        for immed in [3, 13, 29, 19] {
            bb.append(Instr::rol(arch.xbx(), immed));
        }
        assert!(!match_valgrind_pattern(&TestHost(arch), &mut bb, &xchg_xbx(arch)));
        assert_eq!(bb.len(), 4);
    }

    #[test]
    fn rejects_exchange_of_other_registers() {
        let arch = Arch::X86;
        let mut bb = rol_block(arch, [3, 13, 29, 19]);
        let xax = Opnd::Reg(arch.xax());
        let xchg = Instr::xchg(xax, xax);
        assert!(!match_valgrind_pattern(&TestHost(arch), &mut bb, &xchg));
        assert_eq!(bb.len(), 4);
    }

    #[test]
    fn rejects_short_blocks() {
        let arch = Arch::X86;
        let mut bb = InstrList::new();
        bb.append(Instr::rol(arch.xdi(), 19));
        assert!(!match_valgrind_pattern(&TestHost(arch), &mut bb, &xchg_xbx(arch)));
        assert_eq!(bb.len(), 1);
    }

    #[test]
    fn surrounding_code_survives_rewrite() {
        let arch = Arch::Aarch64;
        let mut bb = InstrList::new();
        let lea = Instr::app(Opcode::Lea, 0x500000, 4);
        bb.append(lea.clone());
        for immed in expected_rol_immeds(arch) {
            bb.append(Instr::rol(arch.xdi(), immed));
        }
        assert!(match_valgrind_pattern(&TestHost(arch), &mut bb, &xchg_xbx(arch)));
        assert_eq!(bb.len(), 3);
        assert_eq!(bb.get(0), Some(&lea));
        assert!(!bb.get(1).unwrap().flags().contains(InstrFlags::APP));
    }
}
