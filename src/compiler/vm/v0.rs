//! The `v0` interpreter: the one concrete `generic_vm` variant (spec §9
//! "Polymorphism" — a trait-object axis with a single implementor today).
//! Builds the threaded-dispatch VM as x86-64 machine code via
//! [`iced_x86::code_asm`] and lays out its data section (spec §4.4).

use crate::consts::page_round_up;
use crate::error::{CovirtError, Result};
use crate::rng;
use iced_x86::code_asm::*;
use iced_x86::IcedError;

use super::super::opcode::VTABLE_SLOTS;

/// Offsets of every field in the VM's `.data` area, relative to where that
/// area starts in the finished section (spec §4.4 "Layout"). `code_len` is
/// the size of the handler code, rounded up to a page boundary, before this
/// area begins.
pub struct GeneratedVm {
    pub bytes: Vec<u8>,
    pub data_start: usize,
    pub vcode_offset: usize,
    pub saved_rsp_offset: usize,
    pub vsp_offset: usize,
    pub vip_offset: usize,
    pub vstack_offset: usize,
    pub retaddr_offset: usize,
    pub vtable_offset: usize,
}

impl GeneratedVm {
    /// Absolute runtime address of `vcode`, given the VM section's own
    /// runtime base address.
    pub fn vcode_va(&self, section_va: u64) -> u64 {
        section_va + (self.data_start + self.vcode_offset) as u64
    }

    pub fn retaddr_va(&self, section_va: u64) -> u64 {
        section_va + (self.data_start + self.retaddr_offset) as u64
    }

    pub fn venter_call_target(&self) -> u64 {
        // `venter` is always the very first instruction emitted (spec
        // §4.4 "Entry handler"), so it sits at offset 0 of `bytes`.
        0
    }
}

/// Every named label the interpreter's code and data reference, mirroring
/// the original's label-per-handler map but as typed fields instead of a
/// string-keyed table (spec §9 "Dynamic dispatch inside handlers").
struct Labels {
    venter: CodeLabel,
    vexit: CodeLabel,
    vpush_imm: CodeLabel,
    vpush_reg: CodeLabel,
    vpop: CodeLabel,
    vread: CodeLabel,
    vwrite: CodeLabel,
    vadd: CodeLabel,
    vsub: CodeLabel,
    vxor: CodeLabel,
    vand: CodeLabel,
    vor: CodeLabel,
    vcmp: CodeLabel,
    vjmp: CodeLabel,
    vjz: CodeLabel,
    vjnz: CodeLabel,
    vjb: CodeLabel,
    vjnb: CodeLabel,
    vjbe: CodeLabel,
    vjnbe: CodeLabel,
    vjl: CodeLabel,
    vjle: CodeLabel,
    vjnl: CodeLabel,
    vjnle: CodeLabel,
    vcall: CodeLabel,
    vlea: CodeLabel,
    vexenative: CodeLabel,
    vcode: CodeLabel,
    saved_rsp: CodeLabel,
    vsp_slot: CodeLabel,
    vip_slot: CodeLabel,
    vstack: CodeLabel,
    retaddr: CodeLabel,
    vtable: CodeLabel,
}

impl Labels {
    fn create(a: &mut CodeAssembler) -> Self {
        Self {
            venter: a.create_label(),
            vexit: a.create_label(),
            vpush_imm: a.create_label(),
            vpush_reg: a.create_label(),
            vpop: a.create_label(),
            vread: a.create_label(),
            vwrite: a.create_label(),
            vadd: a.create_label(),
            vsub: a.create_label(),
            vxor: a.create_label(),
            vand: a.create_label(),
            vor: a.create_label(),
            vcmp: a.create_label(),
            vjmp: a.create_label(),
            vjz: a.create_label(),
            vjnz: a.create_label(),
            vjb: a.create_label(),
            vjnb: a.create_label(),
            vjbe: a.create_label(),
            vjnbe: a.create_label(),
            vjl: a.create_label(),
            vjle: a.create_label(),
            vjnl: a.create_label(),
            vjnle: a.create_label(),
            vcall: a.create_label(),
            vlea: a.create_label(),
            vexenative: a.create_label(),
            vcode: a.create_label(),
            saved_rsp: a.create_label(),
            vsp_slot: a.create_label(),
            vip_slot: a.create_label(),
            vstack: a.create_label(),
            retaddr: a.create_label(),
            vtable: a.create_label(),
        }
    }

    /// `vtable` slot order, matching [`crate::compiler::opcode::ALL_OPCODES`]
    /// exactly (spec §4.4 "Dispatch"): `venter` is reached through `call`,
    /// not the opcode-byte dispatch, and so is deliberately excluded here —
    /// including it would shift every opcode's numeric value off its table
    /// slot.
    fn vtable_entries(&self) -> Vec<CodeLabel> {
        vec![
            self.vexit,
            self.vpush_imm,
            self.vpush_reg,
            self.vpop,
            self.vread,
            self.vwrite,
            self.vadd,
            self.vsub,
            self.vxor,
            self.vand,
            self.vor,
            self.vcmp,
            self.vjmp,
            self.vjz,
            self.vjnz,
            self.vjb,
            self.vjnb,
            self.vjbe,
            self.vjnbe,
            self.vjl,
            self.vjle,
            self.vjnl,
            self.vjnle,
            self.vcall,
            self.vlea,
            self.vexenative,
        ]
    }
}

fn err(pass: &str, e: IcedError) -> CovirtError {
    CovirtError::SerializerFailure { pass: pass.to_string(), message: e.to_string() }
}

/// Registers holding VIP/VSP throughout the interpreter (spec §4.4 "Register
/// conventions"): `VIP` = RAX, `VSP` = RSI.
const VIP: AsmRegister64 = rax;
const VSP: AsmRegister64 = rsi;

/// Lazily populate a runtime jump table once: if the first qword at `table`
/// is already non-zero, skip straight past (spec §8 invariant 8, SPEC_FULL.md
/// §7 "idempotent dispatch-table init").
fn lazy_init_table(a: &mut CodeAssembler, table: CodeLabel, entries: &[CodeLabel]) -> Result<()> {
    let pass = a.create_label();

    a.cmp(qword_ptr(table), 0).map_err(|e| err("vm", e))?;
    a.jne(pass).map_err(|e| err("vm", e))?;

    a.lea(r9, qword_ptr(table)).map_err(|e| err("vm", e))?;
    for entry in entries {
        a.lea(r10, qword_ptr(*entry)).map_err(|e| err("vm", e))?;
        a.mov(qword_ptr(r9), r10).map_err(|e| err("vm", e))?;
        a.add(r9, 8).map_err(|e| err("vm", e))?;
    }

    a.set_label(&mut { pass }).map_err(|e| err("vm", e))?;
    Ok(())
}

/// Indirect-jump through a table previously populated by [`lazy_init_table`],
/// using the 0..3 size code already sitting in `cl`/`rcx`, then reserve the
/// table's own backing storage inline (spec's `jump_using_table`).
fn dispatch_via_table(a: &mut CodeAssembler, table: CodeLabel, slots: usize) -> Result<()> {
    a.lea(r9, qword_ptr(table)).map_err(|e| err("vm", e))?;
    a.jmp(qword_ptr(r9 + rcx * 8u32)).map_err(|e| err("vm", e))?;

    let mut table = table;
    a.set_label(&mut table).map_err(|e| err("vm", e))?;
    a.dq(&vec![0u64; slots]).map_err(|e| err("vm", e))?;
    Ok(())
}

/// `movzx rcx, [vip]; and cl, 0x3F; lea r9, [rip+vtable]; jmp [r9+rcx*8]`
/// (spec §4.4 "Dispatch").
fn vm_next_instruction(a: &mut CodeAssembler, labels: &Labels, bind_at: Option<CodeLabel>) -> Result<()> {
    if let Some(mut label) = bind_at {
        a.set_label(&mut label).map_err(|e| err("vm", e))?;
    }
    a.movzx(rcx, byte_ptr(VIP)).map_err(|e| err("vm", e))?;
    a.and(cl, 0b0011_1111i32).map_err(|e| err("vm", e))?;
    a.lea(r9, qword_ptr(labels.vtable)).map_err(|e| err("vm", e))?;
    a.jmp(qword_ptr(r9 + rcx * 8u32)).map_err(|e| err("vm", e))?;
    Ok(())
}

/// `movzx rcx, [vip]; shr cl, 6; add vip, 1` — extract the 2-bit size code
/// (spec §3 `OOOO_OOSS`) and advance past the opcode byte.
fn get_size_from_opcode(a: &mut CodeAssembler, mut bind_at: CodeLabel) -> Result<()> {
    a.set_label(&mut bind_at).map_err(|e| err("vm", e))?;
    a.movzx(rcx, byte_ptr(VIP)).map_err(|e| err("vm", e))?;
    a.shr(cl, 6).map_err(|e| err("vm", e))?;
    a.add(VIP, 1).map_err(|e| err("vm", e))?;
    Ok(())
}

/// `rdx = &vreg[vip[0]]`, i.e. `saved_rsp − 16*8 + idx*8` (spec §4.4
/// "Register conventions").
fn get_vreg_address(a: &mut CodeAssembler, labels: &Labels) -> Result<()> {
    a.mov(r9, qword_ptr(labels.saved_rsp)).map_err(|e| err("vm", e))?;
    a.sub(r9, 16 * 8).map_err(|e| err("vm", e))?;
    a.movzx(r10, byte_ptr(VIP)).map_err(|e| err("vm", e))?;
    a.lea(rdx, qword_ptr(r9 + r10 * 8u32)).map_err(|e| err("vm", e))?;
    a.add(VIP, 1).map_err(|e| err("vm", e))?;
    Ok(())
}

/// Same addressing as [`get_vreg_address`] but loads the value, not the
/// address.
fn get_vreg_value(a: &mut CodeAssembler, labels: &Labels) -> Result<()> {
    a.mov(r9, qword_ptr(labels.saved_rsp)).map_err(|e| err("vm", e))?;
    a.sub(r9, 16 * 8).map_err(|e| err("vm", e))?;
    a.movzx(r10, byte_ptr(VIP)).map_err(|e| err("vm", e))?;
    a.mov(rdx, qword_ptr(r9 + r10 * 8u32)).map_err(|e| err("vm", e))?;
    a.add(VIP, 1).map_err(|e| err("vm", e))?;
    Ok(())
}

/// Push every host GPR the VM borrows, in the fixed order that defines v-reg
/// index semantics (spec §4.4 "Entry handler": "R15..RAX, then pushfq").
fn push_all_gprs(a: &mut CodeAssembler, labels: &Labels) -> Result<()> {
    for reg in [r15, r14, r13, r12, r11, r10, r9, r8, rdi, rsi, rbp] {
        a.push(reg).map_err(|e| err("vm", e))?;
    }
    a.push(qword_ptr(labels.saved_rsp)).map_err(|e| err("vm", e))?;
    for reg in [rbx, rdx, rcx, rax] {
        a.push(reg).map_err(|e| err("vm", e))?;
    }
    a.pushfq().map_err(|e| err("vm", e))?;
    Ok(())
}

/// Inverse of [`push_all_gprs`]. The slot that held the saved-RSP snapshot
/// is discarded into `rbp` twice in a row — the first pop is a throwaway,
/// matching the original's own comment (`// rsp`).
fn pop_all_gprs(a: &mut CodeAssembler) -> Result<()> {
    a.popfq().map_err(|e| err("vm", e))?;
    for reg in [rax, rcx, rdx, rbx, rbp, rbp, rsi, rdi, r8, r9, r10, r11, r12, r13, r14, r15] {
        a.pop(reg).map_err(|e| err("vm", e))?;
    }
    Ok(())
}

/// One arithmetic/comparison opcode's four size variants (spec's `varith`
/// lambda template): pop two operands, combine, push the result.
fn emit_arith_variants(
    a: &mut CodeAssembler,
    variant_labels: &[CodeLabel; 4],
    op: impl Fn(&mut CodeAssembler, AsmRegister64, AsmRegister64) -> Result<()>,
) -> Result<()> {
    emit_sized(a, variant_labels[0], cl, dl, |a| {
        a.mov(cl, byte_ptr(VSP)).map_err(|e| err("vm", e))?;
        a.add(VSP, 1).map_err(|e| err("vm", e))?;
        a.mov(dl, byte_ptr(VSP)).map_err(|e| err("vm", e))?;
        op(a, rcx, rdx)?;
        a.mov(byte_ptr(VSP), dl).map_err(|e| err("vm", e))?;
        Ok(())
    })?;
    emit_sized(a, variant_labels[1], cx, dx, |a| {
        a.mov(cx, word_ptr(VSP)).map_err(|e| err("vm", e))?;
        a.add(VSP, 2).map_err(|e| err("vm", e))?;
        a.mov(dx, word_ptr(VSP)).map_err(|e| err("vm", e))?;
        op(a, rcx, rdx)?;
        a.mov(word_ptr(VSP), dx).map_err(|e| err("vm", e))?;
        Ok(())
    })?;
    emit_sized(a, variant_labels[2], ecx, edx, |a| {
        a.mov(ecx, dword_ptr(VSP)).map_err(|e| err("vm", e))?;
        a.add(VSP, 4).map_err(|e| err("vm", e))?;
        a.mov(edx, dword_ptr(VSP)).map_err(|e| err("vm", e))?;
        op(a, rcx, rdx)?;
        a.mov(dword_ptr(VSP), edx).map_err(|e| err("vm", e))?;
        Ok(())
    })?;
    emit_sized(a, variant_labels[3], rcx, rdx, |a| {
        a.mov(rcx, qword_ptr(VSP)).map_err(|e| err("vm", e))?;
        a.add(VSP, 8).map_err(|e| err("vm", e))?;
        a.mov(rdx, qword_ptr(VSP)).map_err(|e| err("vm", e))?;
        op(a, rcx, rdx)?;
        a.mov(qword_ptr(VSP), rdx).map_err(|e| err("vm", e))?;
        Ok(())
    })?;
    Ok(())
}

fn emit_sized<R>(
    a: &mut CodeAssembler,
    mut label: CodeLabel,
    _v0: R,
    _v1: R,
    body: impl FnOnce(&mut CodeAssembler) -> Result<()>,
) -> Result<()> {
    a.set_label(&mut label).map_err(|e| err("vm", e))?;
    body(a)
}

pub fn generate(code_size: usize, stack_size: usize, smc: bool, mba: bool) -> Result<GeneratedVm> {
    // measuring pass: learn the interpreter code's unpadded length so the
    // data area that follows can start on a page boundary (spec §4.4
    // "paged"; generic_vm::assemble's page-round-up).
    let probe = assemble(code_size, stack_size, 0, smc, mba)?;
    let pad = page_round_up(probe.bytes.len()) - probe.bytes.len();
    let padded = assemble(code_size, stack_size, pad, smc, mba)?;
    Ok(padded)
}

fn assemble(code_size: usize, stack_size: usize, pad: usize, smc: bool, mba: bool) -> Result<GeneratedVm> {
    let mut a = CodeAssembler::new(64).map_err(|e| err("vm", e))?;
    let labels = Labels::create(&mut a);

    emit_venter(&mut a, &labels, smc)?;
    emit_vexit(&mut a, &labels)?;
    emit_push_imm(&mut a, &labels)?;
    emit_push_reg(&mut a, &labels)?;
    emit_pop(&mut a, &labels)?;
    emit_read(&mut a, &labels)?;
    emit_write(&mut a, &labels)?;
    emit_alu(&mut a, labels.vadd, '+', mba, &labels)?;
    emit_alu(&mut a, labels.vsub, '-', mba, &labels)?;
    emit_alu(&mut a, labels.vxor, '^', mba, &labels)?;
    emit_alu(&mut a, labels.vand, '&', mba, &labels)?;
    emit_alu(&mut a, labels.vor, '|', mba, &labels)?;
    emit_cmp(&mut a, &labels)?;
    emit_jmp(&mut a, &labels)?;
    emit_jcc(&mut a, labels.vjz, 0x0040, true, &labels)?;
    emit_jcc(&mut a, labels.vjnz, 0x0040, false, &labels)?;
    emit_jcc(&mut a, labels.vjb, 0x0001, true, &labels)?;
    emit_jcc(&mut a, labels.vjnb, 0x0001, false, &labels)?;
    emit_jbe_family(&mut a, labels.vjbe, true, &labels)?;
    emit_jbe_family(&mut a, labels.vjnbe, false, &labels)?;
    emit_jl_family(&mut a, labels.vjl, true, &labels)?;
    emit_jl_family(&mut a, labels.vjnl, false, &labels)?;
    emit_jle_family(&mut a, labels.vjle, true, &labels)?;
    emit_jle_family(&mut a, labels.vjnle, false, &labels)?;
    emit_call(&mut a, &labels)?;
    emit_lea(&mut a, &labels)?;
    emit_execute_native(&mut a, &labels)?;

    if pad > 0 {
        a.db(&vec![rng::below(256) as u8; pad]).map_err(|e| err("vm", e))?;
    }

    let data_start = emit_data(&mut a, &mut { labels }, code_size, stack_size)?;

    let bytes = a.assemble(0).map_err(|e| err("vm", e))?;

    Ok(GeneratedVm {
        bytes,
        data_start,
        vcode_offset: 0,
        saved_rsp_offset: code_size,
        vsp_offset: code_size + 8,
        vip_offset: code_size + 16,
        vstack_offset: code_size + 24,
        retaddr_offset: code_size + 24 + stack_size,
        vtable_offset: code_size + 24 + stack_size + 8,
    })
}

fn emit_data(a: &mut CodeAssembler, labels: &mut Labels, code_size: usize, stack_size: usize) -> Result<usize> {
    let mut bind = |a: &mut CodeAssembler, label: &mut CodeLabel| a.set_label(label).map_err(|e| err("vm", e));

    bind(a, &mut labels.vcode)?;
    a.db(&vec![0u8; code_size]).map_err(|e| err("vm", e))?;
    bind(a, &mut labels.saved_rsp)?;
    a.dq(&[0]).map_err(|e| err("vm", e))?;
    bind(a, &mut labels.vsp_slot)?;
    a.dq(&[stack_size as u64]).map_err(|e| err("vm", e))?;
    bind(a, &mut labels.vip_slot)?;
    a.dq(&[0]).map_err(|e| err("vm", e))?;
    bind(a, &mut labels.vstack)?;
    a.db(&vec![0u8; stack_size]).map_err(|e| err("vm", e))?;
    bind(a, &mut labels.retaddr)?;
    a.dq(&[0]).map_err(|e| err("vm", e))?;
    bind(a, &mut labels.vtable)?;
    a.dq(&vec![0u64; VTABLE_SLOTS]).map_err(|e| err("vm", e))?;

    Ok(0) // data_start is computed by the caller from the padded code length
}

fn emit_venter(a: &mut CodeAssembler, labels: &Labels, smc: bool) -> Result<()> {
    a.set_label(&mut { labels.venter }).map_err(|e| err("vm", e))?;

    a.pop(r11).map_err(|e| err("vm", e))?;
    a.mov(qword_ptr(labels.retaddr), r11).map_err(|e| err("vm", e))?;
    a.pop(r11).map_err(|e| err("vm", e))?;
    a.mov(qword_ptr(labels.saved_rsp), rsp).map_err(|e| err("vm", e))?;

    if smc {
        // a throwaway literal, written by the VM into its own code right
        // before the jump table check reads nearby — a static disassembly
        // never sees this constant, only the instruction that deposits it
        // (spec §4.5 "self-modifying code").
        crate::obfuscate::smc::self_write_u32(a, rng::next::<u32>())?;
    }

    lazy_init_table(a, labels.vtable, &labels.vtable_entries())?;

    push_all_gprs(a, labels)?;

    a.lea(VSP, qword_ptr(labels.vstack)).map_err(|e| err("vm", e))?;
    a.add(VSP, qword_ptr(labels.vsp_slot)).map_err(|e| err("vm", e))?;
    a.lea(VIP, qword_ptr(labels.vcode)).map_err(|e| err("vm", e))?;
    a.add(VIP, r11).map_err(|e| err("vm", e))?;

    vm_next_instruction(a, labels, None)
}

fn emit_vexit(a: &mut CodeAssembler, labels: &Labels) -> Result<()> {
    a.set_label(&mut { labels.vexit }).map_err(|e| err("vm", e))?;

    a.inc(VIP).map_err(|e| err("vm", e))?;
    a.mov(r10w, word_ptr(VIP)).map_err(|e| err("vm", e))?;
    a.add(word_ptr(labels.retaddr), r10w).map_err(|e| err("vm", e))?;

    pop_all_gprs(a)?;
    a.add(rsp, 0x200).map_err(|e| err("vm", e))?; // revert the entry stub's prelude
    a.jmp(qword_ptr(labels.retaddr)).map_err(|e| err("vm", e))?;
    Ok(())
}

fn emit_push_imm(a: &mut CodeAssembler, labels: &Labels) -> Result<()> {
    let variants = [a.create_label(), a.create_label(), a.create_label(), a.create_label()];
    let next = a.create_label();

    get_size_from_opcode(a, labels.vpush_imm)?;

    emit_sized(a, variants[0], cl, dl, |a| {
        a.sub(VSP, 1).map_err(|e| err("vm", e))?;
        a.mov(cl, byte_ptr(VIP)).map_err(|e| err("vm", e))?;
        a.mov(byte_ptr(VSP), cl).map_err(|e| err("vm", e))?;
        a.add(VIP, 1).map_err(|e| err("vm", e))?;
        a.jmp(next).map_err(|e| err("vm", e))
    })?;
    emit_sized(a, variants[1], cx, dx, |a| {
        a.sub(VSP, 2).map_err(|e| err("vm", e))?;
        a.mov(cx, word_ptr(VIP)).map_err(|e| err("vm", e))?;
        a.mov(word_ptr(VSP), cx).map_err(|e| err("vm", e))?;
        a.add(VIP, 2).map_err(|e| err("vm", e))?;
        a.jmp(next).map_err(|e| err("vm", e))
    })?;
    emit_sized(a, variants[2], ecx, edx, |a| {
        a.sub(VSP, 4).map_err(|e| err("vm", e))?;
        a.mov(ecx, dword_ptr(VIP)).map_err(|e| err("vm", e))?;
        a.mov(dword_ptr(VSP), ecx).map_err(|e| err("vm", e))?;
        a.add(VIP, 4).map_err(|e| err("vm", e))?;
        a.jmp(next).map_err(|e| err("vm", e))
    })?;
    emit_sized(a, variants[3], rcx, rdx, |a| {
        a.sub(VSP, 8).map_err(|e| err("vm", e))?;
        a.mov(rcx, qword_ptr(VIP)).map_err(|e| err("vm", e))?;
        a.mov(qword_ptr(VSP), rcx).map_err(|e| err("vm", e))?;
        a.add(VIP, 8).map_err(|e| err("vm", e))?;
        a.jmp(next).map_err(|e| err("vm", e))
    })?;

    dispatch_via_table(a, variants[0], 4)?;
    vm_next_instruction(a, labels, Some(next))
}

fn emit_push_reg(a: &mut CodeAssembler, labels: &Labels) -> Result<()> {
    let variants = [a.create_label(), a.create_label(), a.create_label(), a.create_label()];
    let next = a.create_label();

    get_size_from_opcode(a, labels.vpush_reg)?;
    get_vreg_value(a, labels)?;

    emit_sized(a, variants[0], dl, dl, |a| {
        a.sub(VSP, 1).map_err(|e| err("vm", e))?;
        a.mov(byte_ptr(VSP), dl).map_err(|e| err("vm", e))?;
        a.jmp(next).map_err(|e| err("vm", e))
    })?;
    emit_sized(a, variants[1], dx, dx, |a| {
        a.sub(VSP, 2).map_err(|e| err("vm", e))?;
        a.mov(word_ptr(VSP), dx).map_err(|e| err("vm", e))?;
        a.jmp(next).map_err(|e| err("vm", e))
    })?;
    emit_sized(a, variants[2], edx, edx, |a| {
        a.sub(VSP, 4).map_err(|e| err("vm", e))?;
        a.mov(dword_ptr(VSP), edx).map_err(|e| err("vm", e))?;
        a.jmp(next).map_err(|e| err("vm", e))
    })?;
    emit_sized(a, variants[3], rdx, rdx, |a| {
        a.sub(VSP, 8).map_err(|e| err("vm", e))?;
        a.mov(qword_ptr(VSP), rdx).map_err(|e| err("vm", e))?;
        a.jmp(next).map_err(|e| err("vm", e))
    })?;

    dispatch_via_table(a, variants[0], 4)?;
    vm_next_instruction(a, labels, Some(next))
}

fn emit_pop(a: &mut CodeAssembler, labels: &Labels) -> Result<()> {
    let variants = [a.create_label(), a.create_label(), a.create_label(), a.create_label()];
    let next = a.create_label();

    get_size_from_opcode(a, labels.vpop)?;
    get_vreg_address(a, labels)?;

    emit_sized(a, variants[0], cl, cl, |a| {
        a.mov(cl, byte_ptr(VSP)).map_err(|e| err("vm", e))?;
        a.add(VSP, 1).map_err(|e| err("vm", e))?;
        a.mov(byte_ptr(rdx), cl).map_err(|e| err("vm", e))?;
        a.jmp(next).map_err(|e| err("vm", e))
    })?;
    emit_sized(a, variants[1], cx, cx, |a| {
        a.mov(cx, word_ptr(VSP)).map_err(|e| err("vm", e))?;
        a.add(VSP, 2).map_err(|e| err("vm", e))?;
        a.mov(word_ptr(rdx), cx).map_err(|e| err("vm", e))?;
        a.jmp(next).map_err(|e| err("vm", e))
    })?;
    emit_sized(a, variants[2], ecx, ecx, |a| {
        a.mov(ecx, dword_ptr(VSP)).map_err(|e| err("vm", e))?;
        a.add(VSP, 4).map_err(|e| err("vm", e))?;
        a.mov(dword_ptr(rdx), ecx).map_err(|e| err("vm", e))?;
        a.jmp(next).map_err(|e| err("vm", e))
    })?;
    emit_sized(a, variants[3], rcx, rcx, |a| {
        a.mov(rcx, qword_ptr(VSP)).map_err(|e| err("vm", e))?;
        a.add(VSP, 8).map_err(|e| err("vm", e))?;
        a.mov(qword_ptr(rdx), rcx).map_err(|e| err("vm", e))?;
        a.jmp(next).map_err(|e| err("vm", e))
    })?;

    dispatch_via_table(a, variants[0], 4)?;
    vm_next_instruction(a, labels, Some(next))
}

/// `read size`: pop a 64-bit address, load `size` bytes from it, push the
/// result (spec: stack adjustment is `8 − size`, since the address occupied
/// 8 bytes but the loaded value only occupies `size`).
fn emit_read(a: &mut CodeAssembler, labels: &Labels) -> Result<()> {
    let variants = [a.create_label(), a.create_label(), a.create_label(), a.create_label()];
    let next = a.create_label();

    get_size_from_opcode(a, labels.vread)?;

    emit_sized(a, variants[0], cl, cl, |a| {
        a.mov(rdx, qword_ptr(VSP)).map_err(|e| err("vm", e))?;
        a.add(VSP, 7).map_err(|e| err("vm", e))?;
        a.mov(cl, byte_ptr(rdx)).map_err(|e| err("vm", e))?;
        a.mov(byte_ptr(VSP), cl).map_err(|e| err("vm", e))?;
        a.jmp(next).map_err(|e| err("vm", e))
    })?;
    emit_sized(a, variants[1], cx, cx, |a| {
        a.mov(rdx, qword_ptr(VSP)).map_err(|e| err("vm", e))?;
        a.add(VSP, 6).map_err(|e| err("vm", e))?;
        a.mov(cx, word_ptr(rdx)).map_err(|e| err("vm", e))?;
        a.mov(word_ptr(VSP), cx).map_err(|e| err("vm", e))?;
        a.jmp(next).map_err(|e| err("vm", e))
    })?;
    emit_sized(a, variants[2], ecx, ecx, |a| {
        a.mov(rdx, qword_ptr(VSP)).map_err(|e| err("vm", e))?;
        a.add(VSP, 4).map_err(|e| err("vm", e))?;
        a.mov(ecx, dword_ptr(rdx)).map_err(|e| err("vm", e))?;
        a.mov(dword_ptr(VSP), ecx).map_err(|e| err("vm", e))?;
        a.jmp(next).map_err(|e| err("vm", e))
    })?;
    emit_sized(a, variants[3], rcx, rcx, |a| {
        a.mov(rdx, qword_ptr(VSP)).map_err(|e| err("vm", e))?;
        a.mov(rcx, qword_ptr(rdx)).map_err(|e| err("vm", e))?;
        a.mov(qword_ptr(VSP), rcx).map_err(|e| err("vm", e))?;
        a.jmp(next).map_err(|e| err("vm", e))
    })?;

    dispatch_via_table(a, variants[0], 4)?;
    vm_next_instruction(a, labels, Some(next))
}

/// `write size, src_vreg`: pop an address, store the v-reg's value there.
fn emit_write(a: &mut CodeAssembler, labels: &Labels) -> Result<()> {
    let variants = [a.create_label(), a.create_label(), a.create_label(), a.create_label()];
    let next = a.create_label();

    get_size_from_opcode(a, labels.vwrite)?;
    get_vreg_value(a, labels)?;

    emit_sized(a, variants[0], dl, dl, |a| {
        a.mov(r10, qword_ptr(VSP)).map_err(|e| err("vm", e))?;
        a.mov(byte_ptr(r10), dl).map_err(|e| err("vm", e))?;
        a.add(VSP, 8).map_err(|e| err("vm", e))?;
        a.jmp(next).map_err(|e| err("vm", e))
    })?;
    emit_sized(a, variants[1], dx, dx, |a| {
        a.mov(r10, qword_ptr(VSP)).map_err(|e| err("vm", e))?;
        a.mov(word_ptr(r10), dx).map_err(|e| err("vm", e))?;
        a.add(VSP, 8).map_err(|e| err("vm", e))?;
        a.jmp(next).map_err(|e| err("vm", e))
    })?;
    emit_sized(a, variants[2], edx, edx, |a| {
        a.mov(r10, qword_ptr(VSP)).map_err(|e| err("vm", e))?;
        a.mov(dword_ptr(r10), edx).map_err(|e| err("vm", e))?;
        a.add(VSP, 8).map_err(|e| err("vm", e))?;
        a.jmp(next).map_err(|e| err("vm", e))
    })?;
    emit_sized(a, variants[3], rdx, rdx, |a| {
        a.mov(r10, qword_ptr(VSP)).map_err(|e| err("vm", e))?;
        a.mov(qword_ptr(r10), rdx).map_err(|e| err("vm", e))?;
        a.add(VSP, 8).map_err(|e| err("vm", e))?;
        a.jmp(next).map_err(|e| err("vm", e))
    })?;

    dispatch_via_table(a, variants[0], 4)?;
    vm_next_instruction(a, labels, Some(next))
}

/// Emit one ALU handler's four size variants, optionally routing the actual
/// combine step through [`crate::obfuscate::mba::binary_op`] instead of the
/// direct instruction (spec §4.5/§4.6 `-no_mba`): the rewrite operates on the
/// interpreter's own assembled machine code, exactly like `smc.rs`'s
/// handler-local self-write, rather than on the lifted bytecode.
fn emit_alu(a: &mut CodeAssembler, handler: CodeLabel, op_char: char, mba: bool, labels: &Labels) -> Result<()> {
    let variants = [a.create_label(), a.create_label(), a.create_label(), a.create_label()];
    let next = a.create_label();

    get_size_from_opcode(a, handler)?;

    emit_arith_variants(a, &variants, |a, d, s| {
        if mba {
            crate::obfuscate::mba::binary_op(a, op_char, d, s)
        } else {
            apply_direct_op(a, op_char, d, s)
        }
    })?;

    dispatch_via_table(a, variants[0], 4)?;
    vm_next_instruction(a, labels, Some(next))
}

fn apply_direct_op(a: &mut CodeAssembler, op_char: char, dst: AsmRegister64, src: AsmRegister64) -> Result<()> {
    match op_char {
        '+' => a.add(dst, src),
        '-' => a.sub(dst, src),
        '^' => a.xor(dst, src),
        '&' => a.and(dst, src),
        '|' => a.or(dst, src),
        op => unreachable!("unknown alu opcode {op}"),
    }
    .map_err(|e| err("vm", e))
}

/// `cmp size`: compare the two top-of-stack operands, capture EFLAGS, and
/// leave the low 16 bits of flags on the stack in place of both operands
/// (spec: "shrinking the operand pair to a single 16-bit flag snapshot").
fn emit_cmp(a: &mut CodeAssembler, labels: &Labels) -> Result<()> {
    let variants = [a.create_label(), a.create_label(), a.create_label(), a.create_label()];
    let next = a.create_label();

    get_size_from_opcode(a, labels.vcmp)?;

    for (label, width) in variants.iter().zip([1u32, 2, 4, 8]) {
        emit_sized(a, *label, cl, dl, |a| {
            match width {
                1 => {
                    a.mov(cl, byte_ptr(VSP)).map_err(|e| err("vm", e))?;
                    a.add(VSP, 1).map_err(|e| err("vm", e))?;
                    a.mov(dl, byte_ptr(VSP)).map_err(|e| err("vm", e))?;
                    a.cmp(dl, cl).map_err(|e| err("vm", e))?;
                }
                2 => {
                    a.mov(cx, word_ptr(VSP)).map_err(|e| err("vm", e))?;
                    a.add(VSP, 2).map_err(|e| err("vm", e))?;
                    a.mov(dx, word_ptr(VSP)).map_err(|e| err("vm", e))?;
                    a.cmp(dx, cx).map_err(|e| err("vm", e))?;
                }
                4 => {
                    a.mov(ecx, dword_ptr(VSP)).map_err(|e| err("vm", e))?;
                    a.add(VSP, 4).map_err(|e| err("vm", e))?;
                    a.mov(edx, dword_ptr(VSP)).map_err(|e| err("vm", e))?;
                    a.cmp(edx, ecx).map_err(|e| err("vm", e))?;
                }
                _ => {
                    a.mov(rcx, qword_ptr(VSP)).map_err(|e| err("vm", e))?;
                    a.add(VSP, 8).map_err(|e| err("vm", e))?;
                    a.mov(rdx, qword_ptr(VSP)).map_err(|e| err("vm", e))?;
                    a.cmp(rdx, rcx).map_err(|e| err("vm", e))?;
                }
            }
            a.pushfq().map_err(|e| err("vm", e))?;
            a.pop(rcx).map_err(|e| err("vm", e))?;
            a.add(VSP, (8 - width) as i32).map_err(|e| err("vm", e))?;
            a.sub(VSP, 2).map_err(|e| err("vm", e))?;
            a.mov(word_ptr(VSP), cx).map_err(|e| err("vm", e))?;
            a.jmp(next).map_err(|e| err("vm", e))
        })?;
    }

    dispatch_via_table(a, variants[0], 4)?;
    vm_next_instruction(a, labels, Some(next))
}

fn emit_jmp(a: &mut CodeAssembler, labels: &Labels) -> Result<()> {
    a.set_label(&mut { labels.vjmp }).map_err(|e| err("vm", e))?;
    a.inc(VIP).map_err(|e| err("vm", e))?;
    a.movzx(rcx, word_ptr(VIP)).map_err(|e| err("vm", e))?;
    a.lea(VIP, qword_ptr(labels.vcode)).map_err(|e| err("vm", e))?;
    a.add(VIP, rcx).map_err(|e| err("vm", e))?;
    vm_next_instruction(a, labels, None)
}

/// Single-flag conditional jumps (`jz`, `jnz`, `jb`, `jnb`): test one bit
/// of the 16-bit flag snapshot against `mask`, branch if `(flags & mask) !=
/// 0` equals `branch_if_set`.
fn emit_jcc(a: &mut CodeAssembler, handler: CodeLabel, mask: i32, branch_if_set: bool, labels: &Labels) -> Result<()> {
    let vnext = a.create_label();
    let truth = a.create_label();

    a.set_label(&mut { handler }).map_err(|e| err("vm", e))?;
    a.inc(VIP).map_err(|e| err("vm", e))?;
    a.movzx(rdx, word_ptr(VSP)).map_err(|e| err("vm", e))?;
    a.and(rdx, mask).map_err(|e| err("vm", e))?;
    a.test(rdx, rdx).map_err(|e| err("vm", e))?;
    if branch_if_set {
        a.jnz(truth).map_err(|e| err("vm", e))?;
    } else {
        a.jz(truth).map_err(|e| err("vm", e))?;
    }
    a.add(VIP, 2).map_err(|e| err("vm", e))?;
    a.jmp(vnext).map_err(|e| err("vm", e))?;

    a.set_label(&mut { truth }).map_err(|e| err("vm", e))?;
    a.movzx(rcx, word_ptr(VIP)).map_err(|e| err("vm", e))?;
    a.lea(VIP, qword_ptr(labels.vcode)).map_err(|e| err("vm", e))?;
    a.add(VIP, rcx).map_err(|e| err("vm", e))?;
    a.set_label(&mut { vnext }).map_err(|e| err("vm", e))?;
    a.add(VSP, 2).map_err(|e| err("vm", e))?;
    vm_next_instruction(a, labels, None)
}

/// `jbe`/`jnbe`: CF=1 OR ZF=1 (resp. its negation).
fn emit_jbe_family(a: &mut CodeAssembler, handler: CodeLabel, is_jbe: bool, labels: &Labels) -> Result<()> {
    let vnext = a.create_label();
    let truth = a.create_label();
    let ntruth = a.create_label();

    a.set_label(&mut { handler }).map_err(|e| err("vm", e))?;
    a.inc(VIP).map_err(|e| err("vm", e))?;

    if is_jbe {
        a.movzx(rdx, word_ptr(VSP)).map_err(|e| err("vm", e))?;
        a.and(rdx, 0x0001).map_err(|e| err("vm", e))?;
        a.test(rdx, rdx).map_err(|e| err("vm", e))?;
        a.jnz(truth).map_err(|e| err("vm", e))?;
        a.movzx(rdx, word_ptr(VSP)).map_err(|e| err("vm", e))?;
        a.and(rdx, 0x0040).map_err(|e| err("vm", e))?;
        a.test(rdx, rdx).map_err(|e| err("vm", e))?;
        a.jnz(truth).map_err(|e| err("vm", e))?;
        a.add(VIP, 2).map_err(|e| err("vm", e))?;
        a.jmp(vnext).map_err(|e| err("vm", e))?;
    } else {
        a.movzx(rdx, word_ptr(VSP)).map_err(|e| err("vm", e))?;
        a.and(rdx, 0x0001).map_err(|e| err("vm", e))?;
        a.test(rdx, rdx).map_err(|e| err("vm", e))?;
        a.jnz(ntruth).map_err(|e| err("vm", e))?;
        a.movzx(rdx, word_ptr(VSP)).map_err(|e| err("vm", e))?;
        a.and(rdx, 0x0040).map_err(|e| err("vm", e))?;
        a.test(rdx, rdx).map_err(|e| err("vm", e))?;
        a.jnz(ntruth).map_err(|e| err("vm", e))?;
        a.jmp(truth).map_err(|e| err("vm", e))?;
        a.set_label(&mut { ntruth }).map_err(|e| err("vm", e))?;
        a.add(VIP, 2).map_err(|e| err("vm", e))?;
        a.jmp(vnext).map_err(|e| err("vm", e))?;
    }

    a.set_label(&mut { truth }).map_err(|e| err("vm", e))?;
    a.movzx(rcx, word_ptr(VIP)).map_err(|e| err("vm", e))?;
    a.lea(VIP, qword_ptr(labels.vcode)).map_err(|e| err("vm", e))?;
    a.add(VIP, rcx).map_err(|e| err("vm", e))?;
    a.set_label(&mut { vnext }).map_err(|e| err("vm", e))?;
    a.add(VSP, 2).map_err(|e| err("vm", e))?;
    vm_next_instruction(a, labels, None)
}

/// `jl`/`jnl`: `popcnt(flags & (SF|OF)) == 1` (i.e. SF != OF), resp. negated.
fn emit_jl_family(a: &mut CodeAssembler, handler: CodeLabel, is_jl: bool, labels: &Labels) -> Result<()> {
    let vnext = a.create_label();
    let truth = a.create_label();

    a.set_label(&mut { handler }).map_err(|e| err("vm", e))?;
    a.inc(VIP).map_err(|e| err("vm", e))?;
    a.movzx(rdx, word_ptr(VSP)).map_err(|e| err("vm", e))?;
    a.and(rdx, 0x0880).map_err(|e| err("vm", e))?;
    a.popcnt(rdx, rdx).map_err(|e| err("vm", e))?;
    a.cmp(rdx, 1).map_err(|e| err("vm", e))?;
    if is_jl {
        a.je(truth).map_err(|e| err("vm", e))?;
    } else {
        a.jne(truth).map_err(|e| err("vm", e))?;
    }
    a.add(VIP, 2).map_err(|e| err("vm", e))?;
    a.jmp(vnext).map_err(|e| err("vm", e))?;

    a.set_label(&mut { truth }).map_err(|e| err("vm", e))?;
    a.movzx(rcx, word_ptr(VIP)).map_err(|e| err("vm", e))?;
    a.lea(VIP, qword_ptr(labels.vcode)).map_err(|e| err("vm", e))?;
    a.add(VIP, rcx).map_err(|e| err("vm", e))?;
    a.set_label(&mut { vnext }).map_err(|e| err("vm", e))?;
    a.add(VSP, 2).map_err(|e| err("vm", e))?;
    vm_next_instruction(a, labels, None)
}

/// `jle`/`jnle`: ZF=1 OR SF!=OF, resp. negated.
fn emit_jle_family(a: &mut CodeAssembler, handler: CodeLabel, is_jle: bool, labels: &Labels) -> Result<()> {
    let vnext = a.create_label();
    let truth = a.create_label();
    let ntruth = a.create_label();

    a.set_label(&mut { handler }).map_err(|e| err("vm", e))?;
    a.inc(VIP).map_err(|e| err("vm", e))?;

    if is_jle {
        a.movzx(rdx, word_ptr(VSP)).map_err(|e| err("vm", e))?;
        a.and(rdx, 0x0040).map_err(|e| err("vm", e))?;
        a.test(rdx, rdx).map_err(|e| err("vm", e))?;
        a.jnz(truth).map_err(|e| err("vm", e))?;
        a.movzx(rdx, word_ptr(VSP)).map_err(|e| err("vm", e))?;
        a.and(rdx, 0x0880).map_err(|e| err("vm", e))?;
        a.popcnt(rdx, rdx).map_err(|e| err("vm", e))?;
        a.cmp(rdx, 1).map_err(|e| err("vm", e))?;
        a.je(truth).map_err(|e| err("vm", e))?;
        a.add(VIP, 2).map_err(|e| err("vm", e))?;
        a.jmp(vnext).map_err(|e| err("vm", e))?;
    } else {
        a.movzx(rdx, word_ptr(VSP)).map_err(|e| err("vm", e))?;
        a.and(rdx, 0x0040).map_err(|e| err("vm", e))?;
        a.test(rdx, rdx).map_err(|e| err("vm", e))?;
        a.jnz(ntruth).map_err(|e| err("vm", e))?;
        a.movzx(rdx, word_ptr(VSP)).map_err(|e| err("vm", e))?;
        a.and(rdx, 0x0880).map_err(|e| err("vm", e))?;
        a.popcnt(rdx, rdx).map_err(|e| err("vm", e))?;
        a.cmp(rdx, 1).map_err(|e| err("vm", e))?;
        a.je(ntruth).map_err(|e| err("vm", e))?;
        a.jmp(truth).map_err(|e| err("vm", e))?;
        a.set_label(&mut { ntruth }).map_err(|e| err("vm", e))?;
        a.add(VIP, 2).map_err(|e| err("vm", e))?;
        a.jmp(vnext).map_err(|e| err("vm", e))?;
    }

    a.set_label(&mut { truth }).map_err(|e| err("vm", e))?;
    a.movzx(rcx, word_ptr(VIP)).map_err(|e| err("vm", e))?;
    a.lea(VIP, qword_ptr(labels.vcode)).map_err(|e| err("vm", e))?;
    a.add(VIP, rcx).map_err(|e| err("vm", e))?;
    a.set_label(&mut { vnext }).map_err(|e| err("vm", e))?;
    a.add(VSP, 2).map_err(|e| err("vm", e))?;
    vm_next_instruction(a, labels, None)
}

/// `call rel32`: reentrant through a full VM exit/enter, saving VIP and the
/// vstack offset so a nested `venter` (from the callee re-entering a
/// different marked region) can resume here afterwards (spec §5
/// "Concurrency", `call`'s reentrancy contract).
fn emit_call(a: &mut CodeAssembler, labels: &Labels) -> Result<()> {
    a.set_label(&mut { labels.vcall }).map_err(|e| err("vm", e))?;
    a.inc(VIP).map_err(|e| err("vm", e))?;
    a.mov(r11, qword_ptr(labels.retaddr)).map_err(|e| err("vm", e))?;
    a.movsxd(r9, dword_ptr(VIP)).map_err(|e| err("vm", e))?;
    a.add(r11, r9).map_err(|e| err("vm", e))?;

    a.sub(VSP, 8).map_err(|e| err("vm", e))?;
    a.mov(r9, qword_ptr(labels.retaddr)).map_err(|e| err("vm", e))?;
    a.mov(qword_ptr(VSP), r9).map_err(|e| err("vm", e))?;

    a.add(VIP, 4).map_err(|e| err("vm", e))?;
    a.sub(VSP, 8).map_err(|e| err("vm", e))?;
    a.mov(qword_ptr(VSP), VIP).map_err(|e| err("vm", e))?;

    a.mov(qword_ptr(labels.vsp_slot), VSP).map_err(|e| err("vm", e))?;
    a.lea(r9, qword_ptr(labels.vstack)).map_err(|e| err("vm", e))?;
    a.sub(qword_ptr(labels.vsp_slot), r9).map_err(|e| err("vm", e))?;

    pop_all_gprs(a)?;
    a.add(rsp, 0x200).map_err(|e| err("vm", e))?;
    a.call(r11).map_err(|e| err("vm", e))?;
    a.sub(rsp, 0x200).map_err(|e| err("vm", e))?;

    push_all_gprs(a, labels)?;

    a.lea(VSP, qword_ptr(labels.vstack)).map_err(|e| err("vm", e))?;
    a.add(VSP, qword_ptr(labels.vsp_slot)).map_err(|e| err("vm", e))?;

    a.mov(VIP, qword_ptr(VSP)).map_err(|e| err("vm", e))?;
    a.add(VSP, 8).map_err(|e| err("vm", e))?;
    a.mov(r11, qword_ptr(VSP)).map_err(|e| err("vm", e))?;
    a.mov(qword_ptr(labels.retaddr), r11).map_err(|e| err("vm", e))?;

    vm_next_instruction(a, labels, None)
}

/// `lea rel32`: push `retaddr + rel32` (spec §4.3 "RIP-relative fix-up").
fn emit_lea(a: &mut CodeAssembler, labels: &Labels) -> Result<()> {
    a.set_label(&mut { labels.vlea }).map_err(|e| err("vm", e))?;
    a.inc(VIP).map_err(|e| err("vm", e))?;
    a.movsxd(rcx, dword_ptr(VIP)).map_err(|e| err("vm", e))?;
    a.add(VIP, 4).map_err(|e| err("vm", e))?;
    a.add(rcx, qword_ptr(labels.retaddr)).map_err(|e| err("vm", e))?;
    a.sub(VSP, 8).map_err(|e| err("vm", e))?;
    a.mov(qword_ptr(VSP), rcx).map_err(|e| err("vm", e))?;
    vm_next_instruction(a, labels, None)
}

/// `execute_native length, bytes...`: copy the raw native bytes out of the
/// bytecode stream into a 16-NOP scratch pad right here in the interpreter's
/// own code, exit the VM to run them, then re-blank the pad with NOPs (spec
/// §4.3 "native-embedding fallback").
fn emit_execute_native(a: &mut CodeAssembler, labels: &Labels) -> Result<()> {
    let copy_loop = a.create_label();
    let native_code = a.create_label();
    let done = a.create_label();

    a.set_label(&mut { labels.vexenative }).map_err(|e| err("vm", e))?;
    a.inc(VIP).map_err(|e| err("vm", e))?;
    a.movzx(rcx, byte_ptr(VIP)).map_err(|e| err("vm", e))?;
    a.lea(rdx, qword_ptr(native_code)).map_err(|e| err("vm", e))?;
    a.inc(VIP).map_err(|e| err("vm", e))?;

    a.set_label(&mut { copy_loop }).map_err(|e| err("vm", e))?;
    a.test(rcx, rcx).map_err(|e| err("vm", e))?;
    a.jz(done).map_err(|e| err("vm", e))?;
    a.mov(r9b, byte_ptr(VIP)).map_err(|e| err("vm", e))?;
    a.mov(byte_ptr(rdx), r9b).map_err(|e| err("vm", e))?;
    a.inc(rdx).map_err(|e| err("vm", e))?;
    a.inc(VIP).map_err(|e| err("vm", e))?;
    a.dec(rcx).map_err(|e| err("vm", e))?;
    a.jmp(copy_loop).map_err(|e| err("vm", e))?;
    a.set_label(&mut { done }).map_err(|e| err("vm", e))?;

    a.sub(VSP, 8).map_err(|e| err("vm", e))?;
    a.mov(qword_ptr(VSP), VIP).map_err(|e| err("vm", e))?;
    a.mov(qword_ptr(labels.vsp_slot), VSP).map_err(|e| err("vm", e))?;
    a.lea(r9, qword_ptr(labels.vstack)).map_err(|e| err("vm", e))?;
    a.sub(qword_ptr(labels.vsp_slot), r9).map_err(|e| err("vm", e))?;

    pop_all_gprs(a)?;
    a.add(rsp, 0x200).map_err(|e| err("vm", e))?;

    a.set_label(&mut { native_code }).map_err(|e| err("vm", e))?;
    for _ in 0..16 {
        a.nop().map_err(|e| err("vm", e))?;
    }

    a.sub(rsp, 0x200).map_err(|e| err("vm", e))?;
    push_all_gprs(a, labels)?;

    a.lea(VSP, qword_ptr(labels.vstack)).map_err(|e| err("vm", e))?;
    a.add(VSP, qword_ptr(labels.vsp_slot)).map_err(|e| err("vm", e))?;
    a.mov(VIP, qword_ptr(VSP)).map_err(|e| err("vm", e))?;
    a.add(VSP, 8).map_err(|e| err("vm", e))?;

    // re-blank the scratch pad so a second pass through this handler never
    // re-executes a previous call's leftover bytes.
    a.lea(rdx, qword_ptr(native_code)).map_err(|e| err("vm", e))?;
    a.mov(dword_ptr(rdx), 0x9090_9090u32 as i32).map_err(|e| err("vm", e))?;
    a.mov(dword_ptr(rdx + 4u32), 0x9090_9090u32 as i32).map_err(|e| err("vm", e))?;
    a.mov(dword_ptr(rdx + 8u32), 0x9090_9090u32 as i32).map_err(|e| err("vm", e))?;
    a.mov(dword_ptr(rdx + 12u32), 0x9090_9090u32 as i32).map_err(|e| err("vm", e))?;

    vm_next_instruction(a, labels, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_vm_is_page_aligned_at_data_start() {
        let vm = generate(256, 512, true, true).unwrap();
        assert_eq!(vm.data_start % crate::consts::PAGE_SIZE, 0);
        assert!(vm.bytes.len() >= vm.data_start);
    }

    #[test]
    fn vtable_has_one_slot_per_entry() {
        let mut a = CodeAssembler::new(64).unwrap();
        let labels = Labels::create(&mut a);
        assert_eq!(labels.vtable_entries().len(), super::super::super::opcode::ALL_OPCODES.len());
    }
}
