//! Per-mnemonic translators: x86 instruction → stack bytecode (spec §4.3
//! "Lifter", "Operand lowering").
//!
//! A translator either emits one or more bytecode instructions and returns
//! `true`, or returns `false` to signal that the lifter should fall back to
//! native embedding (spec §4.3 "refuses").

use super::emitter::BytecodeEmitter;
use super::opcode::Opcode;
use crate::analysis::disasm::{Instruction, Operand};
use iced_x86::Mnemonic;

/// Scratch v-register used to shuttle values between the vstack and memory
/// address computation (spec §4.3: "materializing the intermediate result
/// via a temporary pop/push into a scratch v-reg").
const SCRATCH_REG: u8 = 15;

pub struct TranslateContext {
    /// `retaddr = subroutine.start_va - stub_length + vm_entry_length`
    /// (spec §4.3 "RIP-relative fix-up").
    pub retaddr: u64,
    /// Pre-resolved `(subroutine_index, block_index)` of a jump's target,
    /// looked up by the caller so an out-of-region target can be reported
    /// as `JumpEscapesRegion` rather than silently falling back to native
    /// (spec §4.2).
    pub jump_target_block: Option<usize>,
}

/// Resolve a jump/call mnemonic to the `Opcode` its handler implements.
fn jcc_opcode(mnemonic: Mnemonic) -> Option<Opcode> {
    use Mnemonic::*;
    Some(match mnemonic {
        Jmp => Opcode::Jmp,
        Je => Opcode::Jz,
        Jne => Opcode::Jnz,
        Jb => Opcode::Jb,
        Jae => Opcode::Jnb,
        Jbe => Opcode::Jbe,
        Ja => Opcode::Jnbe,
        Jl => Opcode::Jl,
        Jle => Opcode::Jle,
        Jge => Opcode::Jnl,
        Jg => Opcode::Jnle,
        _ => return None,
    })
}

pub fn is_translatable(mnemonic: Mnemonic) -> bool {
    jcc_opcode(mnemonic).is_some()
        || matches!(
            mnemonic,
            Mnemonic::Mov
                | Mnemonic::Add
                | Mnemonic::Sub
                | Mnemonic::Xor
                | Mnemonic::And
                | Mnemonic::Or
                | Mnemonic::Cmp
                | Mnemonic::Lea
                | Mnemonic::Call
        )
}

/// Push an operand's value onto the vstack (spec §4.3 "Operand lowering").
/// Returns `false` if the operand shape isn't one the lifter can lower.
fn lower_push(emitter: &mut BytecodeEmitter, operand: &Operand) -> bool {
    match *operand {
        Operand::Register { index, size } => {
            emitter.emit_reg(Opcode::PushReg, size, index);
            true
        }
        Operand::Immediate { value, size } => {
            emitter.emit_imm(Opcode::PushImm, size, value);
            true
        }
        Operand::Memory { size, .. } => {
            if !lower_effective_address(emitter, operand) {
                return false;
            }
            emitter.emit_no_operand(Opcode::Read, size);
            true
        }
        Operand::None => false,
    }
}

/// Evaluate a memory operand's effective address onto the vstack (spec
/// §4.3): push `index`, add it `scale-1` more times, push `base` and add,
/// push `disp` and add. Missing `base`/`index` are skipped.
fn lower_effective_address(emitter: &mut BytecodeEmitter, operand: &Operand) -> bool {
    let Operand::Memory { base, index, scale, disp, .. } = *operand else {
        return false;
    };

    let mut have_address = false;

    if let Some(index_reg) = index {
        emitter.emit_reg(Opcode::PushReg, 8, index_reg);
        for _ in 1..scale.max(1) {
            emitter.emit_reg(Opcode::PushReg, 8, index_reg);
            emitter.emit_no_operand(Opcode::Add, 8);
            // materialize the running total through a scratch v-reg so a
            // truncated intermediate size can never leak into the next add
            emitter.emit_reg(Opcode::Pop, 8, SCRATCH_REG);
            emitter.emit_reg(Opcode::PushReg, 8, SCRATCH_REG);
        }
        have_address = true;
    }

    if let Some(base_reg) = base {
        emitter.emit_reg(Opcode::PushReg, 8, base_reg);
        if have_address {
            emitter.emit_no_operand(Opcode::Add, 8);
        }
        have_address = true;
    }

    if disp != 0 || !have_address {
        emitter.emit_imm(Opcode::PushImm, 8, disp);
        if have_address {
            emitter.emit_no_operand(Opcode::Add, 8);
        }
    }

    true
}

/// Lower a store into a memory destination: compute the value into the
/// scratch v-register, then the address, then `write` (spec §4.3: "Writes
/// pop the value into a scratch v-reg and then `write size, scratch`").
fn lower_store(emitter: &mut BytecodeEmitter, dst: &Operand, src: &Operand) -> bool {
    if !lower_push(emitter, src) {
        return false;
    }
    emitter.emit_reg(Opcode::Pop, src.size(), SCRATCH_REG);
    if !lower_effective_address(emitter, dst) {
        return false;
    }
    emitter.emit_reg(Opcode::Write, dst.size(), SCRATCH_REG);
    true
}

fn lower_alu(emitter: &mut BytecodeEmitter, opcode: Opcode, dst: &Operand, src: &Operand) -> bool {
    if dst.is_memory() {
        // read-modify-write: push current value, push src, op, then store back
        if !lower_push(emitter, dst) || !lower_push(emitter, src) {
            return false;
        }
        emitter.emit_no_operand(opcode, dst.size().max(src.size()));
        emitter.emit_reg(Opcode::Pop, dst.size(), SCRATCH_REG);
        if !lower_effective_address(emitter, dst) {
            return false;
        }
        emitter.emit_reg(Opcode::Write, dst.size(), SCRATCH_REG);
        true
    } else if dst.is_register() {
        if !lower_push(emitter, dst) || !lower_push(emitter, src) {
            return false;
        }
        emitter.emit_no_operand(opcode, dst.size().max(src.size()));
        emitter.emit_reg(Opcode::Pop, dst.size(), dst.register_index());
        true
    } else {
        false
    }
}

/// Translate one instruction. `bb_of` resolves an absolute address to the
/// `(subroutine_index, block_index)` it falls in, for intra-region jump
/// resolution; it returns `None` for an address outside the region (spec
/// §4.2 `JumpEscapesRegion`, surfaced by the caller).
pub fn translate(
    emitter: &mut BytecodeEmitter,
    ins: &Instruction,
    ctx: &TranslateContext,
    subroutine_index: usize,
) -> bool {
    match ins.mnemonic {
        Mnemonic::Mov => {
            if ins.dst().is_memory() {
                lower_store(emitter, ins.dst(), ins.src())
            } else if ins.dst().is_register() {
                if !lower_push(emitter, ins.src()) {
                    return false;
                }
                emitter.emit_reg(Opcode::Pop, ins.dst().size(), ins.dst().register_index());
                true
            } else {
                false
            }
        }
        Mnemonic::Add => lower_alu(emitter, Opcode::Add, ins.dst(), ins.src()),
        Mnemonic::Sub => lower_alu(emitter, Opcode::Sub, ins.dst(), ins.src()),
        Mnemonic::Xor => lower_alu(emitter, Opcode::Xor, ins.dst(), ins.src()),
        Mnemonic::And => lower_alu(emitter, Opcode::And, ins.dst(), ins.src()),
        Mnemonic::Or => lower_alu(emitter, Opcode::Or, ins.dst(), ins.src()),
        Mnemonic::Cmp => {
            if !lower_push(emitter, ins.dst()) || !lower_push(emitter, ins.src()) {
                return false;
            }
            emitter.emit_no_operand(Opcode::Cmp, ins.dst().size().max(ins.src().size()));
            true
        }
        Mnemonic::Lea => {
            // assumes `base` is RIP; anything else isn't representable by a
            // single rel32 fix-up and falls back to native (spec §4.3).
            let Operand::Memory { base: None, index: None, disp, .. } = *ins.src() else {
                return false;
            };
            let rel32 = (ins.address as i64 + disp - ctx.retaddr as i64 + ins.length as i64) as i32;
            emitter.emit_imm(Opcode::Lea, 4, rel32 as i64);
            emitter.emit_reg(Opcode::Pop, 8, ins.dst().register_index());
            true
        }
        Mnemonic::Call => {
            let Operand::Immediate { value, .. } = *ins.dst() else {
                return false;
            };
            let rel32 = (ins.address as i64 + value - ctx.retaddr as i64 + ins.length as i64) as i32;
            emitter.emit_imm(Opcode::Call, 4, rel32 as i64);
            true
        }
        mnemonic => {
            let Some(opcode) = jcc_opcode(mnemonic) else {
                return false;
            };
            let Some(block_index) = ctx.jump_target_block else {
                return false;
            };
            emitter.emit_branch_placeholder(opcode, subroutine_index, block_index);
            true
        }
    }
}
