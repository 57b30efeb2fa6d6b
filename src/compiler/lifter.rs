//! Drives translation of every subroutine/block/instruction into bytecode
//! (spec §4.3 "Lifter"): walks the region tree, resolves intra-region
//! jumps, and emits the subroutine epilogue.

use super::emitter::BytecodeEmitter;
use super::opcode::Opcode;
use super::translate::{self, TranslateContext};
use crate::analysis::{disasm, Subroutine};
use crate::consts::STUB_LENGTH;
use crate::error::{CovirtError, Result};
use std::collections::BTreeMap;

#[derive(Debug)]
pub struct LiftResult {
    pub bytes: Vec<u8>,
    pub dump_table: BTreeMap<usize, String>,
    /// One line per `UnsupportedOperand` fallback (spec §7: a warning, not
    /// fatal).
    pub warnings: Vec<String>,
}

impl LiftResult {
    /// Human-readable `vm_offset: source_text` listing (spec's
    /// `--show_dump_table`, supplemented per SPEC_FULL.md §7).
    pub fn format_dump_table(&self) -> String {
        let mut out = String::new();
        for (offset, text) in &self.dump_table {
            out.push_str(&format!("{offset:>6}: {text}\n"));
        }
        out
    }
}

/// Lift every subroutine's basic blocks into a single flat bytecode stream,
/// assigning `offset_into_lift` on both subroutines and blocks as it goes,
/// then resolve every fill-in-gap once all offsets are known (spec §4.3).
pub fn lift(routines: &mut [Subroutine], vm_entry_length: u64) -> Result<LiftResult> {
    let mut emitter = BytecodeEmitter::new();
    let mut warnings = Vec::new();

    for subroutine_index in 0..routines.len() {
        let region_length = routines[subroutine_index].length();
        let retaddr = routines[subroutine_index].start_va - STUB_LENGTH as u64 + vm_entry_length;

        routines[subroutine_index].offset_into_lift = emitter.len() as u32;

        let block_count = routines[subroutine_index].blocks.len();
        for block_index in 0..block_count {
            routines[subroutine_index].blocks[block_index].offset_into_lift = emitter.len() as u32;

            let instructions = routines[subroutine_index].blocks[block_index].instructions.clone();
            for ins in &instructions {
                emitter.annotate_next(&ins.text);

                let jump_target_block = if disasm::is_jump(ins.mnemonic) {
                    let target = ins.branch_target();
                    let resolved = routines[subroutine_index].block_containing(target);
                    if resolved.is_none() {
                        return Err(CovirtError::JumpEscapesRegion {
                            at: ins.address,
                            target,
                            start: routines[subroutine_index].start_va,
                            end: routines[subroutine_index].end_va,
                        });
                    }
                    resolved
                } else {
                    None
                };

                let ctx = TranslateContext {
                    retaddr,
                    jump_target_block,
                };

                let lifted = translate::is_translatable(ins.mnemonic)
                    && translate::translate(&mut emitter, ins, &ctx, subroutine_index);

                if !lifted {
                    emitter.emit_native(&ins.bytes);
                    let message = format!(
                        "instruction '{}' at {:#x} has no defined vm handler, executing natively",
                        ins.text, ins.address
                    );
                    tracing::warn!("{message}");
                    warnings.push(message);
                }
            }
        }

        // subroutine epilogue (spec §4.3 "Subroutine epilogue")
        let bytes_to_skip = (region_length + 2 * STUB_LENGTH as u64) - vm_entry_length;
        emitter.emit_vm_exit(bytes_to_skip as u16);
        let _ = Opcode::VmExit; // documents which opcode emit_vm_exit uses
    }

    emitter.resolve_fill_in_gaps(routines);

    tracing::info!(
        instructions = emitter.instruction_count(),
        "generated vm instructions"
    );

    Ok(LiftResult {
        bytes: emitter.bytes().to_vec(),
        dump_table: emitter.dump_table().clone(),
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{decompose, disasm, BasicBlock};

    fn lift_single(bytes: &[u8], base: u64) -> LiftResult {
        let mut instructions = Vec::new();
        disasm::disassemble(bytes, base, |ins| instructions.push(ins));
        let flat = BasicBlock {
            start_va: base,
            end_va: base + bytes.len() as u64,
            offset_into_lift: 0,
            instructions,
        };
        let mut routines = vec![decompose(flat)];
        lift(&mut routines, 17).unwrap()
    }

    #[test]
    fn simple_mov_lowers_to_push_imm_pop_and_exit() {
        // mov eax, 0x1234
        let result = lift_single(&[0xB8, 0x34, 0x12, 0x00, 0x00], 0x1000);
        assert!(result.bytes[0] & 0b11 == 0b10); // size code for 4 bytes
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn unsupported_opcode_falls_back_to_native_with_warning() {
        // cpuid
        let result = lift_single(&[0x0F, 0xA2], 0x1000);
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn jump_outside_region_is_an_error() {
        // jmp -0x100 (well outside the 2-byte region)
        let mut instructions = Vec::new();
        disasm::disassemble(&[0xEB, 0x80], 0x1000, |ins| instructions.push(ins));
        let flat = BasicBlock {
            start_va: 0x1000,
            end_va: 0x1002,
            offset_into_lift: 0,
            instructions,
        };
        let mut routines = vec![decompose(flat)];
        let err = lift(&mut routines, 17).unwrap_err();
        assert!(matches!(err, CovirtError::JumpEscapesRegion { .. }));
    }
}
