//! The growing bytecode buffer the lifter writes into (spec §3 "Bytecode
//! stream", §3 "Fill-in-gap"), plus the dump table used by `--show_dump_table`.

use super::opcode::{encode_opcode_byte, Opcode};
use std::collections::BTreeMap;

/// A deferred intra-region jump: the basic block a `jmp`/`jcc` targets is
/// not known to have a final `offset_into_lift` until every block in the
/// subroutine has been lifted, so the 16-bit target write is recorded here
/// and patched in a second pass (spec §3, §4.3 "Intra-region jump
/// resolution"). Holds a block index rather than a pointer so it survives
/// the `Vec<BasicBlock>` it refers to being reallocated (spec §9).
#[derive(Debug, Clone, Copy)]
pub struct FillInGap {
    pub subroutine_index: usize,
    pub block_index: usize,
    pub offset_in_bytecode: usize,
}

#[derive(Default)]
pub struct BytecodeEmitter {
    bytes: Vec<u8>,
    instruction_count: usize,
    fill_in_gaps: Vec<FillInGap>,
    dump_table: BTreeMap<usize, String>,
}

impl BytecodeEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn instruction_count(&self) -> usize {
        self.instruction_count
    }

    pub fn fill_in_gaps(&self) -> &[FillInGap] {
        &self.fill_in_gaps
    }

    pub fn dump_table(&self) -> &BTreeMap<usize, String> {
        &self.dump_table
    }

    /// Record the source text of the instruction about to be lifted, keyed
    /// by the instruction count so far — the original's dump index table
    /// (spec §4.3).
    pub fn annotate_next(&mut self, source_text: &str) {
        self.dump_table.insert(self.instruction_count, source_text.to_string());
    }

    fn push_opcode(&mut self, opcode: Opcode, size: u8) {
        self.bytes.push(encode_opcode_byte(opcode, size));
        self.instruction_count += 1;
    }

    fn push_sized(&mut self, value: u64, size: u8) {
        match size {
            1 => self.bytes.push(value as u8),
            2 => self.bytes.extend_from_slice(&(value as u16).to_le_bytes()),
            4 => self.bytes.extend_from_slice(&(value as u32).to_le_bytes()),
            8 => self.bytes.extend_from_slice(&value.to_le_bytes()),
            _ => panic!("unsupported operand size {size}"),
        }
    }

    pub fn emit_no_operand(&mut self, opcode: Opcode, size: u8) {
        self.push_opcode(opcode, size);
    }

    pub fn emit_reg(&mut self, opcode: Opcode, size: u8, reg_index: u8) {
        self.push_opcode(opcode, size);
        self.bytes.push(reg_index);
    }

    pub fn emit_imm(&mut self, opcode: Opcode, size: u8, value: i64) {
        self.push_opcode(opcode, size);
        self.push_sized(value as u64, size);
    }

    /// Emit an opcode followed by a 16-bit relative-target placeholder,
    /// registering a [`FillInGap`] at that offset.
    pub fn emit_branch_placeholder(
        &mut self,
        opcode: Opcode,
        subroutine_index: usize,
        block_index: usize,
    ) {
        self.push_opcode(opcode, 8);
        let offset_in_bytecode = self.bytes.len();
        self.bytes.extend_from_slice(&0u16.to_le_bytes());
        self.fill_in_gaps.push(FillInGap {
            subroutine_index,
            block_index,
            offset_in_bytecode,
        });
    }

    pub fn emit_vm_exit(&mut self, bytes_to_skip: u16) {
        self.push_opcode(Opcode::VmExit, 2);
        self.bytes.extend_from_slice(&bytes_to_skip.to_le_bytes());
    }

    /// Fall back to embedding the raw native instruction bytes verbatim
    /// (spec §4.3: a translator refusing is not fatal).
    pub fn emit_native(&mut self, raw_bytes: &[u8]) {
        self.push_opcode(Opcode::ExecuteNative, 1);
        self.bytes.push(raw_bytes.len() as u8);
        self.bytes.extend_from_slice(raw_bytes);
    }

    /// Patch every recorded fill-in-gap with the target block's final
    /// `offset_into_lift`, once every block in every subroutine has one
    /// (spec §4.3, §8 invariant 2).
    pub fn resolve_fill_in_gaps(&mut self, subroutines: &[super::super::analysis::Subroutine]) {
        for gap in &self.fill_in_gaps {
            let target = subroutines[gap.subroutine_index].blocks[gap.block_index].offset_into_lift;
            let at = gap.offset_in_bytecode;
            self.bytes[at..at + 2].copy_from_slice(&(target as u16).to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_in_gaps_resolve_to_block_offsets() {
        use crate::analysis::{BasicBlock, Subroutine};

        let mut emitter = BytecodeEmitter::new();
        emitter.emit_branch_placeholder(Opcode::Jmp, 0, 1);
        let gap_offset = emitter.fill_in_gaps()[0].offset_in_bytecode;

        let mut routine = Subroutine {
            start_va: 0,
            end_va: 0x100,
            offset_into_lift: 0,
            blocks: vec![
                BasicBlock { start_va: 0, end_va: 10, offset_into_lift: 0, instructions: vec![] },
                BasicBlock { start_va: 10, end_va: 20, offset_into_lift: 42, instructions: vec![] },
            ],
        };
        routine.blocks[1].offset_into_lift = 42;

        emitter.resolve_fill_in_gaps(&[routine]);
        let written = u16::from_le_bytes(emitter.bytes()[gap_offset..gap_offset + 2].try_into().unwrap());
        assert_eq!(written, 42);
    }
}
