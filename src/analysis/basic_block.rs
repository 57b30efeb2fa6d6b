//! Basic-block decomposition (spec §4.2) and the subroutine data model
//! (spec §3).

use super::disasm::{is_conditional_jump, is_jump, Instruction};
use std::collections::BTreeSet;

/// Ordered sequence of decoded instructions bounded by `[start_va, end_va)`.
/// `offset_into_lift` is filled in during lifting (spec §3).
#[derive(Debug, Clone, Default)]
pub struct BasicBlock {
    pub start_va: u64,
    pub end_va: u64,
    pub offset_into_lift: u32,
    pub instructions: Vec<Instruction>,
}

impl BasicBlock {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start_va && addr < self.end_va
    }
}

/// One marked region. Blocks are held in a vector rather than the original's
/// forward linked list (spec §9 "Cyclic structures": prefer a contiguous
/// vector of blocks with indices, since fill-in-gaps then survive
/// reallocation).
#[derive(Debug, Clone, Default)]
pub struct Subroutine {
    pub start_va: u64,
    pub end_va: u64,
    pub offset_into_lift: u32,
    pub blocks: Vec<BasicBlock>,
}

impl Subroutine {
    pub fn length(&self) -> u64 {
        self.end_va - self.start_va
    }

    /// Locate the block whose `[start, end)` covers `addr`, used both to
    /// resolve intra-region jump targets during lifting and to validate
    /// §3's invariant that blocks partition the region without overlap.
    pub fn block_containing(&self, addr: u64) -> Option<usize> {
        self.blocks.iter().position(|bb| bb.contains(addr))
    }
}

/// Split a single flat block (everything between the start/end markers, spec
/// §4.1) into basic blocks around intra-region jumps (spec §4.2).
///
/// Split points are every jump target, every conditional jump's
/// fall-through, and the region end. A final synthetic one-byte block is
/// appended past `end_va` so lifting always has a terminal "VM exit" block to
/// attach the epilogue to.
pub fn decompose(flat: BasicBlock) -> Subroutine {
    let mut splits: BTreeSet<u64> = BTreeSet::new();

    for ins in &flat.instructions {
        if is_jump(ins.mnemonic) {
            let target = ins.branch_target();
            // targets outside the region get no block of their own; the
            // lifter's lookup then legitimately fails and raises
            // `JumpEscapesRegion` (spec §4.2) instead of this pass silently
            // carving out a block for an address the region doesn't own.
            if target >= flat.start_va && target <= flat.end_va {
                splits.insert(target);
            }
            if is_conditional_jump(ins.mnemonic) {
                splits.insert(ins.fallthrough());
            }
        }
    }
    splits.insert(flat.end_va);

    let mut blocks = Vec::with_capacity(splits.len() + 1);
    let mut start = flat.start_va;

    let split_points: Vec<u64> = splits.into_iter().collect();
    for (i, &end) in split_points.iter().enumerate() {
        let instructions: Vec<Instruction> = flat
            .instructions
            .iter()
            .filter(|ins| ins.address >= start && ins.address < end)
            .cloned()
            .collect();

        blocks.push(BasicBlock {
            start_va: start,
            end_va: end,
            offset_into_lift: 0,
            instructions,
        });

        let is_last = i + 1 == split_points.len();
        start = end;

        if is_last {
            // synthetic vm_exit block: one byte past the region so the
            // lifter has somewhere to attach the epilogue (spec §4.2).
            blocks.push(BasicBlock {
                start_va: end,
                end_va: end + 1,
                offset_into_lift: 0,
                instructions: Vec::new(),
            });
        }
    }

    Subroutine {
        start_va: flat.start_va,
        end_va: flat.end_va,
        offset_into_lift: 0,
        blocks,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::disasm;

    fn make_flat(bytes: &[u8], base: u64) -> BasicBlock {
        let mut instructions = Vec::new();
        disasm::disassemble(bytes, base, |ins| instructions.push(ins));
        let end = base + bytes.len() as u64;
        BasicBlock {
            start_va: base,
            end_va: end,
            offset_into_lift: 0,
            instructions,
        }
    }

    #[test]
    fn blocks_partition_the_region_without_overlap() {
        // cmp eax,1 ; jz +5 ; mov eax,2 ; (jz target) mov eax,3
        let bytes = [
            0x83, 0xF8, 0x01, // cmp eax, 1
            0x74, 0x05, // jz +5
            0xB8, 0x02, 0x00, 0x00, 0x00, // mov eax, 2
            0xB8, 0x03, 0x00, 0x00, 0x00, // mov eax, 3
        ];
        let flat = make_flat(&bytes, 0x1000);
        let routine = decompose(flat);

        // every instruction address must be covered, blocks disjoint
        let mut covered: Vec<(u64, u64)> = routine.blocks.iter().map(|b| (b.start_va, b.end_va)).collect();
        covered.sort();
        for w in covered.windows(2) {
            assert!(w[0].1 <= w[1].0, "blocks overlap: {:?}", w);
        }
        assert_eq!(covered.first().unwrap().0, routine.start_va);
        // last real block ends at region end; the synthetic block extends one byte past
        assert!(covered.iter().any(|&(_, end)| end == routine.end_va));
    }

    #[test]
    fn conditional_jump_splits_into_two_destinations() {
        let bytes = [
            0x83, 0xF8, 0x01, // cmp eax, 1
            0x74, 0x05, // jz +5 -> targets mov eax,3
            0xB8, 0x02, 0x00, 0x00, 0x00, // mov eax, 2 (fallthrough block)
            0xB8, 0x03, 0x00, 0x00, 0x00, // mov eax, 3 (jump target block)
        ];
        let flat = make_flat(&bytes, 0x1000);
        let routine = decompose(flat);
        // cmp+jz, fallthrough mov, target mov, synthetic exit = 4 blocks
        assert_eq!(routine.blocks.len(), 4);
        assert!(routine.block_containing(0x1000 + 5).is_some());
        assert!(routine.block_containing(0x1000 + 10).is_some());
    }
}
