//! Decoding of raw x86-64 bytes into the [`Instruction`] shape the rest of
//! the pipeline consumes (spec §3 "Decoded instruction", §4.1).
//!
//! `iced-x86`'s [`Decoder`] is the external disassembler binding; this module
//! is the thin translation layer between its representation and the
//! region-discovery/lifter-facing one, so the rest of the core never touches
//! `iced_x86` types directly.

use iced_x86::{Decoder, DecoderOptions, Formatter, IntelFormatter, Mnemonic, OpKind, Register};

/// Operand size in bytes, one of {1, 2, 4, 8} per spec §3.
pub type Size = u8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Register {
        /// 0..=15, maps directly onto a v-register index (spec §4.4).
        index: u8,
        size: Size,
    },
    Immediate {
        value: i64,
        size: Size,
    },
    Memory {
        base: Option<u8>,
        index: Option<u8>,
        scale: u8,
        disp: i64,
        size: Size,
    },
    /// No operand in this slot (e.g. unary instructions).
    None,
}

impl Operand {
    pub fn is_register(&self) -> bool {
        matches!(self, Operand::Register { .. })
    }
    pub fn is_immediate(&self) -> bool {
        matches!(self, Operand::Immediate { .. })
    }
    pub fn is_memory(&self) -> bool {
        matches!(self, Operand::Memory { .. })
    }
    pub fn is_none(&self) -> bool {
        matches!(self, Operand::None)
    }

    pub fn size(&self) -> Size {
        match *self {
            Operand::Register { size, .. } => size,
            Operand::Immediate { size, .. } => size,
            Operand::Memory { size, .. } => size,
            Operand::None => 0,
        }
    }

    pub fn immediate(&self) -> i64 {
        match *self {
            Operand::Immediate { value, .. } => value,
            _ => panic!("operand is not an immediate"),
        }
    }

    pub fn register_index(&self) -> u8 {
        match *self {
            Operand::Register { index, .. } => index,
            _ => panic!("operand is not a register"),
        }
    }
}

/// A single decoded x86-64 instruction, paired with its source bytes and
/// runtime address. Opaque record carrying everything the lifter needs
/// (spec §3).
#[derive(Debug, Clone)]
pub struct Instruction {
    pub address: u64,
    pub length: u8,
    pub mnemonic: Mnemonic,
    pub operands: [Operand; 2],
    pub text: String,
    pub bytes: Vec<u8>,
}

impl Instruction {
    pub fn dst(&self) -> &Operand {
        &self.operands[0]
    }
    pub fn src(&self) -> &Operand {
        &self.operands[1]
    }

    /// Absolute target of a `jmp`/`jcc` (spec §4.2: `imm + addr + length`).
    /// `convert_operand` resolves `OpKind::NearBranch*` through
    /// `near_branch_target()`, which already yields the absolute address, so
    /// the stored immediate *is* the target rather than a displacement to
    /// add `address`/`length` to.
    pub fn branch_target(&self) -> u64 {
        self.operands[0].immediate() as u64
    }

    pub fn fallthrough(&self) -> u64 {
        self.address + self.length as u64
    }
}

/// `Jb..Jz` in the original Zydis-derived range check (spec §4.1's jump
/// predicate) translated onto `iced-x86`'s mnemonic set.
pub fn is_jump(mnemonic: Mnemonic) -> bool {
    matches!(
        mnemonic,
        Mnemonic::Jmp
            | Mnemonic::Ja
            | Mnemonic::Jae
            | Mnemonic::Jb
            | Mnemonic::Jbe
            | Mnemonic::Jcxz
            | Mnemonic::Je
            | Mnemonic::Jecxz
            | Mnemonic::Jg
            | Mnemonic::Jge
            | Mnemonic::Jl
            | Mnemonic::Jle
            | Mnemonic::Jne
            | Mnemonic::Jno
            | Mnemonic::Jnp
            | Mnemonic::Jns
            | Mnemonic::Jo
            | Mnemonic::Jp
            | Mnemonic::Jrcxz
            | Mnemonic::Js
    )
}

pub fn is_conditional_jump(mnemonic: Mnemonic) -> bool {
    is_jump(mnemonic) && mnemonic != Mnemonic::Jmp
}

fn register_index(reg: Register) -> Option<u8> {
    if reg == Register::None {
        return None;
    }
    // iced-x86's GPR families are contiguous per width; normalize all four
    // widths onto the same 0..=15 index space the VM register file uses.
    let base_of = |lo: Register| (reg as i32 - lo as i32) as u8;
    if (Register::AL..=Register::R15L).contains(&reg) {
        Some(base_of(Register::AL).min(15))
    } else if (Register::AX..=Register::R15W).contains(&reg) {
        Some(base_of(Register::AX))
    } else if (Register::EAX..=Register::R15D).contains(&reg) {
        Some(base_of(Register::EAX))
    } else if (Register::RAX..=Register::R15).contains(&reg) {
        Some(base_of(Register::RAX))
    } else {
        None
    }
}

fn operand_size(reg_or_mem_size: u32) -> Size {
    match reg_or_mem_size {
        1 => 1,
        2 => 2,
        4 => 4,
        8 => 8,
        // default to pointer width for anything we don't expect to see
        // (e.g. unmodelled vector sizes); translators that care will refuse.
        _ => 8,
    }
}

fn convert_operand(ins: &iced_x86::Instruction, slot: u32) -> Operand {
    if slot >= ins.op_count() {
        return Operand::None;
    }
    match ins.op_kind(slot) {
        OpKind::Register => {
            let reg = ins.op_register(slot);
            match register_index(reg) {
                Some(index) => Operand::Register {
                    index,
                    size: operand_size(reg.size() as u32),
                },
                None => Operand::None,
            }
        }
        OpKind::Immediate8
        | OpKind::Immediate16
        | OpKind::Immediate32
        | OpKind::Immediate64
        | OpKind::Immediate8to16
        | OpKind::Immediate8to32
        | OpKind::Immediate8to64
        | OpKind::Immediate32to64 => Operand::Immediate {
            value: ins.immediate64() as i64,
            size: operand_size(ins.memory_size().size() as u32).max(4),
        },
        OpKind::Memory => {
            let base = register_index(ins.memory_base());
            let index = register_index(ins.memory_index());
            Operand::Memory {
                base,
                index,
                scale: if index.is_some() {
                    ins.memory_index_scale() as u8
                } else {
                    1
                },
                disp: ins.memory_displacement64() as i64,
                size: operand_size(ins.memory_size().size() as u32),
            }
        }
        // every `jmp`/`jcc`/relative-`call` target (spec §4.2's `jmp.imm`):
        // `near_branch_target()` is the absolute address, already resolved
        // from the instruction's own relative encoding.
        OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => Operand::Immediate {
            value: ins.near_branch_target() as i64,
            size: 8,
        },
        _ => Operand::None,
    }
}

/// Linearly decode `content` starting at `base_address`, invoking `callback`
/// with each decoded instruction, exactly as the original's `covirt::disasm`
/// drives its Zydis loop (spec §4.1).
pub fn disassemble(content: &[u8], base_address: u64, mut callback: impl FnMut(Instruction)) {
    let mut decoder = Decoder::with_ip(64, content, base_address, DecoderOptions::NONE);
    let mut ins = iced_x86::Instruction::default();
    let mut formatter = IntelFormatter::new();
    let mut text = String::new();

    while decoder.can_decode() {
        decoder.decode_out(&mut ins);
        let offset = (ins.ip() - base_address) as usize;
        let length = ins.len();

        text.clear();
        formatter.format(&ins, &mut text);

        callback(Instruction {
            address: ins.ip(),
            length: length as u8,
            mnemonic: ins.mnemonic(),
            operands: [convert_operand(&ins, 0), convert_operand(&ins, 1)],
            text: text.clone(),
            bytes: content[offset..offset + length].to_vec(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_mov_eax_imm32() {
        // mov eax, 0x1234
        let bytes = [0xB8, 0x34, 0x12, 0x00, 0x00];
        let mut seen = Vec::new();
        disassemble(&bytes, 0x1000, |ins| seen.push(ins));
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].mnemonic, Mnemonic::Mov);
        assert!(seen[0].dst().is_register());
        assert!(seen[0].src().is_immediate());
        assert_eq!(seen[0].src().immediate(), 0x1234);
    }

    #[test]
    fn recognizes_conditional_jump() {
        // jz +2 ; two-byte short jz encoding
        let bytes = [0x74, 0x02];
        let mut seen = Vec::new();
        disassemble(&bytes, 0x2000, |ins| seen.push(ins));
        assert!(is_jump(seen[0].mnemonic));
        assert!(is_conditional_jump(seen[0].mnemonic));
        assert_eq!(seen[0].branch_target(), 0x2000 + 2 + 2);
    }
}
