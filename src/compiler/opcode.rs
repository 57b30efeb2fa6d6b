//! Bytecode opcode encoding (spec §3 "Bytecode stream", §4.4 "Handler set").
//!
//! Each VM instruction is a single opcode byte `OOOO_OOSS`: a 6-bit opcode
//! and a 2-bit size code (`00`→1, `01`→2, `10`→4, `11`→8 bytes), followed by
//! inline operands.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    VmExit = 0,
    PushImm = 1,
    PushReg = 2,
    Pop = 3,
    Read = 4,
    Write = 5,
    Add = 6,
    Sub = 7,
    Xor = 8,
    And = 9,
    Or = 10,
    Cmp = 11,
    Jmp = 12,
    Jz = 13,
    Jnz = 14,
    Jb = 15,
    Jnb = 16,
    Jbe = 17,
    Jnbe = 18,
    Jl = 19,
    Jle = 20,
    Jnl = 21,
    Jnle = 22,
    Call = 23,
    Lea = 24,
    ExecuteNative = 25,
}

/// Every dispatchable opcode, in vtable slot order. `vm_enter` is reached by
/// `call`, not through the bytecode dispatch table, so it does not occupy a
/// slot here (spec §4.4 "Dispatch"). The table itself is still sized larger
/// than this list (spec glossary: "28-slot table") to leave headroom for the
/// 6-bit opcode field without every slot needing to be populated.
pub const ALL_OPCODES: &[Opcode] = &[
    Opcode::VmExit,
    Opcode::PushImm,
    Opcode::PushReg,
    Opcode::Pop,
    Opcode::Read,
    Opcode::Write,
    Opcode::Add,
    Opcode::Sub,
    Opcode::Xor,
    Opcode::And,
    Opcode::Or,
    Opcode::Cmp,
    Opcode::Jmp,
    Opcode::Jz,
    Opcode::Jnz,
    Opcode::Jb,
    Opcode::Jnb,
    Opcode::Jbe,
    Opcode::Jnbe,
    Opcode::Jl,
    Opcode::Jle,
    Opcode::Jnl,
    Opcode::Jnle,
    Opcode::Call,
    Opcode::Lea,
    Opcode::ExecuteNative,
];

/// Number of slots reserved in the runtime dispatch table (spec glossary).
pub const VTABLE_SLOTS: usize = 32;

/// Encode a `(opcode, size)` pair into the leading byte of a bytecode
/// instruction. `size` must be one of {1, 2, 4, 8}.
pub fn encode_opcode_byte(opcode: Opcode, size: u8) -> u8 {
    let size_code = size_to_code(size);
    (opcode as u8) | (size_code << 6)
}

pub fn size_to_code(size: u8) -> u8 {
    match size {
        1 => 0b00,
        2 => 0b01,
        4 => 0b10,
        8 => 0b11,
        _ => panic!("unsupported operand size {size}"),
    }
}

pub fn code_to_size(code: u8) -> u8 {
    match code & 0b11 {
        0b00 => 1,
        0b01 => 2,
        0b10 => 4,
        0b11 => 8,
        _ => unreachable!(),
    }
}

/// Decode the low 6 bits of an opcode byte back into an [`Opcode`], and the
/// high 2 bits into its operand size (spec §8 invariant 3).
pub fn decode_opcode_byte(byte: u8) -> Option<(Opcode, u8)> {
    let opcode_bits = byte & 0b0011_1111;
    let size = code_to_size(byte >> 6);
    let opcode = ALL_OPCODES.iter().find(|op| **op as u8 == opcode_bits)?;
    Some((*opcode, size))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_opcode_round_trips_through_encoding() {
        for &op in ALL_OPCODES {
            for &size in &[1u8, 2, 4, 8] {
                let byte = encode_opcode_byte(op, size);
                let (decoded_op, decoded_size) = decode_opcode_byte(byte).unwrap();
                assert_eq!(decoded_op, op);
                assert_eq!(decoded_size, size);
            }
        }
    }

    #[test]
    fn vtable_has_room_for_every_opcode() {
        assert!(ALL_OPCODES.len() <= VTABLE_SLOTS);
    }
}
