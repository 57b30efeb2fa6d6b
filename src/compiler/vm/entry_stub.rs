//! The literal bytes written for a region's VM entry stub (spec §6 "Entry
//! stub template"):
//!
//! ```text
//! 48 81 EC 00 02 00 00   sub rsp, 0x200
//! 68 ii ii ii ii         push <lift_offset>
//! E8 cc cc cc cc         call <rel32 to venter>
//! ```
//!
//! This is `vm_entry_length` (17 bytes) — distinct from `stub_length` (spec
//! §6, 16 bytes), which is how many bytes of the *original* region the stub
//! overwrites in place; the two only coincide by spec convention elsewhere.

/// Length of the literal entry-stub template, i.e. `vm_entry_length`.
pub const ENTRY_STUB_LENGTH: usize = 17;

pub struct EntryStub {
    pub lift_offset: u32,
    pub call_rel32: i32,
}

impl EntryStub {
    pub fn new(lift_offset: u32, call_rel32: i32) -> Self {
        Self { lift_offset, call_rel32 }
    }

    /// `target − (call_site + 5)`, the standard x86 rel32 displacement for a
    /// `call` whose opcode+imm32 occupy 5 bytes starting at `call_site`
    /// (spec §4.8: `call_offset = vm_section_va − (region_section_va +
    /// stub_offset) − stub_length`, specialized to a `call` encoding).
    pub fn rel32_for(call_site: u64, target: u64) -> i32 {
        (target as i64 - (call_site as i64 + 5)) as i32
    }

    pub fn bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ENTRY_STUB_LENGTH);
        out.extend_from_slice(&[0x48, 0x81, 0xEC, 0x00, 0x02, 0x00, 0x00]);
        out.push(0x68);
        out.extend_from_slice(&self.lift_offset.to_le_bytes());
        out.push(0xE8);
        out.extend_from_slice(&self.call_rel32.to_le_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_matches_the_spec_template_length() {
        let stub = EntryStub::new(0x10, 0x20);
        assert_eq!(stub.bytes().len(), ENTRY_STUB_LENGTH);
        assert_eq!(stub.bytes()[0..3], [0x48, 0x81, 0xEC]);
        assert_eq!(stub.bytes()[7], 0x68);
        assert_eq!(stub.bytes()[12], 0xE8);
    }

    #[test]
    fn rel32_points_past_the_call_instruction() {
        let rel = EntryStub::rel32_for(0x2000, 0x2000 + 5 + 0x30);
        assert_eq!(rel, 0x30);
    }
}
