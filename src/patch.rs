//! Binary patching (spec §4.8): scatter each marked region with random
//! bytes, drop an entry stub where the region used to be, and append the
//! VM section carrying the lifted bytecode.

use crate::analysis::{BinaryFile, Subroutine};
use crate::compiler::vm::EntryStub;
use crate::compiler::CompileResult;
use crate::consts::{STUB_LENGTH, VM_SECTION_NAME};
use crate::error::{CovirtError, Result};
use crate::rng;

/// Apply a completed lift/VM build to `bin` and write the result out (spec
/// §4.8's driving loop). `code_size` is the capacity reserved for `vcode`;
/// exceeding it is a build-time configuration error, not a bug in the lift.
pub fn apply(bin: &mut BinaryFile, routines: &[Subroutine], compiled: &CompileResult, code_size: usize) -> Result<()> {
    if compiled.lift.bytes.len() > code_size {
        return Err(CovirtError::CodeSpaceExhausted(compiled.lift.bytes.len()));
    }

    let mut vm_section_bytes = compiled.vm.bytes.clone();
    let vcode_start = compiled.vm.data_start + compiled.vm.vcode_offset;
    vm_section_bytes[vcode_start..vcode_start + compiled.lift.bytes.len()].copy_from_slice(&compiled.lift.bytes);
    for slot in vm_section_bytes[vcode_start + compiled.lift.bytes.len()..vcode_start + code_size].iter_mut() {
        *slot = rng::below(256) as u8;
    }

    let vm_section_va = bin.add_section(VM_SECTION_NAME, vm_section_bytes, true, true);
    let venter_va = vm_section_va + compiled.vm.venter_call_target();

    let image_base = bin.image_base();

    for routine in routines {
        patch_region(bin, image_base, routine, venter_va)?;
    }

    bin.write()
}

fn patch_region(bin: &mut BinaryFile, image_base: u64, routine: &Subroutine, venter_va: u64) -> Result<()> {
    let region_section_name = bin
        .section_by_va(routine.start_va)
        .ok_or(CovirtError::SectionNotFound(routine.start_va))?
        .name
        .clone();
    let region_section_va = image_base
        + bin
            .section_by_name(&region_section_name)
            .ok_or_else(|| CovirtError::SectionNotFound(routine.start_va))?
            .virtual_address;

    // 1. scatter the original region with random bytes (spec §4.8 "fills the
    // entire original region with random bytes").
    let region_offset = (routine.start_va - region_section_va) as usize;
    let filler: Vec<u8> = (0..routine.length()).map(|_| rng::below(256) as u8).collect();
    bin.patch_section(&region_section_name, region_offset, &filler)?;

    // 2. drop the entry stub `stub_length` bytes before the region start,
    // overwriting the tail of the start marker (spec §4.8 "offset =
    // subroutine.start_va − base − stub_length").
    let stub_va = routine.start_va - STUB_LENGTH as u64;
    let stub_offset = region_offset - STUB_LENGTH;

    // the call instruction's own return address is `stub_va +
    // ENTRY_STUB_LENGTH` (spec §4.3's `retaddr`, independently derived at
    // lift time); a correct x86 rel32 is `target − (call_site + 5)` with
    // `call_site + 5` equal to that same return address, so the two must
    // agree exactly for the lifted `lea`/`call` fix-ups to line up with
    // what actually executes.
    let retaddr = stub_va + crate::compiler::vm::ENTRY_STUB_LENGTH as u64;
    let call_rel32 = EntryStub::rel32_for(retaddr - 5, venter_va);
    let stub = EntryStub::new(routine.offset_into_lift, call_rel32);

    bin.patch_section(&region_section_name, stub_offset, &stub.bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_stub_rel32_matches_the_return_address_convention() {
        let stub_va: u64 = 0x4000;
        let retaddr = stub_va + crate::compiler::vm::ENTRY_STUB_LENGTH as u64;
        let venter_va: u64 = 0x9000;
        let rel32 = EntryStub::rel32_for(retaddr - 5, venter_va);
        assert_eq!(retaddr as i64 + rel32 as i64, venter_va as i64);
    }
}
