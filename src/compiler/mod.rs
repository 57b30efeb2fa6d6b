//! Lifts marked regions to bytecode and builds the VM that will run it
//! (spec §4.3 "Lifter", §4.4 "VM generator").

pub mod emitter;
mod lifter;
pub mod opcode;
mod translate;
pub mod vm;

pub use lifter::{lift, LiftResult};
pub use vm::{generate as generate_vm, EntryStub, GeneratedVm, ENTRY_STUB_LENGTH};

use crate::analysis::Subroutine;
use crate::error::Result;

/// Lift every region and build the interpreter that will execute the
/// result, in one call (spec's compiler pipeline): the VM's code length has
/// no bearing on the lift itself, only `vm_entry_length` does, so the two
/// steps are independent and just run in sequence here.
pub struct CompileResult {
    pub lift: LiftResult,
    pub vm: GeneratedVm,
}

pub fn compile(
    routines: &mut [Subroutine],
    code_size: usize,
    stack_size: usize,
    obfuscation: crate::obfuscate::ObfuscationConfig,
) -> Result<CompileResult> {
    let lift = lift(routines, ENTRY_STUB_LENGTH as u64)?;
    let vm = generate_vm(code_size, stack_size, obfuscation.smc, obfuscation.mba)?;
    Ok(CompileResult { lift, vm })
}
