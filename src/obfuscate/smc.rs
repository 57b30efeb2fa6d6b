//! Self-modifying code obfuscation (spec §4.5, grounded on the original's
//! `smc_pass`): a handful of bytes in the VM interpreter's own code are
//! written by the interpreter itself just before they execute, so a static
//! disassembly of the binary never shows the real instruction.
//!
//! The original runs this as a generic post-pass over an already-assembled
//! instruction stream, re-encoding each instruction to measure its length
//! and generating the self-write from those bytes. [`iced_x86::code_asm`]
//! doesn't expose that kind of instruction introspection mid-build, so here
//! the same effect is opt-in at the call site: a handler emits a `pushfq` /
//! `mov [rip+pad], imm` / `popfq` / NOP-padded scratch region instead of the
//! literal instruction directly, for the handful of places in `v0.rs` that
//! write a small immediate into a control path worth hiding.

use crate::error::{CovirtError, Result};
use crate::rng;
use iced_x86::code_asm::*;

fn err(e: iced_x86::IcedError) -> CovirtError {
    CovirtError::SerializerFailure { pass: "smc".to_string(), message: e.to_string() }
}

/// Emit `pushfq; mov byte [rip+pad], value; popfq` followed by `value`'s own
/// byte slot pre-filled with random junk, exactly like the original pass's
/// 1-byte case. Flags are saved and restored because the `mov` would
/// otherwise be invisible to the surrounding handler, but on real silicon a
/// memory-destination `mov` never touches flags anyway — this mirrors the
/// original's defensive habit rather than a functional requirement.
pub fn self_write_u8(a: &mut CodeAssembler, value: u8) -> Result<()> {
    let pad = a.create_label();
    a.pushfq().map_err(err)?;
    a.mov(byte_ptr(pad), value as i32).map_err(err)?;
    a.popfq().map_err(err)?;
    a.set_label(&mut { pad }).map_err(err)?;
    a.db(&[rng::below(256) as u8]).map_err(err)?;
    Ok(())
}

pub fn self_write_u16(a: &mut CodeAssembler, value: u16) -> Result<()> {
    let pad = a.create_label();
    a.pushfq().map_err(err)?;
    a.mov(word_ptr(pad), value as i32).map_err(err)?;
    a.popfq().map_err(err)?;
    a.set_label(&mut { pad }).map_err(err)?;
    a.dw(&[rng::below(1 << 16) as u16]).map_err(err)?;
    Ok(())
}

pub fn self_write_u32(a: &mut CodeAssembler, value: u32) -> Result<()> {
    let pad = a.create_label();
    a.pushfq().map_err(err)?;
    a.mov(dword_ptr(pad), value as i32).map_err(err)?;
    a.popfq().map_err(err)?;
    a.set_label(&mut { pad }).map_err(err)?;
    a.dd(&[rng::next::<u32>()]).map_err(err)?;
    Ok(())
}
