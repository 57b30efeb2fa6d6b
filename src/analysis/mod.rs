//! Region discovery and control-flow decomposition (spec §4.1, §4.2): find
//! marked x86 regions, disassemble them, and split each into basic blocks.

pub mod basic_block;
pub mod binary;
pub mod disasm;
mod elf_writer;
mod pe_writer;
pub mod scan;

pub use basic_block::{decompose, BasicBlock, Subroutine};
pub use binary::BinaryFile;

use crate::error::{CovirtError, Result};

/// Scan every executable section of `bin` for marker-delimited regions and
/// decompose each into a [`Subroutine`] (spec main pipeline, §4.1-§4.2).
pub fn discover_regions(bin: &BinaryFile) -> Result<Vec<Subroutine>> {
    let mut routines = Vec::new();

    for section in bin.executable_sections() {
        let runtime_address = bin.image_base() + section.virtual_address;
        let flat_blocks = scan::scan_section(&section.data, runtime_address)?;
        for flat in flat_blocks {
            routines.push(decompose(flat));
        }
    }

    if routines.is_empty() {
        return Err(CovirtError::NoRegions);
    }

    Ok(routines)
}
