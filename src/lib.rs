//! `covirt`: an x86-64 ELF64/PE+ code virtualizer.
//!
//! Marked regions of a binary are decomposed into basic blocks, lifted to a
//! small stack-machine bytecode, and replaced with a call into a freshly
//! generated VM that interprets that bytecode. See `analysis` for region
//! discovery and decomposition, `compiler` for the lifter and VM generator,
//! and `obfuscate` for the mixed-boolean-arithmetic and self-modifying-code
//! passes layered on top.

pub mod analysis;
pub mod cli;
pub mod compiler;
pub mod consts;
pub mod error;
pub mod obfuscate;
mod patch;
pub mod rng;

use analysis::BinaryFile;
use cli::Cli;
use error::Result;

/// What `run` reports back to `main` beyond the written output file.
#[derive(Debug)]
pub struct PipelineReport {
    /// One line per instruction lifted without a dedicated handler (spec §7
    /// `UnsupportedOperand`: a warning, never fatal).
    pub warnings: Vec<String>,
    /// `vm_offset: source_text` listing, present only when `-d` was passed.
    pub dump_table: Option<String>,
}

/// Run the full pipeline: discover regions, lift and build a VM, obfuscate,
/// and patch the binary in place (spec's main driving loop, §4.1-§4.8).
pub fn run(cli: &Cli) -> Result<PipelineReport> {
    rng::seed_from_cli(cli.seed);

    let mut bin = BinaryFile::open(&cli.input)?;
    bin.set_out_path(cli.output_path());

    tracing::info!(path = %cli.input.display(), "scanning for marked regions");
    let mut routines = analysis::discover_regions(&bin)?;
    tracing::info!(count = routines.len(), "regions found");

    tracing::info!("lifting and assembling vm");
    let compiled = compiler::compile(&mut routines, cli.vm_code_size, cli.vm_stack_size, cli.obfuscation())?;

    let dump_table = cli.show_dump_table.then(|| compiled.lift.format_dump_table());
    let warnings = compiled.lift.warnings.clone();

    tracing::info!(path = %cli.output_path().display(), "patching binary");
    patch::apply(&mut bin, &routines, &compiled, cli.vm_code_size)?;

    Ok(PipelineReport { warnings, dump_table })
}
