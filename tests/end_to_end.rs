//! Pipeline-level scenarios from spec §8, built against a minimal
//! synthetic ELF64 relocatable object carrying the region markers around
//! hand-assembled x86-64 bytes.

use covirt::cli::Cli;
use covirt::consts::{END_MARKER, START_MARKER};
use covirt::error::CovirtError;
use object::write::Object;
use object::{Architecture, BinaryFormat, Endianness, SectionKind};
use std::path::{Path, PathBuf};

fn build_elf(text: &[u8]) -> Vec<u8> {
    let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
    let section = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
    obj.append_section_data(section, text, 16);
    obj.write().expect("synthesize a minimal ELF64 object")
}

fn write_input(dir: &Path, name: &str, text: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, build_elf(text)).unwrap();
    path
}

fn region(body: &[u8]) -> Vec<u8> {
    let mut v = Vec::new();
    v.extend_from_slice(&START_MARKER);
    v.extend_from_slice(body);
    v.extend_from_slice(&END_MARKER);
    v
}

fn base_cli(input: PathBuf, output: PathBuf) -> Cli {
    Cli {
        input,
        output: Some(output),
        vm_code_size: 2048,
        vm_stack_size: 2048,
        no_smc: false,
        no_mba: false,
        show_dump_table: false,
        seed: Some(1),
    }
}

#[test]
fn e1_no_regions_reports_no_regions_and_touches_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), "plain.bin", &[0x90, 0x90, 0x90, 0x90]);
    let output = dir.path().join("plain.bin.covirt");

    let err = covirt::run(&base_cli(input, output.clone())).unwrap_err();
    assert!(matches!(err, CovirtError::NoRegions));
    assert!(!output.exists());
}

#[test]
fn e2_single_mov_round_trips_through_the_full_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    // mov eax, 0x1234
    let text = region(&[0xB8, 0x34, 0x12, 0x00, 0x00]);
    let input = write_input(dir.path(), "mov.bin", &text);
    let output = dir.path().join("mov.bin.covirt");

    let mut cli = base_cli(input, output.clone());
    cli.show_dump_table = true;

    let report = covirt::run(&cli).expect("single translatable mov should lift cleanly");
    assert!(report.warnings.is_empty());
    assert!(output.exists());
    let table = report.dump_table.expect("show_dump_table was set");
    assert!(table.contains("mov"));
}

#[test]
fn e3_conditional_branch_lifts_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    // cmp eax,1 ; jz +5 ; mov eax,2 ; mov eax,3 (spec §8 E3)
    let text = region(&[
        0x83, 0xF8, 0x01, // cmp eax, 1
        0x74, 0x05, // jz +5
        0xB8, 0x02, 0x00, 0x00, 0x00, // mov eax, 2
        0xB8, 0x03, 0x00, 0x00, 0x00, // mov eax, 3
    ]);
    let input = write_input(dir.path(), "jz.bin", &text);
    let output = dir.path().join("jz.bin.covirt");

    let report = covirt::run(&base_cli(input, output.clone())).expect("conditional jump within the region should lift");
    assert!(report.warnings.is_empty());
    assert!(output.exists());
}

#[test]
fn e5_rip_relative_lea_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    // lea rax, [rip+0]
    let text = region(&[0x48, 0x8D, 0x05, 0x00, 0x00, 0x00, 0x00]);
    let input = write_input(dir.path(), "lea.bin", &text);
    let output = dir.path().join("lea.bin.covirt");

    let report = covirt::run(&base_cli(input.clone(), output.clone())).expect("rip-relative lea should lift via the rel32 fix-up");
    assert!(report.warnings.is_empty());
    assert!(output.exists());
    assert_ne!(std::fs::read(&output).unwrap(), std::fs::read(&input).unwrap());
}

#[test]
fn e4_unsupported_opcode_falls_back_to_native_with_a_warning() {
    let dir = tempfile::tempdir().unwrap();
    // cpuid has no dedicated handler
    let text = region(&[0x0F, 0xA2]);
    let input = write_input(dir.path(), "cpuid.bin", &text);
    let output = dir.path().join("cpuid.bin.covirt");

    let report = covirt::run(&base_cli(input, output)).expect("unsupported opcode is a warning, not an error");
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].contains("no defined vm handler"));
}

#[test]
fn e6_disabling_mba_and_smc_is_deterministic_across_runs_with_the_same_seed() {
    let dir = tempfile::tempdir().unwrap();
    let text = region(&[0xB8, 0x34, 0x12, 0x00, 0x00]);
    let input = write_input(dir.path(), "det.bin", &text);

    let out_a = dir.path().join("a.covirt");
    let out_b = dir.path().join("b.covirt");

    let mut cli_a = base_cli(input.clone(), out_a.clone());
    cli_a.no_mba = true;
    cli_a.no_smc = true;

    let mut cli_b = base_cli(input, out_b.clone());
    cli_b.no_mba = true;
    cli_b.no_smc = true;

    covirt::run(&cli_a).unwrap();
    covirt::run(&cli_b).unwrap();

    let bytes_a = std::fs::read(out_a).unwrap();
    let bytes_b = std::fs::read(out_b).unwrap();
    assert_eq!(bytes_a, bytes_b);
}

#[test]
fn code_space_exhausted_is_reported_when_vcode_is_too_small() {
    let dir = tempfile::tempdir().unwrap();
    // a long chain of movs to guarantee the lift overflows a 1-byte vcode budget
    let mut body = Vec::new();
    for _ in 0..8 {
        body.extend_from_slice(&[0xB8, 0x34, 0x12, 0x00, 0x00]);
    }
    let text = region(&body);
    let input = write_input(dir.path(), "big.bin", &text);
    let output = dir.path().join("big.bin.covirt");

    let mut cli = base_cli(input, output.clone());
    cli.vm_code_size = 1;

    let err = covirt::run(&cli).unwrap_err();
    assert!(matches!(err, CovirtError::CodeSpaceExhausted(_)));
    assert!(!output.exists());
}
