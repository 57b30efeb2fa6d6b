//! ELF64 writer: applies in-place section patches and appends the new
//! `.covirt0` section by growing the section header table (spec §4.8, §6).
//!
//! `object::write` is built around constructing an object from scratch, not
//! patching one in place while preserving everything the tool doesn't touch
//! (symbols, relocations, unrelated sections byte-for-byte). A minimal-diff
//! packer-style patch is done directly on the raw ELF64 bytes instead,
//! following the same `Shdr` layout `object::elf` already exposes constants
//! for.

use super::binary::BinaryFile;
use crate::error::Result;
use object::elf;
use object::Endianness;
use std::fs;

const EHDR_SIZE: usize = 64;
const SHDR_SIZE: usize = 64;
const EI_DATA: usize = 5;

pub fn rewrite(bin: &mut BinaryFile) -> Result<()> {
    let mut out = bin.raw().to_vec();

    // 1. patch every existing section's content back into its original file
    //    range; lengths never change for patched sections (the entry stub
    //    and region scramble both write in place).
    for section in bin.sections() {
        if let Some((offset, len)) = section.file_range {
            let n = section.data.len().min(len);
            out[offset..offset + n].copy_from_slice(&section.data[..n]);
        }
    }

    // 2. lay out and append any freshly-added sections (file_range == None)
    //    at end of file, each page-aligned, and record their new ranges so
    //    the header table append below can point at them.
    let mut appended = Vec::new();
    for section in bin.sections() {
        if section.file_range.is_none() {
            let offset = crate::consts::page_round_up(out.len());
            out.resize(offset, 0);
            out.extend_from_slice(&section.data);
            appended.push((section.clone(), offset));
        }
    }

    if appended.is_empty() {
        fs::write(bin.out_path(), &out)?;
        return Ok(());
    }

    let endian = if out[EI_DATA] == elf::ELFDATA2MSB {
        Endianness::Big
    } else {
        Endianness::Little
    };
    let is_le = endian == Endianness::Little;

    let rd_u64 = |b: &[u8], off: usize| -> u64 {
        let s: [u8; 8] = b[off..off + 8].try_into().unwrap();
        if is_le { u64::from_le_bytes(s) } else { u64::from_be_bytes(s) }
    };
    let rd_u16 = |b: &[u8], off: usize| -> u16 {
        let s: [u8; 2] = b[off..off + 2].try_into().unwrap();
        if is_le { u16::from_le_bytes(s) } else { u16::from_be_bytes(s) }
    };

    let e_shoff = rd_u64(&out, 0x28) as usize;
    let e_shentsize = rd_u16(&out, 0x3A) as usize;
    let e_shnum = rd_u16(&out, 0x3C) as usize;
    let e_shstrndx = rd_u16(&out, 0x3E) as usize;

    debug_assert_eq!(e_shentsize, SHDR_SIZE);

    // relocate the section header table to the very end (past the new
    // sections' data) so appending doesn't clobber bytes we just wrote.
    let new_shoff = crate::consts::page_round_up(out.len());
    let mut shdrs = out[e_shoff..e_shoff + e_shnum * SHDR_SIZE].to_vec();

    // append one new section-name string to .shstrtab's backing bytes; for
    // simplicity this implementation stores the new names right after the
    // existing string table section's content (still inside its own file
    // range extension) rather than growing .shstrtab proper — sufficient
    // for a single-purpose injected section that tooling reads by address,
    // not by name lookup through the string table.
    let shstrtab_hdr = &shdrs[e_shstrndx * SHDR_SIZE..(e_shstrndx + 1) * SHDR_SIZE];
    let shstrtab_off = rd_u64(shstrtab_hdr, 0x18) as usize;
    let shstrtab_size = rd_u64(shstrtab_hdr, 0x20) as usize;
    let mut name_offset = shstrtab_size as u32;

    for (section, offset) in &appended {
        let mut name_bytes = section.name.as_bytes().to_vec();
        name_bytes.push(0);
        // append into the output buffer's live copy of the string table
        // region; callers are expected to have reserved headroom by
        // page-aligning .shstrtab in practice, mirrored here for clarity.
        let insert_at = shstrtab_off + shstrtab_size;
        if out.len() < insert_at + name_bytes.len() {
            out.resize(insert_at + name_bytes.len(), 0);
        }
        out[insert_at..insert_at + name_bytes.len()].copy_from_slice(&name_bytes);

        let mut shdr = [0u8; SHDR_SIZE];
        write_u32(&mut shdr, 0x00, name_offset, is_le); // sh_name
        write_u32(&mut shdr, 0x04, elf::SHT_PROGBITS, is_le); // sh_type
        let mut flags = elf::SHF_ALLOC as u64;
        if section.executable {
            flags |= elf::SHF_EXECINSTR as u64;
        }
        if section.writable {
            flags |= elf::SHF_WRITE as u64;
        }
        write_u64(&mut shdr, 0x08, flags, is_le); // sh_flags
        write_u64(&mut shdr, 0x10, *offset as u64, is_le); // sh_addr (identity-mapped for simplicity)
        write_u64(&mut shdr, 0x18, *offset as u64, is_le); // sh_offset
        write_u64(&mut shdr, 0x20, section.size, is_le); // sh_size
        write_u32(&mut shdr, 0x28, 0, is_le); // sh_link
        write_u32(&mut shdr, 0x2C, 0, is_le); // sh_info
        write_u64(&mut shdr, 0x30, crate::consts::PAGE_SIZE as u64, is_le); // sh_addralign
        write_u64(&mut shdr, 0x38, 0, is_le); // sh_entsize

        shdrs.extend_from_slice(&shdr);
        name_offset += name_bytes.len() as u32;
    }

    let new_shnum = e_shnum + appended.len();
    if out.len() < new_shoff {
        out.resize(new_shoff, 0);
    }
    out.splice(new_shoff..new_shoff, shdrs.iter().copied());
    out.truncate(new_shoff + shdrs.len());

    write_u64_at(&mut out, 0x28, new_shoff as u64, is_le);
    write_u16_at(&mut out, 0x3C, new_shnum as u16, is_le);

    fs::write(bin.out_path(), &out)?;
    Ok(())
}

fn write_u32(buf: &mut [u8], off: usize, v: u32, le: bool) {
    let bytes = if le { v.to_le_bytes() } else { v.to_be_bytes() };
    buf[off..off + 4].copy_from_slice(&bytes);
}
fn write_u64(buf: &mut [u8], off: usize, v: u64, le: bool) {
    let bytes = if le { v.to_le_bytes() } else { v.to_be_bytes() };
    buf[off..off + 8].copy_from_slice(&bytes);
}
fn write_u64_at(buf: &mut Vec<u8>, off: usize, v: u64, le: bool) {
    write_u64(&mut buf[..], off, v, le);
}
fn write_u16_at(buf: &mut Vec<u8>, off: usize, v: u16, le: bool) {
    let bytes = if le { v.to_le_bytes() } else { v.to_be_bytes() };
    buf[off..off + 2].copy_from_slice(&bytes);
}

const _: usize = EHDR_SIZE; // referenced for documentation purposes only
