//! Format-abstracted binary read/write wrapper (spec §6).
//!
//! `spec.md` treats the underlying binary library (LIEF in the original) as
//! an external collaborator and specifies only the operations the core
//! consumes: enumerate sections, test executable-ness, get the image base,
//! find a section by name or containing VA, add a section with given flags,
//! and write the updated file. This module implements exactly that surface
//! on top of `object`'s read API (which already understands both ELF64 and
//! PE64 headers) plus a hand-rolled writer per format, since `object::write`
//! only knows how to build ELF objects from scratch and has no PE writer.

use crate::error::{CovirtError, Result};
use object::read::{Object, ObjectSection};
use object::{BinaryFormat, SectionFlags};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Elf,
    Pe,
}

#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub virtual_address: u64,
    pub size: u64,
    pub executable: bool,
    pub writable: bool,
    /// Offset and length of this section's bytes within `BinaryFile::raw`.
    /// `None` for a freshly-added section that has not been laid out yet.
    pub file_range: Option<(usize, usize)>,
    pub data: Vec<u8>,
}

impl Section {
    pub fn contains_va(&self, image_base: u64, address: u64) -> bool {
        let start = image_base + self.virtual_address;
        address >= start && address < start + self.size
    }
}

pub struct BinaryFile {
    format: Format,
    image_base: u64,
    sections: Vec<Section>,
    raw: Vec<u8>,
    out_path: std::path::PathBuf,
}

impl BinaryFile {
    pub fn open(path: &Path) -> Result<Self> {
        let raw = fs::read(path)?;
        let file = object::File::parse(&*raw)?;

        let format = match file.format() {
            BinaryFormat::Elf => Format::Elf,
            BinaryFormat::Pe => Format::Pe,
            _ => return Err(CovirtError::UnknownFormat),
        };

        let image_base = file.relative_address_base();

        let mut sections = Vec::new();
        for section in file.sections() {
            let name = section.name().unwrap_or("").to_string();
            let executable = is_executable_flags(section.flags(), format);
            let writable = is_writable_flags(section.flags(), format);
            let file_range = section.file_range().map(|(o, s)| (o as usize, s as usize));
            let data = section.data().map(|d| d.to_vec()).unwrap_or_default();

            sections.push(Section {
                name,
                virtual_address: section.address().wrapping_sub(image_base),
                size: section.size(),
                executable,
                writable,
                file_range,
                data,
            });
        }

        let out_path = {
            let mut p = path.to_path_buf();
            let mut name = p.file_name().unwrap_or_default().to_os_string();
            name.push(".covirt");
            p.set_file_name(name);
            p
        };

        Ok(BinaryFile {
            format,
            image_base,
            sections,
            raw,
            out_path,
        })
    }

    pub fn set_out_path(&mut self, path: impl Into<std::path::PathBuf>) {
        self.out_path = path.into();
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn image_base(&self) -> u64 {
        self.image_base
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn executable_sections(&self) -> impl Iterator<Item = &Section> {
        self.sections.iter().filter(|s| s.executable)
    }

    pub fn is_section_executable(&self, section: &Section) -> bool {
        section.executable
    }

    pub fn section_by_name(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    pub fn section_by_name_mut(&mut self, name: &str) -> Option<&mut Section> {
        self.sections.iter_mut().find(|s| s.name == name)
    }

    pub fn section_by_va(&self, address: u64) -> Option<&Section> {
        self.sections
            .iter()
            .find(|s| s.contains_va(self.image_base, address))
    }

    /// Overwrite `len` bytes of `section_name`'s content at `offset`,
    /// in place. Used both to scatter a region with random bytes and to
    /// write the entry stub over it (spec §4.8).
    pub fn patch_section(&mut self, section_name: &str, offset: usize, bytes: &[u8]) -> Result<()> {
        let section = self
            .sections
            .iter_mut()
            .find(|s| s.name == section_name)
            .ok_or_else(|| CovirtError::SectionNotFound(0))?;
        section.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Add a fresh section (spec §6: ELF combines `EXECINSTR|WRITE`, PE
    /// combines `MEM_EXECUTE|MEM_WRITE`) and return its absolute VA. The
    /// section is appended to the in-memory model and laid out for real at
    /// write time, but the caller (entry stub patching, spec §4.8) needs
    /// its address before `write()` runs in order to compute `call rel32`
    /// targets, so the placement is predicted here up front.
    pub fn add_section(&mut self, name: &str, content: Vec<u8>, executable: bool, writable: bool) -> u64 {
        let size = content.len() as u64;
        let virtual_address = self.next_appended_section_va();
        self.sections.push(Section {
            name: name.to_string(),
            virtual_address,
            size,
            executable,
            writable,
            file_range: None,
            data: content,
        });
        self.image_base + virtual_address
    }

    /// Predict the relative VA `write()` will give the next appended
    /// section, mirroring the placement `elf_writer`/`pe_writer` compute.
    /// Safe to precompute because in-place section patches never change the
    /// file's total length or header fields, only section content.
    fn next_appended_section_va(&self) -> u64 {
        match self.format {
            Format::Elf => {
                let offset = crate::consts::page_round_up(self.raw.len());
                (offset as u64).wrapping_sub(self.image_base)
            }
            Format::Pe => pe_next_section_rva(&self.raw),
        }
    }

    /// Serialize the (possibly patched, possibly section-appended) binary
    /// to `out_path`.
    pub fn write(&mut self) -> Result<()> {
        match self.format {
            Format::Elf => self.write_elf(),
            Format::Pe => self.write_pe(),
        }
    }

    fn write_elf(&mut self) -> Result<()> {
        crate::analysis::elf_writer::rewrite(self)
    }

    fn write_pe(&mut self) -> Result<()> {
        crate::analysis::pe_writer::rewrite(self)
    }

    pub(crate) fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub(crate) fn out_path(&self) -> &Path {
        &self.out_path
    }
}

/// Where `pe_writer` would place the next appended section's RVA, read
/// straight from the PE32+ optional header (size of image, section
/// alignment) without needing a full header parse.
fn pe_next_section_rva(raw: &[u8]) -> u64 {
    let e_lfanew = u32::from_le_bytes(raw[0x3C..0x40].try_into().unwrap()) as usize;
    let optional_header_off = e_lfanew + 4 + 20; // past "PE\0\0" and the file header
    let section_alignment =
        u32::from_le_bytes(raw[optional_header_off + 32..optional_header_off + 36].try_into().unwrap()) as usize;
    let size_of_image =
        u32::from_le_bytes(raw[optional_header_off + 56..optional_header_off + 60].try_into().unwrap()) as usize;
    let padded = (size_of_image + section_alignment - 1) & !(section_alignment - 1);
    padded as u64
}

fn is_executable_flags(flags: SectionFlags, format: Format) -> bool {
    match (flags, format) {
        (SectionFlags::Elf { sh_flags }, Format::Elf) => sh_flags & object::elf::SHF_EXECINSTR as u64 != 0,
        (SectionFlags::Coff { characteristics }, Format::Pe) => {
            characteristics & object::pe::IMAGE_SCN_MEM_EXECUTE != 0
        }
        _ => false,
    }
}

fn is_writable_flags(flags: SectionFlags, format: Format) -> bool {
    match (flags, format) {
        (SectionFlags::Elf { sh_flags }, Format::Elf) => sh_flags & object::elf::SHF_WRITE as u64 != 0,
        (SectionFlags::Coff { characteristics }, Format::Pe) => {
            characteristics & object::pe::IMAGE_SCN_MEM_WRITE != 0
        }
        _ => false,
    }
}
