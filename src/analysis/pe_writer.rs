//! PE writer: applies in-place section patches and appends `.covirt0` by
//! growing the COFF section table (spec §4.8, §6). `object` has no PE
//! writer, so this follows the same raw-header-surgery approach as
//! [`super::elf_writer`], using the `object::pe` layout constants.

use super::binary::BinaryFile;
use crate::error::Result;
use std::fs;

const SECTION_HEADER_SIZE: usize = 40;

pub fn rewrite(bin: &mut BinaryFile) -> Result<()> {
    let mut out = bin.raw().to_vec();

    for section in bin.sections() {
        if let Some((offset, len)) = section.file_range {
            let n = section.data.len().min(len);
            out[offset..offset + n].copy_from_slice(&section.data[..n]);
        }
    }

    let appended: Vec<_> = bin
        .sections()
        .iter()
        .filter(|s| s.file_range.is_none())
        .cloned()
        .collect();
    if appended.is_empty() {
        fs::write(bin.out_path(), &out)?;
        return Ok(());
    }

    let e_lfanew = u32::from_le_bytes(out[0x3C..0x40].try_into().unwrap()) as usize;
    let file_header = e_lfanew + 4; // past "PE\0\0"
    let number_of_sections_off = file_header + 2;
    let size_of_optional_header_off = file_header + 16;

    let number_of_sections = u16::from_le_bytes(
        out[number_of_sections_off..number_of_sections_off + 2]
            .try_into()
            .unwrap(),
    );
    let size_of_optional_header =
        u16::from_le_bytes(out[size_of_optional_header_off..size_of_optional_header_off + 2].try_into().unwrap());

    let optional_header_off = file_header + 20;
    let section_table_off = optional_header_off + size_of_optional_header as usize;

    // PE32+ (0x20b) optional headers carry SizeOfImage at +56, file alignment
    // at +36, section alignment at +32.
    let size_of_image_off = optional_header_off + 56;
    let section_alignment = u32::from_le_bytes(
        out[optional_header_off + 32..optional_header_off + 36]
            .try_into()
            .unwrap(),
    ) as usize;

    let file_alignment_padded = |size: usize, align: usize| (size + align - 1) & !(align - 1);

    let mut rva_cursor = {
        let size_of_image =
            u32::from_le_bytes(out[size_of_image_off..size_of_image_off + 4].try_into().unwrap()) as usize;
        file_alignment_padded(size_of_image, section_alignment)
    };

    let mut new_headers = Vec::new();
    for section in &appended {
        let file_offset = crate::consts::page_round_up(out.len());
        out.resize(file_offset, 0);
        out.extend_from_slice(&section.data);

        let rva = rva_cursor;
        let virtual_size = file_alignment_padded(section.data.len(), section_alignment);
        rva_cursor += virtual_size;

        let mut header = [0u8; SECTION_HEADER_SIZE];
        let mut name = [0u8; 8];
        let raw_name = section.name.as_bytes();
        let n = raw_name.len().min(8);
        name[..n].copy_from_slice(&raw_name[..n]);
        header[0..8].copy_from_slice(&name);
        header[8..12].copy_from_slice(&(section.data.len() as u32).to_le_bytes()); // VirtualSize
        header[12..16].copy_from_slice(&(rva as u32).to_le_bytes()); // VirtualAddress
        header[16..20].copy_from_slice(&(section.data.len() as u32).to_le_bytes()); // SizeOfRawData
        header[20..24].copy_from_slice(&(file_offset as u32).to_le_bytes()); // PointerToRawData

        let mut characteristics: u32 = object::pe::IMAGE_SCN_CNT_CODE | object::pe::IMAGE_SCN_MEM_READ;
        if section.executable {
            characteristics |= object::pe::IMAGE_SCN_MEM_EXECUTE;
        }
        if section.writable {
            characteristics |= object::pe::IMAGE_SCN_MEM_WRITE;
        }
        header[36..40].copy_from_slice(&characteristics.to_le_bytes());

        new_headers.extend_from_slice(&header);
    }

    let insert_at = section_table_off + number_of_sections as usize * SECTION_HEADER_SIZE;
    out.splice(insert_at..insert_at, new_headers.iter().copied());

    let new_count = number_of_sections + appended.len() as u16;
    out[number_of_sections_off..number_of_sections_off + 2].copy_from_slice(&new_count.to_le_bytes());
    out[size_of_image_off..size_of_image_off + 4].copy_from_slice(&(rva_cursor as u32).to_le_bytes());

    fs::write(bin.out_path(), &out)?;
    Ok(())
}
