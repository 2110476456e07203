//! ELF64 program header parsing: a standalone parse step that returns
//! data instead of mapping pages itself, so `exec::process` can build an
//! `AddressSpace` from the result without this module touching paging at
//! all.

use alloc::vec::Vec;

use x86_64::VirtAddr;

use crate::error::{KError, KResult};

const PT_LOAD: u32 = 1;

/// The standard ELF64 `Elf64_Phdr`, with `p_type` and `p_flags` read back out of the packed
/// `segment_type` field since they're adjacent `u32`s on a little-endian
/// target.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct ProgramHeaderEntry {
    segment_type: u64,
    offset: u64,
    virtual_address: u64,
    unused: u64,
    image_size: u64,
    mem_size: u64,
    align: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct Segment {
    pub vaddr: VirtAddr,
    pub mem_size: u64,
    pub file_offset: usize,
    pub file_size: usize,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
}

pub struct ParsedElf {
    pub entry: VirtAddr,
    pub segments: Vec<Segment>,
}

/// Validates the ELF header and walks the program header table, keeping
/// only `PT_LOAD` entries. Only static, little-endian, 64-bit executables
/// are accepted — dynamic executables and shebang scripts aren't
/// supported.
pub fn parse(binary: &[u8]) -> KResult<ParsedElf> {
    if binary.len() < 0x40
        || binary[0x0..0x4] != *b"\x7fELF"
        || binary[0x4] != 2 // 64-bit
        || binary[0x5] != 1 // little endian
        || binary[0x10] != 2
    // ET_EXEC
    {
        return Err(KError::InvalidArgument);
    }

    let entry = u64::from_ne_bytes(binary[0x18..0x20].try_into().unwrap());
    let header_start = u64::from_ne_bytes(binary[0x20..0x28].try_into().unwrap()) as usize;
    let header_size = u16::from_ne_bytes(binary[0x36..0x38].try_into().unwrap()) as usize;
    let header_num = u16::from_ne_bytes(binary[0x38..0x3A].try_into().unwrap()) as usize;

    if header_size < size_of::<ProgramHeaderEntry>() {
        return Err(KError::InvalidArgument);
    }

    let mut segments = Vec::new();
    for i in 0..header_num {
        let offset = header_start + header_size * i;
        let entry_end = offset + size_of::<ProgramHeaderEntry>();
        if entry_end > binary.len() {
            return Err(KError::InvalidArgument);
        }

        let header = unsafe { &*(binary[offset..entry_end].as_ptr() as *const ProgramHeaderEntry) };
        let segment_type = header.segment_type as u32;
        if segment_type != PT_LOAD {
            continue;
        }

        let file_end = header.offset as usize + header.image_size as usize;
        if file_end > binary.len() {
            return Err(KError::InvalidArgument);
        }

        let segment_flags = (header.segment_type >> 32) as u32;
        segments.push(Segment {
            vaddr: VirtAddr::new(header.virtual_address),
            mem_size: header.mem_size,
            file_offset: header.offset as usize,
            file_size: header.image_size as usize,
            readable: segment_flags & 4 != 0,
            writable: segment_flags & 2 != 0,
            executable: segment_flags & 1 != 0,
        });
        let _ = (header.unused, header.align);
    }

    Ok(ParsedElf {
        entry: VirtAddr::new(entry),
        segments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn synthetic_elf(entry: u64, segments: &[(u64, u32, &[u8])]) -> Vec<u8> {
        const EHDR_SIZE: usize = 0x40;
        const PHDR_SIZE: usize = 56;

        let phdr_start = EHDR_SIZE as u64;
        let mut data_start = phdr_start + PHDR_SIZE as u64 * segments.len() as u64;
        let mut file_offsets = Vec::new();
        for (_, _, contents) in segments {
            file_offsets.push(data_start);
            data_start += contents.len() as u64;
        }

        let mut buf = vec![0u8; data_start as usize];
        buf[0x0..0x4].copy_from_slice(b"\x7fELF");
        buf[0x4] = 2;
        buf[0x5] = 1;
        buf[0x10] = 2;
        buf[0x18..0x20].copy_from_slice(&entry.to_ne_bytes());
        buf[0x20..0x28].copy_from_slice(&phdr_start.to_ne_bytes());
        buf[0x36..0x38].copy_from_slice(&(PHDR_SIZE as u16).to_ne_bytes());
        buf[0x38..0x3A].copy_from_slice(&(segments.len() as u16).to_ne_bytes());

        for (i, (vaddr, flags, contents)) in segments.iter().enumerate() {
            let base = phdr_start as usize + PHDR_SIZE * i;
            let segment_type = (*flags as u64) << 32 | PT_LOAD as u64;
            buf[base..base + 8].copy_from_slice(&segment_type.to_ne_bytes());
            buf[base + 8..base + 16].copy_from_slice(&file_offsets[i].to_ne_bytes());
            buf[base + 16..base + 24].copy_from_slice(&vaddr.to_ne_bytes());
            buf[base + 32..base + 40].copy_from_slice(&(contents.len() as u64).to_ne_bytes());
            buf[base + 40..base + 48].copy_from_slice(&(contents.len() as u64).to_ne_bytes());

            let off = file_offsets[i] as usize;
            buf[off..off + contents.len()].copy_from_slice(contents);
        }

        buf
    }

    #[test]
    fn parses_entry_and_load_segments() {
        let binary = synthetic_elf(0x4000_1000, &[(0x4000_0000, 5, b"hello")]);
        let parsed = parse(&binary).unwrap();
        assert_eq!(parsed.entry.as_u64(), 0x4000_1000);
        assert_eq!(parsed.segments.len(), 1);
        assert_eq!(parsed.segments[0].vaddr.as_u64(), 0x4000_0000);
        assert!(parsed.segments[0].readable);
        assert!(parsed.segments[0].executable);
        assert!(!parsed.segments[0].writable);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut binary = synthetic_elf(0, &[]);
        binary[0] = 0;
        assert!(matches!(parse(&binary), Err(KError::InvalidArgument)));
    }

    #[test]
    fn rejects_truncated_program_header() {
        let mut binary = synthetic_elf(0, &[(0x1000, 4, b"x")]);
        binary.truncate(0x40 + 10);
        assert!(matches!(parse(&binary), Err(KError::InvalidArgument)));
    }
}
