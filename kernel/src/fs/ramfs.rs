//! Tar-backed ramfs, implementing the `Filesystem` interface.
//!
//! Parses a USTAR archive into a `BTreeMap<u32, Arc<Inode>>` inode table
//! keyed by inode id rather than whole `Arc<Inode>` objects, so the VFS's
//! own inode cache owns the cache lifetime instead of the driver.

use core::ffi::CStr;

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::{KError, KResult};
use crate::fs::inode::{FileType, InodeData};
use crate::fs::superblock::Filesystem;

#[derive(Debug)]
#[repr(C)]
struct TarHeader {
    filename: [u8; 100],
    mode: [u8; 8],
    uid: [u8; 8],
    gid: [u8; 8],
    size: [u8; 12],
    mtime: [u8; 12],
    chksum: [u8; 8],
    typeflag: [u8; 1],
}

enum Entry {
    Directory(Vec<(String, u64)>),
    File(&'static [u8]),
}

pub struct Ramfs {
    entries: Mutex<BTreeMap<u64, Entry>>,
}

impl Ramfs {
    /// Parses a POSIX tar archive into a flat directory (no nested
    /// subdirectories — this only ever serves a flat initrd).
    pub unsafe fn from_tar(archive: &'static [u8]) -> Ramfs {
        let mut files = Vec::new();
        let mut offset = 0usize;

        while offset < archive.len() && archive[offset] != 0 {
            let header = unsafe {
                &*(archive[offset..offset + core::mem::size_of::<TarHeader>()].as_ptr() as *const TarHeader)
            };
            let size = usize::from_str_radix(
                CStr::from_bytes_until_nul(&header.size)
                    .unwrap()
                    .to_str()
                    .unwrap()
                    .trim(),
                8,
            )
            .unwrap_or(0);
            let filename = CStr::from_bytes_until_nul(&header.filename)
                .unwrap()
                .to_str()
                .unwrap()
                .trim_start_matches("./")
                .to_string();

            if size > 0 && !filename.is_empty() {
                let contents = &archive[offset + 512..offset + 512 + size];
                files.push((filename, contents));
            }
            offset += size.div_ceil(512) * 512 + 512;
        }

        Ramfs::from_files(files)
    }

    pub fn from_files(files: Vec<(String, &'static [u8])>) -> Ramfs {
        let mut entries = BTreeMap::new();
        let mut root_children = Vec::new();
        for (index, (name, contents)) in files.iter().enumerate() {
            let id = index as u64 + 1;
            root_children.push((name.clone(), id));
            entries.insert(id, Entry::File(contents));
        }
        entries.insert(0, Entry::Directory(root_children));
        Ramfs {
            entries: Mutex::new(entries),
        }
    }
}

impl Filesystem for Ramfs {
    fn read_inode(&self, id: u64) -> KResult<InodeData> {
        let entries = self.entries.lock();
        match entries.get(&id) {
            Some(Entry::Directory(_)) => Ok(InodeData {
                filetype: FileType::Directory,
                size: 0,
                permissions: 0o755,
                nlink: 2,
            }),
            Some(Entry::File(data)) => Ok(InodeData {
                filetype: FileType::File,
                size: data.len() as u64,
                permissions: 0o644,
                nlink: 1,
            }),
            None => Err(KError::NotFound),
        }
    }

    fn lookup(&self, parent_id: u64, name: &str) -> KResult<Option<u64>> {
        let entries = self.entries.lock();
        match entries.get(&parent_id) {
            Some(Entry::Directory(children)) => {
                Ok(children.iter().find(|(n, _)| n == name).map(|(_, id)| *id))
            }
            Some(Entry::File(_)) => Err(KError::WrongKind),
            None => Err(KError::NotFound),
        }
    }

    fn create(&self, _parent_id: u64, _name: &str) -> KResult<u64> {
        // ramfs here is a read-only boot image; it never creates entries.
        Err(KError::PermissionDenied)
    }

    fn read(&self, id: u64, offset: u64, buffer: &mut [u8]) -> KResult<usize> {
        let entries = self.entries.lock();
        match entries.get(&id) {
            Some(Entry::File(data)) => {
                let offset = offset as usize;
                if offset >= data.len() {
                    return Ok(0);
                }
                let end = (offset + buffer.len()).min(data.len());
                let n = end - offset;
                buffer[..n].copy_from_slice(&data[offset..end]);
                Ok(n)
            }
            Some(Entry::Directory(_)) => Err(KError::WrongKind),
            None => Err(KError::NotFound),
        }
    }

    fn write(&self, _id: u64, _offset: u64, _buffer: &[u8]) -> KResult<usize> {
        Err(KError::PermissionDenied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_and_read_round_trip() {
        let fs = Ramfs::from_files(alloc::vec![(String::from("hello.txt"), b"hi there".as_slice())]);
        let id = fs.lookup(0, "hello.txt").unwrap().unwrap();
        let data = fs.read_inode(id).unwrap();
        assert_eq!(data.size, 8);

        let mut buf = [0u8; 8];
        let n = fs.read(id, 0, &mut buf).unwrap();
        assert_eq!(n, 8);
        assert_eq!(&buf, b"hi there");
    }

    #[test]
    fn lookup_missing_entry_returns_none() {
        let fs = Ramfs::from_files(Vec::new());
        assert_eq!(fs.lookup(0, "nope").unwrap(), None);
    }

    #[test]
    fn lookup_on_file_inode_is_wrong_kind() {
        let fs = Ramfs::from_files(alloc::vec![(String::from("a"), b"x".as_slice())]);
        let id = fs.lookup(0, "a").unwrap().unwrap();
        assert!(matches!(fs.lookup(id, "b"), Err(KError::WrongKind)));
    }
}
