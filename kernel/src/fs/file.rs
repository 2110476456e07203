//! Open-file object and the thin read/write/lseek/close dispatchers. A
//! persistent `OpenFile` object gets installed in a task's FD table
//! rather than living only for the duration of one call.

use alloc::sync::Arc;

use spin::Mutex;

use crate::error::{KError, KResult};
use crate::fs::dentry::{self, DentryRef};
use crate::fs::inode::FileType;
use crate::fs::mount;
use crate::fs::path;
use crate::syscall::errno::{O_APPEND, O_CREAT, O_EXCL};

pub struct OpenFile {
    pub dentry: DentryRef,
    pub f_pos: u64,
    pub flags: u32,
    pub ref_count: u32,
}

/// `vfs_create(path, mode, flags)`: splits into parent + basename, looks
/// up the parent (must be a directory), and either returns the existing
/// positive dentry or asks the driver to create one.
pub fn vfs_create(path_str: &str, flags: u32) -> KResult<DentryRef> {
    let (parent_path, name) = path::split_parent(path_str)?;
    let parent = path::vfs_resolve_path(&parent_path)?;

    let parent_is_dir = parent
        .lock()
        .inode
        .as_ref()
        .map(|i| i.lock().filetype == FileType::Directory)
        .unwrap_or(false);
    if !parent_is_dir {
        dentry::dput(parent);
        return Err(KError::WrongKind);
    }

    let (sb, _) = mount::resolve_mount(&parent_path)?;
    let existing = dentry::dentry_lookup(&parent, &sb, &name)?;

    if !existing.lock().is_negative() {
        if flags & O_EXCL != 0 {
            dentry::dput(existing);
            dentry::dput(parent);
            return Err(KError::AlreadyExists);
        }
        dentry::dput(parent);
        return Ok(existing);
    }

    let parent_id = parent.lock().inode.as_ref().unwrap().lock().id;
    let new_id = sb.fs.create(parent_id, &name)?;
    let new_inode = crate::fs::inode::iget(&sb, new_id)?;
    existing.lock().inode = Some(new_inode);
    parent.lock().inode.as_ref().unwrap().lock().nlink += 1;

    dentry::dput(parent);
    Ok(existing)
}

/// `vfs_open(path, flags)`: resolves (creating on `O_CREAT` if missing),
/// sets the initial file position, and returns an `OpenFile` ready for
/// FD-table installation.
pub fn vfs_open(path_str: &str, flags: u32) -> KResult<Arc<Mutex<OpenFile>>> {
    let dentry = match path::vfs_resolve_path(path_str) {
        Ok(d) if !d.lock().is_negative() => d,
        Ok(d) => {
            dentry::dput(d);
            if flags & O_CREAT != 0 {
                vfs_create(path_str, flags)?
            } else {
                return Err(KError::NotFound);
            }
        }
        Err(_) if flags & O_CREAT != 0 => vfs_create(path_str, flags)?,
        Err(e) => return Err(e),
    };

    let size = dentry.lock().inode.as_ref().unwrap().lock().size;
    let f_pos = if flags & O_APPEND != 0 { size } else { 0 };

    Ok(Arc::new(Mutex::new(OpenFile {
        dentry,
        f_pos,
        flags,
        ref_count: 1,
    })))
}

pub fn read(file: &Arc<Mutex<OpenFile>>, buf: &mut [u8]) -> KResult<usize> {
    let (inode_id, sb_id, pos) = {
        let f = file.lock();
        let d = f.dentry.lock();
        let inode = d.inode.as_ref().ok_or(KError::NotFound)?;
        let i = inode.lock();
        (i.id, i.sb_id, f.f_pos)
    };
    let sb = crate::fs::superblock::find_by_id(sb_id).ok_or(KError::NoSuchFs)?;
    let n = sb.fs.read(inode_id, pos, buf)?;
    file.lock().f_pos += n as u64;
    Ok(n)
}

pub fn write(file: &Arc<Mutex<OpenFile>>, buf: &[u8]) -> KResult<usize> {
    let (inode_id, sb_id, pos, append) = {
        let f = file.lock();
        let d = f.dentry.lock();
        let inode = d.inode.as_ref().ok_or(KError::NotFound)?;
        let i = inode.lock();
        (i.id, i.sb_id, f.f_pos, f.flags & O_APPEND != 0)
    };
    let sb = crate::fs::superblock::find_by_id(sb_id).ok_or(KError::NoSuchFs)?;

    // Holding the file lock across the write keeps the size/position
    // update atomic with the payload under O_APPEND.
    let mut f = file.lock();
    let write_pos = if append {
        f.dentry.lock().inode.as_ref().unwrap().lock().size
    } else {
        pos
    };
    let n = sb.fs.write(inode_id, write_pos, buf)?;
    f.f_pos = write_pos + n as u64;
    let inode = f.dentry.lock().inode.clone().unwrap();
    let mut inode = inode.lock();
    if f.f_pos > inode.size {
        inode.size = f.f_pos;
    }
    Ok(n)
}

pub fn lseek(file: &Arc<Mutex<OpenFile>>, offset: i64, whence: i32) -> KResult<u64> {
    const SEEK_SET: i32 = 0;
    const SEEK_CUR: i32 = 1;
    const SEEK_END: i32 = 2;

    let mut f = file.lock();
    let size = f.dentry.lock().inode.as_ref().map(|i| i.lock().size).unwrap_or(0);
    let base = match whence {
        SEEK_SET => 0,
        SEEK_CUR => f.f_pos as i64,
        SEEK_END => size as i64,
        _ => return Err(KError::InvalidArgument),
    };
    let new_pos = base + offset;
    if new_pos < 0 {
        return Err(KError::InvalidArgument);
    }
    f.f_pos = new_pos as u64;
    Ok(f.f_pos)
}

pub fn close(file: Arc<Mutex<OpenFile>>) {
    let dentry = file.lock().dentry.clone();
    dentry::dput(dentry);
}
