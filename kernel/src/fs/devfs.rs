//! devfs: a character-device filesystem mounted at `/dev`, backed by a
//! chrdev registry keyed by `(major, minor)` that any driver can
//! register a character device against. The console is just the first
//! registrant, not a special case wired in by hand.

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_queue::ArrayQueue;
use spin::Mutex;

use crate::error::{KError, KResult};
use crate::fs::inode::{FileType, InodeData};
use crate::fs::superblock::Filesystem;
use crate::task::wait_queue::WaitQueue;

pub trait CharDevice: Send + Sync {
    fn read(&self, buf: &mut [u8]) -> KResult<usize>;
    fn write(&self, buf: &[u8]) -> KResult<usize>;
}

pub struct ChrdevRegistry {
    devices: Mutex<BTreeMap<(u32, u32), Arc<dyn CharDevice>>>,
}

static REGISTRY: ChrdevRegistry = ChrdevRegistry {
    devices: Mutex::new(BTreeMap::new()),
};

pub fn register_chrdev(major: u32, minor: u32, device: Arc<dyn CharDevice>) {
    REGISTRY.devices.lock().insert((major, minor), device);
}

pub fn lookup_chrdev(major: u32, minor: u32) -> Option<Arc<dyn CharDevice>> {
    REGISTRY.devices.lock().get(&(major, minor)).cloned()
}

/// A TTY is just a named chrdev registration from the driver's point of
/// view; kept as a distinct entry point so tty drivers don't need to
/// know about `Devfs::add_static_entry`.
pub fn register_tty(name: &str, major: u32, minor: u32, device: Arc<dyn CharDevice>) {
    register_chrdev(major, minor, device);
    Devfs::add_static_entry(name, major, minor);
}

/// The system console, stashed separately from the generic chrdev registry
/// so the keyboard IRQ handler can feed it decoded bytes directly instead
/// of downcasting a `dyn CharDevice` trait object.
static CONSOLE: Mutex<Option<Arc<ConsoleDevice>>> = Mutex::new(None);

pub fn register_console(name: &str, major: u32, minor: u32, device: Arc<ConsoleDevice>) {
    register_chrdev(major, minor, device.clone());
    Devfs::add_static_entry(name, major, minor);
    *CONSOLE.lock() = Some(device);
}

pub fn push_console_input(byte: u8) {
    if let Some(console) = CONSOLE.lock().clone() {
        console.push_input(byte);
    }
}

struct DevNode {
    name: String,
    major: u32,
    minor: u32,
}

static DEV_NODES: Mutex<Vec<DevNode>> = Mutex::new(Vec::new());

pub struct Devfs;

impl Devfs {
    pub fn add_static_entry(name: &str, major: u32, minor: u32) {
        DEV_NODES.lock().push(DevNode {
            name: name.to_string(),
            major,
            minor,
        });
    }

    /// Inode ids are derived deterministically from the node's position
    /// so `lookup`/`read_inode` agree without a separate table: id 0 is
    /// the directory, id `n+1` is `DEV_NODES[n]`.
    fn node_for_id(id: u64) -> Option<(u32, u32)> {
        if id == 0 {
            return None;
        }
        DEV_NODES
            .lock()
            .get((id - 1) as usize)
            .map(|n| (n.major, n.minor))
    }
}

impl Filesystem for Devfs {
    fn read_inode(&self, id: u64) -> KResult<InodeData> {
        if id == 0 {
            return Ok(InodeData {
                filetype: FileType::Directory,
                size: 0,
                permissions: 0o755,
                nlink: 2,
            });
        }
        if Self::node_for_id(id).is_some() {
            Ok(InodeData {
                filetype: FileType::CharDevice,
                size: 0,
                permissions: 0o666,
                nlink: 1,
            })
        } else {
            Err(KError::NotFound)
        }
    }

    fn lookup(&self, parent_id: u64, name: &str) -> KResult<Option<u64>> {
        if parent_id != 0 {
            return Err(KError::WrongKind);
        }
        Ok(DEV_NODES
            .lock()
            .iter()
            .position(|n| n.name == name)
            .map(|i| i as u64 + 1))
    }

    fn create(&self, _parent_id: u64, _name: &str) -> KResult<u64> {
        Err(KError::PermissionDenied)
    }

    fn read(&self, id: u64, _offset: u64, buffer: &mut [u8]) -> KResult<usize> {
        let (major, minor) = Self::node_for_id(id).ok_or(KError::NotFound)?;
        let dev = lookup_chrdev(major, minor).ok_or(KError::NoSuchFs)?;
        dev.read(buffer)
    }

    fn write(&self, id: u64, _offset: u64, buffer: &[u8]) -> KResult<usize> {
        let (major, minor) = Self::node_for_id(id).ok_or(KError::NotFound)?;
        let dev = lookup_chrdev(major, minor).ok_or(KError::NoSuchFs)?;
        dev.write(buffer)
    }
}

/// Console input ring buffer capacity. Keystrokes beyond this before a
/// reader drains them are dropped (oldest first) by `ArrayQueue::force_push`.
const PENDING_CAPACITY: usize = 4096;

/// Console character device: buffers decoded keystrokes in a lock-free
/// ring buffer until a line is ready, parking the reading task on a
/// wait-queue rather than busy looping.
pub struct ConsoleDevice {
    console: Mutex<crate::console::Console>,
    pending: ArrayQueue<u8>,
    /// Count of `\n`/EOT bytes currently queued, so `has_line` doesn't
    /// need to peek the ring buffer (which `ArrayQueue` doesn't support).
    line_ready: AtomicUsize,
    readers: WaitQueue,
}

impl ConsoleDevice {
    pub fn new(console: crate::console::Console) -> ConsoleDevice {
        ConsoleDevice {
            console: Mutex::new(console),
            pending: ArrayQueue::new(PENDING_CAPACITY),
            line_ready: AtomicUsize::new(0),
            readers: WaitQueue::new(),
        }
    }

    /// Called from the keyboard IRQ handler with a decoded byte.
    pub fn push_input(&self, byte: u8) {
        let _ = self.pending.force_push(byte);
        if byte == b'\n' || byte == 4 {
            self.line_ready.fetch_add(1, Ordering::SeqCst);
        }
        self.readers.wake_all();
    }

    fn has_line(&self) -> bool {
        self.line_ready.load(Ordering::SeqCst) > 0
    }
}

impl CharDevice for ConsoleDevice {
    fn read(&self, buf: &mut [u8]) -> KResult<usize> {
        let current = crate::task::scheduler::current();
        while !self.has_line() {
            match &current {
                Some(task) => {
                    self.readers.prepare_wait(task);
                    if self.has_line() {
                        self.readers.cancel_wait(task);
                        break;
                    }
                    self.readers.commit_sleep(task);
                }
                None => break, // no scheduler context (e.g. unit test): don't block forever
            }
        }

        let n = buf.len().min(self.pending.len());
        for slot in buf.iter_mut().take(n) {
            let byte = self.pending.pop().expect("line_ready accounted for this byte");
            if byte == b'\n' || byte == 4 {
                self.line_ready.fetch_sub(1, Ordering::SeqCst);
            }
            *slot = if byte == 4 { 0 } else { byte };
        }
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> KResult<usize> {
        self.console.lock().write(buf);
        Ok(buf.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_unknown_node_is_none() {
        let fs = Devfs;
        assert_eq!(fs.lookup(0, "nope").unwrap(), None);
    }

    #[test]
    fn lookup_on_non_root_parent_is_wrong_kind() {
        let fs = Devfs;
        assert!(matches!(fs.lookup(5, "x"), Err(KError::WrongKind)));
    }
}
