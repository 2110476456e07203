//! Syscall dispatch and the `SYSCALL`/`SYSRET` entry trampoline.
//!
//! The naked-asm shape stashes the userspace `rcx`/`r11` pair, switches
//! onto the current task's kernel stack via a callee-saved register,
//! calls into a plain `extern "sysv64"` dispatcher, and `sysretq`s back.
//! The dispatcher itself calls into `fs::file`/`fs::path` for file
//! operations and `exec::process`/`task::scheduler` for process control.

pub mod errno;

use core::arch::naked_asm;
use core::ffi::CStr;

use alloc::vec::Vec;
use x86_64::VirtAddr;
use x86_64::registers::model_specific::FsBase;
use x86_64::structures::paging::PhysFrame;

use crate::error::KError;
use crate::exec::process;
use crate::fs::{fd_table, file, path};
use crate::task::scheduler;
use crate::task::task::TaskRef;
use errno::*;

/// True if every byte of `[addr, addr+len)` lies in the lower half of the
/// address space (userspace, in this higher-half kernel layout).
fn check_range(addr: u64, len: usize) -> bool {
    let end = match addr.checked_add(len as u64) {
        Some(e) => e,
        None => return false,
    };
    addr & (1 << 63) == 0 && end & (1 << 63) == 0
}

fn current_task() -> TaskRef {
    scheduler::current().expect("syscall entered with no current task")
}

fn kernel_pml4() -> PhysFrame {
    crate::mm::paging::kernel_pml4()
}

fn sys_read(fd: i32, buf: u64, count: usize) -> i64 {
    if !check_range(buf, count) {
        return -EFAULT;
    }
    let task = current_task();
    let file = match task.lock().fd_table.get(fd) {
        Some(f) => f,
        None => return -EBADF,
    };
    let slice = unsafe { core::slice::from_raw_parts_mut(buf as *mut u8, count) };
    match file::read(&file, slice) {
        Ok(n) => n as i64,
        Err(e) => -from_kerror(e),
    }
}

fn sys_write(fd: i32, buf: u64, count: usize) -> i64 {
    if !check_range(buf, count) {
        return -EFAULT;
    }
    let task = current_task();
    let file = match task.lock().fd_table.get(fd) {
        Some(f) => f,
        None => return -EBADF,
    };
    let slice = unsafe { core::slice::from_raw_parts(buf as *const u8, count) };
    match file::write(&file, slice) {
        Ok(n) => n as i64,
        Err(e) => -from_kerror(e),
    }
}

fn sys_open(pathname: u64, flags: u32) -> i64 {
    if !check_range(pathname, 1) {
        return -EFAULT;
    }
    let cpath = unsafe { CStr::from_ptr(pathname as *const i8) };
    let pathname = match cpath.to_str() {
        Ok(s) => s,
        Err(_) => return -EINVAL,
    };
    let opened = if flags & O_CREAT != 0 {
        file::vfs_open(pathname, flags)
    } else {
        file::vfs_open(pathname, flags)
    };
    let opened = match opened {
        Ok(f) => f,
        Err(e) => return -from_kerror(e),
    };
    let task = current_task();
    match task.lock().fd_table.install(opened) {
        Ok(fd) => fd as i64,
        Err(e) => -from_kerror(e),
    }
}

fn sys_close(fd: i32) -> i64 {
    let task = current_task();
    match task.lock().fd_table.close(fd) {
        Ok(()) => 0,
        Err(e) => -from_kerror(e),
    }
}

fn sys_lseek(fd: i32, offset: i64, whence: i32) -> i64 {
    let task = current_task();
    let file = match task.lock().fd_table.get(fd) {
        Some(f) => f,
        None => return -EBADF,
    };
    match file::lseek(&file, offset, whence) {
        Ok(pos) => pos as i64,
        Err(e) => -from_kerror(e),
    }
}

fn sys_exit(status: i32) -> ! {
    let task = current_task();
    let kernel_pml4 = kernel_pml4();
    scheduler::task_end(&task, status, kernel_pml4)
}

fn sys_getpid() -> i64 {
    current_task().lock().pid as i64
}

fn sys_getppid() -> i64 {
    let task = current_task();
    let t = task.lock();
    match &t.parent {
        Some(weak) => weak.upgrade().map(|p| p.lock().pid as i64).unwrap_or(0),
        None => 0,
    }
}

fn sys_fork(user_rip: u64, user_rsp: u64) -> i64 {
    let task = current_task();
    let kernel_pml4 = kernel_pml4();
    match process::do_fork(&task, user_rip, user_rsp, kernel_pml4) {
        Ok(child) => child.lock().pid as i64,
        Err(e) => -from_kerror(e),
    }
}

fn sys_waitpid(pid: i64, status_ptr: u64) -> i64 {
    let task = current_task();
    match scheduler::waitpid(&task, pid) {
        Ok((child_pid, status)) => {
            if status_ptr != 0 && check_range(status_ptr, 4) {
                unsafe { (status_ptr as *mut i32).write(status) };
            }
            child_pid as i64
        }
        Err(_) => -ECHILD,
    }
}

fn read_cstr_array(mut ptr: u64) -> Vec<alloc::string::String> {
    let mut out = Vec::new();
    loop {
        if ptr == 0 || !check_range(ptr, 8) {
            break;
        }
        let entry = unsafe { (ptr as *const u64).read() };
        if entry == 0 {
            break;
        }
        let s = unsafe { CStr::from_ptr(entry as *const i8) }
            .to_str()
            .unwrap_or("")
            .into();
        out.push(s);
        ptr += 8;
    }
    out
}

fn sys_execve(filename: u64, argv: u64) -> i64 {
    if !check_range(filename, 1) {
        return -EFAULT;
    }
    let filename = unsafe { CStr::from_ptr(filename as *const i8) };
    let filename = match filename.to_str() {
        Ok(s) => s,
        Err(_) => return -EINVAL,
    };

    let task = current_task();
    let kernel_pml4 = kernel_pml4();

    let opened = match file::vfs_open(filename, O_RDONLY) {
        Ok(f) => f,
        Err(e) => return -from_kerror(e),
    };
    let mut image = Vec::new();
    loop {
        let mut chunk = [0u8; 4096];
        match file::read(&opened, &mut chunk) {
            Ok(0) => break,
            Ok(n) => image.extend_from_slice(&chunk[..n]),
            Err(e) => return -from_kerror(e),
        }
    }
    file::close(opened);

    let args = read_cstr_array(argv);
    let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();

    let prepared = match process::prepare_exec(&image, &arg_refs, kernel_pml4) {
        Ok(p) => p,
        Err(e) => return -from_kerror(e),
    };
    process::commit_exec(&task, prepared, kernel_pml4);
    0
}

fn sys_mmap(addr: u64, len: usize, prot: u32) -> i64 {
    use x86_64::structures::paging::PageTableFlags;
    let task = current_task();
    let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
    if prot & 0x2 != 0 {
        flags |= PageTableFlags::WRITABLE;
    }
    if prot & 0x4 == 0 {
        flags |= PageTableFlags::NO_EXECUTE;
    }
    let mut t = task.lock();
    let vas = match t.address_space.as_mut() {
        Some(v) => v,
        None => return -EINVAL,
    };
    let base = if addr != 0 {
        VirtAddr::new(addr)
    } else {
        // No VMA-hole search implemented: caller-supplied hints only.
        return -ENOSYS;
    };
    match vas.map_region(base, len as u64, flags, crate::mm::address_space::RegionKind::Anonymous) {
        Ok(()) => base.as_u64() as i64,
        Err(e) => -from_kerror(e),
    }
}

fn sys_arch_prctl(op: u32, addr: u64) -> i64 {
    match op {
        ARCH_SET_FS => {
            if !check_range(addr, 1) {
                return -EFAULT;
            }
            FsBase::write(VirtAddr::new(addr));
            0
        }
        _ => -EINVAL,
    }
}

/// Linux-compatible syscall numbers: `write`, `mmap`, `exit`, `waitpid`,
/// `fork`, `getpid`, `getppid`, `exec`, plus the `read`/`open`/`close`/
/// `lseek`/`arch_prctl` a working libc needs to reach any of those.
pub extern "sysv64" fn handle_syscall_inner(
    syscall_number: u64,
    arg0: u64,
    arg1: u64,
    arg2: u64,
    arg3: u64,
    saved_rip: u64,
    saved_rsp: u64,
) -> u64 {
    let retval: i64 = match syscall_number {
        0 => sys_read(arg0 as i32, arg1, arg2 as usize),
        1 => sys_write(arg0 as i32, arg1, arg2 as usize),
        2 => sys_open(arg0, arg1 as u32),
        3 => sys_close(arg0 as i32),
        8 => sys_lseek(arg0 as i32, arg1 as i64, arg2 as i32),
        9 => sys_mmap(arg0, arg1 as usize, arg2 as u32),
        39 => sys_getpid(),
        57 => sys_fork(saved_rip, saved_rsp),
        59 => sys_execve(arg0, arg1),
        60 => sys_exit(arg0 as i32),
        61 => sys_waitpid(arg0 as i64, arg1),
        110 => sys_getppid(),
        158 => sys_arch_prctl(arg0 as u32, arg1),
        _ => -ENOSYS,
    };
    retval as u64
}

extern "sysv64" fn get_kernel_stack() -> u64 {
    current_task().lock().kstack_top()
}

/// Entry point installed at `LStar` by `cpu::PerCpu::init_gdt`. Stashes the
/// registers `sysretq` needs (user rip/rflags/rsp) in the callee-saved
/// `r12`-`r14` pair, switches onto the current task's kernel stack (held
/// briefly in `r15`), calls the plain Rust dispatcher, then returns to
/// userspace. Also forwards the saved rip/rsp to the dispatcher so `fork`
/// can prime the child to resume exactly there.
#[unsafe(naked)]
pub unsafe extern "sysv64" fn handle_syscall() {
    naked_asm!(
        "
        mov r12, rcx // saved userspace rip
        mov r13, r11 // saved userspace rflags
        mov r14, rsp // saved userspace rsp

        push rax // syscall number
        push rdi // arg0
        push rsi // arg1
        push rdx // arg2
        push r10 // arg3

        call {get_stack}
        mov r15, rax // kernel stack top

        pop r10
        pop rdx
        pop rsi
        pop rdi
        pop rax

        mov rsp, r15 // switch onto the kernel stack

        // === now running on the kernel stack ===
        push rax
        push rdi
        push rsi
        push rdx
        push r10

        pop r8  // arg3
        pop rcx // arg2
        pop rdx // arg1
        pop rsi // arg0
        pop rdi // syscall number

        mov r9, r12 // saved rip, 6th sysv64 argument
        push r14    // saved rsp, 7th argument goes on the stack

        call {inner}
        add rsp, 8

        mov rsp, r14 // restore userspace stack
        mov rcx, r12 // restore rip for sysretq
        mov r11, r13 // restore rflags for sysretq
        sysretq
        ",
        get_stack = sym get_kernel_stack,
        inner = sym handle_syscall_inner,
    );
}
