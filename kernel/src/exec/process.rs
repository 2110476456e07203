//! Process creation: ELF loading into a fresh address space, committing it
//! onto a task, and forking a running task.
//!
//! Loading happens through the HHDM via `AddressSpace::map_region`/
//! `vmm_write_region`, so a task can be prepared without first switching
//! into its address space. That's split into `prepare_exec` (fallible,
//! may be done speculatively) and `commit_exec` (infallible, swaps it
//! onto the task).
//!
//! `do_fork` duplicates the address space via `AddressSpace::duplicate`'s
//! copy-on-write sharing, then hands the child to a single
//! `fork_trampoline` that reuses the same "context.rbp = entry,
//! context.rbx = stack" priming trick `Task::kernel_task` already uses
//! for kernel threads, just zeroing `rax` first so the child's fork
//! syscall returns 0.

use core::arch::naked_asm;

use alloc::sync::Arc;
use alloc::vec;

use x86_64::structures::paging::{PageTableFlags, PhysFrame};
use x86_64::VirtAddr;

use crate::config::{KERNEL_STACK_PAGES, PAGE_SIZE, USER_STACK_PAGES, USER_STACK_TOP};
use crate::error::{KError, KResult};
use crate::exec::elf;
use crate::mm::address_space::{AddressSpace, RegionKind};
use crate::task::scheduler;
use crate::task::task::{self, Context, Task, TaskRef, TaskState, TaskType};

/// An address space loaded with a program image and a ready-to-use user
/// stack, not yet attached to any task.
pub struct PreparedExec {
    address_space: AddressSpace,
    entry: VirtAddr,
    stack_top: VirtAddr,
}

fn page_align_down(addr: u64) -> u64 {
    addr & !(PAGE_SIZE as u64 - 1)
}

fn page_align_up(addr: u64) -> u64 {
    page_align_down(addr + PAGE_SIZE as u64 - 1)
}

/// Loads `binary` into a fresh address space and lays out argv/argc on a
/// new user stack. Does not touch any task — safe to call before deciding
/// which task (if any) will receive the result.
pub fn prepare_exec(binary: &[u8], args: &[&str], kernel_pml4: PhysFrame) -> KResult<PreparedExec> {
    let parsed = elf::parse(binary)?;
    let mut address_space = AddressSpace::new(kernel_pml4)?;

    for segment in &parsed.segments {
        let page_start = page_align_down(segment.vaddr.as_u64());
        let page_end = page_align_up(segment.vaddr.as_u64() + segment.mem_size);
        let len = page_end - page_start;

        let mut flags = PageTableFlags::USER_ACCESSIBLE;
        if segment.writable {
            flags |= PageTableFlags::WRITABLE;
        }
        if !segment.executable {
            flags |= PageTableFlags::NO_EXECUTE;
        }

        address_space.map_region(VirtAddr::new(page_start), len, flags, RegionKind::File)?;
        if segment.file_size > 0 {
            let contents = &binary[segment.file_offset..segment.file_offset + segment.file_size];
            address_space.vmm_write_region(segment.vaddr, contents)?;
        }
    }

    let stack_top = VirtAddr::new(USER_STACK_TOP);
    let stack_len = (USER_STACK_PAGES * PAGE_SIZE) as u64;
    address_space.map_region(
        stack_top - stack_len,
        stack_len,
        PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE | PageTableFlags::NO_EXECUTE,
        RegionKind::Anonymous,
    )?;

    write_initial_stack(&address_space, stack_top, args)?;

    Ok(PreparedExec {
        address_space,
        entry: parsed.entry,
        stack_top,
    })
}

/// Lays out `argc`/`argv`/a terminated envp/a terminated auxv at the top
/// of the stack, following the x86-64 SysV ABI's initial-stack layout
/// (figure 3.9), routed through `vmm_write_region` rather than raw
/// pointer writes into the live mapper.
fn write_initial_stack(address_space: &AddressSpace, stack_top: VirtAddr, args: &[&str]) -> KResult<()> {
    let argc = args.len() as u64;
    address_space.vmm_write_region(stack_top, &argc.to_ne_bytes())?;

    let argv_base = stack_top.as_u64() + 8;
    let mut string_cursor = argv_base + 8 * argc + 8 + 8 + 8;

    for (i, arg) in args.iter().enumerate() {
        address_space.vmm_write_region(VirtAddr::new(argv_base + 8 * i as u64), &string_cursor.to_ne_bytes())?;
        let bytes = arg.as_bytes();
        address_space.vmm_write_region(VirtAddr::new(string_cursor), bytes)?;
        address_space.vmm_write_region(VirtAddr::new(string_cursor + bytes.len() as u64), &[0u8])?;
        string_cursor += bytes.len() as u64 + 1;
    }

    // argv[argc] = NULL, envp = { NULL }, auxv = { NULL }
    address_space.vmm_write_region(VirtAddr::new(argv_base + 8 * argc), &0u64.to_ne_bytes())?;
    address_space.vmm_write_region(VirtAddr::new(argv_base + 8 * argc + 8), &0u64.to_ne_bytes())?;
    address_space.vmm_write_region(VirtAddr::new(argv_base + 8 * argc + 16), &0u64.to_ne_bytes())?;
    Ok(())
}

/// Swaps `prepared` onto `task`, priming its context so the next context
/// switch lands straight in userspace at the program's entry point. Any
/// address space the task previously held (the common case: exec'ing over
/// a running process) is torn down first.
pub fn commit_exec(task: &TaskRef, prepared: PreparedExec, kernel_pml4: PhysFrame) {
    let mut t = task.lock();
    if let Some(old) = t.address_space.take() {
        old.destroy(kernel_pml4);
    }
    t.address_space = Some(prepared.address_space);
    t.ttype = TaskType::User;

    let mut kstack = vec![0u64; KERNEL_STACK_PAGES * 512];
    *kstack.last_mut().unwrap() = enter_userspace as u64;
    let rsp = kstack.last_mut().unwrap() as *const u64 as u64;

    let mut context = Context::new();
    context.rsp = rsp;
    context.rbp = prepared.entry.as_u64();
    context.rbx = prepared.stack_top.as_u64();

    t.kstack = kstack;
    t.context = context;
}

/// Forks `parent` into a new, COW-sharing child task. `user_rip`/
/// `user_rsp` are the userspace instruction/stack pointers captured by the
/// syscall entry trampoline at the moment of the `fork` call — the child
/// resumes exactly there, with its fork syscall returning 0.
pub fn do_fork(parent: &TaskRef, user_rip: u64, user_rsp: u64, kernel_pml4: PhysFrame) -> KResult<TaskRef> {
    let (child_address_space, fd_table, name) = {
        let mut p = parent.lock();
        let parent_as = p.address_space.as_mut().ok_or(KError::InvalidArgument)?;
        let child_as = parent_as.duplicate(kernel_pml4)?;
        (child_as, p.fd_table.dup_all(), p.name.clone())
    };

    let mut child_task = Task::user_task(child_address_space, name);
    child_task.fd_table = fd_table;
    child_task.parent = Some(Arc::downgrade(parent));

    let mut kstack = vec![0u64; KERNEL_STACK_PAGES * 512];
    *kstack.last_mut().unwrap() = fork_trampoline as u64;
    let rsp = kstack.last_mut().unwrap() as *const u64 as u64;

    let mut context = Context::new();
    context.rsp = rsp;
    context.rbp = user_rip;
    context.rbx = user_rsp;

    child_task.kstack = kstack;
    child_task.context = context;
    child_task.state = TaskState::Ready;

    let child = task::new_task_ref(child_task);
    parent.lock().children.push(child.clone());
    scheduler::enqueue_ready(child.clone());

    Ok(child)
}

/// Enters userspace the first time a task (built by `commit_exec`) is
/// switched to. Since a thread entry point takes no parameters, the
/// context-switch priming trick stashes the target registers in `rbx`
/// (user stack) and `rbp` (user entry): `switch_to`'s naked-asm restores
/// both from `Context` before jumping here.
#[unsafe(naked)]
unsafe extern "sysv64" fn enter_userspace() {
    naked_asm!(
        "mov rsp, rbx
         mov rcx, rbp
         mov r11, 0x202
         sysretq"
    )
}

/// Same trick as `enter_userspace`, but for a freshly forked child: `rbx`/
/// `rbp` hold the parent's userspace rsp/rip at the moment of the `fork`
/// syscall, and `rax` is zeroed so the syscall appears to return 0.
#[unsafe(naked)]
unsafe extern "sysv64" fn fork_trampoline() {
    naked_asm!(
        "xor rax, rax
         mov rsp, rbx
         mov rcx, rbp
         mov r11, 0x202
         sysretq"
    )
}
