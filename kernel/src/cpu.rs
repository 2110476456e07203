//! Per-CPU state: GDT, TSS (with the double-fault IST stack), and the
//! `SYSCALL`/`SYSRET` MSRs.
//!
//! "What's running" bookkeeping (current/next/idle task) lives entirely
//! in `task::scheduler`, which owns the only copy the way a single-CPU
//! kernel needs. What's left here is the genuinely per-CPU GDT/TSS/MSR
//! setup below.

use core::cell::UnsafeCell;

use alloc::boxed::Box;
use conquer_once::spin::OnceCell;
use x86_64::VirtAddr;
use x86_64::instructions::segmentation::Segment;
use x86_64::instructions::segmentation::{CS, DS, ES, FS, GS, SS};
use x86_64::instructions::tables::load_tss;
use x86_64::registers::control::{Efer, EferFlags};
use x86_64::registers::model_specific::{LStar, SFMask, Star};
use x86_64::registers::rflags::RFlags;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable};
use x86_64::structures::tss::TaskStateSegment;

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

/// Per-CPU data. The TSS lives behind a raw `&'static mut` (leaked once,
/// at boot) rather than inside the struct by value, since `load_tss`
/// needs a stable address that outlives the GDT descriptor pointing at
/// it.
pub struct PerCpu {
    pub gdt: GlobalDescriptorTable,
    tss: &'static mut TaskStateSegment,
}

impl PerCpu {
    /// Initialises a CPU: allocates the double-fault IST stack and a
    /// bare TSS. `init_gdt` (called separately, once this is `'static`)
    /// finishes the job.
    pub unsafe fn init_cpu() -> Self {
        let tss = Box::leak(Box::new(TaskStateSegment::new()));
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = {
            const STACK_SIZE: usize = 4096 * 5;
            let stack = Box::leak(alloc::vec![0u8; STACK_SIZE].into_boxed_slice());
            let stack_start = VirtAddr::from_ptr(stack.as_ptr());
            stack_start + STACK_SIZE as u64 // stacks grow downwards
        };

        PerCpu {
            gdt: GlobalDescriptorTable::new(),
            tss,
        }
    }

    /// Used by `task::scheduler::switch_finish_hook` so interrupts taken
    /// while a task is running land on that task's own kernel stack.
    pub unsafe fn set_ist(&mut self, top: VirtAddr) {
        self.tss.privilege_stack_table[0] = top;
    }

    pub unsafe fn init_gdt(&'static mut self) {
        // Intel SDM vol 3 3.4.2: a segment selector doesn't point to the
        // segment directly, but to the descriptor that defines it.
        let code_selector = self.gdt.append(Descriptor::kernel_code_segment());
        let data_selector = self.gdt.append(Descriptor::kernel_data_segment());
        let tss_selector = self.gdt.append(Descriptor::tss_segment(self.tss));
        let user_data_selector = self.gdt.append(Descriptor::user_data_segment());
        let user_code_selector = self.gdt.append(Descriptor::user_code_segment());

        self.gdt.load();

        unsafe {
            CS::set_reg(code_selector);
            load_tss(tss_selector);

            DS::set_reg(data_selector);
            ES::set_reg(data_selector);
            FS::set_reg(data_selector);
            GS::set_reg(data_selector);
            SS::set_reg(data_selector);

            Efer::write(Efer::read() | EferFlags::SYSTEM_CALL_EXTENSIONS);
        }
        Star::write(user_code_selector, user_data_selector, code_selector, data_selector).unwrap();
        LStar::write(VirtAddr::from_ptr(crate::syscall::handle_syscall as *const ()));
        SFMask::write(RFlags::INTERRUPT_FLAG);
    }
}

/// Wraps `PerCpu` so it can live in a `static`. Single CPU only, so there
/// is no per-core indexing to do.
pub struct Cpus {
    cpu: UnsafeCell<PerCpu>,
}

impl Cpus {
    pub fn get_cpu(&self) -> &mut PerCpu {
        unsafe { &mut *self.cpu.get() }
    }
}

unsafe impl Send for Cpus {}
unsafe impl Sync for Cpus {}

static CPUS: OnceCell<Cpus> = OnceCell::uninit();

/// Brings up the GDT/TSS/SYSCALL MSRs for this (the only) CPU. Must run
/// once, early in boot, before interrupts are enabled.
pub fn init() {
    let cpu = unsafe { PerCpu::init_cpu() };
    CPUS.init_once(|| Cpus { cpu: UnsafeCell::new(cpu) });
    let cpu: &'static mut PerCpu = CPUS.get().unwrap().get_cpu();
    unsafe { cpu.init_gdt() };
}

/// Updates the stack interrupts land on (IST index 0 is also wired as
/// `privilege_stack_table[0]`, the ring3->ring0 stack). Called by
/// `task::scheduler::switch_finish_hook` on every context switch.
pub fn set_kernel_stack(top: VirtAddr) {
    if let Some(cpus) = CPUS.get() {
        unsafe { cpus.get_cpu().set_ist(top) };
    }
}
