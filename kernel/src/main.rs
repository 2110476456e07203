#![feature(abi_x86_interrupt)]
#![feature(allocator_api)]
#![no_std]
#![no_main]
extern crate alloc;

mod acpi_handler;
mod apic;
mod config;
mod console;
mod cpu;
mod error;
mod exec;
mod fs;
mod interrupts;
mod mm;
mod panic;
mod syscall;
mod task;

use acpi::AcpiTables;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use bootloader_api::config::Mapping;
use bootloader_api::BootloaderConfig;
use x86_64::registers::control::Cr3;
use x86_64::structures::paging::PhysFrame;
use x86_64::{PhysAddr, VirtAddr};

use crate::console::Console;
use crate::fs::devfs::{ConsoleDevice, Devfs};
use crate::fs::ramfs::Ramfs;
use crate::syscall::errno::O_RDONLY;

/// Every region this kernel actually uses: the bootloader's own direct
/// physical map, plus the kernel-supplied ramdisk the init program rides
/// in on.
pub static BOOTLOADER_CONFIG: BootloaderConfig = {
    let mut config = BootloaderConfig::new_default();
    config.mappings.physical_memory = Some(Mapping::Dynamic);
    config
};

bootloader_api::entry_point!(kernel_main, config = &BOOTLOADER_CONFIG);

/// Boot data-flow: bring up the CPU and interrupt descriptors, then
/// memory (frames -> HHDM -> buddy/slab heap), then the scheduler, then
/// interrupt routing (ACPI/APIC), then the VFS (devfs, rootfs), then
/// fork/exec the first user task.
fn kernel_main(boot_info: &'static mut bootloader_api::BootInfo) -> ! {
    let framebuffer = boot_info.framebuffer.as_mut().expect("no framebuffer");
    unsafe { panic::PANIC_FRAMEBUFFER = Some(&raw mut *framebuffer) };

    cpu::init();
    interrupts::init_idt();

    let (kernel_pml4, _) = Cr3::read();
    let physical_memory_offset = boot_info
        .physical_memory_offset
        .into_option()
        .expect("Expected physical memory offset");
    mm::init(kernel_pml4, physical_memory_offset, &boot_info.memory_regions);

    task::init();

    bring_up_interrupt_routing(boot_info, physical_memory_offset, kernel_pml4);

    x86_64::instructions::interrupts::enable();

    let console = Console::new(framebuffer);
    fs::devfs::register_console("console", 1, 1, Arc::new(ConsoleDevice::new(console)));
    fs::mount("/dev", "devfs", Arc::new(Devfs)).expect("failed to mount devfs");

    mount_rootfs(boot_info);

    spawn_init(kernel_pml4);

    loop {
        x86_64::instructions::interrupts::enable_and_hlt();
    }
}

/// Parses the ACPI tables at `rsdp_addr` (via the HHDM, so nothing needs
/// mapping specially) and brings up the local APIC / I/O APIC in place of
/// the legacy PIC, routing the timer and keyboard.
fn bring_up_interrupt_routing(
    boot_info: &bootloader_api::BootInfo,
    physical_memory_offset: u64,
    _kernel_pml4: PhysFrame,
) {
    let rsdp_addr = boot_info
        .rsdp_addr
        .into_option()
        .expect("Expected RSDP address");
    let handler = acpi_handler::Handler {
        phys_offset: VirtAddr::new(physical_memory_offset),
    };
    let acpi_tables =
        unsafe { AcpiTables::from_rsdp(handler, rsdp_addr as usize) }.expect("failed to parse ACPI tables");
    let platform_info = acpi_tables
        .platform_info()
        .expect("failed to read ACPI platform info");
    apic::enable(&platform_info.interrupt_model);
}

/// Mounts the rootfs from the raw ramdisk the bootloader handed off.
/// `build.rs` sets the ramdisk to the `init` ELF binary itself rather
/// than a tar archive, so it is exposed as a single-entry flat directory
/// instead of going through `Ramfs::from_tar`.
fn mount_rootfs(boot_info: &bootloader_api::BootInfo) {
    let ramdisk_addr = boot_info
        .ramdisk_addr
        .into_option()
        .expect("Expected ramdisk");
    let ramdisk_len = boot_info.ramdisk_len as usize;
    let ramdisk_virt = mm::paging::phys_to_virt(PhysAddr::new(ramdisk_addr));
    let ramdisk_bytes: &'static [u8] =
        unsafe { core::slice::from_raw_parts(ramdisk_virt.as_ptr(), ramdisk_len) };

    let rootfs = Ramfs::from_files(vec![(String::from("init"), ramdisk_bytes)]);
    fs::mount("/", "ramfs", Arc::new(rootfs)).expect("failed to mount rootfs");
}

unsafe extern "sysv64" fn unreachable_entry() {
    unreachable!("replaced by exec::process::commit_exec before first switch")
}

/// Loads `/init` into a fresh address space and hands it to the scheduler
/// as PID 1 — the first user task has no parent to fork from, so this
/// skips straight to prepare/commit exec.
fn spawn_init(kernel_pml4: PhysFrame) {
    let opened = fs::file::vfs_open("/init", O_RDONLY).expect("failed to open /init");
    let mut image = Vec::new();
    loop {
        let mut chunk = [0u8; 4096];
        match fs::file::read(&opened, &mut chunk) {
            Ok(0) => break,
            Ok(n) => image.extend_from_slice(&chunk[..n]),
            Err(e) => panic!("failed to read /init: {}", e),
        }
    }
    fs::file::close(opened);

    let prepared = exec::process::prepare_exec(&image, &["/init"], kernel_pml4)
        .expect("failed to load /init");

    let task = task::task::new_task_ref(task::task::Task::kernel_task(
        unreachable_entry,
        Some(String::from("init")),
    ));
    exec::process::commit_exec(&task, prepared, kernel_pml4);
    task::scheduler::kthread_run(task);
}
