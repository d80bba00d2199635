//! Entry point: receives the UEFI handoff record and runs bring-up to completion.
//!
//! Control flow is G (CPU bring-up) → E (descriptor tables) → B (memory-map reclaim) → D
//! (identity paging) → finish. Bootstrap-processor only; nothing here survives a second core
//! calling in.

#![no_std]
#![no_main]

use core::panic::PanicInfo;

use libkernel::handoff::{self, Handoff};
use libkernel::memmap::{Descriptor, Kind, MAP};
use libkernel::out::println;
use libkernel::{cfg, cpu, mutator, pagetable, tables};

/// Backing storage for the kernel's own translated `Descriptor` array, sized off
/// `cfg::heap_init_bytes` (the only boot-time size knob this bring-up stage needs — there is no
/// separate kernel heap, the memory map itself doubles as the one arena the allocators draw
/// from).
const MAX_DESCRIPTORS: usize = 4096;
static mut MAP_BACKING: [Descriptor; MAX_DESCRIPTORS] = [Descriptor {
    kind: Kind::Unusable,
    physical_base: 0,
    virtual_base: 0,
    page_count: 0,
    attributes: 0,
}; MAX_DESCRIPTORS];

/// Kinds the bootloader handed off as transient loader/boot-services use; once boot services are
/// gone these regions are ordinary free memory.
const RECLAIMABLE: [Kind; 4] = [
    Kind::LoaderCode,
    Kind::LoaderData,
    Kind::BootServicesCode,
    Kind::BootServicesData,
];

#[no_mangle]
pub extern "sysv64" fn kernel_main(handoff: Handoff) -> ! {
    // No config blob crosses the UEFI handoff boundary; this always falls through to defaults.
    cfg::init_boot_cfg("");

    cpu::init();
    tables::init();

    let descriptor_capacity = (cfg::heap_init_bytes() / core::mem::size_of::<Descriptor>()).min(MAX_DESCRIPTORS);
    let backing = unsafe { &mut MAP_BACKING[..descriptor_capacity] };
    unsafe { handoff::install_memory_map(&handoff, backing) };

    reclaim_boot_services();

    let identity_map = pagetable::build_and_install();
    let _ = pagetable::IDENTITY_MAP.call_once(|| identity_map);

    let acpi = handoff::recognize_config_tables(&handoff.system_table);
    println!("init: ACPI RSDP at {:#x}", acpi.rsdp().unwrap());

    println!("init: bring-up complete, {} pages free", libkernel::palloc::free_system_pages());

    amd64::hlt_loop();
}

/// Fold every loader/boot-services descriptor back into `Conventional` now that boot services
/// are no longer callable, then merge the result. Runs once, right after the firmware map is
/// installed and before the identity map is built (so the page-table builder sees the reclaimed
/// pages as ordinary RAM).
fn reclaim_boot_services() {
    loop {
        let target = {
            let map = MAP.lock();
            (0..map.len()).map(|i| map.descriptor_at(i)).find(|d| RECLAIMABLE.contains(&d.kind))
        };
        let Some(d) = target else { break };
        mutator::set_kind_for_range(d.physical_base, d.page_count, Kind::Conventional, 0);
    }
    mutator::merge_conventional();
}

#[panic_handler]
fn panic_handler(info: &PanicInfo) -> ! {
    println!("{}", info);
    amd64::hlt_loop();
}
