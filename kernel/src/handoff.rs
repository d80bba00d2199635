//! UEFI-native boot handoff: the record the bootloader hands to `kernel_main`, ACPI
//! configuration-table vendor-GUID recognition, and the two runtime-services calls this kernel
//! makes (`SetVirtualAddressMap`, `ResetSystem`).
//!
//! The config-table walk mirrors the teacher's dead entry point (`payload.st.config_table()`
//! matched against `uefi::table::cfg::ACPI2_GUID`/`ACPI_GUID`), completed into the full GUID set
//! and an RSDP-preference decision the teacher's sketch left as a comment.

use uefi::proto::console::gop;
use uefi::table::boot::MemoryDescriptor;
use uefi::table::cfg::{ACPI2_GUID, ACPI_GUID, MPS_GUID, SAL_SYSTEM_GUID, SMBIOS3_GUID, SMBIOS_GUID};
use uefi::table::runtime::ResetType;
use uefi::table::{Runtime, SystemTable};
use uefi::Status;

use crate::memmap::{Descriptor, Kind, MemoryMapStore, MAP};
use crate::out::println;

/// Graphics-output configuration handed off by the bootloader.
#[derive(Clone, Copy)]
pub struct GraphicsInfo {
    pub framebuffer_base: u64,
    pub framebuffer_size: usize,
    pub pixel_format: gop::PixelFormat,
    pub mode: gop::ModeInfo,
}

/// The full handoff record: firmware memory map location and shape, the runtime-services table,
/// and the graphics-output configuration. Built by the bootloader, consumed once by
/// `kernel_main`.
pub struct Handoff {
    pub system_table: SystemTable<Runtime>,
    pub mmap_ptr: *mut u8,
    pub mmap_len_bytes: u64,
    pub mmap_stride: u64,
    pub mmap_version: u32,
    pub graphics: GraphicsInfo,
}

// SAFETY: produced once by the bootloader on the bootstrap processor and consumed once, before
// any other code runs; never shared.
unsafe impl Send for Handoff {}

/// ACPI-relevant vendor GUIDs found in the firmware configuration table.
#[derive(Default, Clone, Copy)]
pub struct AcpiPointers {
    pub rsdp_2_0: Option<u64>,
    pub rsdp_1_0: Option<u64>,
    pub smbios: Option<u64>,
    pub smbios3: Option<u64>,
    pub mps: Option<u64>,
    pub sal: Option<u64>,
}

impl AcpiPointers {
    /// The RSDP to hand to the ACPI table walker: prefers the 2.0 table, falls back to 1.0.
    pub fn rsdp(&self) -> Option<u64> {
        self.rsdp_2_0.or(self.rsdp_1_0)
    }
}

/// Walk the firmware configuration table, recording every recognised vendor GUID. Halts the
/// kernel if neither an ACPI 2.0 nor an ACPI 1.0 RSDP is present; there is no other way to find
/// the ACPI namespace.
pub fn recognize_config_tables(system_table: &SystemTable<Runtime>) -> AcpiPointers {
    let mut pointers = AcpiPointers::default();

    for entry in system_table.config_table() {
        match entry.guid {
            ACPI2_GUID => pointers.rsdp_2_0 = Some(entry.address as u64),
            ACPI_GUID => pointers.rsdp_1_0 = Some(entry.address as u64),
            SMBIOS_GUID => pointers.smbios = Some(entry.address as u64),
            SMBIOS3_GUID => pointers.smbios3 = Some(entry.address as u64),
            MPS_GUID => pointers.mps = Some(entry.address as u64),
            SAL_SYSTEM_GUID => pointers.sal = Some(entry.address as u64),
            _ => (),
        }
    }

    if pointers.rsdp().is_none() {
        println!("handoff: no ACPI RSDP in the configuration table, halting");
        amd64::hlt_loop();
    }

    pointers
}

/// Translate the firmware's memory map into the kernel's own `Descriptor` array and install it
/// as the singleton [`crate::memmap::MAP`]. Firmware kinds outside the recognised `EFI_MEMORY_TYPE`
/// range collapse to `Kind::Unusable` via [`Kind::from_u32`] rather than being trusted verbatim.
///
/// # Safety
/// `handoff.mmap_ptr` must point to `handoff.mmap_len_bytes` of valid firmware memory-descriptor
/// records of width `handoff.mmap_stride`, and `backing` must be large enough to hold one
/// `Descriptor` per firmware record.
pub unsafe fn install_memory_map(handoff: &Handoff, backing: &mut [Descriptor]) {
    let count = (handoff.mmap_len_bytes / handoff.mmap_stride) as usize;
    assert!(backing.len() >= count, "backing buffer too small for the firmware memory map");

    for i in 0..count {
        let raw = &*(handoff.mmap_ptr.add(i * handoff.mmap_stride as usize) as *const MemoryDescriptor);
        backing[i] = Descriptor {
            kind: Kind::from_u32(raw.ty.0),
            physical_base: raw.phys_start,
            virtual_base: raw.virt_start,
            page_count: raw.page_count,
            attributes: raw.att.bits(),
        };
    }

    let stride = core::mem::size_of::<Descriptor>() as u64;
    let store = MemoryMapStore::new(
        backing.as_mut_ptr() as *mut u8,
        stride,
        count as u64 * stride,
        backing.len() as u64 * stride,
        handoff.mmap_version,
    );
    *MAP.lock() = store;
}

/// Install an identity virtual-address map via `SetVirtualAddressMap`. Per §6, the caller rolls
/// back to the firmware-supplied pointer on failure; this wrapper surfaces that as `Err` rather
/// than halting, since losing the virtual map is recoverable (the identity map still works).
pub fn set_virtual_address_map(
    system_table: &mut SystemTable<Runtime>,
    map_size: usize,
    descriptor_size: usize,
    descriptor_version: u32,
    virtual_map: &mut [MemoryDescriptor],
) -> uefi::Result<()> {
    unsafe {
        system_table.runtime_services().set_virtual_address_map(
            map_size,
            descriptor_size,
            descriptor_version,
            virtual_map,
        )
    }
}

/// Reset the machine via `ResetSystem`. Never returns on success.
pub fn reset(system_table: &SystemTable<Runtime>, reset_type: ResetType) -> ! {
    system_table
        .runtime_services()
        .reset(reset_type, Status::SUCCESS, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rsdp_prefers_2_0_over_1_0() {
        let pointers = AcpiPointers { rsdp_2_0: Some(0x1000), rsdp_1_0: Some(0x2000), ..Default::default() };
        assert_eq!(pointers.rsdp(), Some(0x1000));
    }

    #[test]
    fn rsdp_falls_back_to_1_0() {
        let pointers = AcpiPointers { rsdp_2_0: None, rsdp_1_0: Some(0x2000), ..Default::default() };
        assert_eq!(pointers.rsdp(), Some(0x2000));
    }

    #[test]
    fn rsdp_absent_when_neither_present() {
        let pointers = AcpiPointers::default();
        assert_eq!(pointers.rsdp(), None);
    }
}
