//! Identity-mapping page-table builder.
//!
//! Builds a single, flat identity map (`laddr == paddr` for every mapped physical page) using
//! the largest hardware page size the CPU and the requested mapping both support, then exposes
//! query (`get_page`/`vget_page`) and modify (`set_region_hwpages`) operations tied back to the
//! memory map. Construction walks top-down and allocates child tables on demand, grounded in the
//! same page_getter-callback shape as a non-recursive table walk rather than a self-mapping
//! recursive scheme.

use amd64::paging::{self, PTE};
use amd64::registers::{CR3, CR3Data, CR3Flags, CR4};

use crate::palloc as alloc;
use crate::memmap::{Descriptor, Kind, MAP};
use crate::out::println;

fn fatal(msg: &str) -> ! {
    println!("pagetable: fatal: {}", msg);
    amd64::hlt_loop();
}

/// Levels in use for this mapping: 4 (PML4 root) or 5 (PML5 root, when the CPU and the loader
/// both support it).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PagingMode {
    pub levels: u8,
    pub leaf_page_size: u64,
}

/// Root of the identity map, along with the geometry it was built with. Holds everything
/// `get_page`/`set_region_hwpages` need to re-walk the hierarchy.
pub struct IdentityMap {
    root_phys: u64,
    mode: PagingMode,
}

const FLAGS_COMMON: PTE = PTE::from_bits_truncate(PTE::PRESENT.bits() | PTE::WRITE.bits());

fn five_level_paging_supported() -> bool {
    raw_cpuid::CpuId::new()
        .get_extended_feature_info()
        .map(|f| f.has_la57())
        .unwrap_or(false)
}

fn gib_pages_supported() -> bool {
    raw_cpuid::CpuId::new()
        .get_extended_processor_and_feature_identifiers()
        .map(|f| f.has_1gib_pages())
        .unwrap_or(false)
}

/// Zero a freshly allocated page-table page and return its physical address.
fn alloc_table_page() -> u64 {
    let addr = alloc::alloc_4kib(paging::PAGE_TABLE_SIZE);
    if alloc::is_err(addr) {
        fatal("out of memory allocating page table pages");
    }
    addr
}

/// Non-recursive, top-down identity-map construction. At each level, either installs a huge-page
/// leaf (if the remaining run is large and aligned enough, and the level permits PS) or
/// allocates a child table and recurses. `table` is the physical base of the table at `level`;
/// entries are written directly (identity-mapped, so physical == linear table addresses).
fn map_identity_inner(table: u64, level: u8, levels_in_use: u8, max_leaf_page_size: u64, laddr: u64, remaining_pages: &mut u64) {
    let entries = unsafe {
        core::slice::from_raw_parts_mut(table as *mut PTE, paging::ENTRIES_PER_TABLE)
    };

    let mut index = paging::table_index(laddr, level);
    let mut cur_laddr = laddr;

    while *remaining_pages > 0 && index < paging::ENTRIES_PER_TABLE {
        let page_size = paging::page_size(level);
        let page_size_pages = page_size / paging::PAGE_SIZE;

        let aligned = cur_laddr % page_size == 0;
        // Level 1 is always a terminal 4 KiB page table entry; above that, a leaf is only legal
        // if the hierarchy permits PS at this level AND the CPU supports this level's huge-page
        // size (1 GiB leaves require CPUID page1GB; 2 MiB leaves are universal on amd64).
        let can_leaf = level == 1 || (paging::can_be_huge(level, levels_in_use) && page_size <= max_leaf_page_size);

        if can_leaf && aligned && *remaining_pages >= page_size_pages {
            let mut flags = FLAGS_COMMON;
            if level > 1 {
                flags |= PTE::HUGE_PAGE;
            }
            entries[index] = PTE::from_paddr(cur_laddr) | flags;
            *remaining_pages -= page_size_pages;
            cur_laddr += page_size;
        } else if level == 1 {
            // Sub-page remainder at the leaf level: map a single 4 KiB page.
            entries[index] = PTE::from_paddr(cur_laddr) | FLAGS_COMMON;
            *remaining_pages -= 1;
            cur_laddr += paging::PTE_MAPPED_SIZE;
        } else {
            let child = alloc_table_page();
            entries[index] = PTE::from_paddr(child) | FLAGS_COMMON;
            map_identity_inner(child, level - 1, levels_in_use, max_leaf_page_size, cur_laddr, remaining_pages);
            cur_laddr = align_up(cur_laddr + 1, page_size);
        }

        index += 1;
    }
}

fn align_up(addr: u64, align: u64) -> u64 {
    (addr + align - 1) / align * align
}

/// Build the identity map over every physical page reported by the memory map, choosing the
/// largest hardware page size and paging-level count available, then install it.
pub fn build_and_install() -> IdentityMap {
    // Disable global pages while we're rebuilding the hierarchy; any stale global TLB entries
    // from firmware's own mappings must not survive the switch.
    unsafe { CR4::write(CR4::read() & !CR4::PGE) };

    let max_addr = MAP.lock().max_mapped_physical_address();
    let levels = if five_level_paging_supported() { 5 } else { 4 };
    let leaf_page_size = if gib_pages_supported() { paging::PDPE_MAPPED_SIZE } else { paging::PDE_MAPPED_SIZE };
    let mode = PagingMode { levels, leaf_page_size };

    let root_entries = paging::ENTRIES_PER_TABLE as u64;
    let root_span = paging::page_size(levels);
    let required_root_entries = (max_addr + root_span - 1) / root_span;
    debug_assert!(required_root_entries <= root_entries, "physical address space exceeds a single top-level table");

    let root_phys = alloc_table_page();
    let total_pages = (max_addr + paging::PAGE_SIZE - 1) / paging::PAGE_SIZE;
    let mut remaining = total_pages;
    map_identity_inner(root_phys, levels, levels, leaf_page_size, 0, &mut remaining);

    unsafe {
        CR3 { data: CR3Data::Flags(CR3Flags::empty()), paddr: root_phys as usize }.write();
        CR4::write(CR4::read() | CR4::PGE);
    }

    IdentityMap { root_phys, mode }
}

/// A queried page-table entry, per §4.D's "page-entry record."
#[derive(Debug, Clone, Copy)]
pub struct PageEntry {
    pub raw_entry: u64,
    pub page_size: u64,
    pub whole_page_in_region: bool,
    /// Memory-map descriptor that owned the queried address at walk time, if any.
    pub owning_descriptor_snapshot: Option<Descriptor>,
}

impl PageEntry {
    fn zeroed() -> Self {
        PageEntry { raw_entry: 0, page_size: 0, whole_page_in_region: false, owning_descriptor_snapshot: None }
    }
}

impl IdentityMap {
    fn walk(&self, laddr: u64) -> Option<(u64, u8)> {
        let mut table = self.root_phys;
        for level in (1..=self.mode.levels).rev() {
            let index = paging::table_index(laddr, level);
            let entries = unsafe {
                core::slice::from_raw_parts(table as *const PTE, paging::ENTRIES_PER_TABLE)
            };
            let entry = entries[index];
            if !entry.contains(PTE::PRESENT) {
                return None;
            }
            if level == 1 || entry.contains(PTE::HUGE_PAGE) {
                return Some((entry.bits, level));
            }
            table = entry.get_paddr();
        }
        None
    }

    /// Walk the installed hierarchy for `addr`, returning the raw entry, its page size, and
    /// whether the whole hardware page sits inside a single memory-map descriptor.
    pub fn get_page(&self, addr: u64) -> PageEntry {
        if addr % paging::PAGE_SIZE != 0 {
            println!("pagetable: get_page: address {:#x} is not 4 KiB aligned", addr);
            return PageEntry::zeroed();
        }
        let Some((raw_entry, level)) = self.walk(addr) else {
            return PageEntry::zeroed();
        };
        let page_size = paging::page_size(level);
        if addr % page_size != 0 {
            println!("pagetable: get_page: address {:#x} is not the base of its enclosing {}-byte page", addr, page_size);
            return PageEntry::zeroed();
        }
        let map = MAP.lock();
        let owning_descriptor_snapshot = map.find_owning_descriptor(addr).map(|i| map.descriptor_at(i));
        drop(map);
        let whole_page_in_region = owning_descriptor_snapshot
            .map(|d| addr + page_size <= d.physical_end())
            .unwrap_or(false);
        PageEntry { raw_entry, page_size, whole_page_in_region, owning_descriptor_snapshot }
    }

    /// Identity mapping: the virtual query is the same walk as the physical one.
    pub fn vget_page(&self, addr: u64) -> PageEntry {
        self.get_page(addr)
    }

    /// Replace or merge flag bits across every hardware page backing the memory-map region based
    /// at `region_base`. Fails (returns `false`) unless the region covers whole hardware pages at
    /// the level it's currently mapped at.
    pub fn set_region_hwpages(&self, region_base: u64, flags: PTE, merge: bool, attributes: u64) -> bool {
        let desc = {
            let map = MAP.lock();
            match map.find_descriptor_by_physical_base(region_base) {
                Some(i) => map.descriptor_at(i),
                None => return false,
            }
        };

        let Some((_, level)) = self.walk(region_base) else { return false };
        let page_size = paging::page_size(level);
        if desc.size_bytes() % page_size != 0 {
            println!("pagetable: set_region_hwpages: region at {:#x} does not cover whole hardware pages", region_base);
            return false;
        }

        let mut addr = region_base;
        while addr < desc.physical_end() {
            let Some((_, lvl)) = self.walk(addr) else { return false };
            let table = self.table_for(addr, lvl);
            let index = paging::table_index(addr, lvl);
            let entries = unsafe { core::slice::from_raw_parts_mut(table as *mut PTE, paging::ENTRIES_PER_TABLE) };
            let base = entries[index].get_paddr();
            entries[index] = if merge {
                PTE::from_paddr(base) | (entries[index] | flags)
            } else {
                PTE::from_paddr(base) | flags
            };
            addr += paging::page_size(lvl);
        }

        crate::mutator::set_kind_for_range(region_base, desc.page_count, desc.kind, attributes);
        true
    }

    fn table_for(&self, laddr: u64, target_level: u8) -> u64 {
        let mut table = self.root_phys;
        for level in (target_level + 1..=self.mode.levels).rev() {
            let index = paging::table_index(laddr, level);
            let entries = unsafe { core::slice::from_raw_parts(table as *const PTE, paging::ENTRIES_PER_TABLE) };
            table = entries[index].get_paddr();
        }
        table
    }
}

/// Process-wide installed identity map, set once by `init` after `build_and_install` runs.
pub static IDENTITY_MAP: spin::Once<IdentityMap> = spin::Once::new();
