//! Physical/virtual allocator over the firmware memory map.
//!
//! Six entry points: the generic, size-dispatching [`alloc`] plus five explicit per-alignment-
//! class functions. `free` and `realloc` look descriptors up by base address rather than holding
//! onto raw pointers across a potential [`crate::mutator::prepare`] relocation.

use crate::memmap::{Descriptor, Kind, PAGE_SIZE, MAP};
use crate::mutator;

/// High bit set on every sentinel error return, so ordinary addresses (which this kernel never
/// maps above bit 63) are unambiguously distinguishable from an error.
pub const SENTINEL_BIT: u64 = 1 << 63;
pub const ERR_OUT_OF_MEMORY: u64 = SENTINEL_BIT | 1;
pub const ERR_BAD_ALIGNMENT: u64 = SENTINEL_BIT | 2;
pub const ERR_FREED: u64 = SENTINEL_BIT | 3;
pub const ERR_DESCRIPTOR_NOT_FOUND: u64 = SENTINEL_BIT | 4;

pub fn is_err(addr: u64) -> bool {
    addr & SENTINEL_BIT != 0
}

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;
const TIB: u64 = 1024 * GIB;

pub const ALIGN_4KIB: u64 = 4 * KIB;
pub const ALIGN_2MIB: u64 = 2 * MIB;
pub const ALIGN_1GIB: u64 = 1 * GIB;
pub const ALIGN_512GIB: u64 = 512 * GIB;
pub const ALIGN_256TIB: u64 = 256 * TIB;

/// Alignment class boundaries, in exact byte counts (binary units throughout, per the resolved
/// open question on decimal/binary mixing): a request of `bytes` gets the smallest class whose
/// threshold it does not exceed.
fn alignment_class_for(bytes: u64) -> u64 {
    if bytes <= 2 * MIB {
        ALIGN_4KIB
    } else if bytes <= 1 * GIB {
        ALIGN_2MIB
    } else if bytes <= 512 * GIB {
        ALIGN_1GIB
    } else if bytes <= 256 * TIB {
        ALIGN_512GIB
    } else {
        ALIGN_256TIB
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Space {
    Physical,
    Virtual,
}

impl Space {
    fn malloc_kind(self) -> Kind {
        match self {
            Space::Physical => Kind::MallocPhysical,
            Space::Virtual => Kind::MallocVirtual,
        }
    }
}

fn pages_for(bytes: u64) -> u64 {
    if bytes == 0 {
        1
    } else {
        (bytes + PAGE_SIZE - 1) / PAGE_SIZE
    }
}

fn region_base(d: &Descriptor, space: Space) -> u64 {
    match space {
        Space::Physical => d.physical_base,
        Space::Virtual => d.virtual_base,
    }
}

fn first_fit(space: Space, align: u64, pages: u64) -> Option<(u64, u64, u64)> {
    let needed_bytes = pages * PAGE_SIZE;
    let map = MAP.lock();
    for i in 0..map.len() {
        let d = map.descriptor_at(i);
        if d.kind != Kind::Conventional {
            continue;
        }
        let base = region_base(&d, space);
        let aligned = (base + align - 1) / align * align;
        let region_end = base + d.size_bytes();
        if aligned + needed_bytes <= region_end {
            // Translate back into the physical base the mutator splits on.
            let phys_offset = aligned - base;
            return Some((aligned, d.physical_base + phys_offset, d.page_count));
        }
    }
    None
}

fn alloc_aligned(space: Space, bytes: u64, align: u64) -> u64 {
    if align == 0 || align % ALIGN_4KIB != 0 || !align.is_power_of_two() {
        return ERR_BAD_ALIGNMENT;
    }
    let pages = pages_for(bytes);

    // A first-fit miss may just mean fragmentation: retry after coalescing adjacent
    // `Conventional` descriptors a few times before giving up.
    let mut attempt = 0;
    let found = loop {
        if let Some(hit) = first_fit(space, align, pages) {
            break Some(hit);
        }
        if attempt >= crate::cfg::max_oom_retry() {
            break None;
        }
        mutator::merge_conventional();
        attempt += 1;
    };
    let Some((result_base, phys_base, _region_pages)) = found else {
        return ERR_OUT_OF_MEMORY;
    };
    mutator::set_kind_for_range(phys_base, pages, space.malloc_kind(), 0);
    unsafe {
        core::ptr::write_bytes(phys_base as *mut u8, 0, (pages * PAGE_SIZE) as usize);
    }
    result_base
}

pub fn alloc(bytes: u64) -> u64 {
    alloc_aligned(Space::Physical, bytes, alignment_class_for(bytes))
}
pub fn alloc_4kib(bytes: u64) -> u64 {
    alloc_aligned(Space::Physical, bytes, ALIGN_4KIB)
}
pub fn alloc_2mib(bytes: u64) -> u64 {
    alloc_aligned(Space::Physical, bytes, ALIGN_2MIB)
}
pub fn alloc_1gib(bytes: u64) -> u64 {
    alloc_aligned(Space::Physical, bytes, ALIGN_1GIB)
}
pub fn alloc_512gib(bytes: u64) -> u64 {
    alloc_aligned(Space::Physical, bytes, ALIGN_512GIB)
}
pub fn alloc_256tib(bytes: u64) -> u64 {
    alloc_aligned(Space::Physical, bytes, ALIGN_256TIB)
}

pub fn valloc(bytes: u64) -> u64 {
    alloc_aligned(Space::Virtual, bytes, alignment_class_for(bytes))
}

fn find_malloc(space: Space, addr: u64) -> Option<usize> {
    let map = MAP.lock();
    (0..map.len()).find(|&i| {
        let d = map.descriptor_at(i);
        d.kind == space.malloc_kind() && region_base(&d, space) == addr
    })
}

fn free_inner(space: Space, addr: u64) -> u64 {
    let Some(idx) = find_malloc(space, addr) else {
        return ERR_DESCRIPTOR_NOT_FOUND;
    };
    let d = MAP.lock().descriptor_at(idx);
    unsafe {
        core::ptr::write_bytes(d.physical_base as *mut u8, 0, d.size_bytes() as usize);
    }
    mutator::set_kind_for_range(d.physical_base, d.page_count, Kind::Conventional, 0);
    mutator::merge_conventional();
    0
}

pub fn free(addr: u64) -> u64 {
    free_inner(Space::Physical, addr)
}
pub fn vfree(addr: u64) -> u64 {
    free_inner(Space::Virtual, addr)
}

fn realloc_inner(space: Space, addr: u64, new_bytes: u64) -> u64 {
    if new_bytes == 0 {
        free_inner(space, addr);
        return ERR_FREED;
    }

    let Some(idx) = find_malloc(space, addr) else {
        return ERR_DESCRIPTOR_NOT_FOUND;
    };
    let d = MAP.lock().descriptor_at(idx);
    let old_pages = d.page_count;
    let new_pages = pages_for(new_bytes);

    if new_pages == old_pages {
        return addr;
    }

    if new_pages > old_pages {
        let grow_pages = new_pages - old_pages;
        let next_base = d.physical_base + d.size_bytes();
        let next = {
            let map = MAP.lock();
            map.find_descriptor_by_physical_base(next_base).map(|i| map.descriptor_at(i))
        };
        if let Some(next) = next {
            if next.kind == Kind::Conventional && next.page_count >= grow_pages {
                mutator::set_kind_for_range(next_base, grow_pages, space.malloc_kind(), 0);
                mutator::merge_conventional();
                unsafe {
                    core::ptr::write_bytes(next_base as *mut u8, 0, (grow_pages * PAGE_SIZE) as usize);
                }
                return addr;
            }
        }
        // No room to grow in place: allocate fresh, copy, free old.
        let new_addr = alloc_aligned(space, new_bytes, alignment_class_for(new_bytes));
        if is_err(new_addr) {
            return new_addr;
        }
        unsafe {
            core::ptr::copy_nonoverlapping(addr as *const u8, new_addr as *mut u8, d.size_bytes() as usize);
        }
        free_inner(space, addr);
        new_addr
    } else {
        let shrink_pages = old_pages - new_pages;
        let tail_base = d.physical_base + new_pages * PAGE_SIZE;
        // Splitting off the shrunk tail requires room for one more descriptor; if the shrink
        // doesn't even free a full page we simply keep the tail allocated (nothing to split).
        if shrink_pages == 0 {
            return addr;
        }
        unsafe {
            core::ptr::write_bytes(tail_base as *mut u8, 0, (shrink_pages * PAGE_SIZE) as usize);
        }
        mutator::set_kind_for_range(tail_base, shrink_pages, Kind::Conventional, 0);
        mutator::merge_conventional();
        addr
    }
}

pub fn realloc(addr: u64, new_bytes: u64) -> u64 {
    realloc_inner(Space::Physical, addr, new_bytes)
}
pub fn vrealloc(addr: u64, new_bytes: u64) -> u64 {
    realloc_inner(Space::Virtual, addr, new_bytes)
}

/// Total pages across every `Conventional` descriptor, for the `free(alloc())` round-trip test
/// in §8 law 2.
pub fn free_system_pages() -> u64 {
    MAP.lock().iter().filter(|d| d.kind == Kind::Conventional).map(|d| d.page_count).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memmap::MemoryMapStore;
    use core::mem::size_of;

    unsafe fn install(descs: &[Descriptor], reserved_extra_strides: u64) {
        let stride = size_of::<Descriptor>() as u64;
        let cap_bytes = descs.len() as u64 * stride + reserved_extra_strides * stride;
        let backing = alloc::alloc::alloc_zeroed(
            alloc::alloc::Layout::from_size_align(cap_bytes as usize, 8).unwrap(),
        );
        for (i, d) in descs.iter().enumerate() {
            (backing.add(i * stride as usize) as *mut Descriptor).write_unaligned(*d);
        }
        let len_bytes = descs.len() as u64 * stride;
        *MAP.lock() = MemoryMapStore::new(backing, stride, len_bytes, cap_bytes, 1);
    }

    /// Carves out `pages` of real, page-aligned, host-owned memory and returns its address. The
    /// allocator under test writes through `physical_base` (zeroing, copying), so a descriptor's
    /// `physical_base` must point somewhere this process actually owns, not a fabricated address.
    unsafe fn alloc_region(pages: u64) -> u64 {
        let bytes = (pages * PAGE_SIZE) as usize;
        let layout = alloc::alloc::Layout::from_size_align(bytes, PAGE_SIZE as usize).unwrap();
        alloc::alloc::alloc_zeroed(layout) as u64
    }

    #[test]
    fn alignment_class_boundaries_match_decision() {
        assert_eq!(alignment_class_for(1), ALIGN_4KIB);
        assert_eq!(alignment_class_for(2 * MIB), ALIGN_4KIB);
        assert_eq!(alignment_class_for(2 * MIB + 1), ALIGN_2MIB);
        assert_eq!(alignment_class_for(1 * GIB), ALIGN_2MIB);
        assert_eq!(alignment_class_for(1 * GIB + 1), ALIGN_1GIB);
        assert_eq!(alignment_class_for(512 * GIB), ALIGN_1GIB);
        assert_eq!(alignment_class_for(512 * GIB + 1), ALIGN_512GIB);
        assert_eq!(alignment_class_for(256 * TIB), ALIGN_512GIB);
        assert_eq!(alignment_class_for(256 * TIB + 1), ALIGN_256TIB);
    }

    #[test]
    fn alloc_returns_zeroed_aligned_region_inside_malloc_descriptor() {
        unsafe {
            let region = alloc_region(16);
            install(
                &[Descriptor {
                    kind: Kind::Conventional,
                    physical_base: region,
                    virtual_base: 0,
                    page_count: 16,
                    attributes: 0,
                }],
                8,
            );
        }
        let addr = alloc_4kib(4096 * 3);
        assert!(!is_err(addr));
        assert_eq!(addr % ALIGN_4KIB, 0);
        let map = MAP.lock();
        let idx = map.find_owning_descriptor(addr).unwrap();
        assert_eq!(map.descriptor_at(idx).kind, Kind::MallocPhysical);
    }

    #[test]
    fn free_then_alloc_preserves_free_system_pages() {
        unsafe {
            let region = alloc_region(16);
            install(
                &[Descriptor {
                    kind: Kind::Conventional,
                    physical_base: region,
                    virtual_base: 0,
                    page_count: 16,
                    attributes: 0,
                }],
                8,
            );
        }
        let before = free_system_pages();
        let addr = alloc_4kib(4096);
        assert!(!is_err(addr));
        free(addr);
        assert_eq!(free_system_pages(), before);
    }

    #[test]
    fn free_unknown_address_returns_descriptor_not_found() {
        unsafe {
            let region = alloc_region(16);
            install(
                &[Descriptor {
                    kind: Kind::Conventional,
                    physical_base: region,
                    virtual_base: 0,
                    page_count: 16,
                    attributes: 0,
                }],
                8,
            );
        }
        assert_eq!(free(0xdead_0000), ERR_DESCRIPTOR_NOT_FOUND);
    }
}
