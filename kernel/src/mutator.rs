//! Splits, merges, and relocates the memory map in place.
//!
//! Every mutation here follows the same triple-write discipline: stage the new descriptor
//! values, shift the trailing entries to make or close a gap, write the staged values into the
//! now-vacated slot(s), then update the map's byte length. `prepare` is the gate every mutating
//! path calls first, so the backing allocation always has room before a single byte moves.

use crate::memmap::{Descriptor, Kind, MemoryMapStore, MAP, PAGE_SIZE};
use crate::out::println;

fn fatal(msg: &str) -> ! {
    println!("mutator: fatal: {}", msg);
    amd64::hlt_loop();
}

fn ceil_div(a: u64, b: u64) -> u64 {
    (a + b - 1) / b
}

/// Guarantee that the backing allocation has room for `n` more descriptors than are currently
/// stored. Relocates the map to a larger `EfiConventional` region if necessary. Halts the
/// system if no sufficiently large region can be found — there is no path forward from that.
pub fn prepare(n: u64) {
    let mut map = MAP.lock();
    let stride = map.stride();
    let needed_bytes = map.len_bytes() + n * stride;
    if needed_bytes <= map.reserved_bytes() {
        return;
    }
    relocate(&mut map, needed_bytes);
}

fn relocate(map: &mut MemoryMapStore, needed_bytes: u64) {
    let stride = map.stride();
    // Extra slack so the very next prepare() for a small n doesn't immediately force another
    // relocation.
    let new_reserved_bytes = needed_bytes + crate::cfg::map_backing_slack_strides() as u64 * stride;
    let new_pages = ceil_div(new_reserved_bytes, PAGE_SIZE);

    let region_idx = (0..map.len()).find(|&i| {
        let d = map.descriptor_at(i);
        d.kind == Kind::Conventional && d.page_count >= new_pages
    });
    let region_idx = match region_idx {
        Some(i) => i,
        None => fatal("no EfiConventional region large enough to relocate the memory map into"),
    };

    let region = map.descriptor_at(region_idx);
    let new_base = region.physical_base;
    let old_base = map.base();
    let old_reserved = map.reserved_bytes();
    let len_bytes = map.len_bytes();

    unsafe {
        core::ptr::copy_nonoverlapping(old_base, new_base as *mut u8, len_bytes as usize);
        core::ptr::write_bytes(old_base, 0, old_reserved as usize);
    }

    map.rebase(new_base as *mut u8, new_reserved_bytes);

    // The region we just claimed becomes MemoryMapSelf; if it was larger than we need, the
    // remainder stays Conventional via the ordinary split path.
    let claim_pages = new_pages;
    drop_and_split_for_self(map, region_idx, region, claim_pages);

    // The old backing, if it was itself a MemoryMapSelf region (the common case after the first
    // relocation), reverts to Conventional.
    if let Some(old_idx) = map.find_descriptor_by_physical_base(old_base as u64) {
        let mut d = map.descriptor_at(old_idx);
        if d.kind == Kind::MemoryMapSelf {
            d.kind = Kind::Conventional;
            map.write_at(old_idx, d);
        }
    }

    merge_conventional_pass(map);
}

/// Split `region_idx` (currently `region`, Conventional) so that its first `claim_pages` pages
/// become `MemoryMapSelf`, replicating the generic four-case split without re-taking the lock
/// (the caller already holds it during relocation).
fn drop_and_split_for_self(map: &mut MemoryMapStore, region_idx: usize, region: Descriptor, claim_pages: u64) {
    if region.page_count == claim_pages {
        let mut d = region;
        d.kind = Kind::MemoryMapSelf;
        map.write_at(region_idx, d);
        return;
    }

    // claim_pages < region.page_count: shrink from the front, insert MemoryMapSelf before the
    // remaining Conventional tail (mirrors the "range at descriptor base" case).
    let len = map.len();
    map.shift_tail_up(region_idx, len - region_idx, 1);
    let self_desc = Descriptor {
        kind: Kind::MemoryMapSelf,
        physical_base: region.physical_base,
        virtual_base: region.virtual_base,
        page_count: claim_pages,
        attributes: 0,
    };
    let mut remainder = region;
    remainder.physical_base += claim_pages * PAGE_SIZE;
    remainder.virtual_base += claim_pages * PAGE_SIZE;
    remainder.page_count -= claim_pages;
    map.write_at(region_idx, self_desc);
    map.write_at(region_idx + 1, remainder);
    map.set_len_bytes(map.len_bytes() + map.stride());
}

/// Change the kind of `[physical_base, physical_base + page_count * PAGE_SIZE)` to `new_kind`,
/// splitting the owning descriptor per the four cases. Returns the index of the descriptor now
/// covering `physical_base` with `new_kind`.
pub fn set_kind_for_range(physical_base: u64, page_count: u64, new_kind: Kind, attributes: u64) -> usize {
    let (idx, d) = {
        let map = MAP.lock();
        let idx = map
            .find_owning_descriptor(physical_base)
            .expect("set_kind_for_range: no descriptor covers the requested range");
        (idx, map.descriptor_at(idx))
    };
    assert!(
        physical_base + page_count * PAGE_SIZE <= d.physical_end(),
        "set_kind_for_range: requested range extends past the owning descriptor"
    );

    let exact = d.physical_base == physical_base && d.page_count == page_count;
    let at_base = !exact && d.physical_base == physical_base;
    let at_tail = !exact && !at_base && physical_base + page_count * PAGE_SIZE == d.physical_end();

    if exact {
        let mut map = MAP.lock();
        let mut updated = d;
        updated.kind = new_kind;
        updated.attributes = attributes;
        map.write_at(idx, updated);
        merge_conventional_pass(&mut map);
        return idx;
    }

    if at_base {
        prepare(1);
        let mut map = MAP.lock();
        let len = map.len();
        map.shift_tail_up(idx, len - idx, 1);
        let new_d = Descriptor { kind: new_kind, physical_base, virtual_base: d.virtual_base, page_count, attributes };
        let mut remainder = d;
        remainder.physical_base += page_count * PAGE_SIZE;
        remainder.virtual_base += page_count * PAGE_SIZE;
        remainder.page_count -= page_count;
        map.write_at(idx, new_d);
        map.write_at(idx + 1, remainder);
        map.set_len_bytes(map.len_bytes() + map.stride());
        merge_conventional_pass(&mut map);
        return idx;
    }

    if at_tail {
        prepare(1);
        let mut map = MAP.lock();
        let len = map.len();
        map.shift_tail_up(idx + 1, len - idx - 1, 1);
        let mut remainder = d;
        remainder.page_count -= page_count;
        let new_d = Descriptor {
            kind: new_kind,
            physical_base,
            virtual_base: d.virtual_base + remainder.page_count * PAGE_SIZE,
            page_count,
            attributes,
        };
        map.write_at(idx, remainder);
        map.write_at(idx + 1, new_d);
        map.set_len_bytes(map.len_bytes() + map.stride());
        merge_conventional_pass(&mut map);
        return idx + 1;
    }

    // Strictly interior: three-way split.
    prepare(2);
    let mut map = MAP.lock();
    let len = map.len();
    map.shift_tail_up(idx + 1, len - idx - 1, 2);
    let below_pages = (physical_base - d.physical_base) / PAGE_SIZE;
    let above_pages = d.page_count - below_pages - page_count;
    let below = Descriptor {
        kind: d.kind,
        physical_base: d.physical_base,
        virtual_base: d.virtual_base,
        page_count: below_pages,
        attributes: d.attributes,
    };
    let mid = Descriptor {
        kind: new_kind,
        physical_base,
        virtual_base: d.virtual_base + below_pages * PAGE_SIZE,
        page_count,
        attributes,
    };
    let above = Descriptor {
        kind: d.kind,
        physical_base: physical_base + page_count * PAGE_SIZE,
        virtual_base: d.virtual_base + (below_pages + page_count) * PAGE_SIZE,
        page_count: above_pages,
        attributes: d.attributes,
    };
    map.write_at(idx, below);
    map.write_at(idx + 1, mid);
    map.write_at(idx + 2, above);
    map.set_len_bytes(map.len_bytes() + 2 * map.stride());
    merge_conventional_pass(&mut map);
    idx + 1
}

/// Coalesce adjacent `Conventional` descriptors. Run after every `free` and after any mutation
/// that shrinks the map's own descriptor count.
pub(crate) fn merge_conventional_pass(map: &mut MemoryMapStore) {
    loop {
        let len = map.len();
        let mut merged_at = None;
        for i in 0..len.saturating_sub(1) {
            let a = map.descriptor_at(i);
            let b = map.descriptor_at(i + 1);
            if a.kind == Kind::Conventional && b.kind == Kind::Conventional && a.physical_end() == b.physical_base {
                merged_at = Some(i);
                break;
            }
        }
        let Some(i) = merged_at else { break };
        let mut a = map.descriptor_at(i);
        let b = map.descriptor_at(i + 1);
        a.page_count += b.page_count;
        map.write_at(i, a);
        map.shift_tail_down(i + 1, len - i - 2, 1);
        map.set_len_bytes(map.len_bytes() - map.stride());
    }
}

pub fn merge_conventional() {
    let mut map = MAP.lock();
    merge_conventional_pass(&mut map);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memmap::MemoryMapStore;
    use core::mem::size_of;

    unsafe fn install(descs: &[Descriptor], reserved_extra_strides: u64) -> *mut u8 {
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
        backing
    }

    #[test]
    fn exact_fit_changes_kind_only() {
        unsafe {
            install(
                &[Descriptor { kind: Kind::Conventional, physical_base: 0x1000, virtual_base: 0, page_count: 2, attributes: 0 }],
                4,
            );
        }
        let idx = set_kind_for_range(0x1000, 2, Kind::MallocPhysical, 0);
        let map = MAP.lock();
        assert_eq!(map.len(), 1);
        assert_eq!(map.descriptor_at(idx).kind, Kind::MallocPhysical);
    }

    #[test]
    fn interior_split_produces_three_descriptors() {
        unsafe {
            install(
                &[Descriptor {
                    kind: Kind::Conventional,
                    physical_base: 0x100000,
                    virtual_base: 0,
                    page_count: 10,
                    attributes: 0,
                }],
                8,
            );
        }
        let idx = set_kind_for_range(0x103000, 2, Kind::MallocPhysical, 0);
        let map = MAP.lock();
        assert_eq!(map.len(), 3);
        assert_eq!(map.descriptor_at(0).physical_base, 0x100000);
        assert_eq!(map.descriptor_at(0).page_count, 3);
        assert_eq!(map.descriptor_at(idx).physical_base, 0x103000);
        assert_eq!(map.descriptor_at(idx).page_count, 2);
        assert_eq!(map.descriptor_at(2).physical_base, 0x105000);
        assert_eq!(map.descriptor_at(2).page_count, 5);
    }

    #[test]
    fn free_merge_recombines_split_region() {
        unsafe {
            install(
                &[Descriptor {
                    kind: Kind::Conventional,
                    physical_base: 0x100000,
                    virtual_base: 0,
                    page_count: 10,
                    attributes: 0,
                }],
                8,
            );
        }
        set_kind_for_range(0x103000, 2, Kind::MallocPhysical, 0);
        set_kind_for_range(0x103000, 2, Kind::Conventional, 0);
        merge_conventional();
        let map = MAP.lock();
        assert_eq!(map.len(), 1);
        assert_eq!(map.descriptor_at(0).page_count, 10);
        assert_eq!(map.descriptor_at(0).physical_base, 0x100000);
    }
}
