//! `xsave`/`xrstor` processor extended state area and instruction wrappers.
//!
//! The area layout (legacy x87/SSE region, the `xsave` header, then per-component save areas) is
//! architecturally defined; 4096 bytes covers every component up to and including AVX, while the
//! AVX-512 component set can extend past that, so areas are sized generously and over-aligned to
//! the 64-byte boundary `xsave`/`xrstor` require.

use core::arch::asm;

/// Size of an `XsaveArea`, large enough for the full AVX-512 component set (x87 + SSE + AVX +
/// opmask + ZMM_Hi256 + Hi16_ZMM) with room to spare.
pub const XSAVE_AREA_SIZE: usize = 8192;

/// A processor extended state save area, suitable for use with `xsave`/`xrstor`/`xsaveopt`.
/// Must be 64-byte aligned; the CPU faults (#GP) otherwise.
#[repr(C, align(64))]
#[derive(Clone, Copy)]
pub struct XsaveArea(pub [u8; XSAVE_AREA_SIZE]);

impl XsaveArea {
    #[inline]
    pub const fn new() -> Self {
        XsaveArea([0u8; XSAVE_AREA_SIZE])
    }
}

impl Default for XsaveArea {
    fn default() -> Self {
        Self::new()
    }
}

/// Save the processor extended state components selected by `mask` into `area`.
/// ### Safety:
/// `area` must be 64-byte aligned, and `mask` must be a subset of the components enabled in
/// `XCR0` and supported by the processor.
#[inline]
pub unsafe fn xsave(area: *mut XsaveArea, mask: u64) {
    let low = mask as u32;
    let high = (mask >> 32) as u32;
    asm!(
        "xsave [{0}]",
        in(reg) area,
        in("eax") low,
        in("edx") high,
        options(nostack),
    );
}

/// Restore the processor extended state components selected by `mask` from `area`.
/// ### Safety:
/// `area` must hold a previously-saved, well-formed `xsave` image, 64-byte aligned, and `mask`
/// must be a subset of the components enabled in `XCR0`.
#[inline]
pub unsafe fn xrstor(area: *const XsaveArea, mask: u64) {
    let low = mask as u32;
    let high = (mask >> 32) as u32;
    asm!(
        "xrstor [{0}]",
        in(reg) area,
        in("eax") low,
        in("edx") high,
        options(nostack),
    );
}
