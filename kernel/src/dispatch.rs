//! Interrupt dispatch: extended-state save/restore around every vector, the architectural
//! exception handlers, and routing for the user-interrupt range through the ACPI redirection
//! table.
//!
//! Vectors 32-255 share one stub shape. Rather than hand-copying 224 near-identical functions,
//! `paste!` stamps out one distinctly-named `extern "x86-interrupt"` function per vector from a
//! single macro body, each forwarding its own vector number into `dispatch_user`.

use paste::paste;

use amd64::interrupts::{
    InterruptDescriptorTable, InterruptStackFrame, IntTrapGate, PfErrCode, Ssdt,
    RESERVED_VECTORS, USER_INTERRUPTS_START,
    DIVIDE_BY_ZERO, DEBUG, NON_MASKABLE_INTERRUPT, BREAKPOINT, OVERFLOW, BOUND_RANGE,
    INVALID_OPCODE, DEVICE_NOT_AVAILABLE, DOUBLE_FAULT, INVALID_TSS, SEGMENT_NOT_PRESENT,
    STACK_FAULT, GENERAL_PROTECTION, PAGE_FAULT, X87_FLOATING_POINT, ALIGNMENT_CHECK,
    MACHINE_CHECK, SIMD_FLOATING_POINT,
};
use amd64::registers::{cr2_read, xgetbv};
use amd64::segmentation::SegSel;
use amd64::xsave::{xrstor, xsave, XsaveArea};
use amd64::PrivLvl;

use crate::out::println;
use crate::tables::{IST_DEBUG, IST_DOUBLE_FAULT, IST_MACHINE_CHECK, IST_NMI};

/// What a fault handler decided to do about it. `DumpAndHalt` is the only arm with an
/// implementation; the enum exists so a future demand-paging resolver or instruction emulator has
/// somewhere to attach without reshaping the dispatcher again.
pub enum FaultAction {
    DumpAndHalt,
}

fn page_fault_action(_frame: &InterruptStackFrame, _err: PfErrCode, _faulting_addr: u64) -> FaultAction {
    FaultAction::DumpAndHalt
}

fn general_protection_action(_frame: &InterruptStackFrame, _err: u64) -> FaultAction {
    FaultAction::DumpAndHalt
}

fn dump_and_halt(name: &str, frame: &InterruptStackFrame, err_code: Option<u64>) -> ! {
    println!("---- unhandled {} ----", name);
    if let Some(err) = err_code {
        println!("error code: {:#x}", err);
    }
    println!("{:#x?}", frame);
    amd64::hlt_loop();
}

// EXTENDED STATE SAVE AREAS

/// One area per architectural vector (0-31); the reserved vectors never fire through a dedicated
/// handler so their slots sit unused. Exceptions can nest at most one level deep on a single core
/// (a fault inside a fault handler is a double fault, which does not itself take this path), so a
/// shared area per user vector and per reserved vector is enough.
static mut EXC_XSAVE: [XsaveArea; 32] = [XsaveArea::new(); 32];
static mut RESERVED_XSAVE: XsaveArea = XsaveArea::new();
static mut USER_XSAVE: XsaveArea = XsaveArea::new();

static XSAVE_MASK: spin::Once<u64> = spin::Once::new();

/// The set of components `xsave`/`xrstor` operate over: whatever is currently enabled in `XCR0`.
fn xsave_mask() -> u64 {
    *XSAVE_MASK.call_once(|| unsafe { xgetbv(0) })
}

unsafe fn area_for(vector: u8) -> *mut XsaveArea {
    if vector >= USER_INTERRUPTS_START {
        core::ptr::addr_of_mut!(USER_XSAVE)
    } else if RESERVED_VECTORS.contains(&vector) {
        core::ptr::addr_of_mut!(RESERVED_XSAVE)
    } else {
        core::ptr::addr_of_mut!(EXC_XSAVE[vector as usize])
    }
}

#[inline]
unsafe fn with_xstate<F: FnOnce()>(vector: u8, f: F) {
    let area = area_for(vector);
    let mask = xsave_mask();
    xsave(area, mask);
    f();
    xrstor(area, mask);
}

// ARCHITECTURAL EXCEPTION HANDLERS
//
// Each of these mirrors a minimal instance of the shape every user-vector stub below is stamped
// out from: save state, run the handler body, restore state. They're written out individually
// because each has slightly different semantics (error code or not, CR2 for page faults,
// diverging for the double fault) that don't fit the uniform user-vector template.

extern "x86-interrupt" fn divide_by_zero(frame: InterruptStackFrame) {
    unsafe { with_xstate(DIVIDE_BY_ZERO, || dump_and_halt("divide-by-zero", &frame, None)) }
}
extern "x86-interrupt" fn debug_exception(frame: InterruptStackFrame) {
    unsafe { with_xstate(DEBUG, || { println!("debug exception: {:#x?}", frame); }) }
}
extern "x86-interrupt" fn non_maskable_interrupt(frame: InterruptStackFrame) {
    unsafe { with_xstate(NON_MASKABLE_INTERRUPT, || dump_and_halt("non-maskable interrupt", &frame, None)) }
}
extern "x86-interrupt" fn breakpoint(frame: InterruptStackFrame) {
    unsafe { with_xstate(BREAKPOINT, || { println!("breakpoint: {:#x?}", frame); }) }
}
extern "x86-interrupt" fn overflow(frame: InterruptStackFrame) {
    unsafe { with_xstate(OVERFLOW, || dump_and_halt("overflow", &frame, None)) }
}
extern "x86-interrupt" fn bound_range(frame: InterruptStackFrame) {
    unsafe { with_xstate(BOUND_RANGE, || dump_and_halt("bound-range", &frame, None)) }
}
extern "x86-interrupt" fn invalid_opcode(frame: InterruptStackFrame) {
    unsafe { with_xstate(INVALID_OPCODE, || dump_and_halt("invalid opcode", &frame, None)) }
}
extern "x86-interrupt" fn device_not_available(frame: InterruptStackFrame) {
    unsafe { with_xstate(DEVICE_NOT_AVAILABLE, || dump_and_halt("device not available", &frame, None)) }
}
extern "x86-interrupt" fn double_fault(frame: InterruptStackFrame, err_code: u64) {
    unsafe { with_xstate(DOUBLE_FAULT, || dump_and_halt("double fault", &frame, Some(err_code))) }
}
extern "x86-interrupt" fn invalid_tss(frame: InterruptStackFrame, err_code: u64) {
    unsafe { with_xstate(INVALID_TSS, || dump_and_halt("invalid TSS", &frame, Some(err_code))) }
}
extern "x86-interrupt" fn segment_not_present(frame: InterruptStackFrame, err_code: u64) {
    unsafe { with_xstate(SEGMENT_NOT_PRESENT, || dump_and_halt("segment not present", &frame, Some(err_code))) }
}
extern "x86-interrupt" fn stack_fault(frame: InterruptStackFrame, err_code: u64) {
    unsafe { with_xstate(STACK_FAULT, || dump_and_halt("stack fault", &frame, Some(err_code))) }
}
extern "x86-interrupt" fn general_protection(frame: InterruptStackFrame, err_code: u64) {
    unsafe {
        with_xstate(GENERAL_PROTECTION, || {
            match general_protection_action(&frame, err_code) {
                FaultAction::DumpAndHalt => dump_and_halt("general protection fault", &frame, Some(err_code)),
            }
        })
    }
}
extern "x86-interrupt" fn page_fault(frame: InterruptStackFrame, err_code: u64) {
    unsafe {
        with_xstate(PAGE_FAULT, || {
            let faulting_addr = cr2_read() as u64;
            let flags = PfErrCode::from_bits_truncate(err_code);
            match page_fault_action(&frame, flags, faulting_addr) {
                FaultAction::DumpAndHalt => {
                    println!("page fault at {:#x}, flags {:?}", faulting_addr, flags);
                    dump_and_halt("page fault", &frame, Some(err_code))
                }
            }
        })
    }
}
extern "x86-interrupt" fn x87_floating_point(frame: InterruptStackFrame) {
    unsafe { with_xstate(X87_FLOATING_POINT, || dump_and_halt("x87 floating point", &frame, None)) }
}
extern "x86-interrupt" fn alignment_check(frame: InterruptStackFrame, err_code: u64) {
    unsafe { with_xstate(ALIGNMENT_CHECK, || dump_and_halt("alignment check", &frame, Some(err_code))) }
}
extern "x86-interrupt" fn machine_check(frame: InterruptStackFrame) -> ! {
    unsafe { with_xstate(MACHINE_CHECK, || ()) };
    dump_and_halt("machine check", &frame, None)
}
extern "x86-interrupt" fn simd_floating_point(frame: InterruptStackFrame) {
    unsafe { with_xstate(SIMD_FLOATING_POINT, || dump_and_halt("SIMD floating point", &frame, None)) }
}

/// Vectors the architecture reserves (9, 15, 20-29, 31): no dedicated semantics, wired to a
/// single generic handler per §4.E.
extern "x86-interrupt" fn reserved_vector(frame: InterruptStackFrame) {
    unsafe { with_xstate(RESERVED_VECTORS[0], || { println!("reserved vector fired: {:#x?}", frame); }) }
}

// ACPI REDIRECTION TABLE

pub type RedirectionHandler = fn(u8, usize);

#[derive(Clone, Copy)]
struct RedirectionEntry {
    handler_fn: Option<RedirectionHandler>,
    context: usize,
    claimed: bool,
}

impl RedirectionEntry {
    const fn empty() -> Self {
        RedirectionEntry { handler_fn: None, context: 0, claimed: false }
    }
}

static REDIRECTION: spin::Mutex<[RedirectionEntry; 256]> = spin::Mutex::new([RedirectionEntry::empty(); 256]);

/// Claim `vector` for `handler`, called with `(vector, context)` whenever it fires. Used by ACPI
/// interrupt-source-override/redirection-table consumers to route a GSI to its owner without the
/// dispatcher needing to know about device drivers.
pub fn register_redirection(vector: u8, handler: RedirectionHandler, context: usize) {
    let mut table = REDIRECTION.lock();
    table[vector as usize] = RedirectionEntry { handler_fn: Some(handler), context, claimed: true };
}

pub fn clear_redirection(vector: u8) {
    REDIRECTION.lock()[vector as usize] = RedirectionEntry::empty();
}

/// Vectors the legacy 8259 PIC raises spuriously on its master (39) and slave (47) lines when an
/// in-service interrupt is withdrawn before it's acknowledged. No EOI is owed for these; silently
/// dropping them is the documented-correct behaviour.
const SPURIOUS_PIC_VECTORS: [u8; 2] = [39, 47];

fn dispatch_user(vector: u8, frame: InterruptStackFrame) {
    let entry = REDIRECTION.lock()[vector as usize];
    if entry.claimed {
        if let Some(handler) = entry.handler_fn {
            handler(vector, entry.context);
            return;
        }
    }
    if SPURIOUS_PIC_VECTORS.contains(&vector) {
        return;
    }
    dump_and_halt("unhandled user interrupt", &frame, None);
}

macro_rules! define_user_stubs {
    ($($v:literal),* $(,)?) => {
        paste! {
            $(
                extern "x86-interrupt" fn [<user_stub_ $v>](frame: InterruptStackFrame) {
                    unsafe { with_xstate($v, || dispatch_user($v, frame)) }
                }
            )*

            fn user_stub_for(vector: u8) -> amd64::interrupts::Handler {
                match vector {
                    $( $v => [<user_stub_ $v>], )*
                    _ => unreachable!("vector out of user-interrupt range"),
                }
            }
        }
    };
}

define_user_stubs!(
    32, 33, 34, 35, 36, 37, 38, 39, 40, 41, 42, 43, 44, 45, 46, 47, 48, 49, 50, 51, 52, 53, 54,
    55, 56, 57, 58, 59, 60, 61, 62, 63, 64, 65, 66, 67, 68, 69, 70, 71, 72, 73, 74, 75, 76, 77,
    78, 79, 80, 81, 82, 83, 84, 85, 86, 87, 88, 89, 90, 91, 92, 93, 94, 95, 96, 97, 98, 99, 100,
    101, 102, 103, 104, 105, 106, 107, 108, 109, 110, 111, 112, 113, 114, 115, 116, 117, 118,
    119, 120, 121, 122, 123, 124, 125, 126, 127, 128, 129, 130, 131, 132, 133, 134, 135, 136,
    137, 138, 139, 140, 141, 142, 143, 144, 145, 146, 147, 148, 149, 150, 151, 152, 153, 154,
    155, 156, 157, 158, 159, 160, 161, 162, 163, 164, 165, 166, 167, 168, 169, 170, 171, 172,
    173, 174, 175, 176, 177, 178, 179, 180, 181, 182, 183, 184, 185, 186, 187, 188, 189, 190,
    191, 192, 193, 194, 195, 196, 197, 198, 199, 200, 201, 202, 203, 204, 205, 206, 207, 208,
    209, 210, 211, 212, 213, 214, 215, 216, 217, 218, 219, 220, 221, 222, 223, 224, 225, 226,
    227, 228, 229, 230, 231, 232, 233, 234, 235, 236, 237, 238, 239, 240, 241, 242, 243, 244,
    245, 246, 247, 248, 249, 250, 251, 252, 253, 254, 255,
);

/// Populate every vector of `idt`: the architectural exceptions with their dedicated handlers
/// (NMI, double fault, machine check, and debug routed onto their own IST stacks so a corrupted
/// kernel stack can't take them down too), the reserved vectors with the generic handler, and the
/// user range with its macro-stamped stubs.
pub fn install_handlers(idt: &mut InterruptDescriptorTable, code_selector: SegSel) {
    macro_rules! set {
        ($vector:expr, $handler:expr, $ist:expr) => {
            idt.set_handler(
                $vector,
                IntTrapGate::<()>::new($handler as u64, code_selector, $ist, Ssdt::InterruptGate, PrivLvl::Ring0),
            )
        };
    }

    set!(DIVIDE_BY_ZERO, divide_by_zero, 0);
    set!(DEBUG, debug_exception, IST_DEBUG);
    set!(NON_MASKABLE_INTERRUPT, non_maskable_interrupt, IST_NMI);
    set!(BREAKPOINT, breakpoint, IST_DEBUG);
    set!(OVERFLOW, overflow, 0);
    set!(BOUND_RANGE, bound_range, 0);
    set!(INVALID_OPCODE, invalid_opcode, 0);
    set!(DEVICE_NOT_AVAILABLE, device_not_available, 0);
    set!(DOUBLE_FAULT, double_fault, IST_DOUBLE_FAULT);
    set!(INVALID_TSS, invalid_tss, 0);
    set!(SEGMENT_NOT_PRESENT, segment_not_present, 0);
    set!(STACK_FAULT, stack_fault, 0);
    set!(GENERAL_PROTECTION, general_protection, 0);
    set!(PAGE_FAULT, page_fault, 0);
    set!(X87_FLOATING_POINT, x87_floating_point, 0);
    set!(ALIGNMENT_CHECK, alignment_check, 0);
    set!(MACHINE_CHECK, machine_check, IST_MACHINE_CHECK);
    set!(SIMD_FLOATING_POINT, simd_floating_point, 0);

    for &vector in RESERVED_VECTORS {
        set!(vector, reserved_vector, 0);
    }

    for vector in USER_INTERRUPTS_START..=255 {
        idt.set_handler(
            vector,
            IntTrapGate::<()>::new(user_stub_for(vector) as u64, code_selector, 0, Ssdt::InterruptGate, PrivLvl::Ring0),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spurious_pic_vectors_are_recognized() {
        assert!(SPURIOUS_PIC_VECTORS.contains(&39));
        assert!(SPURIOUS_PIC_VECTORS.contains(&47));
    }

    #[test]
    fn redirection_round_trips() {
        fn handler(_vector: u8, _ctx: usize) {}
        register_redirection(200, handler, 0xdead);
        let entry = REDIRECTION.lock()[200];
        assert!(entry.claimed);
        assert_eq!(entry.context, 0xdead);
        clear_redirection(200);
        assert!(!REDIRECTION.lock()[200].claimed);
    }
}
