//! GDT, TSS, and IDT construction and installation.
//!
//! A minimal five-slot GDT (null, 64-bit code, 64-bit data, double-slot TSS) plus a TSS carrying
//! four dedicated Interrupt Stack Table entries, and a 256-entry IDT whose vectors are wired up
//! by [`crate::dispatch::install_handlers`].

use core::arch::asm;
use core::mem::MaybeUninit;

use amd64::interrupts::InterruptDescriptorTable;
use amd64::segmentation::{self, CodeSegDesc, DataSegDesc, SegSel, SysSegDesc, TaskStateSeg};
use amd64::interrupts::Ssdt;
use amd64::PrivLvl;

pub const CODE_SELECTOR: SegSel = SegSel::new_gdt(PrivLvl::Ring0, 1);
pub const DATA_SELECTOR: SegSel = SegSel::new_gdt(PrivLvl::Ring0, 2);
pub const TSS_SELECTOR: SegSel = SegSel::new_gdt(PrivLvl::Ring0, 3);

const IST_STACK_SIZE: usize = 4096;

/// IST vector/slot assignment: the four exceptions whose handlers must never share a stack with
/// whatever was running when they fired.
pub const IST_NMI: u8 = 1;
pub const IST_DOUBLE_FAULT: u8 = 2;
pub const IST_MACHINE_CHECK: u8 = 3;
pub const IST_DEBUG: u8 = 4;

#[repr(C, align(16))]
struct IstStack([u8; IST_STACK_SIZE]);

static NMI_STACK: IstStack = IstStack([0; IST_STACK_SIZE]);
static DOUBLE_FAULT_STACK: IstStack = IstStack([0; IST_STACK_SIZE]);
static MACHINE_CHECK_STACK: IstStack = IstStack([0; IST_STACK_SIZE]);
static DEBUG_STACK: IstStack = IstStack([0; IST_STACK_SIZE]);

static mut GDT: [u64; 5] = [0; 5];
static mut TSS: MaybeUninit<TaskStateSeg> = MaybeUninit::uninit();
static mut IDT: MaybeUninit<InterruptDescriptorTable> = MaybeUninit::uninit();

fn ist_top(stack: &IstStack) -> *mut u8 {
    unsafe { stack.0.as_ptr().add(IST_STACK_SIZE) as *mut u8 }
}

/// Build and install the GDT, TSS, and IDT, then reload every segment register. Must run once,
/// early in bring-up, after the page-table identity map is not yet required (the tables
/// themselves live at their firmware-handed-off physical addresses, which are still identity
/// accessible before paging is rebuilt).
pub fn init() {
    unsafe {
        TSS.write(TaskStateSeg::new(
            [core::ptr::null_mut(); 3],
            [
                ist_top(&NMI_STACK),
                ist_top(&DOUBLE_FAULT_STACK),
                ist_top(&MACHINE_CHECK_STACK),
                ist_top(&DEBUG_STACK),
                core::ptr::null_mut(),
                core::ptr::null_mut(),
                core::ptr::null_mut(),
            ],
        ));

        GDT[0] = 0;
        GDT[1] = CodeSegDesc::default().bits();
        GDT[2] = DataSegDesc::default().bits();

        let tss_desc = SysSegDesc::new(TSS.as_mut_ptr() as *mut u8, TaskStateSeg::LIMIT, Ssdt::AvlTss, PrivLvl::Ring0, false);
        let [lo, hi] = tss_desc.to_bits();
        GDT[3] = lo;
        GDT[4] = hi;

        segmentation::lgdt_raw((GDT.len() * 8 - 1) as u16, GDT.as_mut_ptr());

        reload_data_segments(DATA_SELECTOR);
        segmentation::cs_write(CODE_SELECTOR);
        segmentation::ltr(TSS_SELECTOR);

        IDT.write(InterruptDescriptorTable::missing());
        crate::dispatch::install_handlers(IDT.assume_init_mut(), CODE_SELECTOR);
        amd64::interrupts::lidt(IDT.as_ptr());
    }
}

unsafe fn reload_data_segments(selector: SegSel) {
    let sel = selector.to_bits();
    asm!(
        "mov ds, {0:x}",
        "mov es, {0:x}",
        "mov ss, {0:x}",
        "mov fs, {0:x}",
        "mov gs, {0:x}",
        in(reg) sel,
        options(nostack, preserves_flags),
    );
}
