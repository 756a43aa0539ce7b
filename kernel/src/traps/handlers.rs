//! Interrupt and exception dispatch.
//!
//! Every vector 0-48 and 128 gets its own tiny naked stub (see
//! [`stub_addr`]) that normalizes the hardware stack frame and jumps into
//! [`interrupt_trampoline`], which saves every general-purpose register,
//! calls [`dispatch_interrupt`], restores, and `iretq`s. Dispatch itself is
//! an ordinary Rust function — only the prologue/epilogue need raw asm.
//!
//! Handlers are registered into a 256-slot table behind a [`SpinLock`]; an
//! unregistered vector falls back to [`default_handler`]. Acquiring that
//! lock from inside an ISR is safe: the interrupt gate already cleared IF
//! before this code runs, so `SpinLock::lock()` observes interrupts already
//! disabled, its own `cli` is a no-op, and the guard's `Drop` restores IF to
//! the same disabled state it found — it can never re-enable interrupts
//! mid-handler.

use core::sync::atomic::{AtomicBool, Ordering};

use log::{error, trace, warn};

use crate::arch::cpu;
use crate::sync::spinlock::SpinLock;
use crate::task::scheduler;

/// IST index reserved for the double fault handler's stack (see
/// [`crate::arch::tss`]).
pub const DOUBLE_FAULT_IST_INDEX: u8 = 1;

/// Register state captured by [`interrupt_trampoline`] before it calls
/// [`dispatch_interrupt`].
///
/// Field order matches the trampoline's push order exactly (`rax` ends up
/// closest to `rsp`, `rflags` farthest) — this is a view onto the stack,
/// not a free-standing value, so reordering these fields without touching
/// the asm corrupts every handler.
#[repr(C)]
#[derive(Debug)]
pub struct InterruptFrame {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub vector: u64,
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
}

pub type HandlerFn = fn(&mut InterruptFrame);

const NO_HANDLER: Option<HandlerFn> = None;
static HANDLERS: SpinLock<[Option<HandlerFn>; 256]> = SpinLock::new([NO_HANDLER; 256]);

/// Whether the Local APIC is up; decides how [`dispatch_interrupt`] sends
/// EOI for vectors in the remapped IRQ range. Set once, after `init_idt`'s
/// caller probes `khal::apic::is_present()`.
static APIC_ACTIVE: AtomicBool = AtomicBool::new(false);

pub fn set_apic_active(active: bool) {
    APIC_ACTIVE.store(active, Ordering::Relaxed);
}

/// Registers `handler` for `vector`, replacing whatever was there before.
pub fn register(vector: u8, handler: HandlerFn) {
    HANDLERS.lock()[vector as usize] = Some(handler);
}

/// Called by [`interrupt_trampoline`] with `rdi` pointing at the frame it
/// just built on the interrupted thread's own stack.
///
/// # Safety
/// Must only be reached via the trampoline, with `frame` pointing at a
/// live, properly laid-out `InterruptFrame` on the current stack.
unsafe extern "C" fn dispatch_interrupt(frame: *mut InterruptFrame) {
    let frame = &mut *frame;
    let vector = frame.vector as u8;

    let handler = HANDLERS.lock()[vector as usize];
    match handler {
        Some(h) => h(frame),
        None => default_handler(frame),
    }

    // IRQ range: 32-47 after the PIC remap in khal::pic. Exceptions (<32)
    // and the spurious/test vector (128, 0xFF) never need EOI.
    if (32..=47).contains(&vector) {
        if APIC_ACTIVE.load(Ordering::Relaxed) {
            khal::apic::eoi();
        } else {
            khal::pic::eoi(vector);
        }
    }
}

/// Exception names by vector, Intel SDM vol. 3 chapter 6.15. Unassigned
/// vectors in the 0-31 range get a generic label.
const EXCEPTION_NAMES: [&str; 32] = [
    "Division By Zero",
    "Debug",
    "Non-Maskable Interrupt",
    "Breakpoint",
    "Overflow",
    "Bound Range Exceeded",
    "Invalid Opcode",
    "Device Not Available",
    "Double Fault",
    "Coprocessor Segment Overrun",
    "Invalid TSS",
    "Segment Not Present",
    "Stack-Segment Fault",
    "General Protection Fault",
    "Page Fault",
    "Reserved",
    "x87 Floating-Point Exception",
    "Alignment Check",
    "Machine Check",
    "SIMD Floating-Point Exception",
    "Virtualization Exception",
    "Control Protection Exception",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Hypervisor Injection Exception",
    "VMM Communication Exception",
    "Security Exception",
    "Reserved",
];

/// Unified panic path for every CPU exception (vector < 32), reached either
/// by falling through `default_handler` or directly from one of the named
/// handlers below. Logs the exception name plus the frame and CR2, then
/// halts with interrupts disabled forever.
fn panic_exception(frame: &InterruptFrame) -> ! {
    let vector = frame.vector as usize;
    let name = EXCEPTION_NAMES
        .get(vector)
        .copied()
        .unwrap_or("Unknown Exception");
    let cr2 = cpu::read_cr2();
    error!(
        "{} (vector {}): rip={:#x}, error_code={:#x}, cr2={:#x}",
        name, vector, frame.rip, frame.error_code, cr2
    );
    cpu::halt_forever();
}

fn default_handler(frame: &mut InterruptFrame) {
    let vector = frame.vector;
    if vector < 32 {
        panic_exception(frame);
    }
    warn!("unhandled interrupt vector {}", vector);
}

pub fn breakpoint_handler(frame: &mut InterruptFrame) {
    log::info!("breakpoint exception at rip={:#x}", frame.rip);
}

pub fn double_fault_handler(frame: &mut InterruptFrame) {
    panic_exception(frame);
}

pub fn page_fault_handler(frame: &mut InterruptFrame) {
    panic_exception(frame);
}

pub fn timer_handler(_frame: &mut InterruptFrame) {
    scheduler::on_tick();
}

pub fn spurious_handler(_frame: &mut InterruptFrame) {
    trace!("spurious interrupt");
}

pub fn keyboard_handler(_frame: &mut InterruptFrame) {
    let scancode = khal::keyboard::read_scancode();
    let event = khal::keyboard::decode(scancode);
    trace!("keyboard: {:?} {:?}", event.state, event.key);
}

/// Address of the naked stub for `vector`, or `None` outside the stubbed
/// range (0-48, 128).
pub fn stub_addr(vector: u8) -> Option<usize> {
    stub_table(vector)
}

/// Defines one naked stub per vector. Vectors that carry a real hardware
/// error code (8, 10-14, 17, 21, 29, 30) jump straight to the trampoline;
/// every other vector pushes a dummy zero first so [`InterruptFrame`] has a
/// uniform layout regardless of which vector fired. A naked function's body
/// must be a single asm block, so the choice between the two forms has to
/// happen here at macro-expansion time, not with a runtime branch inside
/// the stub.
macro_rules! define_stub {
    ($name:ident, $v:literal, err) => {
        #[unsafe(naked)]
        unsafe extern "C" fn $name() -> ! {
            core::arch::naked_asm!(
                "push {v}",
                "jmp {trampoline}",
                v = const $v,
                trampoline = sym interrupt_trampoline,
            )
        }
    };
    ($name:ident, $v:literal, noerr) => {
        #[unsafe(naked)]
        unsafe extern "C" fn $name() -> ! {
            core::arch::naked_asm!(
                "push 0",
                "push {v}",
                "jmp {trampoline}",
                v = const $v,
                trampoline = sym interrupt_trampoline,
            )
        }
    };
}

define_stub!(stub_0, 0, noerr);
define_stub!(stub_1, 1, noerr);
define_stub!(stub_2, 2, noerr);
define_stub!(stub_3, 3, noerr);
define_stub!(stub_4, 4, noerr);
define_stub!(stub_5, 5, noerr);
define_stub!(stub_6, 6, noerr);
define_stub!(stub_7, 7, noerr);
define_stub!(stub_8, 8, err);
define_stub!(stub_9, 9, noerr);
define_stub!(stub_10, 10, err);
define_stub!(stub_11, 11, err);
define_stub!(stub_12, 12, err);
define_stub!(stub_13, 13, err);
define_stub!(stub_14, 14, err);
define_stub!(stub_15, 15, noerr);
define_stub!(stub_16, 16, noerr);
define_stub!(stub_17, 17, err);
define_stub!(stub_18, 18, noerr);
define_stub!(stub_19, 19, noerr);
define_stub!(stub_20, 20, noerr);
define_stub!(stub_21, 21, err);
define_stub!(stub_22, 22, noerr);
define_stub!(stub_23, 23, noerr);
define_stub!(stub_24, 24, noerr);
define_stub!(stub_25, 25, noerr);
define_stub!(stub_26, 26, noerr);
define_stub!(stub_27, 27, noerr);
define_stub!(stub_28, 28, noerr);
define_stub!(stub_29, 29, err);
define_stub!(stub_30, 30, err);
define_stub!(stub_31, 31, noerr);
define_stub!(stub_32, 32, noerr);
define_stub!(stub_33, 33, noerr);
define_stub!(stub_34, 34, noerr);
define_stub!(stub_35, 35, noerr);
define_stub!(stub_36, 36, noerr);
define_stub!(stub_37, 37, noerr);
define_stub!(stub_38, 38, noerr);
define_stub!(stub_39, 39, noerr);
define_stub!(stub_40, 40, noerr);
define_stub!(stub_41, 41, noerr);
define_stub!(stub_42, 42, noerr);
define_stub!(stub_43, 43, noerr);
define_stub!(stub_44, 44, noerr);
define_stub!(stub_45, 45, noerr);
define_stub!(stub_46, 46, noerr);
define_stub!(stub_47, 47, noerr);
define_stub!(stub_48, 48, noerr);
define_stub!(stub_128, 128, noerr);

fn stub_table(vector: u8) -> Option<usize> {
    match vector {
        0 => Some(stub_0 as usize),
        1 => Some(stub_1 as usize),
        2 => Some(stub_2 as usize),
        3 => Some(stub_3 as usize),
        4 => Some(stub_4 as usize),
        5 => Some(stub_5 as usize),
        6 => Some(stub_6 as usize),
        7 => Some(stub_7 as usize),
        8 => Some(stub_8 as usize),
        9 => Some(stub_9 as usize),
        10 => Some(stub_10 as usize),
        11 => Some(stub_11 as usize),
        12 => Some(stub_12 as usize),
        13 => Some(stub_13 as usize),
        14 => Some(stub_14 as usize),
        15 => Some(stub_15 as usize),
        16 => Some(stub_16 as usize),
        17 => Some(stub_17 as usize),
        18 => Some(stub_18 as usize),
        19 => Some(stub_19 as usize),
        20 => Some(stub_20 as usize),
        21 => Some(stub_21 as usize),
        22 => Some(stub_22 as usize),
        23 => Some(stub_23 as usize),
        24 => Some(stub_24 as usize),
        25 => Some(stub_25 as usize),
        26 => Some(stub_26 as usize),
        27 => Some(stub_27 as usize),
        28 => Some(stub_28 as usize),
        29 => Some(stub_29 as usize),
        30 => Some(stub_30 as usize),
        31 => Some(stub_31 as usize),
        32 => Some(stub_32 as usize),
        33 => Some(stub_33 as usize),
        34 => Some(stub_34 as usize),
        35 => Some(stub_35 as usize),
        36 => Some(stub_36 as usize),
        37 => Some(stub_37 as usize),
        38 => Some(stub_38 as usize),
        39 => Some(stub_39 as usize),
        40 => Some(stub_40 as usize),
        41 => Some(stub_41 as usize),
        42 => Some(stub_42 as usize),
        43 => Some(stub_43 as usize),
        44 => Some(stub_44 as usize),
        45 => Some(stub_45 as usize),
        46 => Some(stub_46 as usize),
        47 => Some(stub_47 as usize),
        48 => Some(stub_48 as usize),
        128 => Some(stub_128 as usize),
        _ => None,
    }
}

/// Common landing pad for every stub: saves all GPRs in [`InterruptFrame`]
/// order, calls [`dispatch_interrupt`], restores, and returns from the
/// interrupt.
#[unsafe(naked)]
unsafe extern "C" fn interrupt_trampoline() -> ! {
    core::arch::naked_asm!(
        "push r15",
        "push r14",
        "push r13",
        "push r12",
        "push r11",
        "push r10",
        "push r9",
        "push r8",
        "push rbp",
        "push rdi",
        "push rsi",
        "push rdx",
        "push rcx",
        "push rbx",
        "push rax",
        "mov rdi, rsp",
        "call {dispatch}",
        "pop rax",
        "pop rbx",
        "pop rcx",
        "pop rdx",
        "pop rsi",
        "pop rdi",
        "pop rbp",
        "pop r8",
        "pop r9",
        "pop r10",
        "pop r11",
        "pop r12",
        "pop r13",
        "pop r14",
        "pop r15",
        "add rsp, 16",
        "iretq",
        dispatch = sym dispatch_interrupt,
    );
}
