//! IDT initialization and management.

use crate::arch::gdt::Gdt;
use crate::arch::idt::{Idt, EntryOptions, GateType, PrivilegeLevel};
use crate::arch::tss::Tss;
use core::sync::atomic::{AtomicPtr, Ordering};
use spin::Once;

use super::handlers;

/// Global IDT instance.
static IDT: Once<Idt> = Once::new();

/// Global TSS instance.
static TSS: Once<Tss> = Once::new();

/// Global GDT instance.
static GDT: Once<Gdt> = Once::new();

/// Raw pointer to the TSS, set after init, for dynamic RSP0 updates.
static TSS_PTR: AtomicPtr<Tss> = AtomicPtr::new(core::ptr::null_mut());

/// Every vector with a naked stub (see `traps::handlers::stub_addr`).
/// Everything else in the IDT is left `missing()`.
const STUBBED_VECTORS: [u8; 50] = [
	0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25,
	26, 27, 28, 29, 30, 31, 32, 33, 34, 35, 36, 37, 38, 39, 40, 41, 42, 43, 44, 45, 46, 47, 48,
	128,
];

/// Initialize the GDT, TSS, and IDT.
///
/// This sets up:
/// 1. TSS with IST1 pointing to a dedicated double fault stack
/// 2. GDT with kernel code, kernel data, and TSS descriptors
/// 3. IDT entries for every stubbed vector, routed through the naked
///    trampoline in `traps::handlers`
pub fn init_idt() {
	// Initialize TSS with IST stacks
	let tss_ref = TSS.call_once(|| {
		let mut tss = Tss::new();
		tss.init();
		tss
	});

	// Store raw pointer for dynamic RSP0 updates during context switch.
	TSS_PTR.store(tss_ref as *const Tss as *mut Tss, Ordering::Relaxed);

	// Initialize GDT with TSS descriptor
	let (gdt, selectors) = Gdt::new(tss_ref);
	let gdt_ref = GDT.call_once(|| gdt);

	// Load GDT and set segment registers
	unsafe {
		gdt_ref.load(&selectors);
	}
	log::debug!("GDT loaded (CS=0x{:04x}, DS=0x{:04x}, TSS=0x{:04x})",
		selectors.kernel_code, selectors.kernel_data, selectors.tss);

	let mut idt = Idt::new();
	let cs = selectors.kernel_code;

	let default_options = EntryOptions::new()
		.set_present(true)
		.set_gate_type(GateType::Interrupt);

	for &vector in STUBBED_VECTORS.iter() {
		let addr = handlers::stub_addr(vector).expect("vector is in STUBBED_VECTORS");
		let mut options = if vector == 8 {
			default_options.set_stack_index(handlers::DOUBLE_FAULT_IST_INDEX)
		} else {
			default_options
		};
		// Vector 128 (0x80) is the legacy software-interrupt syscall gate —
		// it must be reachable with an `int 0x80` from ring 3, so it's the
		// one entry that isn't DPL=0.
		if vector == 128 {
			options = options.set_privilege_level(PrivilegeLevel::Ring3);
		}
		idt.set_handler(vector, addr, cs, options);
	}

	handlers::register(3, handlers::breakpoint_handler);
	handlers::register(8, handlers::double_fault_handler);
	handlers::register(14, handlers::page_fault_handler);
	handlers::register(khal::apic::TIMER_VECTOR, handlers::timer_handler);
	handlers::register(khal::keyboard::KEYBOARD_VECTOR, handlers::keyboard_handler);
	handlers::register(khal::apic::SPURIOUS_VECTOR, handlers::spurious_handler);

	// Load IDT
	let idt_ref = IDT.call_once(|| idt);
	idt_ref.load();
}

/// Get a reference to the global IDT.
#[allow(dead_code)]
pub fn get_idt() -> Option<&'static Idt> {
	IDT.get()
}

/// Get a raw mutable pointer to the TSS (for dynamic RSP0 updates).
pub fn tss_ptr() -> *mut Tss {
	TSS_PTR.load(Ordering::Relaxed)
}
