//! CPU register context for cooperative thread switching.
//!
//! Only the callee-saved registers need to survive a switch: the System V
//! calling convention already guarantees the caller-saved registers (rax,
//! rcx, rdx, rsi, rdi, r8-r11) are dead across any `call`, and
//! [`context_switch`] is itself only ever reached through a `call`.

use core::arch::naked_asm;

/// Saved callee-saved register set for one thread.
///
/// Field order and byte offsets are load-bearing — [`context_switch`]
/// addresses them directly by offset from the struct base, not by name.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Context {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub rsp: u64,
}

impl Context {
    /// A context with every register zeroed.
    ///
    /// Used for a freshly created thread: every callee-saved register
    /// except `rsp` is irrelevant on first entry (the trampoline never
    /// reads them), and `rsp` is overwritten by the caller right after.
    pub const fn zeroed() -> Self {
        Self {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            rbx: 0,
            rbp: 0,
            rsp: 0,
        }
    }
}

/// Switches CPU context from `old` to `new`.
///
/// Saves the current callee-saved registers (including `rsp`) into `*old`,
/// then loads the same registers from `*new` and returns — which, because
/// `rsp` now points into the new thread's stack, actually returns into
/// wherever that thread's stack says to return to (either back into a
/// previous `context_switch` call, or into [`thread_trampoline`] on a
/// thread's first run).
///
/// # Safety
/// `old` must be writable and `new` must hold a previously-saved or
/// freshly-initialized context whose `rsp` points at a valid stack.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(old: *mut Context, new: *const Context) {
    naked_asm!(
        "mov [rdi + 0x00], r15",
        "mov [rdi + 0x08], r14",
        "mov [rdi + 0x10], r13",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], rbx",
        "mov [rdi + 0x28], rbp",
        "mov [rdi + 0x30], rsp",
        "mov r15, [rsi + 0x00]",
        "mov r14, [rsi + 0x08]",
        "mov r13, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov rbx, [rsi + 0x20]",
        "mov rbp, [rsi + 0x28]",
        "mov rsp, [rsi + 0x30]",
        "ret",
    );
}
