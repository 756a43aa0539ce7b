// =============================================================================
// MinimalOS NextGen — Ticket Spinlock
// =============================================================================
//
// This kernel is single-CPU and cooperative — no two threads ever actually
// run at once, so there's no real contention for this lock to arbitrate.
// What it does guard against is an ISR: the timer tick, a keyboard IRQ, or
// any other interrupt can fire while kernel code is in the middle of
// touching shared state (the PMM bitmap, the scheduler's run queue, the
// block cache, ...), and that handler might want to touch the same state.
// Without protection, that's a straightforward corruption bug, not a
// multi-core race — but the fix looks the same: disable interrupts for
// the duration of the critical section.
//
// HOW IT WORKS:
//   - Two counters: `next_ticket` and `now_serving`
//   - To lock: atomically increment `next_ticket`, get your ticket number.
//     Spin until `now_serving` equals your ticket.
//   - To unlock: increment `now_serving`, which lets the next waiter proceed.
//
// On a single core this spin loop is essentially never taken — the ticket
// you're handed is always the one currently being served, because nothing
// else could have advanced `next_ticket` between your fetch_add and your
// first load. The ticket structure is kept anyway: it's what makes the
// interrupts-off discipline below airtight (see IRQ SAFETY), and it's the
// same shape this lock would need if a second core ever showed up.
//
// IRQ SAFETY:
//   Acquiring a spinlock disables interrupts first. Otherwise:
//     1. Kernel code holds lock L with interrupts enabled
//     2. An interrupt fires
//     3. Its handler tries to acquire lock L
//     4. DEADLOCK — the handler spins forever because the holder can't run
//        again (it's been pre-empted by the very handler waiting on it)
//        until that handler returns
//
//   We save the previous interrupt state (RFLAGS.IF) so we can restore it
//   exactly on unlock — nested lock/unlock pairs work correctly, and a
//   lock taken from inside an ISR (where IF is already 0) is a no-op on
//   both ends.
//
// =============================================================================

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

/// A ticket-based spinlock that disables interrupts while held.
///
/// Protects kernel data that ordinary code and an interrupt handler might
/// both touch — there's only one core here, so the thing this guards
/// against is reentrancy through an ISR, not a second thread running in
/// parallel.
///
/// # Type Parameter
/// - `T`: The data protected by the lock. Must be `Send` — nothing about a
///   single-core kernel requires this, but it keeps the type honest about
///   what it would take to run on more than one core later.
///
/// # Examples
/// ```
/// static COUNTER: SpinLock<u64> = SpinLock::new(0);
///
/// // In some kernel function:
/// {
///     let mut guard = COUNTER.lock();
///     *guard += 1;
/// } // Lock automatically released when guard goes out of scope
/// ```
pub struct SpinLock<T> {
    /// The next ticket to be dispensed (atomically incremented by each locker).
    next_ticket: AtomicU32,

    /// The ticket number currently being served (incremented on unlock).
    now_serving: AtomicU32,

    /// The protected data. UnsafeCell is required because we mutate through
    /// a shared reference (the lock ensures exclusive access at runtime).
    data: UnsafeCell<T>,
}

// SAFETY: SpinLock<T> can be shared (`Sync`) as long as T is `Send` — the
// lock itself ensures only the current holder ever accesses the data.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new spinlock wrapping the given value.
    ///
    /// The lock is initially unlocked (next_ticket == now_serving == 0).
    /// This is a const fn so spinlocks can be used in statics:
    /// ```
    /// static MY_LOCK: SpinLock<Vec<u8>> = SpinLock::new(Vec::new());
    /// ```
    pub const fn new(value: T) -> Self {
        Self {
            next_ticket: AtomicU32::new(0),
            now_serving: AtomicU32::new(0),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, disabling interrupts for the duration.
    ///
    /// Returns a `SpinLockGuard` that provides `Deref`/`DerefMut` access
    /// to the protected data. The lock is automatically released (and
    /// interrupts restored) when the guard is dropped.
    ///
    /// The spin loop below only actually iterates if this kernel ever
    /// grows a second core; today the ticket handed out is always the one
    /// already being served.
    ///
    /// # Interrupt Safety
    /// Interrupts are disabled BEFORE attempting to acquire the lock.
    /// The previous interrupt state is saved and restored on unlock.
    /// This means:
    ///   - If interrupts were enabled → they're disabled during lock, re-enabled on unlock
    ///   - If interrupts were already disabled → they stay disabled after unlock
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        // Step 1: Save current interrupt state and disable interrupts.
        // We read RFLAGS to check if IF (Interrupt Flag, bit 9) is set.
        let irq_was_enabled = interrupts_enabled();
        disable_interrupts();

        // Step 2: Take a ticket number atomically.
        // Relaxed ordering is fine here — the spin loop below provides
        // the necessary synchronization barrier.
        let my_ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);

        // Step 3: Spin until our ticket is being served.
        // Acquire ordering ensures we see all writes made by the previous
        // lock holder before we access the protected data.
        while self.now_serving.load(Ordering::Acquire) != my_ticket {
            // Hints the CPU we're in a spin loop — harmless here since the
            // loop body never actually runs on a single core, but it's the
            // right thing to reach for on principle.
            core::hint::spin_loop();
        }

        // Step 4: Lock acquired! Return the guard.
        SpinLockGuard {
            lock: self,
            irq_was_enabled,
        }
    }

    /// Attempts to acquire the lock without spinning.
    ///
    /// Returns `Some(guard)` if the lock was immediately available, or
    /// `None` if it's currently held.
    ///
    /// Useful from a context where spinning would deadlock: if the code
    /// you just interrupted holds this lock, `lock()` would spin forever
    /// waiting for a holder that can't run again until you return.
    /// `try_lock` fails immediately instead.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        let irq_was_enabled = interrupts_enabled();
        disable_interrupts();

        let current = self.now_serving.load(Ordering::Relaxed);
        // Try to atomically take the next ticket, but only if it equals
        // the currently-served ticket (meaning the lock is free).
        let result = self.next_ticket.compare_exchange(
            current,
            current + 1,
            Ordering::Acquire,
            Ordering::Relaxed,
        );

        match result {
            Ok(_) => Some(SpinLockGuard {
                lock: self,
                irq_was_enabled,
            }),
            Err(_) => {
                // Lock is held — restore interrupt state and fail.
                if irq_was_enabled {
                    enable_interrupts();
                }
                None
            }
        }
    }

    /// Returns a mutable reference to the underlying data.
    ///
    /// This is safe because `&mut self` guarantees exclusive access at
    /// compile time — no lock needed. Useful before a static's lock is
    /// ever reachable from anywhere else, e.g. during its own `init()`.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

/// RAII guard for a held spinlock.
///
/// While this guard exists:
///   - The holder has exclusive access to the protected data
///   - Interrupts are disabled
///
/// When the guard is dropped (goes out of scope, or explicitly via `drop()`):
///   - The lock is released (now_serving incremented)
///   - Interrupts are restored to their previous state
///
/// This follows the RAII pattern — you can never forget to unlock because
/// the compiler ensures `drop()` is called.
pub struct SpinLockGuard<'a, T> {
    /// Reference to the lock we're guarding.
    lock: &'a SpinLock<T>,

    /// Whether interrupts were enabled before we acquired the lock.
    /// Used to restore the correct state on unlock.
    irq_was_enabled: bool,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    /// Provides read access to the protected data.
    fn deref(&self) -> &T {
        // SAFETY: holding the guard means interrupts are off and no other
        // holder exists, so this is the only live reference to the data.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    /// Provides write access to the protected data.
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: see `deref` above.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    /// Releases the lock and restores the previous interrupt state.
    ///
    /// This increments `now_serving`, which allows the next waiter
    /// (with the next ticket number) to proceed.
    fn drop(&mut self) {
        // Release ordering ensures all our writes to the protected data
        // are visible to the next lock holder before they see the
        // incremented `now_serving` value.
        self.lock.now_serving.fetch_add(1, Ordering::Release);

        // Restore interrupt state. If interrupts were enabled before
        // we took the lock, re-enable them now.
        if self.irq_was_enabled {
            enable_interrupts();
        }
    }
}

// =============================================================================
// Interrupt state management
// =============================================================================
//
// These functions directly manipulate the x86_64 RFLAGS register to
// control interrupts. They compile down to single instructions (STI/CLI)
// with no function call overhead in release builds.
// =============================================================================

/// Checks whether interrupts are currently enabled.
///
/// Reads the RFLAGS register and checks bit 9 (IF — Interrupt Flag).
/// When IF is set, the CPU will respond to maskable external interrupts.
#[inline(always)]
fn interrupts_enabled() -> bool {
    let rflags: u64;
    // SAFETY: Reading RFLAGS is always safe — it's a read-only observation
    // of the current CPU state. The `pushfq` instruction pushes RFLAGS
    // onto the stack, and we pop it into our variable.
    unsafe {
        core::arch::asm!(
            "pushfq",      // Push RFLAGS onto stack
            "pop {}",      // Pop into our variable
            out(reg) rflags,
            options(nomem, preserves_flags)
        );
    }
    // Bit 9 is the Interrupt Flag (IF)
    rflags & (1 << 9) != 0
}

/// Disables maskable interrupts.
///
/// Executes the CLI (Clear Interrupt Flag) instruction.
/// After this, the CPU will not respond to maskable interrupts (NMI and
/// machine checks can still fire).
#[inline(always)]
fn disable_interrupts() {
    // SAFETY: Disabling interrupts is safe in kernel code.
    // We always re-enable them when dropping the SpinLockGuard.
    unsafe {
        core::arch::asm!("cli", options(nomem, nostack));
    }
}

/// Enables maskable interrupts.
///
/// Executes the STI (Set Interrupt Flag) instruction.
/// After this, the CPU will respond to maskable interrupts again.
/// Note: the CPU guarantees that the instruction AFTER STI executes
/// before any pending interrupt is delivered.
#[inline(always)]
fn enable_interrupts() {
    // SAFETY: Re-enabling interrupts is safe — we only do this when
    // restoring the previous state after releasing a lock.
    unsafe {
        core::arch::asm!("sti", options(nomem, nostack));
    }
}
