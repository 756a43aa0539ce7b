// =============================================================================
// MinimalOS NextGen — Kernel Synchronization Primitives
// =============================================================================
//
// There's no std here, so no std::sync — this module is the kernel's own
// mutual-exclusion primitive.
//
// This kernel is single-CPU and cooperative (spec's scheduling model):
// kernel code never runs concurrently with itself, only ever interleaved
// with an ISR on the same core. That means `SpinLock` never actually spins
// against another holder in practice — its real job is making the
// PMM bitmap, block cache, scheduler run queue, AHCI port/disk state, and
// the IDT handler table safe to touch from both ordinary kernel code and
// an interrupt handler without the handler deadlocking against itself.
// See `spinlock.rs` for how disabling interrupts before taking the lock
// makes that safe even when acquired from inside an ISR.
//
// None of these locks nest with each other today (each subsystem owns one
// lock covering its own state), so there's no cross-lock ordering rule to
// maintain. If that changes, document the order here before it bites.
// =============================================================================

pub mod spinlock;

