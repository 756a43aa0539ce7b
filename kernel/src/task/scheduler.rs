//! Cooperative round-robin thread scheduler.
//!
//! There is no preemption here in the usual sense: the timer tick only sets
//! a flag (see [`on_tick`]) and the actual switch happens the next time
//! somebody calls [`yield_now`]. On a single CPU with no preemptive
//! scheduling (a deliberate non-goal), this is enough — a thread that never
//! yields simply starves everything else, which is a property of the
//! threads this kernel runs, not a scheduler bug.

use core::arch::asm;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use log::{debug, trace};

use crate::arch::context::{context_switch, Context};
use crate::arch::cpu;
use crate::memory::address::PhysAddr;
use crate::memory::pmm;
use crate::sync::spinlock::SpinLock;

/// Fixed thread table size. Matches the original kernel's `MAX_THREADS`;
/// comfortably above the spec's N≥8 floor.
pub const MAX_THREADS: usize = 16;

/// Kernel stack size handed to every thread created via [`spawn`].
const DEFAULT_STACK_PAGES: usize = 4;
const STACK_SIZE: u64 = DEFAULT_STACK_PAGES as u64 * 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Unused,
    Ready,
    Running,
    Blocked,
    Dead,
}

#[derive(Clone, Copy)]
struct Thread {
    state: ThreadState,
    context: Context,
    entry: Option<fn(usize)>,
    arg: usize,
    stack_base: PhysAddr,
    stack_pages: usize,
    priority: u8,
    name: &'static str,
}

impl Thread {
    const fn unused() -> Self {
        Self {
            state: ThreadState::Unused,
            context: Context::zeroed(),
            entry: None,
            arg: 0,
            stack_base: PhysAddr::zero(),
            stack_pages: 0,
            priority: 0,
            name: "",
        }
    }
}

struct SchedulerState {
    threads: [Thread; MAX_THREADS],
    initialized: bool,
}

static SCHEDULER: SpinLock<SchedulerState> = SpinLock::new(SchedulerState {
    threads: [Thread::unused(); MAX_THREADS],
    initialized: false,
});

/// Slot index of the thread currently executing.
static CURRENT: AtomicUsize = AtomicUsize::new(0);

/// Set by [`on_tick`], consumed and cleared by [`yield_now`].
static RESCHEDULE_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Bootstraps the scheduler, adopting whoever is calling this as thread 0.
///
/// Must be called exactly once, after the heap and PMM are up but before
/// interrupts are unmasked (so [`on_tick`] never fires before slot 0
/// exists).
pub fn init() {
    let mut sched = SCHEDULER.lock();
    assert!(!sched.initialized, "scheduler: init called more than once");

    sched.threads[0] = Thread {
        state: ThreadState::Running,
        context: Context::zeroed(),
        entry: None,
        arg: 0,
        stack_base: PhysAddr::zero(),
        stack_pages: 0,
        priority: 0,
        name: "bootstrap",
    };
    sched.initialized = true;
    CURRENT.store(0, Ordering::SeqCst);
}

fn allocate_slot(sched: &SchedulerState) -> Option<usize> {
    sched.threads.iter().position(|t| t.state == ThreadState::Unused)
}

/// Creates a new thread, allocating it a kernel stack and placing it in the
/// `Ready` state. Returns the slot index assigned, or `None` if the thread
/// table is full or the stack allocation fails.
pub fn spawn(name: &'static str, entry: fn(usize), arg: usize, priority: u8) -> Option<usize> {
    let mut sched = SCHEDULER.lock();
    let slot = allocate_slot(&sched)?;

    let stack_phys = pmm::alloc_contiguous(DEFAULT_STACK_PAGES)?;
    let stack_top = stack_phys.to_virt().as_u64() + STACK_SIZE;

    // Place the trampoline's address at the very top of the stack so that
    // `context_switch`'s closing `ret` jumps straight into it the first
    // time this thread runs.
    let ret_slot = (stack_top - 8) as *mut u64;
    unsafe {
        ret_slot.write(thread_trampoline as usize as u64);
    }

    let mut context = Context::zeroed();
    context.rsp = stack_top - 8;

    sched.threads[slot] = Thread {
        state: ThreadState::Ready,
        context,
        entry: Some(entry),
        arg,
        stack_base: stack_phys,
        stack_pages: DEFAULT_STACK_PAGES,
        priority,
        name,
    };

    debug!("[sched] created thread '{}' in slot {}", name, slot);
    Some(slot)
}

/// Finds the next `Ready` thread after `current`, scanning round-robin.
/// Returns `current` itself if nothing else is runnable.
fn next_runnable(sched: &SchedulerState, current: usize) -> usize {
    for step in 1..=MAX_THREADS {
        let idx = (current + step) % MAX_THREADS;
        if sched.threads[idx].state == ThreadState::Ready {
            return idx;
        }
    }
    current
}

/// Called from the timer interrupt handler. Does *not* switch threads —
/// IRQ context is the wrong place for that (we'd be switching away from
/// whatever the interrupted thread's IDT/TSS bookkeeping expects). It only
/// requests that the next [`yield_now`] actually switch, even if the
/// current thread would otherwise be the only runnable one.
pub fn on_tick() {
    RESCHEDULE_REQUESTED.store(true, Ordering::SeqCst);
}

/// Cooperatively yields the CPU to the next runnable thread.
///
/// No-op if nothing else is `Ready` and no tick requested a reschedule.
/// Interrupts are disabled for the duration of picking the next thread and
/// flipping states, then re-enabled just before the actual context switch —
/// the switch itself doesn't need to run with interrupts masked, and the
/// thread being switched to may depend on them being on.
pub fn yield_now() {
    unsafe {
        asm!("cli", options(nomem, nostack, preserves_flags));
    }

    let current = CURRENT.load(Ordering::SeqCst);
    let switch = {
        let mut sched = SCHEDULER.lock();
        let next = next_runnable(&sched, current);
        let requested = RESCHEDULE_REQUESTED.swap(false, Ordering::SeqCst);

        if !requested && next == current {
            None
        } else {
            if sched.threads[current].state == ThreadState::Running {
                sched.threads[current].state = ThreadState::Ready;
            }
            sched.threads[next].state = ThreadState::Running;
            CURRENT.store(next, Ordering::SeqCst);
            trace!("[sched] yield: slot {} -> slot {}", current, next);

            let old_ctx: *mut Context = &mut sched.threads[current].context;
            let new_ctx: *const Context = &sched.threads[next].context;
            Some((old_ctx, new_ctx))
        }
    };

    unsafe {
        asm!("sti", options(nomem, nostack, preserves_flags));
    }

    if let Some((old_ctx, new_ctx)) = switch {
        unsafe {
            context_switch(old_ctx, new_ctx);
        }
    }
}

/// Entry point every new thread's stack is rigged to jump into. Runs the
/// thread's actual entry function, marks the slot `Dead` on return, and
/// yields away — a dead thread is never selected by [`next_runnable`]
/// again, so this never gets scheduled back in.
extern "C" fn thread_trampoline() -> ! {
    let idx = CURRENT.load(Ordering::SeqCst);
    let (entry, arg, name) = {
        let sched = SCHEDULER.lock();
        let t = &sched.threads[idx];
        (t.entry, t.arg, t.name)
    };

    if let Some(entry) = entry {
        entry(arg);
    }

    debug!("[sched] thread '{}' (slot {}) exited", name, idx);
    {
        let mut sched = SCHEDULER.lock();
        sched.threads[idx].state = ThreadState::Dead;
    }

    yield_now();

    // Reachable only if every other thread also finished; nothing left to
    // switch to, so just halt.
    loop {
        cpu::halt();
    }
}

/// Slot index of the thread currently running.
pub fn current_id() -> usize {
    CURRENT.load(Ordering::SeqCst)
}

/// Number of thread slots not in the `Unused` state.
pub fn thread_count() -> usize {
    SCHEDULER
        .lock()
        .threads
        .iter()
        .filter(|t| t.state != ThreadState::Unused)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_runnable_wraps_round_robin() {
        let mut sched = SchedulerState {
            threads: [Thread::unused(); MAX_THREADS],
            initialized: true,
        };
        sched.threads[0].state = ThreadState::Running;
        sched.threads[3].state = ThreadState::Ready;
        assert_eq!(next_runnable(&sched, 0), 3);
        assert_eq!(next_runnable(&sched, 3), 3);
    }

    #[test]
    fn next_runnable_falls_back_to_current_when_alone() {
        let mut sched = SchedulerState {
            threads: [Thread::unused(); MAX_THREADS],
            initialized: true,
        };
        sched.threads[2].state = ThreadState::Running;
        assert_eq!(next_runnable(&sched, 2), 2);
    }
}
