// Cooperative process scheduling: priority-indexed linked lists of processes
// hanging off the ProcessorScheduler object, semaphores with excess-signal
// counters, and the transfer protocol that the interpreter honors at the top of
// its loop. All list surgery runs with object freeing suspended, because links
// being moved between lists transiently drop to a zero count.

use crate::interpreter::Interpreter;
use crate::oops::{Oop, UNUSED};
use std::time::{Duration, Instant};

// Link and linked-list layout.
pub const NEXT_LINK_INDEX: usize = 0;
pub const FIRST_LINK_INDEX: usize = 0;
pub const LAST_LINK_INDEX: usize = 1;

// Semaphore: a linked list plus a signal counter.
pub const EXCESS_SIGNALS_INDEX: usize = 2;

// Process: a link plus context, priority and owning list.
pub const SUSPENDED_CONTEXT_INDEX: usize = 1;
pub const PRIORITY_INDEX: usize = 2;
pub const MY_LIST_INDEX: usize = 3;

// ProcessorScheduler.
pub const PROCESS_LISTS_INDEX: usize = 0;
pub const ACTIVE_PROCESS_INDEX: usize = 1;

/// Switch-rate burst above which the interpreter naps: only a yield spin gets
/// anywhere near this many voluntary switches per window.
const THROTTLE_BURST: u32 = 64;
const THROTTLE_WINDOW: Duration = Duration::from_millis(10);

pub(crate) struct SwitchGovernor {
    window_start: Instant,
    burst: u32,
}

impl SwitchGovernor {
    pub fn new() -> Self {
        SwitchGovernor { window_start: Instant::now(), burst: 0 }
    }

    /// Notes one voluntary process switch; true means the loop should doze.
    pub fn note_switch(&mut self) -> bool {
        if self.window_start.elapsed() > THROTTLE_WINDOW {
            self.window_start = Instant::now();
            self.burst = 0;
            return false;
        }
        self.burst += 1;
        if self.burst >= THROTTLE_BURST {
            self.window_start = Instant::now();
            self.burst = 0;
            return true;
        }
        false
    }
}

impl Interpreter {
    /// The process that is conceptually running: a pending transfer target takes
    /// precedence over what the scheduler object still records.
    pub(crate) fn active_process(&self) -> Oop {
        if let Some(process) = self.new_process {
            process
        } else {
            let scheduler = self.scheduler_pointer();
            self.memory.fetch_pointer(ACTIVE_PROCESS_INDEX, scheduler)
        }
    }

    fn is_empty_list(&self, list: Oop) -> bool {
        self.memory.fetch_pointer(FIRST_LINK_INDEX, list) == self.memory.wk.nil
    }

    fn remove_first_link_of_list(&mut self, list: Oop) -> Oop {
        let nil = self.memory.wk.nil;
        let first = self.memory.fetch_pointer(FIRST_LINK_INDEX, list);
        let last = self.memory.fetch_pointer(LAST_LINK_INDEX, list);
        if first == last {
            self.memory.store_pointer(FIRST_LINK_INDEX, list, nil);
            self.memory.store_pointer(LAST_LINK_INDEX, list, nil);
        } else {
            let next = self.memory.fetch_pointer(NEXT_LINK_INDEX, first);
            self.memory.store_pointer(FIRST_LINK_INDEX, list, next);
        }
        self.memory.store_pointer(NEXT_LINK_INDEX, first, nil);
        self.memory.store_pointer(MY_LIST_INDEX, first, nil);
        first
    }

    fn add_last_link_to_list(&mut self, link: Oop, list: Oop) {
        if self.is_empty_list(list) {
            self.memory.store_pointer(FIRST_LINK_INDEX, list, link);
        } else {
            let last = self.memory.fetch_pointer(LAST_LINK_INDEX, list);
            self.memory.store_pointer(NEXT_LINK_INDEX, last, link);
        }
        self.memory.store_pointer(LAST_LINK_INDEX, list, link);
        self.memory.store_pointer(MY_LIST_INDEX, link, list);
    }

    fn priority_of(&self, process: Oop) -> usize {
        let priority = self.memory.fetch_pointer(PRIORITY_INDEX, process);
        self.memory.integer_value_of(priority) as usize
    }

    /// Dequeues the ready process of maximum priority, or None when every run
    /// queue is empty and the machine should wait on the host.
    fn wake_highest_priority(&mut self) -> Option<Oop> {
        let scheduler = self.scheduler_pointer();
        let lists = self.memory.fetch_pointer(PROCESS_LISTS_INDEX, scheduler);
        let count = self.memory.word_length_of(lists);
        for priority in (0..count).rev() {
            let list = self.memory.fetch_pointer(priority, lists);
            if !self.is_empty_list(list) {
                return Some(self.remove_first_link_of_list(list));
            }
        }
        None
    }

    fn sleep_process(&mut self, process: Oop) {
        let scheduler = self.scheduler_pointer();
        let lists = self.memory.fetch_pointer(PROCESS_LISTS_INDEX, scheduler);
        let priority = self.priority_of(process);
        let list = self.memory.fetch_pointer(priority - 1, lists);
        self.add_last_link_to_list(process, list);
    }

    /// Requests a switch; it takes effect at the next top-of-loop check. The
    /// target is held with an extra count until the scheduler object takes it.
    pub(crate) fn transfer_to(&mut self, process: Oop) {
        self.memory.increment_count(process);
        if let Some(previous) = self.new_process.replace(process) {
            self.memory.decrement_count(previous);
        }
        self.stalled = false;
    }

    pub(crate) fn release_transfer_hold(&mut self, process: Oop) {
        self.memory.decrement_count(process);
    }

    pub(crate) fn synchronous_signal(&mut self, semaphore: Oop) {
        self.memory.suspend_freeing();
        if self.is_empty_list(semaphore) {
            let excess = self
                .memory
                .integer_value_of(self.memory.fetch_pointer(EXCESS_SIGNALS_INDEX, semaphore));
            let bumped = self.memory.integer_object_of(excess + 1);
            self.memory.store_pointer(EXCESS_SIGNALS_INDEX, semaphore, bumped);
        } else {
            let process = self.remove_first_link_of_list(semaphore);
            self.resume_process(process);
        }
        self.memory.resume_freeing();
    }

    pub(crate) fn wait_on(&mut self, semaphore: Oop) {
        self.memory.suspend_freeing();
        let excess = self
            .memory
            .integer_value_of(self.memory.fetch_pointer(EXCESS_SIGNALS_INDEX, semaphore));
        if excess > 0 {
            let lowered = self.memory.integer_object_of(excess - 1);
            self.memory.store_pointer(EXCESS_SIGNALS_INDEX, semaphore, lowered);
        } else {
            let process = self.active_process();
            self.add_last_link_to_list(process, semaphore);
            self.suspend_active();
        }
        self.memory.resume_freeing();
    }

    pub(crate) fn resume_process(&mut self, process: Oop) {
        if self.stalled {
            // Nothing is running; whatever the scheduler object still records as
            // active is blocked and must not be re-queued.
            self.transfer_to(process);
            return;
        }
        let active = self.active_process();
        if self.priority_of(process) > self.priority_of(active) {
            self.sleep_process(active);
            self.transfer_to(process);
        } else {
            self.sleep_process(process);
        }
    }

    pub(crate) fn suspend_active(&mut self) {
        match self.wake_highest_priority() {
            Some(process) => self.transfer_to(process),
            None => self.stalled = true,
        }
    }

    // --- tick timer ---------------------------------------------------------

    /// Arms the one-shot tick semaphore; installing a new pair cancels any prior
    /// pending one (the dropped guard aborts the host timer).
    pub(crate) fn signal_at_tick(&mut self, semaphore: Oop, tick: u32) {
        self.pending_tick = None;
        self.tick_sequence += 1;
        if semaphore == self.memory.wk.nil || semaphore == UNUSED {
            self.tick_semaphore = UNUSED;
            return;
        }
        self.tick_semaphore = semaphore;
        let now = self.millisecond_clock();
        // The clock wraps at 32 bits; a signed difference sorts out deadlines on
        // either side of the wrap, and past deadlines fire immediately.
        let delta = tick.wrapping_sub(now) as i32;
        let delay = if delta < 0 { 0 } else { delta as i64 };
        let sequence = self.tick_sequence;
        let tx = self.host_tx.clone();
        let guard = self
            .timer
            .schedule_with_delay(chrono::Duration::milliseconds(delay), move || {
                let _ = tx.send(crate::display::HostMessage::TickFired(sequence));
            });
        self.pending_tick = Some(guard);
    }
}
