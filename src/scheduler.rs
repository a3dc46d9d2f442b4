//! Per-pCPU vCPU scheduler (§4.B).
//!
//! One [`Scheduler`] instance lives per pCPU in [`crate::global`]'s
//! `PerCpu<Scheduler>` array; a vCPU only ever sits in the runqueue of the
//! pCPU(s) its affinity mask allows, so the common path (tick, schedule,
//! requeue) touches only the calling pCPU's own instance. Cross-pCPU
//! wakeups (PSCI `CPU_ON` targeting another pCPU, a blocked vCPU becoming
//! ready from a remote vGIC injection) go through [`Scheduler::wakeup`],
//! which takes a lock and sends an `IPI_SCHED` SGI to pull the target pCPU
//! out of its idle `wfi`.

use crate::platform::{IPI_SCHED, MAX_VCPUS, VM_NUM_MAX};
use crate::sync::SpinLock;
use crate::vcpu::VcpuId;
use crate::vm::VmId;

/// Total vCPU slots across every VM — the fixed upper bound on how many
/// tasks could simultaneously occupy one pCPU's ready/sleep lists.
const TASK_CAPACITY: usize = VM_NUM_MAX * MAX_VCPUS;

/// One vCPU, addressed the same way the rest of the hypervisor does: by
/// arena indices rather than a pointer (§9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskRef {
    pub vm: VmId,
    pub vcpu: VcpuId,
}

#[derive(Clone, Copy)]
struct SleepEntry {
    task: TaskRef,
    wake_tick: u64,
}

struct SchedulerState {
    ready: [Option<TaskRef>; TASK_CAPACITY],
    ready_head: usize,
    ready_len: usize,
    sleep: [Option<SleepEntry>; TASK_CAPACITY],
    sleep_len: usize,
    current: Option<TaskRef>,
}

impl SchedulerState {
    const fn new() -> Self {
        const NONE_TASK: Option<TaskRef> = None;
        const NONE_SLEEP: Option<SleepEntry> = None;
        Self {
            ready: [NONE_TASK; TASK_CAPACITY],
            ready_head: 0,
            ready_len: 0,
            sleep: [NONE_SLEEP; TASK_CAPACITY],
            sleep_len: 0,
            current: None,
        }
    }

    fn push_ready_tail(&mut self, task: TaskRef) {
        if self.ready_len == TASK_CAPACITY {
            return; // every slot already represented; nothing to do
        }
        let tail = (self.ready_head + self.ready_len) % TASK_CAPACITY;
        self.ready[tail] = Some(task);
        self.ready_len += 1;
    }

    fn push_ready_head(&mut self, task: TaskRef) {
        if self.ready_len == TASK_CAPACITY {
            return;
        }
        self.ready_head = (self.ready_head + TASK_CAPACITY - 1) % TASK_CAPACITY;
        self.ready[self.ready_head] = Some(task);
        self.ready_len += 1;
    }

    fn pop_ready(&mut self) -> Option<TaskRef> {
        if self.ready_len == 0 {
            return None;
        }
        let task = self.ready[self.ready_head].take();
        self.ready_head = (self.ready_head + 1) % TASK_CAPACITY;
        self.ready_len -= 1;
        task
    }
}

/// A per-pCPU runqueue: ready FIFO, a sleep list ordered only by linear
/// scan (bounded by `TASK_CAPACITY`, never large enough to need a heap),
/// and the task presently dispatched.
pub struct Scheduler {
    inner: SpinLock<SchedulerState>,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self { inner: SpinLock::new(SchedulerState::new()) }
    }

    /// Enqueue at the tail — the common case for a task that just became
    /// ready (quantum expiry, wakeup from sleep).
    pub fn add_to_ready_tail(&self, task: TaskRef) {
        self.inner.lock().push_ready_tail(task);
    }

    /// Enqueue at the head — used when a task should be redispatched with
    /// minimum latency (e.g. a vCPU that just had a virtual interrupt
    /// injected while `WaitIrq`).
    pub fn add_to_ready_head(&self, task: TaskRef) {
        self.inner.lock().push_ready_head(task);
    }

    pub fn remove_from_ready(&self) -> Option<TaskRef> {
        self.inner.lock().pop_ready()
    }

    /// Park `task` until `wake_tick` (§4.B sleep list). Used for a vCPU
    /// blocked on `WaitIrq` with no deadline-free wake condition, or any
    /// future timed block.
    pub fn set_sleep(&self, task: TaskRef, wake_tick: u64) {
        let mut state = self.inner.lock();
        if state.sleep_len < TASK_CAPACITY {
            let idx = state.sleep_len;
            state.sleep[idx] = Some(SleepEntry { task, wake_tick });
            state.sleep_len += 1;
        }
    }

    /// Move every sleeper whose `wake_tick` has arrived back onto the ready
    /// tail. Called from the per-pCPU timer tick (§4.G `v_timer_tick`).
    pub fn wake_sleepers(&self, now: u64) -> usize {
        let mut state = self.inner.lock();
        let mut woken = 0;
        let mut i = 0;
        while i < state.sleep_len {
            let due = state.sleep[i].map(|e| e.wake_tick <= now).unwrap_or(false);
            if due {
                let task = state.sleep[i].take().unwrap().task;
                state.sleep_len -= 1;
                state.sleep.swap(i, state.sleep_len);
                state.push_ready_tail(task);
                woken += 1;
            } else {
                i += 1;
            }
        }
        woken
    }

    /// Cross-pCPU wakeup: enqueue onto *this* scheduler (which belongs to
    /// `target_pcpu`) and, unless we are already running on that pCPU,
    /// send it `IPI_SCHED` so it breaks out of `wfi` and re-runs
    /// `schedule()`.
    pub fn wakeup_remote(&self, task: TaskRef, target_pcpu: usize) {
        self.add_to_ready_tail(task);
        if target_pcpu != crate::percpu::current_cpu_id() {
            crate::arch::aarch64::peripherals::gic::GICD.send_sgi(IPI_SCHED, 1u8 << target_pcpu);
        }
    }

    /// Pick the next task to dispatch, popping it off the ready queue and
    /// recording it as current. `None` means go idle.
    pub fn schedule(&self) -> Option<TaskRef> {
        let mut state = self.inner.lock();
        let next = state.pop_ready();
        state.current = next;
        next
    }

    pub fn current(&self) -> Option<TaskRef> {
        self.inner.lock().current
    }

    pub fn set_current(&self, task: Option<TaskRef>) {
        self.inner.lock().current = task;
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(vm: u8, vcpu: u8) -> TaskRef {
        TaskRef { vm: VmId(vm), vcpu: VcpuId(vcpu) }
    }

    #[test]
    fn fifo_order_preserved() {
        let s = Scheduler::new();
        s.add_to_ready_tail(t(0, 0));
        s.add_to_ready_tail(t(0, 1));
        assert_eq!(s.schedule(), Some(t(0, 0)));
        assert_eq!(s.schedule(), Some(t(0, 1)));
        assert_eq!(s.schedule(), None);
    }

    #[test]
    fn head_insert_jumps_the_queue() {
        let s = Scheduler::new();
        s.add_to_ready_tail(t(0, 0));
        s.add_to_ready_head(t(0, 1));
        assert_eq!(s.schedule(), Some(t(0, 1)));
        assert_eq!(s.schedule(), Some(t(0, 0)));
    }

    #[test]
    fn sleepers_wake_only_once_due() {
        let s = Scheduler::new();
        s.set_sleep(t(0, 2), 100);
        assert_eq!(s.wake_sleepers(50), 0);
        assert_eq!(s.wake_sleepers(100), 1);
        assert_eq!(s.schedule(), Some(t(0, 2)));
        assert_eq!(s.wake_sleepers(200), 0); // already moved, not re-woken
    }

    #[test]
    fn current_tracks_schedule_result() {
        let s = Scheduler::new();
        s.add_to_ready_tail(t(1, 0));
        assert_eq!(s.current(), None);
        s.schedule();
        assert_eq!(s.current(), Some(t(1, 0)));
    }
}
