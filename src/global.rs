//! Global hypervisor state (§3 "HypervisorState").
//!
//! Everything reachable from an exception handler or a pCPU's run loop
//! lives here as a `'static`: the VM arena, one [`Scheduler`] per pCPU, the
//! physical-console multiplexer, and the UART RX ring the IRQ path feeds.
//! Addressing is by [`VmId`]/[`VcpuId`] rather than pointers throughout
//! (§9 "typed arena / id indirection").

use crate::console::ConsoleMux;
use crate::platform::{MAX_SMP_CPUS, VM_NUM_MAX};
use crate::scheduler::Scheduler;
use crate::sync::SpinLock;
use crate::vm::{Vm, VmId};
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Central VM arena. Live creation/destruction is a non-goal (§1): every
/// slot is allocated once at boot and never freed.
///
/// A `Vm`'s vCPUs only ever run on the pCPU(s) their affinity mask allows
/// (§9), so two pCPUs never contend for the same `Vm` in practice — the
/// same invariant [`crate::percpu::this_cpu`] leans on for its own
/// `UnsafeCell` array. `vm`/`vm_mut` are unsafe in spirit, not in name:
/// callers must not hold a `&mut Vm` across a reschedule onto another pCPU.
pub struct HypervisorState {
    vms: UnsafeCell<[Option<Vm>; VM_NUM_MAX]>,
    vm_count: AtomicUsize,
}

unsafe impl Sync for HypervisorState {}

impl HypervisorState {
    pub const fn new() -> Self {
        const INIT: Option<Vm> = None;
        Self { vms: UnsafeCell::new([INIT; VM_NUM_MAX]), vm_count: AtomicUsize::new(0) }
    }

    /// Allocate the next free VM slot (§4.J step 1).
    pub fn alloc_vm(&self) -> Result<VmId, &'static str> {
        let idx = self.vm_count.fetch_add(1, Ordering::Relaxed);
        if idx >= VM_NUM_MAX {
            self.vm_count.fetch_sub(1, Ordering::Relaxed);
            return Err("VM arena exhausted");
        }
        let id = VmId(idx as u8);
        unsafe {
            (*self.vms.get())[idx] = Some(Vm::new(id));
        }
        Ok(id)
    }

    pub fn vm(&self, id: VmId) -> Option<&Vm> {
        unsafe { (*self.vms.get()).get(id.index())?.as_ref() }
    }

    #[allow(clippy::mut_from_ref)]
    pub fn vm_mut(&self, id: VmId) -> Option<&mut Vm> {
        unsafe { (*self.vms.get()).get_mut(id.index())?.as_mut() }
    }

    pub fn vm_count(&self) -> usize {
        self.vm_count.load(Ordering::Relaxed)
    }
}

/// The one hypervisor-wide VM arena.
pub static HYPERVISOR: HypervisorState = HypervisorState::new();

/// One [`Scheduler`] per pCPU (§4.B), indexed by `MPIDR_EL1.Aff0`
/// (`crate::percpu::current_cpu_id`).
pub static SCHEDULERS: [Scheduler; MAX_SMP_CPUS] = [
    Scheduler::new(),
    Scheduler::new(),
    Scheduler::new(),
    Scheduler::new(),
    Scheduler::new(),
    Scheduler::new(),
    Scheduler::new(),
    Scheduler::new(),
];

/// The calling pCPU's own scheduler instance.
pub fn this_scheduler() -> &'static Scheduler {
    &SCHEDULERS[crate::percpu::current_cpu_id()]
}

/// The singleton physical-console multiplexer (§4.H). Only pCPU 0 drives
/// guest output through it in the current boot flow, but a `SpinLock`
/// keeps the door open for a command-mode inspection from another pCPU.
static CONSOLE_MUX: SpinLock<ConsoleMux> = SpinLock::new(ConsoleMux::new());

pub fn with_console_mux<R>(f: impl FnOnce(&mut ConsoleMux) -> R) -> R {
    f(&mut CONSOLE_MUX.lock())
}

// ── Physical UART RX ring ────────────────────────────────────────────
// Filled by the INTID-33 IRQ path, drained by the console-owning pCPU's
// run loop before every vCPU dispatch (§4.H).

const UART_RX_RING_SIZE: usize = 64;

pub struct UartRxRing {
    buf: UnsafeCell<[u8; UART_RX_RING_SIZE]>,
    head: AtomicUsize,
    tail: AtomicUsize,
}

unsafe impl Sync for UartRxRing {}

impl UartRxRing {
    pub const fn new() -> Self {
        Self {
            buf: UnsafeCell::new([0; UART_RX_RING_SIZE]),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// Push a byte (called from the physical UART IRQ path).
    pub fn push(&self, ch: u8) {
        let tail = self.tail.load(Ordering::Relaxed);
        let next = (tail + 1) % UART_RX_RING_SIZE;
        if next == self.head.load(Ordering::Acquire) {
            return; // full, drop
        }
        unsafe {
            (*self.buf.get())[tail] = ch;
        }
        self.tail.store(next, Ordering::Release);
    }

    /// Pop a byte (called from the run loop).
    pub fn pop(&self) -> Option<u8> {
        let head = self.head.load(Ordering::Relaxed);
        if head == self.tail.load(Ordering::Acquire) {
            return None; // empty
        }
        let ch = unsafe { (*self.buf.get())[head] };
        self.head.store((head + 1) % UART_RX_RING_SIZE, Ordering::Release);
        Some(ch)
    }
}

pub static UART_RX: UartRxRing = UartRxRing::new();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_vm_assigns_sequential_ids() {
        let state = HypervisorState::new();
        let a = state.alloc_vm().unwrap();
        let b = state.alloc_vm().unwrap();
        assert_eq!(a, VmId(0));
        assert_eq!(b, VmId(1));
        assert!(state.vm(a).is_some());
    }

    #[test]
    fn alloc_vm_exhausts_after_vm_num_max() {
        let state = HypervisorState::new();
        for _ in 0..VM_NUM_MAX {
            state.alloc_vm().unwrap();
        }
        assert!(state.alloc_vm().is_err());
    }

    #[test]
    fn uart_rx_ring_fifo_order() {
        let ring = UartRxRing::new();
        ring.push(b'a');
        ring.push(b'b');
        assert_eq!(ring.pop(), Some(b'a'));
        assert_eq!(ring.pop(), Some(b'b'));
        assert_eq!(ring.pop(), None);
    }
}
