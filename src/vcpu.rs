//! vCPU / task model (§3 "vCPU", §4.C).
//!
//! A `Vcpu` is the scheduler's unit of work: one [`VcpuContext`] trap frame
//! plus the per-vCPU slice of virtual device state (`VGicCpu`, `VTimerCpu`)
//! that travels with it across a context switch. It never stores a pointer
//! back to its owning [`crate::vm::Vm`] — only the [`crate::vm::VmId`] it
//! was created under, resolved through `HypervisorState::vm`/`vm_mut` on
//! every access (§9 "Typed arena / id indirection").

use crate::arch::aarch64::VcpuContext;
use crate::vgic::VGicCpu;
use crate::vm::VmId;
use crate::vtimer::VTimerCpu;

/// Index of a vCPU within its owning VM's fixed arena. `Copy`, never a
/// pointer or long-lived reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VcpuId(pub u8);

impl VcpuId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// `Create → Ready → Running → {Waiting | WaitIrq} → Ready` (§3).
///
/// `Waiting` covers a PSCI `CPU_ON` target that hasn't been woken yet;
/// `WaitIrq` covers a vCPU parked on WFI until an IRQ makes it ready again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuState {
    Create,
    Ready,
    Running,
    Waiting,
    WaitIrq,
    Stopped,
}

pub struct Vcpu {
    id: VcpuId,
    vm: VmId,
    state: VcpuState,
    context: VcpuContext,
    vgic_cpu: VGicCpu,
    vtimer_cpu: VTimerCpu,
    /// Bitmask of pCPUs this vCPU may run on (§9 "affinity as a bitmask").
    affinity: u8,
    /// Ticks left in the current quantum; refilled to `SYS_TASK_TICK` on
    /// every dispatch.
    quantum_left: u32,
}

impl Vcpu {
    /// `Create` state: allocated but not yet given an entry point. Used for
    /// arena slots reserved for a `PSCI_CPU_ON` target that hasn't fired
    /// yet.
    pub fn new_uninitialized(id: VcpuId, vm: VmId, affinity: u8) -> Self {
        Self {
            id,
            vm,
            state: VcpuState::Create,
            context: VcpuContext::new(0, 0),
            vgic_cpu: VGicCpu::new(id.index()),
            vtimer_cpu: VTimerCpu::new(),
            affinity,
            quantum_left: crate::platform::SYS_TASK_TICK,
        }
    }

    /// Program an entry point/stack and move to `Ready` — used both for the
    /// primary vCPU at VM creation and for a secondary vCPU woken by
    /// `PSCI_CPU_ON` (§4.I's `WakeVcpu` outcome).
    pub fn arm(&mut self, entry: u64, stack_pointer: u64, context_id: u64) {
        self.context = VcpuContext::new(entry, stack_pointer);
        self.context.set_gpr(0, context_id);
        self.quantum_left = crate::platform::SYS_TASK_TICK;
        self.state = VcpuState::Ready;
    }

    pub fn id(&self) -> VcpuId {
        self.id
    }

    pub fn vm(&self) -> VmId {
        self.vm
    }

    pub fn state(&self) -> VcpuState {
        self.state
    }

    pub fn set_state(&mut self, state: VcpuState) {
        self.state = state;
    }

    pub fn affinity(&self) -> u8 {
        self.affinity
    }

    /// `false` in `Create`/`Stopped` — i.e. what `PSCI_CPU_ON`'s
    /// `is_vcpu_already_on` predicate should report.
    pub fn is_on(&self) -> bool {
        !matches!(self.state, VcpuState::Create | VcpuState::Stopped)
    }

    pub fn context(&self) -> &VcpuContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut VcpuContext {
        &mut self.context
    }

    pub fn vgic_cpu(&self) -> &VGicCpu {
        &self.vgic_cpu
    }

    pub fn vgic_cpu_mut(&mut self) -> &mut VGicCpu {
        &mut self.vgic_cpu
    }

    pub fn vtimer_cpu_mut(&mut self) -> &mut VTimerCpu {
        &mut self.vtimer_cpu
    }

    /// `MPIDR_EL1` as this vCPU's guest would read it, synthesized rather
    /// than stored: bit 31 set (single-threaded, Aff0 only) with the
    /// vCPU's arena index in Aff0 (§3 "mpidr_el1").
    pub fn mpidr_el1(&self) -> u64 {
        (1u64 << 31) | self.id.index() as u64
    }

    /// Decrement the current quantum; `true` once it has run out (§4.B).
    pub fn tick_quantum(&mut self) -> bool {
        self.quantum_left = self.quantum_left.saturating_sub(1);
        self.quantum_left == 0
    }

    pub fn refill_quantum(&mut self) {
        self.quantum_left = crate::platform::SYS_TASK_TICK;
    }
}

impl core::fmt::Debug for Vcpu {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Vcpu")
            .field("id", &self.id)
            .field("vm", &self.vm)
            .field("state", &self.state)
            .field("affinity", &self.affinity)
            .finish()
    }
}
