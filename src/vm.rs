//! Virtual machine container (§3 "Vm", §4.J).
//!
//! A `Vm` owns everything scoped to one guest image: its vCPU arena, its
//! vGIC distributor shadow, its vTimer offset, and its vPL011. Stage-2
//! translation itself is an external collaborator (§1 Non-goals) — this
//! type only tracks the virtual-device state a trap needs to emulate
//! against, addressed by [`VmId`] rather than a pointer (§9).

use crate::platform::{MAX_VCPUS, PRIMARY_VCPU_PCPU_MASK, SECONDARY_VCPU_PCPU_MASK};
use crate::vcpu::{Vcpu, VcpuId};
use crate::vgic::VGicDistributor;
use crate::vpl011::VPl011;
use crate::vtimer::VTimerVm;

/// Index of a VM within [`crate::global::HypervisorState`]'s fixed arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmId(pub u8);

impl VmId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// `Uninitialized → Ready → Running`; `Stopped` is terminal (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Uninitialized,
    Ready,
    Running,
    Stopped,
}

pub struct Vm {
    id: VmId,
    state: VmState,
    vcpus: [Option<Vcpu>; MAX_VCPUS],
    vcpu_count: usize,
    vgic_distributor: VGicDistributor,
    vtimer_vm: VTimerVm,
    uart: VPl011,
}

impl Vm {
    pub const fn new(id: VmId) -> Self {
        const INIT: Option<Vcpu> = None;
        Self {
            id,
            state: VmState::Uninitialized,
            vcpus: [INIT; MAX_VCPUS],
            vcpu_count: 0,
            vgic_distributor: VGicDistributor::new(),
            vtimer_vm: VTimerVm::new(),
            uart: VPl011::new(),
        }
    }

    pub fn id(&self) -> VmId {
        self.id
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    pub fn set_state(&mut self, state: VmState) {
        self.state = state;
    }

    pub fn vcpu_count(&self) -> usize {
        self.vcpu_count
    }

    /// Fix `CNTVOFF` at the physical counter value observed at creation, so
    /// the guest's virtual counter starts at 0 (§4.G, §4.J step 3).
    pub fn init_timer(&mut self, cntpct_at_boot: u64) {
        self.vtimer_vm.init(cntpct_at_boot);
    }

    /// Create and arm the primary vCPU (index 0), pinned to pCPU 0 (§4.J
    /// step 2). Every other slot is reserved in `Create` state so a later
    /// `PSCI_CPU_ON` has somewhere to land (§4.I).
    pub fn create_vcpus(&mut self, entry: u64, stack_pointer: u64, context_id: u64) -> VcpuId {
        let primary = VcpuId(0);
        let mut vcpu = Vcpu::new_uninitialized(primary, self.id, PRIMARY_VCPU_PCPU_MASK);
        vcpu.arm(entry, stack_pointer, context_id);
        self.vcpus[0] = Some(vcpu);

        for i in 1..MAX_VCPUS {
            self.vcpus[i] =
                Some(Vcpu::new_uninitialized(VcpuId(i as u8), self.id, SECONDARY_VCPU_PCPU_MASK));
        }
        self.vcpu_count = MAX_VCPUS;
        self.state = VmState::Ready;
        primary
    }

    pub fn vcpu(&self, id: VcpuId) -> Option<&Vcpu> {
        self.vcpus.get(id.index())?.as_ref()
    }

    pub fn vcpu_mut(&mut self, id: VcpuId) -> Option<&mut Vcpu> {
        self.vcpus.get_mut(id.index())?.as_mut()
    }

    /// `PSCI_CPU_ON`'s `is_vcpu_already_on` predicate (§4.I): `false` for a
    /// reserved-but-never-armed slot or one that has since stopped.
    pub fn is_vcpu_already_on(&self, target_cpu: u64) -> bool {
        let idx = (target_cpu & 0xFF) as usize;
        self.vcpus.get(idx).and_then(|v| v.as_ref()).map(|v| v.is_on()).unwrap_or(false)
    }

    /// Arm the vCPU targeted by a `PSCI_CPU_ON` call (§4.I `WakeVcpu`
    /// outcome). Returns the armed vCPU's id so the caller can enqueue it
    /// on the right pCPU's scheduler.
    pub fn wake_vcpu(&mut self, target_cpu: u64, entry: u64, context_id: u64) -> Option<VcpuId> {
        let idx = (target_cpu & 0xFF) as usize;
        let vcpu = self.vcpus.get_mut(idx)?.as_mut()?;
        vcpu.arm(entry, 0, context_id);
        Some(vcpu.id())
    }

    /// Split into the trapping vCPU plus the VM-shared devices it needs
    /// concurrent access to. A plain `vcpu_mut` followed by
    /// `vgic_distributor_mut`/`uart_mut` would borrow the whole `Vm` twice;
    /// destructuring distinct fields of the same `&mut self` here is the one
    /// way the borrow checker accepts both at once (§9 "typed arena / id
    /// indirection" — the fields, not a lock, are what make this disjoint).
    pub fn split_for_trap(
        &mut self,
        id: VcpuId,
    ) -> Option<(&mut Vcpu, &mut VGicDistributor, &mut VPl011, &mut VTimerVm)> {
        let vcpu = self.vcpus.get_mut(id.index())?.as_mut()?;
        Some((vcpu, &mut self.vgic_distributor, &mut self.uart, &mut self.vtimer_vm))
    }

    pub fn vgic_distributor(&self) -> &VGicDistributor {
        &self.vgic_distributor
    }

    pub fn vgic_distributor_mut(&mut self) -> &mut VGicDistributor {
        &mut self.vgic_distributor
    }

    pub fn vtimer_vm(&self) -> &VTimerVm {
        &self.vtimer_vm
    }

    pub fn vtimer_vm_mut(&mut self) -> &mut VTimerVm {
        &mut self.vtimer_vm
    }

    pub fn uart(&self) -> &VPl011 {
        &self.uart
    }

    pub fn uart_mut(&mut self) -> &mut VPl011 {
        &mut self.uart
    }
}

impl core::fmt::Debug for Vm {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Vm")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("vcpu_count", &self.vcpu_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_vcpus_arms_primary_and_reserves_rest() {
        let mut vm = Vm::new(VmId(0));
        let primary = vm.create_vcpus(0x4800_0000, 0x9000_0000, 0);
        assert_eq!(primary, VcpuId(0));
        assert!(vm.vcpu(VcpuId(0)).unwrap().is_on());
        assert!(!vm.vcpu(VcpuId(1)).unwrap().is_on());
        assert_eq!(vm.vcpu_count(), MAX_VCPUS);
    }

    #[test]
    fn wake_vcpu_arms_reserved_slot() {
        let mut vm = Vm::new(VmId(0));
        vm.create_vcpus(0x1000, 0x2000, 0);
        assert!(!vm.is_vcpu_already_on(1));
        let woken = vm.wake_vcpu(1, 0x4000_1000, 0x55);
        assert_eq!(woken, Some(VcpuId(1)));
        assert!(vm.is_vcpu_already_on(1));
        assert_eq!(vm.vcpu(VcpuId(1)).unwrap().context().get_gpr(0), 0x55);
    }

    #[test]
    fn waking_already_on_vcpu_is_reported() {
        let mut vm = Vm::new(VmId(0));
        vm.create_vcpus(0x1000, 0x2000, 0);
        vm.wake_vcpu(1, 0x4000_1000, 0);
        assert!(vm.is_vcpu_already_on(1));
    }

    #[test]
    fn out_of_range_target_is_rejected_not_already_on() {
        let vm = Vm::new(VmId(0));
        assert!(!vm.is_vcpu_already_on(99));
    }
}
