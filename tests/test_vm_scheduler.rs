//! VM + Scheduler integration tests
//!
//! A `Vm`'s vCPUs carry their own quantum and run state; a `Scheduler`
//! only ever sees them as `TaskRef`s. These tests exercise the two
//! together the way the per-pCPU run loop does: schedule a task, run its
//! quantum down, requeue it, and park/wake across a vCPU going `WaitIrq`.

use hypervisor::scheduler::{Scheduler, TaskRef};
use hypervisor::uart_puts;
use hypervisor::vcpu::{VcpuId, VcpuState};
use hypervisor::vm::{Vm, VmId};

pub fn run_vm_scheduler_test() {
    uart_puts(b"\n========================================\n");
    uart_puts(b"  VM Scheduler Integration Test\n");
    uart_puts(b"========================================\n\n");

    let mut vm = Vm::new(VmId(0));
    vm.create_vcpus(0x4800_0000, 0x9000_0000, 0);
    vm.wake_vcpu(1, 0x4800_1000, 0);

    let t0 = TaskRef { vm: VmId(0), vcpu: VcpuId(0) };
    let t1 = TaskRef { vm: VmId(0), vcpu: VcpuId(1) };

    // Test 1: both ready vCPUs dispatch in FIFO order
    uart_puts(b"[VM SCHED] Test 1: dispatch order...\n");
    let sched = Scheduler::new();
    sched.add_to_ready_tail(t0);
    sched.add_to_ready_tail(t1);
    if sched.schedule() != Some(t0) {
        uart_puts(b"[VM SCHED] ERROR: first schedule should be vCPU 0\n");
        return;
    }
    uart_puts(b"[VM SCHED] Test 1 PASSED\n\n");

    // Test 2: quantum expiry requeues the running vCPU to the tail
    uart_puts(b"[VM SCHED] Test 2: quantum expiry requeues...\n");
    let v0 = vm.vcpu_mut(VcpuId(0)).unwrap();
    let mut expired = false;
    for _ in 0..hypervisor::platform::SYS_TASK_TICK {
        expired = v0.tick_quantum();
    }
    if !expired {
        uart_puts(b"[VM SCHED] ERROR: quantum should have expired\n");
        return;
    }
    v0.refill_quantum();
    sched.add_to_ready_tail(t0);
    if sched.schedule() != Some(t1) {
        uart_puts(b"[VM SCHED] ERROR: vCPU 1 should dispatch before requeued vCPU 0\n");
        return;
    }
    uart_puts(b"[VM SCHED] Test 2 PASSED\n\n");

    // Test 3: a vCPU parked on WFI (WaitIrq) is set_sleep'd and only
    // rejoins the ready queue once its wake tick elapses
    uart_puts(b"[VM SCHED] Test 3: WaitIrq park and wake...\n");
    vm.vcpu_mut(VcpuId(1)).unwrap().set_state(VcpuState::WaitIrq);
    sched.set_sleep(t1, 100);
    if sched.wake_sleepers(50) != 0 {
        uart_puts(b"[VM SCHED] ERROR: should not wake before deadline\n");
        return;
    }
    if sched.wake_sleepers(100) != 1 {
        uart_puts(b"[VM SCHED] ERROR: should wake exactly once at deadline\n");
        return;
    }
    vm.vcpu_mut(VcpuId(1)).unwrap().set_state(VcpuState::Ready);
    if sched.schedule() != Some(t1) {
        uart_puts(b"[VM SCHED] ERROR: woken vCPU 1 should dispatch\n");
        return;
    }
    if vm.vcpu(VcpuId(1)).unwrap().state() != VcpuState::Ready {
        uart_puts(b"[VM SCHED] ERROR: vCPU 1 should have left WaitIrq\n");
        return;
    }
    uart_puts(b"[VM SCHED] Test 3 PASSED\n\n");

    uart_puts(b"========================================\n");
    uart_puts(b"  VM Scheduler Integration Test PASSED\n");
    uart_puts(b"========================================\n\n");
}
