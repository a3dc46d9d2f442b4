//! VM lifecycle tests
//!
//! Verifies VM state transitions and that `init_timer` fixes `CNTVOFF` at
//! the physical counter value observed at creation.

use hypervisor::uart_puts;
use hypervisor::vm::{Vm, VmId, VmState};

pub fn run_vm_activate_test() {
    uart_puts(b"\n========================================\n");
    uart_puts(b"  VM Lifecycle Test\n");
    uart_puts(b"========================================\n\n");

    // Test 1: a freshly-constructed VM starts Uninitialized
    uart_puts(b"[VM-ACT] Test 1: initial state is Uninitialized...\n");
    let mut vm = Vm::new(VmId(0));
    if vm.state() != VmState::Uninitialized {
        uart_puts(b"[VM-ACT] FAILED: expected Uninitialized\n");
        return;
    }
    uart_puts(b"[VM-ACT] Test 1 PASSED\n\n");

    // Test 2: create_vcpus moves the VM to Ready
    uart_puts(b"[VM-ACT] Test 2: create_vcpus moves to Ready...\n");
    vm.create_vcpus(0x4800_0000, 0x9000_0000, 0);
    if vm.state() != VmState::Ready {
        uart_puts(b"[VM-ACT] FAILED: expected Ready after create_vcpus\n");
        return;
    }
    uart_puts(b"[VM-ACT] Test 2 PASSED\n\n");

    // Test 3: init_timer fixes CNTVOFF at the boot-time counter value
    uart_puts(b"[VM-ACT] Test 3: init_timer fixes CNTVOFF...\n");
    vm.init_timer(0x1000);
    if vm.vtimer_vm().cntvoff != 0x1000 || vm.vtimer_vm().now_tick != 0 {
        uart_puts(b"[VM-ACT] FAILED: expected cntvoff=0x1000, now_tick=0\n");
        return;
    }
    uart_puts(b"[VM-ACT] Test 3 PASSED\n\n");

    // Test 4: a second VM is fully independent of the first
    uart_puts(b"[VM-ACT] Test 4: independent VM instances...\n");
    let vm1 = Vm::new(VmId(1));
    if vm1.state() != VmState::Uninitialized || vm1.vtimer_vm().cntvoff != 0 {
        uart_puts(b"[VM-ACT] FAILED: VM 1 should start fresh regardless of VM 0\n");
        return;
    }
    uart_puts(b"[VM-ACT] Test 4 PASSED\n\n");

    uart_puts(b"========================================\n");
    uart_puts(b"  VM Lifecycle Test PASSED (4 assertions)\n");
    uart_puts(b"========================================\n\n");
}
