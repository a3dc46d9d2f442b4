//! Per-pCPU scheduler tests

use hypervisor::scheduler::{Scheduler, TaskRef};
use hypervisor::uart_puts;
use hypervisor::vcpu::VcpuId;
use hypervisor::vm::VmId;

fn task(vcpu: u8) -> TaskRef {
    TaskRef { vm: VmId(0), vcpu: VcpuId(vcpu) }
}

pub fn run_scheduler_test() {
    uart_puts(b"\n========================================\n");
    uart_puts(b"  Scheduler Test\n");
    uart_puts(b"========================================\n\n");

    // Test 1: ready-tail FIFO order
    uart_puts(b"[SCHED] Test 1: FIFO dispatch order...\n");
    {
        let sched = Scheduler::new();
        sched.add_to_ready_tail(task(0));
        sched.add_to_ready_tail(task(1));
        sched.add_to_ready_tail(task(2));
        if sched.schedule() != Some(task(0)) || sched.schedule() != Some(task(1)) {
            uart_puts(b"[SCHED] FAILED: expected FIFO order 0, 1\n");
            return;
        }
    }
    uart_puts(b"[SCHED] Test 1 PASSED\n\n");

    // Test 2: head-insert jumps the queue (used when a parked vCPU just had
    // a virtual interrupt injected and should be redispatched immediately)
    uart_puts(b"[SCHED] Test 2: head insert jumps the queue...\n");
    {
        let sched = Scheduler::new();
        sched.add_to_ready_tail(task(0));
        sched.add_to_ready_head(task(5));
        if sched.schedule() != Some(task(5)) {
            uart_puts(b"[SCHED] FAILED: head-inserted task should dispatch first\n");
            return;
        }
    }
    uart_puts(b"[SCHED] Test 2 PASSED\n\n");

    // Test 3: sleepers wake only once their deadline has passed
    uart_puts(b"[SCHED] Test 3: sleep/wake...\n");
    {
        let sched = Scheduler::new();
        sched.set_sleep(task(9), 100);
        if sched.wake_sleepers(50) != 0 {
            uart_puts(b"[SCHED] FAILED: should not wake before deadline\n");
            return;
        }
        if sched.wake_sleepers(100) != 1 {
            uart_puts(b"[SCHED] FAILED: should wake exactly once at deadline\n");
            return;
        }
        if sched.schedule() != Some(task(9)) {
            uart_puts(b"[SCHED] FAILED: woken task should be ready\n");
            return;
        }
    }
    uart_puts(b"[SCHED] Test 3 PASSED\n\n");

    // Test 4: current tracks the last scheduled task
    uart_puts(b"[SCHED] Test 4: current tracking...\n");
    {
        let sched = Scheduler::new();
        sched.add_to_ready_tail(task(3));
        sched.schedule();
        if sched.current() != Some(task(3)) {
            uart_puts(b"[SCHED] FAILED: current should be vCPU 3\n");
            return;
        }
    }
    uart_puts(b"[SCHED] Test 4 PASSED\n\n");

    uart_puts(b"========================================\n");
    uart_puts(b"  Scheduler Test PASSED\n");
    uart_puts(b"========================================\n\n");
}
