//! EL2 exception entry points called directly from `exception.S`.
//!
//! This module owns only the assembly boundary: loading `VBAR_EL2`/`HCR_EL2`
//! at boot and the two `extern "C"` handlers the vector stubs call into after
//! spilling guest state to a [`VcpuContext`]. What a trap *means* is decided
//! by [`crate::dispatch`]; what happens next to the scheduler lives in
//! [`crate::global`]/[`crate::scheduler`]. This separation keeps the
//! `no_mangle` ABI surface small and testable-by-inspection even though the
//! handlers themselves can't run under `#[cfg(test)]` (no vector table in a
//! hosted test binary).

use crate::arch::aarch64::regs::VcpuContext;
use crate::dispatch::{self, GuestDevices, IrqOutcome, SyncOutcome};
use crate::global;
use crate::vcpu::VcpuState;
use crate::{uart_put_hex, uart_puts};
use core::sync::atomic::{AtomicU32, Ordering};

extern "C" {
    /// Exception vector table base address, loaded into `VBAR_EL2`.
    pub static exception_vector_table: u8;

    /// Restore `context` into guest registers and `eret` to EL1; returns
    /// once `handle_exception`/`handle_irq_exception` reports "exit to
    /// host" (`false`), having already re-spilled guest state into
    /// `context`.
    pub fn enter_guest(context: *mut VcpuContext) -> u64;
}

/// Load `VBAR_EL2` and program `HCR_EL2` for trap-and-emulate (§4.A).
pub fn init() {
    unsafe {
        let vbar = &exception_vector_table as *const _ as u64;
        core::arch::asm!(
            "msr vbar_el2, {vbar}",
            "isb",
            vbar = in(reg) vbar,
            options(nostack, nomem),
        );

        let hcr = dispatch::hcr_el2_boot_value();
        core::arch::asm!(
            "msr hcr_el2, {hcr}",
            "isb",
            hcr = in(reg) hcr,
            options(nostack, nomem),
        );
    }
}

// Loop-prevention: a guest that traps back-to-back with no progress (PC
// never advancing) eventually halts the pCPU rather than spin forever.
static EXCEPTION_COUNT: AtomicU32 = AtomicU32::new(0);
const MAX_CONSECUTIVE_EXCEPTIONS: u32 = 100;

/// Reset the loop-prevention counter; call before first entering a vCPU.
pub fn reset_exception_counters() {
    EXCEPTION_COUNT.store(0, Ordering::Relaxed);
}

fn fatal_halt(esr: u64, far: u64, pc: u64) -> ! {
    uart_puts(b"\n[FATAL] vCPU trap unrecoverable, halting pCPU\n");
    uart_puts(b"  ESR_EL2=0x");
    uart_put_hex(esr);
    uart_puts(b" FAR_EL2=0x");
    uart_put_hex(far);
    uart_puts(b" PC=0x");
    uart_put_hex(pc);
    uart_puts(b"\n");
    loop {
        unsafe { core::arch::asm!("wfe") };
    }
}

/// Synchronous-exception entry point (§4.D). Looks up the running task from
/// the calling pCPU's scheduler, builds the [`GuestDevices`] bundle, and
/// delegates the decode/route decision to [`dispatch::handle_sync_exception`].
///
/// # Returns
/// `true` to re-enter the same guest immediately; `false` to return to the
/// pCPU's run loop in `main.rs` so it can reschedule.
#[no_mangle]
pub extern "C" fn handle_exception(context: &mut VcpuContext) -> bool {
    let esr: u64;
    let far: u64;
    let hpfar: u64;
    unsafe {
        core::arch::asm!("mrs {}, esr_el2", out(reg) esr, options(nostack, nomem));
        core::arch::asm!("mrs {}, far_el2", out(reg) far, options(nostack, nomem));
        core::arch::asm!("mrs {}, hpfar_el2", out(reg) hpfar, options(nostack, nomem));
    }
    context.sys_regs.esr_el2 = esr;
    context.sys_regs.far_el2 = far;
    context.sys_regs.hpfar_el2 = hpfar;

    if EXCEPTION_COUNT.fetch_add(1, Ordering::Relaxed) + 1 > MAX_CONSECUTIVE_EXCEPTIONS {
        fatal_halt(esr, far, context.pc);
    }

    let Some(task) = global::this_scheduler().current() else {
        fatal_halt(esr, far, context.pc);
    };
    let Some(vm) = global::HYPERVISOR.vm_mut(task.vm) else {
        fatal_halt(esr, far, context.pc);
    };

    // Snapshot every sibling vCPU's on/off state before taking an exclusive
    // borrow of the running one — PSCI's `is_vcpu_already_on` needs to see
    // other slots while `split_for_trap` holds this one (§9).
    let mut already_on = [false; crate::platform::MAX_VCPUS];
    for (i, slot) in already_on.iter_mut().enumerate() {
        *slot = vm.vcpu(crate::vcpu::VcpuId(i as u8)).map(|v| v.is_on()).unwrap_or(false);
    }

    let cntpct = crate::arch::aarch64::peripherals::timer::read_cntpct_el0();
    let Some((vcpu, vgic_distributor, uart, vtimer_vm)) = vm.split_for_trap(task.vcpu) else {
        fatal_halt(esr, far, context.pc);
    };
    let mut devices = GuestDevices {
        vgic_distributor,
        vgic_cpu: vcpu.vgic_cpu_mut(),
        uart,
        vtimer_cpu: vcpu.vtimer_cpu_mut(),
        vtimer_vm,
    };

    let (outcome, tx_echo) = dispatch::handle_sync_exception(context, &mut devices, cntpct, |target_cpu| {
        already_on.get((target_cpu & 0xFF) as usize).copied().unwrap_or(false)
    });

    if let Some(byte) = tx_echo {
        global::with_console_mux(|mux| mux.write_output(task.vm.index(), byte, |b| uart_puts(&[b])));
    }

    match outcome {
        SyncOutcome::Resume => true,
        SyncOutcome::Idle => {
            vcpu.set_state(VcpuState::WaitIrq);
            false
        }
        SyncOutcome::WakeVcpu { target_cpu, entry, context_id } => {
            if let Some(woken) = vm.wake_vcpu(target_cpu, entry, context_id) {
                let target_pcpu = 1 + (woken.index() % (crate::platform::SMP_CPUS - 1).max(1));
                let task = crate::scheduler::TaskRef { vm: task.vm, vcpu: woken };
                global::SCHEDULERS[target_pcpu].wakeup_remote(task, target_pcpu);
            }
            true
        }
        SyncOutcome::Fatal => fatal_halt(context.sys_regs.esr_el2, context.sys_regs.far_el2, context.pc),
    }
}

/// Physical-IRQ entry point (§4.D IRQ path). `ESR_EL2` is not valid on this
/// path — the cause is read via `GICC_IAR`, already done by
/// [`dispatch::handle_irq`].
///
/// # Returns
/// `true` to re-enter the same guest immediately; `false` to exit to the
/// run loop (a reschedule or a host-side drain is needed).
#[no_mangle]
pub extern "C" fn handle_irq_exception(_context: &mut VcpuContext) -> bool {
    EXCEPTION_COUNT.store(0, Ordering::Relaxed);

    match dispatch::handle_irq() {
        IrqOutcome::TimerTick => {
            rearm_preemption_timer();
            tick_current_vcpu()
        }
        IrqOutcome::UartData => {
            drain_physical_uart();
            false
        }
        IrqOutcome::SchedulerWake => false,
        IrqOutcome::Other(_) | IrqOutcome::Spurious => true,
    }
}

fn rearm_preemption_timer() {
    use crate::arch::aarch64::peripherals::timer;
    let ticks = (timer::get_frequency() / crate::platform::TICK_HZ).max(1) as u32;
    timer::arm_preemption_timer(ticks);
}

/// Per-pCPU preemption tick (§4.B, §4.G `v_timer_tick`): wake any sleepers
/// whose deadline has passed, tick the running vCPU's virtual timer and
/// inject PPI 27 if it just fired, then tick its scheduling quantum.
fn tick_current_vcpu() -> bool {
    use crate::arch::aarch64::peripherals::timer;

    let sched = global::this_scheduler();
    let cntpct = timer::read_cntpct_el0();
    sched.wake_sleepers(cntpct);

    let Some(task) = sched.current() else { return false };
    let Some(vm) = global::HYPERVISOR.vm_mut(task.vm) else { return false };
    let now = cntpct.wrapping_sub(vm.vtimer_vm().cntvoff);
    let Some(vcpu) = vm.vcpu_mut(task.vcpu) else { return false };

    if vcpu.vtimer_cpu_mut().tick(now) {
        vcpu.vgic_cpu_mut().inject_ppi(crate::vtimer::FIRE_IRQ);
    }

    if vcpu.tick_quantum() {
        vcpu.refill_quantum();
        vcpu.set_state(VcpuState::Ready);
        sched.add_to_ready_tail(task);
        false
    } else {
        true
    }
}

/// Drain the physical PL011's RX FIFO straight from MMIO into
/// [`global::UART_RX`] (§4.H) — this runs on the IRQ path itself, ahead of
/// anything that would let us go through the `crate::uart::Uart` driver.
fn drain_physical_uart() {
    const FR_OFFSET: u64 = 0x18;
    const FR_RXFE: u32 = 1 << 4;
    let base = crate::platform::UART_BASE;
    loop {
        let fr: u32;
        unsafe {
            core::arch::asm!(
                "ldr {val:w}, [{addr}]",
                addr = in(reg) (base + FR_OFFSET),
                val = out(reg) fr,
                options(nostack, readonly),
            );
        }
        if fr & FR_RXFE != 0 {
            break;
        }
        let data: u32;
        unsafe {
            core::arch::asm!(
                "ldr {val:w}, [{addr}]",
                addr = in(reg) base,
                val = out(reg) data,
                options(nostack, readonly),
            );
        }
        global::UART_RX.push((data & 0xFF) as u8);
    }
}
