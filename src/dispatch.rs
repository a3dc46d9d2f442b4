//! EL2 exception dispatcher (§4.D).
//!
//! Everything here assumes the vector stub has already spilled GPRs and
//! `ELR`/`SPSR`/`USP` into the current task's [`crate::arch::aarch64::VcpuContext`]
//! (`save_cpu_ctx`, in the teacher's terms) before calling in. This module
//! only decides *what the trap means* and *where it routes*; it never
//! touches the stack-spill machinery itself — that lives in
//! `arch::aarch64::hypervisor::exception`'s `extern "C"` entry points.

use crate::arch::aarch64::defs::{
    HCR_AMO, HCR_API, HCR_APK, HCR_BSU_INNER, HCR_FB, HCR_FMO, HCR_IMO, HCR_RW, HCR_SWIO, HCR_TEA,
    HCR_TWI,
};
use crate::arch::aarch64::peripherals::gic::GICC;
use crate::arch::aarch64::VcpuContext;
use crate::platform::{IPI_SCHED, PTIMER_IRQ, UART_SPI_INTID};
use crate::psci::CpuOnOutcome;
use crate::stage2::{self, Window};
use crate::trap::{self, SyncException};
use crate::vgic::{VGicCpu, VGicDistributor};
use crate::vpl011::VPl011;
use crate::vtimer::{Observed, VTimerCpu, VTimerVm};

/// Program `HCR_EL2` for trap-and-emulate virtualization of this guest.
///
/// `HCR_TWE` is deliberately *not* set: WFE is left to execute natively.
/// Trapping it would let a guest spinning on a lock deadlock the pCPU,
/// since nothing here ever sends the event that would wake a trapped WFE.
pub fn hcr_el2_boot_value() -> u64 {
    HCR_RW
        | HCR_SWIO
        | HCR_FMO
        | HCR_IMO
        | HCR_AMO
        | HCR_FB
        | HCR_BSU_INNER
        | HCR_TWI
        | HCR_TEA
        | HCR_APK
        | HCR_API
}

/// What the caller (the scheduler's run loop) should do after a sync trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Resume the guest; PC has already been advanced as needed.
    Resume,
    /// Guest asked to go idle (WFI); block this task until an IRQ wakes it.
    Idle,
    /// A PSCI `CPU_ON` call needs a vCPU woken; `X0` already holds the
    /// caller's return code for this vCPU.
    WakeVcpu { target_cpu: u64, entry: u64, context_id: u64 },
    /// Illegal execution state, or any other unrecoverable condition: halt.
    Fatal,
}

/// Everything a sync-exception handler needs mutable access to, owned by
/// whichever vCPU trapped (§3 "vGIC/vTimer/vPL011 state").
pub struct GuestDevices<'a> {
    pub vgic_distributor: &'a mut VGicDistributor,
    pub vgic_cpu: &'a mut VGicCpu,
    pub uart: &'a mut VPl011,
    pub vtimer_cpu: &'a mut VTimerCpu,
    pub vtimer_vm: &'a mut VTimerVm,
}

/// Route one synchronous trap (§4.D steps 1, 3, 4). The caller is
/// responsible for step 2 (snapshotting GPRs into the task, already done by
/// the vector stub) and for acting on [`SyncOutcome::WakeVcpu`].
pub fn handle_sync_exception(
    ctx: &mut VcpuContext,
    devices: &mut GuestDevices,
    cntpct: u64,
    is_vcpu_already_on: impl FnOnce(u64) -> bool,
) -> (SyncOutcome, Option<u8>) {
    let (exc, il) = trap::decode(ctx.sys_regs.esr_el2, ctx.sys_regs.far_el2, ctx.sys_regs.hpfar_el2);
    let mut tx_echo = None;

    let outcome = match exc {
        SyncException::SyncWfi => SyncOutcome::Idle,
        SyncException::SyncHvc | SyncException::SyncSmc => {
            dispatch_psci(ctx, is_vcpu_already_on)
        }
        SyncException::SyncSysreg(access) => {
            handle_sysreg(ctx, &access, devices, cntpct);
            SyncOutcome::Resume
        }
        SyncException::SyncDataAbort(fault) => {
            tx_echo = handle_data_abort(ctx, &fault, devices);
            SyncOutcome::Resume
        }
        SyncException::Illegal => SyncOutcome::Fatal,
        SyncException::Unknown(_) => SyncOutcome::Resume,
    };

    if !matches!(outcome, SyncOutcome::Fatal) {
        advance_pc_if_needed(ctx, &exc, il);
    }
    (outcome, tx_echo)
}

/// WFI and data-abort/sysreg paths always need PC advanced; PSCI handlers
/// already wrote `X0` and also need it (a `WakeVcpu` request still means
/// *this* vCPU's HVC/SMC instruction is done executing).
fn advance_pc_if_needed(ctx: &mut VcpuContext, _exc: &SyncException, il: bool) {
    use crate::arch::traits::VcpuContextOps;
    ctx.advance_pc(il);
}

fn dispatch_psci(ctx: &mut VcpuContext, is_vcpu_already_on: impl FnOnce(u64) -> bool) -> SyncOutcome {
    let function_id = ctx.get_gpr(0);
    let arg1 = ctx.get_gpr(1);
    let arg2 = ctx.get_gpr(2);
    let arg3 = ctx.get_gpr(3);

    match crate::psci::dispatch(function_id, arg1, arg2, arg3, is_vcpu_already_on) {
        CpuOnOutcome::Return(value) => {
            ctx.set_gpr(0, value);
            SyncOutcome::Resume
        }
        CpuOnOutcome::WakeVcpu { target_cpu, entry, context_id } => {
            ctx.set_gpr(0, crate::platform::PSCI_RET_SUCCESS);
            SyncOutcome::WakeVcpu { target_cpu, entry, context_id }
        }
    }
}

fn handle_sysreg(ctx: &mut VcpuContext, access: &trap::SysregAccess, devices: &mut GuestDevices, cntpct: u64) {
    if !access.is_cntv_reg() {
        return; // unhandled sysreg trap: log and skip (§4.D step 3)
    }

    // CNTV_TVAL_EL0 (op2=0), CNTV_CTL_EL0 (op2=1), CNTV_CVAL_EL0 (op2=2).
    let sys = &mut ctx.sys_regs;
    match access.op2 {
        1 => {
            if access.is_read {
                ctx.set_gpr(access.rt as u8, sys.cntv_ctl_el0);
            } else {
                sys.cntv_ctl_el0 = ctx.get_gpr(access.rt as u8);
            }
        }
        2 => {
            if access.is_read {
                ctx.set_gpr(access.rt as u8, sys.cntv_cval_el0);
            } else {
                sys.cntv_cval_el0 = ctx.get_gpr(access.rt as u8);
            }
        }
        0 => {
            if access.is_read {
                let now = cntpct.wrapping_sub(devices.vtimer_vm.cntvoff);
                let tval = sys.cntv_cval_el0.wrapping_sub(now) as u32;
                ctx.set_gpr(access.rt as u8, tval as u64);
            } else {
                sys.cntv_tval_el0 = ctx.get_gpr(access.rt as u8);
            }
        }
        _ => {}
    }

    let observed = Observed {
        ctl: ctx.sys_regs.cntv_ctl_el0,
        cval: ctx.sys_regs.cntv_cval_el0,
        tval: ctx.sys_regs.cntv_tval_el0 as u32,
    };
    let normalized = devices.vtimer_cpu.core_save(devices.vtimer_vm, observed, cntpct);
    ctx.sys_regs.cntv_ctl_el0 = normalized.ctl;
    ctx.sys_regs.cntv_cval_el0 = normalized.cval;
    ctx.sys_regs.cntv_tval_el0 = normalized.tval as u64;
}

/// Returns the byte a guest pushed into its vPL011 TX FIFO, if any — the
/// caller is responsible for routing it through the console multiplexer
/// (§4.H), since which VM owns this vCPU isn't known below this layer.
fn handle_data_abort(ctx: &mut VcpuContext, fault: &trap::Stage2Fault, devices: &mut GuestDevices) -> Option<u8> {
    let Some(window) = stage2::classify(fault.gpa) else {
        return None; // unhandled: log GPA/ESR and continue, PC still advances
    };

    let is_write = fault.is_write;
    let write_value = if is_write { ctx.get_gpr(fault.srt() as u8) as u32 } else { 0 };

    let (read_value, tx_echo) = match window {
        Window::Gicd(offset) => (
            stage2::handle_gicd(offset, is_write, write_value, devices.vgic_distributor, devices.vgic_cpu),
            None,
        ),
        Window::Gicc(offset) => (stage2::handle_gicc(offset, is_write, write_value, devices.vgic_cpu), None),
        Window::Pl011(offset) => {
            let (value, echo) = stage2::handle_pl011(offset, is_write, write_value, devices.uart);
            (value, echo)
        }
    };

    if !is_write {
        if let Some(value) = read_value {
            ctx.set_gpr(fault.srt() as u8, value as u64);
        }
    }
    tx_echo
}

/// What happened on a physical IRQ exit, for the scheduler's run loop to
/// act on (§4.D IRQ path, §4.G `v_timer_tick`, §4.H UART drain).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqOutcome {
    /// The per-pCPU preemption/vtimer tick fired.
    TimerTick,
    /// The physical UART has RX bytes ready to drain through the console
    /// multiplexer.
    UartData,
    /// Another pCPU asked this one to re-run its scheduler.
    SchedulerWake,
    /// Some other physical IRQ id, not one of the three this platform uses.
    Other(u32),
    /// `GICC_IAR` returned the spurious ID; nothing to do.
    Spurious,
}

/// Acknowledge and fully dispatch one physical IRQ (§4.D IRQ path). Every
/// IRQ this platform fields is entirely consumed by the hypervisor itself
/// (preemption tick, UART drain, scheduler IPI) rather than reflected to a
/// guest directly, so EOI is always issued in the same call (this
/// platform runs GICC in unified EOI mode — there is no separate physical
/// deactivate step to gate on the §9 DIR resolution; that resolution
/// instead governs *virtual* EOIR handling in
/// [`crate::vgic::VGicCpu::write_eoir`], which a guest drives itself).
pub fn handle_irq() -> IrqOutcome {
    let irq = GICC.acknowledge();
    const SPURIOUS: u32 = 1023;
    if irq == SPURIOUS {
        return IrqOutcome::Spurious;
    }

    let outcome = match irq {
        id if id == PTIMER_IRQ => IrqOutcome::TimerTick,
        id if id == UART_SPI_INTID => IrqOutcome::UartData,
        id if id == IPI_SCHED => IrqOutcome::SchedulerWake,
        other => IrqOutcome::Other(other),
    };

    GICC.end_of_interrupt(irq);
    outcome
}
