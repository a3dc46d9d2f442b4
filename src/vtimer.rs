//! Virtual ARM generic timer (§4.G).
//!
//! The guest's `CNTV_CTL_EL0`/`CNTV_CVAL_EL0`/`CNTV_TVAL_EL0` and
//! `CNTVCT_EL0` are not trapped directly — hardware virtualizes them via
//! `CNTVOFF_EL2`. The core instead mediates at context-switch time by
//! diffing a per-vCPU mirror against what the guest actually wrote,
//! exactly as `arch::aarch64::peripherals::timer` already exposes the raw
//! accessors this module wraps.

use crate::platform::{TICK_HZ, VTIMER_IRQ, VTIMER_PENDING_WATCHDOG_TICKS};

const CTL_ENABLE: u64 = 1 << 0;
#[allow(dead_code)]
const CTL_IMASK: u64 = 1 << 1;
const CTL_ISTATUS: u64 = 1 << 2;

/// Per-VM virtual timer state (§3 "vTimer state — per-VM").
#[derive(Debug, Clone, Copy)]
pub struct VTimerVm {
    /// `CNTVOFF_EL2` fixed at VM creation so the guest counter starts at 0.
    pub cntvoff: u64,
    /// Last virtual `now` observed by any vCPU of this VM.
    pub now_tick: u64,
}

impl VTimerVm {
    pub const fn new() -> Self {
        Self { cntvoff: 0, now_tick: 0 }
    }

    /// Fix `cntvoff` at the physical counter value seen at VM creation time.
    pub fn init(&mut self, cntpct_at_boot: u64) {
        self.cntvoff = cntpct_at_boot;
        self.now_tick = 0;
    }
}

impl Default for VTimerVm {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-vCPU virtual timer mirror (§3 "vTimer state — per-vCPU").
#[derive(Debug, Clone, Copy)]
pub struct VTimerCpu {
    cntv_ctl: u64,
    cntv_cval: u64,
    cntv_tval: u32,
    enabled: bool,
    pending: bool,
    deadline: u64,
    /// Virtual tick at which `pending` was most recently set; drives the
    /// force-clear watchdog.
    pending_since: u64,
    /// Count of PPI 27 injections, diagnostic only.
    fire_count: u64,
}

impl VTimerCpu {
    pub const fn new() -> Self {
        Self {
            cntv_ctl: 0,
            cntv_cval: 0,
            cntv_tval: 0,
            enabled: false,
            pending: false,
            deadline: 0,
            pending_since: 0,
            fire_count: 0,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn fire_count(&self) -> u64 {
        self.fire_count
    }

    /// `vtimer_should_fire`: `(ctl & ENABLE) && now >= cval`.
    pub fn should_fire(&self, now: u64) -> bool {
        self.enabled && now >= self.deadline
    }
}

/// Observed current values of the guest's sysreg bank for a vCPU, as seen
/// by the scheduler on context-switch-out.
#[derive(Debug, Clone, Copy)]
pub struct Observed {
    pub ctl: u64,
    pub cval: u64,
    pub tval: u32,
}

/// Values to write back into the vCPU's sysreg bank after `core_save`.
#[derive(Debug, Clone, Copy)]
pub struct Normalized {
    pub ctl: u64,
    pub cval: u64,
    pub tval: u32,
}

impl VTimerCpu {
    /// §4.G `core_save`: diff `observed` against the mirror, normalize, and
    /// update `vm.now_tick`. Returns the values the caller should write back
    /// into the vCPU's system-register bank.
    pub fn core_save(&mut self, vm: &mut VTimerVm, observed: Observed, cntpct: u64) -> Normalized {
        let now = cntpct.wrapping_sub(vm.cntvoff);
        vm.now_tick = now;

        if observed.ctl != self.cntv_ctl {
            self.cntv_ctl = observed.ctl;
            self.enabled = observed.ctl & CTL_ENABLE != 0;
            if observed.ctl & CTL_ISTATUS == 0 {
                self.pending = false;
            }
        } else if observed.cval != self.cntv_cval {
            self.cntv_cval = observed.cval;
            self.deadline = observed.cval;
            self.cntv_ctl &= !CTL_ISTATUS;
            self.pending = false;
        } else if tval_changed(self.cntv_tval, observed.tval) {
            let cval = now.wrapping_add(sign_extend_32(observed.tval));
            self.cntv_cval = cval;
            self.cntv_tval = observed.tval;
            self.deadline = cval;
            self.cntv_ctl &= !CTL_ISTATUS;
            self.pending = false;
        }

        self.watchdog(now);

        Normalized { ctl: self.cntv_ctl, cval: self.cntv_cval, tval: self.cntv_tval }
    }

    /// §4.G `core_restore`: copy the mirror back into the sysreg bank.
    pub fn core_restore(&self) -> Normalized {
        Normalized { ctl: self.cntv_ctl, cval: self.cntv_cval, tval: self.cntv_tval }
    }

    /// Safety-valve: force-clear a `pending` flag that has outlived the
    /// watchdog window without the guest acknowledging it. Documented as a
    /// debug aid only — no other module may branch on having observed this
    /// (§9 Open Question resolution).
    fn watchdog(&mut self, now: u64) {
        if self.pending && now.saturating_sub(self.pending_since) > VTIMER_PENDING_WATCHDOG_TICKS {
            self.pending = false;
            self.cntv_ctl &= !CTL_ISTATUS;
        }
    }

    /// Called from the per-pCPU physical-timer tick handler for every vCPU
    /// bound to this pCPU. Injects PPI 27 exactly once per assertion.
    pub fn tick(&mut self, now: u64) -> bool {
        if self.should_fire(now) && !self.pending {
            self.pending = true;
            self.cntv_ctl |= CTL_ISTATUS;
            self.pending_since = now;
            self.fire_count += 1;
            return true;
        }
        false
    }
}

impl Default for VTimerCpu {
    fn default() -> Self {
        Self::new()
    }
}

fn tval_changed(expected: u32, observed: u32) -> bool {
    (expected as i64 - observed as i64).unsigned_abs() > 1000
}

fn sign_extend_32(v: u32) -> u64 {
    v as i32 as i64 as u64
}

/// Virtual IRQ injected when a per-vCPU timer fires (§6).
pub const FIRE_IRQ: u32 = VTIMER_IRQ;
/// Scheduler tick rate this module's watchdog window is calibrated against.
pub const _TICK_HZ_REFERENCE: u64 = TICK_HZ;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enabling_and_reaching_cval_fires_once() {
        let mut cpu = VTimerCpu::new();
        let mut vm = VTimerVm::new();
        vm.init(0);

        cpu.core_save(&mut vm, Observed { ctl: CTL_ENABLE, cval: 1000, tval: 0 }, 0);
        assert!(!cpu.tick(500));
        assert!(cpu.tick(1000));
        assert!(cpu.is_pending());
        assert!(!cpu.tick(1001)); // already pending, no double-fire
        assert_eq!(cpu.fire_count(), 1);
    }

    #[test]
    fn guest_clearing_istatus_clears_pending() {
        let mut cpu = VTimerCpu::new();
        let mut vm = VTimerVm::new();
        cpu.core_save(&mut vm, Observed { ctl: CTL_ENABLE, cval: 10, tval: 0 }, 0);
        cpu.tick(10);
        assert!(cpu.is_pending());

        // guest clears ISTATUS
        cpu.core_save(&mut vm, Observed { ctl: CTL_ENABLE, cval: 10, tval: 0 }, 10);
        assert!(cpu.is_pending()); // ctl unchanged, cval unchanged, pending stays until istatus clear written
        cpu.core_save(&mut vm, Observed { ctl: CTL_ENABLE & !CTL_ISTATUS, cval: 10, tval: 0 }, 10);
        assert!(!cpu.is_pending());
    }

    #[test]
    fn cval_write_clears_pending_immediately() {
        let mut cpu = VTimerCpu::new();
        let mut vm = VTimerVm::new();
        cpu.core_save(&mut vm, Observed { ctl: CTL_ENABLE, cval: 10, tval: 0 }, 0);
        cpu.tick(10);
        assert!(cpu.is_pending());
        cpu.core_save(&mut vm, Observed { ctl: CTL_ENABLE, cval: 2_000_000, tval: 0 }, 10);
        assert!(!cpu.is_pending());
    }

    #[test]
    fn monotonic_now_tick_on_vm() {
        let mut cpu = VTimerCpu::new();
        let mut vm = VTimerVm::new();
        vm.init(100);
        cpu.core_save(&mut vm, Observed { ctl: 0, cval: 0, tval: 0 }, 200);
        assert_eq!(vm.now_tick, 100);
        cpu.core_save(&mut vm, Observed { ctl: 0, cval: 0, tval: 0 }, 350);
        assert_eq!(vm.now_tick, 250);
    }

    #[test]
    fn watchdog_force_clears_stale_pending() {
        let mut cpu = VTimerCpu::new();
        let mut vm = VTimerVm::new();
        cpu.core_save(&mut vm, Observed { ctl: CTL_ENABLE, cval: 10, tval: 0 }, 0);
        cpu.tick(10);
        assert!(cpu.is_pending());
        let far_future = 10 + VTIMER_PENDING_WATCHDOG_TICKS + 1;
        cpu.core_save(&mut vm, Observed { ctl: CTL_ENABLE | CTL_ISTATUS, cval: 10, tval: 0 }, far_future);
        assert!(!cpu.is_pending());
    }
}
