//! PSCI front-end (§4.I).
//!
//! HVC and SMC both funnel here with the function ID in `X0`. Only the
//! three FIDs a single-guest-image boot path actually needs are
//! implemented; everything else (`CPU_OFF`, `AFFINITY_INFO`,
//! `SYSTEM_OFF`/`RESET`, `CPU_SUSPEND`, and the vendor debug-console HVC
//! this codebase's prior PSCI surface carried) is out of scope and returns
//! `NOT_SUPPORTED`.

use crate::platform::{PSCI_RET_ALREADY_ON, PSCI_RET_NOT_SUPPORTED, PSCI_RET_SUCCESS, PSCI_TOS_MP, PSCI_VERSION_0_2};

const PSCI_VERSION: u64 = 0x8400_0000;
const CPU_ON_32: u64 = 0x8400_0003;
const CPU_ON_64: u64 = 0xC400_0003;
const MIGRATE_INFO_TYPE: u64 = 0x8400_0006;

/// Outcome of a `CPU_ON` call: either the return code to give the caller
/// directly, or a request the scheduler must act on to actually wake the
/// target vCPU.
pub enum CpuOnOutcome {
    /// No vCPU booting needed; return this code to the caller in `X0`.
    Return(u64),
    /// Wake vCPU `target_cpu` at `entry` with `X0 = context_id`.
    WakeVcpu { target_cpu: u64, entry: u64, context_id: u64 },
}

/// Dispatch one HVC/SMC-carried PSCI call. `is_vcpu_already_on` lets the
/// caller report a target past `Create` without this module needing to see
/// the vCPU arena directly.
pub fn dispatch(
    function_id: u64,
    arg1: u64,
    arg2: u64,
    arg3: u64,
    is_vcpu_already_on: impl FnOnce(u64) -> bool,
) -> CpuOnOutcome {
    match function_id {
        PSCI_VERSION => CpuOnOutcome::Return(PSCI_VERSION_0_2),
        CPU_ON_32 | CPU_ON_64 => {
            let target_cpu = arg1;
            let entry = arg2;
            let context_id = arg3;
            if is_vcpu_already_on(target_cpu) {
                CpuOnOutcome::Return(PSCI_RET_ALREADY_ON)
            } else {
                CpuOnOutcome::WakeVcpu { target_cpu, entry, context_id }
            }
        }
        MIGRATE_INFO_TYPE => CpuOnOutcome::Return(PSCI_TOS_MP),
        _ => CpuOnOutcome::Return(PSCI_RET_NOT_SUPPORTED),
    }
}
