//! Platform/Board Constants (QEMU virt machine, GICv2)
//!
//! All board-specific addresses and sizes live here so they can be
//! changed in one place when targeting a different platform.

// ── UART (PL011) ─────────────────────────────────────────────────────
pub const UART_BASE: u64 = 0x0900_0000;
pub const UART_SIZE: u64 = 0x1000;

// ── GIC (GICv2: Distributor, CPU interface, Hypervisor interface) ────
pub const GICD_BASE: u64 = 0x0800_0000;
pub const GICD_SIZE: u64 = 0x1000;
pub const GICC_BASE: u64 = 0x0801_0000;
pub const GICC_SIZE: u64 = 0x1000;
pub const GICH_BASE: u64 = 0x0803_0000;
pub const GICH_SIZE: u64 = 0x1000;
pub const GICV_BASE: u64 = 0x0804_0000;
pub const GICV_SIZE: u64 = 0x1000;
/// Region covering GICD/GICC/GICH/GICV contiguously, used to stage-2-unmap
/// the whole window in one pass at VM creation (§4.J step 4).
pub const GIC_REGION_BASE: u64 = GICD_BASE;
pub const GIC_REGION_SIZE: u64 = 0x10_0000;

// ── Guest memory layout ──────────────────────────────────────────────
pub const GUEST_RAM_BASE: u64 = 0x4000_0000;
pub const GUEST_LOAD_ADDR: u64 = 0x4800_0000;
pub const LINUX_DTB_ADDR: u64 = 0x4700_0000;
pub const LINUX_MEM_SIZE: u64 = 1024 * 1024 * 1024;
pub const GUEST_STACK_RESERVE: u64 = 0x1000;

/// Second VM's guest-physical layout (static multi-VM config, §4.J).
pub const VM1_GUEST_LOAD_ADDR: u64 = 0x6800_0000;
pub const VM1_LINUX_DTB_ADDR: u64 = 0x6700_0000;
pub const VM1_LINUX_MEM_SIZE: u64 = 256 * 1024 * 1024;

// ── SMP ──────────────────────────────────────────────────────────────
/// Maximum pCPUs supported (compile-time capacity for per-pCPU array sizing)
pub const MAX_SMP_CPUS: usize = 8;
/// Number of pCPUs this build boots. Fixed at compile time: guest image
/// loading and DTB parsing are external collaborators (§1), so there is no
/// runtime CPU-topology discovery here. Gated by the `multi_pcpu` feature,
/// matching the build-time SMP configuration already in `Cargo.toml`.
#[cfg(feature = "multi_pcpu")]
pub const SMP_CPUS: usize = 4;
#[cfg(not(feature = "multi_pcpu"))]
pub const SMP_CPUS: usize = 1;
/// Number of pCPUs this build boots (see [`SMP_CPUS`]).
pub fn num_cpus() -> usize {
    SMP_CPUS
}

// ── VM / vCPU arena sizing (§3, §4.J) ────────────────────────────────
/// Fixed arena capacity for VMs. Live creation/destruction is a non-goal;
/// every slot is allocated once at boot. Gated by the `multi_vm` feature.
#[cfg(feature = "multi_vm")]
pub const VM_NUM_MAX: usize = 2;
#[cfg(not(feature = "multi_vm"))]
pub const VM_NUM_MAX: usize = 1;
/// Maximum vCPUs per VM.
pub const MAX_VCPUS: usize = 8;
/// Guest stack size for each vCPU, in 4KB pages.
pub const VM_STACK_PAGES: u64 = 4;

// ── vGIC (§4.F) ──────────────────────────────────────────────────────
/// Number of GICH list registers implemented by this platform (GICv2 has 4).
pub const LR_NUM: usize = 4;
/// Highest SPI INTID this build tracks in the pending bitmap.
pub const SPI_ID_MAX: usize = 64;
/// Words of `u32` needed to hold one bit per SPI id (§3 "Pending-bitmap word layout").
pub const SPI_BITMAP_WORDS: usize = SPI_ID_MAX / 32;
/// Default priority assigned to software-injected virtual interrupts.
pub const IRQ_DEFAULT_PRIORITY: u8 = 0xA0;

// ── vTimer (§4.G) ────────────────────────────────────────────────────
/// Virtual timer PPI.
pub const VTIMER_IRQ: u32 = 27;
/// Physical timer PPI used to drive the per-pCPU preemption tick.
pub const PTIMER_IRQ: u32 = 26;
/// Timer-tick rate in Hz used for scheduler quantum + vTimer polling.
pub const TICK_HZ: u64 = 100;
/// Pending-without-ack watchdog window (~100ms at a 62.5MHz counter),
/// a debug aid only — see SPEC_FULL.md §9 resolution of the force-clear note.
pub const VTIMER_PENDING_WATCHDOG_TICKS: u64 = 6_250_000;

// ── vPL011 (§4.H) ────────────────────────────────────────────────────
/// Virtual IRQ number for the PL011.
pub const UART_SPI_INTID: u32 = 33;
/// Depth of each of the two (TX, RX) ring FIFOs.
pub const UART_FIFO_DEPTH: usize = 16;

// ── Scheduler (§4.B) ─────────────────────────────────────────────────
/// Fixed quantum, in timer ticks, before a running vCPU is requeued.
pub const SYS_TASK_TICK: u32 = 5;
/// IPI vector used for cross-pCPU scheduler wakeups.
pub const IPI_SCHED: u32 = 1;
/// Affinity mask for a VM's primary vCPU (always pinned to pCPU 0, which
/// also runs the boot path and the console multiplexer).
pub const PRIMARY_VCPU_PCPU_MASK: u8 = 1 << 0;
/// Affinity mask for secondary vCPUs brought up via `PSCI_CPU_ON`: any
/// pCPU other than 0, letting the scheduler place them by availability.
pub const SECONDARY_VCPU_PCPU_MASK: u8 = !PRIMARY_VCPU_PCPU_MASK;

// ── PSCI (§4.I) ──────────────────────────────────────────────────────
pub const PSCI_VERSION_0_2: u64 = 0x0000_0002;
pub const PSCI_RET_SUCCESS: u64 = 0;
pub const PSCI_RET_NOT_SUPPORTED: u64 = (-1i64) as u64;
pub const PSCI_RET_ALREADY_ON: u64 = (-4i64) as u64;
pub const PSCI_TOS_MP: u64 = 2;

// ── Heap ─────────────────────────────────────────────────────────────
pub const HEAP_START: u64 = 0x4100_0000;
pub const HEAP_SIZE: u64 = 0x100_0000; // 16MB
