//! Boot entry and per-pCPU run loop.
//!
//! `rust_main` is reached once per pCPU, already at EL2 with the MMU off
//! (the EL2 boot stub that gets each core here is external to this crate,
//! per `hypervisor::arch::aarch64::enter_guest`'s own ABI note). pCPU 0
//! additionally brings up the one guest VM this build boots; every pCPU
//! then falls into the same schedule/dispatch/idle loop.

#![no_std]
#![no_main]

use core::panic::PanicInfo;

use hypervisor::arch::aarch64::hypervisor::exception;
use hypervisor::arch::aarch64::peripherals::{gic, timer};
use hypervisor::arch::aarch64::{enter_guest, VcpuContext};
use hypervisor::console::Action;
use hypervisor::global::{self, HYPERVISOR};
use hypervisor::guest_loader::GuestConfig;
use hypervisor::percpu;
use hypervisor::platform;
use hypervisor::scheduler::TaskRef;
use hypervisor::vcpu::{VcpuId, VcpuState};
use hypervisor::vm::VmId;
use hypervisor::{print, println, uart_puts};

/// Stack pointer seeded into the primary vCPU's context before its first
/// `eret`. The guest image owns its own stack from here on; loading that
/// image is an external collaborator (§1 Non-goals), so this is only ever
/// the value `VcpuContext::new` starts from.
const PRIMARY_VCPU_SP: u64 = {
    let cfg = GuestConfig::zephyr_default();
    cfg.load_addr + cfg.mem_size - 0x10
};

#[no_mangle]
pub extern "C" fn rust_main() -> ! {
    let cpu_id = percpu::current_cpu_id();

    exception::init();
    gic::GICC.init();

    if cpu_id == 0 {
        boot_primary();
    }

    timer::init_hypervisor_timer();
    rearm_preemption_tick();

    run_loop(cpu_id)
}

/// pCPU 0's one-time bring-up: physical UART/GIC distributor, the one VM
/// this build boots, and its primary vCPU queued for dispatch (§4.J).
fn boot_primary() {
    hypervisor::uart::init();
    uart_puts(b"========================================\n");
    uart_puts(b"  ARM64 Hypervisor - EL2\n");
    uart_puts(b"========================================\n");

    gic::GICD.init();
    gic::GICD.set_priority(platform::PTIMER_IRQ, platform::IRQ_DEFAULT_PRIORITY);
    gic::GICD.enable_irq(platform::PTIMER_IRQ);
    gic::GICD.set_priority(platform::UART_SPI_INTID, platform::IRQ_DEFAULT_PRIORITY);
    gic::GICD.enable_irq(platform::UART_SPI_INTID);
    gic::GICD.enable_irq(platform::IPI_SCHED);

    let vm_id = match HYPERVISOR.alloc_vm() {
        Ok(id) => id,
        Err(msg) => fatal(msg),
    };
    let vm = match HYPERVISOR.vm_mut(vm_id) {
        Some(vm) => vm,
        None => fatal("VM vanished right after alloc_vm"),
    };

    let cfg = GuestConfig::zephyr_default();
    let primary = vm.create_vcpus(cfg.entry_point, PRIMARY_VCPU_SP, 0);
    vm.init_timer(timer::read_cntpct_el0());
    vm.vgic_distributor_mut().enable_spi(platform::UART_SPI_INTID);
    vm.vgic_distributor_mut().set_priority(platform::UART_SPI_INTID, platform::IRQ_DEFAULT_PRIORITY);

    global::this_scheduler().add_to_ready_tail(TaskRef { vm: vm_id, vcpu: primary });

    uart_puts(b"[BOOT] VM 0 primary vCPU queued\n");
}

fn fatal(msg: &str) -> ! {
    uart_puts(b"[BOOT] FATAL: ");
    uart_puts(msg.as_bytes());
    uart_puts(b"\n");
    loop {
        unsafe { core::arch::asm!("wfe") };
    }
}

/// Arm this pCPU's physical EL2 timer for the next preemption tick
/// (`CNTHP_*_EL2` is banked per-core, so every pCPU arms its own).
fn rearm_preemption_tick() {
    let ticks = (timer::get_frequency() / platform::TICK_HZ).max(1) as u32;
    timer::arm_preemption_timer(ticks);
}

/// Shared per-pCPU run loop (§4.B, §4.J step 5): dispatch whatever the
/// local scheduler hands back, or park in `wfi` until the next IRQ. Only
/// pCPU 0 drains the physical console, since it alone owns the UART RX IRQ
/// path and the `ConsoleMux` (§4.H).
fn run_loop(cpu_id: usize) -> ! {
    loop {
        if cpu_id == 0 {
            drain_console();
        }

        match global::this_scheduler().schedule() {
            Some(task) => dispatch(task),
            None => unsafe { core::arch::asm!("wfi") },
        }
    }
}

/// Run one quantum of `task`: mark it `Running`, sync its vTimer offset into
/// the trap frame, and re-enter the guest. `enter_guest`'s own assembly loop
/// keeps re-entering until `handle_exception`/`handle_irq_exception` asks to
/// return here, at which point the vCPU's state already reflects why
/// (`Ready` requeued, `WaitIrq` parked, or still `Running` pre-empted by a
/// remote wakeup racing this pCPU).
fn dispatch(task: TaskRef) {
    let Some(vm) = HYPERVISOR.vm_mut(task.vm) else { return };
    let cntvoff = vm.vtimer_vm().cntvoff;
    let Some(vcpu) = vm.vcpu_mut(task.vcpu) else { return };

    vcpu.set_state(VcpuState::Running);
    let ctx = vcpu.context_mut();
    ctx.sys_regs.cntvoff_el2 = cntvoff;

    exception::reset_exception_counters();
    unsafe {
        enter_guest(ctx as *mut VcpuContext);
    }
}

/// Drain bytes the INTID-33 IRQ path has already pulled off the physical
/// PL011 into `global::UART_RX`, routing each through the `ConsoleMux`
/// state machine (§4.H).
fn drain_console() {
    while let Some(byte) = global::UART_RX.pop() {
        let action = global::with_console_mux(|mux| mux.handle_rx_byte(byte));
        handle_console_action(action);
    }
}

fn handle_console_action(action: Action) {
    match action {
        Action::None => {}
        Action::InjectChar(vm_idx, byte) => inject_console_byte(vm_idx, byte),
        Action::SwitchActive(_) => {}
        Action::ShowHelp => print!("{}", hypervisor::console::HELP_TEXT),
        Action::ShowStatus => print_status(),
        Action::ListVms => print_vm_list(),
        Action::ShowVmStatus(vm_idx) => print_vm_detail(vm_idx),
        Action::ExitCommandMode => print!("{}", hypervisor::console::PROMPT),
        Action::UnknownCommand => println!("unknown command, try 'help'"),
    }
}

/// Deliver one RX byte to `vm_idx`'s vPL011 and, if that made its IRQ
/// condition unmasked, inject SPI 33 into the VM's primary vCPU — the one
/// pCPU 0's console loop is driving.
fn inject_console_byte(vm_idx: usize, byte: u8) {
    let Some(vm) = HYPERVISOR.vm_mut(VmId(vm_idx as u8)) else { return };
    let Some((vcpu, distributor, uart, _vtimer_vm)) = vm.split_for_trap(VcpuId(0)) else { return };
    uart.inject_rx_char(byte);
    if uart.pending_irq().is_some() {
        vcpu.vgic_cpu_mut().inject_spi(platform::UART_SPI_INTID, distributor);
    }
}

fn print_status() {
    println!("pCPUs: {}  VMs: {}", platform::num_cpus(), HYPERVISOR.vm_count());
}

fn print_vm_list() {
    for i in 0..platform::VM_NUM_MAX {
        if let Some(vm) = HYPERVISOR.vm(VmId(i as u8)) {
            println!("VM {}: {:?}, {} vCPUs", i, vm.state(), vm.vcpu_count());
        }
    }
}

fn print_vm_detail(vm_idx: usize) {
    match HYPERVISOR.vm(VmId(vm_idx as u8)) {
        Some(vm) => println!("VM {}: {:?}", vm_idx, vm),
        None => println!("VM {}: no such VM", vm_idx),
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    uart_puts(b"\n!!! PANIC !!!\n");
    if let Some(location) = info.location() {
        uart_puts(location.file().as_bytes());
        uart_puts(b"\n");
    }
    loop {
        unsafe { core::arch::asm!("wfe") };
    }
}
