//! Stage-2 fault & MMIO router (§4.E).
//!
//! Decodes a trapped data abort's guest-physical address against the three
//! windows this platform unmaps at stage 2 (GICD, GICC, PL011 — GICH is
//! hypervisor-only and never legitimately faulted by a guest) and emulates
//! the access against the corresponding virtual device. GICH's 64 KiB is
//! part of the unmapped region but carries no guest-facing register model;
//! a guest access there is logged and skipped like any other unhandled
//! fault.

use crate::platform::{GICC_BASE, GICC_SIZE, GICD_BASE, GICD_SIZE, UART_BASE, UART_SIZE};
use crate::vgic::{VGicCpu, VGicDistributor};
use crate::vpl011::VPl011;

const GICD_CTLR: u64 = 0x000;
const GICD_TYPER: u64 = 0x004;
const GICD_IIDR: u64 = 0x008;
const GICD_ISENABLER_BASE: u64 = 0x100;
const GICD_ICENABLER_BASE: u64 = 0x180;
const GICD_IPRIORITYR_BASE: u64 = 0x400;

const GICC_CTLR: u64 = 0x000;
const GICC_PMR: u64 = 0x004;
const GICC_IAR: u64 = 0x00C;
const GICC_EOIR: u64 = 0x010;

/// Classify `gpa` into one of the trapped windows. `None` means the fault
/// falls outside every emulated device (including the GICH window).
pub enum Window {
    Gicd(u64),
    Gicc(u64),
    Pl011(u64),
}

pub fn classify(gpa: u64) -> Option<Window> {
    if (GICD_BASE..GICD_BASE + GICD_SIZE).contains(&gpa) {
        Some(Window::Gicd(gpa - GICD_BASE))
    } else if (GICC_BASE..GICC_BASE + GICC_SIZE).contains(&gpa) {
        Some(Window::Gicc(gpa - GICC_BASE))
    } else if (UART_BASE..UART_BASE + UART_SIZE).contains(&gpa) {
        Some(Window::Pl011(gpa - UART_BASE))
    } else {
        None
    }
}

/// Emulate a trapped GICD access. Returns the read value when `fault` is a
/// read.
pub fn handle_gicd(
    offset: u64,
    is_write: bool,
    write_value: u32,
    distributor: &mut VGicDistributor,
    vgic_cpu: &mut VGicCpu,
) -> Option<u32> {
    match offset {
        GICD_CTLR => {
            if is_write {
                distributor.ctlr = write_value;
                None
            } else {
                Some(distributor.ctlr)
            }
        }
        GICD_TYPER => (!is_write).then_some(distributor.typer),
        GICD_IIDR => (!is_write).then_some(distributor.iidr),
        off if (GICD_ISENABLER_BASE..GICD_ISENABLER_BASE + 32 * 4).contains(&off) => {
            let n = (off - GICD_ISENABLER_BASE) / 4;
            if is_write {
                set_enable_bits(n, write_value, true, distributor, vgic_cpu);
                None
            } else {
                Some(read_enable_bits(n, distributor, vgic_cpu))
            }
        }
        off if (GICD_ICENABLER_BASE..GICD_ICENABLER_BASE + 32 * 4).contains(&off) => {
            let n = (off - GICD_ICENABLER_BASE) / 4;
            if is_write {
                set_enable_bits(n, write_value, false, distributor, vgic_cpu);
                None
            } else {
                Some(read_enable_bits(n, distributor, vgic_cpu))
            }
        }
        off if (GICD_IPRIORITYR_BASE..GICD_IPRIORITYR_BASE + 1020).contains(&off) => {
            let id = (off - GICD_IPRIORITYR_BASE) as u32;
            if is_write {
                let priority = (write_value & 0xFF) as u8;
                if id < 32 {
                    vgic_cpu.sgi_ppi_ipriorityr[id as usize] = priority;
                } else {
                    distributor.set_priority(id, priority);
                }
                None
            } else {
                let priority =
                    if id < 32 { vgic_cpu.sgi_ppi_ipriorityr[id as usize] } else { distributor.priority(id) };
                Some(priority as u32)
            }
        }
        _ => (!is_write).then_some(0),
    }
}

fn set_enable_bits(
    word: u64,
    value: u32,
    enable: bool,
    distributor: &mut VGicDistributor,
    vgic_cpu: &mut VGicCpu,
) {
    if word == 0 {
        if enable {
            vgic_cpu.sgi_ppi_isenabler |= value;
        } else {
            vgic_cpu.sgi_ppi_isenabler &= !value;
        }
        return;
    }
    let base_id = (word as u32 - 1) * 32 + 32;
    for bit in 0..32u32 {
        if value & (1 << bit) != 0 {
            let id = base_id + bit;
            if enable {
                distributor.enable_spi(id);
            } else {
                distributor.disable_spi(id);
            }
        }
    }
}

fn read_enable_bits(word: u64, distributor: &VGicDistributor, vgic_cpu: &VGicCpu) -> u32 {
    if word == 0 {
        return vgic_cpu.sgi_ppi_isenabler;
    }
    let base_id = (word as u32 - 1) * 32 + 32;
    let mut result = 0u32;
    for bit in 0..32u32 {
        if distributor.is_spi_enabled(base_id + bit) {
            result |= 1 << bit;
        }
    }
    result
}

/// Emulate a trapped GICC access (§4.E — GICv2 CPU interface is trapped
/// rather than passed through via a virtual-CPU-interface MMIO alias).
pub fn handle_gicc(offset: u64, is_write: bool, write_value: u32, vgic_cpu: &mut VGicCpu) -> Option<u32> {
    match offset {
        GICC_CTLR => {
            if is_write {
                None // group enable is implied by HCR.En; nothing to store
            } else {
                Some(1)
            }
        }
        GICC_PMR => (!is_write).then_some(0xFF),
        GICC_IAR => (!is_write).then_some(vgic_cpu.read_iar()),
        GICC_EOIR => {
            if is_write {
                vgic_cpu.write_eoir(write_value & 0x3FF);
            }
            None
        }
        _ => None,
    }
}

/// Emulate a trapped vPL011 access.
pub fn handle_pl011(offset: u64, is_write: bool, write_value: u32, uart: &mut VPl011) -> (Option<u32>, Option<u8>) {
    if is_write {
        let echoed = uart.write(offset, write_value);
        (None, echoed)
    } else {
        (Some(uart.read(offset)), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::UART_SPI_INTID;

    #[test]
    fn classify_routes_gicd_gicc_and_uart() {
        assert!(matches!(classify(GICD_BASE + 4), Some(Window::Gicd(4))));
        assert!(matches!(classify(GICC_BASE + 0xC), Some(Window::Gicc(0xC))));
        assert!(matches!(classify(UART_BASE), Some(Window::Pl011(0))));
        assert!(classify(0xDEAD_0000).is_none());
    }

    #[test]
    fn gicd_isenabler0_sets_ppi_enable_bit() {
        let mut d = VGicDistributor::new();
        let mut cpu = VGicCpu::new(0);
        cpu.sgi_ppi_isenabler = 0;
        handle_gicd(GICD_ISENABLER_BASE, true, 1 << 27, &mut d, &mut cpu);
        assert_eq!(cpu.sgi_ppi_isenabler & (1 << 27), 1 << 27);
    }

    #[test]
    fn gicd_isenabler1_enables_spi_32() {
        let mut d = VGicDistributor::new();
        let mut cpu = VGicCpu::new(0);
        handle_gicd(GICD_ISENABLER_BASE + 4, true, 1, &mut d, &mut cpu);
        assert!(d.is_spi_enabled(32));
    }

    #[test]
    fn gicc_iar_and_eoir_roundtrip() {
        let mut cpu = VGicCpu::new(0);
        cpu.inject_sgi(5, 0);
        let vintid = handle_gicc(GICC_IAR, false, 0, &mut cpu).unwrap();
        assert_eq!(vintid, 5);
        handle_gicc(GICC_EOIR, true, vintid, &mut cpu);
        assert_eq!(cpu.elsr0 & 1, 1);
    }

    #[test]
    fn pl011_dr_write_produces_echo_byte() {
        let mut uart = VPl011::new();
        let (value, echo) = handle_pl011(crate::vpl011::DR, true, b'Q' as u32, &mut uart);
        assert!(value.is_none());
        assert_eq!(echo, Some(b'Q'));
    }

    #[test]
    fn pl011_pending_irq_after_rx_matches_uart_spi() {
        let mut uart = VPl011::new();
        uart.write(crate::vpl011::IMSC, 1 << 4);
        uart.inject_rx_char(b'A');
        assert_eq!(uart.pending_irq(), Some(UART_SPI_INTID));
    }
}
