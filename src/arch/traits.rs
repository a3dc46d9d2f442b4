//! Architecture-Portable Trait Definitions
//!
//! Abstracts the one hardware-specific operation the core dispatcher needs
//! that varies by trap-frame layout: advancing the guest PC past a trapped
//! instruction. Kept as a trait rather than inlined into `dispatch` so a
//! future non-AArch64 target only has to provide a new `VcpuContextOps` impl.

/// Architecture-specific vCPU context operations
pub trait VcpuContextOps {
    fn new(entry: u64, sp: u64) -> Self;
    fn pc(&self) -> u64;
    fn set_pc(&mut self, val: u64);
    fn sp(&self) -> u64;
    fn set_sp(&mut self, val: u64);
    fn get_reg(&self, n: u8) -> u64;
    fn set_reg(&mut self, n: u8, val: u64);
    /// Advance PC past the trapped instruction. `il` is ESR_EL2.IL: 2 bytes
    /// for a 16-bit Thumb instruction, 4 bytes otherwise.
    fn advance_pc(&mut self, il: bool);
}
