//! EL2 Hypervisor-specific code
//!
//! Owns the assembly boundary: the `extern "C"` entry points the vector
//! stubs call into once guest state has been spilled to a `VcpuContext`.

pub mod exception;

pub use exception::*;
