///! Test module for hypervisor
///!
///! This module contains various integration tests for the hypervisor.

pub mod test_global;
pub mod test_scheduler;
pub mod test_timer;
pub mod test_vm_activate;
pub mod test_vm_scheduler;

// Re-export test functions for easy access
pub use test_global::run_global_test;
pub use test_guest_loader::run_test as run_guest_loader_test;
pub use test_multi_vcpu::run_multi_vcpu_test;
pub use test_scheduler::run_scheduler_test;
pub use test_simple_guest::run_test as run_sync_trap_test;
#[allow(unused_imports)]
pub use test_timer::run_timer_test;
pub use test_vm_activate::run_vm_activate_test;
pub use test_vm_scheduler::run_vm_scheduler_test;
