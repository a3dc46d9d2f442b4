use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, Ordering};

pub struct SpinLock<T> {
    next_ticket: AtomicU32,
    now_serving: AtomicU32,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
    ticket: u32,
}

impl<T> SpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            next_ticket: AtomicU32::new(0),
            now_serving: AtomicU32::new(0),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        while self.now_serving.load(Ordering::Acquire) != ticket {
            core::hint::spin_loop(); // WFE on ARM64
        }
        SpinLockGuard { lock: self, ticket }
    }
}

impl<T> core::ops::Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> core::ops::DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock
            .now_serving
            .store(self.ticket + 1, Ordering::Release);
        // SEV wakes any cores spinning in WFE-based spin loops.
        // Currently spin_loop() emits YIELD, but SEV is cheap and
        // future-proofs against switching to WFE.
        #[cfg(target_arch = "aarch64")]
        unsafe { core::arch::asm!("sev", options(nostack, nomem)) };
    }
}

use crate::platform::MAX_SMP_CPUS;
use core::sync::atomic::AtomicI32;

const NO_OWNER: i32 = -1;

/// Recursive mutex with an explicit FIFO wait list and IPI-based wakeup,
/// for the longer critical sections (scheduler runqueues, vGIC state)
/// where a spinning `SpinLock` would waste cycles on a blocked pCPU.
///
/// Contended pCPUs enqueue themselves and `wfi`; the unlocking pCPU pops
/// the FIFO head and sends it a wakeup SGI rather than relying on every
/// waiter polling.
pub struct Mutex<T> {
    owner: AtomicI32,
    recursion: AtomicU32,
    wait_queue: WaitQueue,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for Mutex<T> {}
unsafe impl<T: Send> Send for Mutex<T> {}

struct WaitQueue {
    slots: [AtomicI32; MAX_SMP_CPUS],
    head: AtomicU32,
    tail: AtomicU32,
}

impl WaitQueue {
    const fn new() -> Self {
        const EMPTY: AtomicI32 = AtomicI32::new(NO_OWNER);
        Self {
            slots: [EMPTY; MAX_SMP_CPUS],
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
        }
    }

    fn push(&self, cpu_id: u32) {
        let pos = self.tail.fetch_add(1, Ordering::Relaxed) as usize % MAX_SMP_CPUS;
        self.slots[pos].store(cpu_id as i32, Ordering::Release);
    }

    fn pop(&self) -> Option<u32> {
        loop {
            let head = self.head.load(Ordering::Relaxed);
            if head == self.tail.load(Ordering::Acquire) {
                return None;
            }
            let pos = head as usize % MAX_SMP_CPUS;
            let cpu = self.slots[pos].swap(NO_OWNER, Ordering::Acquire);
            self.head.fetch_add(1, Ordering::Relaxed);
            if cpu != NO_OWNER {
                return Some(cpu as u32);
            }
        }
    }
}

pub struct MutexGuard<'a, T> {
    lock: &'a Mutex<T>,
}

impl<T> Mutex<T> {
    pub const fn new(data: T) -> Self {
        Self {
            owner: AtomicI32::new(NO_OWNER),
            recursion: AtomicU32::new(0),
            wait_queue: WaitQueue::new(),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        let cpu = crate::percpu::current_cpu_id() as i32;
        loop {
            match self
                .owner
                .compare_exchange(NO_OWNER, cpu, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => {
                    self.recursion.store(1, Ordering::Relaxed);
                    break;
                }
                Err(current) if current == cpu => {
                    self.recursion.fetch_add(1, Ordering::Relaxed);
                    break;
                }
                Err(_) => {
                    self.wait_queue.push(cpu as u32);
                    #[cfg(target_arch = "aarch64")]
                    unsafe { core::arch::asm!("wfe", options(nostack, nomem)) };
                }
            }
        }
        MutexGuard { lock: self }
    }

    fn unlock(&self) {
        if self.recursion.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.owner.store(NO_OWNER, Ordering::Release);
            if let Some(target_cpu) = self.wait_queue.pop() {
                #[cfg(target_arch = "aarch64")]
                crate::arch::aarch64::peripherals::gic::GICD
                    .send_sgi(crate::platform::IPI_SCHED, 1u8 << (target_cpu as u8));
            }
        }
    }
}

impl<T> core::ops::Deref for MutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> core::ops::DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
