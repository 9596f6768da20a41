//! Interrupt-safe spinlock.
//!
//! A spinlock that masks interrupts on the local core for the lifetime of
//! the guard. Required for any state shared with interrupt handlers; also
//! the locking discipline for every global in the VM crates, so a lock is
//! never taken recursively from an interrupt on the same core.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::cpu;

pub struct IrqSpinMutex<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: access to the inner value is serialised by the lock.
unsafe impl<T: Send> Sync for IrqSpinMutex<T> {}
unsafe impl<T: Send> Send for IrqSpinMutex<T> {}

impl<T> IrqSpinMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, masking interrupts on this core first.
    ///
    /// Interrupt state is restored when the guard is dropped.
    pub fn lock(&self) -> IrqSpinGuard<'_, T> {
        let saved_daif = cpu::irq_save_disable();
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
        IrqSpinGuard {
            mutex: self,
            saved_daif,
            // The guard must stay on the core that masked interrupts.
            _not_send: PhantomData,
        }
    }
}

pub struct IrqSpinGuard<'a, T> {
    mutex: &'a IrqSpinMutex<T>,
    saved_daif: u64,
    _not_send: PhantomData<*const ()>,
}

impl<T> Deref for IrqSpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the lock is held for the guard's lifetime.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for IrqSpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the lock is held for the guard's lifetime.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for IrqSpinGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.locked.store(false, Ordering::Release);
        cpu::irq_restore(self.saved_daif);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::vec::Vec;

    #[test]
    fn serialises_concurrent_increments() {
        let counter = Arc::new(IrqSpinMutex::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..10_000 {
                    *counter.lock() += 1;
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*counter.lock(), 80_000);
    }

    #[test]
    fn guard_releases_on_drop() {
        let m = IrqSpinMutex::new(5);
        {
            let mut g = m.lock();
            *g = 7;
        }
        assert_eq!(*m.lock(), 7);
    }
}
