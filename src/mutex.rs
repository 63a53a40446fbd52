//! A common Mutex interface.
//!
//! Nothing here implements poisoning! If you panic while having locked one of
//! these mutexes, no guarantees about what happens next!
//!
//! (We are okay with this because, as configured, we can't recover from panics
//! on embedded anyways — our panic handler just spins forever.)
//!
//! The thing being guarded is the disk singleton in `bindings`: the USB
//! transport pokes it from interrupt context while the main loop ticks
//! `process`, so a critical section here means "the USB interrupt cannot
//! fire". All flavors are const-constructible so the singleton can live in
//! a plain `static`.

pub trait MutexInterface<T>: Sync {
    // Run a function in a critical section:
    fn cs<F: FnOnce(&mut T) -> R, R>(&self, func: F) -> R;

    // Get mutable access to the inner data *using a mutable reference*.
    // Since Rust can statically prove that we have exclusive access in this
    // case, no locking occurs.
    fn get_mut(&mut self) -> &mut T;
}

#[cfg(not(feature = "no_std"))]
pub mod from_std {
    use super::MutexInterface;

    pub use std::sync::Mutex;

    impl<T: Send> MutexInterface<T> for Mutex<T> {
        #[inline]
        fn cs<F: FnOnce(&mut T) -> R, R>(&self, func: F) -> R {
            let mut inner = self.lock().unwrap();

            func(&mut *inner)
        }

        #[inline]
        fn get_mut(&mut self) -> &mut T {
            self.get_mut().unwrap()
        }
    }
}

#[cfg(feature = "external_mutex")]
pub mod external_mutex {
    use super::MutexInterface;

    use core::cell::Cell;

    extern "C" {
        /// Masks the USB interrupt — the only other context that touches
        /// the disk — for the duration of the critical section.
        pub fn cfgdisk_irq_mask();
        pub fn cfgdisk_irq_unmask();
    }

    pub struct Mutex<T> {
        inner: Cell<T>,
    }

    impl<T> Mutex<T> {
        pub const fn new(inner: T) -> Self {
            Self { inner: Cell::new(inner) }
        }
    }

    impl<T: Send> MutexInterface<T> for Mutex<T> {
        #[inline]
        fn cs<F: FnOnce(&mut T) -> R, R>(&self, func: F) -> R {
            unsafe { cfgdisk_irq_mask(); }

            let res = func(unsafe { &mut *self.inner.as_ptr() });

            unsafe { cfgdisk_irq_unmask(); }

            res
        }

        #[inline]
        fn get_mut(&mut self) -> &mut T {
            self.inner.get_mut()
        }
    }

    // It's Sync! The people who implemented the IRQ masking promised!
    unsafe impl<T> Sync for Mutex<T> where T: Send { }
}

// We exclude this when external is enabled so that non-cortex M ARM users can
// still build this crate: cortex_m should compile for them but it will not
// actually provide the functions that we use below.
//
// Unfortunately, users in this situation will get a cryptic error about the
// cortex_m crate not having certain functions. In order to use this crate, such
// users must enable the "external_mutex" feature and provide their own IRQ
// mask/unmask hooks.
#[cfg(all(target_arch = "arm"))]
pub mod bare_metal {
    use super::MutexInterface;

    use core::cell::Cell;

    use bare_metal::CriticalSection;
    use cortex_m::interrupt;

    // Unfortunately, the `bare_metal::Mutex` does not provide us with a mutable
    // reference to the type it wraps so we basically go and reconstruct it
    // here:

    pub struct Mutex<T> {
        inner: Cell<T>,
    }

    impl<T> Mutex<T> {
        pub const fn new(inner: T) -> Self {
            Mutex { inner: Cell::new(inner) }
        }

        /// Borrows the data for the duration of the critical section.
        #[inline]
        pub fn borrow<'cs>(&'cs self, _cs: &'cs CriticalSection) -> &'cs mut T {
            unsafe { &mut *self.inner.as_ptr() }
        }
    }

    impl<T: Send> MutexInterface<T> for Mutex<T> {
        #[inline]
        fn cs<F: FnOnce(&mut T) -> R, R>(&self, func: F) -> R {
            interrupt::free(|cs| {
                func(self.borrow(cs))
            })
        }

        #[inline]
        fn get_mut(&mut self) -> &mut T {
            self.inner.get_mut()
        }
    }

    // As with the actual `bare_metal::Mutex`:
    unsafe impl<T> Sync for Mutex<T> where T: Send {}
}

//  ARM  | no_std | no bindings | → default mutex = ((cortex-m) bare_metal or error), or external (on feat)
//  ARM  | no_std |    bindings | → default mutex = ((cortex-m) bare_metal or error), or external (on feat)
//  ARM  |    std | no bindings | → default mutex = std, or external (on feat)
//  ARM  |    std |    bindings | → default mutex = std, or external (on feat)
// Other |    std | no bindings | → default mutex = std, or external (on feat)
// Other |    std |    bindings | → default mutex = std, or external (on feat)
// Other | no_std | no bindings | → default mutex = error, external (on feat)
// Other | no_std |    bindings | → default mutex = error, external (on feat)

cfg_if::cfg_if! {
    if #[cfg(feature = "external_mutex")] {
        pub use external_mutex::Mutex;
    } else if #[cfg(all(target_arch = "arm", feature = "no_std"))] {
        pub use bare_metal::Mutex;
    } else if #[cfg(not(feature = "no_std"))] {
        pub use from_std::Mutex;
    } else if #[cfg(feature = "no_std")] {
        compile_error!("Please enable the `external_mutex` feature and provide \
            IRQ mask/unmask hooks.");
    } else {
        compile_error!("Unreachable!!");
    }
}

#[cfg(all(test, not(feature = "external_mutex")))]
mod mutex {
    use super::{Mutex, MutexInterface};

    use assert_eq as eq;

    #[test]
    fn cs_gives_exclusive_access() {
        let m = Mutex::new(7u32);

        let doubled = m.cs(|v| {
            *v *= 2;
            *v
        });

        eq!(doubled, 14);
        eq!(m.cs(|v| *v), 14);
    }

    #[test]
    fn get_mut_skips_locking() {
        let mut m = Mutex::new(1u32);
        *MutexInterface::get_mut(&mut m) = 9;
        eq!(m.cs(|v| *v), 9);
    }
}
