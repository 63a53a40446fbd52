
// Mark the crate as no_std if the feature is enabled (and only)
#![cfg_attr(all(feature = "no_std", not(test)), no_std)]

//! A virtual FAT12 disk that exposes one configuration file (`CONFIG.TXT`)
//! to a USB mass-storage host, backed by MCU-internal flash.
//!
//! The disk image lives in RAM; host reads are served straight out of it
//! and host writes are filtered (macOS loves to scribble `._*` metadata
//! into our data clusters) before they land. Accepted edits are parsed
//! against a registry of typed entries, re-serialized in canonical form,
//! and flushed to flash once the host has gone quiet for a bit, so that
//! flash is never erased from the USB transport context.

#[allow(unused_extern_crates)]
extern crate core; // makes rls actually look into the standard library (hack)

#[cfg_attr(target_os = "none", panic_handler)]
#[cfg(target_os = "none")]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}

macro_rules! using_std { ($($i:item)*) => ($(#[cfg(not(feature = "no_std"))]$i)*) }


#[cfg(feature = "bindings")]
pub mod bindings;

pub mod mutex;

pub mod flash;
pub mod fat;

pub mod registry;
pub mod codec;
pub mod gatekeeper;
pub mod disk;

pub mod util;

pub use disk::Disk;
pub use flash::{EraseGranularity, Flash};
pub use registry::Registry;
