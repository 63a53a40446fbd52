//! Small helpers that don't belong anywhere else.

pub mod bits;
pub mod bitmap;

pub use bits::Bits;
pub use bitmap::{BitMap, BitMapLen};
