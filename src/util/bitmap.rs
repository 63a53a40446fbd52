//! Home of `BitMap`.

use super::Bits;

use generic_array::{ArrayLength, GenericArray};
use typenum::consts::{U1, U8};
use typenum::marker_traits::Unsigned;

use core::marker::PhantomData;
use core::ops::{Add, Div};

pub trait BitMapLen
where
    Self: Div<U8>,
    Self: Unsigned,
    // Unfortunately if we put these here, users of this trait have to prove
    // that their type satisfies these constraints instead of the type being
    // implicitly required to meet these constraints. This defeats the purpose
    // of having this trait in the first place so instead we have a blanket impl
    // with these requirements and we make this a sealed trait.
    Self: bitmap_len_private::Sealed,
{
    type ArrLen: ArrayLength<u8>;
}

mod bitmap_len_private {
    use super::*;
    pub trait Sealed { }

    impl<T> Sealed for T
    where
        T: Div<U8>,
        // In the case where Len is a multiple of 8 this will waste a byte,
        // which is okay, I think.
        <T as Div<U8>>::Output: Add<U1>,
        <<T as Div<U8>>::Output as Add<U1>>::Output: ArrayLength<u8>,
    { }
}

impl<T: bitmap_len_private::Sealed> BitMapLen for T
where
    T: Div<U8>,
    T: Unsigned,
    // In the case where Len is a multiple of 8 this will waste a byte, which is
    // okay, I think.
    <T as Div<U8>>::Output: Add<U1>,
    <<T as Div<U8>>::Output as Add<U1>>::Output: ArrayLength<u8>,
{
    type ArrLen = <<T as Div<U8>>::Output as Add<U1>>::Output;
}

// A bad version of BitVec, I guess.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitMap<LEN: BitMapLen> {
    arr: GenericArray<u8, LEN::ArrLen>,

    // Helper variables to speed up some queries:
    length: usize,
    num_set_bits: usize,
    first_set_hint: usize,

    _l: PhantomData<LEN>,
}

#[allow(non_camel_case_types)]
impl<LEN: BitMapLen> BitMap<LEN> {
    pub fn new() -> Self {
        Self {
            arr: Default::default(),

            length: LEN::to_usize(),
            num_set_bits: 0,
            first_set_hint: 0,

            _l: PhantomData,
        }
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn set_bits(&self) -> usize {
        self.num_set_bits
    }

    pub fn none_set(&self) -> bool {
        self.num_set_bits == 0
    }

    pub fn clear_all(&mut self) {
        // Optimizer, save us.
        for b in 0..self.length() {
            let _ = self.set(b, false).unwrap();
        }
    }

    pub fn set_all(&mut self) {
        for b in 0..self.length() {
            let _ = self.set(b, true).unwrap();
        }
    }

    // Returns `Ok` if in bounds and `Err` otherwise.
    fn in_bounds(&self, bit: usize) -> Result<(), ()> {
        if (0..self.length()).contains(&bit) {
            Ok(())
        } else {
            Err(())
        }
    }

    // Returns `Ok(idx, offset)` if in bounds and `Err` if not in bounds.
    fn bit_to_idx(&self, bit: usize) -> Result<(usize, usize), ()> {
        self.in_bounds(bit).map(|()| {
            ((bit / 8), (bit % 8))
        })
    }

    // Returns `Ok(bool)` if in bounds and `Err` otherwise.
    pub fn get(&self, bit: usize) -> Result<bool, ()> {
        self.bit_to_idx(bit).map(|(idx, offset)| {
            self.arr[idx].b(offset as u32)
        })
    }

    // Returns the previous value of the bit.
    //
    // Returns an `Err` if out of bounds.
    pub fn set(&mut self, bit: usize, val: bool) -> Result<bool, ()> {
        self.bit_to_idx(bit).map(|(idx, offset)| {
            let prev: bool = self.arr[idx].b(offset as u32);
            self.arr[idx].set_bit(offset as u32, val);

            match (prev, val) {
                (false, true) => {
                    self.num_set_bits += 1;
                    if bit < self.first_set_hint {
                        self.first_set_hint = bit;
                    }
                },
                (true, false) => self.num_set_bits -= 1,

                (true, true) | (false, false) => { },
            }

            prev
        })
    }

    // Returns `Err` if no bits are set.
    pub fn first_set(&mut self) -> Result<usize, ()> {
        if self.num_set_bits == 0 {
            return Err(());
        }

        // The hint only ever trails the true first set bit, so a sweep from
        // it (wrapping) is enough.
        for b in (self.first_set_hint..self.length()).chain(0..self.first_set_hint) {
            if self.get(b).unwrap() {
                self.first_set_hint = b;
                return Ok(b);
            }
        }

        Err(())
    }
}

#[cfg(test)]
mod bitmap {
    use super::*;
    use typenum::consts::U16;

    use assert_eq as eq;

    #[test]
    fn basic() {
        let mut b = BitMap::<U16>::new();

        eq!(b.length(), 16);
        eq!(b.set_bits(), 0);
        assert!(b.none_set());

        // Get:
        for idx in 0..16 {
            eq!(b.get(idx), Ok(false));
        }

        // Get out of range:
        eq!(b.get(16), Err(()));

        // Set and drain via first_set:
        b.set(9, true).unwrap();
        b.set(3, true).unwrap();
        eq!(b.set_bits(), 2);

        eq!(b.first_set(), Ok(3));
        b.set(3, false).unwrap();
        eq!(b.first_set(), Ok(9));
        b.set(9, false).unwrap();
        eq!(b.first_set(), Err(()));
        assert!(b.none_set());
    }

    #[test]
    fn set_all_then_clear_all() {
        let mut b = BitMap::<U16>::new();

        b.set_all();
        eq!(b.set_bits(), 16);
        eq!(b.first_set(), Ok(0));

        b.clear_all();
        eq!(b.set_bits(), 0);
        eq!(b.length(), 16);
    }

    #[test]
    fn set_reports_previous_value() {
        let mut b = BitMap::<U16>::new();

        eq!(b.set(5, true), Ok(false));
        eq!(b.set(5, true), Ok(true));
        eq!(b.set_bits(), 1);

        eq!(b.set(5, false), Ok(true));
        eq!(b.set(5, false), Ok(false));
        eq!(b.set_bits(), 0);
    }
}
