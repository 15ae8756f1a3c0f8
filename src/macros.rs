#![macro_use]

pub(crate) const fn range_mask(range: std::ops::Range<usize>) -> u64 {
    if range.end % 64 == 0 {
        !((1u64 << range.start % 64) - 1)
    } else {
        ((1u64 << range.end % 64) - 1) & !((1u64 << range.start % 64) - 1)
    }
}

pub(crate) fn value_at_mask(value: impl Into<u64>, mask: u64) -> u64 {
    if mask == 0 {
        if cfg!(debug_assertions) {
            panic!("value mask is zero");
        } else {
            unsafe {
                std::hint::unreachable_unchecked();
            }
        }
    }

    let value = value.into();
    let res = value << mask.trailing_zeros();
    debug_assert!(
        res & !mask == 0,
        "value {value} is wider than mask {:#x}",
        mask
    );
    res
}

/// Implement basic methods for bit-layout word types.
macro_rules! impl_word_basic_methods {
    ($WordT:ty, $Store:ty, $bits:expr) => {
        impl $WordT {
            /// Create a zeroed word.
            pub fn new() -> Self {
                Self(::bitvec::prelude::bitarr![$Store, ::bitvec::prelude::Lsb0; 0; $bits])
            }

            ::paste::paste! {
                /// Interpret an integer as a word.
                pub fn [<from_u $bits>](value: [<u $bits>]) -> Self {
                    let mut word = Self::new();
                    word.0.store_le(value);
                    word
                }

                /// Interpret the word as an integer.
                pub fn [<as_u $bits>](&self) -> [<u $bits>] {
                    self.0.load_le()
                }
            }
        }

        impl Default for $WordT {
            fn default() -> Self {
                Self::new()
            }
        }
    }
}

/// Implement setters and getters for word fields.
/// Must use within an `impl` block.
macro_rules! define_field_accessor {
    ($field:ident, $FieldT:ty, $range:expr) => {
        pub fn $field(self) -> $FieldT {
            self.0[$range].load_le()
        }

        ::paste::paste! {
            pub fn [<set_ $field>](&mut self, value: $FieldT) {
                self.0[$range].store_le(value);
            }
        }
    };

    ($field:ident, $FieldT:ty, $range:expr, WITH_MASK) => {
        pub fn $field(self) -> $FieldT {
            self.0[$range].load_le()
        }

        ::paste::paste! {
            pub fn [<set_ $field>](&mut self, value: $FieldT) {
                self.0[$range].store_le(value);
            }

            #[allow(non_upper_case_globals)]
            pub const [<MASK_ $field>]: u64 = crate::macros::range_mask($range);
        }
    };
}

/// Generate a mask of the specified fields.
macro_rules! mask_of {
    ($WordT:ty: $($field:ident),* $(,)*) => {
        ::paste::paste! {
            $(
                $WordT::[<MASK_ $field>]
            )|*
        }
    };
}

/// Generate a bit representation that puts the specified fields at the given positions.
macro_rules! bit_repr_of {
    ($WordT:ty: { $($field:ident: $val:expr),* $(,)* }) => {
        ::paste::paste! {
            $(
                crate::macros::value_at_mask($val, $WordT::[<MASK_ $field>])
            )|*
        }
    };
}
