//! # Internal Macros
//!
//! Accessor generation for zerocopy structs whose fields use little-endian
//! wrapper types (U16, U32, U64).
//!
//! ```ignore
//! #[repr(C)]
//! struct Header {
//!     prev: U32,
//!     level: U16,
//! }
//!
//! impl Header {
//!     zerocopy_accessors! {
//!         prev: u32,
//!         level: u16,
//!     }
//! }
//!
//! // Generates:
//! // pub fn prev(&self) -> u32 { self.prev.get() }
//! // pub fn set_prev(&mut self, val: u32) { self.prev = U32::new(val); }
//! // pub fn level(&self) -> u16 { self.level.get() }
//! // pub fn set_level(&mut self, val: u16) { self.level = U16::new(val); }
//! ```

/// Generates getter and setter methods for zerocopy little-endian fields.
#[macro_export]
macro_rules! zerocopy_accessors {
    (@impl $field:ident, u16) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u16 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u16) {
                self.$field = ::zerocopy::little_endian::U16::new(val);
            }
        }
    };
    (@impl $field:ident, u32) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u32 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u32) {
                self.$field = ::zerocopy::little_endian::U32::new(val);
            }
        }
    };
    (@impl $field:ident, u64) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u64 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u64) {
                self.$field = ::zerocopy::little_endian::U64::new(val);
            }
        }
    };
    ($($field:ident : $ty:tt),* $(,)?) => {
        $(
            $crate::zerocopy_accessors!(@impl $field, $ty);
        )*
    };
}
