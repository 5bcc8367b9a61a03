//! Basic types for the memory subsystem: physical and virtual addresses,
//! frames, pages, and address ranges.
//!
//! Addresses are `usize` newtypes. A [`VirtualAddress`] is kept in canonical
//! form (on x86_64, bits 48..64 are a sign extension of bit 47); a
//! [`PhysicalAddress`] is masked to the architecturally valid width.
//! [`Frame`] and [`Page`] are page-number newtypes, so off-by-one-page bugs
//! become type errors rather than silent address arithmetic.

#![no_std]

use core::fmt;
use core::ops::{Add, AddAssign, Sub};

use bit_field::BitField;
use kernel_config::memory::{
    ENTRIES_PER_PAGE_TABLE, MAX_PAGE_NUMBER, PAGE_SHIFT, PAGE_SIZE, PAGE_TABLE_INDEX_BITS,
};

mod range;
pub use range::{LbaRange, VirtualRange};

cfg_if::cfg_if! {
if #[cfg(target_arch = "x86")] {
    #[inline]
    const fn canonicalize_virtual(addr: usize) -> usize {
        addr
    }
    #[inline]
    const fn canonicalize_physical(addr: usize) -> usize {
        addr
    }
} else {
    /// On x86_64, canonical virtual addresses sign-extend bit 47.
    #[inline]
    const fn canonicalize_virtual(addr: usize) -> usize {
        ((addr << 16) as isize >> 16) as usize
    }
    /// Physical addresses are at most 52 bits wide.
    #[inline]
    const fn canonicalize_physical(addr: usize) -> usize {
        addr & 0x000F_FFFF_FFFF_FFFF
    }
}
}

/// A physical memory address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysicalAddress(usize);

/// A virtual memory address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtualAddress(usize);

macro_rules! implement_address {
    ($TypeName:ident, $desc:literal, $canonicalize:ident) => {
        impl $TypeName {
            /// Creates a new address, returning `None` if it is not canonical.
            pub fn new(addr: usize) -> Option<$TypeName> {
                if $canonicalize(addr) == addr {
                    Some($TypeName(addr))
                } else {
                    None
                }
            }

            /// Creates a new address, forcing it into canonical form.
            pub const fn new_canonical(addr: usize) -> $TypeName {
                $TypeName($canonicalize(addr))
            }

            pub const fn zero() -> $TypeName {
                $TypeName(0)
            }

            #[inline]
            pub const fn value(&self) -> usize {
                self.0
            }

            /// The offset of this address within its page.
            #[inline]
            pub const fn page_offset(&self) -> usize {
                self.0 & (PAGE_SIZE - 1)
            }

            #[inline]
            pub const fn is_page_aligned(&self) -> bool {
                self.page_offset() == 0
            }

            pub const fn align_down_to_page(&self) -> $TypeName {
                $TypeName(self.0 & !(PAGE_SIZE - 1))
            }

            /// Rounds up to the next page boundary.
            /// Returns `None` on overflow.
            pub fn align_up_to_page(&self) -> Option<$TypeName> {
                let rounded = self.0.checked_add(PAGE_SIZE - 1)? & !(PAGE_SIZE - 1);
                Some($TypeName(rounded))
            }

            /// `self + offset`, checking both overflow and canonical form.
            pub fn checked_add(&self, offset: usize) -> Option<$TypeName> {
                self.0.checked_add(offset).and_then($TypeName::new)
            }

            pub fn checked_sub(&self, offset: usize) -> Option<$TypeName> {
                self.0.checked_sub(offset).and_then($TypeName::new)
            }
        }

        impl Add<usize> for $TypeName {
            type Output = $TypeName;
            fn add(self, rhs: usize) -> $TypeName {
                $TypeName::new_canonical(self.0.saturating_add(rhs))
            }
        }

        impl AddAssign<usize> for $TypeName {
            fn add_assign(&mut self, rhs: usize) {
                *self = *self + rhs;
            }
        }

        impl Sub<usize> for $TypeName {
            type Output = $TypeName;
            fn sub(self, rhs: usize) -> $TypeName {
                $TypeName::new_canonical(self.0.saturating_sub(rhs))
            }
        }

        impl Sub<$TypeName> for $TypeName {
            type Output = usize;
            /// The distance in bytes between two addresses.
            fn sub(self, rhs: $TypeName) -> usize {
                self.0.saturating_sub(rhs.0)
            }
        }

        impl fmt::Debug for $TypeName {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, concat!($desc, "({:#X})"), self.0)
            }
        }

        impl fmt::Display for $TypeName {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{:#X}", self.0)
            }
        }
    };
}

implement_address!(PhysicalAddress, "PhysicalAddress", canonicalize_physical);
implement_address!(VirtualAddress, "VirtualAddress", canonicalize_virtual);

impl VirtualAddress {
    /// The index into the paging hierarchy at the given level for this
    /// address. Level 1 is the terminal page table; the top level is
    /// [`kernel_config::memory::PAGE_TABLE_LEVELS`].
    pub fn page_table_index(&self, level: usize) -> usize {
        let page_number = self.0 >> PAGE_SHIFT;
        page_number.get_bits((level - 1) * PAGE_TABLE_INDEX_BITS..level * PAGE_TABLE_INDEX_BITS)
            & (ENTRIES_PER_PAGE_TABLE - 1)
    }
}

/// A physical memory frame: the page-sized unit of physical memory.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Frame {
    number: usize,
}

/// A virtual memory page.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Page {
    number: usize,
}

macro_rules! implement_page_frame {
    ($TypeName:ident, $desc:literal, $address:ident) => {
        impl $TypeName {
            /// The page-sized unit containing the given address.
            pub const fn containing_address(addr: $address) -> $TypeName {
                $TypeName { number: addr.value() / PAGE_SIZE }
            }

            /// The address of the first byte of this unit.
            pub const fn start_address(&self) -> $address {
                $address::new_canonical(self.number * PAGE_SIZE)
            }

            #[inline]
            pub const fn number(&self) -> usize {
                self.number
            }
        }

        impl Add<usize> for $TypeName {
            type Output = $TypeName;
            fn add(self, rhs: usize) -> $TypeName {
                $TypeName { number: core::cmp::min(MAX_PAGE_NUMBER, self.number.saturating_add(rhs)) }
            }
        }

        impl Sub<usize> for $TypeName {
            type Output = $TypeName;
            fn sub(self, rhs: usize) -> $TypeName {
                $TypeName { number: self.number.saturating_sub(rhs) }
            }
        }

        impl Sub<$TypeName> for $TypeName {
            type Output = usize;
            /// The distance between the two, in whole pages.
            fn sub(self, rhs: $TypeName) -> usize {
                self.number.saturating_sub(rhs.number)
            }
        }

        impl fmt::Debug for $TypeName {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, concat!($desc, "(#{} at {:#X})"), self.number, self.number * PAGE_SIZE)
            }
        }
    };
}

implement_page_frame!(Frame, "Frame", PhysicalAddress);
implement_page_frame!(Page, "Page", VirtualAddress);
