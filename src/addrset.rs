//! Address intervals: contiguous ranges of 48-bit or 64-bit link-layer
//! addresses.
//!
//! An [`AddrInterval`] is the value type everything else in this crate is
//! built on. It represents a contiguous block of addresses either as
//! (base, count) or as (base, alignment mask). The mask form exists because
//! the wire format carries counts in 16 bits: any block larger than 65535
//! addresses must be expressed as a power-of-two-aligned block instead.
//!
//! The high nibble of an address's first octet encodes its administrative
//! class ("slap" bits): the multicast bit, the locally-administered bit, and
//! the ELI/SAI/AAI quadrant selectors. Those predicates live here because
//! both the codec (control-word bookkeeping) and the allocator (pool class
//! selection) need them.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Address width carried by an interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddrWidth {
    /// Standard 48-bit MAC addresses (6 octets on the wire).
    Bits48,
    /// Extended 64-bit addresses (8 octets on the wire).
    Bits64,
}

/// How the `value` field of an interval is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntervalForm {
    /// `value` is the number of addresses in the block.
    Count,
    /// `value` is a prefix-of-ones alignment mask; the block covers every
    /// address sharing the masked bits of `base`.
    Mask,
}

// Slap class bits. These share the bit layout of the control word's low
// byte, so `slap_class` can be ORed straight into a packet header.
pub const CLASS_AAI: u8 = 1 << 0;
pub const CLASS_ELI: u8 = 1 << 1;
pub const CLASS_SAI: u8 = 1 << 2;
pub const CLASS_64: u8 = 1 << 4;
pub const CLASS_MULTICAST: u8 = 1 << 5;

// Bit positions inside the slap nibble of the first octet.
const M_BIT: u8 = 1 << 0;
const X_BIT: u8 = 1 << 1;
const Y_BIT: u8 = 1 << 2;
const Z_BIT: u8 = 1 << 3;

const ADDR48_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;
const MASK48_HIGH: u64 = 0xFFFF_0000_0000_0000;

/// The temporary source range clients probe from while discovering.
pub const PROBE_SOURCE_RANGE: AddrInterval =
    AddrInterval::from_count(0x2a00_0000_0000, 0xffff_ffff + 1);

/// Well-known self-assignment range for 48-bit unicast addresses.
pub const AUTOASSIGN_UNICAST: AddrInterval =
    AddrInterval::from_count(0x0a00_0000_0000, 0xff_ffff_ffff + 1);

/// Well-known self-assignment range for 48-bit multicast addresses.
pub const AUTOASSIGN_MULTICAST: AddrInterval =
    AddrInterval::from_count(0x0b00_0000_0000, 0xff_ffff_ffff + 1);

/// Well-known self-assignment range for 64-bit unicast addresses.
pub const AUTOASSIGN_UNICAST_64: AddrInterval =
    AddrInterval::from_count(0x0a00_0000_0000_0000, 0xff_ffff_ffff_ffff + 1);

/// Well-known self-assignment range for 64-bit multicast addresses.
pub const AUTOASSIGN_MULTICAST_64: AddrInterval =
    AddrInterval::from_count(0x0b00_0000_0000_0000, 0xff_ffff_ffff_ffff + 1);

/// Largest unicast block a client may self-assign without a server.
pub const MAX_AUTOASSIGN_UNICAST: u64 = 16;

/// Converts a prefix-of-ones mask into the number of addresses it covers.
fn mask_to_count(mask: u64) -> u64 {
    let zeros = mask.trailing_zeros();
    if zeros >= 64 {
        u64::MAX
    } else {
        1u64 << zeros
    }
}

/// A contiguous interval of link-layer addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddrInterval {
    /// First address of the block. Aligned to `value` in mask form.
    pub base: u64,
    /// Count or alignment mask, depending on `form`.
    pub value: u64,
    pub width: AddrWidth,
    pub form: IntervalForm,
}

impl Default for AddrInterval {
    fn default() -> Self {
        Self::from_count(0, 1)
    }
}

impl AddrInterval {
    /// Creates a count-form interval, inferring the width from the base
    /// address: anything above the 48-bit space is treated as 64-bit.
    pub const fn from_count(base: u64, count: u64) -> Self {
        if base > ADDR48_MASK {
            Self {
                base,
                value: count,
                width: AddrWidth::Bits64,
                form: IntervalForm::Count,
            }
        } else {
            Self {
                base: base & ADDR48_MASK,
                value: count,
                width: AddrWidth::Bits48,
                form: IntervalForm::Count,
            }
        }
    }

    /// Creates a count-form interval with an explicit width.
    pub fn from_count_with(base: u64, count: u64, width: AddrWidth) -> Self {
        let base = match width {
            AddrWidth::Bits48 => base & ADDR48_MASK,
            AddrWidth::Bits64 => base,
        };
        Self {
            base,
            value: count,
            width,
            form: IntervalForm::Count,
        }
    }

    /// Creates a mask-form interval. The base is aligned down to the mask;
    /// 48-bit masks are widened to full prefix-of-ones form internally.
    pub fn from_mask(base: u64, mask: u64, width: AddrWidth) -> Self {
        let mut base = base & mask;
        let mut mask = mask;
        if width == AddrWidth::Bits48 {
            base &= ADDR48_MASK;
            mask |= MASK48_HIGH;
        }
        Self {
            base,
            value: mask,
            width,
            form: IntervalForm::Mask,
        }
    }

    /// Number of octets this interval's addresses occupy on the wire.
    pub fn addr_len(&self) -> usize {
        match self.width {
            AddrWidth::Bits48 => 6,
            AddrWidth::Bits64 => 8,
        }
    }

    /// The slap nibble: the low four bits of the first octet.
    pub fn slap_bits(&self) -> u8 {
        let shift = match self.width {
            AddrWidth::Bits48 => 40,
            AddrWidth::Bits64 => 56,
        };
        ((self.base >> shift) as u8) & 0xF
    }

    /// The control-word class bits for this interval: one of the
    /// ELI/SAI/AAI bits, plus the width and multicast bits.
    pub fn slap_class(&self) -> u8 {
        let mut class = if self.is_eli() {
            CLASS_ELI
        } else if self.is_sai() {
            CLASS_SAI
        } else if self.is_aai() {
            CLASS_AAI
        } else {
            0
        };
        if self.width == AddrWidth::Bits64 {
            class |= CLASS_64;
        }
        if self.is_multicast() {
            class |= CLASS_MULTICAST;
        }
        class
    }

    pub fn is_eli(&self) -> bool {
        self.slap_bits() & (Y_BIT | Z_BIT | X_BIT) == (Z_BIT | X_BIT)
    }

    pub fn is_sai(&self) -> bool {
        self.slap_bits() & (Y_BIT | Z_BIT | X_BIT) == (Y_BIT | Z_BIT | X_BIT)
    }

    pub fn is_aai(&self) -> bool {
        self.slap_bits() & (Y_BIT | Z_BIT | X_BIT) == X_BIT
    }

    pub fn is_local(&self) -> bool {
        self.slap_bits() & X_BIT == X_BIT
    }

    pub fn is_multicast(&self) -> bool {
        self.slap_bits() & M_BIT == M_BIT
    }

    pub fn first_addr(&self) -> u64 {
        self.base
    }

    pub fn last_addr(&self) -> u64 {
        self.base.wrapping_add(self.size()).wrapping_sub(1)
    }

    /// Number of addresses covered, regardless of form.
    pub fn size(&self) -> u64 {
        match self.form {
            IntervalForm::Count => self.value,
            IntervalForm::Mask => mask_to_count(self.value),
        }
    }

    /// The alignment mask: the stored mask in mask form, or the mask
    /// implied by the count (only meaningful for power-of-two counts).
    pub fn mask(&self) -> u64 {
        match self.form {
            IntervalForm::Count => !(self.size().wrapping_sub(1)),
            IntervalForm::Mask => self.value,
        }
    }

    /// The largest prefix-of-ones mask whose aligned block fits entirely
    /// inside this interval.
    pub fn aligned_mask(&self) -> u64 {
        let first = self.first_addr();
        let last = self.last_addr();
        let mut mask = u64::MAX;
        loop {
            let wider = mask << 1;
            if wider == 0 {
                return mask;
            }
            let low = !wider;
            let base = first.wrapping_add(low) & wider;
            let end = base.wrapping_add(low);
            if base < first || end > last || end < base {
                return mask;
            }
            mask = wider;
        }
    }

    /// Size of the largest mask-aligned block that fits inside this
    /// interval (the interval's own size when already in mask form).
    pub fn aligned_size(&self) -> u64 {
        if self.form == IntervalForm::Mask {
            self.size()
        } else {
            mask_to_count(self.aligned_mask())
        }
    }

    /// Shrinks (or converts) this interval to its largest internal
    /// mask-aligned block, leaving it in the requested form.
    ///
    /// A mask-form interval is already aligned; converting it to count
    /// form just rewrites the representation.
    pub fn align_to_mask(&mut self, target: IntervalForm) {
        if self.form == IntervalForm::Mask {
            if target == IntervalForm::Count {
                self.value = mask_to_count(self.value);
                self.form = IntervalForm::Count;
            }
            return;
        }
        let mask = self.aligned_mask();
        self.base = self.base.wrapping_add(!mask) & mask;
        if target == IntervalForm::Mask {
            self.value = mask;
            self.form = IntervalForm::Mask;
        } else {
            self.value = mask_to_count(mask);
        }
    }

    /// Replaces the size, dropping to count form if necessary. The base is
    /// left untouched.
    pub fn set_size(&mut self, new_size: u64) {
        self.form = IntervalForm::Count;
        self.value = new_size;
    }

    /// Intersection of two intervals, always in count form.
    ///
    /// Returns `None` when the widths differ, either interval is empty, or
    /// the overlap is zero-width. Symmetric in its arguments.
    pub fn intersection(a: &AddrInterval, b: &AddrInterval) -> Option<AddrInterval> {
        if a.width != b.width {
            return None;
        }
        let count_a = a.size();
        let count_b = b.size();
        if count_a == 0 || count_b == 0 {
            return None;
        }
        let start = a.base.max(b.base);
        let end = a.base.wrapping_add(count_a).min(b.base.wrapping_add(count_b));
        if start >= end {
            return None;
        }
        Some(AddrInterval {
            base: start,
            value: end - start,
            width: a.width,
            form: IntervalForm::Count,
        })
    }

    /// Picks a randomly placed block of `count` addresses inside `pool`.
    ///
    /// Blocks larger than 65535 come out mask-aligned (the wire format
    /// cannot carry their count); smaller ones are count-form at a uniform
    /// random offset.
    pub fn random_within<R: Rng>(pool: &AddrInterval, count: u64, rng: &mut R) -> AddrInterval {
        let pool_size = pool.size();
        let count = count.min(pool_size);
        let random: u64 = rng.gen();
        if count > 0xffff {
            let mask = !(count.next_power_of_two().wrapping_sub(1));
            let mut aligned_pool = *pool;
            aligned_pool.align_to_mask(IntervalForm::Mask);
            let offset = random & (mask ^ aligned_pool.mask());
            AddrInterval {
                base: aligned_pool.first_addr().wrapping_add(offset),
                value: mask,
                width: pool.width,
                form: IntervalForm::Mask,
            }
        } else {
            let slack = pool_size.saturating_sub(count);
            let offset = if slack == 0 { 0 } else { random % slack };
            AddrInterval::from_count_with(pool.first_addr() + offset, count, pool.width)
        }
    }
}

impl std::fmt::Display for AddrInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.width {
            AddrWidth::Bits48 => write!(f, "{:#014x}/{}", self.first_addr(), self.size()),
            AddrWidth::Bits64 => write!(f, "{:#018x}/{}", self.first_addr(), self.size()),
        }
    }
}
