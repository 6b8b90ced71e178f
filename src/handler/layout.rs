//! Object alignment inference and heap size computation.

use serde::{Deserialize, Serialize};

use crate::hprof::BasicType;

/// Smallest alignment reported.
pub const MIN_ALIGNMENT: u32 = 8;
/// Largest alignment reported.
pub const MAX_ALIGNMENT: u32 = 256;

/// Infers the object alignment from sorted object addresses.
///
/// The result is the greatest common divisor of the differences between successive
/// non-zero addresses, clamped into `[MIN_ALIGNMENT, MAX_ALIGNMENT]`.
pub fn infer_alignment(sorted: &[u64]) -> u32 {
    let mut prev = 0u64;
    let mut align = 0u64;
    for &address in sorted {
        if address == 0 {
            continue;
        }
        let diff = address - prev;
        prev = address;
        if diff == address {
            // First non-zero address.
            continue;
        }
        align = match align {
            0 => diff,
            a => gcd(a, diff),
        };
        if align != 0 && align <= u64::from(MIN_ALIGNMENT) {
            break;
        }
    }
    align.clamp(u64::from(MIN_ALIGNMENT), u64::from(MAX_ALIGNMENT)) as u32
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Rounds `n` up to a multiple of `to`.
pub fn align_up(n: u64, to: u32) -> u64 {
    let to = u64::from(to.max(1));
    n.div_ceil(to) * to
}

/// Parameters that turn record contents into heap sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapLayout {
    /// Width of identifiers in the dump; also the object header pointer size.
    pub pointer_size: u32,
    /// Width of a reference field on the heap.
    pub reference_size: u32,
    /// Inferred object alignment.
    pub alignment: u32,
}

impl HeapLayout {
    /// Size of one field of type `ty` on the heap.
    pub fn field_size(&self, ty: BasicType) -> u64 {
        match ty {
            BasicType::Object => u64::from(self.reference_size),
            other => u64::from(other.size(self.pointer_size)),
        }
    }

    /// Object header of a plain instance.
    pub fn instance_header(&self) -> u64 {
        u64::from(self.pointer_size + self.reference_size)
    }

    /// Heap size of a reference array with `length` elements.
    pub fn object_array_size(&self, length: u32) -> u64 {
        let raw = self.instance_header() + 4 + u64::from(length) * u64::from(self.reference_size);
        align_up(raw, self.alignment)
    }

    /// Heap size of a primitive array with `length` elements of `ty`.
    pub fn primitive_array_size(&self, ty: BasicType, length: u32) -> u64 {
        let header = align_up(self.instance_header() + 4, self.reference_size);
        align_up(
            header + u64::from(length) * u64::from(ty.size(self.pointer_size)),
            self.alignment,
        )
    }
}
