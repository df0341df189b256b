//! Protocol identifier types.

use std::fmt;

use rand::{thread_rng, Fill, Rng};

/// A 160-bit identifier ordered by its big-endian numeric value, with an XOR-based distance
/// metric.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId {
    bytes: [u8; Self::BYTES],
}

impl NodeId {
    /// The size of the identifier in bytes.
    pub const BYTES: usize = 20;

    /// The size of the identifier in bits.
    pub const BITS: usize = 20 * 8;

    /// Creates a new identifier from the supplied bytes (big-endian).
    pub fn new(bytes: [u8; Self::BYTES]) -> Self {
        NodeId { bytes }
    }

    /// Creates an identifier from a slice, returning `None` if it isn't exactly 20 bytes long.
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; Self::BYTES] = slice.try_into().ok()?;
        Some(Self { bytes })
    }

    /// Returns the bytes backing the identifier.
    pub fn bytes(&self) -> [u8; Self::BYTES] {
        self.bytes
    }

    /// Returns a reference to the bytes backing the identifier.
    pub fn as_bytes(&self) -> &[u8; Self::BYTES] {
        &self.bytes
    }

    /// Convenience function for working with small identifiers, the value is stored in the two
    /// least-significant bytes.
    pub fn from_u16(raw: u16) -> Self {
        let mut bytes = [0u8; Self::BYTES];
        bytes[Self::BYTES - 2..].copy_from_slice(&raw.to_be_bytes());

        Self { bytes }
    }

    /// Generates a random identifier.
    pub fn rand() -> Self {
        let mut rng = thread_rng();
        let mut bytes = [0u8; Self::BYTES];
        let _res = bytes.try_fill(&mut rng);
        debug_assert!(_res.is_ok());

        Self { bytes }
    }

    /// Computes the XOR distance between two identifiers.
    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut bytes = [0u8; Self::BYTES];
        for (d, (a, b)) in bytes
            .iter_mut()
            .zip(self.bytes.iter().zip(other.bytes.iter()))
        {
            *d = a ^ b;
        }

        Distance(bytes)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NodeId({:02x}{:02x}{:02x}{:02x}..)",
            self.bytes[0], self.bytes[1], self.bytes[2], self.bytes[3]
        )
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.bytes {
            write!(f, "{byte:02x}")?;
        }

        Ok(())
    }
}

/// The XOR distance between two identifiers, smaller is closer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Distance([u8; NodeId::BYTES]);

impl Distance {
    /// Returns the bytes of the distance (big-endian).
    pub fn bytes(&self) -> [u8; NodeId::BYTES] {
        self.0
    }

    /// Computes the log2 of the distance, `None` if the distance is zero.
    pub fn log2(&self) -> Option<u32> {
        // The first non-zero byte holds the most-significant bit; bytes further right are worth
        // 8 bits less each.
        self.0
            .iter()
            .enumerate()
            .find(|(_, byte)| **byte != 0)
            .map(|(i, byte)| {
                let msb = u8::BITS - byte.leading_zeros() - 1;
                msb + ((NodeId::BYTES - 1 - i) as u32) * 8
            })
    }
}

/// A position in the identifier space, wide enough to represent the exclusive upper bound 2^160.
///
/// Bucket ranges are expressed with boundaries rather than identifiers since the end of the space
/// isn't itself a valid identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Boundary {
    // Field order matters: the derived ordering compares `hi` first.
    hi: u64,
    lo: u128,
}

impl Boundary {
    /// The start of the identifier space.
    pub const ZERO: Boundary = Boundary { hi: 0, lo: 0 };

    /// The exclusive end of the identifier space, 2^160.
    pub const END: Boundary = Boundary { hi: 1 << 32, lo: 0 };

    const ONE: Boundary = Boundary { hi: 0, lo: 1 };

    /// Creates a boundary from a small value.
    pub const fn from_u128(value: u128) -> Self {
        Boundary { hi: 0, lo: value }
    }

    /// Converts the boundary back into an identifier, `None` if it lies at or past the end of the
    /// space.
    pub fn to_node_id(self) -> Option<NodeId> {
        if self >= Self::END {
            return None;
        }

        let mut bytes = [0u8; NodeId::BYTES];
        bytes[..4].copy_from_slice(&(self.hi as u32).to_be_bytes());
        bytes[4..].copy_from_slice(&self.lo.to_be_bytes());

        Some(NodeId::new(bytes))
    }

    /// Floor of the mean of two boundaries.
    pub fn midpoint(self, other: Boundary) -> Boundary {
        self.add(other).half()
    }

    /// The boundary directly after this one.
    pub fn next(self) -> Boundary {
        self.add(Self::ONE)
    }

    /// The number of identifiers between this boundary (inclusive) and `end` (exclusive).
    ///
    /// Saturates at zero if `end` isn't past this boundary.
    pub fn width_to(self, end: Boundary) -> Boundary {
        if end <= self {
            return Self::ZERO;
        }

        end.sub(self)
    }

    /// Returns a uniformly distributed boundary in `[self, end)`, `None` if the range is empty.
    pub fn random_below<R: Rng + ?Sized>(self, end: Boundary, rng: &mut R) -> Option<Boundary> {
        let width = self.width_to(end);
        if width == Self::ZERO {
            return None;
        }

        // Rejection sampling over the smallest power of two covering the width, this needs less
        // than two draws on average.
        let bits = width.bits();
        loop {
            let candidate = Boundary {
                hi: rng.gen::<u64>(),
                lo: rng.gen::<u128>(),
            }
            .mask(bits);

            if candidate < width {
                return Some(self.add(candidate));
            }
        }
    }

    fn add(self, other: Boundary) -> Boundary {
        let (lo, carry) = self.lo.overflowing_add(other.lo);
        Boundary {
            hi: self.hi + other.hi + carry as u64,
            lo,
        }
    }

    // Callers guarantee `self >= other`.
    fn sub(self, other: Boundary) -> Boundary {
        let (lo, borrow) = self.lo.overflowing_sub(other.lo);
        Boundary {
            hi: self.hi - other.hi - borrow as u64,
            lo,
        }
    }

    fn half(self) -> Boundary {
        Boundary {
            hi: self.hi >> 1,
            lo: (self.lo >> 1) | ((self.hi as u128 & 1) << 127),
        }
    }

    // Number of significant bits.
    fn bits(self) -> u32 {
        if self.hi != 0 {
            128 + u64::BITS - self.hi.leading_zeros()
        } else {
            u128::BITS - self.lo.leading_zeros()
        }
    }

    // Keeps the lowest `bits` bits.
    fn mask(self, bits: u32) -> Boundary {
        if bits >= 128 {
            let hi_bits = bits - 128;
            let hi_mask = if hi_bits >= u64::BITS {
                u64::MAX
            } else {
                (1u64 << hi_bits) - 1
            };

            Boundary {
                hi: self.hi & hi_mask,
                lo: self.lo,
            }
        } else {
            Boundary {
                hi: 0,
                lo: self.lo & ((1u128 << bits) - 1),
            }
        }
    }
}

impl From<NodeId> for Boundary {
    fn from(id: NodeId) -> Self {
        let bytes = id.bytes();
        let mut hi = [0u8; 4];
        hi.copy_from_slice(&bytes[..4]);
        let mut lo = [0u8; 16];
        lo.copy_from_slice(&bytes[4..]);

        Boundary {
            hi: u32::from_be_bytes(hi) as u64,
            lo: u128::from_be_bytes(lo),
        }
    }
}
