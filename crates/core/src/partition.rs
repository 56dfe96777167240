//! Size-tiered multipart partitioning.
//!
//! The partition of a file is recomputed at upload start, at resume and when
//! validating completion, so it must be a pure function of the size.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Files up to this size are uploaded as a single part.
pub const SINGLE_PART_MAX: u64 = 10_000_000;

/// Largest file accepted for upload.
pub const MAX_FILE_SIZE: u64 = 5_000_000_000_000;

/// `(largest total size, part size)` tiers, checked in order.
const TIERS: [(u64, u64); 4] = [
    (100_000_000, 6_000_000),
    (1_000_000_000, 10_000_000),
    (100_000_000_000, 100_000_000),
    (MAX_FILE_SIZE, 500_000_000),
];

/// How a file of a given size is split into multipart parts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    /// Declared file size in bytes.
    pub size: u64,
    /// Number of parts (at least one).
    pub part_count: u32,
    /// Size of every part except the last.
    pub part_size: u64,
    /// Size of the final part.
    pub last_part_size: u64,
}

impl Partition {
    /// Compute the partition for a file size.
    pub fn for_size(size: u64) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidSize(size));
        }

        if size <= SINGLE_PART_MAX {
            return Ok(Self {
                size,
                part_count: 1,
                part_size: size,
                last_part_size: size,
            });
        }

        let part_size = TIERS
            .iter()
            .find(|(limit, _)| size <= *limit)
            .map(|(_, part_size)| *part_size)
            .ok_or(Error::FileTooLarge {
                size,
                max: MAX_FILE_SIZE,
            })?;

        let full_parts = size / part_size;
        let remainder = size % part_size;
        let (part_count, last_part_size) = if remainder == 0 {
            (full_parts, part_size)
        } else {
            (full_parts + 1, remainder)
        };

        Ok(Self {
            size,
            // Bounded by MAX_FILE_SIZE / smallest tier part size.
            part_count: part_count as u32,
            part_size,
            last_part_size,
        })
    }

    /// Byte length of a 1-based part, or `None` if out of range.
    pub fn part_len(&self, part_number: u32) -> Option<u64> {
        if part_number == 0 || part_number > self.part_count {
            None
        } else if part_number == self.part_count {
            Some(self.last_part_size)
        } else {
            Some(self.part_size)
        }
    }

    /// Check if a 1-based part number belongs to this partition.
    pub fn contains(&self, part_number: u32) -> bool {
        self.part_len(part_number).is_some()
    }

    /// Iterate over `(part_number, length)` pairs.
    pub fn parts(&self) -> impl Iterator<Item = (u32, u64)> + '_ {
        (1..=self.part_count).filter_map(|n| self.part_len(n).map(|len| (n, len)))
    }
}
