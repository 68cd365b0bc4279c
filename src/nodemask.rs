//! Bitset over the cluster's linear node index.
//!
//! A `NodeMask` is a BitVec of u64's sized to the cluster's node count,
//! along with helpers for creating, combining, and reading the set. All
//! node selection in this crate is expressed as mask arithmetic over the
//! dense `0..N` node index.
//!
//! Masks can be built empty, from explicit indices, or from a hexadecimal
//! string ("none" and "all" are accepted as shorthands):
//!
//!```
//!     use nodesel::NodeMask;
//!     let empty = NodeMask::new(8);
//!     let picked = NodeMask::from_indices(8, &[0, 1, 2]);
//!     let parsed = NodeMask::from_hex("0x0f", 8).unwrap();
//!```
//!
//! Binary operations require both masks to cover the same node count;
//! mixing masks from differently-sized clusters is a caller bug.

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use bitvec::prelude::*;
use std::fmt;
use std::ops::BitAndAssign;
use std::ops::BitOrAssign;

#[derive(Debug, Default, Eq, Clone, Hash, Ord, PartialEq, PartialOrd)]
pub struct NodeMask {
    mask: BitVec<u64, Lsb0>,
}

impl NodeMask {
    /// Build a new empty mask covering `node_cnt` nodes.
    pub fn new(node_cnt: usize) -> NodeMask {
        NodeMask {
            mask: bitvec![u64, Lsb0; 0; node_cnt],
        }
    }

    /// Build a full mask covering `node_cnt` nodes.
    pub fn all(node_cnt: usize) -> NodeMask {
        NodeMask {
            mask: bitvec![u64, Lsb0; 1; node_cnt],
        }
    }

    /// Build a mask with the given node indices set.
    pub fn from_indices(node_cnt: usize, indices: &[usize]) -> NodeMask {
        let mut mask = NodeMask::new(node_cnt);
        for &i in indices {
            mask.set(i);
        }
        mask
    }

    /// Build a mask from a hexadecimal string. The special values "none"
    /// and "all" select the empty and the full mask.
    pub fn from_hex(s: &str, node_cnt: usize) -> Result<NodeMask> {
        match s {
            "none" => return Ok(Self::new(node_cnt)),
            "all" => return Ok(Self::all(node_cnt)),
            _ => {}
        }
        let hex_str = {
            let mut tmp = s.strip_prefix("0x").unwrap_or(s).replace('_', "");
            if tmp.len() % 2 != 0 {
                tmp = "0".to_string() + &tmp;
            }
            tmp
        };
        let bytes =
            hex::decode(&hex_str).with_context(|| format!("Failed to parse node mask: {s}"))?;

        let mut mask = Self::new(node_cnt);
        for (index, &val) in bytes.iter().rev().enumerate() {
            let mut v = val;
            while v != 0 {
                let lsb = v.trailing_zeros() as usize;
                v &= !(1 << lsb);
                let node = index * 8 + lsb;
                if node >= node_cnt {
                    bail!(
                        "Found node ({}) in mask ({}) beyond the cluster's node count ({})",
                        node,
                        s,
                        node_cnt
                    );
                }
                mask.mask.set(node, true);
            }
        }
        Ok(mask)
    }

    /// Number of nodes this mask covers (set or not).
    pub fn node_cnt(&self) -> usize {
        self.mask.len()
    }

    /// Set a node's bit. Out-of-range indices are a caller bug.
    pub fn set(&mut self, node: usize) {
        self.mask.set(node, true);
    }

    /// Clear a node's bit.
    pub fn clear(&mut self, node: usize) {
        self.mask.set(node, false);
    }

    /// Test whether a node's bit is set. Out-of-range reads return false.
    pub fn test(&self, node: usize) -> bool {
        self.mask.get(node).map(|b| *b).unwrap_or(false)
    }

    /// Count the set bits.
    pub fn weight(&self) -> usize {
        self.mask.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.mask.count_ones() == 0
    }

    /// Clear every bit.
    pub fn clear_all(&mut self) {
        self.mask.fill(false);
    }

    /// Index of the first set bit, if any.
    pub fn first_set(&self) -> Option<usize> {
        self.mask.first_one()
    }

    /// True if every bit set here is also set in `other`.
    pub fn is_subset(&self, other: &NodeMask) -> bool {
        debug_assert_eq!(self.node_cnt(), other.node_cnt());
        self.iter().all(|i| other.test(i))
    }

    /// True if any bit is set in both masks.
    pub fn overlaps(&self, other: &NodeMask) -> bool {
        debug_assert_eq!(self.node_cnt(), other.node_cnt());
        self.iter().any(|i| other.test(i))
    }

    /// A new mask holding the intersection.
    pub fn and(&self, other: &NodeMask) -> NodeMask {
        let mut new = self.clone();
        new &= other;
        new
    }

    /// A new mask holding the union.
    pub fn or(&self, other: &NodeMask) -> NodeMask {
        let mut new = self.clone();
        new |= other;
        new
    }

    /// A new mask with the first `cnt` set bits of this one, or None if
    /// fewer than `cnt` bits are set.
    pub fn pick_cnt(&self, cnt: usize) -> Option<NodeMask> {
        if self.weight() < cnt {
            return None;
        }
        let mut picked = NodeMask::new(self.node_cnt());
        for i in self.iter().take(cnt) {
            picked.set(i);
        }
        Some(picked)
    }

    /// Iterate over the indices of set bits, in increasing order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.mask.iter_ones()
    }
}

impl fmt::Display for NodeMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut words: Vec<u32> = self
            .mask
            .as_raw_slice()
            .iter()
            .flat_map(|x| [*x as u32, (x >> 32) as u32])
            .collect();
        words.truncate(self.node_cnt().div_ceil(32).max(1));

        let width = match self.node_cnt().div_ceil(4) % 8 {
            0 => 8,
            v => v,
        };
        write!(f, "{:0width$x}", words.pop().unwrap_or(0), width = width)?;
        for word in words.iter().rev() {
            write!(f, ",{word:08x}")?;
        }
        Ok(())
    }
}

impl BitAndAssign<&Self> for NodeMask {
    fn bitand_assign(&mut self, rhs: &Self) {
        debug_assert_eq!(self.node_cnt(), rhs.node_cnt());
        self.mask &= &rhs.mask;
    }
}

impl BitOrAssign<&Self> for NodeMask {
    fn bitor_assign(&mut self, rhs: &Self) {
        debug_assert_eq!(self.node_cnt(), rhs.node_cnt());
        self.mask |= &rhs.mask;
    }
}
