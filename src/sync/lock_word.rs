//! Bit layout of the per-object lock word.
//!
//! ```text
//!  not inflated:  | 63 | 62 ..... 41 | 40 .. 33 | 32 ...... 2 | 1 | 0 |
//!                 |  0 |  owner id   | nest - 1 |    hash     | 0 | H |
//!
//!  inflated:      | 63 ...... 32 | 31 ........ 2 | 1 | 0 |
//!                 |  generation  | record index  | 1 | H |
//! ```
//!
//! `H` is the has-hash flag. A zero owner means the word is free (or only
//! hashed, when `H` is set). Only [`LockWord`] values cross module
//! boundaries; raw bits exist only between a load and a compare-exchange.
use crate::utils::{RecordHandle, SmallId};

const HAS_HASH: u64 = 1 << 0;
const INFLATED: u64 = 1 << 1;

const HASH_SHIFT: u32 = 2;
const HASH_BITS: u32 = 31;
const NEST_SHIFT: u32 = HASH_SHIFT + HASH_BITS;
const NEST_BITS: u32 = 8;
const OWNER_SHIFT: u32 = NEST_SHIFT + NEST_BITS;
const OWNER_BITS: u32 = 22;

const INDEX_SHIFT: u32 = 2;
const INDEX_BITS: u32 = 30;
const GENERATION_SHIFT: u32 = 32;

const fn mask(bits: u32) -> u64 {
    (1 << bits) - 1
}

/// Deepest nesting a thin lock can record before it must inflate.
pub const MAX_THIN_NEST: u32 = 1 << NEST_BITS;
/// Largest record index an inflated word can address.
pub const MAX_RECORD_INDEX: u32 = mask(INDEX_BITS) as u32;
/// Identity hashes are 31-bit, non-negative.
pub const HASH_MASK: i32 = mask(HASH_BITS) as i32;

const _: () = assert!(OWNER_SHIFT + OWNER_BITS <= 64);
const _: () = assert!(mask(OWNER_BITS) as u32 == crate::threading::MAX_SMALL_ID);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockWord {
    Free,
    /// Unlocked, carrying an identity hash.
    Hashed { hash: i32 },
    /// Owned without a monitor record. `nest` is the depth, `1..=MAX_THIN_NEST`.
    Thin {
        owner: SmallId,
        nest: u32,
        hash: Option<i32>,
    },
    /// Permanently backed by a monitor record. `has_hash` mirrors whether the
    /// record has cached an identity hash.
    Inflated { record: RecordHandle, has_hash: bool },
}

impl LockWord {
    pub fn decode(bits: u64) -> Self {
        let has_hash = bits & HAS_HASH != 0;

        if bits & INFLATED != 0 {
            let index = ((bits >> INDEX_SHIFT) & mask(INDEX_BITS)) as u32;
            let generation = (bits >> GENERATION_SHIFT) as u32;
            return LockWord::Inflated {
                record: RecordHandle::new(index, generation),
                has_hash,
            };
        }

        let hash = has_hash.then(|| ((bits >> HASH_SHIFT) & mask(HASH_BITS)) as i32);
        let owner = ((bits >> OWNER_SHIFT) & mask(OWNER_BITS)) as u32;
        match (owner, hash) {
            (0, None) => LockWord::Free,
            (0, Some(hash)) => LockWord::Hashed { hash },
            (owner, hash) => LockWord::Thin {
                owner: SmallId::new(owner),
                nest: ((bits >> NEST_SHIFT) & mask(NEST_BITS)) as u32 + 1,
                hash,
            },
        }
    }

    pub fn encode(self) -> u64 {
        match self {
            LockWord::Free => 0,
            LockWord::Hashed { hash } => encode_hash(hash),
            LockWord::Thin { owner, nest, hash } => {
                debug_assert!(!owner.is_none(), "thin lock without an owner");
                debug_assert!(owner.as_u32() as u64 <= mask(OWNER_BITS), "owner {} too wide", owner);
                debug_assert!((1..=MAX_THIN_NEST).contains(&nest), "thin nest {} out of range", nest);
                ((owner.as_u32() as u64) << OWNER_SHIFT)
                    | (((nest - 1) as u64) << NEST_SHIFT)
                    | hash.map_or(0, encode_hash)
            }
            LockWord::Inflated { record, has_hash } => {
                debug_assert!(record.index <= MAX_RECORD_INDEX, "record index {} too wide", record.index);
                ((record.generation as u64) << GENERATION_SHIFT)
                    | ((record.index as u64) << INDEX_SHIFT)
                    | INFLATED
                    | if has_hash { HAS_HASH } else { 0 }
            }
        }
    }
}

fn encode_hash(hash: i32) -> u64 {
    debug_assert!(hash >= 0, "identity hash {} is negative", hash);
    (((hash as u64) & mask(HASH_BITS)) << HASH_SHIFT) | HAS_HASH
}
