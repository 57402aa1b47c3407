//! Deterministic routing of item names to the domains backing a table.
//!
//! A table named `base` with `count` shards lives in the domains
//! `base-1-of-count` ... `base-count-of-count`. Writers and readers agree on
//! the layout without talking to each other, so everything here is a pure
//! function of its inputs.

use crate::{Result, TapError};

/// Synthetic attribute carrying [`item_hash`] on every written item.
pub const ITEM_HASH_ATTRIBUTE: &str = "shardtap-itemHash";

const HASH_RANGE: u64 = u32::MAX as u64;
const HASH_OFFSET: i64 = 1 << 31;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardName {
    pub base: String,
    /// 1-based position of the shard.
    pub index: u32,
    pub count: u32,
}

impl ShardName {
    pub fn new(base: impl Into<String>, index: u32, count: u32) -> Self {
        Self {
            base: base.into(),
            index,
            count,
        }
    }
}

impl std::fmt::Display for ShardName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-of-{}", self.base, self.index, self.count)
    }
}

/// Jenkins one-at-a-time hash of the UTF-8 bytes, read as a signed value.
pub fn jenkins_hash(key: &str) -> i32 {
    let mut hash: u32 = 0;
    for byte in key.bytes() {
        hash = hash.wrapping_add(u32::from(byte));
        hash = hash.wrapping_add(hash << 10);
        hash ^= hash >> 6;
    }
    hash = hash.wrapping_add(hash << 3);
    hash ^= hash >> 11;
    hash = hash.wrapping_add(hash << 15);
    hash as i32
}

/// Zero-based shard position for `item_id` in a table of `count` shards.
pub fn shard_index(item_id: &str, count: u32) -> u32 {
    if count <= 1 {
        return 0;
    }

    let bucket = HASH_RANGE / u64::from(count);
    let offset = (i64::from(jenkins_hash(item_id)) + HASH_OFFSET) as u64;
    // The last bucket absorbs the remainder of the range.
    (offset / bucket).min(u64::from(count - 1)) as u32
}

/// Eleven characters: `0` or `1` for the hash sign, then the zero-padded magnitude.
pub fn item_hash(item_id: &str) -> String {
    let hash = i64::from(jenkins_hash(item_id));
    if hash < 0 {
        format!("0{:010}", hash.abs())
    } else {
        format!("1{:010}", hash)
    }
}

pub fn shard_name(base: &str, index: u32, count: u32) -> String {
    ShardName::new(base, index, count).to_string()
}

pub fn shard_names(base: &str, count: u32) -> Vec<String> {
    (1..=count).map(|index| shard_name(base, index, count)).collect()
}

/// Inverse of [`shard_name`]. The base is matched greedily, so it may itself
/// contain dashes or `-of-`.
pub fn parse_shard_name(name: &str) -> Option<ShardName> {
    let (prefix, count) = name.rsplit_once("-of-")?;
    let (base, index) = prefix.rsplit_once('-')?;
    if base.is_empty() {
        return None;
    }

    Some(ShardName {
        base: base.to_string(),
        index: parse_digits(index)?,
        count: parse_digits(count)?,
    })
}

fn parse_digits(value: &str) -> Option<u32> {
    if value.is_empty() || !value.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}

/// Check that the shards of `expected_base` found in `names` form a complete,
/// consistent set and return their count. Returns 0 when the table has no
/// shards at all.
pub fn validate_shard_set<S: AsRef<str>>(names: &[S], expected_base: &str) -> Result<u32> {
    let mut count = 0u32;
    let mut found: Vec<bool> = Vec::new();

    for name in names {
        let name = name.as_ref();
        let Some(shard) = parse_shard_name(name) else {
            continue;
        };
        if shard.base != expected_base {
            continue;
        }

        if count == 0 {
            count = shard.count;
            found = vec![false; count as usize];
        } else if shard.count != count {
            return Err(TapError::ShardCountMismatch {
                table: expected_base.to_string(),
                shard: name.to_string(),
                expected: count,
                found: shard.count,
            });
        }

        if shard.index == 0 || shard.index > count {
            return Err(TapError::InvalidShardIndex {
                shard: name.to_string(),
                count,
            });
        }
        found[(shard.index - 1) as usize] = true;
    }

    if let Some(missing) = found.iter().position(|present| !present) {
        return Err(TapError::MissingShard {
            table: expected_base.to_string(),
            index: missing as u32 + 1,
            count,
        });
    }

    Ok(count)
}
