//! Stable routing of session keys to shard workers.

use crate::types::SessionKey;

/// Shard index for `key` among `shards` workers.
///
/// Uses blake3 rather than the std hasher so routing is identical across
/// processes and restarts.
pub fn shard_for(key: &SessionKey, shards: usize) -> usize {
  if shards <= 1 {
    return 0;
  }
  let mut hasher = blake3::Hasher::new();
  hasher.update(key.org_id.as_bytes());
  hasher.update(b"|");
  hasher.update(key.product_id.as_bytes());
  hasher.update(b"|");
  hasher.update(key.session_id.as_bytes());
  let hash = hasher.finalize();
  let mut prefix = [0u8; 8];
  prefix.copy_from_slice(&hash.as_bytes()[..8]);
  (u64::from_le_bytes(prefix) % shards as u64) as usize
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn same_key_same_shard() {
    let key = SessionKey::new("org", "web", "s-42");
    let first = shard_for(&key, 8);
    for _ in 0..10 {
      assert_eq!(shard_for(&key.clone(), 8), first);
    }
  }

  #[test]
  fn shard_is_in_range() {
    for i in 0..200 {
      let key = SessionKey::new("org", "web", format!("s-{}", i));
      assert!(shard_for(&key, 7) < 7);
    }
  }

  #[test]
  fn keys_spread_across_shards() {
    let mut seen = [false; 4];
    for i in 0..200 {
      seen[shard_for(&SessionKey::new("org", "web", format!("s-{}", i)), 4)] = true;
    }
    assert!(seen.iter().all(|s| *s));
  }

  #[test]
  fn single_shard_is_zero() {
    assert_eq!(shard_for(&SessionKey::new("a", "b", "c"), 1), 0);
  }
}
