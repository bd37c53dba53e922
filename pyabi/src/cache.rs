//! Fixed capacity direct mapped caches in front of the slower reverse lookups.
//!
//! An occupant may be stale: every hit is checked with a validity predicate and a stale or
//! missing entry is re-resolved through the fallback and overwritten.
use crate::{Address, BridgeError, BridgeResult, tagged::HANDLE_BASE};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stale: u64,
}

#[derive(Debug)]
pub struct DirectMappedCache<V> {
    entries: Box<[Option<(Address, V)>]>,
    mask: u64,
    stats: CacheStats,
}

impl<V: Clone> DirectMappedCache<V> {
    pub fn new(capacity: usize) -> BridgeResult<Self> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(BridgeError::InvalidConfig(format!(
                "cache capacity must be a non-zero power of two, got {capacity}"
            )));
        }
        Ok(Self {
            entries: (0..capacity).map(|_| None).collect(),
            mask: capacity as u64 - 1,
            stats: CacheStats::default(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    #[inline]
    fn slot(&self, key: Address) -> usize {
        let k = key.raw() & !HANDLE_BASE;
        (((k >> 4) ^ (k >> 16)) & self.mask) as usize
    }

    /// Raw occupant for `key`, unchecked
    pub fn get(&self, key: Address) -> Option<&V> {
        match &self.entries[self.slot(key)] {
            Some((occupant, value)) if *occupant == key => Some(value),
            _ => None,
        }
    }

    pub fn insert(&mut self, key: Address, value: V) {
        let slot = self.slot(key);
        self.entries[slot] = Some((key, value));
    }

    pub fn invalidate(&mut self, key: Address) {
        let slot = self.slot(key);
        if matches!(&self.entries[slot], Some((occupant, _)) if *occupant == key) {
            self.entries[slot] = None;
        }
    }

    pub fn clear(&mut self) {
        self.entries.iter_mut().for_each(|entry| *entry = None);
    }

    /// Cached value for `key` if it still passes `is_valid`, otherwise `resolve` it and cache the
    /// result.
    pub fn lookup_or_resolve<E>(
        &mut self,
        key: Address,
        is_valid: impl FnOnce(&V) -> bool,
        resolve: impl FnOnce() -> Result<V, E>,
    ) -> Result<V, E> {
        let slot = self.slot(key);
        if let Some((occupant, value)) = &self.entries[slot] {
            if *occupant == key {
                if is_valid(value) {
                    self.stats.hits += 1;
                    return Ok(value.clone());
                }
                self.stats.stale += 1;
            }
        }
        self.stats.misses += 1;
        let value = resolve()?;
        self.entries[slot] = Some((key, value.clone()));
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_capacity() {
        assert!(DirectMappedCache::<u32>::new(0).is_err());
        assert!(DirectMappedCache::<u32>::new(48).is_err());
        assert_eq!(DirectMappedCache::<u32>::new(64).unwrap().capacity(), 64);
    }

    #[test]
    fn hit_after_resolve() {
        let mut cache = DirectMappedCache::new(16).unwrap();
        let key = Address::new(0x1230);
        let first: Result<u32, ()> = cache.lookup_or_resolve(key, |_| true, || Ok(7));
        assert_eq!(first, Ok(7));
        let second: Result<u32, ()> =
            cache.lookup_or_resolve(key, |_| true, || panic!("must hit"));
        assert_eq!(second, Ok(7));
        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 1,
                misses: 1,
                stale: 0
            }
        );
    }

    #[test]
    fn stale_occupant_is_reresolved() {
        let mut cache = DirectMappedCache::new(16).unwrap();
        let key = Address::new(0x1230);
        cache.insert(key, 1u32);
        let value: Result<u32, ()> = cache.lookup_or_resolve(key, |&v| v == 2, || Ok(2));
        assert_eq!(value, Ok(2));
        assert_eq!(cache.get(key), Some(&2));
        assert_eq!(cache.stats().stale, 1);
    }

    #[test]
    fn colliding_keys_evict_each_other() {
        let mut cache = DirectMappedCache::new(4).unwrap();
        let a = Address::new(0x10);
        let b = Address::new(0x50);
        assert_eq!(cache.slot(a), cache.slot(b));
        cache.insert(a, 'a');
        cache.insert(b, 'b');
        assert_eq!(cache.get(a), None);
        assert_eq!(cache.get(b), Some(&'b'));
    }

    #[test]
    fn tagged_and_untagged_keys_share_a_slot_but_not_an_entry() {
        let mut cache = DirectMappedCache::new(8).unwrap();
        let stub = Address::new(0x4440);
        cache.insert(stub.to_handle(), 1);
        assert_eq!(cache.slot(stub), cache.slot(stub.to_handle()));
        assert_eq!(cache.get(stub), None);
        cache.invalidate(stub);
        assert_eq!(cache.get(stub.to_handle()), Some(&1));
        cache.invalidate(stub.to_handle());
        assert_eq!(cache.get(stub.to_handle()), None);
    }

    #[test]
    fn failed_resolve_caches_nothing() {
        let mut cache: DirectMappedCache<u8> = DirectMappedCache::new(2).unwrap();
        let key = Address::new(0x20);
        let result = cache.lookup_or_resolve(key, |_| true, || Err("unknown"));
        assert_eq!(result, Err("unknown"));
        assert_eq!(cache.get(key), None);
        cache.insert(key, 3);
        cache.clear();
        assert_eq!(cache.get(key), None);
    }
}
