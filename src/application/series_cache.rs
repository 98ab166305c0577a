// Process-wide cache of materialised series and their date rollups
use crate::domain::station::{GroupId, StationId};
use crate::domain::timeseries::{TimeseriesData, TimeseriesId};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

/// A node of the ownership chain timeseries -> group -> station.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Timeseries(TimeseriesId),
    Group(GroupId),
    Station(StationId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Data(TimeseriesId),
    StartDate(Scope),
    EndDate(Scope),
}

#[derive(Debug, Clone)]
pub enum CacheValue {
    Data(Arc<TimeseriesData>),
    Date(Option<DateTime<Utc>>),
}

/// Minimal typed key/value cache.
#[derive(Debug)]
pub struct Cache<K, V> {
    entries: RwLock<HashMap<K, V>>,
}

impl<K, V> Default for Cache<K, V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash, V: Clone> Cache<K, V> {
    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.read().get(key).cloned()
    }

    pub fn insert(&self, key: K, value: V) {
        self.entries.write().insert(key, value);
    }

    pub fn remove_many<'a>(&self, keys: impl IntoIterator<Item = &'a K>) -> usize
    where
        K: 'a,
    {
        let mut entries = self.entries.write();
        keys.into_iter()
            .filter(|key| entries.remove(*key).is_some())
            .count()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }
}

/// Series cache with an explicit invalidation graph.
///
/// Every invalidation bumps a generation counter for each affected scope. A
/// value fetched before the bump is discarded instead of being stored, so a
/// reader can never repopulate the cache with data older than a write.
#[derive(Debug, Default)]
pub struct SeriesCache {
    entries: Cache<CacheKey, CacheValue>,
    owners: RwLock<HashMap<Scope, Scope>>,
    generations: Mutex<HashMap<Scope, u64>>,
}

impl SeriesCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_owner(&self, child: Scope, parent: Scope) {
        self.owners.write().insert(child, parent);
    }

    pub fn generation(&self, scope: Scope) -> u64 {
        self.generations.lock().get(&scope).copied().unwrap_or(0)
    }

    pub fn data(&self, timeseries_id: TimeseriesId) -> Option<Arc<TimeseriesData>> {
        match self.entries.get(&CacheKey::Data(timeseries_id)) {
            Some(CacheValue::Data(data)) => {
                tracing::debug!(timeseries_id, "series cache hit");
                Some(data)
            }
            _ => None,
        }
    }

    pub fn date(&self, key: CacheKey) -> Option<Option<DateTime<Utc>>> {
        match self.entries.get(&key) {
            Some(CacheValue::Date(date)) => Some(date),
            _ => None,
        }
    }

    /// Stores a fetched series unless it was invalidated since `generation`.
    pub fn store_data(
        &self,
        timeseries_id: TimeseriesId,
        generation: u64,
        data: Arc<TimeseriesData>,
    ) -> bool {
        self.store(
            Scope::Timeseries(timeseries_id),
            generation,
            CacheKey::Data(timeseries_id),
            CacheValue::Data(data),
        )
    }

    pub fn store_date(&self, key: CacheKey, generation: u64, date: Option<DateTime<Utc>>) -> bool {
        let scope = match key {
            CacheKey::Data(id) => Scope::Timeseries(id),
            CacheKey::StartDate(scope) | CacheKey::EndDate(scope) => scope,
        };
        self.store(scope, generation, key, CacheValue::Date(date))
    }

    fn store(&self, scope: Scope, generation: u64, key: CacheKey, value: CacheValue) -> bool {
        let generations = self.generations.lock();
        if generations.get(&scope).copied().unwrap_or(0) != generation {
            tracing::debug!(?key, "discarding value fetched before invalidation");
            return false;
        }
        self.entries.insert(key, value);
        true
    }

    /// Scopes whose cached values depend on the records of `timeseries_id`.
    fn dependent_scopes(&self, timeseries_id: TimeseriesId) -> Vec<Scope> {
        let owners = self.owners.read();
        let mut scopes = vec![Scope::Timeseries(timeseries_id)];
        while let Some(parent) = scopes.last().and_then(|scope| owners.get(scope)) {
            if scopes.contains(parent) {
                break;
            }
            scopes.push(*parent);
        }
        scopes
    }

    /// Drops the series, its dates, and the rollups of its group and station.
    pub fn invalidate(&self, timeseries_id: TimeseriesId) {
        let scopes = self.dependent_scopes(timeseries_id);
        let mut keys = vec![CacheKey::Data(timeseries_id)];
        for scope in &scopes {
            keys.push(CacheKey::StartDate(*scope));
            keys.push(CacheKey::EndDate(*scope));
        }

        let mut generations = self.generations.lock();
        for scope in &scopes {
            *generations.entry(*scope).or_insert(0) += 1;
        }
        let removed = self.entries.remove_many(&keys);
        tracing::debug!(timeseries_id, removed, "series cache invalidated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn cache_with_chain() -> SeriesCache {
        let cache = SeriesCache::new();
        cache.register_owner(Scope::Timeseries(1), Scope::Group(10));
        cache.register_owner(Scope::Group(10), Scope::Station(100));
        cache
    }

    fn some_date() -> Option<DateTime<Utc>> {
        Some(Utc.with_ymd_and_hms(2019, 5, 21, 10, 0, 0).unwrap())
    }

    #[test]
    fn test_store_and_get() {
        let cache = cache_with_chain();
        let generation = cache.generation(Scope::Timeseries(1));
        assert!(cache.store_data(1, generation, Arc::new(TimeseriesData::new())));
        assert!(cache.data(1).is_some());
        assert!(cache.data(2).is_none());
    }

    #[test]
    fn test_invalidation_cascades_up_the_chain() {
        let cache = cache_with_chain();
        cache.store_data(1, 0, Arc::new(TimeseriesData::new()));
        cache.store_date(CacheKey::EndDate(Scope::Timeseries(1)), 0, some_date());
        cache.store_date(CacheKey::EndDate(Scope::Group(10)), 0, some_date());
        cache.store_date(CacheKey::EndDate(Scope::Station(100)), 0, some_date());
        cache.store_date(CacheKey::EndDate(Scope::Group(11)), 0, some_date());

        cache.invalidate(1);

        assert!(cache.data(1).is_none());
        assert!(cache.date(CacheKey::EndDate(Scope::Timeseries(1))).is_none());
        assert!(cache.date(CacheKey::EndDate(Scope::Group(10))).is_none());
        assert!(cache.date(CacheKey::EndDate(Scope::Station(100))).is_none());
        // Unrelated group is untouched
        assert!(cache.date(CacheKey::EndDate(Scope::Group(11))).is_some());
    }

    #[test]
    fn test_stale_fetch_is_not_stored() {
        let cache = cache_with_chain();
        let generation = cache.generation(Scope::Timeseries(1));
        cache.invalidate(1);
        assert!(!cache.store_data(1, generation, Arc::new(TimeseriesData::new())));
        assert!(cache.data(1).is_none());

        let generation = cache.generation(Scope::Group(10));
        cache.invalidate(1);
        assert!(!cache.store_date(CacheKey::StartDate(Scope::Group(10)), generation, None));
    }

    #[test]
    fn test_generic_cache() {
        let cache: Cache<&str, i32> = Cache::default();
        cache.insert("a", 1);
        cache.insert("b", 2);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.remove_many(&["a", "c"]), 1);
        assert_eq!(cache.len(), 1);
    }
}
