// Catalog of stations, time series groups and their time series
use crate::domain::error::StoreError;
use crate::domain::station::{GroupId, Station, StationId, TimeseriesGroup};
use crate::domain::timeseries::{Timeseries, TimeseriesId, TimeseriesKey, TimeseriesType};
use parking_lot::RwLock;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
struct CatalogState {
    stations: BTreeMap<StationId, Station>,
    groups: BTreeMap<GroupId, TimeseriesGroup>,
    timeseries: BTreeMap<TimeseriesId, Timeseries>,
    next_timeseries_id: TimeseriesId,
}

/// Metadata registry consumed by the storage façade and the rules.
///
/// Station and group administration happens elsewhere; this only keeps what
/// the core needs to resolve time series and their display settings.
#[derive(Debug, Default)]
pub struct Catalog {
    state: RwLock<CatalogState>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_station(&self, station: Station) {
        self.state.write().stations.insert(station.id, station);
    }

    pub fn add_group(&self, group: TimeseriesGroup) -> Result<(), StoreError> {
        let mut state = self.state.write();
        if !state.stations.contains_key(&group.station_id) {
            return Err(StoreError::StationNotFound(group.station_id));
        }
        state.groups.insert(group.id, group);
        Ok(())
    }

    pub fn station(&self, id: StationId) -> Result<Station, StoreError> {
        self.state
            .read()
            .stations
            .get(&id)
            .cloned()
            .ok_or(StoreError::StationNotFound(id))
    }

    pub fn group(&self, id: GroupId) -> Result<TimeseriesGroup, StoreError> {
        self.state
            .read()
            .groups
            .get(&id)
            .cloned()
            .ok_or(StoreError::GroupNotFound(id))
    }

    pub fn groups_of_station(&self, station_id: StationId) -> Vec<TimeseriesGroup> {
        self.state
            .read()
            .groups
            .values()
            .filter(|g| g.station_id == station_id)
            .cloned()
            .collect()
    }

    pub fn timeseries(&self, id: TimeseriesId) -> Result<Timeseries, StoreError> {
        self.state
            .read()
            .timeseries
            .get(&id)
            .cloned()
            .ok_or(StoreError::TimeseriesNotFound(id))
    }

    pub fn timeseries_of_group(&self, group_id: GroupId) -> Vec<Timeseries> {
        self.state
            .read()
            .timeseries
            .values()
            .filter(|t| t.group_id == group_id)
            .cloned()
            .collect()
    }

    pub fn find_timeseries(&self, group_id: GroupId, key: &TimeseriesKey) -> Option<Timeseries> {
        self.state
            .read()
            .timeseries
            .values()
            .find(|t| t.group_id == group_id && key.matches(t))
            .cloned()
    }

    /// First existing stage of `kinds`, in order of preference.
    pub fn preferred_timeseries(&self, group_id: GroupId, kinds: &[TimeseriesType]) -> Option<Timeseries> {
        kinds
            .iter()
            .find_map(|kind| self.find_timeseries(group_id, &TimeseriesKey::stage(*kind)))
    }

    /// Creates a time series; fails if the group already has one for `key`.
    pub fn create_timeseries(
        &self,
        group_id: GroupId,
        key: TimeseriesKey,
        publicly_available: bool,
    ) -> Result<Timeseries, StoreError> {
        let mut state = self.state.write();
        Self::insert_timeseries(&mut state, group_id, key, publicly_available)
    }

    /// Returns the group's time series for `key`, creating it if absent.
    /// Returns `true` alongside when it was created.
    pub fn ensure_timeseries(
        &self,
        group_id: GroupId,
        key: TimeseriesKey,
    ) -> Result<(Timeseries, bool), StoreError> {
        if let Some(existing) = self.find_timeseries(group_id, &key) {
            return Ok((existing, false));
        }
        let mut state = self.state.write();
        // Another caller may have created it between the two locks
        if let Some(existing) = state
            .timeseries
            .values()
            .find(|t| t.group_id == group_id && key.matches(t))
        {
            return Ok((existing.clone(), false));
        }
        let created = Self::insert_timeseries(&mut state, group_id, key, true)?;
        tracing::debug!(timeseries_id = created.id, group_id, "created time series");
        Ok((created, true))
    }

    fn insert_timeseries(
        state: &mut CatalogState,
        group_id: GroupId,
        key: TimeseriesKey,
        publicly_available: bool,
    ) -> Result<Timeseries, StoreError> {
        if !state.groups.contains_key(&group_id) {
            return Err(StoreError::GroupNotFound(group_id));
        }
        if state
            .timeseries
            .values()
            .any(|t| t.group_id == group_id && key.matches(t))
        {
            return Err(StoreError::UniqueViolation {
                group_id,
                key: format!("{:?}", key),
            });
        }
        state.next_timeseries_id += 1;
        let timeseries = Timeseries {
            id: state.next_timeseries_id,
            group_id,
            kind: key.kind,
            time_step: key.time_step,
            name: key.name,
            publicly_available,
        };
        state.timeseries.insert(timeseries.id, timeseries.clone());
        Ok(timeseries)
    }
}
