//! # Station Registry
//!
//! The in-memory view of the upstream registry: stations and storage targets
//! keyed by generated ids, plus the worker-slot assignment table.
//!
//! The registry lives behind one `std::sync::Mutex` ([`SharedRegistry`]) and
//! is only ever locked for short synchronous sections, never across an
//! `.await`.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use crate::retrieve::registry_api::{DatabaseRecord, StationRecord};
use crate::utils::ids::{unique_id, ID_LENGTH};

/// Generated identifier of a station.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct StationId(pub String);

impl fmt::Display for StationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Generated identifier of a storage target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct StorageTargetId(pub String);

impl fmt::Display for StorageTargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A worker slot: `slot` within process group `process`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SlotKey {
    pub process: usize,
    pub slot: usize,
}

impl SlotKey {
    pub fn new(process: usize, slot: usize) -> Self {
        Self { process, slot }
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}:ICO_{}", self.process, self.slot)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// One telemetry source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Station {
    pub id: StationId,
    pub upstream_id: Value,
    pub code: String,
    pub name: String,
    pub host: String,
    pub protocol_host: String,
    pub port: u16,
    /// Upper-cased protocol name.
    pub protocol: String,
    pub position: Position,
    pub slot: Option<SlotKey>,
    pub first_time: bool,
    pub connected: bool,
    pub initialized: bool,
    /// Forces the collector to rebuild its client.
    pub changed: bool,
}

impl Station {
    pub fn from_record(id: StationId, record: &StationRecord) -> Self {
        let mut station = Self {
            id,
            upstream_id: Value::Null,
            code: String::new(),
            name: String::new(),
            host: String::new(),
            protocol_host: String::new(),
            port: 0,
            protocol: String::new(),
            position: Position::default(),
            slot: None,
            first_time: true,
            connected: false,
            initialized: false,
            changed: false,
        };
        station.apply(record);
        station
    }

    fn apply(&mut self, record: &StationRecord) {
        let host = if record.host.is_empty() {
            "localhost".to_string()
        } else {
            record.host.clone()
        };
        self.upstream_id = record.id.clone();
        self.code = record.code.clone();
        self.name = record.name.clone();
        self.protocol_host = if record.protocol_host.is_empty() {
            host.clone()
        } else {
            record.protocol_host.clone()
        };
        self.host = host;
        self.port = record.port;
        self.protocol = record.protocol.to_uppercase();
        let ecef = record.position.ecef;
        self.position = Position {
            x: ecef.x,
            y: ecef.y,
            z: ecef.z,
        };
    }

    /// Storage table the station's records are written to.
    pub fn table_name(&self) -> String {
        format!("{}_{}", self.code, self.protocol)
    }

    /// Whether `record` points at a different endpoint than this station.
    pub fn address_differs(&self, record: &StationRecord) -> bool {
        let moved = Station::from_record(self.id.clone(), record);
        moved.host != self.host
            || moved.protocol_host != self.protocol_host
            || moved.port != self.port
    }
}

/// Connection parameters of one storage server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageTarget {
    pub id: StorageTargetId,
    pub upstream_id: Value,
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub dbname: String,
    pub path: String,
    pub info: Value,
}

impl StorageTarget {
    pub fn from_record(id: StorageTargetId, record: &DatabaseRecord) -> Self {
        Self {
            id,
            upstream_id: record.id.clone(),
            host: record.host.clone(),
            port: record.port,
            user: record.user.clone(),
            password: record.passw.clone(),
            dbname: record.dbname.clone(),
            path: record.path.clone(),
            info: record.info.clone(),
        }
    }

    /// A target on localhost writing into `dbname`.
    pub fn local(dbname: &str) -> Self {
        Self {
            id: StorageTargetId("local".to_string()),
            upstream_id: Value::Null,
            host: "localhost".to_string(),
            port: 0,
            user: String::new(),
            password: String::new(),
            dbname: dbname.to_string(),
            path: String::new(),
            info: Value::Null,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AssignError {
    #[error("slot {0} does not exist")]
    UnknownSlot(SlotKey),
    #[error("slot {slot} already holds station {holder}")]
    SlotBusy { slot: SlotKey, holder: StationId },
    #[error("station {station} is already assigned to {slot}")]
    AlreadyAssigned { station: StationId, slot: SlotKey },
    #[error("station {0} is not registered")]
    UnknownStation(StationId),
}

/// Worker slots and the station each one holds.
///
/// The reverse index guarantees a station sits in at most one slot.
#[derive(Debug, Clone, Default)]
pub struct AssignmentTable {
    slots: BTreeMap<SlotKey, Option<StationId>>,
    owners: HashMap<StationId, SlotKey>,
}

impl AssignmentTable {
    pub fn with_slots(processes: usize, slots_per_process: usize) -> Self {
        let mut table = Self::default();
        for process in 0..processes {
            for slot in 0..slots_per_process {
                table.slots.insert(SlotKey::new(process, slot), None);
            }
        }
        table
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = SlotKey> + '_ {
        self.slots.keys().copied()
    }

    pub fn station_at(&self, key: SlotKey) -> Option<&StationId> {
        self.slots.get(&key).and_then(Option::as_ref)
    }

    pub fn slot_of(&self, id: &StationId) -> Option<SlotKey> {
        self.owners.get(id).copied()
    }

    /// Free slots in key order.
    pub fn free_slots(&self) -> impl Iterator<Item = SlotKey> + '_ {
        self.slots
            .iter()
            .filter(|(_, holder)| holder.is_none())
            .map(|(key, _)| *key)
    }

    pub fn entries(&self) -> impl Iterator<Item = (SlotKey, Option<&StationId>)> + '_ {
        self.slots.iter().map(|(key, holder)| (*key, holder.as_ref()))
    }

    pub fn assign(&mut self, key: SlotKey, id: StationId) -> Result<(), AssignError> {
        if let Some(slot) = self.owners.get(&id) {
            return Err(AssignError::AlreadyAssigned { station: id, slot: *slot });
        }
        let holder = self.slots.get_mut(&key).ok_or(AssignError::UnknownSlot(key))?;
        if let Some(current) = holder {
            return Err(AssignError::SlotBusy {
                slot: key,
                holder: current.clone(),
            });
        }
        *holder = Some(id.clone());
        self.owners.insert(id, key);
        Ok(())
    }

    pub fn unassign_slot(&mut self, key: SlotKey) -> Option<StationId> {
        let id = self.slots.get_mut(&key)?.take()?;
        self.owners.remove(&id);
        Some(id)
    }

    pub fn unassign_station(&mut self, id: &StationId) -> Option<SlotKey> {
        let key = self.owners.remove(id)?;
        if let Some(holder) = self.slots.get_mut(&key) {
            *holder = None;
        }
        Some(key)
    }
}

/// Stations, storage targets and slot assignments.
#[derive(Debug, Default)]
pub struct Registry {
    stations: HashMap<StationId, Station>,
    targets: Vec<StorageTarget>,
    assignments: AssignmentTable,
    next_target: usize,
}

pub type SharedRegistry = Arc<Mutex<Registry>>;

/// Locks the shared registry, recovering the data from a poisoned lock.
pub fn lock(registry: &SharedRegistry) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Registry {
    pub fn new(assignments: AssignmentTable) -> Self {
        Self {
            assignments,
            ..Self::default()
        }
    }

    pub fn shared(self) -> SharedRegistry {
        Arc::new(Mutex::new(self))
    }

    // --- Stations ---

    pub fn add_station(&mut self, record: &StationRecord) -> StationId {
        let id = StationId(unique_id(ID_LENGTH, |candidate| {
            self.stations.contains_key(&StationId(candidate.to_string()))
        }));
        self.stations
            .insert(id.clone(), Station::from_record(id.clone(), record));
        id
    }

    /// Rewrites a station from `record` and flags it `changed`.
    pub fn update_station(&mut self, id: &StationId, record: &StationRecord) -> bool {
        let Some(station) = self.stations.get_mut(id) else {
            return false;
        };
        station.apply(record);
        station.changed = true;
        station.first_time = true;
        true
    }

    /// Deletes a station, freeing its slot first.
    pub fn remove_station(&mut self, id: &StationId) -> Option<Station> {
        self.assignments.unassign_station(id);
        let mut station = self.stations.remove(id)?;
        station.slot = None;
        Some(station)
    }

    pub fn station(&self, id: &StationId) -> Option<&Station> {
        self.stations.get(id)
    }

    pub fn station_by_code(&self, code: &str) -> Option<&Station> {
        self.stations.values().find(|s| s.code == code)
    }

    pub fn stations(&self) -> impl Iterator<Item = &Station> {
        self.stations.values()
    }

    pub fn station_count(&self) -> usize {
        self.stations.len()
    }

    pub fn codes(&self) -> HashSet<String> {
        self.stations.values().map(|s| s.code.clone()).collect()
    }

    pub fn clear_changed(&mut self, id: &StationId) {
        if let Some(station) = self.stations.get_mut(id) {
            station.changed = false;
            station.initialized = true;
        }
    }

    pub fn mark_connected(&mut self, id: &StationId) {
        if let Some(station) = self.stations.get_mut(id) {
            station.connected = true;
            station.first_time = false;
        }
    }

    /// Clears the connection flags after a reset.
    pub fn reset_flags(&mut self, id: &StationId) {
        if let Some(station) = self.stations.get_mut(id) {
            station.connected = false;
            station.initialized = false;
            station.first_time = true;
        }
    }

    // --- Assignment ---

    pub fn assignments(&self) -> &AssignmentTable {
        &self.assignments
    }

    pub fn station_at(&self, key: SlotKey) -> Option<&Station> {
        self.assignments
            .station_at(key)
            .and_then(|id| self.stations.get(id))
    }

    pub fn assign(&mut self, key: SlotKey, id: &StationId) -> Result<(), AssignError> {
        let station = self
            .stations
            .get_mut(id)
            .ok_or_else(|| AssignError::UnknownStation(id.clone()))?;
        self.assignments.assign(key, id.clone())?;
        station.slot = Some(key);
        Ok(())
    }

    pub fn unassign_slot(&mut self, key: SlotKey) -> Option<StationId> {
        let id = self.assignments.unassign_slot(key)?;
        if let Some(station) = self.stations.get_mut(&id) {
            station.slot = None;
        }
        Some(id)
    }

    /// Unassigned stations, ordered by code.
    pub fn unassigned_stations(&self) -> Vec<StationId> {
        let mut pending: Vec<&Station> = self
            .stations
            .values()
            .filter(|s| self.assignments.slot_of(&s.id).is_none())
            .collect();
        pending.sort_by(|a, b| a.code.cmp(&b.code));
        pending.into_iter().map(|s| s.id.clone()).collect()
    }

    /// Places every unassigned station in a free slot, in slot order.
    pub fn assign_pending(&mut self) -> Vec<(SlotKey, StationId)> {
        let free: Vec<SlotKey> = self.assignments.free_slots().collect();
        let mut placed = Vec::new();
        for (key, id) in free.into_iter().zip(self.unassigned_stations()) {
            if self.assign(key, &id).is_ok() {
                placed.push((key, id));
            }
        }
        placed
    }

    // --- Storage targets ---

    /// Registers a target unless one with the same `(host, port)` exists.
    pub fn add_target(&mut self, record: &DatabaseRecord) -> Option<StorageTargetId> {
        if self
            .targets
            .iter()
            .any(|t| t.host == record.host && t.port == record.port)
        {
            return None;
        }
        let id = StorageTargetId(unique_id(ID_LENGTH, |candidate| {
            self.targets.iter().any(|t| t.id.0 == candidate)
        }));
        self.targets
            .push(StorageTarget::from_record(id.clone(), record));
        Some(id)
    }

    pub fn targets(&self) -> &[StorageTarget] {
        &self.targets
    }

    /// Next target in round-robin order.
    pub fn next_target(&mut self) -> Option<StorageTarget> {
        if self.targets.is_empty() {
            return None;
        }
        let target = self.targets[self.next_target % self.targets.len()].clone();
        self.next_target = (self.next_target + 1) % self.targets.len();
        Some(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(processes: usize, slots: usize) -> Registry {
        Registry::new(AssignmentTable::with_slots(processes, slots))
    }

    #[test]
    fn station_from_record_normalizes_fields() {
        let mut record = StationRecord::new("STA1", "10.0.0.5", 5001).with_protocol("gsof");
        record.protocol_host.clear();
        let station = Station::from_record(StationId("abc123".to_string()), &record);

        assert_eq!(station.protocol, "GSOF");
        assert_eq!(station.protocol_host, "10.0.0.5");
        assert_eq!(station.table_name(), "STA1_GSOF");
        assert!(station.first_time);
        assert!(!station.changed);
    }

    #[test]
    fn assignment_table_rejects_double_placement() {
        let mut table = AssignmentTable::with_slots(1, 2);
        let id = StationId("s1".to_string());
        table.assign(SlotKey::new(0, 0), id.clone()).unwrap();

        assert_eq!(
            table.assign(SlotKey::new(0, 1), id.clone()),
            Err(AssignError::AlreadyAssigned {
                station: id.clone(),
                slot: SlotKey::new(0, 0)
            })
        );
        assert!(matches!(
            table.assign(SlotKey::new(0, 0), StationId("s2".to_string())),
            Err(AssignError::SlotBusy { .. })
        ));
        assert_eq!(table.unassign_slot(SlotKey::new(0, 0)), Some(id.clone()));
        assert_eq!(table.slot_of(&id), None);
    }

    #[test]
    fn assign_pending_fills_slots_in_order() {
        let mut reg = registry(2, 1);
        let b = reg.add_station(&StationRecord::new("BBBB", "h", 1));
        let a = reg.add_station(&StationRecord::new("AAAA", "h", 2));
        let c = reg.add_station(&StationRecord::new("CCCC", "h", 3));

        let placed = reg.assign_pending();
        assert_eq!(
            placed,
            vec![(SlotKey::new(0, 0), a.clone()), (SlotKey::new(1, 0), b.clone())]
        );
        assert_eq!(reg.unassigned_stations(), vec![c]);
        assert_eq!(reg.station(&a).unwrap().slot, Some(SlotKey::new(0, 0)));
        assert!(reg.assign_pending().is_empty());
    }

    #[test]
    fn removing_station_frees_its_slot() {
        let mut reg = registry(1, 1);
        let id = reg.add_station(&StationRecord::new("STA1", "10.0.0.5", 5001));
        reg.assign_pending();

        let removed = reg.remove_station(&id).unwrap();
        assert_eq!(removed.code, "STA1");
        assert!(reg.assignments().station_at(SlotKey::new(0, 0)).is_none());
        assert_eq!(reg.station_count(), 0);
    }

    #[test]
    fn update_flags_station_changed() {
        let mut reg = registry(1, 1);
        let id = reg.add_station(&StationRecord::new("STA1", "10.0.0.5", 5001));
        let moved = StationRecord::new("STA1", "10.0.0.6", 5001);

        assert!(reg.station(&id).unwrap().address_differs(&moved));
        assert!(reg.update_station(&id, &moved));
        let station = reg.station(&id).unwrap();
        assert!(station.changed);
        assert_eq!(station.host, "10.0.0.6");

        reg.clear_changed(&id);
        assert!(!reg.station(&id).unwrap().changed);
    }

    #[test]
    fn targets_deduplicate_and_rotate() {
        let mut reg = registry(0, 0);
        let db = |host: &str, port| DatabaseRecord {
            host: host.to_string(),
            port,
            dbname: "collector".to_string(),
            ..DatabaseRecord::default()
        };
        assert!(reg.add_target(&db("db1", 5432)).is_some());
        assert!(reg.add_target(&db("db1", 5432)).is_none());
        assert!(reg.add_target(&db("db2", 5432)).is_some());

        let hosts: Vec<String> = (0..3).filter_map(|_| reg.next_target()).map(|t| t.host).collect();
        assert_eq!(hosts, vec!["db1", "db2", "db1"]);
    }
}
