//! Record registry and per-target announcement table.

use std::collections::HashMap;

use crate::contracts::{AnnouncementState, GlobalProperties, Record, RecordId, TargetId};
use crate::errors::{RecsyncError, Result};

/// Registered records plus the `(target, record)` announcement table.
///
/// Records are never removed; [`RecordId`]s are stable indices in
/// registration order.
#[derive(Debug, Clone)]
pub struct RecordRegistry {
    records: Vec<Record>,
    by_name: HashMap<String, RecordId>,
    target_count: usize,
    states: HashMap<(TargetId, RecordId), AnnouncementState>,
    globals: GlobalProperties,
    frozen: bool,
}

impl RecordRegistry {
    /// Create an empty registry tracking `target_count` receivers.
    pub fn new(target_count: usize) -> Self {
        Self {
            records: Vec::new(),
            by_name: HashMap::new(),
            target_count,
            states: HashMap::new(),
            globals: GlobalProperties::new(),
            frozen: false,
        }
    }

    /// Add a record in `Pending` state for every target.
    ///
    /// Fails with `DuplicateRecord` if the name is taken; the registry is
    /// unchanged on failure.
    pub fn register(&mut self, record: Record) -> Result<RecordId> {
        record.validate()?;
        if self.by_name.contains_key(&record.name) {
            return Err(RecsyncError::DuplicateRecord(record.name));
        }

        let id = RecordId(self.records.len());
        for target in 0..self.target_count {
            self.states.insert((TargetId(target), id), AnnouncementState::Pending);
        }
        self.by_name.insert(record.name.clone(), id);
        self.records.push(record);
        Ok(id)
    }

    /// Replace the global property set. Only allowed before announcing starts.
    pub fn set_global_properties(&mut self, globals: GlobalProperties) -> Result<()> {
        if self.frozen {
            return Err(RecsyncError::AlreadyRunning);
        }
        self.globals = globals;
        Ok(())
    }

    /// Add or replace one global property. Only allowed before announcing starts.
    pub fn add_global_property(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        if self.frozen {
            return Err(RecsyncError::AlreadyRunning);
        }
        self.globals.insert(key, value);
        Ok(())
    }

    /// Lock the global properties for the rest of the run
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn global_properties(&self) -> &GlobalProperties {
        &self.globals
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: RecordId) -> Option<&Record> {
        self.records.get(id.0)
    }

    pub fn id_of(&self, name: &str) -> Option<RecordId> {
        self.by_name.get(name).copied()
    }

    pub fn records(&self) -> impl Iterator<Item = (RecordId, &Record)> {
        self.records.iter().enumerate().map(|(i, r)| (RecordId(i), r))
    }

    /// State of `record` for `target`
    pub fn state(&self, target: TargetId, record: RecordId) -> Option<AnnouncementState> {
        self.states.get(&(target, record)).copied()
    }

    /// Records not yet acknowledged by `target`, in registration order
    pub fn pending_for(&self, target: TargetId) -> Vec<(RecordId, &Record)> {
        self.filter_for(target, |state| state != AnnouncementState::Acked)
    }

    /// Records in `Pending` state for `target`: not acked and not carried by
    /// any unacknowledged packet
    pub fn unsent_for(&self, target: TargetId) -> Vec<(RecordId, &Record)> {
        self.filter_for(target, |state| state == AnnouncementState::Pending)
    }

    fn filter_for<F>(&self, target: TargetId, keep: F) -> Vec<(RecordId, &Record)>
    where
        F: Fn(AnnouncementState) -> bool,
    {
        self.records()
            .filter(|(id, _)| self.state(target, *id).is_some_and(&keep))
            .collect()
    }

    /// Whether every record has been acknowledged by `target`
    pub fn all_acked(&self, target: TargetId) -> bool {
        self.pending_for(target).is_empty()
    }

    /// Mark records as carried by packet `sequence`. Acked records stay acked.
    pub fn mark_in_flight(&mut self, records: &[RecordId], target: TargetId, sequence: u32) {
        for id in records {
            if let Some(state) = self.states.get_mut(&(target, *id)) {
                if *state != AnnouncementState::Acked {
                    *state = AnnouncementState::InFlight { sequence };
                }
            }
        }
    }

    /// Mark records as acknowledged by `target`. Idempotent.
    pub fn mark_acked(&mut self, records: &[RecordId], target: TargetId) {
        for id in records {
            if let Some(state) = self.states.get_mut(&(target, *id)) {
                *state = AnnouncementState::Acked;
            }
        }
    }

    /// Return records carried by a failed packet to `Pending`.
    ///
    /// Only records still in flight under `sequence` are reverted.
    pub fn mark_pending(&mut self, records: &[RecordId], target: TargetId, sequence: u32) {
        for id in records {
            if let Some(state) = self.states.get_mut(&(target, *id)) {
                if *state == (AnnouncementState::InFlight { sequence }) {
                    *state = AnnouncementState::Pending;
                }
            }
        }
    }

    /// Names of the given records, for reporting
    pub fn names(&self, records: &[RecordId]) -> Vec<String> {
        records
            .iter()
            .filter_map(|id| self.get(*id))
            .map(|r| r.name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: TargetId = TargetId(0);
    const T1: TargetId = TargetId(1);

    fn registry() -> RecordRegistry {
        let mut reg = RecordRegistry::new(2);
        reg.register(Record::new("A", "ai")).unwrap();
        reg.register(Record::new("B", "longin").with_alias("B:ALIAS")).unwrap();
        reg
    }

    #[test]
    fn test_duplicate_registration_leaves_state_unchanged() {
        let mut reg = registry();
        let before = reg.pending_for(T0).len();

        let result = reg.register(Record::new("A", "bo"));
        assert!(matches!(result, Err(RecsyncError::DuplicateRecord(ref name)) if name == "A"));
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.pending_for(T0).len(), before);
        assert_eq!(reg.get(RecordId(0)).unwrap().record_type, "ai");
    }

    #[test]
    fn test_invalid_record_rejected() {
        let mut reg = RecordRegistry::new(1);
        assert!(matches!(
            reg.register(Record::new("", "ai")),
            Err(RecsyncError::InvalidRecord(_))
        ));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_pending_order_is_registration_order() {
        let mut reg = registry();
        reg.register(Record::new("0-first-alphabetically", "ai")).unwrap();
        let names: Vec<_> = reg.pending_for(T0).into_iter().map(|(_, r)| r.name.as_str()).collect();
        assert_eq!(names, vec!["A", "B", "0-first-alphabetically"]);
    }

    #[test]
    fn test_targets_are_independent() {
        let mut reg = registry();
        let ids = [RecordId(0), RecordId(1)];
        reg.mark_in_flight(&ids, T0, 10);
        reg.mark_acked(&ids, T0);

        assert!(reg.all_acked(T0));
        assert_eq!(reg.pending_for(T1).len(), 2);
        assert_eq!(reg.state(T1, RecordId(0)), Some(AnnouncementState::Pending));
    }

    #[test]
    fn test_in_flight_excluded_from_unsent() {
        let mut reg = registry();
        reg.mark_in_flight(&[RecordId(0)], T0, 5);

        assert_eq!(reg.pending_for(T0).len(), 2);
        let unsent: Vec<_> = reg.unsent_for(T0).into_iter().map(|(id, _)| id).collect();
        assert_eq!(unsent, vec![RecordId(1)]);
    }

    #[test]
    fn test_mark_acked_is_idempotent() {
        let mut reg = registry();
        reg.mark_acked(&[RecordId(0)], T0);
        reg.mark_acked(&[RecordId(0)], T0);
        assert_eq!(reg.state(T0, RecordId(0)), Some(AnnouncementState::Acked));

        // an acked record is not pulled back in flight or to pending
        reg.mark_in_flight(&[RecordId(0)], T0, 3);
        reg.mark_pending(&[RecordId(0)], T0, 3);
        assert_eq!(reg.state(T0, RecordId(0)), Some(AnnouncementState::Acked));
    }

    #[test]
    fn test_stale_failure_does_not_revert_newer_send() {
        let mut reg = registry();
        reg.mark_in_flight(&[RecordId(1)], T0, 1);
        reg.mark_in_flight(&[RecordId(1)], T0, 2);
        reg.mark_pending(&[RecordId(1)], T0, 1);
        assert_eq!(
            reg.state(T0, RecordId(1)),
            Some(AnnouncementState::InFlight { sequence: 2 })
        );
        reg.mark_pending(&[RecordId(1)], T0, 2);
        assert_eq!(reg.state(T0, RecordId(1)), Some(AnnouncementState::Pending));
    }

    #[test]
    fn test_global_properties_frozen_after_start() {
        let mut reg = registry();
        reg.add_global_property("ENGINEER", "X").unwrap();
        reg.freeze();

        assert_eq!(reg.add_global_property("HOSTNAME", "h"), Err(RecsyncError::AlreadyRunning));
        assert_eq!(
            reg.set_global_properties(GlobalProperties::new()),
            Err(RecsyncError::AlreadyRunning)
        );
        assert_eq!(reg.global_properties().get("ENGINEER"), Some("X"));
        assert_eq!(reg.global_properties().len(), 1);
    }
}
