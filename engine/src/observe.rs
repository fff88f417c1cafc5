//! Prefix observers - scan subscriptions that report what changed.

use crate::{
    replica::{Replica, SubscriptionHandle},
    ClientId, Key, ScanOptions,
};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Differences between two consecutive scans.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChangeSummary {
    pub added: Vec<(Key, Value)>,
    pub removed: Vec<(Key, Value)>,
    /// New values of keys present in both scans with a different value
    pub changed: Vec<(Key, Value)>,
}

impl ChangeSummary {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Compare two key-sorted entry lists.
pub fn diff_entries(previous: &[(Key, Value)], current: &[(Key, Value)]) -> ChangeSummary {
    let before: BTreeMap<&Key, &Value> = previous.iter().map(|(k, v)| (k, v)).collect();
    let after: BTreeMap<&Key, &Value> = current.iter().map(|(k, v)| (k, v)).collect();

    let mut summary = ChangeSummary::default();
    for (key, value) in current {
        match before.get(key) {
            None => summary.added.push((key.clone(), value.clone())),
            Some(old) if *old != value => summary.changed.push((key.clone(), value.clone())),
            Some(_) => {}
        }
    }
    for (key, value) in previous {
        if !after.contains_key(key) {
            summary.removed.push((key.clone(), value.clone()));
        }
    }
    summary
}

/// Subscribe to the entries of a scan.
///
/// The callback receives the full entry list and the difference from the
/// previous delivery. The first delivery reports every entry as added.
pub fn observe_prefix<F>(
    replica: &Arc<Replica>,
    options: impl Into<ScanOptions>,
    callback: F,
) -> SubscriptionHandle
where
    F: Fn(&[(Key, Value)], &ChangeSummary) + Send + Sync + 'static,
{
    let options = options.into();
    let previous: Mutex<Vec<(Key, Value)>> = Mutex::new(Vec::new());

    replica.subscribe(
        move |tx| Ok(tx.scan(options.clone()).entries().to_array()),
        move |entries: Vec<(Key, Value)>| {
            let summary = {
                let mut previous = previous.lock();
                let summary = diff_entries(&previous, &entries);
                *previous = entries.clone();
                summary
            };
            callback(&entries, &summary);
        },
    )
}

/// Whole-space change notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEvent {
    pub state: BTreeMap<Key, Value>,
    pub changes: ChangeSummary,
    pub client_id: ClientId,
}

/// Observe every key in the space.
pub fn observe_space<F>(replica: &Arc<Replica>, callback: F) -> SubscriptionHandle
where
    F: Fn(&ChangeEvent) + Send + Sync + 'static,
{
    let client_id = replica.client_id().to_string();
    observe_prefix(replica, ScanOptions::new(), move |entries, changes| {
        callback(&ChangeEvent {
            state: entries.iter().cloned().collect(),
            changes: changes.clone(),
            client_id: client_id.clone(),
        });
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{entry::PendingMutation, Mutation, Operation};
    use serde_json::json;

    fn entry(key: &str, value: Value) -> (Key, Value) {
        (key.to_string(), value)
    }

    fn commit(replica: &Replica, id: u64, ops: Vec<Operation>) {
        replica.commit(PendingMutation::new(Mutation {
            id,
            name: "test".into(),
            args: Value::Null,
            operations: ops,
        }));
    }

    #[test]
    fn diff_detects_all_three_kinds() {
        let previous = vec![entry("a", json!(1)), entry("b", json!(2))];
        let current = vec![entry("b", json!(3)), entry("c", json!(4))];

        let summary = diff_entries(&previous, &current);

        assert_eq!(summary.added, vec![entry("c", json!(4))]);
        assert_eq!(summary.removed, vec![entry("a", json!(1))]);
        assert_eq!(summary.changed, vec![entry("b", json!(3))]);
    }

    #[test]
    fn identical_scans_diff_to_nothing() {
        let entries = vec![entry("a", json!({"x": 1}))];
        assert!(diff_entries(&entries, &entries).is_empty());
    }

    #[test]
    fn observer_reports_changes() {
        let replica = Replica::new("c");
        let summaries = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&summaries);
        let _handle = observe_prefix(&replica, "todo/", move |_, summary| {
            sink.lock().push(summary.clone());
        });

        commit(&replica, 1, vec![Operation::set("todo/1", json!("a"))]);
        commit(&replica, 2, vec![Operation::set("todo/1", json!("b"))]);
        commit(&replica, 3, vec![Operation::set("other", json!(true))]);
        commit(&replica, 4, vec![Operation::del("todo/1")]);

        let summaries = summaries.lock();
        assert_eq!(summaries.len(), 4);
        assert!(summaries[0].is_empty());
        assert_eq!(summaries[1].added, vec![entry("todo/1", json!("a"))]);
        assert_eq!(summaries[2].changed, vec![entry("todo/1", json!("b"))]);
        assert_eq!(summaries[3].removed, vec![entry("todo/1", json!("b"))]);
    }

    #[test]
    fn space_observer_sees_full_state() {
        let replica = Replica::new("observer");
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let _handle = observe_space(&replica, move |event| sink.lock().push(event.clone()));

        commit(
            &replica,
            1,
            vec![Operation::set("a", json!(1)), Operation::set("b", json!(2))],
        );

        let events = events.lock();
        let last = events.last().unwrap();
        assert_eq!(last.client_id, "observer");
        assert_eq!(last.state.len(), 2);
        assert_eq!(last.changes.added.len(), 2);
    }
}
