#![allow(dead_code)]

use chrono::{Months, NaiveDate};
use kinstore_core::model::today;
use kinstore_core::{
    Backend, Context, EntityId, FamilyService, NewChild, NewParent, Store, StoreConfig,
};
use std::collections::BTreeSet;
use tempfile::TempDir;

pub const BACKENDS: [Backend; 2] = [Backend::Document, Backend::Relational];

/// Store on a fresh file database; keep the `TempDir` alive with it.
pub fn open_store(backend: Backend) -> (TempDir, Store) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(&StoreConfig::new(backend, dir.path().join("kinstore.db"))).unwrap();
    (dir, store)
}

pub fn years_ago(years: u32) -> NaiveDate {
    today().checked_sub_months(Months::new(years * 12)).unwrap()
}

pub fn new_parent(first_name: &str) -> NewParent {
    NewParent {
        first_name: first_name.to_string(),
        last_name: "Doe".to_string(),
        email: format!("{}.doe@example.com", first_name.to_ascii_lowercase()),
        birth_date: years_ago(30),
    }
}

pub fn new_child(first_name: &str) -> NewChild {
    NewChild {
        first_name: first_name.to_string(),
        last_name: "Doe".to_string(),
        birth_date: years_ago(5),
    }
}

/// Ids in the parent's projection.
pub fn projected_ids(service: &FamilyService, parent_id: EntityId) -> BTreeSet<EntityId> {
    service
        .get_parent(&Context::background(), parent_id)
        .unwrap()
        .embedded_child_ids()
        .into_iter()
        .collect()
}

/// Ids of the non-deleted child records pointing at `parent_id`.
pub fn stored_child_ids(store: &Store, parent_id: EntityId) -> BTreeSet<EntityId> {
    store
        .children()
        .list_by_parent(&Context::background(), parent_id)
        .unwrap()
        .into_iter()
        .map(|child| child.id)
        .collect()
}

pub fn assert_projection_consistent(store: &Store, service: &FamilyService, parent_id: EntityId) {
    assert_eq!(
        projected_ids(service, parent_id),
        stored_child_ids(store, parent_id),
        "projection drifted for parent {parent_id} on {}",
        store.backend()
    );
}
