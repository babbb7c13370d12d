mod common;

use common::{new_child, new_parent, open_store, years_ago, BACKENDS};
use kinstore_core::{
    Child, Context, EntityKind, ListFilter, Pagination, Parent, QueryOptions, RepoError, Sort,
    SortField,
};
use uuid::Uuid;

#[test]
fn parent_create_get_update_roundtrip() {
    for backend in BACKENDS {
        let (_dir, store) = open_store(backend);
        let repo = store.parents();
        let ctx = Context::background();

        let mut parent = Parent::from_input(new_parent("John"));
        repo.create(&ctx, &parent).unwrap();

        let loaded = repo.get_by_id(&ctx, parent.id).unwrap();
        assert_eq!(loaded, parent, "backend={backend}");

        let created_updated_at = parent.updated_at;
        parent.email = "johnny@example.com".to_string();
        std::thread::sleep(std::time::Duration::from_millis(2));
        repo.update(&ctx, &mut parent).unwrap();
        assert!(parent.updated_at > created_updated_at);

        let loaded = repo.get_by_id(&ctx, parent.id).unwrap();
        assert_eq!(loaded.email, "johnny@example.com");
        assert_eq!(loaded.updated_at, parent.updated_at);
    }
}

#[test]
fn invalid_parent_is_rejected_before_storage() {
    for backend in BACKENDS {
        let (_dir, store) = open_store(backend);
        let ctx = Context::background();

        let mut parent = Parent::from_input(new_parent("John"));
        parent.email = "not-an-email".to_string();
        let err = store.parents().create(&ctx, &parent).unwrap_err();
        assert!(matches!(err, RepoError::Validation(_)), "backend={backend}");
        assert!(store.parents().find_by_id(&ctx, parent.id, true).unwrap().is_none());
    }
}

#[test]
fn soft_deleted_records_are_hidden_but_kept() {
    for backend in BACKENDS {
        let (_dir, store) = open_store(backend);
        let repo = store.parents();
        let ctx = Context::background();

        let parent = Parent::from_input(new_parent("Gone"));
        repo.create(&ctx, &parent).unwrap();
        repo.delete(&ctx, parent.id).unwrap();

        assert!(repo.get_by_id(&ctx, parent.id).unwrap_err().is_not_found());
        let (items, paged) = repo.list(&ctx, &QueryOptions::default()).unwrap();
        assert!(items.iter().all(|item| item.id != parent.id));
        assert_eq!(paged.total_count, 0);

        let direct = repo.find_by_id(&ctx, parent.id, true).unwrap().unwrap();
        assert!(direct.deleted_at.is_some(), "backend={backend}");
        assert_eq!(direct.updated_at, direct.deleted_at.unwrap());
    }
}

#[test]
fn update_and_delete_of_missing_records_report_not_found() {
    for backend in BACKENDS {
        let (_dir, store) = open_store(backend);
        let ctx = Context::background();
        let missing = Uuid::new_v4();

        let mut ghost = Parent::from_input(new_parent("Ghost"));
        ghost.id = missing;
        match store.parents().update(&ctx, &mut ghost).unwrap_err() {
            RepoError::NotFound { entity, id } => {
                assert_eq!(entity, EntityKind::Parent);
                assert_eq!(id, missing);
            }
            other => panic!("unexpected error on {backend}: {other}"),
        }

        assert!(store
            .children()
            .delete(&ctx, missing)
            .unwrap_err()
            .is_not_found());

        let parent = Parent::from_input(new_parent("Twice"));
        store.parents().create(&ctx, &parent).unwrap();
        store.parents().delete(&ctx, parent.id).unwrap();
        assert!(store
            .parents()
            .delete(&ctx, parent.id)
            .unwrap_err()
            .is_not_found());
    }
}

#[test]
fn child_create_requires_live_parent() {
    for backend in BACKENDS {
        let (_dir, store) = open_store(backend);
        let ctx = Context::background();

        let orphan = Child::from_input(Uuid::new_v4(), new_child("Orphan"));
        match store.children().create(&ctx, &orphan).unwrap_err() {
            RepoError::NotFound { entity, .. } => assert_eq!(entity, EntityKind::Parent),
            other => panic!("unexpected error on {backend}: {other}"),
        }

        let parent = Parent::from_input(new_parent("Deleted"));
        store.parents().create(&ctx, &parent).unwrap();
        store.parents().delete(&ctx, parent.id).unwrap();
        let late = Child::from_input(parent.id, new_child("Late"));
        assert!(store
            .children()
            .create(&ctx, &late)
            .unwrap_err()
            .is_not_found());
        assert!(store.children().find_by_id(&ctx, late.id, true).unwrap().is_none());
    }
}

#[test]
fn mark_deleted_by_parent_only_touches_live_children_of_that_parent() {
    for backend in BACKENDS {
        let (_dir, store) = open_store(backend);
        let ctx = Context::background();
        let children = store.children();

        let parent = Parent::from_input(new_parent("Anna"));
        let other = Parent::from_input(new_parent("Bert"));
        store.parents().create(&ctx, &parent).unwrap();
        store.parents().create(&ctx, &other).unwrap();

        let first = Child::from_input(parent.id, new_child("First"));
        let second = Child::from_input(parent.id, new_child("Second"));
        let already = Child::from_input(parent.id, new_child("Already"));
        let foreign = Child::from_input(other.id, new_child("Foreign"));
        for child in [&first, &second, &already, &foreign] {
            children.create(&ctx, child).unwrap();
        }
        children.mark_deleted(&ctx, already.id, 1).unwrap();

        let affected = children.mark_deleted_by_parent(&ctx, parent.id, 42).unwrap();
        assert_eq!(affected, 2, "backend={backend}");

        let first = children.find_by_id(&ctx, first.id, true).unwrap().unwrap();
        assert_eq!(first.deleted_at, Some(42));
        let already = children.find_by_id(&ctx, already.id, true).unwrap().unwrap();
        assert_eq!(already.deleted_at, Some(1));
        assert!(children.get_by_id(&ctx, foreign.id).is_ok());
        assert!(children.list_by_parent(&ctx, parent.id).unwrap().is_empty());
    }
}

#[test]
fn list_with_unique_first_name_returns_single_match() {
    for backend in BACKENDS {
        let (_dir, store) = open_store(backend);
        let ctx = Context::background();
        for name in ["Unique", "Common", "Other"] {
            store
                .parents()
                .create(&ctx, &Parent::from_input(new_parent(name)))
                .unwrap();
        }

        let options = QueryOptions::with_filter(ListFilter::first_name("Unique"));
        let (items, paged) = store.parents().list(&ctx, &options).unwrap();
        assert_eq!(items.len(), 1, "backend={backend}");
        assert_eq!(items[0].first_name, "Unique");
        assert_eq!(paged.total_count, 1);
        assert!(!paged.has_next);
    }
}

#[test]
fn list_paginates_sorts_and_reports_has_next() {
    for backend in BACKENDS {
        let (_dir, store) = open_store(backend);
        let ctx = Context::background();
        for name in ["Cara", "Abel", "Eve", "Dan", "Bea"] {
            store
                .parents()
                .create(&ctx, &Parent::from_input(new_parent(name)))
                .unwrap();
        }

        let mut options = QueryOptions {
            pagination: Pagination::new(1, 2),
            sort: Sort::asc(SortField::FirstName),
            ..QueryOptions::default()
        };
        let (first_page, paged) = store.parents().list(&ctx, &options).unwrap();
        let names: Vec<_> = first_page.iter().map(|p| p.first_name.as_str()).collect();
        assert_eq!(names, ["Abel", "Bea"], "backend={backend}");
        assert_eq!(paged.total_count, 5);
        assert!(paged.has_next);

        options.pagination = Pagination::new(3, 2);
        let (last_page, paged) = store.parents().list(&ctx, &options).unwrap();
        assert_eq!(last_page.len(), 1);
        assert_eq!(last_page[0].first_name, "Eve");
        assert!(!paged.has_next);
    }
}

#[test]
fn list_filters_by_substring_age_and_parent() {
    for backend in BACKENDS {
        let (_dir, store) = open_store(backend);
        let ctx = Context::background();

        let mut young = Parent::from_input(new_parent("Young"));
        young.birth_date = years_ago(20);
        young.email = "young_one@example.com".to_string();
        let old = Parent::from_input(new_parent("Old"));
        store.parents().create(&ctx, &young).unwrap();
        store.parents().create(&ctx, &old).unwrap();

        let by_age = QueryOptions::with_filter(ListFilter {
            min_age: Some(25),
            ..ListFilter::default()
        });
        let (items, _) = store.parents().list(&ctx, &by_age).unwrap();
        assert_eq!(items.len(), 1, "backend={backend}");
        assert_eq!(items[0].id, old.id);

        // `_` is matched literally, not as a wildcard.
        let by_email = QueryOptions::with_filter(ListFilter {
            email: Some("g_o".to_string()),
            ..ListFilter::default()
        });
        assert_eq!(store.parents().count(&ctx, &by_email.filter).unwrap(), 1);
        let literal_miss = ListFilter {
            email: Some("d_d".to_string()),
            ..ListFilter::default()
        };
        assert_eq!(store.parents().count(&ctx, &literal_miss).unwrap(), 0);

        let child = Child::from_input(young.id, new_child("Kid"));
        store.children().create(&ctx, &child).unwrap();
        store
            .children()
            .create(&ctx, &Child::from_input(old.id, new_child("Kid")))
            .unwrap();
        let for_young = QueryOptions::with_filter(ListFilter {
            parent_id: Some(young.id),
            ..ListFilter::default()
        });
        let (kids, paged) = store.children().list(&ctx, &for_young).unwrap();
        assert_eq!(paged.total_count, 1);
        assert_eq!(kids[0].id, child.id);
    }
}

#[test]
fn list_with_cancelled_context_fails_with_cancellation() {
    for backend in BACKENDS {
        let (_dir, store) = open_store(backend);
        let (ctx, token) = Context::background().with_cancel();
        token.cancel();
        let err = store
            .children()
            .list(&ctx, &QueryOptions::default())
            .unwrap_err();
        assert!(matches!(err, RepoError::Cancelled(_)), "backend={backend}");
        assert_eq!(store.connections_in_use(), 0);
    }
}
