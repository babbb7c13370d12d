mod common;

use common::{new_parent, open_store, BACKENDS};
use kinstore_core::tx::TxErrorCause;
use kinstore_core::{
    Backend, Context, ContextError, Parent, RepoError, Store, TransactionManagerExt, TxOp,
};
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

fn exists(store: &Store, parent: &Parent) -> bool {
    store
        .parents()
        .find_by_id(&Context::background(), parent.id, true)
        .unwrap()
        .is_some()
}

fn assert_released(store: &Store) {
    assert_eq!(store.active_sessions(), 0, "backend={}", store.backend());
    assert_eq!(store.connections_in_use(), 0, "backend={}", store.backend());
}

#[test]
fn commit_without_begin_names_the_missing_handle() {
    for backend in BACKENDS {
        let (_dir, store) = open_store(backend);
        let err = store
            .transaction_manager()
            .commit_tx(&Context::background())
            .unwrap_err();

        assert_eq!(err.op, TxOp::Commit);
        assert!(err.is_no_handle());
        let expected = match backend {
            Backend::Document => "no session found",
            Backend::Relational => "no transaction found",
        };
        let message = err.to_string();
        assert!(message.contains("no active transaction"), "{message}");
        assert!(message.contains(expected), "{message}");

        let rollback = store
            .transaction_manager()
            .rollback_tx(&Context::background())
            .unwrap_err();
        assert_eq!(rollback.op, TxOp::Rollback);
    }
}

#[test]
fn with_tx_commits_on_success() {
    for backend in BACKENDS {
        let (_dir, store) = open_store(backend);
        let parent = Parent::from_input(new_parent("Kept"));

        store
            .transaction_manager()
            .with_tx::<_, RepoError, _>(&Context::background(), |tx| {
                assert!(store.transaction_manager().has_active_tx(tx));
                store.parents().create(tx, &parent)
            })
            .unwrap();

        assert!(exists(&store, &parent));
        assert_released(&store);
    }
}

#[test]
fn with_tx_rolls_back_and_returns_original_error() {
    for backend in BACKENDS {
        let (_dir, store) = open_store(backend);
        let parent = Parent::from_input(new_parent("Dropped"));

        let err = store
            .transaction_manager()
            .with_tx::<(), RepoError, _>(&Context::background(), |tx| {
                store.parents().create(tx, &parent)?;
                Err(RepoError::InvalidData("injected".to_string()))
            })
            .unwrap_err();

        assert!(matches!(err, RepoError::InvalidData(ref message) if message == "injected"));
        assert!(!exists(&store, &parent), "backend={backend}");
        assert_released(&store);
    }
}

#[test]
fn with_tx_rolls_back_on_panic_and_resumes_unwinding() {
    for backend in BACKENDS {
        let (_dir, store) = open_store(backend);
        let parent = Parent::from_input(new_parent("Panicked"));

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            store
                .transaction_manager()
                .with_tx::<(), RepoError, _>(&Context::background(), |tx| {
                    store.parents().create(tx, &parent)?;
                    panic!("unit of work exploded");
                })
        }));

        assert!(outcome.is_err());
        assert!(!exists(&store, &parent), "backend={backend}");
        assert_released(&store);
    }
}

#[test]
fn begin_twice_joins_the_same_transaction() {
    for backend in BACKENDS {
        let (_dir, store) = open_store(backend);
        let tm = store.transaction_manager();
        let parent = Parent::from_input(new_parent("Joined"));

        let first = tm.begin_tx(&Context::background()).unwrap();
        let second = tm.begin_tx(&first).unwrap();
        assert!(tm.has_active_tx(&second));
        assert_eq!(store.connections_in_use(), 1, "backend={backend}");

        store.parents().create(&second, &parent).unwrap();
        tm.commit_tx(&first).unwrap();

        assert!(!tm.has_active_tx(&second));
        assert!(exists(&store, &parent));
        assert_released(&store);

        let again = tm.commit_tx(&second).unwrap_err();
        assert!(!again.is_no_handle());
        assert!(matches!(again.cause, TxErrorCause::NotActive(_)));
    }
}

#[test]
fn nested_with_tx_leaves_resolution_to_the_outer_scope() {
    for backend in BACKENDS {
        let (_dir, store) = open_store(backend);
        let tm = store.transaction_manager();
        let inner_parent = Parent::from_input(new_parent("Inner"));

        let result = tm.with_tx::<(), RepoError, _>(&Context::background(), |outer| {
            tm.with_tx::<(), RepoError, _>(outer, |inner| {
                store.parents().create(inner, &inner_parent)
            })?;
            assert!(tm.has_active_tx(outer));
            Err(RepoError::InvalidData("outer failed".to_string()))
        });

        assert!(result.is_err());
        assert!(!exists(&store, &inner_parent), "backend={backend}");
        assert_released(&store);
    }
}

#[test]
fn cancellation_inside_unit_of_work_rolls_back_and_releases() {
    for backend in BACKENDS {
        let (_dir, store) = open_store(backend);
        let (ctx, token) = Context::background().with_cancel();
        let parent = Parent::from_input(new_parent("Before"));

        let err = store
            .transaction_manager()
            .with_tx::<(), RepoError, _>(&ctx, |tx| {
                store.parents().create(tx, &parent)?;
                token.cancel();
                store
                    .parents()
                    .create(tx, &Parent::from_input(new_parent("After")))
            })
            .unwrap_err();

        assert!(
            matches!(err, RepoError::Cancelled(ContextError::Cancelled)),
            "backend={backend} err={err}"
        );
        assert!(!exists(&store, &parent));
        assert_released(&store);
    }
}

#[test]
fn rollback_succeeds_after_context_is_cancelled() {
    for backend in BACKENDS {
        let (_dir, store) = open_store(backend);
        let tm = store.transaction_manager();
        let (ctx, token) = Context::background().with_cancel();
        let parent = Parent::from_input(new_parent("Abandoned"));

        let tx = tm.begin_tx(&ctx).unwrap();
        store.parents().create(&tx, &parent).unwrap();
        token.cancel();

        tm.rollback_tx(&tx).unwrap();
        assert!(!tm.has_active_tx(&tx));
        assert!(!exists(&store, &parent), "backend={backend}");
        assert_released(&store);
        store.close().unwrap();
    }
}

#[test]
fn commit_with_cancelled_context_fails_and_releases() {
    for backend in BACKENDS {
        let (_dir, store) = open_store(backend);
        let tm = store.transaction_manager();
        let (ctx, token) = Context::background().with_cancel();
        let parent = Parent::from_input(new_parent("Late"));

        let tx = tm.begin_tx(&ctx).unwrap();
        store.parents().create(&tx, &parent).unwrap();
        token.cancel();

        let err = tm.commit_tx(&tx).unwrap_err();
        assert_eq!(err.op, TxOp::Commit);
        assert!(matches!(
            err.cause,
            TxErrorCause::Context(ContextError::Cancelled)
        ));
        assert!(!exists(&store, &parent), "backend={backend}");
        assert_released(&store);
    }
}

#[test]
fn begin_on_expired_context_fails() {
    for backend in BACKENDS {
        let (_dir, store) = open_store(backend);
        let ctx = Context::background().with_timeout(Duration::ZERO);
        let err = store.transaction_manager().begin_tx(&ctx).unwrap_err();
        assert_eq!(err.op, TxOp::Begin);
        assert!(matches!(
            err.cause,
            TxErrorCause::Context(ContextError::DeadlineExceeded)
        ));
        assert_released(&store);
    }
}

#[test]
fn transaction_binding_is_ignored_by_other_stores() {
    for backend in BACKENDS {
        let (_dir_a, first) = open_store(backend);
        let (_dir_b, second) = open_store(backend);
        let parent = Parent::from_input(new_parent("Elsewhere"));

        let tm = first.transaction_manager();
        let tx = tm.begin_tx(&Context::background()).unwrap();
        assert!(!second.transaction_manager().has_active_tx(&tx));

        second.parents().create(&tx, &parent).unwrap();
        tm.rollback_tx(&tx).unwrap();

        assert!(exists(&second, &parent), "backend={backend}");
        assert_released(&first);
        assert_released(&second);
    }
}
