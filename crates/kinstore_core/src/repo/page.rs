//! Concurrent fetch + count for paginated lists.
//!
//! # Responsibility
//! - Run the filtered fetch and the filtered count on two workers.
//! - Cancel the surviving worker as soon as one of them fails.
//!
//! # Invariants
//! - Each worker reports through its own single-slot channel.
//! - Inside a transaction both reads run sequentially on the
//!   transaction's connection; handles are never shared across threads.
//! - Fetch and count are separate reads, so `has_next` may be stale under
//!   concurrent writes.

use super::query::{PagedResult, Pagination};
use super::{RepoError, RepoResult};
use crate::context::Context;
use log::debug;
use std::sync::mpsc;
use std::thread;

/// Fetches one page and the total count, then derives page metadata.
pub fn fetch_page<T, F, C>(
    ctx: &Context,
    pagination: Pagination,
    fetch: F,
    count: C,
) -> RepoResult<(Vec<T>, PagedResult)>
where
    T: Send,
    F: FnOnce(&Context) -> RepoResult<Vec<T>> + Send,
    C: FnOnce(&Context) -> RepoResult<i64> + Send,
{
    ctx.check()?;
    let (items, total) = if ctx.in_transaction() {
        let items = fetch(ctx)?;
        let total = count(ctx)?;
        (items, total)
    } else {
        fan_out(ctx, fetch, count)?
    };
    let paged = PagedResult::new(pagination, items.len(), total);
    Ok((items, paged))
}

fn fan_out<T, F, C>(ctx: &Context, fetch: F, count: C) -> RepoResult<(Vec<T>, i64)>
where
    T: Send,
    F: FnOnce(&Context) -> RepoResult<Vec<T>> + Send,
    C: FnOnce(&Context) -> RepoResult<i64> + Send,
{
    let (scope_ctx, token) = ctx.with_cancel();
    let scope_ctx = &scope_ctx;

    thread::scope(|scope| {
        let (items_tx, items_rx) = mpsc::sync_channel(1);
        let (count_tx, count_rx) = mpsc::sync_channel(1);

        let fetch_token = token.clone();
        scope.spawn(move || {
            let result = fetch(scope_ctx);
            if result.is_err() {
                fetch_token.cancel();
            }
            let _ = items_tx.send(result);
        });

        let count_token = token.clone();
        scope.spawn(move || {
            let result = count(scope_ctx);
            if result.is_err() {
                count_token.cancel();
            }
            let _ = count_tx.send(result);
        });

        let items = items_rx.recv().unwrap_or_else(|_| Err(worker_gone("fetch")));
        let total = count_rx.recv().unwrap_or_else(|_| Err(worker_gone("count")));

        match (items, total) {
            (Ok(items), Ok(total)) => Ok((items, total)),
            (Err(err), Ok(_)) | (Ok(_), Err(err)) => Err(err),
            (Err(fetch_err), Err(count_err)) => {
                debug!("event=list_fan_out module=repo status=error both_failed=true");
                Err(primary_failure(fetch_err, count_err))
            }
        }
    })
}

/// When both workers fail, the one that did not fail from cancellation is
/// the one that triggered it.
fn primary_failure(fetch_err: RepoError, count_err: RepoError) -> RepoError {
    let fetch_cancelled = matches!(fetch_err, RepoError::Cancelled(_));
    let count_cancelled = matches!(count_err, RepoError::Cancelled(_));
    if fetch_cancelled && !count_cancelled {
        count_err
    } else {
        fetch_err
    }
}

fn worker_gone(worker: &str) -> RepoError {
    RepoError::InvalidData(format!("{worker} worker exited without reporting"))
}

#[cfg(test)]
mod tests {
    use super::fetch_page;
    use crate::context::{Context, ContextError};
    use crate::model::EntityKind;
    use crate::repo::query::Pagination;
    use crate::repo::RepoError;
    use std::time::{Duration, Instant};
    use uuid::Uuid;

    #[test]
    fn joins_fetch_and_count() {
        let (items, paged) = fetch_page(
            &Context::background(),
            Pagination::new(1, 2),
            |_| Ok(vec![1, 2]),
            |_| Ok(5),
        )
        .unwrap();
        assert_eq!(items, vec![1, 2]);
        assert_eq!(paged.total_count, 5);
        assert!(paged.has_next);
    }

    #[test]
    fn count_failure_cancels_fetch() {
        let started = Instant::now();
        let err = fetch_page::<i32, _, _>(
            &Context::background(),
            Pagination::default(),
            |ctx| {
                while ctx.check().is_ok() {
                    if started.elapsed() > Duration::from_secs(5) {
                        return Ok(Vec::new());
                    }
                    std::thread::sleep(Duration::from_millis(2));
                }
                Err(RepoError::Cancelled(ContextError::Cancelled))
            },
            |_| {
                Err(RepoError::NotFound {
                    entity: EntityKind::Parent,
                    id: Uuid::nil(),
                })
            },
        )
        .unwrap_err();

        assert!(matches!(err, RepoError::NotFound { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn cancelled_caller_context_fails_fast() {
        let (ctx, token) = Context::background().with_cancel();
        token.cancel();
        let err = fetch_page::<i32, _, _>(&ctx, Pagination::default(), |_| Ok(Vec::new()), |_| Ok(0))
            .unwrap_err();
        assert!(matches!(err, RepoError::Cancelled(ContextError::Cancelled)));
    }
}
