//! Call-scoped context: cancellation, deadline and transaction binding.
//!
//! # Responsibility
//! - Carry cancellation and deadline state through every repository call.
//! - Carry the active backend transaction handle so nested calls can join
//!   the caller's transaction without an extra parameter.
//!
//! # Invariants
//! - A `Context` is immutable; deriving a child never affects the parent.
//! - Cancelling a token cancels every token derived from it.
//! - A transaction binding is only visible to the store that created it.

use rusqlite::{Connection, InterruptHandle};
use std::any::Any;
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

/// Why a context stopped being usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextError {
    Cancelled,
    DeadlineExceeded,
}

impl Display for ContextError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => write!(f, "context canceled"),
            Self::DeadlineExceeded => write!(f, "context deadline exceeded"),
        }
    }
}

impl Error for ContextError {}

/// Shared cancellation flag.
///
/// Statements running on connections registered through [`Context::watch`]
/// are interrupted when the token is cancelled.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

struct CancelInner {
    cancelled: AtomicBool,
    next_key: AtomicU64,
    interrupts: Mutex<Vec<(u64, InterruptHandle)>>,
    children: Mutex<Vec<Weak<CancelInner>>>,
}

impl CancelToken {
    fn new() -> Self {
        Self {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                next_key: AtomicU64::new(0),
                interrupts: Mutex::new(Vec::new()),
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    fn child(&self) -> Self {
        let child = Self::new();
        {
            let mut children = self
                .inner
                .children
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            children.retain(|weak| weak.strong_count() > 0);
            children.push(Arc::downgrade(&child.inner));
        }
        // Registered before the check so a concurrent cancel is never missed.
        if self.is_cancelled() {
            child.cancel();
        }
        child
    }

    /// Cancels this token and all tokens derived from it.
    pub fn cancel(&self) {
        cancel_inner(&self.inner);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }
}

fn cancel_inner(inner: &Arc<CancelInner>) {
    if inner.cancelled.swap(true, Ordering::SeqCst) {
        return;
    }
    for (_, handle) in inner
        .interrupts
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
    {
        handle.interrupt();
    }
    let children: Vec<Arc<CancelInner>> = inner
        .children
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .filter_map(Weak::upgrade)
        .collect();
    for child in children {
        cancel_inner(&child);
    }
}

impl Debug for CancelToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Keeps a connection registered for interruption while a statement runs.
pub(crate) struct InterruptGuard {
    token: CancelToken,
    key: u64,
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        self.token
            .inner
            .interrupts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(key, _)| *key != self.key);
    }
}

/// Active transaction handle tagged with the store that owns it.
#[derive(Clone)]
pub(crate) struct TxBinding {
    owner: u64,
    handle: Arc<dyn Any + Send + Sync>,
}

/// Call-scoped context passed to every transaction and repository call.
#[derive(Clone)]
pub struct Context {
    cancel: CancelToken,
    deadline: Option<Instant>,
    tx: Option<TxBinding>,
}

impl Context {
    /// Root context: never cancelled by anyone else, no deadline, no
    /// transaction.
    pub fn background() -> Self {
        Self {
            cancel: CancelToken::new(),
            deadline: None,
            tx: None,
        }
    }

    /// Derives a context with its own cancel token.
    ///
    /// Cancelling the returned token affects only the derived context (and
    /// its descendants); cancelling `self` still propagates to it.
    pub fn with_cancel(&self) -> (Self, CancelToken) {
        let token = self.cancel.child();
        let ctx = Self {
            cancel: token.clone(),
            deadline: self.deadline,
            tx: self.tx.clone(),
        };
        (ctx, token)
    }

    /// Derives a context that expires after `timeout` (or earlier if the
    /// current deadline is sooner).
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        };
        Self {
            cancel: self.cancel.clone(),
            deadline: Some(deadline),
            tx: self.tx.clone(),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` when no deadline is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Returns the reason this context is done, if it is.
    pub fn err(&self) -> Option<ContextError> {
        if self.cancel.is_cancelled() {
            return Some(ContextError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn check(&self) -> Result<(), ContextError> {
        match self.err() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Registers `conn` so cancelling this context interrupts its running
    /// statement. Registration ends when the guard drops.
    pub(crate) fn watch(&self, conn: &Connection) -> InterruptGuard {
        let key = self.cancel.inner.next_key.fetch_add(1, Ordering::Relaxed);
        self.cancel
            .inner
            .interrupts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((key, conn.get_interrupt_handle()));
        InterruptGuard {
            token: self.cancel.clone(),
            key,
        }
    }

    pub(crate) fn with_tx_handle<T>(&self, owner: u64, handle: Arc<T>) -> Self
    where
        T: Any + Send + Sync,
    {
        Self {
            cancel: self.cancel.clone(),
            deadline: self.deadline,
            tx: Some(TxBinding { owner, handle }),
        }
    }

    /// Returns the bound transaction handle if it belongs to `owner` and has
    /// the expected backend type.
    pub(crate) fn tx_handle<T>(&self, owner: u64) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let binding = self.tx.as_ref()?;
        if binding.owner != owner {
            return None;
        }
        Arc::clone(&binding.handle).downcast::<T>().ok()
    }

    /// Whether any transaction handle is bound, regardless of owner.
    pub fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl Debug for Context {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("cancelled", &self.cancel.is_cancelled())
            .field("deadline", &self.deadline)
            .field("tx_owner", &self.tx.as_ref().map(|binding| binding.owner))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{Context, ContextError};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn background_is_never_done() {
        let ctx = Context::background();
        assert!(ctx.check().is_ok());
        assert!(ctx.deadline().is_none());
        assert!(!ctx.in_transaction());
    }

    #[test]
    fn cancelling_parent_cancels_derived_contexts() {
        let (parent, parent_token) = Context::background().with_cancel();
        let (child, _child_token) = parent.with_cancel();
        let grandchild = child.with_timeout(Duration::from_secs(60));

        parent_token.cancel();
        assert_eq!(child.err(), Some(ContextError::Cancelled));
        assert_eq!(grandchild.err(), Some(ContextError::Cancelled));
    }

    #[test]
    fn cancelling_child_leaves_parent_usable() {
        let (parent, _parent_token) = Context::background().with_cancel();
        let (child, child_token) = parent.with_cancel();

        child_token.cancel();
        assert!(child.is_done());
        assert!(parent.check().is_ok());
    }

    #[test]
    fn deriving_from_cancelled_context_starts_cancelled() {
        let (parent, token) = Context::background().with_cancel();
        token.cancel();
        let (child, _) = parent.with_cancel();
        assert_eq!(child.err(), Some(ContextError::Cancelled));
    }

    #[test]
    fn dropped_child_tokens_are_pruned_from_parent() {
        let root = Context::background();
        for _ in 0..1_000 {
            let (child, _token) = root.with_cancel();
            assert!(child.check().is_ok());
        }
        let (_live, _token) = root.with_cancel();
        let registered = root
            .cancel
            .inner
            .children
            .lock()
            .unwrap()
            .len();
        assert_eq!(registered, 1);
    }

    #[test]
    fn expired_deadline_reports_deadline_exceeded() {
        let ctx = Context::background().with_timeout(Duration::ZERO);
        assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
    }

    #[test]
    fn shorter_existing_deadline_wins() {
        let short = Context::background().with_timeout(Duration::from_millis(10));
        let derived = short.with_timeout(Duration::from_secs(3600));
        assert_eq!(derived.deadline(), short.deadline());
    }

    #[test]
    fn tx_handle_is_scoped_to_owner_and_type() {
        let ctx = Context::background().with_tx_handle(7, Arc::new(42_u32));
        assert_eq!(ctx.tx_handle::<u32>(7).as_deref(), Some(&42));
        assert!(ctx.tx_handle::<u32>(8).is_none());
        assert!(ctx.tx_handle::<String>(7).is_none());
        assert!(ctx.in_transaction());
    }
}
