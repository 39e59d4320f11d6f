//! Scoped execution contexts for units of work.
//!
//! An [`ExecutionContext`] captures a unit of work's correlation id, its
//! headers, and the ordered list of events raised by domain logic while the
//! scope is open. Opening a context pushes it onto a thread-local stack so
//! synchronous domain code can reach it ambiently via
//! [`ExecutionContext::current`]; closing pops it and restores the previous
//! context, supporting legitimate nesting (a sub-aggregate created during
//! another aggregate's command).
//!
//! The scope is strictly single-threaded: it must be closed on the thread
//! that opened it, innermost first. The collected data (correlation id,
//! headers, raised events) remains readable through the guard after close;
//! closing only ends ambient visibility.

use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::ThreadId;

use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use crate::commit::EventData;
use crate::error::ContextError;
use crate::headers::Headers;

thread_local! {
    /// Innermost-last stack of open contexts for the current thread.
    static ACTIVE: RefCell<Vec<Arc<ContextInner>>> = const { RefCell::new(Vec::new()) };
}

/// State shared between the owning scope guard and ambient handles.
struct ContextInner {
    correlation_id: Uuid,
    headers: Headers,
    raised: Mutex<Vec<EventData>>,
    owner: ThreadId,
    closed: AtomicBool,
}

impl ContextInner {
    fn raise(&self, event: EventData) {
        self.raised.lock().push(event);
    }
}

/// The owning scope guard for a unit of work.
///
/// Created by [`open`](ExecutionContext::open), which registers the context
/// as the current one for this thread. Not cloneable: exactly one owner
/// closes the scope. Dropping the guard closes it best-effort, logging
/// instead of panicking if the discipline was violated.
pub struct ExecutionContext {
    inner: Arc<ContextInner>,
}

/// A read-and-raise handle to the innermost open context.
///
/// Returned by [`ExecutionContext::current`]. Cheap to clone; cannot close
/// the scope it points at.
#[derive(Clone)]
pub struct AmbientContext {
    inner: Arc<ContextInner>,
}

impl ExecutionContext {
    /// Open a context with a freshly generated correlation id.
    pub fn open(headers: Headers) -> Self {
        Self::open_with_correlation(Uuid::new_v4(), headers)
    }

    /// Open a context continuing an existing correlation.
    ///
    /// The new context becomes the current one for this thread; the
    /// previously current context (if any) is restored when this one
    /// closes.
    pub fn open_with_correlation(correlation_id: Uuid, headers: Headers) -> Self {
        let inner = Arc::new(ContextInner {
            correlation_id,
            headers,
            raised: Mutex::new(Vec::new()),
            owner: std::thread::current().id(),
            closed: AtomicBool::new(false),
        });
        ACTIVE.with(|stack| stack.borrow_mut().push(inner.clone()));
        Self { inner }
    }

    /// The innermost open context on the current thread.
    ///
    /// # Errors
    ///
    /// [`ContextError::NoActiveContext`] when no context is open. Needing a
    /// context and not having one is a usage error in the caller.
    pub fn current() -> Result<AmbientContext, ContextError> {
        ACTIVE
            .with(|stack| stack.borrow().last().cloned())
            .map(|inner| AmbientContext { inner })
            .ok_or(ContextError::NoActiveContext)
    }

    /// Correlation id of this unit of work.
    pub fn correlation_id(&self) -> Uuid {
        self.inner.correlation_id
    }

    /// Headers captured when the context was opened.
    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    /// Record an event raised by domain logic.
    pub fn raise(&self, event: EventData) {
        self.inner.raise(event);
    }

    /// Convenience wrapper building the [`EventData`] in place.
    pub fn raise_event(&self, event_type: impl Into<String>, payload: Value) {
        self.raise(EventData::new(event_type, payload));
    }

    /// Snapshot of the events raised so far, in raise order.
    pub fn raised(&self) -> Vec<EventData> {
        self.inner.raised.lock().clone()
    }

    /// True when no events have been raised.
    pub fn is_empty(&self) -> bool {
        self.inner.raised.lock().is_empty()
    }

    /// Forget the raised events after they have been committed.
    pub(crate) fn clear_raised(&self) {
        self.inner.raised.lock().clear();
    }

    /// Close the scope, restoring the previously current context.
    ///
    /// Idempotent: closing an already-closed context is a no-op. The
    /// collected data remains readable through the guard afterwards.
    ///
    /// # Errors
    ///
    /// * [`ContextError::ThreadViolation`] - closed from a thread other
    ///   than the one that opened it.
    /// * [`ContextError::OrderViolation`] - closed while an inner context
    ///   opened after it is still open.
    pub fn close(&self) -> Result<(), ContextError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        if std::thread::current().id() != self.inner.owner {
            return Err(ContextError::ThreadViolation);
        }
        ACTIVE.with(|stack| {
            let mut stack = stack.borrow_mut();
            match stack.last() {
                Some(top) if Arc::ptr_eq(top, &self.inner) => {
                    stack.pop();
                    Ok(())
                }
                _ => Err(ContextError::OrderViolation),
            }
        })?;
        self.inner.closed.store(true, Ordering::Release);
        Ok(())
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        // A violation in drop cannot be surfaced to the caller; log it so
        // the leak is visible in diagnostics.
        if let Err(e) = self.close() {
            tracing::error!(
                error = %e,
                correlation_id = %self.inner.correlation_id,
                "execution context dropped out of discipline"
            );
        }
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("correlation_id", &self.inner.correlation_id)
            .field("raised", &self.inner.raised.lock().len())
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl AmbientContext {
    /// Correlation id of the unit of work this handle belongs to.
    pub fn correlation_id(&self) -> Uuid {
        self.inner.correlation_id
    }

    /// Headers captured when the context was opened.
    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    /// Record an event raised by domain logic.
    pub fn raise(&self, event: EventData) {
        self.inner.raise(event);
    }

    /// Convenience wrapper building the [`EventData`] in place.
    pub fn raise_event(&self, event_type: impl Into<String>, payload: Value) {
        self.raise(EventData::new(event_type, payload));
    }
}
