//! Tree-shaped cancellation scopes.
//!
//! Every suspending operation in eventide is bound to a [`Context`]. A
//! context becomes done exactly once, either because it was canceled or
//! because its timeout elapsed. Becoming done propagates to every
//! descendant but never to the parent.
//!
//! Parents reference their children weakly and children reference their
//! parent weakly, so a long-lived root never accumulates dropped scopes.
//! The done signal is broadcast through a `tokio::sync::watch` channel.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::error::Result;

/// Why a context became done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneCause {
    /// [`Context::cancel`] was called on the context or an ancestor.
    Canceled,
    /// The timeout of the context or an ancestor elapsed.
    TimedOut,
}

type DoneHandler = Box<dyn FnOnce(DoneCause) + Send>;

/// A cancellation scope, optionally the child of a parent scope and
/// optionally bounded by a timeout.
///
/// Cloning a `Context` yields another handle to the same scope.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

struct Inner {
    parent: Option<Weak<Inner>>,
    done: watch::Sender<Option<DoneCause>>,
    scope: Mutex<Scope>,
}

#[derive(Default)]
struct Scope {
    cause: Option<DoneCause>,
    handlers: Vec<DoneHandler>,
    children: Vec<Weak<Inner>>,
    timer: Option<AbortHandle>,
}

impl Context {
    /// Creates a root context that is only done when canceled.
    #[must_use]
    pub fn background() -> Self {
        Self::with_parent(None)
    }

    fn with_parent(parent: Option<Weak<Inner>>) -> Self {
        let (done, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                parent,
                done,
                scope: Mutex::new(Scope::default()),
            }),
        }
    }

    /// Creates a child scope. A child of a done context starts out done
    /// with the same cause.
    #[must_use]
    pub fn child(&self) -> Self {
        let child = Self::with_parent(Some(Arc::downgrade(&self.inner)));
        let inherited = {
            let mut scope = self.inner.lock();
            if scope.cause.is_none() {
                scope.children.retain(|c| c.strong_count() > 0);
                scope.children.push(Arc::downgrade(&child.inner));
            }
            scope.cause
        };
        if let Some(cause) = inherited {
            child.inner.finish(cause);
        }
        child
    }

    /// Creates a child scope that times out after `timeout`.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let child = self.child();
        let weak = Arc::downgrade(&child.inner);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.finish(DoneCause::TimedOut);
            }
        });

        let mut scope = child.inner.lock();
        if scope.cause.is_some() {
            timer.abort();
        } else {
            scope.timer = Some(timer.abort_handle());
        }
        drop(scope);
        child
    }

    /// Returns the parent scope, if it is still alive.
    #[must_use]
    pub fn parent(&self) -> Option<Context> {
        self.inner
            .parent
            .as_ref()?
            .upgrade()
            .map(|inner| Context { inner })
    }

    /// Marks the scope and all of its descendants done with
    /// [`DoneCause::Canceled`]. No-op if already done.
    pub fn cancel(&self) {
        self.inner.finish(DoneCause::Canceled);
    }

    /// Returns the cause if the scope is done.
    #[must_use]
    pub fn cause(&self) -> Option<DoneCause> {
        self.inner.lock().cause
    }

    /// Returns `true` once the scope is done.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.cause().is_some()
    }

    /// Fails immediately if the scope is done.
    ///
    /// # Errors
    ///
    /// Returns `Error::Canceled` or `Error::TimedOut` matching the cause.
    pub fn check(&self) -> Result<()> {
        match self.cause() {
            Some(cause) => Err(cause.into()),
            None => Ok(()),
        }
    }

    /// Resolves once the scope is done.
    pub async fn done(&self) -> DoneCause {
        let mut rx = self.inner.done.subscribe();
        let Ok(cause) = rx.wait_for(Option::is_some).await.map(|cause| *cause) else {
            // The sender lives in `inner`, which `self` keeps alive.
            return std::future::pending().await;
        };
        cause.unwrap_or(DoneCause::Canceled)
    }

    /// Races `operation` against the scope becoming done.
    ///
    /// The operation is dropped as soon as the scope is done, so anything it
    /// holds is released before the error surfaces.
    ///
    /// # Errors
    ///
    /// Returns the operation's own error, or `Error::Canceled` /
    /// `Error::TimedOut` if the scope finishes first.
    pub async fn run<T, F>(&self, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        tokio::select! {
            biased;
            cause = self.done() => Err(cause.into()),
            result = operation => result,
        }
    }

    /// Registers `handler` to run when the scope becomes done. Handlers run
    /// most-recently-registered first.
    ///
    /// # Errors
    ///
    /// If the scope is already done, `handler` runs immediately and the
    /// matching `Error::Canceled` / `Error::TimedOut` is returned.
    pub fn once_done<H>(&self, handler: H) -> Result<()>
    where
        H: FnOnce(DoneCause) + Send + 'static,
    {
        let mut scope = self.inner.lock();
        if let Some(cause) = scope.cause {
            drop(scope);
            handler(cause);
            return Err(cause.into());
        }
        scope.handlers.push(Box::new(handler));
        Ok(())
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Scope> {
        self.scope.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(&self, cause: DoneCause) {
        let (handlers, children) = {
            let mut scope = self.lock();
            if scope.cause.is_some() {
                return;
            }
            scope.cause = Some(cause);
            if let Some(timer) = scope.timer.take() {
                timer.abort();
            }
            (
                std::mem::take(&mut scope.handlers),
                std::mem::take(&mut scope.children),
            )
        };

        self.done.send_replace(Some(cause));

        // Inner scopes close before outer handlers run.
        for child in children.iter().filter_map(Weak::upgrade) {
            child.finish(cause);
        }
        for handler in handlers.into_iter().rev() {
            handler(cause);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let scope = self
            .scope
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = scope.timer.take() {
            timer.abort();
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("cause", &self.cause())
            .finish_non_exhaustive()
    }
}
