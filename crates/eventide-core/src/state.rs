//! Lazily-loaded, copy-on-read / copy-on-write state.

use std::fmt;

use futures::future::BoxFuture;

use crate::error::{Error, Result};

/// Produces the initial value of a [`StateController`] on first access.
pub type StateLoader<'a, S> = Box<dyn FnOnce() -> BoxFuture<'a, Result<S>> + Send + 'a>;

type CopyFn<'a, S> = Box<dyn Fn(&S) -> S + Send + Sync + 'a>;

/// Wraps a fold state so that handlers never alias it.
///
/// The state is loaded at most once. Readers always receive a copy, and
/// updates run against a fresh copy that is only committed when the update
/// succeeds. How a state is copied is supplied by the owner.
pub struct StateController<'a, S> {
    state: Option<S>,
    loader: Option<StateLoader<'a, S>>,
    copy: CopyFn<'a, S>,
    updated: bool,
}

impl<'a, S> StateController<'a, S> {
    /// Creates a controller that loads its state on first access.
    pub fn new<L, C>(loader: L, copy: C) -> Self
    where
        L: FnOnce() -> BoxFuture<'a, Result<S>> + Send + 'a,
        C: Fn(&S) -> S + Send + Sync + 'a,
    {
        Self {
            state: None,
            loader: Some(Box::new(loader)),
            copy: Box::new(copy),
            updated: false,
        }
    }

    /// Creates a controller around an already-known state.
    pub fn loaded<C>(state: S, copy: C) -> Self
    where
        C: Fn(&S) -> S + Send + Sync + 'a,
    {
        Self {
            state: Some(state),
            loader: None,
            copy: Box::new(copy),
            updated: false,
        }
    }

    async fn ensure_loaded(&mut self) -> Result<()> {
        if self.state.is_none() {
            let loader = self
                .loader
                .take()
                .ok_or_else(|| Error::Usage("state loader already failed once".into()))?;
            self.state = Some(loader().await?);
        }
        Ok(())
    }

    fn current(&self) -> Result<&S> {
        self.state
            .as_ref()
            .ok_or_else(|| Error::Usage("state accessed before it was loaded".into()))
    }

    /// Returns the memoized state, loading it first if needed.
    ///
    /// # Errors
    ///
    /// Propagates the loader's error.
    pub async fn get_state(&mut self) -> Result<&S> {
        self.ensure_loaded().await?;
        self.current()
    }

    /// Returns a copy of the state.
    ///
    /// # Errors
    ///
    /// Propagates the loader's error.
    pub async fn read_state(&mut self) -> Result<S> {
        self.ensure_loaded().await?;
        Ok((self.copy)(self.current()?))
    }

    /// Replaces the state outright without loading it.
    pub fn set_state(&mut self, value: S) {
        self.loader = None;
        self.state = Some(value);
        self.updated = true;
    }

    /// Mutates a fresh copy of the state and commits it if `update` succeeds.
    ///
    /// # Errors
    ///
    /// Propagates loader errors and the error returned by `update`, in which
    /// case the state is left untouched.
    pub async fn update_state<F>(&mut self, update: F) -> Result<()>
    where
        F: FnOnce(&mut S) -> Result<()>,
    {
        self.ensure_loaded().await?;
        let mut draft = (self.copy)(self.current()?);
        update(&mut draft)?;
        self.state = Some(draft);
        self.updated = true;
        Ok(())
    }

    /// Passes a fresh copy of the state to `produce` and commits the value it
    /// returns.
    ///
    /// # Errors
    ///
    /// Propagates loader errors and the error returned by `produce`, in which
    /// case the state is left untouched.
    pub async fn replace_state<F>(&mut self, produce: F) -> Result<()>
    where
        F: FnOnce(S) -> Result<S>,
    {
        self.ensure_loaded().await?;
        let draft = (self.copy)(self.current()?);
        self.state = Some(produce(draft)?);
        self.updated = true;
        Ok(())
    }

    /// Whether any update has been committed.
    #[must_use]
    pub fn is_updated(&self) -> bool {
        self.updated
    }

    /// Consumes the controller, returning the state if it was updated.
    #[must_use]
    pub fn into_updated(self) -> Option<S> {
        if self.updated { self.state } else { None }
    }
}

impl<S: fmt::Debug> fmt::Debug for StateController<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateController")
            .field("state", &self.state)
            .field("loaded", &self.state.is_some())
            .field("updated", &self.updated)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::FutureExt;

    use super::*;

    fn counting_controller(loads: &Arc<AtomicUsize>) -> StateController<'static, Vec<i32>> {
        let loads = Arc::clone(loads);
        StateController::new(
            move || {
                async move {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok(vec![1, 2])
                }
                .boxed()
            },
            Vec::clone,
        )
    }

    #[tokio::test]
    async fn test_get_state_loads_once() {
        let loads = Arc::new(AtomicUsize::new(0));
        let mut controller = counting_controller(&loads);

        assert_eq!(controller.get_state().await.unwrap(), &vec![1, 2]);
        assert_eq!(controller.read_state().await.unwrap(), vec![1, 2]);

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(!controller.is_updated());
    }

    #[tokio::test]
    async fn test_read_state_returns_independent_copy() {
        let mut controller = StateController::loaded(vec![1], Vec::clone);

        let mut copy = controller.read_state().await.unwrap();
        copy.push(99);

        assert_eq!(controller.get_state().await.unwrap(), &vec![1]);
    }

    #[tokio::test]
    async fn test_update_state_commits_mutation() {
        let mut controller = StateController::loaded(vec![1], Vec::clone);

        controller
            .update_state(|state| {
                state.push(2);
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(controller.read_state().await.unwrap(), vec![1, 2]);
        assert!(controller.is_updated());
    }

    #[tokio::test]
    async fn test_replace_state_commits_returned_value() {
        let mut controller = StateController::loaded(vec![1], Vec::clone);

        controller.replace_state(|_| Ok(vec![7, 8])).await.unwrap();

        assert_eq!(controller.into_updated(), Some(vec![7, 8]));
    }

    #[tokio::test]
    async fn test_failed_update_commits_nothing() {
        // Arrange
        let mut controller = StateController::loaded(vec![1], Vec::clone);

        // Act
        let result = controller
            .update_state(|state| {
                state.clear();
                Err(Error::handler("rejected"))
            })
            .await;

        // Assert
        assert!(matches!(result, Err(Error::Handler(_))));
        assert_eq!(controller.read_state().await.unwrap(), vec![1]);
        assert!(!controller.is_updated());
        assert_eq!(controller.into_updated(), None);
    }

    #[tokio::test]
    async fn test_set_state_skips_loader() {
        let loads = Arc::new(AtomicUsize::new(0));
        let mut controller = counting_controller(&loads);

        controller.set_state(vec![5]);

        assert_eq!(controller.read_state().await.unwrap(), vec![5]);
        assert_eq!(loads.load(Ordering::SeqCst), 0);
        assert!(controller.is_updated());
    }

    #[tokio::test]
    async fn test_loader_error_propagates() {
        let mut controller: StateController<'_, Vec<i32>> = StateController::new(
            || async { Err(Error::Usage("no such row".into())) }.boxed(),
            Vec::clone,
        );

        let result = controller.get_state().await;

        assert!(matches!(result, Err(Error::Usage(_))));
    }
}
