/// Deferred, replayable builders
///
/// A [`Fluent`] records a list of mutations instead of applying them. Every
/// `push` returns a new builder, leaving the original untouched, and
/// [`Fluent::materialize`] replays the whole list on a freshly made value
/// (or on a clone of the forced value). [`MaybeFluent`] lets configuration
/// fields accept either a finished value or such a builder.

use crate::error::Result;
pub use futures::future::BoxFuture;
use futures::future::{ready, FutureExt};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

type Action<T> = Arc<dyn Fn(T) -> BoxFuture<'static, Result<T>> + Send + Sync>;
type Maker<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T>> + Send + Sync>;

pub struct Fluent<T> {
    make: Maker<T>,
    actions: Vec<Action<T>>,
    forced: Option<T>,
}

impl<T: Clone> Clone for Fluent<T> {
    fn clone(&self) -> Self {
        Self {
            make: Arc::clone(&self.make),
            actions: self.actions.clone(),
            forced: self.forced.clone(),
        }
    }
}

impl<T> fmt::Debug for Fluent<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fluent")
            .field("actions", &self.actions.len())
            .field("forced", &self.forced.is_some())
            .finish()
    }
}

impl<T: Clone + Send + 'static> Fluent<T> {
    /// Builder whose starting value comes from `make`
    pub fn new<F, Fut>(make: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            make: Arc::new(move || make().boxed()),
            actions: Vec::new(),
            forced: None,
        }
    }

    /// Builder starting from `T::default()`
    pub fn from_default() -> Self
    where
        T: Default,
    {
        Self::new(|| ready(Ok(T::default())))
    }

    /// Builder starting from a pre-built value instead of a fresh one
    pub fn forced(self, value: T) -> Self {
        Self {
            forced: Some(value),
            ..self
        }
    }

    /// Record an asynchronous mutation
    pub fn push<F, Fut>(&self, action: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let mut actions = self.actions.clone();
        actions.push(Arc::new(move |value| action(value).boxed()));
        Self {
            make: Arc::clone(&self.make),
            actions,
            forced: self.forced.clone(),
        }
    }

    /// Record an in-place mutation
    pub fn update<F>(&self, mutate: F) -> Self
    where
        F: Fn(&mut T) + Send + Sync + 'static,
    {
        self.push(move |mut value| {
            mutate(&mut value);
            ready(Ok(value))
        })
    }

    /// Record a fallible in-place mutation
    pub fn try_update<F>(&self, mutate: F) -> Self
    where
        F: Fn(&mut T) -> Result<()> + Send + Sync + 'static,
    {
        self.push(move |mut value| ready(mutate(&mut value).map(|()| value)))
    }

    /// Number of recorded mutations
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Build the value by replaying every recorded mutation in order
    pub async fn materialize(&self) -> Result<T> {
        let mut value = match &self.forced {
            Some(forced) => forced.clone(),
            None => (self.make)().await?,
        };
        for action in &self.actions {
            value = action(value).await?;
        }
        Ok(value)
    }
}

/// Either a finished value or a builder producing one
#[derive(Clone)]
pub enum MaybeFluent<T> {
    Value(T),
    Builder(Fluent<T>),
}

impl<T: Clone + Send + 'static> MaybeFluent<T> {
    pub async fn resolve(self) -> Result<T> {
        match self {
            MaybeFluent::Value(value) => Ok(value),
            MaybeFluent::Builder(builder) => builder.materialize().await,
        }
    }

    /// Apply `mutate` now to a value, or record it on a builder
    pub fn update<F>(self, mutate: F) -> Self
    where
        F: Fn(&mut T) + Send + Sync + 'static,
    {
        match self {
            MaybeFluent::Value(mut value) => {
                mutate(&mut value);
                MaybeFluent::Value(value)
            }
            MaybeFluent::Builder(builder) => MaybeFluent::Builder(builder.update(mutate)),
        }
    }
}

impl<T> From<Fluent<T>> for MaybeFluent<T> {
    fn from(builder: Fluent<T>) -> Self {
        MaybeFluent::Builder(builder)
    }
}

impl<T> fmt::Debug for MaybeFluent<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaybeFluent::Value(_) => f.write_str("MaybeFluent::Value(..)"),
            MaybeFluent::Builder(builder) => write!(f, "MaybeFluent::Builder({:?})", builder),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VeilPortError;

    #[tokio::test]
    async fn actions_replay_in_order() {
        let builder = Fluent::<Vec<u32>>::from_default()
            .update(|v| v.push(1))
            .update(|v| v.push(2))
            .push(|mut v| async move {
                v.push(3);
                Ok(v)
            });

        assert_eq!(builder.len(), 3);
        assert_eq!(builder.materialize().await.unwrap(), vec![1, 2, 3]);
        // Replaying gives the same result
        assert_eq!(builder.materialize().await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn push_leaves_original_untouched() {
        let base = Fluent::<Vec<u32>>::from_default().update(|v| v.push(1));
        let extended = base.update(|v| v.push(2));

        assert_eq!(base.materialize().await.unwrap(), vec![1]);
        assert_eq!(extended.materialize().await.unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn forced_value_replaces_default() {
        let builder = Fluent::<String>::from_default()
            .forced("base".to_string())
            .update(|s| s.push_str("-x"));
        assert_eq!(builder.materialize().await.unwrap(), "base-x");
    }

    #[tokio::test]
    async fn failing_action_stops_materialize() {
        let builder = Fluent::<u32>::from_default()
            .try_update(|_| Err(VeilPortError::validation("nope")))
            .update(|v| *v += 1);
        assert!(matches!(
            builder.materialize().await,
            Err(VeilPortError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn maybe_fluent_resolves_both_forms() {
        let value = MaybeFluent::Value(7u32);
        assert_eq!(value.resolve().await.unwrap(), 7);

        let built: MaybeFluent<u32> = Fluent::<u32>::new(|| async { Ok(40) })
            .update(|v| *v += 2)
            .into();
        assert_eq!(built.resolve().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn maybe_fluent_update_applies_to_both_forms() {
        let value = MaybeFluent::Value(1u32).update(|v| *v *= 10);
        assert_eq!(value.resolve().await.unwrap(), 10);

        let builder = MaybeFluent::Builder(Fluent::<u32>::from_default()).update(|v| *v += 3);
        assert_eq!(builder.resolve().await.unwrap(), 3);
    }
}
