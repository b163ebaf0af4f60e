// =============================================================================
// Pub/Sub — synchronous, ordered fan-out to registered observers
// =============================================================================
//
// Observers run on the publisher's task, in subscription order. A failing or
// panicking observer is logged and skipped; the rest still receive the event.
// =============================================================================

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{error, warn};
use uuid::Uuid;

/// Callback invoked for every published event.
pub type Observer<E> = Arc<dyn Fn(&E) -> anyhow::Result<()> + Send + Sync>;

/// Wrap a closure as an [`Observer`].
pub fn observer<E, F>(f: F) -> Observer<E>
where
    F: Fn(&E) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Handle returned by [`PubSub::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

pub struct PubSub<E> {
    observers: RwLock<Vec<(SubscriptionId, Observer<E>)>>,
}

impl<E> PubSub<E> {
    pub fn new() -> Self {
        Self {
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Register an observer. The same callback may be registered more than
    /// once and is then invoked once per registration.
    pub fn subscribe(&self, observer: Observer<E>) -> SubscriptionId {
        let id = SubscriptionId(Uuid::new_v4());
        self.observers.write().push((id, observer));
        id
    }

    /// Remove a registration. Returns `false` if `id` was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(sid, _)| *sid != id);
        observers.len() != before
    }

    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    /// Deliver `event` to every observer and return how many accepted it.
    ///
    /// The observer list is copied first, so callbacks may subscribe or
    /// unsubscribe without deadlocking.
    pub fn publish(&self, event: &E) -> usize {
        let observers = self.observers.read().clone();
        let mut delivered = 0;

        for (id, observer) in observers {
            match catch_unwind(AssertUnwindSafe(|| observer(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => warn!(subscription = %id, error = %e, "observer failed"),
                Err(_) => error!(subscription = %id, "observer panicked"),
            }
        }

        delivered
    }
}

impl<E> Default for PubSub<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn delivers_in_subscription_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let bus: PubSub<u32> = PubSub::new();

        for tag in ["a", "b", "c"] {
            let seen = seen.clone();
            bus.subscribe(observer(move |e: &u32| {
                seen.lock().push(format!("{tag}{e}"));
                Ok(())
            }));
        }

        assert_eq!(bus.publish(&1), 3);
        assert_eq!(*seen.lock(), vec!["a1", "b1", "c1"]);
    }

    #[test]
    fn duplicate_subscription_fires_twice() {
        let count = Arc::new(Mutex::new(0));
        let bus: PubSub<()> = PubSub::new();
        let c = count.clone();
        let counter: Observer<()> = observer(move |_| {
            *c.lock() += 1;
            Ok(())
        });

        bus.subscribe(counter.clone());
        bus.subscribe(counter);
        bus.publish(&());
        assert_eq!(*count.lock(), 2);
    }

    #[test]
    fn failing_and_panicking_observers_are_isolated() {
        let reached = Arc::new(Mutex::new(false));
        let bus: PubSub<()> = PubSub::new();

        bus.subscribe(observer(|_| anyhow::bail!("nope")));
        bus.subscribe(observer(|_| panic!("observer blew up")));
        let r = reached.clone();
        bus.subscribe(observer(move |_| {
            *r.lock() = true;
            Ok(())
        }));

        assert_eq!(bus.publish(&()), 1);
        assert!(*reached.lock());
    }

    #[test]
    fn unsubscribe_removes_only_that_registration() {
        let bus: PubSub<()> = PubSub::new();
        let a = bus.subscribe(observer(|_| Ok(())));
        let _b = bus.subscribe(observer(|_| Ok(())));

        assert!(bus.unsubscribe(a));
        assert!(!bus.unsubscribe(a));
        assert_eq!(bus.len(), 1);
        assert_eq!(bus.publish(&()), 1);
    }
}
