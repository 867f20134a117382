//! Typed notifications published by a [`Media`](super::Media).

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use super::stream::Stream;
use crate::pipeline::State;

/// Something observable happened to a media.
#[derive(Debug, Clone)]
pub enum MediaEvent {
    /// A stream handle was created, statically or from a dynamic producer.
    NewStream(Arc<Stream>),
    /// Preparation finished successfully.
    Prepared,
    /// The media was torn down.
    Unprepared,
    /// A client requested a different delivery state.
    NewState(State),
}

impl MediaEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::NewStream(_) => "new-stream",
            Self::Prepared => "prepared",
            Self::Unprepared => "unprepared",
            Self::NewState(_) => "new-state",
        }
    }
}

/// Handle returned by [`Observers::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Returns `false` once it wants no further events.
type Observer = Arc<dyn Fn(&MediaEvent) -> bool + Send + Sync>;

#[derive(Default)]
pub(crate) struct Observers {
    next: AtomicU64,
    list: RwLock<Vec<(SubscriptionId, Observer)>>,
}

impl Observers {
    pub(crate) fn subscribe<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&MediaEvent) + Send + Sync + 'static,
    {
        self.subscribe_while(move |event| {
            observer(event);
            true
        })
    }

    /// Subscribe until `observer` returns `false`; it is dropped after that
    /// call.
    pub(crate) fn subscribe_while<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&MediaEvent) -> bool + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next.fetch_add(1, Ordering::Relaxed));
        self.list.write().push((id, Arc::new(observer)));
        id
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut list = self.list.write();
        let before = list.len();
        list.retain(|(sub, _)| *sub != id);
        list.len() != before
    }

    /// Observers run on the emitting thread, outside the list lock.
    pub(crate) fn emit(&self, event: &MediaEvent) {
        let observers: Vec<(SubscriptionId, Observer)> = self.list.read().clone();
        tracing::trace!(event = event.name(), observers = observers.len(), "emit");

        let finished: Vec<SubscriptionId> = observers
            .into_iter()
            .filter_map(|(id, observer)| (!observer(event)).then_some(id))
            .collect();
        if !finished.is_empty() {
            self.list.write().retain(|(id, _)| !finished.contains(id));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.list.read().len()
    }
}

impl fmt::Debug for Observers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers")
            .field("count", &self.list.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn unsubscribed_observers_stop_receiving() {
        let observers = Observers::default();
        let count = Arc::new(AtomicUsize::new(0));
        let id = {
            let count = count.clone();
            observers.subscribe(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };

        observers.emit(&MediaEvent::Prepared);
        assert!(observers.unsubscribe(id));
        assert!(!observers.unsubscribe(id));
        observers.emit(&MediaEvent::Unprepared);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn observer_may_subscribe_while_emitting() {
        let observers = Arc::new(Observers::default());
        let inner = observers.clone();
        observers.subscribe(move |_| {
            inner.subscribe(|_| {});
        });
        observers.emit(&MediaEvent::Prepared);
        assert_eq!(observers.len(), 2);
    }

    #[test]
    fn finished_observers_are_dropped() {
        let observers = Observers::default();
        let count = Arc::new(AtomicUsize::new(0));
        {
            let count = count.clone();
            observers.subscribe_while(move |_| count.fetch_add(1, Ordering::SeqCst) == 0);
        }
        observers.subscribe(|_| {});

        observers.emit(&MediaEvent::Prepared);
        assert_eq!(observers.len(), 2);
        observers.emit(&MediaEvent::Unprepared);
        assert_eq!(observers.len(), 1);
        observers.emit(&MediaEvent::Prepared);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
