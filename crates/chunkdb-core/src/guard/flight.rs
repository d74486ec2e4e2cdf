//! In-process single-flight map.
//!
//! The first caller for a key becomes the leader and does the work; later
//! callers for the same key block until the leader publishes. A leader that
//! goes away without publishing (panic, early return) abandons the flight and
//! followers start over.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::cancel::Cancellation;

/// Granularity at which blocked followers notice cancellation.
const CANCEL_POLL: Duration = Duration::from_millis(20);

enum FlightState<T> {
    Running,
    Done(T),
    Abandoned,
}

struct Flight<T> {
    state: Mutex<FlightState<T>>,
    ready: Condvar,
}

impl<T> Flight<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(FlightState::Running),
            ready: Condvar::new(),
        }
    }
}

pub(crate) struct FlightMap<K, T> {
    flights: Mutex<HashMap<K, Arc<Flight<T>>>>,
}

pub(crate) enum Join<'a, K: Eq + Hash, T> {
    Leader(LeaderTicket<'a, K, T>),
    Follower(Follower<T>),
}

pub(crate) struct LeaderTicket<'a, K: Eq + Hash, T> {
    map: &'a FlightMap<K, T>,
    key: K,
    flight: Arc<Flight<T>>,
    published: bool,
}

pub(crate) struct Follower<T> {
    flight: Arc<Flight<T>>,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum FlightWait<T> {
    Ready(T),
    Abandoned,
    TimedOut,
    Cancelled,
}

impl<K: Eq + Hash + Clone, T> FlightMap<K, T> {
    pub(crate) fn new() -> Self {
        Self {
            flights: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn join(&self, key: &K) -> Join<'_, K, T> {
        let mut flights = self.flights.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(flight) = flights.get(key) {
            return Join::Follower(Follower {
                flight: Arc::clone(flight),
            });
        }
        let flight = Arc::new(Flight::new());
        flights.insert(key.clone(), Arc::clone(&flight));
        Join::Leader(LeaderTicket {
            map: self,
            key: key.clone(),
            flight,
            published: false,
        })
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.flights
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl<K: Eq + Hash, T> FlightMap<K, T> {
    fn retire(&self, key: &K, flight: &Arc<Flight<T>>) {
        let mut flights = self.flights.lock().unwrap_or_else(PoisonError::into_inner);
        if flights
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, flight))
        {
            flights.remove(key);
        }
    }
}

impl<K: Eq + Hash, T> LeaderTicket<'_, K, T> {
    /// Hand `value` to every follower and retire the flight.
    pub(crate) fn complete(mut self, value: T) {
        self.publish(FlightState::Done(value));
    }

    fn publish(&mut self, outcome: FlightState<T>) {
        self.published = true;
        // Retire first so late joiners start a fresh flight instead of
        // observing this one.
        self.map.retire(&self.key, &self.flight);
        let mut state = self
            .flight
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *state = outcome;
        drop(state);
        self.flight.ready.notify_all();
    }
}

impl<K: Eq + Hash, T> Drop for LeaderTicket<'_, K, T> {
    fn drop(&mut self) {
        if !self.published {
            self.publish(FlightState::Abandoned);
        }
    }
}

impl<T: Clone> Follower<T> {
    /// Block until the leader publishes, `timeout` elapses, or `cancel` fires.
    pub(crate) fn wait(&self, timeout: Duration, cancel: &Cancellation) -> FlightWait<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self
            .flight
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            match &*state {
                FlightState::Done(value) => return FlightWait::Ready(value.clone()),
                FlightState::Abandoned => return FlightWait::Abandoned,
                FlightState::Running => {}
            }
            if cancel.is_cancelled() {
                return FlightWait::Cancelled;
            }
            let now = Instant::now();
            if now >= deadline {
                return FlightWait::TimedOut;
            }
            let slice = (deadline - now).min(CANCEL_POLL);
            state = self
                .flight
                .ready
                .wait_timeout(state, slice)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }
}
