//! Connection state machine shared by the stateful transports.

use std::{collections::VecDeque, fmt, sync::Arc};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

/// Connection state machine states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not connected.
    Disconnected,
    /// Attempting to connect.
    Connecting,
    /// Connection established, ready for traffic.
    Connected,
    /// Reconnecting after a disconnect.
    Reconnecting,
    /// Fully closed, will not reconnect.
    Closed,
}

impl ConnectionState {
    /// Check if the connection is ready for traffic.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if the connection is closed (terminal state).
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Callback invoked with `(old, new)` on every state change.
pub type StateCallback = Arc<dyn Fn(ConnectionState, ConnectionState) + Send + Sync>;

/// Observable connection state.
///
/// `Closed` is terminal: once entered, every further transition is refused.
/// Callbacks are append-only and run outside the state lock, in
/// registration order. Changes are delivered one at a time in the order they
/// were applied, possibly on the thread of a concurrent `transition`.
pub struct StateMachine {
    state: RwLock<ConnectionState>,
    callbacks: Mutex<Vec<StateCallback>>,
    delivery: Mutex<Delivery>,
}

/// Changes waiting for their callbacks.
#[derive(Default)]
struct Delivery {
    queue: VecDeque<(ConnectionState, ConnectionState)>,
    draining: bool,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(ConnectionState::Disconnected),
            callbacks: Mutex::new(Vec::new()),
            delivery: Mutex::new(Delivery::default()),
        }
    }

    /// Current state.
    pub fn get(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Move to `next`.
    ///
    /// Returns `false` when the machine is already `Closed` or already in
    /// `next`; no callback fires in that case.
    pub fn transition(&self, next: ConnectionState) -> bool {
        let previous = {
            let mut state = self.state.write();
            if state.is_closed() || *state == next {
                return false;
            }
            let previous = std::mem::replace(&mut *state, next);
            // queued under the state lock so delivery order matches apply order
            self.delivery.lock().queue.push_back((previous, next));
            previous
        };

        debug!(from = %previous, to = %next, "connection state changed");
        self.deliver();
        true
    }

    /// Move to `Closed`. Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        self.transition(ConnectionState::Closed)
    }

    /// Register a change callback.
    pub fn on_change(&self, callback: StateCallback) {
        self.callbacks.lock().push(callback);
    }

    /// Drain queued changes unless another caller is already draining.
    fn deliver(&self) {
        {
            let mut delivery = self.delivery.lock();
            if delivery.draining {
                return;
            }
            delivery.draining = true;
        }

        loop {
            let (previous, next) = {
                let mut delivery = self.delivery.lock();
                match delivery.queue.pop_front() {
                    Some(change) => change,
                    None => {
                        delivery.draining = false;
                        return;
                    }
                }
            };
            let callbacks: Vec<StateCallback> = self.callbacks.lock().clone();
            for callback in callbacks {
                callback(previous, next);
            }
        }
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("state", &self.get())
            .field("callbacks", &self.callbacks.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(machine: &StateMachine) -> Arc<Mutex<Vec<(ConnectionState, ConnectionState)>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        machine.on_change(Arc::new(move |old, new| sink.lock().push((old, new))));
        seen
    }

    #[test]
    fn starts_disconnected() {
        assert_eq!(StateMachine::new().get(), ConnectionState::Disconnected);
    }

    #[test]
    fn transitions_notify_callbacks() {
        let machine = StateMachine::new();
        let seen = recorder(&machine);

        assert!(machine.transition(ConnectionState::Connecting));
        assert!(machine.transition(ConnectionState::Connected));
        assert!(machine.transition(ConnectionState::Reconnecting));
        assert!(machine.transition(ConnectionState::Connected));

        assert_eq!(
            *seen.lock(),
            vec![
                (ConnectionState::Disconnected, ConnectionState::Connecting),
                (ConnectionState::Connecting, ConnectionState::Connected),
                (ConnectionState::Connected, ConnectionState::Reconnecting),
                (ConnectionState::Reconnecting, ConnectionState::Connected),
            ]
        );
    }

    #[test]
    fn concurrent_transitions_are_reported_in_order() {
        let machine = Arc::new(StateMachine::new());
        let seen = recorder(&machine);

        let workers: Vec<_> = (0..4)
            .map(|worker| {
                let machine = Arc::clone(&machine);
                std::thread::spawn(move || {
                    for i in 0..500 {
                        let next = match (worker + i) % 3 {
                            0 => ConnectionState::Connecting,
                            1 => ConnectionState::Connected,
                            _ => ConnectionState::Reconnecting,
                        };
                        machine.transition(next);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let seen = seen.lock().clone();
        assert!(!seen.is_empty());
        let mut current = ConnectionState::Disconnected;
        for (old, new) in &seen {
            assert_eq!(*old, current);
            assert_ne!(old, new);
            current = *new;
        }
        assert_eq!(current, machine.get());
    }

    #[test]
    fn callback_may_transition_again() {
        let machine = Arc::new(StateMachine::new());
        let inner = Arc::downgrade(&machine);
        machine.on_change(Arc::new(move |_, new| {
            if new == ConnectionState::Connecting
                && let Some(machine) = inner.upgrade()
            {
                machine.transition(ConnectionState::Connected);
            }
        }));
        let seen = recorder(&machine);

        assert!(machine.transition(ConnectionState::Connecting));
        assert_eq!(machine.get(), ConnectionState::Connected);
        assert_eq!(
            *seen.lock(),
            vec![
                (ConnectionState::Disconnected, ConnectionState::Connecting),
                (ConnectionState::Connecting, ConnectionState::Connected),
            ]
        );
    }

    #[test]
    fn same_state_is_not_a_transition() {
        let machine = StateMachine::new();
        let seen = recorder(&machine);
        assert!(!machine.transition(ConnectionState::Disconnected));
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn closed_is_terminal_from_any_state() {
        for start in [
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Reconnecting,
        ] {
            let machine = StateMachine::new();
            machine.transition(start);
            let seen = recorder(&machine);

            assert!(machine.close());
            assert_eq!(machine.get(), ConnectionState::Closed);
            assert!(!machine.close());
            assert!(!machine.transition(ConnectionState::Connecting));
            assert!(!machine.transition(ConnectionState::Connected));
            assert_eq!(machine.get(), ConnectionState::Closed);
            assert_eq!(seen.lock().len(), 1);
        }
    }
}
