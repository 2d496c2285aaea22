//! Signal and connection bookkeeping.

use indexmap::IndexMap;
use parking_lot::Mutex;

/// Identifier of a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SignalId(pub u64);

/// Handle of one connection to a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    /// Signal the connection belongs to.
    pub signal: SignalId,

    /// Position of the connection in the signal's list.
    pub index: usize,
}

#[derive(Debug)]
struct Connection<Callback> {
    callback: Callback,
    connected: bool,
}

#[derive(Debug)]
struct Signal<Callback> {
    name: String,
    connections: Vec<Connection<Callback>>,
}

/// Named signals with ordered connections.
///
/// Disconnecting only clears a flag; the connection list of a signal never
/// shrinks until the signal is destroyed, so indices stay valid while a
/// signal fires.
#[derive(Debug)]
pub struct SignalBus<Callback> {
    signals: IndexMap<SignalId, Signal<Callback>>,
    next_id: u64,
}

impl<Callback> Default for SignalBus<Callback> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Callback> SignalBus<Callback> {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self {
            signals: IndexMap::new(),
            next_id: 1,
        }
    }

    /// Creates a signal.
    pub fn create(&mut self, name: impl Into<String>) -> SignalId {
        let id = SignalId(self.next_id);
        self.next_id += 1;

        self.signals.insert(
            id,
            Signal {
                name: name.into(),
                connections: Vec::new(),
            },
        );

        id
    }

    /// Returns the name of a signal.
    pub fn name(&self, id: SignalId) -> Option<&str> {
        self.signals.get(&id).map(|signal| signal.name.as_str())
    }

    /// Checks whether a signal exists.
    pub fn contains(&self, id: SignalId) -> bool {
        self.signals.contains_key(&id)
    }

    /// Returns the number of signals.
    pub fn len(&self) -> usize {
        self.signals.len()
    }

    /// Checks whether there are no signals.
    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    /// Connects a callback, or returns `None` if the signal was destroyed.
    pub fn connect(&mut self, id: SignalId, callback: Callback) -> Option<ConnectionHandle> {
        let signal = self.signals.get_mut(&id)?;
        signal.connections.push(Connection {
            callback,
            connected: true,
        });

        Some(ConnectionHandle {
            signal: id,
            index: signal.connections.len() - 1,
        })
    }

    /// Disconnects a connection.
    ///
    /// Returns `false` if it was already disconnected.
    pub fn disconnect(&mut self, handle: ConnectionHandle) -> bool {
        match self.connection_mut(handle) {
            Some(connection) if connection.connected => {
                connection.connected = false;
                true
            }
            _ => false,
        }
    }

    /// Checks whether a connection is still connected.
    pub fn is_connected(&self, handle: ConnectionHandle) -> bool {
        self.signals
            .get(&handle.signal)
            .and_then(|signal| signal.connections.get(handle.index))
            .is_some_and(|connection| connection.connected)
    }

    /// Returns the number of connections ever made to a signal.
    pub fn connection_count(&self, id: SignalId) -> usize {
        self.signals
            .get(&id)
            .map_or(0, |signal| signal.connections.len())
    }

    /// Removes a signal and releases its callbacks.
    pub fn destroy(&mut self, id: SignalId) -> bool {
        self.signals.shift_remove(&id).is_some()
    }

    /// Removes every signal.
    pub fn clear(&mut self) {
        self.signals.clear();
    }

    fn connection_mut(&mut self, handle: ConnectionHandle) -> Option<&mut Connection<Callback>> {
        self.signals
            .get_mut(&handle.signal)?
            .connections
            .get_mut(handle.index)
    }
}

impl<Callback> SignalBus<Callback>
where
    Callback: Clone,
{
    fn live_callback(&self, id: SignalId, index: usize) -> Option<Callback> {
        let connection = self.signals.get(&id)?.connections.get(index)?;
        connection.connected.then(|| connection.callback.clone())
    }
}

/// Invokes every connected callback of a signal in registration order.
///
/// The number of connections is taken once up front, and each connection is
/// checked right before it is invoked. The bus is not locked while `invoke`
/// runs, so callbacks may connect, disconnect or destroy.
///
/// Returns the number of callbacks invoked.
pub fn fire<Callback>(
    bus: &Mutex<SignalBus<Callback>>,
    id: SignalId,
    mut invoke: impl FnMut(Callback),
) -> usize
where
    Callback: Clone,
{
    let count = bus.lock().connection_count(id);
    let mut invoked = 0;

    for index in 0..count {
        let callback = bus.lock().live_callback(id, index);

        if let Some(callback) = callback {
            invoke(callback);
            invoked += 1;
        }
    }

    invoked
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;

    #[test]
    fn fires_in_registration_order() {
        let bus = Mutex::new(SignalBus::new());
        let id = bus.lock().create("Changed");

        for name in ["a", "b", "c"] {
            bus.lock().connect(id, name);
        }

        let mut seen = Vec::new();
        assert_eq!(fire(&bus, id, |name| seen.push(name)), 3);
        assert_eq!(seen, vec!["a", "b", "c"]);
        assert_eq!(bus.lock().name(id), Some("Changed"));
    }

    #[test]
    fn disconnect_mid_fire_skips_only_the_disconnected() {
        let bus = Mutex::new(SignalBus::new());
        let id = bus.lock().create("Changed");

        let handles: Vec<_> = ["a", "b", "c", "d"]
            .into_iter()
            .map(|name| bus.lock().connect(id, name).unwrap())
            .collect();

        let seen = RefCell::new(Vec::new());
        fire(&bus, id, |name| {
            seen.borrow_mut().push(name);

            // `b` disconnects `c`, and itself.
            if name == "b" {
                assert!(bus.lock().disconnect(handles[2]));
                assert!(bus.lock().disconnect(handles[1]));
            }
        });

        assert_eq!(*seen.borrow(), vec!["a", "b", "d"]);
        assert_eq!(bus.lock().connection_count(id), 4);
        assert!(!bus.lock().is_connected(handles[2]));
        assert!(bus.lock().is_connected(handles[3]));
    }

    #[test]
    fn connections_made_while_firing_wait_for_the_next_fire() {
        let bus = Mutex::new(SignalBus::new());
        let id = bus.lock().create("Changed");
        bus.lock().connect(id, "first");

        let mut seen = Vec::new();
        fire(&bus, id, |name| {
            seen.push(name);
            bus.lock().connect(id, "late");
        });
        assert_eq!(seen, vec!["first"]);

        seen.clear();
        fire(&bus, id, |name| seen.push(name));
        assert_eq!(seen, vec!["first", "late"]);
    }

    #[test]
    fn destroy_releases_everything() {
        let bus = Mutex::new(SignalBus::new());
        let id = bus.lock().create("Changed");
        let handle = bus.lock().connect(id, "a").unwrap();

        assert!(bus.lock().destroy(id));
        assert!(!bus.lock().destroy(id));
        assert!(bus.lock().connect(id, "b").is_none());
        assert!(!bus.lock().is_connected(handle));
        assert!(!bus.lock().disconnect(handle));
        assert_eq!(fire(&bus, id, |_| unreachable!()), 0);
    }

    #[test]
    fn destroy_mid_fire_stops_delivery() {
        let bus = Mutex::new(SignalBus::new());
        let id = bus.lock().create("Changed");
        bus.lock().connect(id, "a");
        bus.lock().connect(id, "b");

        let mut seen = Vec::new();
        fire(&bus, id, |name| {
            seen.push(name);
            bus.lock().destroy(id);
        });

        assert_eq!(seen, vec!["a"]);
    }
}
