use crate::connection::Connection;
use rand::seq::SliceRandom;
use std::collections::BTreeSet;

/// Round-robin order over the enabled connections.
///
/// The order is shuffled whenever the set of enabled connections changes
/// and is stable otherwise.
#[derive(Debug, Clone, Default)]
pub struct Rotation {
    connections: Vec<Connection>,
    index: usize,
}

fn enabled(connections: &[Connection]) -> Vec<Connection> {
    connections
        .iter()
        .filter(|c| c.is_enabled())
        .cloned()
        .map(|mut c| {
            c.ensure_id();
            c
        })
        .collect()
}

fn id_set(connections: &[Connection]) -> BTreeSet<&str> {
    connections.iter().map(|c| c.id.as_str()).collect()
}

impl Rotation {
    pub fn new(connections: &[Connection]) -> Self {
        let mut rotation = Rotation::default();
        rotation.update(connections, None);
        rotation
    }

    /// Replace the connection list. Returns true when it was reshuffled.
    ///
    /// The active connection keeps its position if it is still enabled.
    pub fn update(&mut self, connections: &[Connection], active_id: Option<&str>) -> bool {
        let mut next = enabled(connections);

        if !self.connections.is_empty() && id_set(&next) == id_set(&self.connections) {
            // same set, keep the order but take the fresh values
            self.connections = self
                .connections
                .iter()
                .filter_map(|old| next.iter().find(|c| c.id == old.id).cloned())
                .collect();
            return false;
        }

        next.shuffle(&mut rand::thread_rng());
        self.connections = next;
        self.index = match active_id.and_then(|id| self.position(id)) {
            Some(position) => position,
            None if self.connections.is_empty() => 0,
            None => self.index % self.connections.len(),
        };
        true
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.connections.iter().position(|c| c.id == id)
    }

    pub fn current(&self) -> Option<&Connection> {
        self.connections.get(self.index)
    }

    /// Step to the next connection and return it.
    pub fn advance(&mut self) -> Option<&Connection> {
        if self.connections.is_empty() {
            return None;
        }
        self.index = (self.index + 1) % self.connections.len();
        self.current()
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
