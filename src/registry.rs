//! Connection registry: slab storage plus three ordered membership lists.
//!
//! Every connection is in exactly one of active, listen, or complete at any
//! moment. Connections are addressed by slab id; readiness tokens encode
//! the id directly, so no fd-keyed lookup is needed.

use slab::Slab;

use crate::address::ConnAddress;
use crate::conn::Connection;

/// Which list a connection currently belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConList {
    Active,
    Listen,
    Complete,
}

pub(crate) struct Registry {
    conns: Slab<Connection>,
    membership: Vec<Option<ConList>>,
    pub(crate) active: Vec<usize>,
    pub(crate) listen: Vec<usize>,
    pub(crate) complete: Vec<usize>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            conns: Slab::new(),
            membership: Vec::new(),
            active: Vec::new(),
            listen: Vec::new(),
            complete: Vec::new(),
        }
    }

    /// Insert a connection into the active or listen list, returning its id.
    pub(crate) fn insert(&mut self, con: Connection) -> usize {
        let is_listen = con.is_listen;
        let idx = self.conns.insert(con);
        if self.membership.len() <= idx {
            self.membership.resize(idx + 1, None);
        }
        debug_assert!(self.membership[idx].is_none());
        if is_listen {
            self.membership[idx] = Some(ConList::Listen);
            self.listen.push(idx);
        } else {
            self.membership[idx] = Some(ConList::Active);
            self.active.push(idx);
        }
        idx
    }

    pub(crate) fn get(&self, idx: usize) -> Option<&Connection> {
        self.conns.get(idx)
    }

    pub(crate) fn get_mut(&mut self, idx: usize) -> Option<&mut Connection> {
        self.conns.get_mut(idx)
    }

    /// Lookup that rejects recycled slots via the generation stamp.
    pub(crate) fn get_checked(&self, idx: usize, gen: u64) -> Option<&Connection> {
        self.conns.get(idx).filter(|c| c.gen == gen)
    }

    pub(crate) fn get_checked_mut(&mut self, idx: usize, gen: u64) -> Option<&mut Connection> {
        self.conns.get_mut(idx).filter(|c| c.gen == gen)
    }

    /// Move a connection from its current list to complete.
    pub(crate) fn move_to_complete(&mut self, idx: usize) {
        match self.membership.get(idx).copied().flatten() {
            Some(ConList::Active) => self.active.retain(|&i| i != idx),
            Some(ConList::Listen) => self.listen.retain(|&i| i != idx),
            Some(ConList::Complete) | None => return,
        }
        self.membership[idx] = Some(ConList::Complete);
        self.complete.push(idx);
    }

    /// Remove a completed connection, surrendering ownership to the caller.
    pub(crate) fn remove(&mut self, idx: usize) -> Option<Connection> {
        if !self.conns.contains(idx) {
            return None;
        }
        match self.membership.get(idx).copied().flatten() {
            Some(ConList::Active) => self.active.retain(|&i| i != idx),
            Some(ConList::Listen) => self.listen.retain(|&i| i != idx),
            Some(ConList::Complete) => self.complete.retain(|&i| i != idx),
            None => {}
        }
        self.membership[idx] = None;
        Some(self.conns.remove(idx))
    }

    /// Is any listener already bound to this address (family-specific
    /// equality)?
    pub(crate) fn is_listening(&self, addr: &ConnAddress) -> bool {
        self.listen.iter().any(|&idx| {
            self.conns
                .get(idx)
                .map(|c| c.address.matches_listener(addr))
                .unwrap_or(false)
        })
    }

    /// Snapshot of active + listen ids in insertion order.
    pub(crate) fn live_ids(&self) -> Vec<usize> {
        let mut ids = Vec::with_capacity(self.active.len() + self.listen.len());
        ids.extend_from_slice(&self.active);
        ids.extend_from_slice(&self.listen);
        ids
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub(crate) fn active_count(&self) -> usize {
        self.active.len()
    }

    pub(crate) fn listen_count(&self) -> usize {
        self.listen.len()
    }
}
