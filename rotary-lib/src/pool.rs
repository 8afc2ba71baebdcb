//! Rotating pool of egress identities.
//!
//! The pool holds one immutable [`Generation`] at a time. Readers clone the
//! `Arc` of the current generation and work on that snapshot, so a refresh
//! swapping in a new generation never disturbs requests already in flight.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::client::Client;
use crate::{ErrorKind, Result};

/// A complete, immutable set of identities
#[derive(Debug)]
pub struct Generation {
    number: u64,
    clients: Vec<Arc<Client>>,
    no_proxy: Arc<Client>,
}

impl Generation {
    /// Assemble a generation from the proxied clients and the no-proxy client
    pub(crate) const fn new(number: u64, clients: Vec<Arc<Client>>, no_proxy: Arc<Client>) -> Self {
        Self {
            number,
            clients,
            no_proxy,
        }
    }

    /// Sequence number, increasing with every published refresh
    #[must_use]
    pub const fn number(&self) -> u64 {
        self.number
    }

    /// The proxied clients, ordered by slot
    #[must_use]
    pub fn clients(&self) -> &[Arc<Client>] {
        &self.clients
    }

    /// The designated client without proxy
    #[must_use]
    pub const fn no_proxy(&self) -> &Arc<Client> {
        &self.no_proxy
    }

    /// Number of proxied clients
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// True if the generation has no proxied client
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

/// Round-robin pool over the current [`Generation`]
#[derive(Debug)]
pub struct ClientPool {
    current: Mutex<Arc<Generation>>,
    counter: AtomicU64,
}

impl ClientPool {
    /// Create a pool serving `generation`
    #[must_use]
    pub fn new(generation: Generation) -> Self {
        Self {
            current: Mutex::new(Arc::new(generation)),
            counter: AtomicU64::new(0),
        }
    }

    /// The current generation
    #[must_use]
    pub fn snapshot(&self) -> Arc<Generation> {
        let current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&current)
    }

    /// Next client in round-robin order
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::PoolExhausted`] if the generation has no proxied clients
    pub fn select(&self) -> Result<Arc<Client>> {
        let generation = self.snapshot();
        if generation.is_empty() {
            return Err(ErrorKind::PoolExhausted);
        }
        let ticket = self.counter.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::clone(&generation.clients[slot(ticket, generation.len())]))
    }

    /// Client at slot `id`
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::ClientIdOutOfRange`] if the generation has no such slot
    pub fn select_by_id(&self, id: usize) -> Result<Arc<Client>> {
        let generation = self.snapshot();
        generation
            .clients
            .get(id)
            .cloned()
            .ok_or(ErrorKind::ClientIdOutOfRange {
                id,
                size: generation.len(),
            })
    }

    /// The designated client without proxy
    #[must_use]
    pub fn no_proxy_client(&self) -> Arc<Client> {
        Arc::clone(&self.snapshot().no_proxy)
    }

    /// Number of proxied clients in the current generation
    #[must_use]
    pub fn size(&self) -> usize {
        self.snapshot().len()
    }

    /// Atomically publish `generation`, returning the one it replaces
    pub fn replace(&self, generation: Generation) -> Arc<Generation> {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *current, Arc::new(generation))
    }

    /// Set the round-robin counter
    pub fn seed_counter(&self, value: u64) {
        self.counter.store(value, Ordering::Relaxed);
    }
}

#[allow(clippy::cast_possible_truncation)]
fn slot(ticket: u64, len: usize) -> usize {
    (ticket % len as u64) as usize
}
