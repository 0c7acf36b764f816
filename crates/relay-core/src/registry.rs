//! Per-node client registry.
//!
//! Maps usernames to the socket address this node reaches them on, with a
//! reverse index by address for disconnect handling. Both indices sit behind
//! one lock so an entry is always present in both or in neither.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::debug;

/// Registry errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// No client is registered at the address.
    #[error("No client registered at {0}")]
    NotFound(SocketAddr),
}

/// A registered client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientRecord {
    /// Username the client announced.
    pub username: String,
    /// Address of the client's connection to this node.
    pub address: SocketAddr,
}

impl ClientRecord {
    /// Create a new record.
    #[must_use]
    pub fn new(username: impl Into<String>, address: SocketAddr) -> Self {
        Self {
            username: username.into(),
            address,
        }
    }
}

#[derive(Debug, Default)]
struct Indices {
    by_name: HashMap<String, SocketAddr>,
    by_addr: HashMap<SocketAddr, String>,
}

impl Indices {
    fn insert(&mut self, username: &str, address: SocketAddr) {
        if let Some(old_addr) = self.by_name.insert(username.to_string(), address) {
            if old_addr != address {
                self.by_addr.remove(&old_addr);
            }
        }
        if let Some(old_name) = self.by_addr.insert(address, username.to_string()) {
            if old_name != username {
                self.by_name.remove(&old_name);
            }
        }
    }
}

/// The client registry for one node.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    inner: Mutex<Indices>,
}

impl ClientRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn indices(&self) -> MutexGuard<'_, Indices> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `username` at `address`, replacing any previous entry for
    /// either the name or the address.
    pub fn add(&self, username: impl Into<String>, address: SocketAddr) {
        let username = username.into();
        let mut idx = self.indices();
        idx.insert(&username, address);

        debug!(user = %username, connection = %address, clients = idx.by_name.len(), "Client registered");
    }

    /// Register `username` at `address` unless the name is already taken.
    ///
    /// The check and the insert happen under one lock, so of several
    /// concurrent claims on a free name exactly one succeeds.
    ///
    /// # Errors
    ///
    /// Returns the existing record if `username` is registered; the registry
    /// is left unchanged.
    pub fn try_add(&self, username: &str, address: SocketAddr) -> Result<(), ClientRecord> {
        let mut idx = self.indices();
        if let Some(&existing) = idx.by_name.get(username) {
            return Err(ClientRecord::new(username, existing));
        }
        idx.insert(username, address);

        debug!(user = %username, connection = %address, clients = idx.by_name.len(), "Client registered");
        Ok(())
    }

    /// Look up a client by username.
    #[must_use]
    pub fn get_by_username(&self, username: &str) -> Option<ClientRecord> {
        self.indices()
            .by_name
            .get(username)
            .map(|&addr| ClientRecord::new(username, addr))
    }

    /// Look up a client by connection address.
    #[must_use]
    pub fn get_by_address(&self, address: SocketAddr) -> Option<ClientRecord> {
        self.indices()
            .by_addr
            .get(&address)
            .map(|name| ClientRecord::new(name.clone(), address))
    }

    /// Remove the client registered at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if nothing is registered there.
    pub fn remove(&self, address: SocketAddr) -> Result<ClientRecord, RegistryError> {
        let mut idx = self.indices();
        let username = idx
            .by_addr
            .remove(&address)
            .ok_or(RegistryError::NotFound(address))?;
        idx.by_name.remove(&username);

        debug!(user = %username, connection = %address, clients = idx.by_name.len(), "Client removed");
        Ok(ClientRecord::new(username, address))
    }

    /// Every registered client except `username`, in no particular order.
    #[must_use]
    pub fn all_except(&self, username: &str) -> Vec<ClientRecord> {
        self.indices()
            .by_name
            .iter()
            .filter(|(name, _)| name.as_str() != username)
            .map(|(name, &addr)| ClientRecord::new(name.clone(), addr))
            .collect()
    }

    /// All registered usernames.
    #[must_use]
    pub fn usernames(&self) -> Vec<String> {
        self.indices().by_name.keys().cloned().collect()
    }

    /// Number of registered clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.indices().by_name.len()
    }

    /// Whether no clients are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.indices().by_name.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_add_and_lookup() {
        let registry = ClientRegistry::new();
        registry.add("bill", addr(5000));

        let by_name = registry.get_by_username("bill").unwrap();
        let by_addr = registry.get_by_address(addr(5000)).unwrap();
        assert_eq!(by_name, by_addr);
        assert_eq!(by_name.address, addr(5000));
        assert_eq!(registry.len(), 1);

        assert!(registry.get_by_username("Bill").is_none());
        assert!(registry.get_by_address(addr(5001)).is_none());
    }

    #[test]
    fn test_remove() {
        let registry = ClientRegistry::new();
        registry.add("bill", addr(5000));

        let removed = registry.remove(addr(5000)).unwrap();
        assert_eq!(removed.username, "bill");
        assert!(registry.get_by_username("bill").is_none());
        assert!(registry.get_by_address(addr(5000)).is_none());
        assert!(registry.is_empty());

        assert_eq!(
            registry.remove(addr(5000)),
            Err(RegistryError::NotFound(addr(5000)))
        );
    }

    #[test]
    fn test_add_overwrites_username() {
        let registry = ClientRegistry::new();
        registry.add("bill", addr(5000));
        registry.add("bill", addr(5001));

        assert_eq!(registry.get_by_username("bill").unwrap().address, addr(5001));
        assert!(registry.get_by_address(addr(5000)).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_add_overwrites_address() {
        let registry = ClientRegistry::new();
        registry.add("bill", addr(5000));
        registry.add("jill", addr(5000));

        assert_eq!(registry.get_by_address(addr(5000)).unwrap().username, "jill");
        assert!(registry.get_by_username("bill").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_try_add_keeps_existing_entry() {
        let registry = ClientRegistry::new();
        assert_eq!(registry.try_add("bill", addr(5000)), Ok(()));

        assert_eq!(
            registry.try_add("bill", addr(5001)),
            Err(ClientRecord::new("bill", addr(5000)))
        );
        assert_eq!(registry.get_by_username("bill").unwrap().address, addr(5000));
        assert!(registry.get_by_address(addr(5001)).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_concurrent_try_add_single_winner() {
        for _ in 0..200 {
            let registry = Arc::new(ClientRegistry::new());
            let barrier = Arc::new(std::sync::Barrier::new(8));

            let handles: Vec<_> = (0..8u16)
                .map(|t| {
                    let registry = Arc::clone(&registry);
                    let barrier = Arc::clone(&barrier);
                    std::thread::spawn(move || {
                        barrier.wait();
                        registry.try_add("bill", addr(6000 + t)).is_ok()
                    })
                })
                .collect();
            let winners = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|&won| won)
                .count();

            assert_eq!(winners, 1);
            assert_eq!(registry.len(), 1);
        }
    }

    #[test]
    fn test_all_except() {
        let registry = ClientRegistry::new();
        registry.add("bill", addr(5000));
        registry.add("jill", addr(5001));
        registry.add("phil", addr(5002));

        let mut others: Vec<String> = registry
            .all_except("bill")
            .into_iter()
            .map(|c| c.username)
            .collect();
        others.sort();
        assert_eq!(others, vec!["jill", "phil"]);

        assert_eq!(registry.all_except("nobody").len(), 3);
    }

    #[test]
    fn test_concurrent_adds() {
        let registry = Arc::new(ClientRegistry::new());

        let handles: Vec<_> = (0..8u16)
            .map(|t| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for i in 0..50u16 {
                        let port = 10_000 + t * 100 + i;
                        registry.add(format!("u{}", port), addr(port));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.len(), 400);
        let record = registry.get_by_username("u10742").unwrap();
        assert_eq!(registry.get_by_address(record.address).unwrap(), record);
    }
}
