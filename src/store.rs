//! Bounded connection store with a session id index.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::connection::Connection;
use crate::message::SessionId;
use crate::session::SessionTicket;

/// A connection as held by the store.
pub type SharedConnection = Arc<Mutex<Connection>>;

/// Storage for resumable sessions that outlives the connection store.
///
/// Consulted when a client asks to resume a session the store no longer holds.
pub trait SessionCache: Send + Sync {
    fn put(&self, ticket: SessionTicket);

    fn get(&self, id: &SessionId) -> Option<SessionTicket>;

    fn remove(&self, id: &SessionId);
}

/// A [`SessionCache`] in memory, with no bound.
#[derive(Default)]
pub struct InMemorySessionCache {
    tickets: Mutex<HashMap<SessionId, SessionTicket>>,
}

impl InMemorySessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tickets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionCache for InMemorySessionCache {
    fn put(&self, ticket: SessionTicket) {
        self.tickets.lock().insert(*ticket.session_id(), ticket);
    }

    fn get(&self, id: &SessionId) -> Option<SessionTicket> {
        self.tickets.lock().get(id).cloned()
    }

    fn remove(&self, id: &SessionId) {
        self.tickets.lock().remove(id);
    }
}

impl fmt::Debug for InMemorySessionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemorySessionCache")
            .field("len", &self.len())
            .finish()
    }
}

struct Entry {
    connection: SharedConnection,
    last_access: Instant,
    session_id: Option<SessionId>,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<SocketAddr, Entry>,
    sessions: HashMap<SessionId, SocketAddr>,
    /// Least recently used first.
    lru: BTreeSet<(Instant, SocketAddr)>,
}

impl Inner {
    fn touch(&mut self, peer: SocketAddr, now: Instant) {
        if let Some(entry) = self.connections.get_mut(&peer) {
            self.lru.remove(&(entry.last_access, peer));
            // Keep access times unique per peer and monotonic
            entry.last_access = now.max(entry.last_access);
            self.lru.insert((entry.last_access, peer));
        }
    }

    fn remove(&mut self, peer: SocketAddr) -> Option<Entry> {
        let entry = self.connections.remove(&peer)?;
        self.lru.remove(&(entry.last_access, peer));
        if let Some(id) = &entry.session_id {
            if self.sessions.get(id) == Some(&peer) {
                self.sessions.remove(id);
            }
        }
        Some(entry)
    }
}

/// Connections by peer address, bounded in number.
///
/// When full, the least recently used connection is evicted if it has been
/// idle longer than the stale threshold. Otherwise new connections are refused.
///
/// Lock order: a connection lock may be held while calling into the store,
/// never the other way around.
pub struct ConnectionStore {
    inner: Mutex<Inner>,
    capacity: usize,
    stale_threshold: Duration,
    cache: Option<Arc<dyn SessionCache>>,
}

impl ConnectionStore {
    pub fn new(
        capacity: usize,
        stale_threshold: Duration,
        cache: Option<Arc<dyn SessionCache>>,
    ) -> Self {
        ConnectionStore {
            inner: Mutex::new(Inner::default()),
            capacity,
            stale_threshold,
            cache,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn size(&self) -> usize {
        self.inner.lock().connections.len()
    }

    pub fn remaining_capacity(&self) -> usize {
        self.capacity.saturating_sub(self.size())
    }

    /// The connection with `peer`, marking it recently used.
    pub fn get(&self, peer: SocketAddr, now: Instant) -> Option<SharedConnection> {
        let mut inner = self.inner.lock();
        let connection = inner.connections.get(&peer)?.connection.clone();
        inner.touch(peer, now);
        Some(connection)
    }

    /// Add a connection, replacing any previous one with the same peer.
    ///
    /// Returns `false` if the store is full and nothing is stale enough to evict.
    pub fn put(&self, peer: SocketAddr, connection: SharedConnection, now: Instant) -> bool {
        let mut inner = self.inner.lock();

        inner.remove(peer);

        if inner.connections.len() >= self.capacity {
            let oldest = inner.lru.iter().next().copied();
            match oldest {
                Some((last_access, stale_peer))
                    if now.saturating_duration_since(last_access) >= self.stale_threshold =>
                {
                    debug!("Evicting stale connection with {}", stale_peer);
                    inner.remove(stale_peer);
                }
                _ => return false,
            }
        }

        inner.lru.insert((now, peer));
        inner.connections.insert(
            peer,
            Entry {
                connection,
                last_access: now,
                session_id: None,
            },
        );
        true
    }

    /// Remove the connection with `peer`, if it is still the given one.
    pub fn remove(&self, peer: SocketAddr, connection: &SharedConnection) -> bool {
        let mut inner = self.inner.lock();
        let current = inner
            .connections
            .get(&peer)
            .is_some_and(|e| Arc::ptr_eq(&e.connection, connection));
        if current {
            inner.remove(peer);
        }
        current
    }

    /// Index an established session, and put its ticket in the session cache.
    pub fn session_established(&self, peer: SocketAddr, ticket: Option<SessionTicket>) {
        let Some(ticket) = ticket else {
            return;
        };
        let id = *ticket.session_id();
        {
            let mut inner = self.inner.lock();
            let previous = match inner.connections.get_mut(&peer) {
                Some(entry) => entry.session_id.replace(id),
                None => return,
            };
            if let Some(previous) = previous {
                if previous != id && inner.sessions.get(&previous) == Some(&peer) {
                    inner.sessions.remove(&previous);
                }
            }
            inner.sessions.insert(id, peer);
        }
        if let Some(cache) = &self.cache {
            cache.put(ticket);
        }
    }

    /// The connection currently holding the session with `id`.
    pub fn find(&self, id: &SessionId) -> Option<SharedConnection> {
        let inner = self.inner.lock();
        let peer = inner.sessions.get(id)?;
        inner.connections.get(peer).map(|e| e.connection.clone())
    }

    /// A ticket from the session cache, for sessions no connection holds anymore.
    pub fn cached_ticket(&self, id: &SessionId) -> Option<SessionTicket> {
        self.cache.as_ref()?.get(id)
    }

    /// Forget a session in the session cache.
    pub fn forget_session(&self, id: &SessionId) {
        if let Some(cache) = &self.cache {
            cache.remove(id);
        }
    }

    /// Snapshot of all connections.
    pub fn all(&self) -> Vec<SharedConnection> {
        self.inner
            .lock()
            .connections
            .values()
            .map(|e| e.connection.clone())
            .collect()
    }

    /// Mark every connection to resume its session before the next send.
    pub fn mark_all_as_resumption_required(&self) {
        for connection in self.all() {
            let mut connection = connection.lock();
            if connection.has_established_session() {
                connection.resumption_required = true;
            }
        }
    }

    /// Remove all connections, returning them.
    pub fn clear(&self) -> Vec<SharedConnection> {
        let mut inner = self.inner.lock();
        inner.sessions.clear();
        inner.lru.clear();
        inner.connections.drain().map(|(_, e)| e.connection).collect()
    }
}

impl fmt::Debug for ConnectionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionStore")
            .field("size", &self.size())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::CipherSuite;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn conn(port: u16, now: Instant) -> SharedConnection {
        Arc::new(Mutex::new(Connection::new(addr(port), None, now)))
    }

    fn ticket(id: u8) -> SessionTicket {
        SessionTicket::new(
            SessionId::try_new(&[id; 32]).unwrap(),
            CipherSuite::ECDHE_PSK_AES128_GCM_SHA256,
            [id; 48],
            None,
        )
    }

    #[test]
    fn full_store_evicts_only_stale() {
        let now = Instant::now();
        let store = ConnectionStore::new(2, Duration::from_secs(60), None);
        assert!(store.put(addr(1), conn(1, now), now));
        assert!(store.put(addr(2), conn(2, now + Duration::from_secs(1)), now + Duration::from_secs(1)));

        let later = now + Duration::from_secs(30);
        assert!(!store.put(addr(3), conn(3, later), later));
        assert_eq!(store.size(), 2);

        let much_later = now + Duration::from_secs(61);
        assert!(store.put(addr(3), conn(3, much_later), much_later));
        assert!(store.get(addr(1), much_later).is_none());
        assert!(store.get(addr(2), much_later).is_some());
    }

    #[test]
    fn get_refreshes_recency() {
        let now = Instant::now();
        let store = ConnectionStore::new(2, Duration::from_secs(60), None);
        store.put(addr(1), conn(1, now), now);
        store.put(addr(2), conn(2, now), now + Duration::from_secs(1));
        store.get(addr(1), now + Duration::from_secs(10));

        let t = now + Duration::from_secs(65);
        assert!(store.put(addr(3), conn(3, t), t));
        assert!(store.get(addr(1), t).is_some());
        assert!(store.get(addr(2), t).is_none());
    }

    #[test]
    fn session_index_follows_connections() {
        let now = Instant::now();
        let cache = Arc::new(InMemorySessionCache::new());
        let store = ConnectionStore::new(10, Duration::from_secs(60), Some(cache.clone()));
        let c = conn(1, now);
        store.put(addr(1), c.clone(), now);

        let t = ticket(1);
        store.session_established(addr(1), Some(t.clone()));
        assert!(Arc::ptr_eq(&store.find(t.session_id()).unwrap(), &c));
        assert_eq!(cache.len(), 1);

        assert!(!store.remove(addr(1), &conn(1, now)));
        assert!(store.remove(addr(1), &c));
        assert!(store.find(t.session_id()).is_none());
        assert_eq!(store.cached_ticket(t.session_id()), Some(t));
    }

    #[test]
    fn replacing_connection_drops_old_session() {
        let now = Instant::now();
        let store = ConnectionStore::new(10, Duration::from_secs(60), None);
        store.put(addr(1), conn(1, now), now);
        store.session_established(addr(1), Some(ticket(1)));

        store.put(addr(1), conn(1, now), now);
        assert!(store.find(ticket(1).session_id()).is_none());
        assert_eq!(store.size(), 1);
    }
}
