use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use zeroize::Zeroizing;

/// Source of pre-shared keys.
pub trait PskStore: Send + Sync {
    /// Key for an identity presented by a client.
    fn key(&self, identity: &[u8]) -> Option<Zeroizing<Vec<u8>>>;

    /// Identity and key to present when connecting to `peer`.
    fn identity(&self, peer: SocketAddr) -> Option<(Vec<u8>, Zeroizing<Vec<u8>>)>;
}

/// A fixed table of identities, plus one identity used for all outgoing handshakes.
#[derive(Default, Clone)]
pub struct StaticPskStore {
    keys: HashMap<Vec<u8>, Zeroizing<Vec<u8>>>,
    client: Option<(Vec<u8>, Zeroizing<Vec<u8>>)>,
}

impl StaticPskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `identity` with `key` from clients.
    pub fn with_key(mut self, identity: impl Into<Vec<u8>>, key: impl Into<Vec<u8>>) -> Self {
        self.keys.insert(identity.into(), Zeroizing::new(key.into()));
        self
    }

    /// Present `identity` with `key` to servers.
    pub fn with_client_identity(
        mut self,
        identity: impl Into<Vec<u8>>,
        key: impl Into<Vec<u8>>,
    ) -> Self {
        self.client = Some((identity.into(), Zeroizing::new(key.into())));
        self
    }
}

impl PskStore for StaticPskStore {
    fn key(&self, identity: &[u8]) -> Option<Zeroizing<Vec<u8>>> {
        self.keys.get(identity).cloned()
    }

    fn identity(&self, _peer: SocketAddr) -> Option<(Vec<u8>, Zeroizing<Vec<u8>>)> {
        self.client.clone()
    }
}

impl fmt::Debug for StaticPskStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticPskStore")
            .field("identities", &self.keys.len())
            .field("client", &self.client.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup() {
        let store = StaticPskStore::new()
            .with_key("a", [1, 2, 3])
            .with_client_identity("b", [4]);
        assert_eq!(store.key(b"a").as_deref().map(|k| k.as_slice()), Some(&[1, 2, 3][..]));
        assert!(store.key(b"b").is_none());
        let (identity, key) = store.identity("127.0.0.1:1".parse().unwrap()).unwrap();
        assert_eq!(identity, b"b");
        assert_eq!(key.as_slice(), &[4]);
    }
}
