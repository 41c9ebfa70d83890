use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use crate::crypto::{Aes128GcmProvider, CipherProvider, PskStore};
use crate::message::MaxFragmentLength;
use crate::store::SessionCache;
use crate::Error;

/// Smallest MTU accepted by [`ConfigBuilder::build`].
pub const MIN_MTU: usize = 256;

/// MTU used when none is configured.
pub const DEFAULT_MTU: usize = 1280;

/// Connector configuration
#[derive(Clone)]
pub struct Config {
    bind_address: SocketAddr,
    mtu: Option<usize>,
    max_connections: usize,
    stale_connection_threshold: Duration,
    retransmission_timeout: Duration,
    max_retransmissions: usize,
    outbound_message_buffer_size: usize,
    connection_thread_count: usize,
    auto_resumption_timeout: Option<Duration>,
    max_fragment_length: Option<MaxFragmentLength>,
    cookie_secret_lifetime: Duration,
    cipher_provider: Arc<dyn CipherProvider>,
    psk_store: Option<Arc<dyn PskStore>>,
    session_cache: Option<Arc<dyn SessionCache>>,
    rng_seed: Option<u64>,
}

impl Config {
    /// Create a new configuration builder.
    pub fn builder() -> ConfigBuilder {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        ConfigBuilder {
            bind_address: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            mtu: None,
            max_connections: 150_000,
            stale_connection_threshold: Duration::from_secs(30 * 60),
            retransmission_timeout: Duration::from_secs(1),
            max_retransmissions: 4,
            outbound_message_buffer_size: 100_000,
            connection_thread_count: 6 * parallelism,
            auto_resumption_timeout: None,
            max_fragment_length: None,
            max_fragment_length_code: None,
            cookie_secret_lifetime: Duration::from_secs(5 * 60),
            cipher_provider: None,
            psk_store: None,
            session_cache: None,
            rng_seed: None,
        }
    }

    /// Local address the connector binds to.
    #[inline(always)]
    pub fn bind_address(&self) -> SocketAddr {
        self.bind_address
    }

    /// Configured max transmission unit, if any.
    ///
    /// When unset the connector uses [`DEFAULT_MTU`].
    #[inline(always)]
    pub fn mtu(&self) -> Option<usize> {
        self.mtu
    }

    /// Max number of connections kept in the connection store.
    #[inline(always)]
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Idle time after which a connection may be evicted to make room for a new one.
    #[inline(always)]
    pub fn stale_connection_threshold(&self) -> Duration {
        self.stale_connection_threshold
    }

    /// Time until the first retransmission of a flight.
    ///
    /// Every flight restarts with this value. Doubled for every retry.
    #[inline(always)]
    pub fn retransmission_timeout(&self) -> Duration {
        self.retransmission_timeout
    }

    /// Max number of retransmissions per flight.
    #[inline(always)]
    pub fn max_retransmissions(&self) -> usize {
        self.max_retransmissions
    }

    /// Max number of outbound messages admitted but not yet completed.
    #[inline(always)]
    pub fn outbound_message_buffer_size(&self) -> usize {
        self.outbound_message_buffer_size
    }

    /// Number of worker threads processing records and messages.
    #[inline(always)]
    pub fn connection_thread_count(&self) -> usize {
        self.connection_thread_count
    }

    /// Idle time after which the next outgoing message triggers a session resumption.
    #[inline(always)]
    pub fn auto_resumption_timeout(&self) -> Option<Duration> {
        self.auto_resumption_timeout
    }

    /// Maximum fragment length to request as a client.
    #[inline(always)]
    pub fn max_fragment_length(&self) -> Option<MaxFragmentLength> {
        self.max_fragment_length
    }

    /// How long a cookie secret is used before it is rotated.
    #[inline(always)]
    pub fn cookie_secret_lifetime(&self) -> Duration {
        self.cookie_secret_lifetime
    }

    /// Record protection provider.
    #[inline(always)]
    pub fn cipher_provider(&self) -> &dyn CipherProvider {
        &*self.cipher_provider
    }

    /// Pre-shared keys for both roles.
    #[inline(always)]
    pub fn psk_store(&self) -> Option<&dyn PskStore> {
        self.psk_store.as_deref()
    }

    /// Second level cache of resumable sessions.
    #[inline(always)]
    pub fn session_cache(&self) -> Option<Arc<dyn SessionCache>> {
        self.session_cache.clone()
    }

    /// Seed for randoms, session ids and cookie secrets.
    #[inline(always)]
    pub fn rng_seed(&self) -> Option<u64> {
        self.rng_seed
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::builder()
            .build()
            .expect("Default config should always validate")
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("mtu", &self.mtu)
            .field("max_connections", &self.max_connections)
            .field("retransmission_timeout", &self.retransmission_timeout)
            .field("max_retransmissions", &self.max_retransmissions)
            .field("connection_thread_count", &self.connection_thread_count)
            .field("cipher_provider", &self.cipher_provider)
            .finish_non_exhaustive()
    }
}

/// Builder for connector configuration.
pub struct ConfigBuilder {
    bind_address: SocketAddr,
    mtu: Option<usize>,
    max_connections: usize,
    stale_connection_threshold: Duration,
    retransmission_timeout: Duration,
    max_retransmissions: usize,
    outbound_message_buffer_size: usize,
    connection_thread_count: usize,
    auto_resumption_timeout: Option<Duration>,
    max_fragment_length: Option<MaxFragmentLength>,
    max_fragment_length_code: Option<u8>,
    cookie_secret_lifetime: Duration,
    cipher_provider: Option<Arc<dyn CipherProvider>>,
    psk_store: Option<Arc<dyn PskStore>>,
    session_cache: Option<Arc<dyn SessionCache>>,
    rng_seed: Option<u64>,
}

impl ConfigBuilder {
    /// Set the local address to bind to.
    ///
    /// Defaults to `0.0.0.0:0`.
    pub fn bind_address(mut self, address: SocketAddr) -> Self {
        self.bind_address = address;
        self
    }

    /// Set the max transmission unit (MTU).
    ///
    /// Defaults to 1280 when unset.
    pub fn mtu(mut self, mtu: usize) -> Self {
        self.mtu = Some(mtu);
        self
    }

    /// Set the max number of stored connections.
    ///
    /// Defaults to 150000.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the idle time after which connections may be evicted.
    ///
    /// Defaults to 30 minutes.
    pub fn stale_connection_threshold(mut self, threshold: Duration) -> Self {
        self.stale_connection_threshold = threshold;
        self
    }

    /// Set the time until the first retransmission.
    ///
    /// Doubled for every retry, without jitter.
    /// Defaults to 1 second.
    pub fn retransmission_timeout(mut self, timeout: Duration) -> Self {
        self.retransmission_timeout = timeout;
        self
    }

    /// Set the max number of retransmissions per flight.
    ///
    /// Defaults to 4.
    pub fn max_retransmissions(mut self, retries: usize) -> Self {
        self.max_retransmissions = retries;
        self
    }

    /// Set the bound of admitted, not yet completed outbound messages.
    ///
    /// Defaults to 100000.
    pub fn outbound_message_buffer_size(mut self, size: usize) -> Self {
        self.outbound_message_buffer_size = size;
        self
    }

    /// Set the number of worker threads.
    ///
    /// Defaults to 6 times the available parallelism.
    pub fn connection_thread_count(mut self, count: usize) -> Self {
        self.connection_thread_count = count;
        self
    }

    /// Force a session resumption when sending after this much idle time.
    ///
    /// Disabled by default.
    pub fn auto_resumption_timeout(mut self, timeout: Duration) -> Self {
        self.auto_resumption_timeout = Some(timeout);
        self
    }

    /// Request a maximum fragment length (RFC 6066 code 1 to 4) as a client.
    ///
    /// Not requested by default.
    pub fn max_fragment_length(mut self, code: u8) -> Self {
        self.max_fragment_length_code = Some(code);
        self.max_fragment_length = MaxFragmentLength::from_code(code);
        self
    }

    /// Set how long a cookie secret is used.
    ///
    /// Defaults to 5 minutes.
    pub fn cookie_secret_lifetime(mut self, lifetime: Duration) -> Self {
        self.cookie_secret_lifetime = lifetime;
        self
    }

    /// Set a custom record protection provider.
    ///
    /// Defaults to [`Aes128GcmProvider`].
    pub fn with_cipher_provider(mut self, provider: Arc<dyn CipherProvider>) -> Self {
        self.cipher_provider = Some(provider);
        self
    }

    /// Set the pre-shared key store.
    pub fn with_psk_store(mut self, store: Arc<dyn PskStore>) -> Self {
        self.psk_store = Some(store);
        self
    }

    /// Set a session cache shared beyond the lifetime of connections.
    pub fn with_session_cache(mut self, cache: Arc<dyn SessionCache>) -> Self {
        self.session_cache = Some(cache);
        self
    }

    /// Seed the random number generator, for deterministic tests.
    pub fn rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> Result<Config, Error> {
        if self.connection_thread_count == 0 {
            return Err(Error::Config("connection_thread_count must be > 0".into()));
        }
        if self.max_connections == 0 {
            return Err(Error::Config("max_connections must be > 0".into()));
        }
        if self.outbound_message_buffer_size == 0 {
            return Err(Error::Config(
                "outbound_message_buffer_size must be > 0".into(),
            ));
        }
        if let Some(mtu) = self.mtu {
            if mtu < MIN_MTU {
                return Err(Error::Config(format!("mtu must be >= {}", MIN_MTU)));
            }
        }
        if let Some(code) = self.max_fragment_length_code {
            if self.max_fragment_length.is_none() {
                return Err(Error::Config(format!(
                    "max_fragment_length code must be 1..=4, got {}",
                    code
                )));
            }
        }

        Ok(Config {
            bind_address: self.bind_address,
            mtu: self.mtu,
            max_connections: self.max_connections,
            stale_connection_threshold: self.stale_connection_threshold,
            retransmission_timeout: self.retransmission_timeout,
            max_retransmissions: self.max_retransmissions,
            outbound_message_buffer_size: self.outbound_message_buffer_size,
            connection_thread_count: self.connection_thread_count,
            auto_resumption_timeout: self.auto_resumption_timeout,
            max_fragment_length: self.max_fragment_length,
            cookie_secret_lifetime: self.cookie_secret_lifetime,
            cipher_provider: self
                .cipher_provider
                .unwrap_or_else(|| Arc::new(Aes128GcmProvider)),
            psk_store: self.psk_store,
            session_cache: self.session_cache,
            rng_seed: self.rng_seed,
        })
    }
}
