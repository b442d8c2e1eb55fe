use std::{io, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use bytes::Bytes;
use thiserror::Error;

use crate::{token::DEFAULT_TOKEN_PREFIX, MAX_DATAGRAM_SIZE, MAX_SEND_UDP_PAYLOAD};

/// Parameters handed to the engine for every connection it creates
///
/// Default values target an echo workload on a local network.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub(crate) max_idle_timeout: Duration,
    pub(crate) max_recv_udp_payload_size: usize,
    pub(crate) max_send_udp_payload_size: usize,
    pub(crate) initial_max_data: u64,
    pub(crate) initial_max_stream_data_bidi_local: u64,
    pub(crate) initial_max_stream_data_bidi_remote: u64,
    pub(crate) initial_max_stream_data_uni: u64,
    pub(crate) initial_max_streams_bidi: u64,
    pub(crate) initial_max_streams_uni: u64,
    pub(crate) disable_active_migration: bool,
    pub(crate) congestion_control: String,
    pub(crate) application_protos: Vec<Vec<u8>>,
    pub(crate) verify_peer: bool,
    pub(crate) keylog: Option<PathBuf>,
}

impl TransportConfig {
    /// Maximum duration of inactivity to accept before timing out the connection
    pub fn max_idle_timeout(&mut self, value: Duration) -> &mut Self {
        self.max_idle_timeout = value;
        self
    }

    /// Largest UDP payload the peer may send us
    pub fn max_recv_udp_payload_size(&mut self, value: usize) -> &mut Self {
        self.max_recv_udp_payload_size = value;
        self
    }

    /// Largest UDP payload we send
    pub fn max_send_udp_payload_size(&mut self, value: usize) -> &mut Self {
        self.max_send_udp_payload_size = value;
        self
    }

    /// Bytes the peer may send across all streams before becoming blocked
    pub fn initial_max_data(&mut self, value: u64) -> &mut Self {
        self.initial_max_data = value;
        self
    }

    /// Per-stream receive window for bidirectional streams we open
    pub fn initial_max_stream_data_bidi_local(&mut self, value: u64) -> &mut Self {
        self.initial_max_stream_data_bidi_local = value;
        self
    }

    /// Per-stream receive window for bidirectional streams the peer opens
    pub fn initial_max_stream_data_bidi_remote(&mut self, value: u64) -> &mut Self {
        self.initial_max_stream_data_bidi_remote = value;
        self
    }

    /// Per-stream receive window for unidirectional streams
    pub fn initial_max_stream_data_uni(&mut self, value: u64) -> &mut Self {
        self.initial_max_stream_data_uni = value;
        self
    }

    /// Bidirectional streams the peer may open
    pub fn initial_max_streams_bidi(&mut self, value: u64) -> &mut Self {
        self.initial_max_streams_bidi = value;
        self
    }

    /// Unidirectional streams the peer may open
    pub fn initial_max_streams_uni(&mut self, value: u64) -> &mut Self {
        self.initial_max_streams_uni = value;
        self
    }

    /// Whether the peer must stay on the address the connection started from
    pub fn disable_active_migration(&mut self, value: bool) -> &mut Self {
        self.disable_active_migration = value;
        self
    }

    /// Name of the congestion controller the engine should use
    pub fn congestion_control(&mut self, value: impl Into<String>) -> &mut Self {
        self.congestion_control = value.into();
        self
    }

    /// ALPN protocols to offer or accept, in order of preference
    pub fn application_protos(&mut self, value: Vec<Vec<u8>>) -> &mut Self {
        self.application_protos = value;
        self
    }

    /// Whether to verify the peer's certificate
    pub fn verify_peer(&mut self, value: bool) -> &mut Self {
        self.verify_peer = value;
        self
    }

    /// File to append TLS secrets to, in NSS key log format
    pub fn keylog(&mut self, value: Option<PathBuf>) -> &mut Self {
        self.keylog = value;
        self
    }

    /// Default configuration, logging keys to `SSLKEYLOGFILE` if it is set
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.keylog(std::env::var_os("SSLKEYLOGFILE").map(PathBuf::from));
        config
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_idle_timeout: Duration::from_millis(5_000),
            max_recv_udp_payload_size: MAX_SEND_UDP_PAYLOAD,
            max_send_udp_payload_size: MAX_SEND_UDP_PAYLOAD,
            initial_max_data: 10_000_000,
            initial_max_stream_data_bidi_local: 1_000_000,
            initial_max_stream_data_bidi_remote: 1_000_000,
            initial_max_stream_data_uni: 1_000_000,
            initial_max_streams_bidi: 100,
            initial_max_streams_uni: 100,
            disable_active_migration: true,
            congestion_control: "reno".into(),
            application_protos: [&b"hq-interop"[..], b"hq-29", b"hq-28", b"hq-27", b"http/0.9"]
                .iter()
                .map(|p| p.to_vec())
                .collect(),
            verify_peer: false,
            keylog: None,
        }
    }
}

/// Parameters of an [`Endpoint`](crate::Endpoint) that are independent of the engine
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub(crate) recv_buffer_size: usize,
    pub(crate) sweep_interval: Duration,
    pub(crate) drain_timeout: Duration,
    pub(crate) rng_seed: Option<u64>,
    pub(crate) token_prefix: Bytes,
}

impl EndpointConfig {
    /// Size of the buffer datagrams are received into
    ///
    /// A datagram that fills the buffer completely is dropped as possibly truncated, so this must
    /// exceed the largest datagram expected.
    pub fn recv_buffer_size(&mut self, value: usize) -> &mut Self {
        self.recv_buffer_size = value;
        self
    }

    /// How often to purge closed connections from the table
    pub fn sweep_interval(&mut self, value: Duration) -> &mut Self {
        self.sweep_interval = value;
        self
    }

    /// How long shutdown waits for queued packets, such as CONNECTION_CLOSE, to leave
    pub fn drain_timeout(&mut self, value: Duration) -> &mut Self {
        self.drain_timeout = value;
        self
    }

    /// Seed for the connection ID generator, for reproducible tests
    pub fn rng_seed(&mut self, seed: Option<u64>) -> &mut Self {
        self.rng_seed = seed;
        self
    }

    /// Marker that prefixes every address-validation token
    pub fn token_prefix(&mut self, value: impl Into<Bytes>) -> &mut Self {
        self.token_prefix = value.into();
        self
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            recv_buffer_size: MAX_DATAGRAM_SIZE,
            sweep_interval: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(1),
            rng_seed: None,
            token_prefix: Bytes::from_static(DEFAULT_TOKEN_PREFIX),
        }
    }
}

/// Parameters of a [`Client`](crate::Client) connection
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub(crate) server_name: Option<String>,
    pub(crate) stream_id: u64,
    pub(crate) transport: Arc<TransportConfig>,
}

impl ClientConfig {
    /// Connect using `transport`
    pub fn new(transport: Arc<TransportConfig>) -> Self {
        Self {
            server_name: None,
            stream_id: 4,
            transport,
        }
    }

    /// Server name to send in the TLS handshake and verify the certificate against
    pub fn server_name(&mut self, value: Option<String>) -> &mut Self {
        self.server_name = value;
        self
    }

    /// Stream carrying the application payload
    pub fn stream_id(&mut self, value: u64) -> &mut Self {
        self.stream_id = value;
        self
    }

    /// Transport configuration the engine was built from
    pub fn transport(&self) -> &TransportConfig {
        &self.transport
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(Arc::new(TransportConfig::default()))
    }
}

/// Errors that prevent an endpoint from starting
///
/// None of these can be recovered from: without a working configuration no connection can ever
/// be served.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The certificate chain could not be loaded
    #[error("failed to load certificate chain from {}: {reason}", path.display())]
    Certificate {
        /// File that was read
        path: PathBuf,
        /// What went wrong
        reason: String,
    },
    /// The private key could not be loaded
    #[error("failed to load private key from {}: {reason}", path.display())]
    PrivateKey {
        /// File that was read
        path: PathBuf,
        /// What went wrong
        reason: String,
    },
    /// A path is not valid UTF-8
    #[error("path is not valid UTF-8: {}", .0.display())]
    InvalidPath(PathBuf),
    /// The engine rejected its configuration
    #[error("engine configuration failed: {0}")]
    Engine(String),
    /// The UDP socket could not be set up
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested
        addr: SocketAddr,
        /// Underlying error
        source: io::Error,
    },
    /// The async runtime could not be created
    #[error("failed to build runtime: {0}")]
    Runtime(io::Error),
    /// Zero workers were requested
    #[error("at least one worker is required")]
    NoWorkers,
    /// A worker thread ended before it started serving
    #[error("worker exited before it started serving")]
    WorkerExited,
}
