//! [`Engine`] implementation backed by the `quiche` crate

use std::{
    fs::OpenOptions,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use bytes::Bytes;
use tracing::warn;

use super::{
    ConnectionStats, Engine, EngineConnection, EngineError, Header, PacketType, RecvInfo,
    SendInfo,
};
use crate::{config::TransportConfig, ConfigError, ConnectionId};

/// A `quiche` configuration shared by every connection of one endpoint
pub struct QuicheEngine {
    config: quiche::Config,
    keylog: Option<PathBuf>,
}

impl QuicheEngine {
    /// Server-side engine presenting the certificate chain at `cert` with the key at `key`
    pub fn server(transport: &TransportConfig, cert: &Path, key: &Path) -> Result<Self, ConfigError> {
        let mut config = base_config(transport)?;
        let cert_str = path_str(cert)?;
        config
            .load_cert_chain_from_pem_file(cert_str)
            .map_err(|e| ConfigError::Certificate {
                path: cert.to_owned(),
                reason: e.to_string(),
            })?;
        let key_str = path_str(key)?;
        config
            .load_priv_key_from_pem_file(key_str)
            .map_err(|e| ConfigError::PrivateKey {
                path: key.to_owned(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            config,
            keylog: transport.keylog.clone(),
        })
    }

    /// Client-side engine
    pub fn client(transport: &TransportConfig) -> Result<Self, ConfigError> {
        let mut config = base_config(transport)?;
        config.verify_peer(transport.verify_peer);
        Ok(Self {
            config,
            keylog: transport.keylog.clone(),
        })
    }

    fn attach_keylog(&self, conn: &mut quiche::Connection) {
        let Some(path) = &self.keylog else {
            return;
        };
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => conn.set_keylog(Box::new(file)),
            Err(e) => warn!("failed to open key log {}: {e}", path.display()),
        }
    }
}

impl std::fmt::Debug for QuicheEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuicheEngine")
            .field("keylog", &self.keylog)
            .finish_non_exhaustive()
    }
}

fn base_config(transport: &TransportConfig) -> Result<quiche::Config, ConfigError> {
    let mut config = quiche::Config::new(quiche::PROTOCOL_VERSION).map_err(engine_config)?;
    let protos = transport
        .application_protos
        .iter()
        .map(|p| p.as_slice())
        .collect::<Vec<_>>();
    config
        .set_application_protos(&protos)
        .map_err(engine_config)?;
    config.set_max_idle_timeout(duration_ms(transport.max_idle_timeout));
    config.set_max_recv_udp_payload_size(transport.max_recv_udp_payload_size);
    config.set_max_send_udp_payload_size(transport.max_send_udp_payload_size);
    config.set_initial_max_data(transport.initial_max_data);
    config.set_initial_max_stream_data_bidi_local(transport.initial_max_stream_data_bidi_local);
    config.set_initial_max_stream_data_bidi_remote(transport.initial_max_stream_data_bidi_remote);
    config.set_initial_max_stream_data_uni(transport.initial_max_stream_data_uni);
    config.set_initial_max_streams_bidi(transport.initial_max_streams_bidi);
    config.set_initial_max_streams_uni(transport.initial_max_streams_uni);
    config.set_disable_active_migration(transport.disable_active_migration);
    config
        .set_cc_algorithm_name(&transport.congestion_control)
        .map_err(engine_config)?;
    if transport.keylog.is_some() {
        config.log_keys();
    }
    Ok(config)
}

fn engine_config(e: quiche::Error) -> ConfigError {
    ConfigError::Engine(e.to_string())
}

fn path_str(path: &Path) -> Result<&str, ConfigError> {
    path.to_str()
        .ok_or_else(|| ConfigError::InvalidPath(path.to_owned()))
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl Engine for QuicheEngine {
    type Connection = QuicheConnection;

    fn parse_header(&self, datagram: &mut [u8], dcid_len: usize) -> Result<Header, EngineError> {
        let hdr = quiche::Header::from_slice(datagram, dcid_len).map_err(convert)?;
        Ok(Header {
            ty: match hdr.ty {
                quiche::Type::Initial => PacketType::Initial,
                quiche::Type::Retry => PacketType::Retry,
                quiche::Type::Handshake => PacketType::Handshake,
                quiche::Type::ZeroRTT => PacketType::ZeroRtt,
                quiche::Type::Short => PacketType::Short,
                quiche::Type::VersionNegotiation => PacketType::VersionNegotiation,
            },
            version: hdr.version,
            dcid: Bytes::copy_from_slice(&hdr.dcid),
            scid: Bytes::copy_from_slice(&hdr.scid),
            token: hdr.token.map(Bytes::from),
        })
    }

    fn is_version_supported(&self, version: u32) -> bool {
        quiche::version_is_supported(version)
    }

    fn build_version_negotiation(
        &self,
        scid: &[u8],
        dcid: &[u8],
        out: &mut [u8],
    ) -> Result<usize, EngineError> {
        let scid = quiche::ConnectionId::from_ref(scid);
        let dcid = quiche::ConnectionId::from_ref(dcid);
        quiche::negotiate_version(&scid, &dcid, out).map_err(convert)
    }

    fn build_retry(
        &self,
        scid: &[u8],
        dcid: &[u8],
        new_cid: &ConnectionId,
        token: &[u8],
        version: u32,
        out: &mut [u8],
    ) -> Result<usize, EngineError> {
        let scid = quiche::ConnectionId::from_ref(scid);
        let dcid = quiche::ConnectionId::from_ref(dcid);
        let new_scid = quiche::ConnectionId::from_ref(new_cid);
        quiche::retry(&scid, &dcid, &new_scid, token, version, out).map_err(convert)
    }

    fn accept(
        &mut self,
        scid: &ConnectionId,
        odcid: &[u8],
        local: SocketAddr,
        peer: SocketAddr,
    ) -> Result<QuicheConnection, EngineError> {
        let scid = quiche::ConnectionId::from_ref(scid);
        let odcid = quiche::ConnectionId::from_ref(odcid);
        let mut conn =
            quiche::accept(&scid, Some(&odcid), local, peer, &mut self.config).map_err(convert)?;
        self.attach_keylog(&mut conn);
        Ok(QuicheConnection(conn))
    }

    fn connect(
        &mut self,
        server_name: Option<&str>,
        scid: &ConnectionId,
        local: SocketAddr,
        peer: SocketAddr,
    ) -> Result<QuicheConnection, EngineError> {
        let scid = quiche::ConnectionId::from_ref(scid);
        let mut conn =
            quiche::connect(server_name, &scid, local, peer, &mut self.config).map_err(convert)?;
        self.attach_keylog(&mut conn);
        Ok(QuicheConnection(conn))
    }
}

/// A `quiche` connection
pub struct QuicheConnection(quiche::Connection);

impl std::fmt::Debug for QuicheConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuicheConnection")
            .field("trace_id", &self.0.trace_id())
            .finish()
    }
}

impl EngineConnection for QuicheConnection {
    type Readable = quiche::StreamIter;

    fn recv(&mut self, datagram: &mut [u8], info: RecvInfo) -> Result<usize, EngineError> {
        self.0
            .recv(
                datagram,
                quiche::RecvInfo {
                    from: info.from,
                    to: info.to,
                },
            )
            .map_err(convert)
    }

    fn is_established(&self) -> bool {
        self.0.is_established()
    }

    fn readable_streams(&self) -> quiche::StreamIter {
        self.0.readable()
    }

    fn stream_recv(
        &mut self,
        stream_id: u64,
        out: &mut [u8],
    ) -> Result<Option<(usize, bool)>, EngineError> {
        match self.0.stream_recv(stream_id, out) {
            Ok(read) => Ok(Some(read)),
            Err(quiche::Error::Done) => Ok(None),
            Err(e) => Err(convert(e)),
        }
    }

    fn stream_send(&mut self, stream_id: u64, data: &[u8], fin: bool) -> Result<usize, EngineError> {
        match self.0.stream_send(stream_id, data, fin) {
            Ok(written) => Ok(written),
            Err(quiche::Error::Done) => Ok(0),
            Err(e) => Err(convert(e)),
        }
    }

    fn next_outgoing_packet(
        &mut self,
        out: &mut [u8],
    ) -> Result<Option<(usize, SendInfo)>, EngineError> {
        match self.0.send(out) {
            Ok((len, info)) => Ok(Some((
                len,
                SendInfo {
                    to: info.to,
                    at: Some(info.at),
                },
            ))),
            Err(quiche::Error::Done) => Ok(None),
            Err(e) => Err(convert(e)),
        }
    }

    fn next_timeout(&self) -> Option<Duration> {
        self.0.timeout()
    }

    fn on_timeout(&mut self) {
        self.0.on_timeout()
    }

    fn is_closed(&self) -> bool {
        self.0.is_closed()
    }

    fn close(&mut self, app: bool, error_code: u64, reason: &[u8]) -> Result<(), EngineError> {
        match self.0.close(app, error_code, reason) {
            Ok(()) | Err(quiche::Error::Done) => Ok(()),
            Err(e) => Err(convert(e)),
        }
    }

    fn stats(&self) -> ConnectionStats {
        let stats = self.0.stats();
        ConnectionStats {
            recv: stats.recv,
            sent: stats.sent,
            lost: stats.lost,
            rtt: self.0.path_stats().next().map(|path| path.rtt),
        }
    }
}

fn convert(e: quiche::Error) -> EngineError {
    use quiche::Error::*;
    match e {
        BufferTooShort => EngineError::BufferTooShort,
        InvalidPacket | InvalidFrame => EngineError::InvalidPacket,
        UnknownVersion => EngineError::UnknownVersion,
        InvalidState => EngineError::InvalidState,
        CryptoFail => EngineError::CryptoFail,
        TlsFail => EngineError::TlsFail,
        StreamStopped(id) | StreamReset(id) | InvalidStreamState(id) => {
            EngineError::StreamClosed(id)
        }
        other => EngineError::Other(other.to_string()),
    }
}
