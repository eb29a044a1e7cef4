use std::time::Duration;

use bytes::BytesMut;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    time::timeout,
};
use tokio_util::codec::Decoder;
use tokio_xmpp::{
    connect::{AsyncReadAndWrite, ServerConnector},
    parsers::{jid::Jid, ns},
    starttls::{error::Error as StartTlsError, ServerConfig},
    tcp::{error::Error as TcpConnectError, TcpServerConnector},
    xmpp_stream::XMPPStream,
    Packet, XmppCodec,
};
use tracing::debug;

use crate::error::ConnectionError;

/// Dial parameters for one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub jid: String,
    pub password: String,
    pub server: Option<String>,
    pub port: Option<u16>,
    pub timeout_seconds: u32,
}

/// The session core's view of a connection.
///
/// `connect` yields an authenticated stream; `connect_unauthenticated`
/// stops before SASL, for in-band account registration. Frames passed to
/// `send` and returned by `recv` are whole serialized stanzas.
pub trait XmppTransport: Send + 'static {
    fn connect(
        config: &ConnectionConfig,
    ) -> impl Future<Output = Result<Self, ConnectionError>> + Send
    where
        Self: Sized;

    fn connect_unauthenticated(
        config: &ConnectionConfig,
    ) -> impl Future<Output = Result<Self, ConnectionError>> + Send
    where
        Self: Sized;

    fn send(&mut self, data: &[u8]) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    fn recv(&mut self) -> impl Future<Output = Result<Vec<u8>, ConnectionError>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<(), ConnectionError>> + Send;
}

const DEFAULT_XMPP_PORT: u16 = 5222;
const INSECURE_TCP_ENV: &str = "ALUMCHAT_XMPP_INSECURE_TCP";
const MIN_TIMEOUT_SECONDS: u64 = 1;
const RECV_BUFFER_SIZE: usize = 16 * 1024;
// The codec expects a stream header before stanzas; the authenticated
// stream already consumed the real one, so feed it a synthetic header.
const STREAM_PRIME: &str =
    "<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>";

/// TCP + STARTTLS transport over tokio-xmpp.
pub struct NativeTcpTransport {
    stream: Box<dyn AsyncReadAndWrite>,
    io_timeout: Duration,
    inbound_codec: XmppCodec,
    inbound_buffer: BytesMut,
}

fn connect_timeout(config: &ConnectionConfig) -> Duration {
    Duration::from_secs(u64::from(config.timeout_seconds).max(MIN_TIMEOUT_SECONDS))
}

fn parse_jid(jid: &str) -> Result<Jid, ConnectionError> {
    jid.parse::<Jid>().map_err(|error| {
        ConnectionError::TransportError(format!("invalid JID '{jid}' in config: {error}"))
    })
}

fn to_server_config(config: &ConnectionConfig) -> ServerConfig {
    match &config.server {
        Some(host) => ServerConfig::Manual {
            host: host.clone(),
            port: config.port.unwrap_or(DEFAULT_XMPP_PORT),
        },
        None => ServerConfig::UseSrv,
    }
}

fn map_starttls_error(error: StartTlsError) -> ConnectionError {
    let message = error.to_string();
    let lower = message.to_ascii_lowercase();
    if lower.contains("dns")
        || lower.contains("resolve")
        || lower.contains("srv")
        || lower.contains("idna")
    {
        ConnectionError::DnsResolutionFailed(message)
    } else if lower.contains("tls")
        || lower.contains("certificate")
        || lower.contains("handshake")
        || lower.contains("no tls")
    {
        ConnectionError::TlsHandshakeFailed(message)
    } else {
        ConnectionError::TransportError(message)
    }
}

fn map_tcp_error(error: TcpConnectError) -> ConnectionError {
    let message = error.to_string();
    let lower = message.to_ascii_lowercase();
    if lower.contains("dns") || lower.contains("resolve") || lower.contains("srv") {
        ConnectionError::DnsResolutionFailed(message)
    } else {
        ConnectionError::TransportError(message)
    }
}

fn map_io_error(error: std::io::Error) -> ConnectionError {
    ConnectionError::TransportError(error.to_string())
}

fn insecure_tcp_requested() -> bool {
    std::env::var(INSECURE_TCP_ENV)
        .map(|value| {
            let normalized = value.trim().to_ascii_lowercase();
            !normalized.is_empty()
                && normalized != "0"
                && normalized != "false"
                && normalized != "no"
                && normalized != "off"
        })
        .unwrap_or(false)
}

fn insecure_tcp_target(config: &ConnectionConfig, jid: &Jid) -> String {
    let host = config
        .server
        .clone()
        .unwrap_or_else(|| jid.domain().to_string());
    let port = config.port.unwrap_or(DEFAULT_XMPP_PORT);
    format!("{host}:{port}")
}

fn prime_inbound_codec() -> XmppCodec {
    let mut codec = XmppCodec::new();
    let mut bootstrap = BytesMut::from(STREAM_PRIME.as_bytes());
    let _ = codec.decode(&mut bootstrap);
    codec
}

fn serialize_packet(packet: Packet) -> Result<Option<Vec<u8>>, ConnectionError> {
    match packet {
        Packet::Stanza(element) => {
            let mut payload = Vec::new();
            element
                .write_to(&mut payload)
                .map_err(|error| ConnectionError::TransportError(error.to_string()))?;
            Ok(Some(payload))
        }
        Packet::Text(_) => Ok(None),
        Packet::StreamStart(_) => Ok(None),
        Packet::StreamEnd => Err(ConnectionError::TransportError(
            "XMPP transport closed by peer".to_string(),
        )),
    }
}

fn map_authentication_error(error: ConnectionError) -> ConnectionError {
    match error {
        ConnectionError::AuthenticationFailed(_) => error,
        other => ConnectionError::StreamError(format!("SASL negotiation failed: {other}")),
    }
}

async fn authenticate_stream<S>(
    xmpp_stream: XMPPStream<S>,
    username: &str,
    password: &str,
    io_timeout: Duration,
) -> Result<Box<dyn AsyncReadAndWrite>, ConnectionError>
where
    S: AsyncReadAndWrite + 'static,
{
    let authenticated = timeout(
        io_timeout,
        crate::sasl::authenticate(xmpp_stream, username, password),
    )
    .await
    .map_err(|_| ConnectionError::Timeout)?
    .map_err(map_authentication_error)?;

    Ok(Box::new(authenticated))
}

async fn starttls_stream(
    config: &ConnectionConfig,
    jid: &Jid,
    io_timeout: Duration,
) -> Result<XMPPStream<impl AsyncReadAndWrite + 'static>, ConnectionError> {
    let server_config = to_server_config(config);
    timeout(io_timeout, server_config.connect(jid, ns::JABBER_CLIENT))
        .await
        .map_err(|_| ConnectionError::Timeout)?
        .map_err(map_starttls_error)
}

async fn insecure_tcp_stream(
    config: &ConnectionConfig,
    jid: &Jid,
    io_timeout: Duration,
) -> Result<XMPPStream<impl AsyncReadAndWrite + 'static>, ConnectionError> {
    let address = insecure_tcp_target(config, jid);
    debug!(%address, "dialing with insecure TCP (env override)");
    let connector = TcpServerConnector::new(address);
    timeout(io_timeout, connector.connect(jid, ns::JABBER_CLIENT))
        .await
        .map_err(|_| ConnectionError::Timeout)?
        .map_err(map_tcp_error)
}

impl NativeTcpTransport {
    fn from_stream(stream: Box<dyn AsyncReadAndWrite>, io_timeout: Duration) -> Self {
        Self {
            stream,
            io_timeout,
            inbound_codec: prime_inbound_codec(),
            inbound_buffer: BytesMut::with_capacity(RECV_BUFFER_SIZE),
        }
    }
}

impl XmppTransport for NativeTcpTransport {
    async fn connect(config: &ConnectionConfig) -> Result<Self, ConnectionError> {
        let jid = parse_jid(&config.jid)?;
        let io_timeout = connect_timeout(config);

        let username = jid
            .node()
            .map(|node| node.to_string())
            .ok_or_else(|| {
                ConnectionError::AuthenticationFailed(format!(
                    "JID '{}' has no local part for SASL authentication",
                    config.jid
                ))
            })?;

        let stream = if insecure_tcp_requested() {
            let xmpp_stream = insecure_tcp_stream(config, &jid, io_timeout).await?;
            authenticate_stream(xmpp_stream, &username, &config.password, io_timeout).await?
        } else {
            let xmpp_stream = starttls_stream(config, &jid, io_timeout).await?;
            authenticate_stream(xmpp_stream, &username, &config.password, io_timeout).await?
        };

        Ok(Self::from_stream(stream, io_timeout))
    }

    async fn connect_unauthenticated(config: &ConnectionConfig) -> Result<Self, ConnectionError> {
        let jid = parse_jid(&config.jid)?;
        let io_timeout = connect_timeout(config);

        let stream: Box<dyn AsyncReadAndWrite> = if insecure_tcp_requested() {
            Box::new(insecure_tcp_stream(config, &jid, io_timeout).await?.into_inner())
        } else {
            Box::new(starttls_stream(config, &jid, io_timeout).await?.into_inner())
        };

        Ok(Self::from_stream(stream, io_timeout))
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        if data.is_empty() {
            return Ok(());
        }

        timeout(self.io_timeout, self.stream.write_all(data))
            .await
            .map_err(|_| ConnectionError::Timeout)?
            .map_err(map_io_error)?;

        timeout(self.io_timeout, self.stream.flush())
            .await
            .map_err(|_| ConnectionError::Timeout)?
            .map_err(map_io_error)?;

        Ok(())
    }

    async fn recv(&mut self) -> Result<Vec<u8>, ConnectionError> {
        loop {
            if let Some(packet) = self
                .inbound_codec
                .decode(&mut self.inbound_buffer)
                .map_err(|error| ConnectionError::TransportError(error.to_string()))?
            {
                if let Some(payload) = serialize_packet(packet)? {
                    return Ok(payload);
                }
            }

            let mut chunk = vec![0_u8; RECV_BUFFER_SIZE];
            let bytes_read = self
                .stream
                .read(&mut chunk)
                .await
                .map_err(map_io_error)?;

            if bytes_read == 0 {
                return Err(ConnectionError::TransportError(
                    "XMPP transport closed by peer".to_string(),
                ));
            }

            self.inbound_buffer.extend_from_slice(&chunk[..bytes_read]);
        }
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        timeout(self.io_timeout, self.stream.shutdown())
            .await
            .map_err(|_| ConnectionError::Timeout)?
            .map_err(map_io_error)?;
        Ok(())
    }
}
