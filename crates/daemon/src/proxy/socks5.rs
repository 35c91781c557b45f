/// SOCKS5 handshake for the local proxy
///
/// Username/password authentication (RFC 1929) is the only method offered
/// and CONNECT is the only command served. The handshake stops after the
/// request is parsed; the caller sends the final reply.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use veilport_common::{find_matching, Credentials};

/// SOCKS5 protocol constants
const SOCKS_VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;
const USER_PASS_AUTH: u8 = 0x02;
const NO_ACCEPTABLE_METHODS: u8 = 0xFF;
const CONNECT_COMMAND: u8 = 0x01;
const IPV4_ADDRESS: u8 = 0x01;
const DOMAIN_NAME: u8 = 0x03;
const IPV6_ADDRESS: u8 = 0x04;

const AUTH_SUCCESS: u8 = 0x00;
const AUTH_FAILURE: u8 = 0x01;

/// Reply codes
pub const SUCCESS: u8 = 0x00;
pub const GENERAL_FAILURE: u8 = 0x01;
pub const COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// Destination requested by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl TargetAddr {
    pub fn host(&self) -> String {
        match self {
            TargetAddr::Ip(addr) => addr.ip().to_string(),
            TargetAddr::Domain(domain, _) => domain.clone(),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

/// Outcome of a successful negotiation
#[derive(Debug, Clone)]
pub struct Handshake {
    pub user: String,
    pub target: TargetAddr,
}

/// Run the method selection, authentication and request phases
pub async fn negotiate<S>(stream: &mut S, auths: &[Credentials]) -> Result<Handshake, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // 1. Method selection
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(HandshakeError::UnsupportedVersion(header[0]));
    }

    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&USER_PASS_AUTH) {
        stream
            .write_all(&[SOCKS_VERSION, NO_ACCEPTABLE_METHODS])
            .await?;
        return Err(HandshakeError::NoAcceptableMethod);
    }
    stream.write_all(&[SOCKS_VERSION, USER_PASS_AUTH]).await?;

    // 2. Username/password sub-negotiation
    let mut version = [0u8; 1];
    stream.read_exact(&mut version).await?;
    if version[0] != AUTH_VERSION {
        return Err(HandshakeError::UnsupportedVersion(version[0]));
    }
    let user = read_string(stream).await?;
    let pass = read_string(stream).await?;

    if find_matching(auths, &user, &pass).is_none() {
        stream.write_all(&[AUTH_VERSION, AUTH_FAILURE]).await?;
        return Err(HandshakeError::AuthenticationFailed(user));
    }
    stream.write_all(&[AUTH_VERSION, AUTH_SUCCESS]).await?;

    // 3. Request
    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    if request[0] != SOCKS_VERSION {
        return Err(HandshakeError::UnsupportedVersion(request[0]));
    }

    let command = request[1];
    let address_type = request[3];

    if command != CONNECT_COMMAND {
        send_reply(stream, COMMAND_NOT_SUPPORTED).await?;
        return Err(HandshakeError::UnsupportedCommand(command));
    }

    let target = match address_type {
        IPV4_ADDRESS => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            let port = stream.read_u16().await?;
            TargetAddr::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(addr)), port))
        }
        DOMAIN_NAME => {
            let domain = read_string(stream).await?;
            let port = stream.read_u16().await?;
            TargetAddr::Domain(domain, port)
        }
        IPV6_ADDRESS => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            let port = stream.read_u16().await?;
            TargetAddr::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(addr)), port))
        }
        _ => {
            send_reply(stream, ADDRESS_TYPE_NOT_SUPPORTED).await?;
            return Err(HandshakeError::UnsupportedAddressType(address_type));
        }
    };

    Ok(Handshake { user, target })
}

/// Length-prefixed string used by the auth and domain fields
async fn read_string<S>(stream: &mut S) -> Result<String, HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let len = stream.read_u8().await?;
    let mut bytes = vec![0u8; len as usize];
    stream.read_exact(&mut bytes).await?;
    String::from_utf8(bytes).map_err(|_| HandshakeError::InvalidString)
}

/// Send a SOCKS5 reply to the client
pub async fn send_reply<S>(stream: &mut S, reply_code: u8) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    // Reply format: VER | REP | RSV | ATYP | BND.ADDR | BND.PORT
    let reply = [
        SOCKS_VERSION,
        reply_code,
        0x00, // Reserved
        IPV4_ADDRESS,
        0, 0, 0, 0, // Bind address (0.0.0.0)
        0, 0, // Bind port (0)
    ];

    stream.write_all(&reply).await
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("Client offered no acceptable auth method")]
    NoAcceptableMethod,

    #[error("Authentication failed for user {0:?}")]
    AuthenticationFailed(String),

    #[error("Unsupported command: {0}")]
    UnsupportedCommand(u8),

    #[error("Unsupported address type: {0}")]
    UnsupportedAddressType(u8),

    #[error("Invalid UTF-8 in handshake field")]
    InvalidString,

    #[error(transparent)]
    Io(#[from] io::Error),
}
