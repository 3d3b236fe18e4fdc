use crate::ReplyError;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::ErrorKind as IOErrorKind;
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::timeout;

/// Easy to destructure bytes buffers by naming each fields:
///
/// # Examples (before)
///
/// ```ignore
/// let mut buf = [0u8; 2];
/// stream.read_exact(&mut buf).await?;
/// let [version, method_len] = buf;
///
/// assert_eq!(version, 0x05);
/// ```
///
/// # Examples (after)
///
/// ```ignore
/// let [version, method_len] = read_exact!(stream, [0u8; 2]);
///
/// assert_eq!(version, 0x05);
/// ```
#[macro_export]
macro_rules! read_exact {
    ($stream: expr, $array: expr) => {{
        let mut x = $array;
        $stream.read_exact(&mut x).await.map(|_| x)
    }};
}

/// Outcome of an outbound connection attempt, carrying enough detail to pick
/// the RFC 1928 reply code the client should see.
#[derive(thiserror::Error, Debug)]
pub enum ConnectError {
    #[error("Connection timed out")]
    ConnectionTimeout,
    #[error("Connection refused: {0}")]
    ConnectionRefused(#[source] io::Error),
    #[error("Network unreachable: {0}")]
    NetworkUnreachable(#[source] io::Error),
    #[error("Host unreachable: {0}")]
    HostUnreachable(#[source] io::Error),
    #[error("Address family not supported: {0}")]
    AddressFamilyNotSupported(#[source] io::Error),
    #[error("Other i/o error: {0}")]
    Other(#[source] io::Error),
}

impl ConnectError {
    #[rustfmt::skip]
    pub fn to_reply_error(&self) -> ReplyError {
        match self {
            ConnectError::ConnectionTimeout             => ReplyError::TtlExpired,
            ConnectError::ConnectionRefused(_)          => ReplyError::ConnectionRefused,
            ConnectError::NetworkUnreachable(_)         => ReplyError::NetworkUnreachable,
            ConnectError::HostUnreachable(_)            => ReplyError::HostUnreachable,
            ConnectError::AddressFamilyNotSupported(_)  => ReplyError::AddressTypeNotSupported,
            ConnectError::Other(_)                      => ReplyError::GeneralFailure,
        }
    }
}

impl From<io::Error> for ConnectError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            IOErrorKind::ConnectionRefused => ConnectError::ConnectionRefused(e),
            IOErrorKind::TimedOut => ConnectError::ConnectionTimeout,
            IOErrorKind::NetworkUnreachable | IOErrorKind::NetworkDown => {
                ConnectError::NetworkUnreachable(e)
            }
            IOErrorKind::HostUnreachable => ConnectError::HostUnreachable(e),
            IOErrorKind::Unsupported => ConnectError::AddressFamilyNotSupported(e),
            _ => ConnectError::Other(e),
        }
    }
}

pub async fn tcp_connect_with_timeout(
    addr: SocketAddr,
    request_timeout_s: u64,
    bind_addr: Option<IpAddr>,
) -> Result<TcpStream, ConnectError> {
    let fut = tcp_connect(addr, bind_addr);
    match timeout(Duration::from_secs(request_timeout_s), fut).await {
        Ok(result) => result,
        Err(_) => Err(ConnectError::ConnectionTimeout),
    }
}

/// Open a stream socket of the target's family, optionally bound to a local
/// address, and connect it.
pub async fn tcp_connect(
    addr: SocketAddr,
    bind_addr: Option<IpAddr>,
) -> Result<TcpStream, ConnectError> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(ConnectError::from)?;

    if let Some(ip) = bind_addr {
        socket
            .bind(SocketAddr::new(ip, 0))
            .map_err(ConnectError::from)?;
    }

    socket.connect(addr).await.map_err(ConnectError::from)
}
