use crate::consts;
use crate::read_exact;
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::lookup_host;

#[derive(thiserror::Error, Debug)]
pub enum AddrError {
    #[error("DNS Resolution failed: {0}")]
    DNSResolutionFailed(#[source] io::Error),
    #[error("DNS returned no appropriate records")]
    NoDNSRecords,
    #[error("Domain length {0} exceeded maximum")]
    DomainLenTooLong(usize),
    #[error("Can't read IPv4: {0}")]
    IPv4Unreadable(#[source] io::Error),
    #[error("Can't read IPv6: {0}")]
    IPv6Unreadable(#[source] io::Error),
    #[error("Can't read port number: {0}")]
    PortNumberUnreadable(#[source] io::Error),
    #[error("Can't read domain len: {0}")]
    DomainLenUnreadable(#[source] io::Error),
    #[error("Can't read domain content: {0}")]
    DomainContentUnreadable(#[source] io::Error),
    #[error("Malformed UTF-8")]
    Utf8(#[source] std::string::FromUtf8Error),
    #[error("Unknown address type")]
    IncorrectAddressType,
}

/// A description of a connection target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetAddr {
    /// Connect to an IP address.
    Ip(SocketAddr),
    /// Connect to a fully qualified domain name. The name is carried as sent
    /// by the client and resolved server-side.
    Domain(String, u16),
}

impl TargetAddr {
    /// Resolve to a concrete socket address, consulting DNS for domain
    /// targets. IP targets resolve to themselves.
    pub async fn resolve(&self) -> Result<SocketAddr, AddrError> {
        match self {
            TargetAddr::Ip(addr) => Ok(*addr),
            TargetAddr::Domain(domain, port) => {
                debug!("Attempt to DNS resolve the domain {}...", domain);

                let socket_addr = lookup_host((&domain[..], *port))
                    .await
                    .map_err(AddrError::DNSResolutionFailed)?
                    .next()
                    .ok_or(AddrError::NoDNSRecords)?;
                debug!("domain name resolved to {}", socket_addr);

                Ok(socket_addr)
            }
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }

    /// Serialize as an RFC 1928 address block: ATYP, address bytes, port in
    /// network order.
    pub fn to_be_bytes(&self) -> Result<Vec<u8>, AddrError> {
        let mut buf = vec![];
        match self {
            TargetAddr::Ip(SocketAddr::V4(addr)) => {
                buf.push(consts::SOCKS5_ADDR_TYPE_IPV4);
                buf.extend_from_slice(&addr.ip().octets());
                buf.extend_from_slice(&addr.port().to_be_bytes());
            }
            TargetAddr::Ip(SocketAddr::V6(addr)) => {
                buf.push(consts::SOCKS5_ADDR_TYPE_IPV6);
                buf.extend_from_slice(&addr.ip().octets());
                buf.extend_from_slice(&addr.port().to_be_bytes());
            }
            TargetAddr::Domain(domain, port) => {
                if domain.len() > 255 {
                    return Err(AddrError::DomainLenTooLong(domain.len()));
                }
                buf.push(consts::SOCKS5_ADDR_TYPE_DOMAIN_NAME);
                buf.push(domain.len() as u8);
                buf.extend_from_slice(domain.as_bytes());
                buf.extend_from_slice(&port.to_be_bytes());
            }
        }
        Ok(buf)
    }
}

impl From<SocketAddr> for TargetAddr {
    fn from(addr: SocketAddr) -> Self {
        TargetAddr::Ip(addr)
    }
}

impl fmt::Display for TargetAddr {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            TargetAddr::Ip(ref addr) => write!(f, "{}", addr),
            TargetAddr::Domain(ref addr, ref port) => write!(f, "{}:{}", addr, port),
        }
    }
}

#[derive(Debug)]
enum Addr {
    V4([u8; 4]),
    V6([u8; 16]),
    Domain(String),
}

/// Read an RFC 1928 address block (sans the ATYP byte, already consumed by
/// the caller) from any `AsyncRead` source. Byte slices implement
/// `AsyncRead`, so this parses both live streams and datagram buffers.
pub async fn read_address<T: AsyncRead + Unpin>(
    stream: &mut T,
    atyp: u8,
) -> Result<TargetAddr, AddrError> {
    let addr = match atyp {
        consts::SOCKS5_ADDR_TYPE_IPV4 => {
            Addr::V4(read_exact!(stream, [0u8; 4]).map_err(AddrError::IPv4Unreadable)?)
        }
        consts::SOCKS5_ADDR_TYPE_IPV6 => {
            Addr::V6(read_exact!(stream, [0u8; 16]).map_err(AddrError::IPv6Unreadable)?)
        }
        consts::SOCKS5_ADDR_TYPE_DOMAIN_NAME => {
            let len = read_exact!(stream, [0]).map_err(AddrError::DomainLenUnreadable)?[0];
            let domain = read_exact!(stream, vec![0u8; len as usize])
                .map_err(AddrError::DomainContentUnreadable)?;
            let domain = String::from_utf8(domain).map_err(AddrError::Utf8)?;

            Addr::Domain(domain)
        }
        _ => return Err(AddrError::IncorrectAddressType),
    };

    let port = read_exact!(stream, [0u8; 2]).map_err(AddrError::PortNumberUnreadable)?;
    let port = u16::from_be_bytes(port);

    Ok(match addr {
        Addr::V4(ip) => TargetAddr::Ip(SocketAddr::from((Ipv4Addr::from(ip), port))),
        Addr::V6(ip) => TargetAddr::Ip(SocketAddr::from((Ipv6Addr::from(ip), port))),
        Addr::Domain(domain) => TargetAddr::Domain(domain, port),
    })
}
