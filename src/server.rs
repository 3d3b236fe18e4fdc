use crate::read_exact;
use crate::util::stream::{tcp_connect_with_timeout, ConnectError};
use crate::util::target_addr::{read_address, AddrError, TargetAddr};
use crate::{
    consts, new_udp_header, parse_udp_request, ReplyError, Result, Socks5Command, SocksError,
};
use anyhow::Context;
use parking_lot::{Mutex, RwLock};
use std::future::poll_fn;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::task::{Context as AsyncContext, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

/// Copy buffer of the TCP relay, per direction.
const TRANSFER_BUFFER_SIZE: usize = 0x2000;

/// Receive buffer of the UDP relay, large enough for any datagram.
const UDP_BUFFER_SIZE: usize = 0x10000;

pub trait Authentication: Send + Sync {
    fn authenticate(&self, username: &[u8], password: &[u8]) -> bool;
}

/// Basic user/pass auth method provided.
///
/// Credentials are raw bytes: an embedded NUL is significant and must not
/// truncate the comparison.
pub struct SimpleUserPassword {
    username: Vec<u8>,
    password: Vec<u8>,
}

impl SimpleUserPassword {
    pub fn new<U: Into<Vec<u8>>, P: Into<Vec<u8>>>(username: U, password: P) -> Self {
        SimpleUserPassword {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl Authentication for SimpleUserPassword {
    fn authenticate(&self, username: &[u8], password: &[u8]) -> bool {
        username == &self.username[..] && password == &self.password[..]
    }
}

pub struct Config {
    request_timeout: u64,
    auth: Option<Arc<dyn Authentication>>,
    auth_once: bool,
    outbound_bind: Option<IpAddr>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            request_timeout: 10,
            auth: None,
            auth_once: false,
            outbound_bind: None,
        }
    }
}

impl Config {
    /// In seconds
    pub fn set_request_timeout(&mut self, n: u64) -> &mut Self {
        self.request_timeout = n;
        self
    }

    /// Enable authentication
    /// 'static lifetime for Authentication avoid us to use `dyn Authentication`
    /// and set the Arc before calling the function.
    pub fn set_authentication<T: Authentication + 'static>(&mut self, authentication: T) -> &mut Self {
        self.auth = Some(Arc::new(authentication));
        self
    }

    /// Whitelist a client ip after its first successful user/pass
    /// authentication; later connections from that ip may use the no-auth
    /// method. Requires authentication to be set.
    pub fn set_auth_once(&mut self, enabled: bool) -> &mut Self {
        self.auth_once = enabled;
        self
    }

    /// Bind outgoing connections to this local address.
    pub fn set_outbound_bind(&mut self, addr: Option<IpAddr>) -> &mut Self {
        self.outbound_bind = addr;
        self
    }
}

/// Authentication method retained for a client after evaluating its offer
/// against the server policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    None,
    Password,
    NotAcceptable,
}

impl AuthMethod {
    #[inline]
    #[rustfmt::skip]
    fn as_u8(self) -> u8 {
        match self {
            AuthMethod::None          => consts::SOCKS5_AUTH_METHOD_NONE,
            AuthMethod::Password      => consts::SOCKS5_AUTH_METHOD_PASSWORD,
            AuthMethod::NotAcceptable => consts::SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE,
        }
    }
}

#[derive(Default)]
struct TrafficCounters {
    upload: u64,
    download: u64,
}

/// Process-wide byte totals: upload is client -> target traffic, download is
/// target -> client, summed over all sessions. Counters only ever grow.
pub struct TrafficStats {
    counters: Mutex<TrafficCounters>,
    reporter: Option<Box<dyn Fn(u64, u64) + Send + Sync>>,
}

impl TrafficStats {
    fn new(reporter: Option<Box<dyn Fn(u64, u64) + Send + Sync>>) -> Self {
        TrafficStats {
            counters: Mutex::new(TrafficCounters::default()),
            reporter,
        }
    }

    pub fn record(&self, upload: u64, download: u64) {
        let mut counters = self.counters.lock();
        counters.upload += upload;
        counters.download += download;
        // the reporter runs inside the lock and must not block
        if let Some(reporter) = &self.reporter {
            reporter(counters.upload, counters.download);
        }
    }

    pub fn totals(&self) -> (u64, u64) {
        let counters = self.counters.lock();
        (counters.upload, counters.download)
    }
}

/// Shared state of one server process: the configuration, the auth-once ip
/// whitelist and the traffic counters. Constructed once at startup and
/// passed by `Arc` into every session.
pub struct ServerContext {
    config: Config,
    whitelist: RwLock<Vec<IpAddr>>,
    stats: TrafficStats,
}

impl ServerContext {
    pub fn new(config: Config) -> Self {
        ServerContext {
            config,
            whitelist: RwLock::new(Vec::new()),
            stats: TrafficStats::new(None),
        }
    }

    /// Install a callback invoked with the new totals after every traffic
    /// update. The callback runs under the counters lock: it must not block.
    pub fn with_traffic_reporter<F>(mut self, reporter: F) -> Self
    where
        F: Fn(u64, u64) + Send + Sync + 'static,
    {
        self.stats = TrafficStats::new(Some(Box::new(reporter)));
        self
    }

    pub fn stats(&self) -> &TrafficStats {
        &self.stats
    }

    pub fn whitelist_len(&self) -> usize {
        self.whitelist.read().len()
    }

    fn is_whitelisted(&self, ip: IpAddr) -> bool {
        self.whitelist.read().iter().any(|entry| *entry == ip)
    }

    /// Record an ip that authenticated successfully. Idempotent: the
    /// membership check runs under the exclusive lock, so concurrent
    /// authentications from the same ip insert it once.
    pub fn remember_client(&self, ip: IpAddr) {
        let mut whitelist = self.whitelist.write();
        if !whitelist.iter().any(|entry| *entry == ip) {
            info!("whitelisting {} for future connections", ip);
            whitelist.push(ip);
        }
    }

    /// Pick the authentication method for a client, walking its offered
    /// methods in order:
    ///
    ///   - no-auth is acceptable when no credentials are configured, or when
    ///     auth-once is active and the client ip already authenticated;
    ///   - user/pass is acceptable whenever credentials are configured;
    ///   - anything else leaves the offer unmatched (0xff).
    fn select_method(&self, offered: &[u8], client: IpAddr) -> AuthMethod {
        for &method in offered {
            if method == consts::SOCKS5_AUTH_METHOD_NONE {
                if self.config.auth.is_none() {
                    return AuthMethod::None;
                }
                if self.config.auth_once && self.is_whitelisted(client) {
                    return AuthMethod::None;
                }
            } else if method == consts::SOCKS5_AUTH_METHOD_PASSWORD && self.config.auth.is_some() {
                return AuthMethod::Password;
            }
        }
        AuthMethod::NotAcceptable
    }
}

/// Wraps one accepted client stream and contains the Socks5 protocol
/// implementation: greeting, optional credential sub-negotiation, request
/// dispatch, relay.
pub struct Socks5Socket<T: AsyncRead + AsyncWrite + Unpin> {
    inner: T,
    peer: SocketAddr,
    context: Arc<ServerContext>,
}

impl<T: AsyncRead + AsyncWrite + Unpin> Socks5Socket<T> {
    pub fn new(socket: T, peer: SocketAddr, context: Arc<ServerContext>) -> Self {
        Socks5Socket {
            inner: socket,
            peer,
            context,
        }
    }

    /// Process one client from greeting to teardown. Dropping the socket at
    /// the end closes the connection.
    pub async fn serve(mut self) -> Result<()> {
        let peer = self.peer;
        let result = self.run().await;
        debug!("SOCKS client disconnected: {}", peer);
        result
    }

    async fn run(&mut self) -> Result<()> {
        let method = self.negotiate_method().await?;

        if let AuthMethod::Password = method {
            self.authenticate().await?;
        }

        match self.request().await {
            Ok(()) => Ok(()),
            Err(SocksError::ReplyError(e)) => {
                // If a reply error has been returned, we send it to the client
                self.reply_error(e).await?;
                Err(e.into())
            }
            // if any other error has been detected, we simply end the session
            Err(d) => Err(d),
        }
    }

    /// Read the client's greeting:
    ///
    /// ```text
    ///                    {SOCKS Version, methods-length}
    ///     eg. (non-auth) {5, 2}
    ///     eg. (auth)     {5, 3}
    /// ```
    ///
    /// followed by the list of methods itself.
    async fn read_methods(&mut self) -> Result<Vec<u8>> {
        trace!("Socks5Socket: read_methods()");
        let [version, methods_len] =
            read_exact!(self.inner, [0u8; 2]).context("Can't read methods")?;
        debug!(
            "Handshake headers: [version: {version}, methods len: {len}]",
            version = version,
            len = methods_len,
        );

        if version != consts::SOCKS5_VERSION {
            return Err(SocksError::UnsupportedSocksVersion(version));
        }

        let methods = read_exact!(self.inner, vec![0u8; methods_len as usize])
            .context("Can't get methods.")?;
        debug!("methods supported sent by the client: {:?}", &methods);

        Ok(methods)
    }

    /// Evaluate the greeting against the server policy and reply with the
    /// retained method, `[5, 0xff]` when no offered method is acceptable.
    async fn negotiate_method(&mut self) -> Result<AuthMethod> {
        let methods = self.read_methods().await?;
        let choice = self.context.select_method(&methods, self.peer.ip());

        self.inner
            .write_all(&[consts::SOCKS5_VERSION, choice.as_u8()])
            .await
            .context("Can't reply to method negotiation")?;

        if choice == AuthMethod::NotAcceptable {
            debug!("No acceptable auth method, replied with (0xff)");
            return Err(SocksError::AuthMethodUnacceptable(methods));
        }

        debug!("Reply with method {:?} ({})", choice, choice.as_u8());
        Ok(choice)
    }

    /// RFC 1929 credential sub-negotiation. User and password are byte
    /// strings, zero length included; the verdict is `[1, 0x00]` on success
    /// and `[1, 0x02]` on rejection.
    async fn authenticate(&mut self) -> Result<()> {
        trace!("Socks5Socket: authenticate()");
        let [version, user_len] =
            read_exact!(self.inner, [0u8; 2]).context("Can't read user len")?;

        if version != consts::SOCKS5_AUTH_SUBNEGOTIATION_VERSION {
            self.inner
                .write_all(&[
                    consts::SOCKS5_AUTH_SUBNEGOTIATION_VERSION,
                    consts::SOCKS5_REPLY_GENERAL_FAILURE,
                ])
                .await
                .context("Can't reply subnegotiation version error")?;

            return Err(SocksError::AuthenticationFailed(format!(
                "Unsupported sub-negotiation version {}",
                version
            )));
        }

        let username =
            read_exact!(self.inner, vec![0u8; user_len as usize]).context("Can't get username.")?;

        let [pass_len] = read_exact!(self.inner, [0u8; 1]).context("Can't read pass len")?;
        let password =
            read_exact!(self.inner, vec![0u8; pass_len as usize]).context("Can't get password.")?;

        let auth = self.context.config.auth.as_ref().context("No auth module")?;

        if auth.authenticate(&username, &password) {
            self.inner
                .write_all(&[
                    consts::SOCKS5_AUTH_SUBNEGOTIATION_VERSION,
                    consts::SOCKS5_REPLY_SUCCEEDED,
                ])
                .await
                .context("Can't reply auth success")?;

            if self.context.config.auth_once {
                self.context.remember_client(self.peer.ip());
            }
        } else {
            self.inner
                .write_all(&[
                    consts::SOCKS5_AUTH_SUBNEGOTIATION_VERSION,
                    consts::SOCKS5_REPLY_CONNECTION_NOT_ALLOWED,
                ])
                .await
                .context("Can't reply with auth failure")?;

            warn!(
                "Client authentication failed for user: {}",
                String::from_utf8_lossy(&username)
            );
            return Err(SocksError::AuthenticationRejected(format!(
                "Authentication with username `{}`, rejected.",
                String::from_utf8_lossy(&username)
            )));
        }

        info!(
            "Client authentication successful for user: {}",
            String::from_utf8_lossy(&username)
        );

        Ok(())
    }

    /// Read and dispatch the request:
    ///
    /// ```text
    ///          +----+-----+-------+------+----------+----------+
    ///          |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
    ///          +----+-----+-------+------+----------+----------+
    ///          | 1  |  1  |   1   |  1   | Variable |    2     |
    ///          +----+-----+-------+------+----------+----------+
    /// ```
    ///
    async fn request(&mut self) -> Result<()> {
        let [version, cmd, rsv, address_type] =
            read_exact!(self.inner, [0u8; 4]).context("Malformed request")?;
        debug!(
            "Request: [version: {version}, command: {cmd}, rsv: {rsv}, address_type: {address_type}]",
            version = version,
            cmd = cmd,
            rsv = rsv,
            address_type = address_type,
        );

        if version != consts::SOCKS5_VERSION {
            return Err(ReplyError::GeneralFailure.into());
        }

        // an unknown command is reported as such even when the reserved
        // byte is also wrong
        let cmd = Socks5Command::from_u8(cmd).ok_or(ReplyError::CommandNotSupported)?;

        if rsv != consts::SOCKS5_RESERVED {
            return Err(ReplyError::GeneralFailure.into());
        }

        let target = read_address(&mut self.inner, address_type)
            .await
            .map_err(|e| match e {
                AddrError::IncorrectAddressType => {
                    SocksError::from(ReplyError::AddressTypeNotSupported)
                }
                e => {
                    error!("{:#}", e);
                    ReplyError::GeneralFailure.into()
                }
            })?;

        debug!("Request target is {}", target);

        match cmd {
            Socks5Command::TCPConnect => self.execute_command_connect(target).await,
            Socks5Command::UDPAssociate => self.execute_command_udp_associate(target).await,
            Socks5Command::TCPBind => Err(ReplyError::CommandNotSupported.into()),
        }
    }

    /// Connect to the target the client asked for, reply with the locally
    /// bound address, then relay bytes until either side gives up.
    async fn execute_command_connect(&mut self, target: TargetAddr) -> Result<()> {
        // there's no suitable reply code in rfc1928 for dns lookup failure
        let addr = target.resolve().await.map_err(|e| {
            error!("{:#}", e);
            ReplyError::GeneralFailure
        })?;

        let outbound = tcp_connect_with_timeout(
            addr,
            self.context.config.request_timeout,
            self.context.config.outbound_bind,
        )
        .await
        .map_err(|e| {
            error!("{:#}", e);
            e.to_reply_error()
        })?;

        info!("SOCKS connection: {} -> {}", self.peer.ip(), addr);

        let bound = outbound.local_addr().context("Can't read bound address")?;
        self.reply(ReplyError::Succeeded, bound).await?;

        run_tcp_proxy(&mut self.inner, outbound, self.context.stats()).await
    }

    /// Set up the relay socket for a UDP associate. The request address
    /// names the client's expected UDP source: a wildcard means the client
    /// does not know it yet and the first datagram pins it instead.
    async fn execute_command_udp_associate(&mut self, target: TargetAddr) -> Result<()> {
        let client_addr = target.resolve().await.map_err(|e| {
            error!("{:#}", e);
            ReplyError::GeneralFailure
        })?;

        let bind_ip: IpAddr = match client_addr {
            SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
            SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
        };
        let socket = UdpSocket::bind(SocketAddr::new(bind_ip, 0))
            .await
            .map_err(|e| ConnectError::from(e).to_reply_error())?;

        let pinned = if client_addr.ip().is_unspecified() {
            false
        } else {
            socket
                .connect(client_addr)
                .await
                .map_err(|e| ConnectError::from(e).to_reply_error())?;
            true
        };

        let bound = socket.local_addr().context("Can't read bound address")?;
        self.reply(ReplyError::Succeeded, bound).await?;

        info!(
            "UDP associate: client {} bound to local address {}",
            self.peer, bound
        );

        run_udp_proxy(&mut self.inner, socket, pinned).await
    }

    async fn reply(&mut self, code: ReplyError, bound: SocketAddr) -> Result<()> {
        let reply = new_reply(code, bound);
        debug!("reply to be written: {:?}", &reply);

        self.inner
            .write_all(&reply)
            .await
            .context("Can't write the reply!")?;

        Ok(())
    }

    async fn reply_error(&mut self, error: ReplyError) -> Result<()> {
        // error replies carry no meaningful bound address, send ipv4 zeros
        self.reply(error, SocketAddr::from(([0, 0, 0, 0], 0))).await
    }
}

/// Encode a reply: `[VER, REP, RSV, ATYP, BND.ADDR, BND.PORT]`. 10 bytes for
/// an IPv4 bound address, 22 for IPv6.
fn new_reply(code: ReplyError, sock_addr: SocketAddr) -> Vec<u8> {
    let (addr_type, mut ip_oct, mut port) = match sock_addr {
        SocketAddr::V4(sock) => (
            consts::SOCKS5_ADDR_TYPE_IPV4,
            sock.ip().octets().to_vec(),
            sock.port().to_be_bytes().to_vec(),
        ),
        SocketAddr::V6(sock) => (
            consts::SOCKS5_ADDR_TYPE_IPV6,
            sock.ip().octets().to_vec(),
            sock.port().to_be_bytes().to_vec(),
        ),
    };

    let mut reply = vec![
        consts::SOCKS5_VERSION,
        code.as_u8(),
        consts::SOCKS5_RESERVED,
        addr_type,
    ];
    reply.append(&mut ip_oct);
    reply.append(&mut port);

    reply
}

/// Copy data between the client and the target until either side closes or
/// errors. Each read is written out in full before the next read on that
/// direction; bytes from the client are accounted as upload, bytes from the
/// target as download.
pub async fn run_tcp_proxy<T: AsyncRead + AsyncWrite + Unpin>(
    inbound: &mut T,
    outbound: TcpStream,
    stats: &TrafficStats,
) -> Result<()> {
    let (mut ri, mut wi) = tokio::io::split(inbound);
    let (mut ro, mut wo) = tokio::io::split(outbound);

    let upload = async {
        let mut buf = [0u8; TRANSFER_BUFFER_SIZE];
        let mut total: u64 = 0;
        loop {
            let n = ri.read(&mut buf).await?;
            if n == 0 {
                return Ok::<u64, io::Error>(total);
            }
            wo.write_all(&buf[..n]).await?;
            stats.record(n as u64, 0);
            total += n as u64;
        }
    };

    let download = async {
        let mut buf = [0u8; TRANSFER_BUFFER_SIZE];
        let mut total: u64 = 0;
        loop {
            let n = ro.read(&mut buf).await?;
            if n == 0 {
                return Ok::<u64, io::Error>(total);
            }
            wi.write_all(&buf[..n]).await?;
            stats.record(0, n as u64);
            total += n as u64;
        }
    };

    // The first direction to finish ends the relay; the caller closes both
    // sockets by dropping them.
    tokio::select! {
        res = upload => match res {
            Ok(bytes) => info!("local closed -> remote target ({} bytes consumed)", bytes),
            Err(err) => error!("local closed -> remote target with error {:?}", err),
        },
        res = download => match res {
            Ok(bytes) => info!("local <- remote target closed ({} bytes consumed)", bytes),
            Err(err) => error!("local <- remote target closed with error {:?}", err),
        },
    };

    Ok(())
}

/// One (target address, relay socket) pair of a UDP associate. Each target
/// address maps to at most one socket and vice versa.
struct UdpFlow {
    target: TargetAddr,
    socket: UdpSocket,
}

enum UdpEvent {
    Control(io::Result<usize>),
    Client(io::Result<(usize, Option<SocketAddr>)>),
    Flow(usize, io::Result<()>),
}

fn poll_flows(flows: &[UdpFlow], cx: &mut AsyncContext<'_>) -> Poll<(usize, io::Result<()>)> {
    for (index, flow) in flows.iter().enumerate() {
        if let Poll::Ready(ready) = flow.socket.poll_recv_ready(cx) {
            return Poll::Ready((index, ready));
        }
    }
    Poll::Pending
}

async fn recv_client_datagram(
    socket: &UdpSocket,
    pinned: bool,
    buf: &mut [u8],
) -> io::Result<(usize, Option<SocketAddr>)> {
    if pinned {
        socket.recv(buf).await.map(|n| (n, None))
    } else {
        socket.recv_from(buf).await.map(|(n, addr)| (n, Some(addr)))
    }
}

async fn open_udp_flow(target: &TargetAddr) -> Result<UdpSocket> {
    let addr = target.resolve().await?;

    let bind_ip: IpAddr = match addr {
        SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
        SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
    };
    let socket = UdpSocket::bind(SocketAddr::new(bind_ip, 0)).await?;
    socket.connect(addr).await?;

    debug!("UDP flow for {} opened to {}", target, addr);
    Ok(socket)
}

/// Relay a UDP associate until its control connection goes away.
///
/// Client datagrams are deframed and forwarded on a per-target socket,
/// created on first use; replies from a target are re-framed with that
/// target as source and sent back to the (pinned) client. Closing the
/// control connection, or any unrecoverable error, tears the whole
/// associate down; the flow sockets close on drop.
pub async fn run_udp_proxy<T: AsyncRead + AsyncWrite + Unpin>(
    control: &mut T,
    client: UdpSocket,
    mut pinned: bool,
) -> Result<()> {
    let mut flows: Vec<UdpFlow> = Vec::new();
    let mut control_buf = [0u8; 512];
    let mut datagram = vec![0u8; UDP_BUFFER_SIZE];

    loop {
        let event = tokio::select! {
            res = control.read(&mut control_buf) => UdpEvent::Control(res),
            res = recv_client_datagram(&client, pinned, &mut datagram) => UdpEvent::Client(res),
            ready = poll_fn(|cx| poll_flows(&flows, cx)), if !flows.is_empty() => {
                UdpEvent::Flow(ready.0, ready.1)
            }
        };

        match event {
            UdpEvent::Control(Ok(0)) => {
                debug!("control connection closed, terminating UDP associate");
                break;
            }
            UdpEvent::Control(Ok(n)) => {
                // the control connection carries no payload during an
                // associate, stray bytes are discarded
                debug!("discarding {} unexpected bytes on the control connection", n);
            }
            UdpEvent::Control(Err(err)) => {
                error!("control connection error: {}", err);
                break;
            }
            UdpEvent::Client(Err(err)) => {
                error!("recv from client udp socket: {}", err);
                break;
            }
            UdpEvent::Client(Ok((n, from))) => {
                if !pinned {
                    if let Some(peer) = from {
                        if let Err(err) = client.connect(peer).await {
                            error!("can't pin client udp source {}: {}", peer, err);
                            break;
                        }
                        debug!("client udp source pinned to {}", peer);
                        pinned = true;
                    }
                }

                let (target, payload) = match parse_udp_request(&datagram[..n]).await {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        error!("malformed client datagram: {:#}", err);
                        break;
                    }
                };

                let index = match flows.iter().position(|flow| flow.target == target) {
                    Some(index) => index,
                    None => match open_udp_flow(&target).await {
                        Ok(socket) => {
                            flows.push(UdpFlow {
                                target: target.clone(),
                                socket,
                            });
                            flows.len() - 1
                        }
                        Err(err) => {
                            error!("can't open udp flow to {}: {:#}", target, err);
                            break;
                        }
                    },
                };

                if let Err(err) = flows[index].socket.send(payload).await {
                    error!("send to {}: {}", flows[index].target, err);
                    break;
                }
            }
            UdpEvent::Flow(index, ready) => {
                if let Err(err) = ready {
                    error!("udp flow socket error: {}", err);
                    break;
                }

                let flow = &flows[index];
                match flow.socket.try_recv(&mut datagram) {
                    Ok(n) => {
                        let mut packet = new_udp_header(&flow.target)?;
                        packet.extend_from_slice(&datagram[..n]);
                        if let Err(err) = client.send(&packet).await {
                            error!("reply to client from {}: {}", flow.target, err);
                            break;
                        }
                    }
                    // spurious readiness, another event will follow
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
                    Err(err) => {
                        error!("recv from {}: {}", flow.target, err);
                        break;
                    }
                }
            }
        }
    }

    // closes every flow socket
    drop(flows);
    Ok(())
}
