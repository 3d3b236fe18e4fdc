use microsocks::server::{Config, ServerContext, SimpleUserPassword, Socks5Socket};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

async fn spawn_socks_server(context: Arc<ServerContext>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => break,
            };
            let context = context.clone();
            tokio::spawn(async move {
                let _ = Socks5Socket::new(socket, peer, context).serve().await;
            });
        }
    });

    addr
}

async fn spawn_tcp_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

async fn spawn_udp_echo_server() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });

    addr
}

/// Perform the no-auth greeting and assert the server accepts it.
async fn connect_no_auth(proxy: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();

    let mut reply = [0u8; 2];
    timeout(TEST_TIMEOUT, stream.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, [0x05, 0x00]);

    stream
}

fn connect_request(target: SocketAddr) -> Vec<u8> {
    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    match target {
        SocketAddr::V4(addr) => {
            request.extend_from_slice(&addr.ip().octets());
        }
        SocketAddr::V6(_) => panic!("tests only build ipv4 requests"),
    }
    request.extend_from_slice(&target.port().to_be_bytes());
    request
}

/// Read a full reply and return its code.
async fn read_reply_code(stream: &mut TcpStream) -> u8 {
    let mut head = [0u8; 4];
    timeout(TEST_TIMEOUT, stream.read_exact(&mut head))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(head[0], 0x05);
    assert_eq!(head[2], 0x00);

    let remaining = match head[3] {
        0x01 => 4 + 2,
        0x04 => 16 + 2,
        atyp => panic!("unexpected reply address type {}", atyp),
    };
    let mut rest = vec![0u8; remaining];
    timeout(TEST_TIMEOUT, stream.read_exact(&mut rest))
        .await
        .unwrap()
        .unwrap();

    head[1]
}

async fn assert_closed(stream: &mut TcpStream) {
    let mut buf = [0u8; 1];
    let n = timeout(TEST_TIMEOUT, stream.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0, "expected the server to close the connection");
}

#[tokio::test]
async fn no_auth_connect_relays_both_directions() {
    let context = Arc::new(ServerContext::new(Config::default()));
    let proxy = spawn_socks_server(context.clone()).await;
    let echo = spawn_tcp_echo_server().await;

    let mut stream = connect_no_auth(proxy).await;
    stream.write_all(&connect_request(echo)).await.unwrap();
    assert_eq!(read_reply_code(&mut stream).await, 0x00);

    stream.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    timeout(TEST_TIMEOUT, stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"ping");

    // both directions crossed the proxy, so both counters move
    let mut tries = 0;
    loop {
        let (upload, download) = context.stats().totals();
        if upload >= 4 && download >= 4 {
            break;
        }
        tries += 1;
        assert!(tries < 100, "counters stuck at {}/{}", upload, download);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn rejects_clients_without_an_acceptable_method() {
    let mut config = Config::default();
    config.set_authentication(SimpleUserPassword::new("a", "b"));
    let context = Arc::new(ServerContext::new(config));
    let proxy = spawn_socks_server(context).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();

    let mut reply = [0u8; 2];
    timeout(TEST_TIMEOUT, stream.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, [0x05, 0xff]);
    assert_closed(&mut stream).await;
}

#[tokio::test]
async fn rejects_wrong_credentials() {
    let mut config = Config::default();
    config.set_authentication(SimpleUserPassword::new("a", "b"));
    let context = Arc::new(ServerContext::new(config));
    let proxy = spawn_socks_server(context).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x02]).await.unwrap();

    let mut reply = [0u8; 2];
    timeout(TEST_TIMEOUT, stream.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, [0x05, 0x02]);

    stream
        .write_all(&[0x01, 0x01, b'a', 0x01, b'c'])
        .await
        .unwrap();
    timeout(TEST_TIMEOUT, stream.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, [0x01, 0x02]);
    assert_closed(&mut stream).await;
}

#[tokio::test]
async fn accepts_valid_credentials_and_connects() {
    let mut config = Config::default();
    config.set_authentication(SimpleUserPassword::new("admin", "password"));
    let context = Arc::new(ServerContext::new(config));
    let proxy = spawn_socks_server(context).await;
    let echo = spawn_tcp_echo_server().await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x02]).await.unwrap();

    let mut reply = [0u8; 2];
    timeout(TEST_TIMEOUT, stream.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, [0x05, 0x02]);

    let mut login = vec![0x01, 0x05];
    login.extend_from_slice(b"admin");
    login.push(0x08);
    login.extend_from_slice(b"password");
    stream.write_all(&login).await.unwrap();

    timeout(TEST_TIMEOUT, stream.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, [0x01, 0x00]);

    stream.write_all(&connect_request(echo)).await.unwrap();
    assert_eq!(read_reply_code(&mut stream).await, 0x00);
}

#[tokio::test]
async fn bind_command_is_not_supported() {
    let context = Arc::new(ServerContext::new(Config::default()));
    let proxy = spawn_socks_server(context).await;

    let mut stream = connect_no_auth(proxy).await;
    stream
        .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50])
        .await
        .unwrap();

    assert_eq!(read_reply_code(&mut stream).await, 0x07);
    assert_closed(&mut stream).await;
}

#[tokio::test]
async fn unknown_command_is_reported_even_with_bad_reserved_byte() {
    let context = Arc::new(ServerContext::new(Config::default()));
    let proxy = spawn_socks_server(context).await;

    let mut stream = connect_no_auth(proxy).await;
    stream
        .write_all(&[0x05, 0x09, 0x01, 0x01, 127, 0, 0, 1, 0x00, 0x50])
        .await
        .unwrap();

    assert_eq!(read_reply_code(&mut stream).await, 0x07);
    assert_closed(&mut stream).await;
}

#[tokio::test]
async fn dns_failure_reports_general_failure() {
    let context = Arc::new(ServerContext::new(Config::default()));
    let proxy = spawn_socks_server(context).await;

    let mut stream = connect_no_auth(proxy).await;
    let host = b"microsocks-test.invalid";
    let mut request = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
    request.extend_from_slice(host);
    request.extend_from_slice(&80u16.to_be_bytes());
    stream.write_all(&request).await.unwrap();

    assert_eq!(read_reply_code(&mut stream).await, 0x01);
    assert_closed(&mut stream).await;
}

#[tokio::test]
async fn refused_target_maps_to_connection_refused() {
    let context = Arc::new(ServerContext::new(Config::default()));
    let proxy = spawn_socks_server(context).await;

    let mut stream = connect_no_auth(proxy).await;
    // nothing listens on loopback port 1
    stream
        .write_all(&connect_request("127.0.0.1:1".parse().unwrap()))
        .await
        .unwrap();

    assert_eq!(read_reply_code(&mut stream).await, 0x05);
    assert_closed(&mut stream).await;
}

#[tokio::test]
async fn greeting_with_wrong_version_is_terminal() {
    let context = Arc::new(ServerContext::new(Config::default()));
    let proxy = spawn_socks_server(context).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(&[0x04, 0x01, 0x00]).await.unwrap();
    assert_closed(&mut stream).await;
}

#[tokio::test]
async fn udp_associate_relays_datagrams_per_target() {
    let context = Arc::new(ServerContext::new(Config::default()));
    let proxy = spawn_socks_server(context).await;
    let echo_a = spawn_udp_echo_server().await;
    let echo_b = spawn_udp_echo_server().await;

    let mut control = connect_no_auth(proxy).await;
    // wildcard client address: the first datagram pins the client
    control
        .write_all(&[0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await
        .unwrap();

    let mut head = [0u8; 4];
    timeout(TEST_TIMEOUT, control.read_exact(&mut head))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&head, &[0x05, 0x00, 0x00, 0x01]);
    let mut rest = [0u8; 6];
    timeout(TEST_TIMEOUT, control.read_exact(&mut rest))
        .await
        .unwrap()
        .unwrap();
    let relay_port = u16::from_be_bytes([rest[4], rest[5]]);
    let relay: SocketAddr = format!("127.0.0.1:{}", relay_port).parse().unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let exchange = |target: SocketAddr, payload: &[u8]| {
        let mut packet = vec![0x00, 0x00, 0x00, 0x01, 127, 0, 0, 1];
        packet.extend_from_slice(&target.port().to_be_bytes());
        packet.extend_from_slice(payload);
        packet
    };

    // first target, twice: the second datagram reuses the flow socket
    for _ in 0..2 {
        client
            .send_to(&exchange(echo_a, b"ping a"), relay)
            .await
            .unwrap();

        let mut buf = [0u8; 1024];
        let (n, from) = timeout(TEST_TIMEOUT, client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, relay);
        assert_eq!(&buf[..4], &[0x00, 0x00, 0x00, 0x01]);
        assert_eq!(&buf[4..8], &[127, 0, 0, 1]);
        assert_eq!(u16::from_be_bytes([buf[8], buf[9]]), echo_a.port());
        assert_eq!(&buf[10..n], b"ping a");
    }

    // a second target gets its own flow, framed with its own source address
    client
        .send_to(&exchange(echo_b, b"ping b"), relay)
        .await
        .unwrap();

    let mut buf = [0u8; 1024];
    let (n, _) = timeout(TEST_TIMEOUT, client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(u16::from_be_bytes([buf[8], buf[9]]), echo_b.port());
    assert_eq!(&buf[10..n], b"ping b");
}

#[tokio::test]
async fn closing_the_control_connection_ends_the_associate() {
    let context = Arc::new(ServerContext::new(Config::default()));
    let proxy = spawn_socks_server(context).await;
    let echo = spawn_udp_echo_server().await;

    let mut control = connect_no_auth(proxy).await;
    control
        .write_all(&[0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await
        .unwrap();

    let mut reply = [0u8; 10];
    timeout(TEST_TIMEOUT, control.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    let relay_port = u16::from_be_bytes([reply[8], reply[9]]);
    let relay: SocketAddr = format!("127.0.0.1:{}", relay_port).parse().unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut packet = vec![0x00, 0x00, 0x00, 0x01, 127, 0, 0, 1];
    packet.extend_from_slice(&echo.port().to_be_bytes());
    packet.extend_from_slice(b"hello");
    client.send_to(&packet, relay).await.unwrap();

    let mut buf = [0u8; 1024];
    timeout(TEST_TIMEOUT, client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();

    // tearing the control connection down closes the relay; later datagrams
    // go nowhere
    drop(control);
    tokio::time::sleep(Duration::from_millis(100)).await;

    client.send_to(&packet, relay).await.unwrap();
    let silent = timeout(Duration::from_millis(300), client.recv_from(&mut buf)).await;
    assert!(silent.is_err(), "relay should be gone");
}

#[tokio::test]
async fn auth_once_whitelists_the_client_ip() {
    let mut config = Config::default();
    config.set_authentication(SimpleUserPassword::new("admin", "password"));
    config.set_auth_once(true);
    let context = Arc::new(ServerContext::new(config));
    let proxy = spawn_socks_server(context.clone()).await;
    let echo = spawn_tcp_echo_server().await;

    // first connection must present credentials
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    let mut reply = [0u8; 2];
    timeout(TEST_TIMEOUT, stream.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, [0x05, 0x02]);

    let mut login = vec![0x01, 0x05];
    login.extend_from_slice(b"admin");
    login.push(0x08);
    login.extend_from_slice(b"password");
    stream.write_all(&login).await.unwrap();
    timeout(TEST_TIMEOUT, stream.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, [0x01, 0x00]);
    drop(stream);

    // the whitelist entry lands right after the verdict is sent
    let mut tries = 0;
    while context.whitelist_len() == 0 {
        tries += 1;
        assert!(tries < 100, "ip never whitelisted");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(context.whitelist_len(), 1);

    // the second connection from the same ip gets in with no-auth only
    let mut stream = connect_no_auth(proxy).await;
    stream.write_all(&connect_request(echo)).await.unwrap();
    assert_eq!(read_reply_code(&mut stream).await, 0x00);

    // authenticating again does not duplicate the whitelist entry
    assert_eq!(context.whitelist_len(), 1);
}
