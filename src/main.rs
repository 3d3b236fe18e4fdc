#[forbid(unsafe_code)]
#[macro_use]
extern crate log;

use microsocks::server::{Config, ServerContext, SimpleUserPassword, Socks5Socket};
use microsocks::{Result, SocksError};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use structopt::StructOpt;
use tokio::net::TcpListener;
use tokio::task::JoinSet;

/// # How to use it:
///
/// Listen on the default address, authentication-free:
///     `$ RUST_LOG=debug microsocks`
///
/// Listen on a specific address, with basic username/password requirement:
///     `$ RUST_LOG=debug microsocks -i 127.0.0.1 -p 1337 -u admin -P password`
///
/// Same as above but whitelisting an ip after its first successful auth:
///     `$ RUST_LOG=debug microsocks -1 -u admin -P password`
///
#[derive(Debug, StructOpt)]
#[structopt(
    name = "microsocks",
    about = "A multithreaded, small and efficient SOCKS5 server."
)]
struct Opt {
    /// Disable logging.
    #[structopt(short = "q", long)]
    pub quiet: bool,

    /// Auth-once mode: once an ip authed successfully with user/pass, it is
    /// added to a whitelist and may use the proxy without auth. Handy for
    /// programs that don't support user/pass auth themselves.
    #[structopt(short = "1", long = "auth-once")]
    pub auth_once: bool,

    /// Ip address to listen on.
    #[structopt(short = "i", long, default_value = "0.0.0.0")]
    pub listen_ip: String,

    /// Port to listen on.
    #[structopt(short = "p", long, default_value = "1080")]
    pub port: u16,

    /// Username for user/pass authentication.
    #[structopt(short = "u", long)]
    pub user: Option<String>,

    /// Password for user/pass authentication.
    #[structopt(short = "P", long)]
    pub password: Option<String>,

    /// Ip address outgoing connections are bound to.
    #[structopt(short = "b", long)]
    pub bind_addr: Option<IpAddr>,
}

/// Backoff after a failed accept, to avoid spinning on resource exhaustion.
const FAILURE_TIMEOUT: Duration = Duration::from_micros(64);

#[tokio::main]
async fn main() -> Result<()> {
    let opt: Opt = Opt::from_args();
    init_logging(opt.quiet);

    spawn_socks_server(opt).await
}

fn init_logging(quiet: bool) {
    if quiet {
        env_logger::builder()
            .filter_level(log::LevelFilter::Off)
            .init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }
}

async fn spawn_socks_server(opt: Opt) -> Result<()> {
    if opt.user.is_some() != opt.password.is_some() {
        return Err(SocksError::ArgumentInputError(
            "user and pass must be used together",
        ));
    }
    if opt.auth_once && opt.user.is_none() {
        return Err(SocksError::ArgumentInputError(
            "auth-once option must be used together with user/pass",
        ));
    }

    let mut config = Config::default();
    if let (Some(user), Some(password)) = (opt.user, opt.password) {
        info!("Simple auth system has been set.");
        config.set_authentication(SimpleUserPassword::new(user, password));
        config.set_auth_once(opt.auth_once);
    } else {
        warn!("No authentication has been set!");
    }
    config.set_outbound_bind(opt.bind_addr);

    let context = Arc::new(
        ServerContext::new(config)
            .with_traffic_reporter(|upload, download| {
                trace!("traffic totals: {} up / {} down", upload, download);
            }),
    );

    let listener = TcpListener::bind((opt.listen_ip.as_str(), opt.port)).await?;
    info!(
        "Listen for socks connections @ {}:{}",
        opt.listen_ip, opt.port
    );

    let mut sessions: JoinSet<Result<()>> = JoinSet::new();

    loop {
        tokio::select! {
            incoming = listener.accept() => match incoming {
                Ok((socket, peer)) => {
                    debug!("New SOCKS client connected from {}", peer);
                    let context = context.clone();
                    sessions.spawn(Socks5Socket::new(socket, peer, context).serve());
                }
                Err(err) => {
                    error!("failed to accept connection: {}", err);
                    tokio::time::sleep(FAILURE_TIMEOUT).await;
                }
            },
            Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                match finished {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => error!("{:#}", &err),
                    Err(err) => error!("session task failed: {}", err),
                }
            }
        }
    }
}
