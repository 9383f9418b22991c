//! Default ports, addresses and intervals of the webhook server.
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

/// The port the Deckhouse admission webhooks are served on.
pub const DEFAULT_HTTPS_PORT: u16 = 9651;

/// Binds on all network addresses.
pub const DEFAULT_LISTEN_ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

pub const DEFAULT_SOCKET_ADDRESS: SocketAddr =
    SocketAddr::new(DEFAULT_LISTEN_ADDRESS, DEFAULT_HTTPS_PORT);

/// Certificate and key are mounted from a Secret that is rotated outside of
/// this process, so they are re-read on this interval.
pub const DEFAULT_CERTIFICATE_RELOAD_INTERVAL: Duration = Duration::from_secs(60);

pub const DEFAULT_TLS_CERT_PATH: &str = "/certs/tls.crt";
pub const DEFAULT_TLS_KEY_PATH: &str = "/certs/tls.key";
