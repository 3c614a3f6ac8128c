use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use krpc_lite::framer::DEFAULT_MAX_MESSAGE_SIZE;

/// Configuration for [`TestServer`](super::TestServer).
///
/// Port `0` binds an ephemeral port; the bound addresses are available from
/// the server after [`bind`](super::TestServer::bind).
#[derive(Debug, Clone, bon::Builder)]
pub struct ServerConfig {
    #[builder(default = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    pub address: IpAddr,

    #[builder(default = 50000)]
    pub rpc_port: u16,

    #[builder(default = 50001)]
    pub stream_port: u16,

    /// How often started streams are re-evaluated.
    #[builder(default = Duration::from_millis(10))]
    pub tick_interval: Duration,

    #[builder(default = DEFAULT_MAX_MESSAGE_SIZE)]
    pub max_message_size: usize,
}

impl ServerConfig {
    pub fn rpc_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.rpc_port)
    }

    pub fn stream_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.stream_port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.rpc_addr().to_string(), "127.0.0.1:50000");
        assert_eq!(config.stream_addr().port(), 50001);
        assert_eq!(config.tick_interval, Duration::from_millis(10));
    }

    #[test]
    fn test_builder_overrides() {
        let config = ServerConfig::builder()
            .rpc_port(0)
            .stream_port(0)
            .tick_interval(Duration::from_millis(1))
            .build();
        assert_eq!(config.rpc_port, 0);
        assert_eq!(config.tick_interval, Duration::from_millis(1));
    }
}
