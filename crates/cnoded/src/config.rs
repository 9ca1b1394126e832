use clap::{ArgAction, Parser};
use cnode_common::types::NodeName;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Listen backlog for the node socket.
pub const LISTEN_BACKLOG: u32 = 5;

/// Largest accepted `--max-conns`.
pub const MAX_CONNS_LIMIT: usize = 65_536;

/// Smallest accepted `--max-frame`.
pub const MIN_FRAME_LIMIT: usize = 64;

/// Largest accepted `--max-frame`.
pub const MAX_FRAME_LIMIT: usize = 64 * 1024 * 1024;

/// CLI arguments for the node server.
#[derive(Parser, Debug, Clone)]
#[command(name = "cnoded")]
#[command(about = "Hidden C-node answering integer RPC calls")]
#[command(version)]
pub struct Args {
    /// TCP port to listen on (all interfaces).
    #[arg(env = "CNODE_PORT")]
    pub port: u16,
    /// Alive name of this node.
    #[arg(long, default_value = "c1", env = "CNODE_NAME")]
    pub name: String,
    /// Host part of the node name.
    #[arg(long, default_value = "localhost", env = "CNODE_HOST")]
    pub host: String,
    /// Shared secret peers must prove knowledge of.
    #[arg(long, default_value = "secretcookie", env = "CNODE_COOKIE", hide_env_values = true)]
    pub cookie: String,
    /// Address of the port mapper daemon.
    #[arg(long, default_value = "127.0.0.1:4369", env = "CNODE_EPMD")]
    pub epmd: SocketAddr,
    /// Skip registering with the port mapper.
    #[arg(long, env = "CNODE_NO_PUBLISH")]
    pub no_publish: bool,
    /// Maximum concurrent peer connections.
    #[arg(long, default_value = "30", env = "CNODE_MAX_CONNS")]
    pub max_conns: usize,
    /// Largest accepted distribution frame in bytes.
    #[arg(long, default_value = "1048576", env = "CNODE_MAX_FRAME")]
    pub max_frame: usize,
    /// Handshake timeout in seconds.
    #[arg(long, default_value = "5", env = "CNODE_HANDSHAKE_TIMEOUT")]
    pub handshake_timeout: u64,
    /// Socket address for the metrics endpoint.
    #[arg(long, env = "CNODE_METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,
    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address to listen on.
    pub listen: SocketAddr,
    /// Alive name of this node.
    pub name: String,
    /// Host part of the node name.
    pub host: String,
    /// Shared handshake secret.
    pub cookie: String,
    /// Port mapper address, or `None` to stay unpublished.
    pub epmd: Option<SocketAddr>,
    /// Connection table capacity.
    pub max_conns: usize,
    /// Largest accepted distribution frame in bytes.
    pub max_frame: usize,
    /// Handshake timeout in seconds.
    pub handshake_timeout: u64,
    /// Socket address for the metrics endpoint.
    pub metrics_addr: Option<SocketAddr>,
}

impl ServerConfig {
    /// Configuration for a node listening on `listen` with defaults elsewhere
    /// and no port mapper registration.
    #[must_use]
    pub fn local(listen: SocketAddr) -> Self {
        Self {
            listen,
            name: "c1".to_owned(),
            host: "localhost".to_owned(),
            cookie: "secretcookie".to_owned(),
            epmd: None,
            max_conns: 30,
            max_frame: cnode_common::frame::DEFAULT_MAX_FRAME,
            handshake_timeout: 5,
            metrics_addr: None,
        }
    }

    /// Full node name, `name@host`.
    ///
    /// # Errors
    ///
    /// Returns a description if either part is not a valid name component.
    pub fn node_name(&self) -> Result<NodeName, String> {
        NodeName::new(self.name.clone(), self.host.clone()).map_err(|e| e.to_string())
    }

    /// Handshake timeout as a [`Duration`].
    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout)
    }

    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        self.node_name()?;

        if self.cookie.is_empty() {
            return Err("cookie must not be empty".to_string());
        }

        if self.max_conns == 0 {
            return Err("max_conns must be greater than 0".to_string());
        }
        if self.max_conns > MAX_CONNS_LIMIT {
            return Err(format!(
                "max_conns exceeds reasonable limit ({MAX_CONNS_LIMIT})"
            ));
        }

        if self.max_frame < MIN_FRAME_LIMIT {
            return Err(format!("max_frame must be at least {MIN_FRAME_LIMIT} bytes"));
        }
        if self.max_frame > MAX_FRAME_LIMIT {
            return Err(format!(
                "max_frame exceeds maximum allowed ({MAX_FRAME_LIMIT} bytes)"
            ));
        }

        if self.handshake_timeout == 0 {
            return Err("handshake_timeout must be greater than 0".to_string());
        }
        if self.handshake_timeout > 300 {
            return Err("handshake_timeout exceeds reasonable limit (300 seconds)".to_string());
        }
        Ok(())
    }
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, args.port)),
            name: args.name,
            host: args.host,
            cookie: args.cookie,
            epmd: (!args.no_publish).then_some(args.epmd),
            max_conns: args.max_conns,
            max_frame: args.max_frame,
            handshake_timeout: args.handshake_timeout,
            metrics_addr: args.metrics_addr,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> ServerConfig {
        ServerConfig::local("127.0.0.1:3456".parse().unwrap())
    }

    #[test]
    fn valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn args_defaults() {
        let args = Args::try_parse_from(["cnoded", "3456"]).unwrap();
        let config = ServerConfig::from(args);
        assert_eq!(config.listen, "0.0.0.0:3456".parse::<SocketAddr>().unwrap());
        assert_eq!(config.node_name().unwrap().to_string(), "c1@localhost");
        assert_eq!(config.cookie, "secretcookie");
        assert_eq!(config.epmd, Some("127.0.0.1:4369".parse().unwrap()));
        assert_eq!(config.max_conns, 30);
        assert_eq!(config.max_frame, 1 << 20);
        assert_eq!(config.handshake_timeout(), Duration::from_secs(5));
        assert!(config.metrics_addr.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn port_is_required() {
        assert!(Args::try_parse_from(["cnoded"]).is_err());
    }

    #[test]
    fn port_must_be_numeric() {
        assert!(Args::try_parse_from(["cnoded", "http"]).is_err());
    }

    #[test]
    fn no_publish_clears_epmd() {
        let args = Args::try_parse_from(["cnoded", "3456", "--no-publish"]).unwrap();
        assert!(ServerConfig::from(args).epmd.is_none());
    }

    #[test]
    fn verbosity_counts() {
        let args = Args::try_parse_from(["cnoded", "1", "-vv"]).unwrap();
        assert_eq!(args.verbose, 2);
    }

    #[test]
    fn empty_name_rejected() {
        let mut c = valid_config();
        c.name = String::new();
        assert!(c.validate().is_err());
    }

    #[test]
    fn name_with_at_rejected() {
        let mut c = valid_config();
        c.name = "c1@x".into();
        assert!(c.validate().is_err());
    }

    #[test]
    fn empty_host_rejected() {
        let mut c = valid_config();
        c.host = String::new();
        assert!(c.validate().is_err());
    }

    #[test]
    fn empty_cookie_rejected() {
        let mut c = valid_config();
        c.cookie = String::new();
        assert!(c.validate().unwrap_err().contains("cookie"));
    }

    #[test]
    fn max_conns_zero() {
        let mut c = valid_config();
        c.max_conns = 0;
        assert!(c.validate().unwrap_err().contains("max_conns"));
    }

    #[test]
    fn max_conns_too_large() {
        let mut c = valid_config();
        c.max_conns = MAX_CONNS_LIMIT + 1;
        assert!(c.validate().unwrap_err().contains("max_conns"));
    }

    #[test]
    fn max_frame_too_small() {
        let mut c = valid_config();
        c.max_frame = MIN_FRAME_LIMIT - 1;
        assert!(c.validate().unwrap_err().contains("max_frame"));
    }

    #[test]
    fn max_frame_too_large() {
        let mut c = valid_config();
        c.max_frame = MAX_FRAME_LIMIT + 1;
        assert!(c.validate().unwrap_err().contains("max_frame"));
    }

    #[test]
    fn handshake_timeout_zero() {
        let mut c = valid_config();
        c.handshake_timeout = 0;
        assert!(c.validate().unwrap_err().contains("handshake_timeout"));
    }

    #[test]
    fn handshake_timeout_too_large() {
        let mut c = valid_config();
        c.handshake_timeout = 301;
        assert!(c.validate().unwrap_err().contains("handshake_timeout"));
    }

    #[test]
    fn boundary_values_valid() {
        let mut c = valid_config();
        c.max_conns = 1;
        c.max_frame = MIN_FRAME_LIMIT;
        c.handshake_timeout = 1;
        assert!(c.validate().is_ok());
    }

    #[test]
    fn upper_boundary_values_valid() {
        let mut c = valid_config();
        c.max_conns = MAX_CONNS_LIMIT;
        c.max_frame = MAX_FRAME_LIMIT;
        c.handshake_timeout = 300;
        assert!(c.validate().is_ok());
    }
}
