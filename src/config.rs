//! Purpose: Runtime configuration for the notes server and watchers.
//! Exports: `RuntimeConfig`.
//! Role: One value threaded from the CLI / C ABI constructor into the runtime.
//! Invariants: Defaults bind loopback on an ephemeral port.
//! Invariants: Non-loopback binds require explicit opt-in (`allow_non_loopback`).

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::core::error::{Error, ErrorKind};

pub const PORT_ENV: &str = "MDNOTES_PORT";

#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub bind: IpAddr,
    /// `0` asks the OS for an ephemeral port.
    pub port: u16,
    pub allow_non_loopback: bool,
    /// Quiet period after the first filesystem event before rebuilding.
    pub debounce: Duration,
    pub broadcast_capacity: usize,
    pub import_login_env: bool,
    pub shutdown_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            allow_non_loopback: false,
            debounce: Duration::from_millis(50),
            broadcast_capacity: 10,
            import_login_env: cfg!(target_os = "macos"),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `MDNOTES_PORT` when it is set.
    pub fn from_env() -> Result<Self, Error> {
        let mut config = Self::default();
        if let Some(raw) = std::env::var_os(PORT_ENV) {
            config.port = parse_port(&raw.to_string_lossy())?;
        }
        Ok(config)
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_bind(mut self, bind: IpAddr) -> Self {
        self.bind = bind;
        self
    }

    pub fn with_import_login_env(mut self, import: bool) -> Self {
        self.import_login_env = import;
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        if !self.bind.is_loopback() && !self.allow_non_loopback {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("non-loopback bind requires explicit opt-in")
                .with_hint("Re-run with --allow-non-loopback or use a loopback address."));
        }
        if self.broadcast_capacity == 0 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("broadcast capacity must be greater than zero"));
        }
        Ok(())
    }
}

fn parse_port(raw: &str) -> Result<u16, Error> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(0);
    }
    trimmed.parse::<u16>().map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message(format!("{PORT_ENV} must be a port number, got {trimmed:?}"))
            .with_source(err)
    })
}

#[cfg(test)]
mod tests {
    use super::{RuntimeConfig, parse_port};
    use crate::core::error::ErrorKind;
    use std::net::IpAddr;

    #[test]
    fn default_config_is_valid_loopback() {
        let config = RuntimeConfig::default();
        assert!(config.bind.is_loopback());
        assert_eq!(config.port, 0);
        config.validate().expect("default config");
    }

    #[test]
    fn non_loopback_requires_allow_flag() {
        let bind: IpAddr = "0.0.0.0".parse().expect("ip");
        let config = RuntimeConfig::default().with_bind(bind);
        let err = config.validate().expect_err("expected usage error");
        assert_eq!(err.kind(), ErrorKind::Usage);

        let config = RuntimeConfig {
            allow_non_loopback: true,
            ..config
        };
        config.validate().expect("opted in");
    }

    #[test]
    fn zero_broadcast_capacity_is_rejected() {
        let config = RuntimeConfig {
            broadcast_capacity: 0,
            ..RuntimeConfig::default()
        };
        let err = config.validate().expect_err("expected usage error");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn port_parsing() {
        assert_eq!(parse_port("8080").expect("port"), 8080);
        assert_eq!(parse_port(" ").expect("blank"), 0);
        let err = parse_port("eighty").expect_err("not a port");
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert!(parse_port("70000").is_err());
    }
}
