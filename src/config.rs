// Copyright (C) 2020 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Transport and per-component configuration

use std::net::SocketAddr;
use std::time::Duration;

use async_std::net::ToSocketAddrs;

use crate::candidate::{MAX_CANDIDATES, MAX_COMPONENT_ID};
use crate::transport::TransportError;

/// Maximum number of components (RTP and RTCP)
pub const MAX_COMPONENTS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    pub fn matches(self, addr: &SocketAddr) -> bool {
        match self {
            AddressFamily::Ipv4 => addr.is_ipv4(),
            AddressFamily::Ipv6 => addr.is_ipv6(),
        }
    }
}

impl Default for AddressFamily {
    fn default() -> Self {
        AddressFamily::Ipv4
    }
}

/// A STUN or TURN server given by host name (or literal address) and port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_owned(),
            port,
        }
    }

    /// Resolve to the first address of the requested family
    pub async fn resolve(&self, af: AddressFamily) -> Result<SocketAddr, TransportError> {
        let addrs = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .await
            .map_err(|e| TransportError::Resolution(format!("{}: {}", self.host, e)))?;
        addrs
            .into_iter()
            .find(|addr| af.matches(addr))
            .ok_or_else(|| {
                TransportError::Resolution(format!("{}: no {:?} address", self.host, af))
            })
    }
}

impl From<SocketAddr> for ServerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

impl std::fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnCredentials {
    pub username: String,
    pub password: String,
}

impl TurnCredentials {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_owned(),
            password: password.to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnAllocParams {
    /// Requested allocation lifetime
    pub lifetime: Duration,
}

impl Default for TurnAllocParams {
    fn default() -> Self {
        Self {
            lifetime: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnServerConfig {
    pub server: ServerAddress,
    pub credentials: TurnCredentials,
    pub alloc_params: TurnAllocParams,
}

/// Socket options of a single component
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentOptions {
    pub disable_stun: bool,
    pub disable_relay: bool,
    /// Fail immediately if the requested port cannot be bound
    pub no_port_retry: bool,
    /// Don't add host candidates for the bound socket
    pub dont_add_candidate: bool,
    pub max_host_candidates: usize,
}

impl Default for ComponentOptions {
    fn default() -> Self {
        Self {
            disable_stun: false,
            disable_relay: false,
            no_port_retry: false,
            dont_add_candidate: false,
            max_host_candidates: MAX_CANDIDATES,
        }
    }
}

/// Retransmission policy for STUN and TURN requests.  The retransmission timeout doubles after
/// every transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetransmitConfig {
    pub initial_rto: Duration,
    pub max_transmits: u32,
}

impl Default for RetransmitConfig {
    fn default() -> Self {
        Self {
            initial_rto: Duration::from_millis(100),
            max_transmits: 7,
        }
    }
}

impl RetransmitConfig {
    /// Delays to wait after each transmission, the last one being the final response timeout
    pub(crate) fn timeouts(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_transmits).map(move |i| {
            if i + 1 == self.max_transmits {
                // RFC 5389 7.2.1: wait 16 * RTO after the last request
                self.initial_rto * 16
            } else {
                self.initial_rto * 2u32.pow(i.min(16))
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepAliveConfig {
    pub interval: Duration,
    /// Upper bound of the random delay added to every interval
    pub jitter: Duration,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            jitter: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub af: AddressFamily,
    pub stun_server: Option<ServerAddress>,
    pub turn_server: Option<TurnServerConfig>,
    pub max_candidates: usize,
    pub max_components: usize,
    pub keep_alive: KeepAliveConfig,
    pub retransmit: RetransmitConfig,
    /// Sent in the SOFTWARE attribute of outgoing requests
    pub software: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            af: AddressFamily::default(),
            stun_server: None,
            turn_server: None,
            max_candidates: MAX_CANDIDATES,
            max_components: MAX_COMPONENTS,
            keep_alive: KeepAliveConfig::default(),
            retransmit: RetransmitConfig::default(),
            software: None,
        }
    }
}

impl TransportConfig {
    /// # Examples
    ///
    /// ```
    /// # use icestrans::config::*;
    /// # use std::time::Duration;
    /// let config = TransportConfig::builder()
    ///     .stun_server(ServerAddress::new("stun.example.org", 3478))
    ///     .keep_alive(Duration::from_secs(30), Duration::from_secs(2))
    ///     .build();
    /// assert_eq!(config.stun_server.unwrap().port, 3478);
    /// assert_eq!(config.max_components, 2);
    /// assert_eq!(config.keep_alive.interval, Duration::from_secs(30));
    /// ```
    pub fn builder() -> TransportConfigBuilder {
        TransportConfigBuilder {
            config: TransportConfig::default(),
        }
    }
}

pub struct TransportConfigBuilder {
    config: TransportConfig,
}

impl TransportConfigBuilder {
    pub fn build(self) -> TransportConfig {
        self.config
    }

    pub fn address_family(mut self, af: AddressFamily) -> Self {
        self.config.af = af;
        self
    }

    pub fn stun_server(mut self, server: ServerAddress) -> Self {
        self.config.stun_server = Some(server);
        self
    }

    pub fn turn_server(
        mut self,
        server: ServerAddress,
        credentials: TurnCredentials,
        alloc_params: TurnAllocParams,
    ) -> Self {
        self.config.turn_server = Some(TurnServerConfig {
            server,
            credentials,
            alloc_params,
        });
        self
    }

    pub fn max_candidates(mut self, max: usize) -> Self {
        self.config.max_candidates = max;
        self
    }

    /// Clamped to [`MAX_COMPONENT_ID`]
    pub fn max_components(mut self, max: usize) -> Self {
        self.config.max_components = max.min(MAX_COMPONENT_ID);
        self
    }

    pub fn keep_alive(mut self, interval: Duration, jitter: Duration) -> Self {
        self.config.keep_alive = KeepAliveConfig { interval, jitter };
        self
    }

    pub fn retransmit(mut self, initial_rto: Duration, max_transmits: u32) -> Self {
        self.config.retransmit = RetransmitConfig {
            initial_rto,
            max_transmits,
        };
        self
    }

    pub fn software(mut self, software: &str) -> Self {
        self.config.software = Some(software.to_owned());
        self
    }
}
