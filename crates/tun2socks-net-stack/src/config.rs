use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::policy::FlowPolicy;

/// Smallest MTU every IPv4 host must accept (RFC 791).
pub const MIN_MTU: usize = 68;

/// Runtime knobs of a [`crate::NetStack`].
///
/// `Default` yields the classic constants: 1500 byte MTU, 65535 byte windows, MSS 1460 and
/// fragment sets living ten one-minute sweep ticks.
#[derive(Debug, Clone)]
pub struct StackConfig {
    pub mtu: usize,
    /// Receive window advertised when nothing is buffered; also the fallback send window.
    pub window: u16,
    /// MSS advertised in the SYN+ACK.
    pub mss: u16,
    pub ttl: u8,

    /// No segment for this long forces an active close of a TCP flow.
    pub tcp_idle_timeout: Duration,
    /// No datagram for this long closes a UDP flow.
    pub udp_idle_timeout: Duration,
    pub tcp_read_timeout: Duration,
    pub udp_read_timeout: Duration,

    pub fragment_ttl_ticks: u32,
    pub fragment_sweep_interval: Duration,

    /// Bound of each accept queue.
    pub accept_backlog: usize,
    /// Inbound segments queued per TCP flow before new ones are dropped.
    pub flow_queue_depth: usize,
    /// Datagrams buffered per UDP flow before new ones are dropped.
    pub udp_flow_queue_depth: usize,
    /// Frames queued towards the interface writer.
    pub write_queue_depth: usize,
    /// Delay between tearing down flows and releasing the interface on shutdown.
    pub shutdown_grace: Duration,

    /// Maximum concurrent TCP flows, `0` for unlimited.
    pub max_tcp_flows: usize,
    /// Maximum concurrent UDP flows, `0` for unlimited.
    pub max_udp_flows: usize,

    /// Acknowledge every in-order data segment instead of only out-of-order and control segments.
    pub ack_data_segments: bool,

    pub policy: FlowPolicy,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            mtu: 1500,
            window: u16::MAX,
            mss: 1460,
            ttl: 64,
            tcp_idle_timeout: Duration::from_secs(5 * 60),
            udp_idle_timeout: Duration::from_secs(2 * 60),
            tcp_read_timeout: Duration::from_secs(300),
            udp_read_timeout: Duration::from_secs(120),
            fragment_ttl_ticks: 10,
            fragment_sweep_interval: Duration::from_secs(60),
            accept_backlog: 100,
            flow_queue_depth: 100,
            udp_flow_queue_depth: 64,
            write_queue_depth: 512,
            shutdown_grace: Duration::from_secs(2),
            max_tcp_flows: 0,
            max_udp_flows: 0,
            ack_data_segments: false,
            policy: FlowPolicy::default(),
        }
    }
}

impl StackConfig {
    /// Defaults overlaid with `TUN2SOCKS_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like [`StackConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let env = Env { lookup };

        if let Some(v) = env.parse("TUN2SOCKS_MTU")? {
            cfg.mtu = v;
        }
        if let Some(v) = env.parse("TUN2SOCKS_WINDOW")? {
            cfg.window = v;
        }
        if let Some(v) = env.parse("TUN2SOCKS_MSS")? {
            cfg.mss = v;
        }
        if let Some(v) = env.parse("TUN2SOCKS_TTL")? {
            cfg.ttl = v;
        }
        if let Some(v) = env.secs("TUN2SOCKS_TCP_IDLE_TIMEOUT_SECS")? {
            cfg.tcp_idle_timeout = v;
        }
        if let Some(v) = env.secs("TUN2SOCKS_UDP_IDLE_TIMEOUT_SECS")? {
            cfg.udp_idle_timeout = v;
        }
        if let Some(v) = env.secs("TUN2SOCKS_TCP_READ_TIMEOUT_SECS")? {
            cfg.tcp_read_timeout = v;
        }
        if let Some(v) = env.secs("TUN2SOCKS_UDP_READ_TIMEOUT_SECS")? {
            cfg.udp_read_timeout = v;
        }
        if let Some(v) = env.parse("TUN2SOCKS_FRAGMENT_TTL_TICKS")? {
            cfg.fragment_ttl_ticks = v;
        }
        if let Some(v) = env.secs("TUN2SOCKS_FRAGMENT_SWEEP_SECS")? {
            cfg.fragment_sweep_interval = v;
        }
        if let Some(v) = env.parse("TUN2SOCKS_ACCEPT_BACKLOG")? {
            cfg.accept_backlog = v;
        }
        if let Some(v) = env.parse("TUN2SOCKS_MAX_TCP_FLOWS")? {
            cfg.max_tcp_flows = v;
        }
        if let Some(v) = env.parse("TUN2SOCKS_MAX_UDP_FLOWS")? {
            cfg.max_udp_flows = v;
        }
        if let Some(v) = env.flag("TUN2SOCKS_ACK_DATA_SEGMENTS")? {
            cfg.ack_data_segments = v;
        }
        if let Some(v) = env.list("TUN2SOCKS_ALLOW_CIDRS")? {
            cfg.policy.allow_ips = v;
        }
        if let Some(v) = env.list("TUN2SOCKS_DENY_CIDRS")? {
            cfg.policy.deny_ips = v;
        }
        if let Some(v) = env.list("TUN2SOCKS_ALLOW_PORTS")? {
            cfg.policy.allow_ports = v;
        }
        if let Some(v) = env.list("TUN2SOCKS_DENY_PORTS")? {
            cfg.policy.deny_ports = v;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_MTU..=u16::MAX as usize).contains(&self.mtu) {
            return Err(ConfigError::MtuOutOfRange(self.mtu));
        }
        let nonzero = [
            ("window", self.window as usize),
            ("mss", self.mss as usize),
            ("accept_backlog", self.accept_backlog),
            ("flow_queue_depth", self.flow_queue_depth),
            ("udp_flow_queue_depth", self.udp_flow_queue_depth),
            ("write_queue_depth", self.write_queue_depth),
            ("fragment_ttl_ticks", self.fragment_ttl_ticks as usize),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.fragment_sweep_interval.is_zero() {
            return Err(ConfigError::Zero("fragment_sweep_interval"));
        }
        Ok(())
    }

    /// Largest TCP payload placed in one outbound segment.
    pub fn segment_payload_limit(&self) -> usize {
        self.mtu.saturating_sub(40).max(1)
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, var: &str) -> Option<String> {
        (self.lookup)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, var: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let Some(value) = self.raw(var) else {
            return Ok(None);
        };
        value
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidEnv {
                var,
                reason: e.to_string(),
                value,
            })
    }

    fn secs(&self, var: &'static str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(var)?.map(Duration::from_secs))
    }

    fn flag(&self, var: &'static str) -> Result<Option<bool>, ConfigError> {
        let Some(value) = self.raw(var) else {
            return Ok(None);
        };
        match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidEnv {
                var,
                value,
                reason: "expected a boolean".to_string(),
            }),
        }
    }

    /// Comma separated list; blank entries are skipped.
    fn list<T>(&self, var: &'static str) -> Result<Option<Vec<T>>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let Some(value) = self.raw(var) else {
            return Ok(None);
        };
        let mut out = Vec::new();
        for item in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let parsed = item.parse().map_err(|e: T::Err| ConfigError::InvalidEnv {
                var,
                value: value.clone(),
                reason: e.to_string(),
            })?;
            out.push(parsed);
        }
        Ok(Some(out))
    }
}
