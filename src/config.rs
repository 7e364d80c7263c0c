use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Name under which the DNS SRV resolver is registered
pub const SRV_RESOLVER: &str = "srv";

/// Name under which the literal `host:port` resolver is registered
pub const STATIC_RESOLVER: &str = "static";

/// Process-wide configuration
#[derive(Debug, Deserialize, Clone)]
pub struct HostConfig {
    /// Log output target
    #[serde(default)]
    pub log: LogTarget,

    /// DNS server used for SRV lookups (e.g. "172.17.42.1:53")
    pub dns: Option<String>,

    /// Container runtime endpoint (e.g. "unix:///var/run/docker.sock")
    pub docker: Option<String>,

    /// Consecutive accept errors tolerated before a listener gives up
    #[serde(default = "default_max_listen_errors")]
    pub max_listen_errors: usize,

    /// Soft RLIMIT_NOFILE to raise to at startup
    pub rlimit: Option<u64>,

    /// Bind address for the admin API
    #[serde(default = "default_admin_addr")]
    pub admin_addr: String,

    /// Bearer token required for mutating admin requests
    pub admin_token: Option<String>,

    /// Seconds between metrics snapshots in the log
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,

    /// Proxied backends keyed by name
    #[serde(default)]
    pub backends: HashMap<String, BackendConfig>,

    /// Per-domain resolver queries for http backends
    #[serde(default)]
    pub domains: HashMap<String, DomainConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogTarget {
    #[default]
    Stderr,
    Stdout,
}

/// Wire protocol of a backend
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Http,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Http => "http",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A domain served by http backends
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct DomainConfig {
    /// Query handed to the resolver (e.g. "blog.dev.docker.")
    pub query: String,

    /// Resolver name (default: "srv")
    #[serde(default = "default_resolver_name")]
    pub resolver: String,
}

/// Configuration for a single proxied backend
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct BackendConfig {
    /// Unique name, taken from the table key (or the admin API path)
    #[serde(default)]
    pub name: String,

    /// Protocol: "tcp" (default), "udp" or "http"
    #[serde(default)]
    pub proto: Protocol,

    /// IP the proxy binds to (default: 0.0.0.0)
    #[serde(default = "default_listen_ip")]
    pub listen_ip: IpAddr,

    /// Port the proxy binds to
    pub listen_port: u16,

    /// Static backend IP
    pub ip: Option<IpAddr>,

    /// Static backend port
    pub port: Option<u16>,

    /// Named resolver to look the destination up with
    pub resolver: Option<String>,

    /// Query for the resolver
    pub query: Option<String>,

    /// Number of workers serving connections concurrently (default: 1)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Accepted connections buffered while all workers are busy (default: 0)
    #[serde(default)]
    pub connection_buffer: usize,

    /// TLS certificate (PEM)
    pub cert: Option<String>,

    /// TLS private key (PEM)
    pub key: Option<String>,

    /// CA bundle (PEM); when set, clients must present a certificate signed by it
    pub ca: Option<String>,

    /// Container to start on traffic and stop when idle
    pub container: Option<String>,

    /// Idle-check interval in seconds (default: 300)
    pub container_stop_timeout: Option<u64>,
}

/// Where a backend's traffic goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Fixed address
    Static(SocketAddr),
    /// Looked up per connection through a named resolver
    Query { resolver: String, query: String },
}

impl BackendConfig {
    /// Create a tcp backend forwarding to a static address
    pub fn tcp(name: &str, listen_port: u16, backend: SocketAddr) -> Self {
        Self {
            name: name.to_string(),
            proto: Protocol::Tcp,
            listen_ip: default_listen_ip(),
            listen_port,
            ip: Some(backend.ip()),
            port: Some(backend.port()),
            resolver: None,
            query: None,
            max_concurrent: default_max_concurrent(),
            connection_buffer: 0,
            cert: None,
            key: None,
            ca: None,
            container: None,
            container_stop_timeout: None,
        }
    }

    /// Set the listen IP (builder pattern)
    pub fn with_listen_ip(mut self, ip: IpAddr) -> Self {
        self.listen_ip = ip;
        self
    }

    /// Set worker count and queue size (builder pattern)
    pub fn with_workers(mut self, max_concurrent: usize, connection_buffer: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self.connection_buffer = connection_buffer;
        self
    }

    /// Attach a container to wake on traffic (builder pattern)
    pub fn with_container(mut self, container: &str, stop_timeout_secs: u64) -> Self {
        self.container = Some(container.to_string());
        self.container_stop_timeout = Some(stop_timeout_secs);
        self
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_ip, self.listen_port)
    }

    pub fn tls_enabled(&self) -> bool {
        self.cert.is_some()
    }

    /// Capacity of the acceptance queue; an unbuffered queue still holds one slot
    pub fn queue_capacity(&self) -> usize {
        self.connection_buffer.max(1)
    }

    pub fn workers(&self) -> usize {
        self.max_concurrent.max(1)
    }

    pub fn idle_check_interval(&self) -> Duration {
        match self.container_stop_timeout {
            Some(secs) if secs > 0 => Duration::from_secs(secs),
            _ => Duration::from_secs(default_container_stop_timeout()),
        }
    }

    /// Work out where connections should be sent.
    ///
    /// A named resolver wins over a static address; a bare query uses the SRV resolver.
    pub fn destination(&self) -> Option<Destination> {
        if let (Some(resolver), Some(query)) = (&self.resolver, &self.query) {
            return Some(Destination::Query {
                resolver: resolver.clone(),
                query: query.clone(),
            });
        }
        if let (Some(ip), Some(port)) = (self.ip, self.port) {
            return Some(Destination::Static(SocketAddr::new(ip, port)));
        }
        self.query.as_ref().map(|query| Destination::Query {
            resolver: SRV_RESOLVER.to_string(),
            query: query.clone(),
        })
    }

    /// Validate the backend configuration
    pub fn validate(&self) -> Result<(), String> {
        let name = &self.name;

        if self.listen_port == 0 {
            return Err(format!("Backend '{}': 'listen_port' must be greater than 0", name));
        }

        if self.proto != Protocol::Http && self.destination().is_none() {
            return Err(format!(
                "Backend '{}': requires either 'ip' and 'port' or a 'query'",
                name
            ));
        }

        if self.resolver.is_some() && self.query.is_none() {
            return Err(format!("Backend '{}': 'resolver' requires a 'query'", name));
        }

        if self.cert.is_some() != self.key.is_some() {
            return Err(format!("Backend '{}': 'cert' and 'key' must be set together", name));
        }

        if self.ca.is_some() && self.cert.is_none() {
            return Err(format!("Backend '{}': 'ca' requires 'cert' and 'key'", name));
        }

        if self.proto == Protocol::Udp && self.tls_enabled() {
            return Err(format!("Backend '{}': TLS is not supported for udp", name));
        }

        Ok(())
    }
}

// Default value functions
fn default_max_listen_errors() -> usize {
    10
}

fn default_admin_addr() -> String {
    "127.0.0.1:3131".to_string()
}

fn default_stats_interval() -> u64 {
    60
}

fn default_listen_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_max_concurrent() -> usize {
    1
}

fn default_container_stop_timeout() -> u64 {
    300 // 5 minutes
}

fn default_resolver_name() -> String {
    SRV_RESOLVER.to_string()
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            log: LogTarget::default(),
            dns: None,
            docker: None,
            max_listen_errors: default_max_listen_errors(),
            rlimit: None,
            admin_addr: default_admin_addr(),
            admin_token: None,
            stats_interval_secs: default_stats_interval(),
            backends: HashMap::new(),
            domains: HashMap::new(),
        }
    }
}

impl HostConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse, name and validate a configuration document
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let mut config: HostConfig = toml::from_str(content)?;
        for (name, backend) in config.backends.iter_mut() {
            backend.name = name.clone();
        }
        config.validate()?;
        Ok(config)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs.max(1))
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        for backend in self.backends.values() {
            if let Err(e) = backend.validate() {
                errors.push(e);
            }
            if backend.proto == Protocol::Http && self.domains.is_empty() {
                errors.push(format!(
                    "Backend '{}': http backends require at least one [domains] entry",
                    backend.name
                ));
            }
        }

        for (domain, cfg) in &self.domains {
            if cfg.query.is_empty() {
                errors.push(format!("Domain '{}': 'query' must not be empty", domain));
            }
        }

        if !errors.is_empty() {
            errors.sort();
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
log = "stderr"
dns = "172.17.42.1:53"
max_listen_errors = 5

[backends.redis]
proto = "tcp"
listen_port = 6379
ip = "192.168.56.9"
port = 6379
max_concurrent = 20

[backends.benchmark]
proto = "tcp"
listen_port = 8081
query = "benchmark.dev.docker."
max_concurrent = 100
connection_buffer = 50

[backends.production]
proto = "http"
listen_port = 80
max_concurrent = 100

[domains.localhost]
query = "blog.dev.docker."
"#;

    #[test]
    fn test_parse_config() {
        let config = HostConfig::parse(SAMPLE).unwrap();

        assert_eq!(config.dns.as_deref(), Some("172.17.42.1:53"));
        assert_eq!(config.max_listen_errors, 5);
        assert_eq!(config.backends.len(), 3);

        let redis = &config.backends["redis"];
        assert_eq!(redis.name, "redis");
        assert_eq!(redis.proto, Protocol::Tcp);
        assert_eq!(redis.max_concurrent, 20);
        assert_eq!(
            redis.destination(),
            Some(Destination::Static("192.168.56.9:6379".parse().unwrap()))
        );

        let domain = &config.domains["localhost"];
        assert_eq!(domain.query, "blog.dev.docker.");
        assert_eq!(domain.resolver, SRV_RESOLVER);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = HostConfig::parse("").unwrap();

        assert_eq!(config.log, LogTarget::Stderr);
        assert_eq!(config.max_listen_errors, 10);
        assert_eq!(config.admin_addr, "127.0.0.1:3131");
        assert_eq!(config.stats_interval(), Duration::from_secs(60));
        assert!(config.backends.is_empty());
        assert!(config.dns.is_none());
    }

    #[test]
    fn test_backend_defaults() {
        let backend: BackendConfig = toml::from_str(
            r#"
listen_port = 9000
ip = "127.0.0.1"
port = 9001
"#,
        )
        .unwrap();

        assert_eq!(backend.proto, Protocol::Tcp);
        assert_eq!(backend.listen_addr(), "0.0.0.0:9000".parse().unwrap());
        assert_eq!(backend.workers(), 1);
        assert_eq!(backend.queue_capacity(), 1);
        assert_eq!(backend.idle_check_interval(), Duration::from_secs(300));
        assert!(!backend.tls_enabled());
    }

    #[test]
    fn test_idle_check_interval_override() {
        let backend = BackendConfig::tcp("svc", 9000, "127.0.0.1:9001".parse().unwrap())
            .with_container("svc", 1);
        assert_eq!(backend.idle_check_interval(), Duration::from_secs(1));

        let zero = BackendConfig::tcp("svc", 9000, "127.0.0.1:9001".parse().unwrap())
            .with_container("svc", 0);
        assert_eq!(zero.idle_check_interval(), Duration::from_secs(300));
    }

    #[test]
    fn test_destination_selection() {
        let mut backend = BackendConfig::tcp("svc", 9000, "10.0.0.1:80".parse().unwrap());
        assert_eq!(
            backend.destination(),
            Some(Destination::Static("10.0.0.1:80".parse().unwrap()))
        );

        // a named resolver takes precedence over the static address
        backend.resolver = Some("static".to_string());
        backend.query = Some("10.0.0.2:81".to_string());
        assert_eq!(
            backend.destination(),
            Some(Destination::Query {
                resolver: "static".to_string(),
                query: "10.0.0.2:81".to_string(),
            })
        );

        backend.resolver = None;
        backend.ip = None;
        assert_eq!(
            backend.destination(),
            Some(Destination::Query {
                resolver: SRV_RESOLVER.to_string(),
                query: "10.0.0.2:81".to_string(),
            })
        );
    }

    #[test]
    fn test_protocol_parsing() {
        let backend: BackendConfig = toml::from_str(
            r#"
proto = "udp"
listen_port = 53
ip = "8.8.8.8"
port = 53
"#,
        )
        .unwrap();
        assert_eq!(backend.proto, Protocol::Udp);
        assert_eq!(backend.proto.to_string(), "udp");

        let bad: Result<BackendConfig, _> = toml::from_str(
            r#"
proto = "sctp"
listen_port = 53
"#,
        );
        assert!(bad.is_err());
    }

    #[test]
    fn test_validate_requires_destination() {
        let result = HostConfig::parse(
            r#"
[backends.orphan]
listen_port = 9000
"#,
        );
        let err = result.unwrap_err().to_string();
        assert!(err.contains("orphan"));
        assert!(err.contains("requires either 'ip' and 'port' or a 'query'"));
    }

    #[test]
    fn test_validate_listen_port_for_every_protocol() {
        for proto in ["tcp", "udp", "http"] {
            let backend: BackendConfig = toml::from_str(&format!(
                "proto = \"{}\"\nlisten_port = 0\nip = \"127.0.0.1\"\nport = 53\n",
                proto
            ))
            .unwrap();
            let err = backend.validate().unwrap_err();
            assert!(err.contains("'listen_port' must be greater than 0"), "{}: {}", proto, err);
        }
    }

    #[test]
    fn test_validate_tls_pairs() {
        let mut backend = BackendConfig::tcp("secure", 9443, "127.0.0.1:9000".parse().unwrap());
        backend.cert = Some("cert.pem".to_string());
        assert!(backend.validate().unwrap_err().contains("'cert' and 'key'"));

        backend.key = Some("key.pem".to_string());
        assert!(backend.validate().is_ok());

        backend.cert = None;
        backend.key = None;
        backend.ca = Some("ca.pem".to_string());
        assert!(backend.validate().unwrap_err().contains("'ca' requires"));
    }

    #[test]
    fn test_validate_http_requires_domains() {
        let result = HostConfig::parse(
            r#"
[backends.web]
proto = "http"
listen_port = 8080
"#,
        );
        let err = result.unwrap_err().to_string();
        assert!(err.contains("at least one [domains] entry"));
    }

    #[test]
    fn test_validate_multiple_errors() {
        let result = HostConfig::parse(
            r#"
[backends.a]
listen_port = 0
ip = "127.0.0.1"
port = 1

[backends.b]
listen_port = 9000
"#,
        );
        let err = result.unwrap_err().to_string();
        assert!(err.contains("'listen_port' must be greater than 0"));
        assert!(err.contains("requires either 'ip' and 'port' or a 'query'"));
    }

    #[test]
    fn test_backend_json_round_trip_for_admin() {
        let backend = BackendConfig::tcp("api", 8080, "127.0.0.1:3000".parse().unwrap())
            .with_workers(4, 16);
        let json = serde_json::to_string(&backend).unwrap();
        assert!(json.contains("\"proto\":\"tcp\""));

        let parsed: BackendConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, backend);
    }
}
