use portgate::admin::{AdminServer, ProxySet, PKG_NAME, VERSION};
use portgate::config::{HostConfig, LogTarget};
use portgate::docker::DockerRuntime;
use portgate::proxy::{Proxy, ProxyContext};
use portgate::resolver::{ResolverRegistry, GC_INTERVAL};
use portgate::stats::MetricsRegistry;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match HostConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            init_logging(LogTarget::Stderr);
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            return Err(e);
        }
    };

    init_logging(config.log);
    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    #[cfg(unix)]
    if let Some(limit) = config.rlimit {
        match raise_nofile_limit(limit) {
            Ok(()) => info!(limit, "Raised open file limit"),
            Err(e) => warn!(limit, error = %e, "Failed to raise open file limit"),
        }
    }

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let resolvers = ResolverRegistry::with_static();
    let gc_handle = if let Some(dns) = &config.dns {
        let server = parse_dns_server(dns)?;
        let cache = resolvers.register_srv(server)?;
        info!(server = %server, "SRV resolver registered");
        Some(tokio::spawn(cache.run_gc(GC_INTERVAL, shutdown_rx.clone())))
    } else {
        None
    };

    let metrics = Arc::new(MetricsRegistry::new());
    let host = Arc::new(config);
    let mut ctx = ProxyContext::new(Arc::clone(&host), resolvers, Arc::clone(&metrics));

    if let Some(endpoint) = &host.docker {
        let runtime = DockerRuntime::connect(Some(endpoint)).await?;
        info!(endpoint = %endpoint, "Container runtime connected");
        ctx = ctx.with_runtime(Arc::new(runtime));
    }

    // Start one proxy per backend; a failing backend does not stop the others
    let proxies = Arc::new(ProxySet::new());
    let mut names: Vec<&String> = host.backends.keys().collect();
    names.sort();
    for name in names {
        let backend = host.backends[name].clone();
        let proxy = match Proxy::new(backend, &ctx) {
            Ok(proxy) => Arc::new(proxy),
            Err(e) => {
                error!(backend = %name, error = %e, "Failed to create proxy, skipping backend");
                continue;
            }
        };
        if let Err(e) = proxy.bind().await {
            error!(backend = %name, error = %e, "Failed to bind proxy, skipping backend");
            continue;
        }

        proxies.insert(name, Arc::clone(&proxy));
        proxies.spawn(name, proxy);
    }
    info!(running = proxies.len(), configured = host.backends.len(), "Proxies started");

    let stats_handle = tokio::spawn(
        Arc::clone(&metrics).run_reporter(host.stats_interval(), shutdown_rx.clone()),
    );

    let admin_addr: SocketAddr = host.admin_addr.parse().map_err(|e| {
        error!(admin_addr = %host.admin_addr, error = %e, "Invalid admin bind address");
        anyhow::anyhow!("Invalid admin bind address '{}': {}", host.admin_addr, e)
    })?;
    let admin_server = AdminServer::new(admin_addr, Arc::clone(&proxies), ctx.clone(), shutdown_rx.clone());
    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "Admin server error");
        }
    });

    wait_for_shutdown().await;

    // Signal shutdown
    shutdown_tx.send_replace(true);

    info!("Closing all proxies...");
    proxies.close_all().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = admin_handle.await;
        let _ = stats_handle.await;
        if let Some(handle) = gc_handle {
            let _ = handle.await;
        }
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

fn init_logging(target: LogTarget) {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("portgate=debug".parse().expect("valid log directive"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match target {
        LogTarget::Stderr => builder.with_writer(std::io::stderr).init(),
        LogTarget::Stdout => builder.with_writer(std::io::stdout).init(),
    }
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received SIGINT (Ctrl+C), shutting down...");
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
        }
        info!("Received Ctrl+C, shutting down...");
    }
}

/// DNS server address, defaulting to port 53
fn parse_dns_server(dns: &str) -> anyhow::Result<SocketAddr> {
    dns.parse::<SocketAddr>()
        .or_else(|_| format!("{}:53", dns).parse::<SocketAddr>())
        .map_err(|e| anyhow::anyhow!("Invalid dns server '{}': {}", dns, e))
}

#[cfg(unix)]
fn raise_nofile_limit(limit: u64) -> anyhow::Result<()> {
    let mut current = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut current) } != 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    let target = limit as libc::rlim_t;
    current.rlim_cur = target;
    if current.rlim_max < target {
        // only succeeds with sufficient privileges
        current.rlim_max = target;
    }

    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &current) } != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

fn print_startup_banner(config: &HostConfig) {
    info!(name = PKG_NAME, version = VERSION, "Starting proxy server");
    info!(
        admin_addr = %config.admin_addr,
        admin_auth = config.admin_token.is_some(),
        dns = ?config.dns,
        docker = ?config.docker,
        max_listen_errors = config.max_listen_errors,
        stats_interval_secs = config.stats_interval_secs,
        "Server configuration"
    );
    info!(
        backend_count = config.backends.len(),
        backends = ?config.backends.keys().collect::<Vec<_>>(),
        domains = ?config.domains.keys().collect::<Vec<_>>(),
        "Configured backends"
    );
}
