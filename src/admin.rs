use crate::config::{BackendConfig, Protocol};
use crate::proxy::{Proxy, ProxyContext};
use dashmap::DashMap;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the proxy
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

fn error_json(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(status, serde_json::json!({ "error": message }).to_string())
}

/// Running proxies keyed by backend name
#[derive(Default)]
pub struct ProxySet {
    proxies: DashMap<String, Arc<Proxy>>,
}

impl ProxySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a proxy unless the name is taken
    pub fn insert(&self, name: &str, proxy: Arc<Proxy>) -> bool {
        match self.proxies.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(proxy);
                true
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Proxy>> {
        self.proxies.get(name).map(|p| Arc::clone(p.value()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.proxies.contains_key(name)
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Proxy>> {
        self.proxies.remove(name).map(|(_, p)| p)
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    /// Backend configurations sorted by name
    pub fn configs(&self) -> Vec<BackendConfig> {
        let mut configs: Vec<_> = self
            .proxies
            .iter()
            .map(|p| p.value().backend().clone())
            .collect();
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        configs
    }

    /// Serve a registered proxy in the background.
    ///
    /// A proxy whose listener fails is taken out of the set so its name can be
    /// reused; a newer proxy registered under the same name is left alone.
    pub fn spawn(self: &Arc<Self>, name: &str, proxy: Arc<Proxy>) -> tokio::task::JoinHandle<()> {
        let set = Arc::clone(self);
        let name = name.to_string();
        tokio::spawn(async move {
            if let Err(e) = proxy.start().await {
                error!(backend = %name, error = %e, "Proxy stopped with error");
                if set.remove_if_same(&name, &proxy) {
                    warn!(backend = %name, "Failed backend removed");
                }
            }
        })
    }

    fn remove_if_same(&self, name: &str, proxy: &Arc<Proxy>) -> bool {
        self.proxies
            .remove_if(name, |_, current| Arc::ptr_eq(current, proxy))
            .is_some()
    }

    /// Close and remove every proxy, draining them concurrently
    pub async fn close_all(&self) {
        let names: Vec<String> = self.proxies.iter().map(|p| p.key().clone()).collect();
        let closing = names
            .iter()
            .filter_map(|name| self.remove(name))
            .map(|proxy| async move { proxy.close().await });
        futures::future::join_all(closing).await;
    }
}

struct AdminState {
    proxies: Arc<ProxySet>,
    ctx: ProxyContext,
    auth_token: Option<String>,
}

/// Admin API server for inspecting and changing the running backends
pub struct AdminServer {
    bind_addr: SocketAddr,
    state: Arc<AdminState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        proxies: Arc<ProxySet>,
        ctx: ProxyContext,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let auth_token = ctx.host.admin_token.clone();
        Self {
            bind_addr,
            state: Arc::new(AdminState {
                proxies,
                ctx,
                auth_token,
            }),
            shutdown_rx,
        }
    }

    pub fn auth_enabled(&self) -> bool {
        self.state.auth_token.is_some()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind admin API on {}: {}", self.bind_addr, e))?;
        self.serve(listener).await
    }

    /// Serve admin requests on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local = listener.local_addr()?;
        info!(addr = %local, auth = self.auth_enabled(), "Admin API server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                let service = service_fn(move |req| {
                                    let state = Arc::clone(&state);
                                    async move { handle_admin_request(req, state).await }
                                });
                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection(TokioIo::new(stream), service)
                                    .await
                                {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

fn check_auth(req: &Request<Incoming>, expected_token: Option<&str>) -> bool {
    let Some(expected) = expected_token else {
        return true;
    };
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(|token| token == expected)
        .unwrap_or(false)
}

async fn handle_admin_request(
    req: Request<Incoming>,
    state: Arc<AdminState>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let id = path.trim_start_matches('/').to_string();

    debug!(%method, %path, "Admin API request");

    let response = match (&method, id.as_str()) {
        (&Method::GET, "health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        (&Method::GET, "stats") => match serde_json::to_string(&state.ctx.metrics.snapshot()) {
            Ok(body) => json_response(StatusCode::OK, body),
            Err(e) => error_json(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
        },

        (&Method::GET, "") => match serde_json::to_string(&state.proxies.configs()) {
            Ok(body) => json_response(StatusCode::OK, body),
            Err(e) => error_json(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
        },

        (&Method::GET, id) => match state.proxies.get(id) {
            Some(proxy) => match serde_json::to_string(proxy.backend()) {
                Ok(body) => json_response(StatusCode::OK, body),
                Err(e) => error_json(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
            },
            None => error_json(StatusCode::NOT_FOUND, "backend not found"),
        },

        (&Method::POST, id) | (&Method::DELETE, id) if !check_auth(&req, state.auth_token.as_deref()) => {
            warn!(%method, backend = id, "Unauthorized admin API request");
            error_json(StatusCode::UNAUTHORIZED, "unauthorized")
        }

        (&Method::POST, "") | (&Method::DELETE, "") => {
            error_json(StatusCode::BAD_REQUEST, "missing backend name")
        }

        (&Method::POST, _) => {
            let body = req.into_body().collect().await?.to_bytes();
            add_backend(&state, &id, &body).await
        }

        (&Method::DELETE, id) => match state.proxies.remove(id) {
            Some(proxy) => {
                proxy.close().await;
                info!(backend = id, "Backend removed");
                response(StatusCode::NO_CONTENT, Bytes::new())
            }
            None => error_json(StatusCode::NOT_FOUND, "backend not found"),
        },

        _ => error_json(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
    };

    Ok(response)
}

/// Register and start a backend from a JSON body
async fn add_backend(state: &AdminState, id: &str, body: &[u8]) -> Response<Full<Bytes>> {
    let mut backend: BackendConfig = match serde_json::from_slice(body) {
        Ok(backend) => backend,
        Err(e) => return error_json(StatusCode::BAD_REQUEST, &format!("invalid backend: {}", e)),
    };
    backend.name = id.to_string();

    if let Err(e) = backend.validate() {
        return error_json(StatusCode::BAD_REQUEST, &e);
    }
    if backend.proto == Protocol::Http && state.ctx.host.domains.is_empty() {
        return error_json(StatusCode::BAD_REQUEST, "http backends require configured domains");
    }
    if state.proxies.contains(id) {
        return error_json(StatusCode::CONFLICT, "backend already exists");
    }

    let proxy = match Proxy::new(backend, &state.ctx) {
        Ok(proxy) => Arc::new(proxy),
        Err(e) => {
            error!(backend = id, error = %e, "Failed to create proxy");
            return error_json(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
        }
    };
    if let Err(e) = proxy.bind().await {
        error!(backend = id, error = %e, "Failed to bind proxy");
        return error_json(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
    }

    // lost a race with a concurrent POST for the same name
    if !state.proxies.insert(id, Arc::clone(&proxy)) {
        proxy.close().await;
        return error_json(StatusCode::CONFLICT, "backend already exists");
    }

    let body = match serde_json::to_string(proxy.backend()) {
        Ok(body) => body,
        Err(e) => return error_json(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    };

    state.proxies.spawn(id, proxy);

    info!(backend = id, "Backend added");
    json_response(StatusCode::CREATED, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostConfig;
    use crate::resolver::ResolverRegistry;
    use crate::stats::MetricsRegistry;

    fn context() -> ProxyContext {
        ProxyContext::new(
            Arc::new(HostConfig::default()),
            ResolverRegistry::with_static(),
            Arc::new(MetricsRegistry::new()),
        )
    }

    fn backend(name: &str) -> BackendConfig {
        BackendConfig::tcp(name, 0, "127.0.0.1:9".parse().unwrap())
            .with_listen_ip("127.0.0.1".parse().unwrap())
    }

    #[tokio::test]
    async fn test_proxy_set_rejects_duplicates() {
        let ctx = context();
        let set = ProxySet::new();
        let first = Arc::new(Proxy::new(backend("a"), &ctx).unwrap());
        let second = Arc::new(Proxy::new(backend("a"), &ctx).unwrap());

        assert!(set.insert("a", first));
        assert!(!set.insert("a", second));
        assert_eq!(set.len(), 1);
    }

    #[tokio::test]
    async fn test_proxy_set_configs_sorted() {
        let ctx = context();
        let set = ProxySet::new();
        for name in ["zeta", "alpha", "mid"] {
            set.insert(name, Arc::new(Proxy::new(backend(name), &ctx).unwrap()));
        }

        let names: Vec<_> = set.configs().into_iter().map(|b| b.name).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[tokio::test]
    async fn test_close_all_empties_set() {
        let ctx = context();
        let set = ProxySet::new();
        let proxy = Arc::new(Proxy::new(backend("a"), &ctx).unwrap());
        proxy.bind().await.unwrap();
        set.insert("a", proxy);

        set.close_all().await;
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn test_failed_proxy_leaves_set() {
        let ctx = context();
        let set = Arc::new(ProxySet::new());
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let clash = BackendConfig::tcp("a", port, "127.0.0.1:9".parse().unwrap())
            .with_listen_ip("127.0.0.1".parse().unwrap());
        let proxy = Arc::new(Proxy::new(clash, &ctx).unwrap());
        set.insert("a", Arc::clone(&proxy));

        set.spawn("a", proxy).await.unwrap();
        assert!(!set.contains("a"));
        assert!(set.insert("a", Arc::new(Proxy::new(backend("a"), &ctx).unwrap())));
    }

    #[tokio::test]
    async fn test_failed_proxy_keeps_replacement() {
        let ctx = context();
        let set = ProxySet::new();
        let old = Arc::new(Proxy::new(backend("a"), &ctx).unwrap());
        let replacement = Arc::new(Proxy::new(backend("a"), &ctx).unwrap());
        set.insert("a", Arc::clone(&replacement));

        assert!(!set.remove_if_same("a", &old));
        assert!(set.remove_if_same("a", &replacement));
        assert!(set.is_empty());
    }
}
