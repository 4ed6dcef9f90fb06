//! Reverse-proxy dynamic configuration for workspace routing.
//!
//! The proxy (Traefik-compatible) watches a single YAML file describing
//! `http.routers`, `http.services`, and `http.middlewares`. This crate owns
//! that file: it loads tolerantly (missing keys become empty maps), mutates
//! per-workspace entries, and writes atomically (tmp + rename) under a
//! process-wide mutex so concurrent provisionings never tear the config.
//!
//! Each workspace gets:
//! - a router `workspace-<sanitized-subdomain>` with a `Host` rule on the
//!   `websecure` entry point at priority 100 (beating the app's catch-all),
//! - a headers middleware injecting `X-Workspace-Host` (first in the chain,
//!   so the forward-auth subrequest sees it),
//! - a single-server load balancer pointing at `http://127.0.0.1:<port>`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Serializes writers of the shared config file within this process.
static CONFIG_LOCK: Mutex<()> = Mutex::new(());

pub const FORWARD_AUTH_MIDDLEWARE: &str = "workspaceAuth";
pub const SECURE_HEADERS_MIDDLEWARE: &str = "secureHeaders";
pub const RATE_LIMIT_MIDDLEWARE: &str = "rateLimitWorkspace";

/// Top-level dynamic configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DynamicConfig {
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default)]
    pub routers: BTreeMap<String, Router>,
    #[serde(default)]
    pub services: BTreeMap<String, Service>,
    /// Middleware bodies vary per kind; kept as raw YAML values.
    #[serde(default)]
    pub middlewares: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Router {
    pub rule: String,
    #[serde(rename = "entryPoints")]
    pub entry_points: Vec<String>,
    pub service: String,
    pub middlewares: Vec<String>,
    /// Empty mapping selects the proxy's default certificate.
    #[serde(default)]
    pub tls: serde_yaml::Value,
    #[serde(default)]
    pub priority: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    #[serde(rename = "loadBalancer")]
    pub load_balancer: LoadBalancer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancer {
    pub servers: Vec<ServerUrl>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerUrl {
    pub url: String,
}

/// One row of [`ProxyManager::list_routes`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteInfo {
    pub router: String,
    pub rule: String,
    pub backend: String,
}

/// Manages the per-workspace entries of the dynamic config file.
#[derive(Debug, Clone)]
pub struct ProxyManager {
    config_path: PathBuf,
    base_domain: String,
    /// Address the forward-auth middleware calls, e.g.
    /// `https://berth.dev/api/auth/verify`.
    forward_auth_address: String,
}

impl ProxyManager {
    pub fn new(
        config_path: impl Into<PathBuf>,
        base_domain: impl Into<String>,
        forward_auth_address: impl Into<String>,
    ) -> Self {
        Self {
            config_path: config_path.into(),
            base_domain: base_domain.into(),
            forward_auth_address: forward_auth_address.into(),
        }
    }

    /// Router/service/middleware key for a subdomain (dots become dashes).
    pub fn router_name(subdomain: &str) -> String {
        format!("workspace-{}", subdomain.replace('.', "-"))
    }

    pub fn workspace_host(&self, subdomain: &str) -> String {
        format!("{}.{}", subdomain, self.base_domain)
    }

    /// Adds (or replaces) the router, headers middleware, and service for a
    /// workspace. Returns the public URL.
    pub fn add_route(&self, subdomain: &str, port: u16) -> Result<String> {
        let _guard = CONFIG_LOCK.lock().unwrap_or_else(|e| e.into_inner());

        let mut config = self.load()?;
        self.ensure_default_middlewares(&mut config)?;

        let router_name = Self::router_name(subdomain);
        let host = self.workspace_host(subdomain);
        let headers_name = format!("{router_name}-headers");

        config.http.middlewares.insert(
            headers_name.clone(),
            host_header_middleware(&host)?,
        );

        config.http.routers.insert(
            router_name.clone(),
            Router {
                rule: format!("Host(`{host}`)"),
                entry_points: vec!["websecure".to_string()],
                service: router_name.clone(),
                // The workspace host header must be set before the
                // forward-auth subrequest fires.
                middlewares: vec![
                    headers_name,
                    FORWARD_AUTH_MIDDLEWARE.to_string(),
                    SECURE_HEADERS_MIDDLEWARE.to_string(),
                    RATE_LIMIT_MIDDLEWARE.to_string(),
                ],
                tls: serde_yaml::Value::Mapping(Default::default()),
                priority: 100,
            },
        );

        config.http.services.insert(
            router_name.clone(),
            Service {
                load_balancer: LoadBalancer {
                    servers: vec![ServerUrl {
                        url: format!("http://127.0.0.1:{port}"),
                    }],
                },
            },
        );

        self.save(&config)?;
        info!(router = %router_name, %host, port, "added proxy route");
        Ok(format!("https://{host}"))
    }

    /// Removes the workspace's router, service, and headers middleware.
    /// Removing a route that does not exist is a no-op.
    pub fn remove_route(&self, subdomain: &str) -> Result<()> {
        let _guard = CONFIG_LOCK.lock().unwrap_or_else(|e| e.into_inner());

        let mut config = self.load()?;
        let router_name = Self::router_name(subdomain);

        config.http.routers.remove(&router_name);
        config.http.services.remove(&router_name);
        config
            .http
            .middlewares
            .remove(&format!("{router_name}-headers"));

        self.save(&config)?;
        info!(router = %router_name, "removed proxy route");
        Ok(())
    }

    /// Repoints an existing route at a new backend port.
    pub fn update_route(&self, subdomain: &str, new_port: u16) -> Result<()> {
        let _guard = CONFIG_LOCK.lock().unwrap_or_else(|e| e.into_inner());

        let mut config = self.load()?;
        let router_name = Self::router_name(subdomain);

        let service = config
            .http
            .services
            .get_mut(&router_name)
            .with_context(|| format!("router {router_name} not found"))?;
        service.load_balancer.servers = vec![ServerUrl {
            url: format!("http://127.0.0.1:{new_port}"),
        }];

        self.save(&config)?;
        info!(router = %router_name, new_port, "updated proxy route");
        Ok(())
    }

    /// All `workspace-*` routes currently in the file.
    pub fn list_routes(&self) -> Result<Vec<RouteInfo>> {
        let config = self.load()?;
        let mut routes = Vec::new();
        for (name, router) in &config.http.routers {
            if !name.starts_with("workspace-") {
                continue;
            }
            let backend = config
                .http
                .services
                .get(name)
                .and_then(|s| s.load_balancer.servers.first())
                .map(|s| s.url.clone())
                .unwrap_or_default();
            routes.push(RouteInfo {
                router: name.clone(),
                rule: router.rule.clone(),
                backend,
            });
        }
        Ok(routes)
    }

    /// Loads the config file, tolerating a missing file and missing keys.
    pub fn load(&self) -> Result<DynamicConfig> {
        if !self.config_path.exists() {
            return Ok(DynamicConfig::default());
        }
        let raw = std::fs::read_to_string(&self.config_path)
            .with_context(|| format!("failed to read {}", self.config_path.display()))?;
        if raw.trim().is_empty() {
            return Ok(DynamicConfig::default());
        }
        match serde_yaml::from_str(&raw) {
            Ok(config) => Ok(config),
            Err(err) => {
                // A torn or hand-mangled file must not brick provisioning.
                warn!(
                    path = %self.config_path.display(),
                    %err,
                    "proxy config unparseable, starting from empty document"
                );
                Ok(DynamicConfig::default())
            }
        }
    }

    /// Atomic write: serialize to a sibling tmp file, then rename over.
    fn save(&self, config: &DynamicConfig) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let yaml = serde_yaml::to_string(config).context("failed to serialize proxy config")?;
        let tmp = self.config_path.with_extension("tmp");
        std::fs::write(&tmp, yaml)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.config_path)
            .with_context(|| format!("failed to replace {}", self.config_path.display()))?;
        Ok(())
    }

    /// Installs the shared middlewares if the file does not carry them yet.
    /// Existing definitions are left untouched so operators may tune them.
    fn ensure_default_middlewares(&self, config: &mut DynamicConfig) -> Result<()> {
        let defaults = [
            (SECURE_HEADERS_MIDDLEWARE, secure_headers_middleware()?),
            (RATE_LIMIT_MIDDLEWARE, rate_limit_middleware()?),
            (
                FORWARD_AUTH_MIDDLEWARE,
                forward_auth_middleware(&self.forward_auth_address)?,
            ),
        ];
        for (name, body) in defaults {
            config
                .http
                .middlewares
                .entry(name.to_string())
                .or_insert(body);
        }
        Ok(())
    }
}

fn host_header_middleware(host: &str) -> Result<serde_yaml::Value> {
    let yaml = format!(
        "headers:\n  customRequestHeaders:\n    X-Workspace-Host: {host}\n"
    );
    serde_yaml::from_str(&yaml).context("invalid headers middleware")
}

fn secure_headers_middleware() -> Result<serde_yaml::Value> {
    serde_yaml::from_str(
        r#"
headers:
  sslRedirect: true
  browserXssFilter: true
  contentTypeNosniff: true
  forceSTSHeader: true
  stsIncludeSubdomains: true
  stsPreload: true
  stsSeconds: 31536000
  customFrameOptionsValue: SAMEORIGIN
"#,
    )
    .context("invalid secure headers middleware")
}

fn rate_limit_middleware() -> Result<serde_yaml::Value> {
    serde_yaml::from_str(
        r#"
rateLimit:
  average: 100
  burst: 50
  period: 1m
"#,
    )
    .context("invalid rate limit middleware")
}

/// Forward-auth calls the app per request with the original `Cookie` header;
/// on 200 the upstream is reached, otherwise the app redirects to login.
fn forward_auth_middleware(address: &str) -> Result<serde_yaml::Value> {
    let yaml = format!(
        r#"
forwardAuth:
  address: {address}
  trustForwardHeader: true
  authResponseHeadersRegex: ^X-Auth-
  authRequestHeaders:
    - Cookie
    - X-Workspace-Host
"#
    );
    serde_yaml::from_str(&yaml).context("invalid forward auth middleware")
}
