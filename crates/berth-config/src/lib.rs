//! Configuration for the berth control plane.
//!
//! Settings load from environment variables first and may be overlaid by an
//! optional `berth.toml` file. Configuration is carried explicitly into the
//! provisioner, executor, repositories, and proxy manager at startup — there
//! are no process-wide singletons.

use std::collections::BTreeMap;
use std::env;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use berth_types::{Currency, PlanTier};

/// Connection facts for the external relational store. The core never opens
/// connections itself; these are surfaced to whatever repository backend the
/// deployment wires in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbSettings {
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub name: String,
}

impl DbSettings {
    pub fn url(&self) -> String {
        format!(
            "postgresql://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.name
        )
    }
}

/// Payment gateway credentials (PayTR-compatible).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    pub merchant_id: String,
    pub merchant_key: String,
    pub merchant_salt: String,
    /// Mirrors the gateway's `"1"`/`"0"` convention.
    pub test_mode: bool,
    /// Minutes the hosted payment page stays valid.
    pub timeout_limit: u32,
    /// Token endpoint; overridable so tests can point at a local server.
    pub token_url: String,
    /// Hosted iframe URL pattern with a `{token}` placeholder.
    pub iframe_url: String,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            merchant_id: String::new(),
            merchant_key: String::new(),
            merchant_salt: String::new(),
            test_mode: true,
            timeout_limit: 30,
            token_url: "https://www.paytr.com/odeme/api/get-token".to_string(),
            iframe_url: "https://www.paytr.com/odeme/guvenli/{token}".to_string(),
        }
    }
}

impl GatewaySettings {
    pub fn is_configured(&self) -> bool {
        !self.merchant_id.is_empty()
            && !self.merchant_key.is_empty()
            && !self.merchant_salt.is_empty()
    }
}

/// One subscription tier of the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSpec {
    pub name: String,
    /// Monthly price per currency, in minor units (cents / kuruş).
    pub prices: BTreeMap<Currency, i64>,
    pub max_workspaces: u32,
    pub storage_per_workspace_gb: u32,
    pub features: Vec<String>,
}

/// The static plan catalog. Dynamic currency conversion may override the
/// non-base prices when exchange rates are available.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanCatalog {
    plans: BTreeMap<PlanTier, PlanSpec>,
}

impl Default for PlanCatalog {
    fn default() -> Self {
        let mut plans = BTreeMap::new();
        plans.insert(
            PlanTier::Starter,
            PlanSpec {
                name: "Starter".to_string(),
                prices: BTreeMap::from([
                    (Currency::Try, 87_000),
                    (Currency::Usd, 2_900),
                    (Currency::Eur, 2_700),
                ]),
                max_workspaces: 5,
                storage_per_workspace_gb: 10,
                features: vec![
                    "5 development workspaces".to_string(),
                    "10GB storage per workspace".to_string(),
                    "Email support".to_string(),
                ],
            },
        );
        plans.insert(
            PlanTier::Team,
            PlanSpec {
                name: "Team".to_string(),
                prices: BTreeMap::from([
                    (Currency::Try, 297_000),
                    (Currency::Usd, 9_900),
                    (Currency::Eur, 9_200),
                ]),
                max_workspaces: 20,
                storage_per_workspace_gb: 50,
                features: vec![
                    "20 development workspaces".to_string(),
                    "50GB storage per workspace".to_string(),
                    "Priority support".to_string(),
                ],
            },
        );
        plans.insert(
            PlanTier::Enterprise,
            PlanSpec {
                name: "Enterprise".to_string(),
                prices: BTreeMap::from([
                    (Currency::Try, 897_000),
                    (Currency::Usd, 29_900),
                    (Currency::Eur, 27_900),
                ]),
                max_workspaces: 150,
                storage_per_workspace_gb: 250,
                features: vec![
                    "Up to 150 development workspaces".to_string(),
                    "250GB storage per workspace".to_string(),
                    "Dedicated support".to_string(),
                ],
            },
        );
        Self { plans }
    }
}

impl PlanCatalog {
    pub fn get(&self, tier: PlanTier) -> &PlanSpec {
        // The catalog always carries all three tiers.
        &self.plans[&tier]
    }

    pub fn price(&self, tier: PlanTier, currency: Currency) -> Option<i64> {
        self.plans.get(&tier).and_then(|p| p.prices.get(&currency)).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PlanTier, &PlanSpec)> {
        self.plans.iter().map(|(t, p)| (*t, p))
    }
}

/// Everything the core needs to run, resolved once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub secret_key: String,
    pub base_url: String,
    /// Apex domain workspaces hang off of (`<subdomain>.<base_domain>`).
    pub base_domain: String,
    pub db: DbSettings,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub workspace_base_dir: String,
    pub proxy_config_path: String,
    pub systemd_unit_dir: String,
    pub default_disk_quota_gb: u32,
    pub default_auto_stop_hours: u32,
    pub metrics_retention_days: u32,
    pub trial_days: u32,
    pub supported_currencies: Vec<Currency>,
    pub default_currency: Currency,
    /// Daily exchange-rate JSON feed (rates keyed by currency code).
    pub rates_feed_url: String,
    pub gateway: GatewaySettings,
    #[serde(default)]
    pub plans: PlanCatalog,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            secret_key: "dev-secret-change-in-production".to_string(),
            base_url: "http://localhost:8000".to_string(),
            base_domain: "berth.dev".to_string(),
            db: DbSettings {
                user: "berth".to_string(),
                password: "berth".to_string(),
                host: "localhost".to_string(),
                port: 5432,
                name: "berth".to_string(),
            },
            port_range_start: 8001,
            port_range_end: 8100,
            workspace_base_dir: "/home".to_string(),
            proxy_config_path: "/etc/traefik/config/workspaces.yml".to_string(),
            systemd_unit_dir: "/etc/systemd/system".to_string(),
            default_disk_quota_gb: 10,
            default_auto_stop_hours: 0,
            metrics_retention_days: 30,
            trial_days: 14,
            supported_currencies: vec![Currency::Try, Currency::Usd, Currency::Eur],
            default_currency: Currency::Try,
            rates_feed_url: "https://api.frankfurter.dev/v1/latest".to_string(),
            gateway: GatewaySettings::default(),
            plans: PlanCatalog::default(),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

impl Settings {
    /// Builds settings from environment variables, falling back to the
    /// defaults above for anything unset.
    pub fn from_env() -> Self {
        let defaults = Settings::default();
        Settings {
            secret_key: env_string("SECRET_KEY", &defaults.secret_key),
            base_url: env_string("BASE_URL", &defaults.base_url),
            base_domain: env_string("BASE_DOMAIN", &defaults.base_domain),
            db: DbSettings {
                user: env_string("DB_USER", &defaults.db.user),
                password: env_string("DB_PASS", &defaults.db.password),
                host: env_string("DB_HOST", &defaults.db.host),
                port: env_or("DB_PORT", defaults.db.port),
                name: env_string("DB_NAME", &defaults.db.name),
            },
            port_range_start: env_or("WORKSPACE_PORT_RANGE_START", defaults.port_range_start),
            port_range_end: env_or("WORKSPACE_PORT_RANGE_END", defaults.port_range_end),
            workspace_base_dir: env_string("WORKSPACE_BASE_DIR", &defaults.workspace_base_dir),
            proxy_config_path: env_string("PROXY_CONFIG_PATH", &defaults.proxy_config_path),
            systemd_unit_dir: env_string("SYSTEMD_UNIT_DIR", &defaults.systemd_unit_dir),
            default_disk_quota_gb: env_or("DEFAULT_DISK_QUOTA_GB", defaults.default_disk_quota_gb),
            default_auto_stop_hours: env_or(
                "DEFAULT_AUTO_STOP_HOURS",
                defaults.default_auto_stop_hours,
            ),
            metrics_retention_days: env_or(
                "METRICS_RETENTION_DAYS",
                defaults.metrics_retention_days,
            ),
            trial_days: env_or("TRIAL_DAYS", defaults.trial_days),
            supported_currencies: defaults.supported_currencies,
            default_currency: env::var("DEFAULT_CURRENCY")
                .ok()
                .and_then(|v| Currency::parse(&v))
                .unwrap_or(defaults.default_currency),
            rates_feed_url: env_string("RATES_FEED_URL", &defaults.rates_feed_url),
            gateway: GatewaySettings {
                merchant_id: env_string("PAYTR_MERCHANT_ID", ""),
                merchant_key: env_string("PAYTR_MERCHANT_KEY", ""),
                merchant_salt: env_string("PAYTR_MERCHANT_SALT", ""),
                test_mode: env_string("PAYTR_TEST_MODE", "1") == "1",
                timeout_limit: env_or("PAYTR_TIMEOUT_LIMIT", 30),
                token_url: env_string("PAYTR_TOKEN_URL", &defaults.gateway.token_url),
                iframe_url: env_string("PAYTR_IFRAME_URL", &defaults.gateway.iframe_url),
            },
            plans: defaults.plans,
        }
    }

    /// Loads from env, then overlays any fields present in the given TOML
    /// file. Unknown keys in the file are rejected so typos surface early.
    pub fn load(overlay: Option<&Path>) -> Result<Self> {
        let mut settings = Self::from_env();
        if let Some(path) = overlay {
            if path.exists() {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                let file: FileOverlay = toml::from_str(&raw)
                    .with_context(|| format!("failed to parse {}", path.display()))?;
                file.apply(&mut settings);
            }
        }
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.port_range_start <= self.port_range_end,
            "workspace port range is inverted: {}-{}",
            self.port_range_start,
            self.port_range_end
        );
        anyhow::ensure!(
            !self.workspace_base_dir.is_empty(),
            "workspace base dir must not be empty"
        );
        Ok(())
    }

    pub fn port_range_len(&self) -> usize {
        (self.port_range_end - self.port_range_start) as usize + 1
    }
}

/// Optional keys accepted from `berth.toml`.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileOverlay {
    base_url: Option<String>,
    base_domain: Option<String>,
    port_range_start: Option<u16>,
    port_range_end: Option<u16>,
    workspace_base_dir: Option<String>,
    proxy_config_path: Option<String>,
    systemd_unit_dir: Option<String>,
    default_disk_quota_gb: Option<u32>,
    default_auto_stop_hours: Option<u32>,
    metrics_retention_days: Option<u32>,
    trial_days: Option<u32>,
    rates_feed_url: Option<String>,
}

impl FileOverlay {
    fn apply(self, settings: &mut Settings) {
        macro_rules! overlay {
            ($($field:ident),* $(,)?) => {
                $(if let Some(v) = self.$field { settings.$field = v; })*
            };
        }
        overlay!(
            base_url,
            base_domain,
            port_range_start,
            port_range_end,
            workspace_base_dir,
            proxy_config_path,
            systemd_unit_dir,
            default_disk_quota_gb,
            default_auto_stop_hours,
            metrics_retention_days,
            trial_days,
            rates_feed_url,
        );
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use serial_test::serial;

    use super::*;

    #[test]
    fn defaults_are_sane() {
        let s = Settings::default();
        assert_eq!(s.port_range_start, 8001);
        assert_eq!(s.port_range_end, 8100);
        assert_eq!(s.port_range_len(), 100);
        assert_eq!(s.workspace_base_dir, "/home");
        assert!(s.validate().is_ok());
    }

    #[test]
    fn db_url_composes() {
        let db = DbSettings {
            user: "u".to_string(),
            password: "p".to_string(),
            host: "h".to_string(),
            port: 5433,
            name: "n".to_string(),
        };
        assert_eq!(db.url(), "postgresql://u:p@h:5433/n");
    }

    #[test]
    fn plan_catalog_matches_tier_limits() {
        let catalog = PlanCatalog::default();
        assert_eq!(catalog.get(PlanTier::Starter).max_workspaces, 5);
        assert_eq!(catalog.get(PlanTier::Team).max_workspaces, 20);
        assert_eq!(catalog.get(PlanTier::Enterprise).max_workspaces, 150);
        assert_eq!(catalog.get(PlanTier::Team).storage_per_workspace_gb, 50);
        assert_eq!(catalog.price(PlanTier::Team, Currency::Usd), Some(9_900));
    }

    #[test]
    #[serial]
    fn from_env_reads_overrides() {
        temp_env::with_vars(
            [
                ("WORKSPACE_PORT_RANGE_START", Some("9000")),
                ("WORKSPACE_PORT_RANGE_END", Some("9010")),
                ("BASE_DOMAIN", Some("ws.example.com")),
                ("PAYTR_MERCHANT_ID", Some("m-123")),
                ("PAYTR_TEST_MODE", Some("0")),
                ("DEFAULT_CURRENCY", Some("USD")),
            ],
            || {
                let s = Settings::from_env();
                assert_eq!(s.port_range_start, 9000);
                assert_eq!(s.port_range_end, 9010);
                assert_eq!(s.base_domain, "ws.example.com");
                assert_eq!(s.gateway.merchant_id, "m-123");
                assert!(!s.gateway.test_mode);
                assert_eq!(s.default_currency, Currency::Usd);
            },
        );
    }

    #[test]
    #[serial]
    fn toml_overlay_wins_over_env_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("tmp");
        writeln!(file, "base_domain = \"file.example.com\"").expect("write");
        writeln!(file, "trial_days = 7").expect("write");

        let s = Settings::load(Some(file.path())).expect("load");
        assert_eq!(s.base_domain, "file.example.com");
        assert_eq!(s.trial_days, 7);
    }

    #[test]
    #[serial]
    fn unknown_toml_keys_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().expect("tmp");
        writeln!(file, "base_domian = \"typo.example.com\"").expect("write");
        assert!(Settings::load(Some(file.path())).is_err());
    }

    #[test]
    fn inverted_port_range_fails_validation() {
        let s = Settings {
            port_range_start: 9000,
            port_range_end: 8000,
            ..Settings::default()
        };
        assert!(s.validate().is_err());
    }

    #[test]
    fn gateway_configured_requires_all_credentials() {
        let mut gw = GatewaySettings::default();
        assert!(!gw.is_configured());
        gw.merchant_id = "id".to_string();
        gw.merchant_key = "key".to_string();
        gw.merchant_salt = "salt".to_string();
        assert!(gw.is_configured());
    }
}
