use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::backend::BackendId;
use crate::governance::{self, CompiledGovernance, GovernanceError};
use crate::policy::FieldTransform;

const MIN_SIGNING_KEY_LEN: usize = 32;
const MIN_ADMIN_TOKEN_LEN: usize = 16;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub gateway: GatewayConfig,
    pub identity: IdentityConfig,
    pub orchestrator: OrchestratorConfig,
    pub audit: AuditConfig,
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub backends: Vec<BackendConfig>,
    pub governance: GovernanceConfig,
}

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Budget for one request, covering every backend attempt.
    pub request_deadline_ms: u64,
    pub rate_limit_window_secs: u64,
}

#[derive(Clone, Debug)]
pub struct IdentityConfig {
    pub max_credential_lifetime_secs: u64,
    pub clock_skew_secs: u64,
}

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub backend_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

#[derive(Clone, Debug)]
pub struct AuditConfig {
    pub signing_key: SecretString,
    pub queue_capacity: usize,
    pub max_batch: usize,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
    /// Admin routes are mounted only when this is set.
    pub admin_token: Option<SecretString>,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub supports_field_scoping: bool,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Raw governance tables as written in the config file. Names stay strings
/// here; [`governance::compile`] resolves and checks them.
#[derive(Clone, Debug, Default)]
pub struct GovernanceConfig {
    pub roles: BTreeMap<String, RoleConfig>,
    pub agents: Vec<AgentConfig>,
    pub revoked_agents: Vec<String>,
    pub policies: Vec<PolicyRuleConfig>,
    /// Keyed by source field name; applies whichever backend supplies it.
    pub transforms: BTreeMap<String, FieldTransform>,
    pub overrides: OverridesConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleConfig {
    pub scopes: Vec<String>,
    #[serde(default = "default_clearance")]
    pub clearance: String,
    #[serde(default)]
    pub requests_per_minute: u32,
}

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub id: String,
    pub role: String,
    pub secret: SecretString,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRuleConfig {
    pub role: String,
    pub intent: String,
    pub actions: Vec<String>,
    #[serde(default = "default_clearance")]
    pub classification: String,
    #[serde(default = "default_envelope_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default)]
    pub fields: Vec<FieldRuleConfig>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRuleConfig {
    pub backend: String,
    pub field: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default = "default_clearance")]
    pub sensitivity: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverridesConfig {
    #[serde(default)]
    pub blocked_resources: Vec<String>,
    #[serde(default)]
    pub restricted_patterns: Vec<String>,
    /// Repository name to the agents still allowed into it.
    #[serde(default)]
    pub restricted_repositories: BTreeMap<String, Vec<String>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub log_format: Option<LogFormat>,
    pub bind_address: Option<String>,
    pub server_port: Option<u16>,
    pub audit_signing_key: Option<String>,
    pub admin_token: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig { request_deadline_ms: 5_000, rate_limit_window_secs: 60 },
            identity: IdentityConfig { max_credential_lifetime_secs: 900, clock_skew_secs: 30 },
            orchestrator: OrchestratorConfig {
                backend_timeout_ms: 2_000,
                max_retries: 2,
                retry_base_delay_ms: 100,
                retry_max_delay_ms: 1_000,
            },
            audit: AuditConfig {
                signing_key: String::new().into(),
                queue_capacity: 1024,
                max_batch: 64,
            },
            database: DatabaseConfig {
                url: "sqlite://gatehouse.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
                admin_token: None,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
            backends: Vec::new(),
            governance: GovernanceConfig::default(),
        }
    }
}

fn default_clearance() -> String {
    "internal".to_string()
}

fn default_envelope_ttl_secs() -> u64 {
    300
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("gatehouse.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    /// Backends declared in `[[backends]]`, in declaration order.
    pub fn backend_ids(&self) -> Vec<BackendId> {
        self.backends.iter().map(|backend| BackendId(backend.id.clone())).collect()
    }

    /// Resolves the governance tables against the configured backends.
    pub fn compile_governance(&self) -> Result<CompiledGovernance, GovernanceError> {
        governance::compile(&self.governance, &self.backend_ids())
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(gateway) = patch.gateway {
            if let Some(request_deadline_ms) = gateway.request_deadline_ms {
                self.gateway.request_deadline_ms = request_deadline_ms;
            }
            if let Some(rate_limit_window_secs) = gateway.rate_limit_window_secs {
                self.gateway.rate_limit_window_secs = rate_limit_window_secs;
            }
        }

        if let Some(identity) = patch.identity {
            if let Some(max_credential_lifetime_secs) = identity.max_credential_lifetime_secs {
                self.identity.max_credential_lifetime_secs = max_credential_lifetime_secs;
            }
            if let Some(clock_skew_secs) = identity.clock_skew_secs {
                self.identity.clock_skew_secs = clock_skew_secs;
            }
        }

        if let Some(orchestrator) = patch.orchestrator {
            if let Some(backend_timeout_ms) = orchestrator.backend_timeout_ms {
                self.orchestrator.backend_timeout_ms = backend_timeout_ms;
            }
            if let Some(max_retries) = orchestrator.max_retries {
                self.orchestrator.max_retries = max_retries;
            }
            if let Some(retry_base_delay_ms) = orchestrator.retry_base_delay_ms {
                self.orchestrator.retry_base_delay_ms = retry_base_delay_ms;
            }
            if let Some(retry_max_delay_ms) = orchestrator.retry_max_delay_ms {
                self.orchestrator.retry_max_delay_ms = retry_max_delay_ms;
            }
        }

        if let Some(audit) = patch.audit {
            if let Some(signing_key_value) = audit.signing_key {
                self.audit.signing_key = secret_value(signing_key_value);
            }
            if let Some(queue_capacity) = audit.queue_capacity {
                self.audit.queue_capacity = queue_capacity;
            }
            if let Some(max_batch) = audit.max_batch {
                self.audit.max_batch = max_batch;
            }
        }

        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
            if let Some(admin_token_value) = server.admin_token {
                self.server.admin_token = Some(secret_value(admin_token_value));
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }

        if let Some(backends) = patch.backends {
            self.backends = backends;
        }

        if let Some(governance) = patch.governance {
            if let Some(roles) = governance.roles {
                self.governance.roles = roles;
            }
            if let Some(agents) = governance.agents {
                self.governance.agents = agents
                    .into_iter()
                    .map(|agent| AgentConfig {
                        id: agent.id,
                        role: agent.role,
                        secret: secret_value(agent.secret),
                    })
                    .collect();
            }
            if let Some(revoked_agents) = governance.revoked_agents {
                self.governance.revoked_agents = revoked_agents;
            }
            if let Some(policies) = governance.policies {
                self.governance.policies = policies;
            }
            if let Some(transforms) = governance.transforms {
                self.governance.transforms = transforms;
            }
            if let Some(overrides) = governance.overrides {
                self.governance.overrides = overrides;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("GATEHOUSE_GATEWAY_REQUEST_DEADLINE_MS") {
            self.gateway.request_deadline_ms =
                parse_u64("GATEHOUSE_GATEWAY_REQUEST_DEADLINE_MS", &value)?;
        }
        if let Some(value) = read_env("GATEHOUSE_GATEWAY_RATE_LIMIT_WINDOW_SECS") {
            self.gateway.rate_limit_window_secs =
                parse_u64("GATEHOUSE_GATEWAY_RATE_LIMIT_WINDOW_SECS", &value)?;
        }

        if let Some(value) = read_env("GATEHOUSE_IDENTITY_MAX_CREDENTIAL_LIFETIME_SECS") {
            self.identity.max_credential_lifetime_secs =
                parse_u64("GATEHOUSE_IDENTITY_MAX_CREDENTIAL_LIFETIME_SECS", &value)?;
        }
        if let Some(value) = read_env("GATEHOUSE_IDENTITY_CLOCK_SKEW_SECS") {
            self.identity.clock_skew_secs =
                parse_u64("GATEHOUSE_IDENTITY_CLOCK_SKEW_SECS", &value)?;
        }

        if let Some(value) = read_env("GATEHOUSE_ORCHESTRATOR_BACKEND_TIMEOUT_MS") {
            self.orchestrator.backend_timeout_ms =
                parse_u64("GATEHOUSE_ORCHESTRATOR_BACKEND_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = read_env("GATEHOUSE_ORCHESTRATOR_MAX_RETRIES") {
            self.orchestrator.max_retries =
                parse_u32("GATEHOUSE_ORCHESTRATOR_MAX_RETRIES", &value)?;
        }

        if let Some(value) = read_env("GATEHOUSE_AUDIT_SIGNING_KEY") {
            self.audit.signing_key = secret_value(value);
        }
        if let Some(value) = read_env("GATEHOUSE_AUDIT_QUEUE_CAPACITY") {
            self.audit.queue_capacity = parse_usize("GATEHOUSE_AUDIT_QUEUE_CAPACITY", &value)?;
        }
        if let Some(value) = read_env("GATEHOUSE_AUDIT_MAX_BATCH") {
            self.audit.max_batch = parse_usize("GATEHOUSE_AUDIT_MAX_BATCH", &value)?;
        }

        if let Some(value) = read_env("GATEHOUSE_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("GATEHOUSE_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("GATEHOUSE_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("GATEHOUSE_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("GATEHOUSE_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("GATEHOUSE_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("GATEHOUSE_SERVER_PORT") {
            self.server.port = parse_u16("GATEHOUSE_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("GATEHOUSE_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("GATEHOUSE_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }
        if let Some(value) = read_env("GATEHOUSE_SERVER_ADMIN_TOKEN") {
            self.server.admin_token = Some(secret_value(value));
        }

        let log_level =
            read_env("GATEHOUSE_LOGGING_LEVEL").or_else(|| read_env("GATEHOUSE_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("GATEHOUSE_LOGGING_FORMAT").or_else(|| read_env("GATEHOUSE_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(log_format) = overrides.log_format {
            self.logging.format = log_format;
        }
        if let Some(bind_address) = overrides.bind_address {
            self.server.bind_address = bind_address;
        }
        if let Some(server_port) = overrides.server_port {
            self.server.port = server_port;
        }
        if let Some(audit_signing_key) = overrides.audit_signing_key {
            self.audit.signing_key = secret_value(audit_signing_key);
        }
        if let Some(admin_token) = overrides.admin_token {
            self.server.admin_token = Some(secret_value(admin_token));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_gateway(&self.gateway)?;
        validate_identity(&self.identity)?;
        validate_orchestrator(&self.orchestrator)?;
        validate_audit(&self.audit)?;
        validate_database(&self.database)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        validate_backends(&self.backends)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("gatehouse.toml"), PathBuf::from("config/gatehouse.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_gateway(gateway: &GatewayConfig) -> Result<(), ConfigError> {
    if gateway.request_deadline_ms == 0 || gateway.request_deadline_ms > 120_000 {
        return Err(ConfigError::Validation(
            "gateway.request_deadline_ms must be in range 1..=120000".to_string(),
        ));
    }

    if gateway.rate_limit_window_secs == 0 {
        return Err(ConfigError::Validation(
            "gateway.rate_limit_window_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_identity(identity: &IdentityConfig) -> Result<(), ConfigError> {
    if identity.max_credential_lifetime_secs == 0 || identity.max_credential_lifetime_secs > 86_400
    {
        return Err(ConfigError::Validation(
            "identity.max_credential_lifetime_secs must be in range 1..=86400".to_string(),
        ));
    }

    if identity.clock_skew_secs > 300 {
        return Err(ConfigError::Validation(
            "identity.clock_skew_secs must not exceed 300".to_string(),
        ));
    }

    Ok(())
}

fn validate_orchestrator(orchestrator: &OrchestratorConfig) -> Result<(), ConfigError> {
    if orchestrator.backend_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "orchestrator.backend_timeout_ms must be greater than zero".to_string(),
        ));
    }

    if orchestrator.max_retries > 10 {
        return Err(ConfigError::Validation(
            "orchestrator.max_retries must not exceed 10".to_string(),
        ));
    }

    if orchestrator.retry_base_delay_ms > orchestrator.retry_max_delay_ms {
        return Err(ConfigError::Validation(
            "orchestrator.retry_base_delay_ms must not exceed orchestrator.retry_max_delay_ms"
                .to_string(),
        ));
    }

    Ok(())
}

fn validate_audit(audit: &AuditConfig) -> Result<(), ConfigError> {
    let signing_key = audit.signing_key.expose_secret();
    if signing_key.trim().is_empty() {
        return Err(ConfigError::Validation(
            "audit.signing_key is required. Set it in [audit] or via GATEHOUSE_AUDIT_SIGNING_KEY"
                .to_string(),
        ));
    }
    if signing_key.len() < MIN_SIGNING_KEY_LEN {
        return Err(ConfigError::Validation(format!(
            "audit.signing_key must be at least {MIN_SIGNING_KEY_LEN} characters"
        )));
    }

    if audit.queue_capacity == 0 {
        return Err(ConfigError::Validation(
            "audit.queue_capacity must be greater than zero".to_string(),
        ));
    }

    if audit.max_batch == 0 || audit.max_batch > audit.queue_capacity {
        return Err(ConfigError::Validation(
            "audit.max_batch must be in range 1..=audit.queue_capacity".to_string(),
        ));
    }

    Ok(())
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    if let Some(token) = &server.admin_token {
        if token.expose_secret().trim().len() < MIN_ADMIN_TOKEN_LEN {
            return Err(ConfigError::Validation(format!(
                "server.admin_token must be at least {MIN_ADMIN_TOKEN_LEN} characters when set"
            )));
        }
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn validate_backends(backends: &[BackendConfig]) -> Result<(), ConfigError> {
    let mut seen = BTreeSet::new();
    for backend in backends {
        if backend.id.trim().is_empty() {
            return Err(ConfigError::Validation("backends[].id must not be empty".to_string()));
        }
        if !seen.insert(backend.id.as_str()) {
            return Err(ConfigError::Validation(format!(
                "backend `{}` is declared more than once",
                backend.id
            )));
        }
        if !backend.url.starts_with("http://") && !backend.url.starts_with("https://") {
            return Err(ConfigError::Validation(format!(
                "backend `{}` url must start with http:// or https://",
                backend.id
            )));
        }
        if backend.timeout_ms == Some(0) {
            return Err(ConfigError::Validation(format!(
                "backend `{}` timeout_ms must be greater than zero",
                backend.id
            )));
        }
    }

    Ok(())
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse::<usize>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    gateway: Option<GatewayPatch>,
    identity: Option<IdentityPatch>,
    orchestrator: Option<OrchestratorPatch>,
    audit: Option<AuditPatch>,
    database: Option<DatabasePatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
    backends: Option<Vec<BackendConfig>>,
    governance: Option<GovernancePatch>,
}

#[derive(Debug, Default, Deserialize)]
struct GatewayPatch {
    request_deadline_ms: Option<u64>,
    rate_limit_window_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct IdentityPatch {
    max_credential_lifetime_secs: Option<u64>,
    clock_skew_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct OrchestratorPatch {
    backend_timeout_ms: Option<u64>,
    max_retries: Option<u32>,
    retry_base_delay_ms: Option<u64>,
    retry_max_delay_ms: Option<u64>,
}

#[derive(Default, Deserialize)]
struct AuditPatch {
    signing_key: Option<String>,
    queue_capacity: Option<usize>,
    max_batch: Option<usize>,
}

impl std::fmt::Debug for AuditPatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditPatch")
            .field("signing_key", &self.signing_key.as_ref().map(|_| "[REDACTED]"))
            .field("queue_capacity", &self.queue_capacity)
            .field("max_batch", &self.max_batch)
            .finish()
    }
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
    admin_token: Option<String>,
}

impl std::fmt::Debug for ServerPatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerPatch")
            .field("bind_address", &self.bind_address)
            .field("port", &self.port)
            .field("graceful_shutdown_secs", &self.graceful_shutdown_secs)
            .field("admin_token", &self.admin_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[derive(Debug, Default, Deserialize)]
struct GovernancePatch {
    roles: Option<BTreeMap<String, RoleConfig>>,
    agents: Option<Vec<AgentPatch>>,
    revoked_agents: Option<Vec<String>>,
    policies: Option<Vec<PolicyRuleConfig>>,
    transforms: Option<BTreeMap<String, FieldTransform>>,
    overrides: Option<OverridesConfig>,
}

#[derive(Deserialize)]
struct AgentPatch {
    id: String,
    role: String,
    secret: String,
}

impl std::fmt::Debug for AgentPatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentPatch")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}
