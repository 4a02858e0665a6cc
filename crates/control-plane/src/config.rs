use serde::Deserialize;

pub const ENV_PREFIX: &str = "FLEETCP";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub metrics: MetricsConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub sessions: SessionConfig,
    pub liveness: LivenessConfig,
    pub commands: CommandConfig,
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Pepper mixed into every stored secret hash.
    pub pepper: String,
    pub break_glass: BreakGlassConfig,
}

/// Recovery credential that verifies without touching the store. Disabled
/// unless explicitly configured; never ships with a baked-in pair.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct BreakGlassConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub default_ttl_hours: i64,
    pub cleanup_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LivenessConfig {
    /// Seconds without a heartbeat before a device is swept offline.
    pub timeout_secs: u64,
    pub sweep_interval_secs: u64,
    /// Interval advertised to agents in heartbeat acks.
    pub heartbeat_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandConfig {
    /// Default claim batch size for pulls.
    pub default_batch: u32,
    /// Lease granted to a claimed command before it becomes requeueable.
    pub lease_secs: u64,
    /// Requeue attempts before an unreported command is failed outright.
    pub max_retries: u32,
    pub lease_sweep_interval_secs: u64,
    /// Safety-net wake interval for the pull stream when no notify arrives.
    pub stream_wait_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    pub request_body_bytes: u64,
    pub max_field_len: usize,
    pub max_list_limit: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            request_body_bytes: 256 * 1024,
            max_field_len: 255,
            max_list_limit: 500,
        }
    }
}

impl AuthConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.pepper.trim().is_empty() {
            anyhow::bail!("auth.pepper cannot be empty");
        }
        if self.break_glass.enabled {
            if self.break_glass.key.trim().is_empty() {
                anyhow::bail!("auth.break_glass.key cannot be empty when enabled");
            }
            if self.break_glass.secret.trim().is_empty() {
                anyhow::bail!("auth.break_glass.secret cannot be empty when enabled");
            }
        }
        Ok(())
    }
}

impl LivenessConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.timeout_secs == 0 {
            anyhow::bail!("liveness.timeout_secs must be > 0");
        }
        if self.sweep_interval_secs == 0 {
            anyhow::bail!("liveness.sweep_interval_secs must be > 0");
        }
        if self.heartbeat_interval_secs >= self.timeout_secs {
            anyhow::bail!("liveness.heartbeat_interval_secs must be below timeout_secs");
        }
        Ok(())
    }
}

impl CommandConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.default_batch == 0 {
            anyhow::bail!("commands.default_batch must be > 0");
        }
        if self.lease_secs == 0 {
            anyhow::bail!("commands.lease_secs must be > 0");
        }
        if self.stream_wait_secs == 0 {
            anyhow::bail!("commands.stream_wait_secs must be > 0");
        }
        Ok(())
    }
}

impl SessionConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.default_ttl_hours <= 0 {
            anyhow::bail!("sessions.default_ttl_hours must be > 0");
        }
        Ok(())
    }
}

pub fn load() -> anyhow::Result<AppConfig> {
    let env = config::Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        // Keep try_parsing disabled so numeric secrets are not coerced.
        .try_parsing(false);

    let builder = config::Config::builder()
        .add_source(config::File::with_name("config").required(false))
        .add_source(env)
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 8080)?
        .set_default("metrics.host", "127.0.0.1")?
        .set_default("metrics.port", 9090)?
        .set_default("database.url", "sqlite://data/control-plane.db")?
        .set_default("auth.pepper", "dev-secret-pepper")?
        .set_default("auth.break_glass.enabled", false)?
        .set_default("auth.break_glass.key", "")?
        .set_default("auth.break_glass.secret", "")?
        .set_default("sessions.default_ttl_hours", 72)?
        .set_default("sessions.cleanup_interval_secs", 15 * 60u64)?
        .set_default("liveness.timeout_secs", 300u64)?
        .set_default("liveness.sweep_interval_secs", 60u64)?
        .set_default("liveness.heartbeat_interval_secs", 60u64)?
        .set_default("commands.default_batch", 10u32)?
        .set_default("commands.lease_secs", 300u64)?
        .set_default("commands.max_retries", 3u32)?
        .set_default("commands.lease_sweep_interval_secs", 30u64)?
        .set_default("commands.stream_wait_secs", 5u64)?
        .set_default("limits.request_body_bytes", 256 * 1024u64)?
        .set_default("limits.max_field_len", 255)?
        .set_default("limits.max_list_limit", 500u32)?;

    let cfg = builder.build()?;
    let app: AppConfig = cfg.try_deserialize()?;
    app.auth.validate()?;
    app.sessions.validate()?;
    app.liveness.validate()?;
    app.commands.validate()?;
    Ok(app)
}
