use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub retell: RetellConfig,
    #[serde(default)]
    pub booking: BookingConfig,
    #[serde(default)]
    pub twilio: TwilioConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetellConfig {
    /// Provider API key; doubles as the webhook signing secret.
    #[serde(default)]
    pub api_key: String,
    /// Accepted clock skew for `x-retell-timestamp`, inclusive.
    #[serde(default = "default_signature_skew")]
    pub signature_skew_secs: u64,
}

impl Default for RetellConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            signature_skew_secs: default_signature_skew(),
        }
    }
}

fn default_signature_skew() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct BookingConfig {
    #[serde(default = "default_booking_api_base")]
    pub api_base: String,
    #[serde(default = "default_booking_api_version")]
    pub api_version: String,
}

impl Default for BookingConfig {
    fn default() -> Self {
        Self {
            api_base: default_booking_api_base(),
            api_version: default_booking_api_version(),
        }
    }
}

fn default_booking_api_base() -> String {
    "https://connect.squareup.com".to_string()
}

fn default_booking_api_version() -> String {
    "2024-10-17".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct TwilioConfig {
    #[serde(default = "default_twilio_api_base")]
    pub api_base: String,
    #[serde(default)]
    pub account_sid: String,
    #[serde(default)]
    pub auth_token: String,
    /// Default sender for SMS.
    #[serde(default)]
    pub messaging_from: String,
    /// Default sender for WhatsApp, without the `whatsapp:` prefix.
    #[serde(default)]
    pub whatsapp_from: String,
    /// Voice URL configured on purchased numbers (the voice provider's inbound hook).
    #[serde(default)]
    pub voice_url: String,
}

impl Default for TwilioConfig {
    fn default() -> Self {
        Self {
            api_base: default_twilio_api_base(),
            account_sid: String::new(),
            auth_token: String::new(),
            messaging_from: String::new(),
            whatsapp_from: String::new(),
            voice_url: String::new(),
        }
    }
}

fn default_twilio_api_base() -> String {
    "https://api.twilio.com".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkersConfig {
    #[serde(default)]
    pub email_url: String,
    #[serde(default)]
    pub sms_url: String,
    #[serde(default)]
    pub phone_numbers_url: String,
    /// Bearer token shared with sidecar workers. Empty disables the /api/workers/* routes.
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_batch")]
    pub batch: i64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            email_url: String::new(),
            sms_url: String::new(),
            phone_numbers_url: String::new(),
            token: String::new(),
            poll_interval_ms: default_poll_interval(),
            batch: default_batch(),
        }
    }
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_batch() -> i64 {
    10
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AdminConfig {
    /// Bearer token for /api/admin/*. If empty, all admin requests are rejected.
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct NotificationsConfig {
    /// Text the caller a confirmation after an analyzed call that produced a booking.
    #[serde(default)]
    pub sms_confirmations: bool,
    #[serde(default)]
    pub email_from: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing required setting: {0}")]
    Missing(&'static str),
    #[error("invalid setting {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::info!("Loaded .env from {}", path.display()),
            Err(e) if e.not_found() => {
                tracing::debug!("No .env file, using environment only");
            }
            Err(e) => tracing::warn!("Failed to parse .env: {e}"),
        }

        let path = config_path();
        let mut config = match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!("Loading config from {}", path.display());
                toml::from_str(&contents)?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No config file at {}, using defaults", path.display());
                Config::default()
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })
            }
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Environment overrides for secrets and deployment-specific settings.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = var("HOST") {
            self.server.host = v;
        }
        if let Some(v) = var("PORT") {
            self.server.port = v.parse().map_err(|_| ConfigError::Invalid {
                field: "PORT",
                reason: format!("not a port number: {v}"),
            })?;
        }
        if let Some(v) = var("DATABASE_URL") {
            self.database.url = v;
        }
        if let Some(v) = var("RETELL_API_KEY") {
            self.retell.api_key = v;
        }
        if let Some(v) = var("BOOKING_API_BASE") {
            self.booking.api_base = v;
        }
        if let Some(v) = var("TWILIO_ACCOUNT_SID") {
            self.twilio.account_sid = v;
        }
        if let Some(v) = var("TWILIO_AUTH_TOKEN") {
            self.twilio.auth_token = v;
        }
        if let Some(v) = var("TWILIO_MESSAGING_FROM") {
            self.twilio.messaging_from = v;
        }
        if let Some(v) = var("TWILIO_WHATSAPP_FROM") {
            self.twilio.whatsapp_from = v;
        }
        if let Some(v) = var("TWILIO_VOICE_URL") {
            self.twilio.voice_url = v;
        }
        if let Some(v) = var("EMAIL_WORKER_URL") {
            self.workers.email_url = v;
        }
        if let Some(v) = var("SMS_WORKER_URL") {
            self.workers.sms_url = v;
        }
        if let Some(v) = var("PHONE_WORKER_URL") {
            self.workers.phone_numbers_url = v;
        }
        if let Some(v) = var("WORKER_TOKEN") {
            self.workers.token = v;
        }
        if let Some(v) = var("ADMIN_TOKEN") {
            self.admin.token = v;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.database.url.is_empty() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }
        if self.retell.api_key.is_empty() {
            return Err(ConfigError::Missing("RETELL_API_KEY"));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::Invalid {
                field: "database.max_connections",
                reason: "must be at least 1".into(),
            });
        }
        if self.workers.batch <= 0 {
            return Err(ConfigError::Invalid {
                field: "workers.batch",
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }
}

fn config_path() -> PathBuf {
    std::env::var("RECEPTIONIST_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("receptionist.toml"))
}
