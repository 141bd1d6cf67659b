use serde::Deserialize;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string
    pub redis_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// JWT secret for API authentication. Only the API binary requires it.
    pub jwt_secret: Option<String>,

    /// Shared key providers present in `X-Receipt-Key` when posting receipts
    pub receipt_api_key: Option<String>,

    /// API listen port (default: 3000)
    pub api_port: u16,

    /// Number of concurrent stage workers (default: 8)
    pub worker_concurrency: usize,

    /// Idle sleep between empty queue polls in milliseconds (default: 250)
    pub worker_poll_interval_ms: u64,

    /// Age after which a non-final notification is swept (default: 259200 = 3 days)
    pub sending_timeout_secs: u64,

    /// How often the timeout sweep runs (default: 300)
    pub sweep_interval_secs: u64,

    /// Addresses that are accepted but never handed to a real provider
    pub simulated_email_addresses: Vec<String>,

    /// Phone numbers that are accepted but never handed to a real provider
    pub simulated_sms_numbers: Vec<String>,

    /// Carry the permission check inside the contact lookup
    pub combine_contact_and_permission_lookup: bool,

    /// Run communication-permission checks for templates that declare one
    pub check_communication_permissions: bool,

    /// Throttle SMS dispatch per sender
    pub apply_sender_rate_limit: bool,

    /// Fire onsite notifications for onsite-capable identifiers
    pub notify_onsite: bool,

    /// Base delay of the stage retry backoff in milliseconds (default: 1000)
    pub retry_base_delay_ms: u64,

    /// Upper bound on the stage retry backoff in seconds (default: 60)
    pub retry_max_delay_secs: u64,

    /// Max attempts of the profile-id resolution stage (default: 48)
    pub max_attempts_resolve_profile: u32,

    /// Max attempts of the contact lookup stage (default: 2886)
    pub max_attempts_lookup_contact: u32,

    /// Max attempts of the communication-permission stage (default: 5)
    pub max_attempts_check_permission: u32,

    /// Max attempts of provider dispatch (default: 2886)
    pub max_attempts_dispatch: u32,

    /// Max attempts of an onsite notification (default: 1)
    pub max_attempts_notify_onsite: u32,

    /// Seconds a popped task may stay unacknowledged before it is handed to
    /// another worker (default: 300)
    pub task_visibility_timeout_secs: u64,

    /// Base URL of the delivery gateway fronting profile, contact, permission
    /// and provider services
    pub gateway_url: Option<String>,

    /// API key sent to the delivery gateway
    pub gateway_api_key: Option<String>,
}

const DEFAULT_SIMULATED_EMAILS: &str =
    "simulate-delivered@notifications.service.gov.uk,simulate-delivered-2@notifications.service.gov.uk,simulate-delivered-3@notifications.service.gov.uk";

const DEFAULT_SIMULATED_NUMBERS: &str = "+16132532222,+16132532223,+16132532224";

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            db_max_connections: std::env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("DB_MAX_CONNECTIONS must be a valid u32"))?,
            jwt_secret: std::env::var("JWT_SECRET").ok(),
            receipt_api_key: std::env::var("RECEIPT_API_KEY").ok(),
            api_port: std::env::var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("API_PORT must be a valid u16"))?,
            worker_concurrency: std::env::var("WORKER_CONCURRENCY")
                .unwrap_or_else(|_| "8".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("WORKER_CONCURRENCY must be a valid usize"))?,
            worker_poll_interval_ms: std::env::var("WORKER_POLL_INTERVAL_MS")
                .unwrap_or_else(|_| "250".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("WORKER_POLL_INTERVAL_MS must be a valid u64"))?,
            sending_timeout_secs: std::env::var("SENDING_TIMEOUT_SECS")
                .unwrap_or_else(|_| "259200".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("SENDING_TIMEOUT_SECS must be a valid u64"))?,
            sweep_interval_secs: std::env::var("SWEEP_INTERVAL_SECS")
                .unwrap_or_else(|_| "300".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("SWEEP_INTERVAL_SECS must be a valid u64"))?,
            simulated_email_addresses: parse_list(
                &std::env::var("SIMULATED_EMAIL_ADDRESSES")
                    .unwrap_or_else(|_| DEFAULT_SIMULATED_EMAILS.to_string()),
            ),
            simulated_sms_numbers: parse_list(
                &std::env::var("SIMULATED_SMS_NUMBERS")
                    .unwrap_or_else(|_| DEFAULT_SIMULATED_NUMBERS.to_string()),
            ),
            combine_contact_and_permission_lookup: parse_flag(
                "COMBINE_CONTACT_AND_PERMISSION_LOOKUP",
                false,
            )?,
            check_communication_permissions: parse_flag("CHECK_COMMUNICATION_PERMISSIONS", true)?,
            apply_sender_rate_limit: parse_flag("APPLY_SENDER_RATE_LIMIT", true)?,
            notify_onsite: parse_flag("NOTIFY_ONSITE", false)?,
            retry_base_delay_ms: std::env::var("RETRY_BASE_DELAY_MS")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("RETRY_BASE_DELAY_MS must be a valid u64"))?,
            retry_max_delay_secs: std::env::var("RETRY_MAX_DELAY_SECS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("RETRY_MAX_DELAY_SECS must be a valid u64"))?,
            max_attempts_resolve_profile: parse_var("MAX_ATTEMPTS_RESOLVE_PROFILE", 48)?,
            max_attempts_lookup_contact: parse_var("MAX_ATTEMPTS_LOOKUP_CONTACT", 2886)?,
            max_attempts_check_permission: parse_var("MAX_ATTEMPTS_CHECK_PERMISSION", 5)?,
            max_attempts_dispatch: parse_var("MAX_ATTEMPTS_DISPATCH", 2886)?,
            max_attempts_notify_onsite: parse_var("MAX_ATTEMPTS_NOTIFY_ONSITE", 1)?,
            task_visibility_timeout_secs: parse_var("TASK_VISIBILITY_TIMEOUT_SECS", 300)?,
            gateway_url: std::env::var("GATEWAY_URL").ok(),
            gateway_api_key: std::env::var("GATEWAY_API_KEY").ok(),
        })
    }

    /// Whether `recipient` is one of the configured simulated addresses/numbers.
    pub fn is_simulated_recipient(&self, recipient: &str) -> bool {
        self.simulated_email_addresses
            .iter()
            .chain(self.simulated_sms_numbers.iter())
            .any(|simulated| simulated.eq_ignore_ascii_case(recipient))
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_var<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} must be a valid number", key)),
    }
}

fn parse_flag(key: &str, default: bool) -> anyhow::Result<bool> {
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(anyhow::anyhow!("{} must be a boolean", key)),
        },
    }
}
