use std::time::Duration;

/// Process settings, sourced from the environment. Unparseable values fall
/// back to their defaults rather than failing startup.
#[derive(Clone, Debug)]
pub struct Settings {
    pub port: u16,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub database_url: String,
    pub service_role_key: String,
    pub master_encryption_key: String,
    pub meter_batch_size: usize,
    pub meter_flush_ms: u64,
    pub log_level: String,
    pub log_json: bool,
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            port: env_int(&lookup, "GATEWAY_PORT", 8787u16),
            read_timeout: Duration::from_secs(env_int(&lookup, "GATEWAY_READ_TIMEOUT_SEC", 30u64)),
            write_timeout: Duration::from_secs(env_int(
                &lookup,
                "GATEWAY_WRITE_TIMEOUT_SEC",
                120u64,
            )),
            shutdown_timeout: Duration::from_secs(env_int(
                &lookup,
                "GATEWAY_SHUTDOWN_TIMEOUT_SEC",
                15u64,
            )),
            database_url: env_str(&lookup, "DATABASE_URL", ""),
            service_role_key: env_str(&lookup, "SUPABASE_SERVICE_ROLE_KEY", ""),
            master_encryption_key: env_str(&lookup, "MASTER_ENCRYPTION_KEY", ""),
            meter_batch_size: env_int(&lookup, "METER_BATCH_SIZE", 100usize),
            meter_flush_ms: env_int(&lookup, "METER_FLUSH_MS", 5000u64),
            log_level: env_str(&lookup, "LOG_LEVEL", "info"),
            log_json: env_bool(&lookup, "LOG_JSON", true),
        }
    }
}

fn env_str<F>(lookup: &F, key: &str, fallback: &str) -> String
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) if !value.is_empty() => value,
        _ => fallback.to_string(),
    }
}

fn env_int<F, T>(lookup: &F, key: &str, fallback: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr + Copy,
{
    lookup(key)
        .and_then(|value| value.trim().parse::<T>().ok())
        .unwrap_or(fallback)
}

fn env_bool<F>(lookup: &F, key: &str, fallback: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|value| match value.trim() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        })
        .unwrap_or(fallback)
}
