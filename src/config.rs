use serde::Deserialize;
use std::time::Duration;

/// Runtime configuration, loaded once at start-up.
///
/// `Debug` is implemented by hand so the encryption key and bureau API key
/// never end up in a log line.
#[derive(Clone, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    /// Base64 or hex encoding of the 32-byte PII key.
    pub pii_encryption_key: String,
    pub bureau_base_url: Option<String>,
    pub bureau_api_key: Option<String>,
    pub bureau_billing_url: Option<String>,
    pub bureau_timeout_secs: u64,
    pub bureau_health_timeout_secs: u64,
    pub batch_max_in_flight: usize,
    pub stale_batch_minutes: i64,
    pub reconcile_interval_secs: u64,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("port", &self.port)
            .field("pii_encryption_key", &"[REDACTED]")
            .field("bureau_base_url", &self.bureau_base_url)
            .field(
                "bureau_api_key",
                &self.bureau_api_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("bureau_billing_url", &self.bureau_billing_url)
            .field("bureau_timeout_secs", &self.bureau_timeout_secs)
            .field("batch_max_in_flight", &self.batch_max_in_flight)
            .field("stale_batch_minutes", &self.stale_batch_minutes)
            .finish()
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DATABASE_URL")
                .or_else(|_| std::env::var("DB_URL"))
                .map_err(|_| {
                    anyhow::anyhow!("DATABASE_URL or DB_URL environment variable required")
                })
                .and_then(|url| {
                    if url.trim().is_empty() {
                        anyhow::bail!("DATABASE_URL cannot be empty");
                    }
                    if !url.starts_with("postgresql://") && !url.starts_with("postgres://") {
                        anyhow::bail!("DATABASE_URL must start with postgresql:// or postgres://");
                    }
                    Ok(url)
                })?,
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a valid number between 1-65535"))?,
            pii_encryption_key: std::env::var("PII_ENCRYPTION_KEY")
                .map_err(|_| anyhow::anyhow!("PII_ENCRYPTION_KEY environment variable required"))
                .and_then(|key| {
                    if crate::vault::decode_key_material(&key).is_none() {
                        anyhow::bail!(
                            "PII_ENCRYPTION_KEY must be base64 or hex encoding of exactly 32 bytes"
                        );
                    }
                    Ok(key)
                })?,
            bureau_base_url: optional_url("BUREAU_BASE_URL")?,
            bureau_api_key: std::env::var("BUREAU_API_KEY")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            bureau_billing_url: optional_url("BUREAU_BILLING_URL")?,
            bureau_timeout_secs: parse_or("BUREAU_TIMEOUT_SECS", 30)?,
            bureau_health_timeout_secs: parse_or("BUREAU_HEALTH_TIMEOUT_SECS", 5)?,
            batch_max_in_flight: parse_or("BATCH_MAX_IN_FLIGHT", 8).and_then(|n: usize| {
                if !(1..=32).contains(&n) {
                    anyhow::bail!("BATCH_MAX_IN_FLIGHT must be between 1 and 32");
                }
                Ok(n)
            })?,
            stale_batch_minutes: parse_or("STALE_BATCH_MINUTES", 30).and_then(|m: i64| {
                if m <= 0 {
                    anyhow::bail!("STALE_BATCH_MINUTES must be positive");
                }
                Ok(m)
            })?,
            reconcile_interval_secs: parse_or("RECONCILE_INTERVAL_SECS", 300)?,
        };

        // Log successful configuration load (without sensitive values)
        tracing::info!("Configuration loaded successfully");
        tracing::debug!(
            "Database URL: {}...",
            &config.database_url[..20.min(config.database_url.len())]
        );
        match config.bureau_base_url {
            Some(ref url) => tracing::debug!("Bureau Base URL: {}", url),
            None => tracing::warn!("BUREAU_BASE_URL not set; batches will fail pre-flight"),
        }
        if config.bureau_billing_url.is_none() {
            tracing::info!("BUREAU_BILLING_URL not set; usage summaries will omit cost data");
        }
        tracing::debug!("Server Port: {}", config.port);

        Ok(config)
    }

    pub fn bureau_timeout(&self) -> Duration {
        Duration::from_secs(self.bureau_timeout_secs)
    }

    pub fn bureau_health_timeout(&self) -> Duration {
        Duration::from_secs(self.bureau_health_timeout_secs)
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.stale_batch_minutes)
    }
}

fn optional_url(var: &str) -> anyhow::Result<Option<String>> {
    let Some(raw) = std::env::var(var).ok().filter(|s| !s.trim().is_empty()) else {
        return Ok(None);
    };
    let parsed = url::Url::parse(&raw).map_err(|e| anyhow::anyhow!("{} is not a URL: {}", var, e))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        anyhow::bail!("{} must start with http:// or https://", var);
    }
    Ok(Some(raw.trim_end_matches('/').to_string()))
}

fn parse_or<T: std::str::FromStr>(var: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(var) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} must be a valid number", var)),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_redacts_secrets() {
        let config = Config {
            database_url: "postgres://user:pw@localhost/prescreen".to_string(),
            port: 3000,
            pii_encryption_key: "c2VjcmV0".to_string(),
            bureau_base_url: Some("https://bureau.example.com".to_string()),
            bureau_api_key: Some("live-key".to_string()),
            bureau_billing_url: None,
            bureau_timeout_secs: 30,
            bureau_health_timeout_secs: 5,
            batch_max_in_flight: 8,
            stale_batch_minutes: 30,
            reconcile_interval_secs: 300,
        };
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("c2VjcmV0"));
        assert!(!rendered.contains("live-key"));
        assert!(!rendered.contains("pw@"));
    }
}
