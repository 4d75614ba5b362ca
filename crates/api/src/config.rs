//! Server configuration loaded from the environment

use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("{key} is invalid: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Clone)]
pub struct Config {
    pub database_url: String,
    /// Direct (non-pooled) URL used for migrations when set
    pub database_direct_url: Option<String>,
    pub bind_address: String,
    pub public_base_url: Url,
    /// Shared secret for the scheduler-triggered `/api/cron/*` endpoints
    pub cron_secret: Option<String>,
    /// Bearer token for staff endpoints
    pub admin_api_token: Option<String>,
    pub allowed_origins: Vec<String>,
    pub slack_alert_webhook_url: Option<String>,
    /// Gateway secret used to verify callback signatures
    pub gateway_webhook_secret: Option<String>,
    pub run_migrations: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("public_base_url", &self.public_base_url.as_str())
            .field("cron_secret", &self.cron_secret.as_ref().map(|_| "<redacted>"))
            .field("admin_api_token", &self.admin_api_token.as_ref().map(|_| "<redacted>"))
            .field("allowed_origins", &self.allowed_origins)
            .field("run_migrations", &self.run_migrations)
            .finish_non_exhaustive()
    }
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = optional("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let public_base_url = optional("PUBLIC_BASE_URL")
            .unwrap_or_else(|| "http://localhost:3000/".to_string());
        let public_base_url = Url::parse(&public_base_url).map_err(|e| ConfigError::Invalid {
            key: "PUBLIC_BASE_URL",
            reason: e.to_string(),
        })?;

        let allowed_origins = optional("ALLOWED_ORIGINS")
            .unwrap_or_else(|| "http://localhost:3000,http://127.0.0.1:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let cron_secret = optional("CRON_SECRET");
        if cron_secret.is_none() {
            tracing::warn!("CRON_SECRET not set - cron endpoints will reject every request");
        }
        let admin_api_token = optional("ADMIN_API_TOKEN");
        if admin_api_token.is_none() {
            tracing::warn!("ADMIN_API_TOKEN not set - staff endpoints will reject every request");
        }

        Ok(Self {
            database_url,
            database_direct_url: optional("DATABASE_DIRECT_URL"),
            bind_address: optional("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            public_base_url,
            cron_secret,
            admin_api_token,
            allowed_origins,
            slack_alert_webhook_url: optional("SLACK_ALERT_WEBHOOK_URL"),
            gateway_webhook_secret: optional("GATEWAY_WEBHOOK_SECRET")
                .or_else(|| optional("GATEWAY_SECRET_KEY")),
            run_migrations: optional("RUN_MIGRATIONS")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
        })
    }

    /// Minimal configuration for in-process servers and tests
    pub fn local(public_base_url: Url) -> Self {
        Self {
            database_url: String::new(),
            database_direct_url: None,
            bind_address: "127.0.0.1:0".to_string(),
            public_base_url,
            cron_secret: None,
            admin_api_token: None,
            allowed_origins: Vec::new(),
            slack_alert_webhook_url: None,
            gateway_webhook_secret: None,
            run_migrations: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear() {
        for key in [
            "DATABASE_URL",
            "PUBLIC_BASE_URL",
            "CRON_SECRET",
            "ADMIN_API_TOKEN",
            "ALLOWED_ORIGINS",
            "GATEWAY_WEBHOOK_SECRET",
            "GATEWAY_SECRET_KEY",
            "RUN_MIGRATIONS",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn requires_database_url() {
        clear();
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Missing("DATABASE_URL"))
        ));
    }

    #[test]
    #[serial]
    fn reads_secrets_and_origins() {
        clear();
        std::env::set_var("DATABASE_URL", "postgres://localhost/playhouse");
        std::env::set_var("CRON_SECRET", "cron-secret");
        std::env::set_var("ALLOWED_ORIGINS", "https://a.example, https://b.example,");
        std::env::set_var("GATEWAY_SECRET_KEY", "gw-secret");
        std::env::set_var("RUN_MIGRATIONS", "false");

        let config = Config::from_env().unwrap();
        assert_eq!(config.cron_secret.as_deref(), Some("cron-secret"));
        assert!(config.admin_api_token.is_none());
        assert_eq!(
            config.allowed_origins,
            vec!["https://a.example".to_string(), "https://b.example".to_string()]
        );
        assert_eq!(config.gateway_webhook_secret.as_deref(), Some("gw-secret"));
        assert!(!config.run_migrations);
        assert!(!format!("{:?}", config).contains("cron-secret"));
        clear();
    }

    #[test]
    #[serial]
    fn rejects_malformed_public_url() {
        clear();
        std::env::set_var("DATABASE_URL", "postgres://localhost/playhouse");
        std::env::set_var("PUBLIC_BASE_URL", "not a url");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid { key: "PUBLIC_BASE_URL", .. })
        ));
        clear();
    }
}
