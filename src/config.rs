//! Environment-driven configuration.
//!
//! All runtime knobs come from the process environment; there is no config
//! file. `Settings::from_env` is called once at startup and the result is
//! carried inside `AppState`.

/// Runtime settings resolved from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Bind port (`PORT`, default 8080).
    pub port: u16,
    /// Store DSN (`DATABASE_URL`). A plain file path or `:memory:`;
    /// defaults to a file under the platform data directory.
    pub database_url: Option<String>,
    /// Cache DSN (`REDIS_URL`). Consumed by an external Cache
    /// implementation; the in-process cache ignores it.
    pub redis_url: Option<String>,
    /// Token secret for the admin/tenant console (`JWT_SECRET`).
    pub jwt_secret: Option<String>,
    /// When false (the default), adapters return canned responses and no
    /// upstream credentials are required (`ENABLE_REAL_CALLS`).
    pub enable_real_calls: bool,
    /// Tenant id used when seeding an empty store (`DEFAULT_TENANT_ID`).
    pub default_tenant_id: String,
    /// Per-tenant in-flight request cap (`GATEWAY_MAX_CONCURRENT`).
    pub max_concurrent_per_tenant: i64,
    /// OTLP endpoint for the external tracing wiring
    /// (`OTEL_EXPORTER_OTLP_ENDPOINT`).
    pub otel_endpoint: Option<String>,
    /// Service name for the external tracing wiring (`OTEL_SERVICE_NAME`).
    pub otel_service_name: Option<String>,
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    match env_opt(key) {
        Some(v) => matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on"),
        None => default,
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: 8080,
            database_url: None,
            redis_url: None,
            jwt_secret: None,
            enable_real_calls: false,
            default_tenant_id: "default".to_string(),
            max_concurrent_per_tenant: 32,
            otel_endpoint: None,
            otel_service_name: None,
        }
    }
}

impl Settings {
    /// Read settings from the process environment.
    pub fn from_env() -> Self {
        let defaults = Settings::default();
        Self {
            port: env_opt("PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            database_url: env_opt("DATABASE_URL"),
            redis_url: env_opt("REDIS_URL"),
            jwt_secret: env_opt("JWT_SECRET"),
            enable_real_calls: env_bool("ENABLE_REAL_CALLS", false),
            default_tenant_id: env_opt("DEFAULT_TENANT_ID")
                .unwrap_or(defaults.default_tenant_id),
            max_concurrent_per_tenant: env_opt("GATEWAY_MAX_CONCURRENT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_concurrent_per_tenant),
            otel_endpoint: env_opt("OTEL_EXPORTER_OTLP_ENDPOINT"),
            otel_service_name: env_opt("OTEL_SERVICE_NAME"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_safe() {
        let s = Settings::default();
        assert_eq!(s.port, 8080);
        assert!(!s.enable_real_calls);
        assert_eq!(s.default_tenant_id, "default");
        assert!(s.max_concurrent_per_tenant > 0);
    }
}
