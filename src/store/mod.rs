//! Durable state port.
//!
//! Tenants, API keys, provider instances, the model catalog, routing rules,
//! prices, request logs, transactions, and daily usage roll-ups all live
//! behind the `Store` trait. The default implementation is SQLite
//! (`sqlite::SqliteStore`); anything else (Postgres, a remote control plane)
//! plugs in from outside.

pub mod sqlite;

use serde::{Deserialize, Serialize};

pub use sqlite::SqliteStore;

/// Coarse request classifier derived from message content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Text,
    Vision,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Text => "text",
            Capability::Vision => "vision",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Some(Capability::Text),
            "vision" => Some(Capability::Vision),
            _ => None,
        }
    }
}

/// Upstream protocol family of a provider instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderFamily {
    #[serde(rename = "openai")]
    OpenAI,
    Anthropic,
    Gemini,
    DeepSeek,
    Mistral,
    #[serde(rename = "generic-openai")]
    GenericOpenAI,
}

impl ProviderFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderFamily::OpenAI => "openai",
            ProviderFamily::Anthropic => "anthropic",
            ProviderFamily::Gemini => "gemini",
            ProviderFamily::DeepSeek => "deepseek",
            ProviderFamily::Mistral => "mistral",
            ProviderFamily::GenericOpenAI => "generic-openai",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Some(ProviderFamily::OpenAI),
            "anthropic" | "claude" => Some(ProviderFamily::Anthropic),
            "gemini" => Some(ProviderFamily::Gemini),
            "deepseek" => Some(ProviderFamily::DeepSeek),
            "mistral" => Some(ProviderFamily::Mistral),
            "generic-openai" => Some(ProviderFamily::GenericOpenAI),
            _ => None,
        }
    }

    /// Whether the family speaks the OpenAI chat completions wire format.
    pub fn is_openai_compatible(&self) -> bool {
        matches!(
            self,
            ProviderFamily::OpenAI
                | ProviderFamily::DeepSeek
                | ProviderFamily::Mistral
                | ProviderFamily::GenericOpenAI
        )
    }

    /// Default API base for families with a well-known endpoint.
    pub fn default_base_url(&self) -> Option<&'static str> {
        match self {
            ProviderFamily::OpenAI => Some("https://api.openai.com"),
            ProviderFamily::DeepSeek => Some("https://api.deepseek.com"),
            ProviderFamily::Mistral => Some("https://api.mistral.ai"),
            ProviderFamily::Anthropic => Some("https://api.anthropic.com"),
            ProviderFamily::Gemini => Some("https://generativelanguage.googleapis.com"),
            ProviderFamily::GenericOpenAI => None,
        }
    }
}

impl std::fmt::Display for ProviderFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Billing and policy owner of a set of API keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    /// Remaining balance in USD.
    pub balance: f64,
    pub suspended: bool,
    /// Requests per minute; 0 disables the rate limit.
    pub rate_limit_rpm: i64,
    /// Lifetime spend cap in USD; `None` disables it.
    pub spend_limit_usd: Option<f64>,
    pub total_topup: f64,
    pub total_spent: f64,
    pub last_active: Option<i64>,
    pub created_at: i64,
}

/// Bearer credential resolving to a tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub key: String,
    pub tenant_id: String,
    pub name: String,
    /// Empty list means every model is allowed.
    pub allowed_models: Vec<String>,
    pub created_at: i64,
}

/// A concrete upstream endpoint the planner can dispatch to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInstance {
    pub id: String,
    pub name: String,
    pub family: ProviderFamily,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub supports_text: bool,
    pub supports_vision: bool,
    pub enabled: bool,
}

/// Catalog row mapping a model id to its provider family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub model: String,
    pub family: ProviderFamily,
}

/// Per-tenant fallback route consulted when the catalog misses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    pub tenant_id: String,
    pub capability: Capability,
    pub primary_provider: String,
    pub secondary_provider: Option<String>,
    pub default_model: String,
}

/// Append-only per-request telemetry row. Metadata only; request and
/// response bodies are never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLog {
    pub id: i64,
    pub tenant_id: String,
    pub provider: String,
    pub model: String,
    pub latency_ms: i64,
    pub ttft_ms: Option<i64>,
    pub tokens: i64,
    pub cost_usd: f64,
    pub prompt_sha256: String,
    pub fallback_used: bool,
    pub status: i64,
    pub error_kind: Option<String>,
    pub created_at: i64,
}

/// Append-only balance movement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: i64,
    pub tenant_id: String,
    /// `charge`, `topup`, or `adjustment`.
    pub kind: String,
    pub amount_usd: f64,
    pub balance_after: f64,
    pub description: String,
    pub created_at: i64,
}

/// Additive usage roll-up keyed by (tenant, provider, model, day).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageDay {
    pub tenant_id: String,
    pub provider: String,
    pub model: String,
    pub day: String,
    pub tokens: i64,
    pub cost_usd: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid data: {0}")]
    Invalid(String),
    #[error("not found: {0}")]
    NotFound(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable state operations used by the request pipeline and the admin
/// surface. Implementations must be safe to call from concurrent tasks.
pub trait Store: Send + Sync {
    fn lookup_api_key(&self, key: &str) -> StoreResult<Option<(ApiKey, Tenant)>>;
    fn get_tenant(&self, id: &str) -> StoreResult<Option<Tenant>>;
    fn create_tenant(&self, tenant: &Tenant) -> StoreResult<()>;
    fn create_api_key(&self, api_key: &ApiKey) -> StoreResult<()>;

    fn upsert_provider(&self, provider: &ProviderInstance) -> StoreResult<()>;
    fn get_provider(&self, id: &str) -> StoreResult<Option<ProviderInstance>>;
    fn providers_by_family(&self, family: ProviderFamily) -> StoreResult<Vec<ProviderInstance>>;
    fn list_providers(&self) -> StoreResult<Vec<ProviderInstance>>;

    fn upsert_catalog_entry(&self, model: &str, family: ProviderFamily) -> StoreResult<()>;
    fn catalog_family(&self, model: &str) -> StoreResult<Option<ProviderFamily>>;
    fn list_catalog(&self) -> StoreResult<Vec<CatalogEntry>>;

    fn upsert_model_price(&self, model: &str, usd_per_1k: f64) -> StoreResult<()>;
    fn model_price(&self, model: &str) -> StoreResult<Option<f64>>;

    fn upsert_routing_rule(&self, rule: &RoutingRule) -> StoreResult<()>;
    fn routing_rule(
        &self,
        tenant_id: &str,
        capability: Capability,
    ) -> StoreResult<Option<RoutingRule>>;

    fn insert_request_log(&self, log: &RequestLog) -> StoreResult<()>;
    fn recent_request_logs(
        &self,
        tenant_id: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<RequestLog>>;

    /// Debit a tenant balance and bump `total_spent` in one statement.
    /// Returns the balance after the debit.
    fn debit_balance(&self, tenant_id: &str, amount_usd: f64) -> StoreResult<f64>;
    fn append_transaction(&self, tx: &Transaction) -> StoreResult<()>;
    fn list_transactions(
        &self,
        tenant_id: &str,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<Transaction>>;

    fn add_usage_day(
        &self,
        tenant_id: &str,
        provider: &str,
        model: &str,
        day: &str,
        tokens: i64,
        cost_usd: f64,
    ) -> StoreResult<()>;
    fn usage_day(
        &self,
        tenant_id: &str,
        provider: &str,
        model: &str,
        day: &str,
    ) -> StoreResult<Option<UsageDay>>;

    fn touch_last_active(&self, tenant_id: &str) -> StoreResult<()>;
}
