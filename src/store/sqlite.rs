//! SQLite-backed `Store`.
//!
//! Single connection behind a mutex; WAL mode for file-backed databases.
//! `DATABASE_URL` selects the file path (`:memory:` works for tests), the
//! default lives under the platform data directory.

use std::path::PathBuf;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{
    ApiKey, CatalogEntry, Capability, ProviderFamily, ProviderInstance, RequestLog, RoutingRule,
    Store, StoreError, StoreResult, Tenant, Transaction, UsageDay,
};

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn default_db_path() -> PathBuf {
    let mut p = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
    p.push("routerx");
    std::fs::create_dir_all(&p).ok();
    p.push("routerx.db");
    p
}

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

impl SqliteStore {
    /// Open (and migrate) the store at `database_url`, or at the default
    /// data-directory path when unset.
    pub fn open(database_url: Option<&str>) -> StoreResult<Self> {
        let conn = match database_url {
            Some(":memory:") => Connection::open_in_memory()?,
            Some(path) => Connection::open(path)?,
            None => Connection::open(default_db_path())?,
        };
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::open(Some(":memory:"))
    }

    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "create table if not exists tenants (
                id text primary key,
                name text not null,
                balance real not null default 0,
                suspended integer not null default 0,
                rate_limit_rpm integer not null default 0,
                spend_limit_usd real,
                total_topup real not null default 0,
                total_spent real not null default 0,
                last_active integer,
                created_at integer not null
            );
            create table if not exists api_keys (
                key text primary key,
                tenant_id text not null,
                name text not null,
                allowed_models text not null default '[]',
                created_at integer not null
            );
            create table if not exists providers (
                id text primary key,
                name text not null,
                family text not null,
                base_url text,
                api_key text,
                supports_text integer not null default 1,
                supports_vision integer not null default 0,
                enabled integer not null default 1
            );
            create table if not exists model_catalog (
                model text primary key,
                family text not null
            );
            create table if not exists model_prices (
                model text primary key,
                usd_per_1k real not null
            );
            create table if not exists routing_rules (
                tenant_id text not null,
                capability text not null,
                primary_provider text not null,
                secondary_provider text,
                default_model text not null,
                primary key (tenant_id, capability)
            );
            create table if not exists request_logs (
                id integer primary key autoincrement,
                tenant_id text not null,
                provider text not null default '',
                model text not null default '',
                latency_ms integer not null default 0,
                ttft_ms integer,
                tokens integer not null default 0,
                cost_usd real not null default 0,
                prompt_sha256 text not null default '',
                fallback_used integer not null default 0,
                status integer not null default 0,
                error_kind text,
                created_at integer not null
            );
            create table if not exists transactions (
                id integer primary key autoincrement,
                tenant_id text not null,
                kind text not null,
                amount_usd real not null,
                balance_after real not null,
                description text not null default '',
                created_at integer not null
            );
            create table if not exists usage_daily (
                tenant_id text not null,
                provider text not null,
                model text not null,
                day text not null,
                tokens integer not null default 0,
                cost_usd real not null default 0,
                primary key (tenant_id, provider, model, day)
            );
            create index if not exists idx_request_logs_created
                on request_logs(created_at desc);
            create index if not exists idx_request_logs_tenant
                on request_logs(tenant_id, created_at desc);
            create index if not exists idx_transactions_tenant
                on transactions(tenant_id, created_at desc);
            create index if not exists idx_api_keys_tenant
                on api_keys(tenant_id);",
        )?;
        Ok(())
    }

    /// First-run seed so dummy mode works without any provisioning: a
    /// default tenant with a generated API key, one provider instance per
    /// core family, and a small catalog with prices. No-op when tenants
    /// already exist. Returns the generated key, if any.
    pub fn seed_defaults(&self, default_tenant_id: &str) -> StoreResult<Option<String>> {
        let existing: i64 = {
            let conn = self.conn.lock().unwrap();
            conn.query_row("select count(*) from tenants", [], |r| r.get(0))?
        };
        if existing > 0 {
            return Ok(None);
        }

        let now = now_ts();
        self.create_tenant(&Tenant {
            id: default_tenant_id.to_string(),
            name: "Default tenant".to_string(),
            balance: 10.0,
            suspended: false,
            rate_limit_rpm: 600,
            spend_limit_usd: None,
            total_topup: 10.0,
            total_spent: 0.0,
            last_active: None,
            created_at: now,
        })?;

        let key = format!("rx-{}", uuid::Uuid::new_v4().simple());
        self.create_api_key(&ApiKey {
            key: key.clone(),
            tenant_id: default_tenant_id.to_string(),
            name: "seeded key".to_string(),
            allowed_models: Vec::new(),
            created_at: now,
        })?;

        let providers = [
            ("openai", "OpenAI", ProviderFamily::OpenAI, true),
            ("anthropic", "Anthropic", ProviderFamily::Anthropic, true),
            ("gemini", "Gemini", ProviderFamily::Gemini, true),
        ];
        for (id, name, family, vision) in providers {
            self.upsert_provider(&ProviderInstance {
                id: id.to_string(),
                name: name.to_string(),
                family,
                base_url: None,
                api_key: None,
                supports_text: true,
                supports_vision: vision,
                enabled: true,
            })?;
        }

        let catalog = [
            ("gpt-4o-mini", ProviderFamily::OpenAI, 0.0015),
            ("gpt-4o", ProviderFamily::OpenAI, 0.01),
            ("claude-3-5-sonnet", ProviderFamily::Anthropic, 0.009),
            ("gemini-1.5-pro", ProviderFamily::Gemini, 0.0075),
            ("gemini-1.5-flash", ProviderFamily::Gemini, 0.0005),
        ];
        for (model, family, price) in catalog {
            self.upsert_catalog_entry(model, family)?;
            self.upsert_model_price(model, price)?;
        }

        Ok(Some(key))
    }
}

fn tenant_from_row(row: &Row<'_>) -> rusqlite::Result<Tenant> {
    Ok(Tenant {
        id: row.get("id")?,
        name: row.get("name")?,
        balance: row.get("balance")?,
        suspended: row.get::<_, i64>("suspended")? != 0,
        rate_limit_rpm: row.get("rate_limit_rpm")?,
        spend_limit_usd: row.get("spend_limit_usd")?,
        total_topup: row.get("total_topup")?,
        total_spent: row.get("total_spent")?,
        last_active: row.get("last_active")?,
        created_at: row.get("created_at")?,
    })
}

fn provider_from_row(row: &Row<'_>) -> rusqlite::Result<ProviderInstance> {
    let family_str: String = row.get("family")?;
    Ok(ProviderInstance {
        id: row.get("id")?,
        name: row.get("name")?,
        family: ProviderFamily::from_str(&family_str).unwrap_or(ProviderFamily::GenericOpenAI),
        base_url: row.get("base_url")?,
        api_key: row.get("api_key")?,
        supports_text: row.get::<_, i64>("supports_text")? != 0,
        supports_vision: row.get::<_, i64>("supports_vision")? != 0,
        enabled: row.get::<_, i64>("enabled")? != 0,
    })
}

fn request_log_from_row(row: &Row<'_>) -> rusqlite::Result<RequestLog> {
    Ok(RequestLog {
        id: row.get("id")?,
        tenant_id: row.get("tenant_id")?,
        provider: row.get("provider")?,
        model: row.get("model")?,
        latency_ms: row.get("latency_ms")?,
        ttft_ms: row.get("ttft_ms")?,
        tokens: row.get("tokens")?,
        cost_usd: row.get("cost_usd")?,
        prompt_sha256: row.get("prompt_sha256")?,
        fallback_used: row.get::<_, i64>("fallback_used")? != 0,
        status: row.get("status")?,
        error_kind: row.get("error_kind")?,
        created_at: row.get("created_at")?,
    })
}

fn transaction_from_row(row: &Row<'_>) -> rusqlite::Result<Transaction> {
    Ok(Transaction {
        id: row.get("id")?,
        tenant_id: row.get("tenant_id")?,
        kind: row.get("kind")?,
        amount_usd: row.get("amount_usd")?,
        balance_after: row.get("balance_after")?,
        description: row.get("description")?,
        created_at: row.get("created_at")?,
    })
}

impl Store for SqliteStore {
    fn lookup_api_key(&self, key: &str) -> StoreResult<Option<(ApiKey, Tenant)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "select key, tenant_id, name, allowed_models, created_at
             from api_keys where key = ?1",
        )?;
        let api_key = stmt
            .query_row(params![key], |row| {
                let allowed: String = row.get("allowed_models")?;
                Ok(ApiKey {
                    key: row.get("key")?,
                    tenant_id: row.get("tenant_id")?,
                    name: row.get("name")?,
                    allowed_models: serde_json::from_str(&allowed).unwrap_or_default(),
                    created_at: row.get("created_at")?,
                })
            })
            .optional()?;
        let Some(api_key) = api_key else {
            return Ok(None);
        };
        let mut stmt = conn.prepare_cached("select * from tenants where id = ?1")?;
        let tenant = stmt
            .query_row(params![api_key.tenant_id], tenant_from_row)
            .optional()?;
        Ok(tenant.map(|t| (api_key, t)))
    }

    fn get_tenant(&self, id: &str) -> StoreResult<Option<Tenant>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached("select * from tenants where id = ?1")?;
        Ok(stmt.query_row(params![id], tenant_from_row).optional()?)
    }

    fn create_tenant(&self, tenant: &Tenant) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "insert into tenants
                (id, name, balance, suspended, rate_limit_rpm, spend_limit_usd,
                 total_topup, total_spent, last_active, created_at)
             values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                tenant.id,
                tenant.name,
                tenant.balance,
                tenant.suspended as i64,
                tenant.rate_limit_rpm,
                tenant.spend_limit_usd,
                tenant.total_topup,
                tenant.total_spent,
                tenant.last_active,
                tenant.created_at,
            ],
        )?;
        Ok(())
    }

    fn create_api_key(&self, api_key: &ApiKey) -> StoreResult<()> {
        let allowed = serde_json::to_string(&api_key.allowed_models)
            .map_err(|e| StoreError::Invalid(e.to_string()))?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "insert into api_keys (key, tenant_id, name, allowed_models, created_at)
             values (?1, ?2, ?3, ?4, ?5)",
            params![
                api_key.key,
                api_key.tenant_id,
                api_key.name,
                allowed,
                api_key.created_at,
            ],
        )?;
        Ok(())
    }

    fn upsert_provider(&self, provider: &ProviderInstance) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "insert into providers
                (id, name, family, base_url, api_key, supports_text, supports_vision, enabled)
             values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             on conflict(id) do update set
                name = excluded.name,
                family = excluded.family,
                base_url = excluded.base_url,
                api_key = excluded.api_key,
                supports_text = excluded.supports_text,
                supports_vision = excluded.supports_vision,
                enabled = excluded.enabled",
            params![
                provider.id,
                provider.name,
                provider.family.as_str(),
                provider.base_url,
                provider.api_key,
                provider.supports_text as i64,
                provider.supports_vision as i64,
                provider.enabled as i64,
            ],
        )?;
        Ok(())
    }

    fn get_provider(&self, id: &str) -> StoreResult<Option<ProviderInstance>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached("select * from providers where id = ?1")?;
        Ok(stmt.query_row(params![id], provider_from_row).optional()?)
    }

    fn providers_by_family(&self, family: ProviderFamily) -> StoreResult<Vec<ProviderInstance>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare_cached("select * from providers where family = ?1 order by id")?;
        let rows = stmt.query_map(params![family.as_str()], provider_from_row)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    fn list_providers(&self) -> StoreResult<Vec<ProviderInstance>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached("select * from providers order by id")?;
        let rows = stmt.query_map([], provider_from_row)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    fn upsert_catalog_entry(&self, model: &str, family: ProviderFamily) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "insert into model_catalog (model, family) values (?1, ?2)
             on conflict(model) do update set family = excluded.family",
            params![model, family.as_str()],
        )?;
        Ok(())
    }

    fn catalog_family(&self, model: &str) -> StoreResult<Option<ProviderFamily>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached("select family from model_catalog where model = ?1")?;
        let family: Option<String> = stmt
            .query_row(params![model], |row| row.get(0))
            .optional()?;
        Ok(family.as_deref().and_then(ProviderFamily::from_str))
    }

    fn list_catalog(&self) -> StoreResult<Vec<CatalogEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare_cached("select model, family from model_catalog order by model")?;
        let rows = stmt.query_map([], |row| {
            let model: String = row.get(0)?;
            let family: String = row.get(1)?;
            Ok((model, family))
        })?;
        Ok(rows
            .filter_map(|r| r.ok())
            .filter_map(|(model, family)| {
                ProviderFamily::from_str(&family).map(|family| CatalogEntry { model, family })
            })
            .collect())
    }

    fn upsert_model_price(&self, model: &str, usd_per_1k: f64) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "insert into model_prices (model, usd_per_1k) values (?1, ?2)
             on conflict(model) do update set usd_per_1k = excluded.usd_per_1k",
            params![model, usd_per_1k],
        )?;
        Ok(())
    }

    fn model_price(&self, model: &str) -> StoreResult<Option<f64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare_cached("select usd_per_1k from model_prices where model = ?1")?;
        Ok(stmt
            .query_row(params![model], |row| row.get(0))
            .optional()?)
    }

    fn upsert_routing_rule(&self, rule: &RoutingRule) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "insert into routing_rules
                (tenant_id, capability, primary_provider, secondary_provider, default_model)
             values (?1, ?2, ?3, ?4, ?5)
             on conflict(tenant_id, capability) do update set
                primary_provider = excluded.primary_provider,
                secondary_provider = excluded.secondary_provider,
                default_model = excluded.default_model",
            params![
                rule.tenant_id,
                rule.capability.as_str(),
                rule.primary_provider,
                rule.secondary_provider,
                rule.default_model,
            ],
        )?;
        Ok(())
    }

    fn routing_rule(
        &self,
        tenant_id: &str,
        capability: Capability,
    ) -> StoreResult<Option<RoutingRule>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "select tenant_id, capability, primary_provider, secondary_provider, default_model
             from routing_rules where tenant_id = ?1 and capability = ?2",
        )?;
        let rule = stmt
            .query_row(params![tenant_id, capability.as_str()], |row| {
                let cap: String = row.get("capability")?;
                Ok(RoutingRule {
                    tenant_id: row.get("tenant_id")?,
                    capability: Capability::from_str(&cap).unwrap_or(Capability::Text),
                    primary_provider: row.get("primary_provider")?,
                    secondary_provider: row.get("secondary_provider")?,
                    default_model: row.get("default_model")?,
                })
            })
            .optional()?;
        Ok(rule)
    }

    fn insert_request_log(&self, log: &RequestLog) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "insert into request_logs
                (tenant_id, provider, model, latency_ms, ttft_ms, tokens, cost_usd,
                 prompt_sha256, fallback_used, status, error_kind, created_at)
             values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                log.tenant_id,
                log.provider,
                log.model,
                log.latency_ms,
                log.ttft_ms,
                log.tokens,
                log.cost_usd,
                log.prompt_sha256,
                log.fallback_used as i64,
                log.status,
                log.error_kind,
                log.created_at,
            ],
        )?;
        Ok(())
    }

    fn recent_request_logs(
        &self,
        tenant_id: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<RequestLog>> {
        let conn = self.conn.lock().unwrap();
        match tenant_id {
            Some(tenant) => {
                let mut stmt = conn.prepare_cached(
                    "select * from request_logs where tenant_id = ?1
                     order by created_at desc, id desc limit ?2 offset ?3",
                )?;
                let rows = stmt.query_map(params![tenant, limit, offset], request_log_from_row)?;
                Ok(rows.filter_map(|r| r.ok()).collect())
            }
            None => {
                let mut stmt = conn.prepare_cached(
                    "select * from request_logs
                     order by created_at desc, id desc limit ?1 offset ?2",
                )?;
                let rows = stmt.query_map(params![limit, offset], request_log_from_row)?;
                Ok(rows.filter_map(|r| r.ok()).collect())
            }
        }
    }

    fn debit_balance(&self, tenant_id: &str, amount_usd: f64) -> StoreResult<f64> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "update tenants
                set balance = balance - ?1, total_spent = total_spent + ?1
              where id = ?2",
            params![amount_usd, tenant_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("tenant '{tenant_id}'")));
        }
        let balance: f64 = conn.query_row(
            "select balance from tenants where id = ?1",
            params![tenant_id],
            |row| row.get(0),
        )?;
        Ok(balance)
    }

    fn append_transaction(&self, tx: &Transaction) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "insert into transactions
                (tenant_id, kind, amount_usd, balance_after, description, created_at)
             values (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                tx.tenant_id,
                tx.kind,
                tx.amount_usd,
                tx.balance_after,
                tx.description,
                tx.created_at,
            ],
        )?;
        Ok(())
    }

    fn list_transactions(
        &self,
        tenant_id: &str,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<Transaction>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "select * from transactions where tenant_id = ?1
             order by created_at desc, id desc limit ?2 offset ?3",
        )?;
        let rows = stmt.query_map(params![tenant_id, limit, offset], transaction_from_row)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    fn add_usage_day(
        &self,
        tenant_id: &str,
        provider: &str,
        model: &str,
        day: &str,
        tokens: i64,
        cost_usd: f64,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "insert into usage_daily (tenant_id, provider, model, day, tokens, cost_usd)
             values (?1, ?2, ?3, ?4, ?5, ?6)
             on conflict(tenant_id, provider, model, day) do update set
                tokens = tokens + excluded.tokens,
                cost_usd = cost_usd + excluded.cost_usd",
            params![tenant_id, provider, model, day, tokens, cost_usd],
        )?;
        Ok(())
    }

    fn usage_day(
        &self,
        tenant_id: &str,
        provider: &str,
        model: &str,
        day: &str,
    ) -> StoreResult<Option<UsageDay>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "select tokens, cost_usd from usage_daily
             where tenant_id = ?1 and provider = ?2 and model = ?3 and day = ?4",
        )?;
        let row = stmt
            .query_row(params![tenant_id, provider, model, day], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
            })
            .optional()?;
        Ok(row.map(|(tokens, cost_usd)| UsageDay {
            tenant_id: tenant_id.to_string(),
            provider: provider.to_string(),
            model: model.to_string(),
            day: day.to_string(),
            tokens,
            cost_usd,
        }))
    }

    fn touch_last_active(&self, tenant_id: &str) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "update tenants set last_active = ?1 where id = ?2",
            params![now_ts(), tenant_id],
        )?;
        Ok(())
    }
}
