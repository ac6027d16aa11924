//! Mail exchanger resolution (RFC 5321 §5.1).
//!
//! MX records are returned in ascending preference order, keeping only the
//! exchanges that have an address record. A domain without MX records but
//! with an address record gets a single implicit MX of preference 0; a null
//! MX (RFC 7505) means the domain takes no mail. Results are cached per
//! domain for the record TTL, clamped to configured bounds.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::future::join_all;
use hermes_common::{Domain, tracing};
use hickory_resolver::{
    TokioResolver,
    config::{ResolverConfig, ResolverOpts},
    name_server::TokioConnectionProvider,
    proto::rr::Record,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SMTP_PORT: u16 = 25;

#[derive(Debug, Error)]
pub enum DnsError {
    /// No exchange with an address record, or a null MX.
    #[error("No mail servers found for domain: {0}")]
    NoMailServers(String),

    #[error("DNS lookup failed: {0}")]
    LookupFailed(#[from] hickory_resolver::ResolveError),

    /// NXDOMAIN.
    #[error("Domain does not exist: {0}")]
    DomainNotFound(String),
}

impl DnsError {
    /// A failed lookup might succeed later; a definitive answer will not.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::LookupFailed(_))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DnsConfig {
    /// Default: 5 seconds
    #[serde(default = "defaults::timeout_secs")]
    pub timeout_secs: u64,

    /// Replaces the record TTL for every entry when set.
    #[serde(default)]
    pub cache_ttl_secs: Option<u64>,

    /// Default: 60 seconds
    #[serde(default = "defaults::min_cache_ttl_secs")]
    pub min_cache_ttl_secs: u64,

    /// Default: 3600 seconds
    #[serde(default = "defaults::max_cache_ttl_secs")]
    pub max_cache_ttl_secs: u64,

    /// Once reached, expired entries are swept on insert, then the entry
    /// closest to expiry makes room.
    ///
    /// Default: 1000
    #[serde(default = "defaults::cache_size")]
    pub cache_size: usize,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: defaults::timeout_secs(),
            cache_ttl_secs: None,
            min_cache_ttl_secs: defaults::min_cache_ttl_secs(),
            max_cache_ttl_secs: defaults::max_cache_ttl_secs(),
            cache_size: defaults::cache_size(),
        }
    }
}

/// One delivery candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailServer {
    pub host: String,
    /// MX preference, lower first. 0 for the implicit MX.
    pub priority: u16,
    pub port: u16,
}

impl MailServer {
    #[must_use]
    pub const fn new(host: String, priority: u16, port: u16) -> Self {
        Self {
            host,
            priority,
            port,
        }
    }
}

/// Looks up where mail for a domain should go.
#[async_trait]
pub trait MailServerResolver: Send + Sync {
    ///
    /// # Errors
    /// When no candidate can be found, or the lookup itself failed.
    ///
    async fn resolve_mail_servers(&self, domain: &Domain) -> Result<Arc<Vec<MailServer>>, DnsError>;
}

#[derive(Debug, Clone)]
struct CachedResult {
    servers: Arc<Vec<MailServer>>,
    expires_at: Instant,
}

/// Per-domain results with an expiry, safe to share between tasks.
#[derive(Debug)]
pub struct MxCache {
    entries: DashMap<Domain, CachedResult>,
    ttl_override: Option<u64>,
    min_ttl: u64,
    max_ttl: u64,
    capacity: usize,
}

impl MxCache {
    #[must_use]
    pub fn new(config: &DnsConfig) -> Self {
        Self {
            entries: DashMap::new(),
            ttl_override: config.cache_ttl_secs,
            min_ttl: config.min_cache_ttl_secs,
            max_ttl: config.max_cache_ttl_secs.max(config.min_cache_ttl_secs),
            capacity: config.cache_size,
        }
    }

    /// The live entry for `domain`, if any.
    #[must_use]
    pub fn get(&self, domain: &Domain) -> Option<Arc<Vec<MailServer>>> {
        self.get_at(domain, Instant::now())
    }

    fn get_at(&self, domain: &Domain, now: Instant) -> Option<Arc<Vec<MailServer>>> {
        self.entries
            .get(domain)
            .filter(|cached| cached.expires_at > now)
            .map(|cached| Arc::clone(&cached.servers))
    }

    /// How long an answer with `record_ttl` is kept.
    #[must_use]
    pub fn effective_ttl(&self, record_ttl: u32) -> Duration {
        Duration::from_secs(
            self.ttl_override
                .unwrap_or_else(|| u64::from(record_ttl).clamp(self.min_ttl, self.max_ttl)),
        )
    }

    pub fn insert(&self, domain: Domain, servers: Arc<Vec<MailServer>>, record_ttl: u32) {
        self.insert_at(domain, servers, record_ttl, Instant::now());
    }

    fn insert_at(
        &self,
        domain: Domain,
        servers: Arc<Vec<MailServer>>,
        record_ttl: u32,
        now: Instant,
    ) {
        if self.entries.len() >= self.capacity {
            self.entries.retain(|_, cached| cached.expires_at > now);
        }

        if self.entries.len() >= self.capacity && !self.entries.contains_key(&domain) {
            let soonest = self
                .entries
                .iter()
                .min_by_key(|entry| entry.expires_at)
                .map(|entry| entry.key().clone());

            if let Some(soonest) = soonest {
                self.entries.remove(&soonest);
            }
        }

        let expires_at = now + self.effective_ttl(record_ttl);
        self.entries
            .insert(domain, CachedResult { servers, expires_at });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Resolves through the system DNS configuration.
#[derive(Debug)]
pub struct DnsResolver {
    resolver: TokioResolver,
    cache: MxCache,
}

impl DnsResolver {
    ///
    /// # Errors
    /// If the system resolver configuration cannot be loaded.
    ///
    pub fn new(config: &DnsConfig) -> Result<Self, DnsError> {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(config.timeout_secs);

        let resolver = TokioResolver::builder(TokioConnectionProvider::default())?
            .with_options(opts)
            .build();

        Ok(Self {
            resolver,
            cache: MxCache::new(config),
        })
    }

    /// Use explicit name servers instead of the system ones.
    #[must_use]
    pub fn with_resolver_config(resolver_config: ResolverConfig, config: &DnsConfig) -> Self {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(config.timeout_secs);

        let resolver =
            TokioResolver::builder_with_config(resolver_config, TokioConnectionProvider::default())
                .with_options(opts)
                .build();

        Self {
            resolver,
            cache: MxCache::new(config),
        }
    }

    async fn lookup(&self, domain: &Domain) -> Result<(Vec<MailServer>, u32), DnsError> {
        let mx = match self.resolver.mx_lookup(domain.as_str()).await {
            Ok(mx) => mx,
            Err(err) if err.is_nx_domain() => {
                return Err(DnsError::DomainNotFound(domain.to_string()));
            }
            Err(err) if err.is_no_records_found() => {
                tracing::debug!(%domain, "No MX records, trying the implicit MX");
                return self.implicit_mx(domain).await;
            }
            Err(err) => {
                tracing::warn!(%domain, "MX lookup failed: {err}");
                return Err(err.into());
            }
        };

        let ttl = min_ttl(mx.as_lookup().records());

        let exchanges: Vec<(String, u16)> = mx
            .iter()
            .map(|record| {
                (
                    record.exchange().to_utf8().trim_end_matches('.').to_string(),
                    record.preference(),
                )
            })
            .collect();

        if exchanges.is_empty() {
            return self.implicit_mx(domain).await;
        }

        let resolvable = join_all(exchanges.iter().map(|(host, _)| self.has_address(host))).await;

        let servers = mail_servers(
            domain,
            exchanges
                .into_iter()
                .zip(resolvable)
                .map(|((host, preference), resolvable)| (host, preference, resolvable)),
        )?;

        Ok((servers, ttl))
    }

    async fn implicit_mx(&self, domain: &Domain) -> Result<(Vec<MailServer>, u32), DnsError> {
        match self.resolver.lookup_ip(domain.as_str()).await {
            Ok(ips) => {
                let ttl = min_ttl(ips.as_lookup().records());
                Ok((implicit_mail_server(domain, ips.iter().next().is_some())?, ttl))
            }
            Err(err) if err.is_no_records_found() || err.is_nx_domain() => {
                Err(DnsError::NoMailServers(domain.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Whether `host` has an address record. A lookup that fails for any
    /// other reason keeps the host; the connection attempt decides.
    async fn has_address(&self, host: &str) -> bool {
        if host.is_empty() {
            return false;
        }

        match self.resolver.lookup_ip(host).await {
            Ok(ips) => ips.iter().next().is_some(),
            Err(err) if err.is_no_records_found() || err.is_nx_domain() => {
                tracing::debug!(%host, "Exchange has no address record");
                false
            }
            Err(err) => {
                tracing::warn!(%host, "Address lookup failed: {err}");
                true
            }
        }
    }
}

fn min_ttl(records: &[Record]) -> u32 {
    records.iter().map(Record::ttl).min().unwrap_or(300)
}

/// Delivery candidates from MX answers of `(exchange, preference,
/// has address)`, most preferred first.
///
/// # Errors
/// [`DnsError::NoMailServers`] for a null MX, or when no exchange has an
/// address.
fn mail_servers(
    domain: &Domain,
    exchanges: impl IntoIterator<Item = (String, u16, bool)>,
) -> Result<Vec<MailServer>, DnsError> {
    let mut servers = Vec::new();

    for (host, preference, resolvable) in exchanges {
        if host.is_empty() {
            tracing::debug!(%domain, "Null MX published");
            return Err(DnsError::NoMailServers(domain.to_string()));
        }

        if resolvable {
            servers.push(MailServer::new(host, preference, SMTP_PORT));
        }
    }

    if servers.is_empty() {
        return Err(DnsError::NoMailServers(domain.to_string()));
    }

    servers.sort_by_key(|server| server.priority);
    Ok(servers)
}

/// RFC 5321 §5.1: the domain itself, at preference 0, when it has an address.
fn implicit_mail_server(domain: &Domain, has_address: bool) -> Result<Vec<MailServer>, DnsError> {
    if has_address {
        Ok(vec![MailServer::new(domain.to_string(), 0, SMTP_PORT)])
    } else {
        Err(DnsError::NoMailServers(domain.to_string()))
    }
}

#[async_trait]
impl MailServerResolver for DnsResolver {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn resolve_mail_servers(&self, domain: &Domain) -> Result<Arc<Vec<MailServer>>, DnsError> {
        if let Some(servers) = self.cache.get(domain) {
            tracing::debug!("Cache hit, {} server(s)", servers.len());
            return Ok(servers);
        }

        let (servers, ttl) = self.lookup(domain).await?;
        let servers = Arc::new(servers);
        self.cache.insert(domain.clone(), Arc::clone(&servers), ttl);

        tracing::debug!(
            "Resolved {} server(s), cached for {:?}",
            servers.len(),
            self.cache.effective_ttl(ttl)
        );
        Ok(servers)
    }
}

mod defaults {
    pub const fn timeout_secs() -> u64 {
        5
    }

    pub const fn min_cache_ttl_secs() -> u64 {
        60
    }

    pub const fn max_cache_ttl_secs() -> u64 {
        3600
    }

    pub const fn cache_size() -> usize {
        1000
    }
}
