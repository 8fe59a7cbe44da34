//! Orchestration of a single discovery pass.

use std::time::Duration;

use serde::Serialize;
use tracing::info;

use crate::crawlers::{HttpCrawler, ReqwestFetcher};
use crate::error::{DiscoveryError, Result, StoreError};
use crate::stores::{open_store, AnyEngine, ReconciliationStore};
use crate::traits::crawler::{Crawler, TraversalRules};
use crate::traits::store::StorageEngine;
use crate::types::config::{DiscoveryConfig, Protocol};
use crate::types::record::{CountType, RecordStatus, StoredRecord};

/// What one pass hands back to the orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryOutput {
    /// Records inserted or updated by this pass
    pub discovered_files_count: usize,
    /// Files of this collection and path now in `queued` status
    pub queued_files_count: u64,
    /// Records dequeued by this pass, oldest first
    pub batch: Vec<StoredRecord>,
}

/// Per-pass values shared by every protocol branch.
struct Pass<'a> {
    config: &'a DiscoveryConfig,
    collection_id: String,
    path_filter: String,
}

impl Pass<'_> {
    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.provider.timeout_secs)
    }

    fn crawl_error(&self, source: crate::error::CrawlError) -> DiscoveryError {
        DiscoveryError::crawl(&self.collection_id, source)
    }

    async fn run<C: Crawler>(&self, crawler: &C, store: &mut ReconciliationStore<AnyEngine>) -> Result<DiscoveryOutput> {
        run_with(crawler, store, &self.collection_id, &self.path_filter, self.config.batch_limit).await
    }
}

/// Run one discovery pass as described by `config`.
///
/// The store is closed on every exit path, including crawl failures.
pub async fn run_discovery(config: &DiscoveryConfig) -> Result<DiscoveryOutput> {
    config.validate()?;

    let pass = Pass {
        config,
        collection_id: config.collection.collection_id(),
        path_filter: config.collection.path_filter(),
    };
    let rules = TraversalRules::from_collection(&config.collection).map_err(|e| pass.crawl_error(e))?;

    info!(
        collection_id = %pass.collection_id,
        protocol = config.provider.protocol.as_str(),
        host = %config.provider.host,
        path = %config.collection.provider_path,
        policy = %config.collection.duplicate_handling,
        "Discovery pass starting"
    );

    let mut store = open_store(&config.store, config.collection.duplicate_handling)
        .await
        .map_err(|e| DiscoveryError::store(&pass.collection_id, e))?;

    let outcome = match config.provider.protocol {
        Protocol::S3 => discover_s3(&pass, rules, &mut store).await,
        Protocol::Http | Protocol::Https => discover_http(&pass, rules, &mut store).await,
        Protocol::Ftp => discover_ftp(&pass, rules, &mut store).await,
        Protocol::Sftp => discover_sftp(&pass, rules, &mut store).await,
    };
    let closed = store.close().await;

    let output = outcome?;
    closed.map_err(|e| DiscoveryError::store(&pass.collection_id, e))?;

    info!(
        collection_id = %pass.collection_id,
        discovered = output.discovered_files_count,
        queued = output.queued_files_count,
        batch = output.batch.len(),
        "Discovery pass completed"
    );
    Ok(output)
}

/// Crawl with `crawler`, reconcile into `store` and dequeue one batch.
///
/// The caller owns `store` and is responsible for closing it.
pub async fn run_with<C, E>(
    crawler: &C,
    store: &mut ReconciliationStore<E>,
    collection_id: &str,
    path_filter: &str,
    batch_limit: usize,
) -> Result<DiscoveryOutput>
where
    C: Crawler,
    E: StorageEngine,
{
    let store_error = |e: StoreError| DiscoveryError::store(collection_id, e);

    let candidates = crawler
        .discover()
        .await
        .map_err(|e| DiscoveryError::crawl(collection_id, e))?;

    store.add_all(candidates).await.map_err(store_error)?;
    store.flush().await.map_err(store_error)?;

    let batch = store
        .read_batch(collection_id, path_filter, batch_limit)
        .await
        .map_err(store_error)?;
    let queued_files_count = store
        .count(collection_id, path_filter, RecordStatus::Queued, CountType::Files)
        .await
        .map_err(store_error)?;

    Ok(DiscoveryOutput {
        discovered_files_count: store.discovered_files(),
        queued_files_count,
        batch,
    })
}

#[cfg(any(not(feature = "s3"), not(feature = "ftp"), not(feature = "sftp")))]
fn feature_disabled(protocol: Protocol, feature: &str) -> DiscoveryError {
    DiscoveryError::Config(format!(
        "protocol {} requires the `{feature}` feature",
        protocol.as_str()
    ))
}

#[cfg(feature = "s3")]
async fn discover_s3(
    pass: &Pass<'_>,
    rules: TraversalRules,
    store: &mut ReconciliationStore<AnyEngine>,
) -> Result<DiscoveryOutput> {
    use crate::crawlers::{AwsObjectClient, S3Crawler};

    let provider = &pass.config.provider;
    let client = AwsObjectClient::from_env().await;
    let crawler = S3Crawler::new(client, &provider.host, &pass.config.collection.provider_path, rules)
        .with_staging_bucket(provider.staging_bucket.clone())
        .with_concurrency(provider.concurrency);
    pass.run(&crawler, store).await
}

#[cfg(not(feature = "s3"))]
async fn discover_s3(
    _pass: &Pass<'_>,
    _rules: TraversalRules,
    _store: &mut ReconciliationStore<AnyEngine>,
) -> Result<DiscoveryOutput> {
    Err(feature_disabled(Protocol::S3, "s3"))
}

async fn discover_http(
    pass: &Pass<'_>,
    rules: TraversalRules,
    store: &mut ReconciliationStore<AnyEngine>,
) -> Result<DiscoveryOutput> {
    let provider = &pass.config.provider;
    let root = http_root(
        provider.protocol,
        &provider.host,
        provider.port,
        &pass.config.collection.provider_path,
    );

    let fetcher = ReqwestFetcher::new(pass.timeout()).map_err(|e| pass.crawl_error(e))?;
    let crawler = HttpCrawler::new(fetcher, &root, rules)
        .map_err(|e| pass.crawl_error(e))?
        .with_head_metadata(provider.head_metadata)
        .with_concurrency(provider.concurrency);
    pass.run(&crawler, store).await
}

/// Index URL for an HTTP(S) provider; the port is omitted unless configured.
fn http_root(protocol: Protocol, host: &str, port: Option<u16>, provider_path: &str) -> String {
    let port = port.map(|p| format!(":{p}")).unwrap_or_default();
    format!(
        "{}://{}{}/{}",
        protocol.as_str(),
        host.trim_end_matches('/'),
        port,
        provider_path.trim_start_matches('/')
    )
}

#[cfg(feature = "ftp")]
async fn discover_ftp(
    pass: &Pass<'_>,
    rules: TraversalRules,
    store: &mut ReconciliationStore<AnyEngine>,
) -> Result<DiscoveryOutput> {
    use crate::crawlers::{FtpCrawler, SuppaFtpSession};

    let provider = &pass.config.provider;
    let session = SuppaFtpSession::connect(
        &provider.host,
        provider.port(),
        provider.username.as_deref(),
        provider.password.as_deref(),
        pass.timeout(),
    )
    .await
    .map_err(|e| pass.crawl_error(e))?;

    let crawler = FtpCrawler::new(session, &provider.host, &pass.config.collection.provider_path, rules);
    pass.run(&crawler, store).await
}

#[cfg(not(feature = "ftp"))]
async fn discover_ftp(
    _pass: &Pass<'_>,
    _rules: TraversalRules,
    _store: &mut ReconciliationStore<AnyEngine>,
) -> Result<DiscoveryOutput> {
    Err(feature_disabled(Protocol::Ftp, "ftp"))
}

#[cfg(feature = "sftp")]
async fn discover_sftp(
    pass: &Pass<'_>,
    rules: TraversalRules,
    store: &mut ReconciliationStore<AnyEngine>,
) -> Result<DiscoveryOutput> {
    use crate::crawlers::{SftpCrawler, Ssh2Session};

    let provider = &pass.config.provider;
    let username = provider
        .username
        .as_deref()
        .ok_or_else(|| DiscoveryError::Config("provider.username is required for sftp".into()))?;
    let session = Ssh2Session::connect(
        &provider.host,
        provider.port(),
        username,
        provider.password.as_deref(),
        pass.timeout(),
    )
    .await
    .map_err(|e| pass.crawl_error(e))?;

    let crawler = SftpCrawler::new(session, &provider.host, &pass.config.collection.provider_path, rules);
    pass.run(&crawler, store).await
}

#[cfg(not(feature = "sftp"))]
async fn discover_sftp(
    _pass: &Pass<'_>,
    _rules: TraversalRules,
    _store: &mut ReconciliationStore<AnyEngine>,
) -> Result<DiscoveryOutput> {
    Err(feature_disabled(Protocol::Sftp, "sftp"))
}
