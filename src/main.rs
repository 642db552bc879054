//! mail-grant-bridge: OAuth2-style grant bridge over a managed IMAP pool
//!
//! Lets third-party applications obtain a token-exchanged "grant id" for an
//! end-user mailbox, then keeps a supervised IMAP IDLE listener running per
//! active account, delivering new-message events to an out-of-process
//! webhook shipper via a durable, append-only log.
//!
//! # Architecture
//!
//! - [`main`]: process entry point — explicit root-factory wiring, no DI
//!   container (`spec.md` §9 redesign note)
//! - [`config`]: environment-driven configuration
//! - [`errors`]: application error model with HTTP error mapping
//! - [`models`]: data model for every persisted aggregate
//! - [`db`]: SQLite persistence (`sqlx`, runtime query API)
//! - [`crypto`]: credential-at-rest encryption and authorization-code generation
//! - [`imap`]: IMAP transport/session operations with timeout wrappers
//! - [`rate_limiter`]: per-provider token bucket
//! - [`pool`]: managed connection pool (component B)
//! - [`uid_tracker`]: UID delta tracking (component D)
//! - [`emitter`]: webhook event durability boundary (component E)
//! - [`listener`]: supervised per-account IDLE loop (component C)
//! - [`auth_code`]: authorization code store (component F)
//! - [`authorization`]: authorization controller (component G)
//! - [`token_exchange`]: token exchange (component H)
//! - [`http`]: axum routes binding the above to `/auth`, `/process`, `/token`

mod auth_code;
mod authorization;
mod config;
mod crypto;
mod db;
mod emitter;
mod errors;
mod http;
mod imap;
mod listener;
mod models;
mod pool;
mod rate_limiter;
mod token_exchange;
mod uid_tracker;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use config::{CANCEL_GRACE_PERIOD, ServerConfig};
use db::Db;

/// Every account listens on this mailbox; `spec.md` does not model
/// per-account folder selection, so the bridge syncs the one mailbox an
/// end-user's IMAP login conventionally exposes as their primary inbox.
const DEFAULT_FOLDER: &str = "INBOX";

/// Polling period for the pool maintenance loop. Independent of
/// `pool_max_idle_seconds`, which is the idle-eviction threshold, not a poll
/// interval.
const POOL_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let config = ServerConfig::load_from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.environment.default_log_filter())),
        )
        .init();

    let db = Db::connect(
        &config.database_url,
        config.database_min_pool_size,
        config.database_max_pool_size,
    )
    .await?;

    let cipher = crypto::CredentialCipher::from_env()?;
    let pool = Arc::new(pool::ConnectionPool::new(&config));
    let codes = auth_code::AuthCodeStore::new(db.clone(), &config);

    let authorization =
        authorization::AuthorizationController::new(db.clone(), config.clone(), cipher.clone(), codes.clone());
    let token_exchange = token_exchange::TokenExchange::new(db.clone(), codes);

    let app_state = Arc::new(http::AppState {
        db: db.clone(),
        authorization,
        token_exchange,
    });

    let shutdown = CancellationToken::new();
    let mut handles = spawn_account_listeners(&db, &pool, &cipher, &config, &shutdown).await?;
    handles.push(tokio::spawn(run_pool_maintenance(
        Arc::clone(&pool),
        config.pool_max_idle_seconds,
        shutdown.child_token(),
    )));

    let tcp_listener = tokio::net::TcpListener::bind(&config.http_bind_addr).await?;
    tracing::info!(addr = %config.http_bind_addr, "mail-grant-bridge listening");

    let server = axum::serve(tcp_listener, http::router(app_state));
    tokio::select! {
        result = server => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server exited with an error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    shutdown.cancel();
    // `spec.md` §5: supervised tasks get a bounded grace period to wind down
    // before forceful termination, rather than being awaited indefinitely.
    for mut handle in handles {
        if tokio::time::timeout(CANCEL_GRACE_PERIOD, &mut handle).await.is_err() {
            tracing::warn!("a supervised task exceeded its shutdown grace period; aborting it");
            handle.abort();
        }
    }
    pool.close_all().await;

    Ok(())
}

/// Partition active accounts round-robin across `workers_num` supervisor
/// tasks (`WORKERS_NUM`), each driving its shard's IDLE listeners
/// concurrently, rather than one OS task per account.
async fn spawn_account_listeners(
    db: &Db,
    pool: &Arc<pool::ConnectionPool>,
    cipher: &crypto::CredentialCipher,
    config: &ServerConfig,
    shutdown: &CancellationToken,
) -> Result<Vec<JoinHandle<()>>, Box<dyn std::error::Error>> {
    let accounts = db.list_active_accounts().await?;
    let worker_count = config.workers_num.max(1);
    let mut shards: Vec<Vec<models::Account>> = (0..worker_count).map(|_| Vec::new()).collect();
    for (index, account) in accounts.into_iter().enumerate() {
        shards[index % worker_count].push(account);
    }

    let mut handles = Vec::with_capacity(worker_count);
    for shard in shards {
        let db = db.clone();
        let pool = Arc::clone(pool);
        let cipher = cipher.clone();
        let config = config.clone();
        let cancel = shutdown.child_token();
        handles.push(tokio::spawn(run_listener_supervisor(shard, db, pool, cipher, config, cancel)));
    }

    Ok(handles)
}

/// One supervisor owns a shard of accounts and runs their IDLE listeners
/// concurrently until every one of them stops.
async fn run_listener_supervisor(
    accounts: Vec<models::Account>,
    db: Db,
    pool: Arc<pool::ConnectionPool>,
    cipher: crypto::CredentialCipher,
    config: ServerConfig,
    shutdown: CancellationToken,
) {
    let listeners = accounts.into_iter().map(|account| {
        let uid_tracker = uid_tracker::UidTracker::new(db.clone());
        let emitter = emitter::EventEmitter::new(db.clone());
        listener::AccountListener::new(
            account.id,
            DEFAULT_FOLDER.to_owned(),
            db.clone(),
            Arc::clone(&pool),
            uid_tracker,
            emitter,
            cipher.clone(),
            config.clone(),
            shutdown.child_token(),
        )
        .run()
    });
    futures::future::join_all(listeners).await;
}

/// Periodically evict connections idle past `POOL_MAX_IDLE_SECONDS` and log
/// per-provider pool stats; exits once `shutdown` is cancelled.
async fn run_pool_maintenance(pool: Arc<pool::ConnectionPool>, max_idle_seconds: u64, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(POOL_MAINTENANCE_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                pool.cleanup_idle(max_idle_seconds).await;
                tracing::debug!(stats = ?pool.stats().await, "connection pool maintenance");
            }
            _ = shutdown.cancelled() => return,
        }
    }
}
