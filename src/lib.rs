pub mod aggregator;
pub mod calendar;
pub mod capture;
pub mod commands;
pub mod config;
pub mod dates;
pub mod error;
pub mod events;
#[cfg(feature = "app")]
pub mod google;
pub mod logging;
pub mod models;
pub mod remote;
pub mod retry;
pub mod scheduler;
pub mod session;
pub mod storage;
pub mod store;
pub mod sync;
pub mod transport;

#[cfg(all(feature = "app", not(test)))]
use std::sync::Arc;

#[cfg(all(feature = "app", not(test)))]
use crate::aggregator::{TaskAggregator, ViewKind};
#[cfg(all(feature = "app", not(test)))]
use crate::commands::AppContext;
#[cfg(all(feature = "app", not(test)))]
use crate::config::{setting_value, Credentials, SyncConfig, KEY_ACTIVE_LIST};
#[cfg(all(feature = "app", not(test)))]
use crate::google::GoogleClient;
#[cfg(all(feature = "app", not(test)))]
use crate::session::Session;
#[cfg(all(feature = "app", not(test)))]
use crate::storage::Storage;
#[cfg(all(feature = "app", not(test)))]
use crate::store::{purge_expired_tasks, LocalStore, RecordStore};
#[cfg(all(feature = "app", not(test)))]
use crate::sync::SyncEngine;

/// Boots the backend: logging, the local store, the Google client and the
/// background sync tasks. Runs until Ctrl-C.
#[cfg(all(feature = "app", not(test)))]
pub fn run() -> Result<(), Box<dyn std::error::Error>> {
    let data_dir = config::data_dir();
    logging::init_logging(&data_dir)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(Storage::new(data_dir)))
}

#[cfg(all(feature = "app", not(test)))]
async fn serve(storage: Storage) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(LocalStore::open(storage)?);
    let settings = store.settings().await?;
    let sync_config = SyncConfig::from_settings(&settings);
    let credentials = Credentials::from_settings(&settings);
    log::info!("starting config={sync_config:?} credentials={credentials:?}");

    if let Err(err) =
        purge_expired_tasks(store.as_ref(), dates::now_millis(), sync_config.retention).await
    {
        log::warn!("retention purge failed: {err}");
    }

    let shared: Arc<dyn RecordStore> = store;
    let session = Session::new(credentials.access_token.is_some());
    if let Some(list_id) = setting_value(&settings, KEY_ACTIVE_LIST) {
        session.set_active_list(list_id);
    }

    let google = Arc::new(GoogleClient::new(Arc::clone(&shared), &sync_config)?);
    let engine = SyncEngine::new(
        Arc::clone(&shared),
        google.clone(),
        session.clone(),
        sync_config,
        credentials,
    );
    let aggregator = TaskAggregator::new(Arc::clone(&shared), Some(google.clone()), session.clone());
    let ctx = AppContext {
        store: shared,
        session,
        engine: engine.clone(),
        aggregator: aggregator.clone(),
        calendar: Some(google),
        structuring: None,
    };

    let _auto_backup = engine.spawn_auto_backup();
    let _sign_in_watch = engine.spawn_sign_in_watch();
    let _views = aggregator.spawn_refresh_loop();
    let primary = commands::list_view(&ctx, ViewKind::Primary).await;
    log::info!(
        "ready signed_in={} primary_items={}",
        ctx.session.is_signed_in(),
        primary.data.map_or(0, |items| items.len())
    );

    tokio::signal::ctrl_c().await?;
    log::info!("shutting down");
    if let Err(err) = engine.flush_pending_backup().await {
        log::warn!("final backup failed: {err}");
    }
    Ok(())
}
