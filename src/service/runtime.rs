//! Presence DLP - Service Runtime
//!
//! Startup order: protected storage, master key (fatal on failure), store,
//! fresh gateway token, analyzer, guard. The monitoring loop gets its own
//! thread; the gateway runs on tokio. On Ctrl+C or SIGTERM the loop is
//! stopped and every frozen process is resumed before returning. A loop
//! that ends on its own takes the service down with it.

use std::sync::Arc;

use tracing::{error, info, warn};

use super::{AuthorizationState, ControlMessage, SecurityService, ServiceSettings};
use crate::config::ServiceConfig;
use crate::crypto::{generate_token, MachineBoundStore};
use crate::error::{DlpError, DlpResult};
use crate::gateway::{store_token, Gateway, GatewayContext};
use crate::guard::{ProcessGuard, SystemPlatform};
use crate::storage::{SqliteStore, Storage};
use crate::vault::CryptoVault;
use crate::vision::{DirectoryFrameSource, LivenessAnalyzer, LivenessSettings, NullFaceEngine};

/// Run the agent until a shutdown signal arrives
pub async fn serve(config: ServiceConfig) -> DlpResult<()> {
    std::fs::create_dir_all(&config.data_dir)?;

    let protected = MachineBoundStore::new()?;
    let vault = Arc::new(CryptoVault::open(&config.master_key_path(), &protected)?);
    let storage: Arc<dyn Storage> = Arc::new(SqliteStore::open(&config.db_path(), Arc::clone(&vault))?);

    let token = generate_token();
    store_token(&config.token_path(), &token, &protected)?;

    let analyzer = LivenessAnalyzer::new(
        DirectoryFrameSource::new(&config.frames_dir(), config.max_frame_age()),
        NullFaceEngine,
        Arc::clone(&storage),
        vault,
        LivenessSettings::from_config(&config),
    )?;
    warn!("No face engine installed: protected applications stay blocked while running");

    let state = Arc::new(AuthorizationState::new());
    let guard = Arc::new(ProcessGuard::new(Box::new(SystemPlatform::new())));
    let mut service = SecurityService::new(
        storage,
        Box::new(analyzer),
        Arc::clone(&guard),
        Arc::clone(&state),
        ServiceSettings::from_config(&config),
    )?;
    info!("Protecting {} application(s)", service.blacklist().len());

    let (control_tx, control_rx) = crossbeam_channel::unbounded();
    let context = GatewayContext::new(token, state, control_tx.clone(), config.max_frame_len);
    let gateway = Gateway::bind(config.gateway_addr(), context).await?;

    let monitor = std::thread::Builder::new()
        .name("dlp-monitor".into())
        .spawn(move || service.run(&control_rx))?;
    let mut monitor_exit = tokio::task::spawn_blocking(move || monitor.join());
    let gateway_task = tokio::spawn(gateway.run());

    let early_exit = tokio::select! {
        _ = shutdown_signal() => false,
        _ = &mut monitor_exit => true,
    };

    gateway_task.abort();
    if early_exit {
        error!("Monitoring loop stopped unexpectedly, shutting down");
    } else {
        if control_tx.send(ControlMessage::Shutdown).is_err() {
            warn!("Monitoring loop already stopped");
        }
        match monitor_exit.await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => error!("Monitoring loop panicked"),
            Err(e) => error!("Monitor join failed: {}", e),
        }
    }

    // idempotent; covers a loop that died before its own cleanup
    guard.release_all();
    info!("Security Service stopped");
    if early_exit {
        return Err(DlpError::MonitorStopped("exited before shutdown".into()));
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Graceful shutdown initiated");
}
