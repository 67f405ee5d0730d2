//! The long-lived agent process.
//!
//! A single-owner cooperative main loop drives the heartbeat tick;
//! spawned tasks supervise hypervisor children (provider), stream log
//! batches, and rotate the client certificate. On shutdown the agent
//! drains gracefully: running microVMs stop in a parallel fan-out with
//! a join barrier, a final heartbeat marked `shutdown` reports the last
//! word, and the log channel is flushed.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinSet;
use tracing::{info, warn};

use nkudo_core::wire::{
    ExecutionUpdate, HeartbeatRequest, LogBatchRequest, LogFrame, LOG_FLUSH_THRESHOLD,
};

use crate::client::ControlPlaneClient;
use crate::config::AgentConfig;
use crate::executor::Executor;
use crate::identity::{collect_facts, read_client_cert};
use crate::provider::Provider;
use crate::rotator::Rotator;
use crate::statestore::StateStore;

/// How often buffered log frames flush even below the threshold.
const LOG_FLUSH_INTERVAL: Duration = Duration::from_secs(2);

/// Run the agent until a shutdown signal.
///
/// # Errors
///
/// Fails fast when the host is not enrolled or the state store cannot
/// be opened; runtime failures are logged and retried, never fatal.
pub async fn run(config: AgentConfig) -> anyhow::Result<()> {
    let store = Arc::new(
        StateStore::open(&config.state_file(), config.state_key)
            .context("opening state store")?,
    );
    let identity = store
        .identity()
        .await
        .context("agent is not enrolled — run `nkudo-edge enroll` first")?;

    info!(
        agent_id = %identity.agent_id,
        tenant_id = %identity.tenant_id,
        site_id = %identity.site_id,
        "agent starting"
    );

    let client = ControlPlaneClient::new(&config.control_plane_url, config.http_timeout)
        .context("building control plane client")?;
    let provider = Arc::new(Provider::new(config.clone(), Arc::clone(&store)));

    let (log_tx, log_rx) = mpsc::channel::<LogFrame>(1024);
    let executor = Executor::new(
        config.clone(),
        Arc::clone(&store),
        Arc::clone(&provider),
        log_tx,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let rotate_nudge = Arc::new(Notify::new());

    // Log streamer.
    let streamer_handle = {
        let client = client.clone();
        let config = config.clone();
        tokio::spawn(async move {
            log_streamer(log_rx, &client, &config).await;
        })
    };

    // Cert rotator.
    let rotator_handle = {
        let rotator = Rotator::new(config.clone(), Arc::clone(&store), client.clone());
        let rx = shutdown_rx.clone();
        let nudge = Arc::clone(&rotate_nudge);
        tokio::spawn(async move {
            rotator.run(rx, nudge).await;
        })
    };

    // Signal handler.
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        });
    }

    let mut shutdown = shutdown_rx.clone();
    let mut interval = tokio::time::interval(Duration::from_secs(15));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut pending_updates: Vec<ExecutionUpdate> = Vec::new();

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match heartbeat_once(&config, &client, &provider, &mut pending_updates, false).await {
                    Ok(response) => {
                        if response.rotate_certificate {
                            rotate_nudge.notify_one();
                        }
                        if response.next_heartbeat_s > 0
                            && Duration::from_secs(response.next_heartbeat_s) != interval.period()
                        {
                            interval = tokio::time::interval(Duration::from_secs(response.next_heartbeat_s));
                            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                            interval.reset();
                        }
                        // Deleting tombstones were reported; drop them.
                        if let Err(e) = provider.prune_tombstones().await {
                            warn!(error = %e, "failed to prune tombstones");
                        }
                        // Execute newly leased plans in order.
                        for plan in &response.plans {
                            let updates = executor.execute_plan(plan).await;
                            pending_updates.extend(updates);
                        }
                    }
                    Err(e) => warn!(error = %e, "heartbeat failed, will retry next tick"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    // Graceful drain: stop running VMs in parallel, join barrier.
    info!("draining: stopping running microVMs");
    let mut join_set = JoinSet::new();
    for vm_id in provider.running_vms().await {
        let provider = Arc::clone(&provider);
        join_set.spawn(async move {
            if let Err(e) = provider.stop(vm_id).await {
                warn!(%vm_id, error = %e, "drain stop failed");
            }
        });
    }
    while join_set.join_next().await.is_some() {}

    // Final heartbeat marked shutdown.
    if let Err(e) =
        heartbeat_once(&config, &client, &provider, &mut pending_updates, true).await
    {
        warn!(error = %e, "final heartbeat failed");
    }

    // Let the streamer flush, then stop the background tasks.
    drop(executor);
    let _ = tokio::time::timeout(Duration::from_secs(5), streamer_handle).await;
    rotator_handle.abort();

    info!("agent stopped");
    Ok(())
}

/// One heartbeat exchange. On success the pending updates are consumed;
/// on failure they are retained for the next tick.
async fn heartbeat_once(
    config: &AgentConfig,
    client: &ControlPlaneClient,
    provider: &Arc<Provider>,
    pending_updates: &mut Vec<ExecutionUpdate>,
    shutdown: bool,
) -> anyhow::Result<nkudo_core::wire::HeartbeatResponse> {
    let Some(cert_pem) = read_client_cert(config)? else {
        anyhow::bail!("client certificate missing — waiting for rotation");
    };

    let statuses = provider
        .statuses()
        .await
        .map_err(|e| anyhow::anyhow!("collecting vm statuses: {e}"))?;

    let request = HeartbeatRequest {
        // Wall-clock milliseconds: strictly increasing across ticks and
        // restarts without persisting a counter.
        heartbeat_seq: u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0),
        shutdown,
        facts: collect_facts(config),
        microvms: statuses,
        executions: std::mem::take(pending_updates),
    };

    match client.heartbeat(&cert_pem, &request).await {
        Ok(response) => Ok(response),
        Err(e) => {
            // Outcomes must survive a failed exchange.
            let mut restored = request.executions;
            restored.extend(std::mem::take(pending_updates));
            *pending_updates = restored;
            Err(e.into())
        }
    }
}

/// Batch frames from the executor and push them upstream. Flushes at
/// the threshold or on a short interval, and drains on channel close.
async fn log_streamer(
    mut rx: mpsc::Receiver<LogFrame>,
    client: &ControlPlaneClient,
    config: &AgentConfig,
) {
    let mut batch: Vec<LogFrame> = Vec::new();
    let mut flush_tick = tokio::time::interval(LOG_FLUSH_INTERVAL);

    loop {
        tokio::select! {
            frame = rx.recv() => {
                match frame {
                    Some(frame) => {
                        batch.push(frame);
                        if batch.len() >= LOG_FLUSH_THRESHOLD {
                            flush_logs(&mut batch, client, config).await;
                        }
                    }
                    None => {
                        flush_logs(&mut batch, client, config).await;
                        return;
                    }
                }
            }
            _ = flush_tick.tick() => {
                flush_logs(&mut batch, client, config).await;
            }
        }
    }
}

async fn flush_logs(
    batch: &mut Vec<LogFrame>,
    client: &ControlPlaneClient,
    config: &AgentConfig,
) {
    if batch.is_empty() {
        return;
    }
    let Ok(Some(cert_pem)) = read_client_cert(config) else {
        batch.clear();
        return;
    };
    let frames = std::mem::take(batch);
    let count = frames.len();
    match client
        .push_logs(&cert_pem, &LogBatchRequest { frames })
        .await
    {
        Ok(resp) => {
            if resp.dropped > 0 {
                // The server is telling us to slow down or that we
                // replayed; either way the frames are gone.
                tracing::debug!(accepted = resp.accepted, dropped = resp.dropped, "log flush");
            }
        }
        Err(e) => {
            warn!(error = %e, count, "log flush failed, frames dropped");
        }
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
