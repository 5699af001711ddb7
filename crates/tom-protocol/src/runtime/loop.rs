/// The protocol runtime event loop — thin orchestrator.
///
/// Owns RuntimeState and a Transport. Multiplexes over transport events,
/// application commands, and timers. Delegates all logic to RuntimeState,
/// executes effects via executor.
use tokio::sync::mpsc;

use super::effect::RuntimeEffect;
use super::executor::execute_effects;
use super::state::RuntimeState;
use super::transport::Transport;
use super::{DeliveredMessage, ProtocolEvent, RuntimeCommand};
use crate::tracker::StatusChange;
use crate::types::now_ms;

/// Main event loop — thin orchestrator.
///
/// All protocol logic lives in `RuntimeState`. This function only:
/// 1. Multiplexes I/O events via `tokio::select!`
/// 2. Calls the appropriate `RuntimeState` method
/// 3. Feeds resulting effects to the executor
pub(super) async fn runtime_loop<T: Transport>(
    mut state: RuntimeState,
    transport: T,
    mut cmd_rx: mpsc::Receiver<RuntimeCommand>,
    msg_tx: mpsc::Sender<DeliveredMessage>,
    status_tx: mpsc::Sender<StatusChange>,
    event_tx: mpsc::Sender<ProtocolEvent>,
) {
    let mut cache_cleanup = tokio::time::interval(state.config.cache_cleanup_interval);
    let mut tracker_cleanup = tokio::time::interval(state.config.tracker_cleanup_interval);
    let mut heartbeat_check = tokio::time::interval(state.config.heartbeat_interval);
    let mut group_hub_heartbeat = tokio::time::interval(state.config.group_hub_heartbeat_interval);
    let mut backup_tick = tokio::time::interval(state.config.backup_tick_interval);
    let mut presence_announce = tokio::time::interval(state.config.presence_announce_interval);
    let mut subnet_eval = tokio::time::interval(state.config.subnet_eval_interval);
    let mut role_eval = tokio::time::interval(state.config.role_eval_interval);

    // Skip the immediate first tick on every timer.
    cache_cleanup.tick().await;
    tracker_cleanup.tick().await;
    heartbeat_check.tick().await;
    group_hub_heartbeat.tick().await;
    backup_tick.tick().await;
    presence_announce.tick().await;
    subnet_eval.tick().await;
    role_eval.tick().await;

    loop {
        let effects = tokio::select! {
            // ── 1. Incoming data from transport ─────────────────
            result = transport.recv_raw() => {
                match result {
                    Ok((_from, data)) => state.handle_incoming(&data, now_ms()),
                    Err(e) => vec![RuntimeEffect::Emit(ProtocolEvent::Error {
                        description: format!("recv error: {e}"),
                    })],
                }
            }

            // ── 2. Commands from application ────────────────────
            Some(cmd) = cmd_rx.recv() => {
                match cmd {
                    RuntimeCommand::GetConnectedPeers { reply } => {
                        let peers = transport.connected_peers().await;
                        let _ = reply.send(peers);
                        Vec::new()
                    }
                    RuntimeCommand::Shutdown => break,
                    other => state.handle_command(other, now_ms()),
                }
            }

            // ── 3. Timer: cache cleanup ──────────────────────────
            _ = cache_cleanup.tick() => state.tick_cache_cleanup(),

            // ── 4. Timer: tracker eviction ───────────────────────
            _ = tracker_cleanup.tick() => state.tick_tracker_cleanup(),

            // ── 5. Timer: heartbeat liveness check ───────────────
            _ = heartbeat_check.tick() => state.tick_heartbeat(now_ms()),

            // ── 6. Timer: group hub heartbeat ────────────────────
            _ = group_hub_heartbeat.tick() => state.tick_group_hub_heartbeat(),

            // ── 7. Timer: backup maintenance ─────────────────────
            _ = backup_tick.tick() => state.tick_backup(now_ms()),

            // ── 8. Timer: presence announce ──────────────────────
            _ = presence_announce.tick() => state.tick_presence_announce(now_ms()),

            // ── 9. Timer: subnet evaluation ───────────────────────
            _ = subnet_eval.tick() => state.tick_subnets(now_ms()),

            // ── 10. Timer: role evaluation ────────────────────────
            _ = role_eval.tick() => state.tick_roles(now_ms()),

            else => break,
        };

        execute_effects(effects, &transport, &msg_tx, &status_tx, &event_tx).await;
    }
}
