// Background task that owns the live link.
//
// One supervisor runs per session. It drives the link until it is either
// cancelled (graceful disconnect) or lost, and on loss runs the backoff
// loop until a new link is up, the ceiling is passed, or it is cancelled.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use doorlink_api::BrokerLink;
use doorlink_api::mqtt::{Packet, QoS};

use super::{ConnectionState, Inner, LinkCommand};
use crate::command::Command;
use crate::error::CoreError;
use crate::notification::Notification;

/// Why `run_link` returned.
enum LinkExit {
    Cancelled,
    Lost(String),
}

/// Per-link bookkeeping that dies with the link.
#[derive(Default)]
struct LinkState {
    /// QoS 1 publishes still waiting for PUBACK.
    in_flight: HashMap<u16, Command>,
    awaiting_pong: bool,
}

pub(super) async fn supervise(
    inner: Arc<Inner>,
    mut link: BrokerLink,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
    cancel: CancellationToken,
) {
    loop {
        let reason = match run_link(&inner, &mut link, &mut commands, &cancel).await {
            LinkExit::Cancelled => {
                inner.link.store(None);
                if tokio::time::timeout(inner.tuning.connect_timeout, link.close())
                    .await
                    .is_err()
                {
                    warn!("graceful close timed out");
                }
                break;
            }
            LinkExit::Lost(reason) => reason,
        };

        inner.link.store(None);
        drop(link);
        warn!(%reason, "broker link lost");

        while let Ok(LinkCommand::Publish(command)) = commands.try_recv() {
            inner.notify(Notification::Error(format!(
                "{command} dropped: link lost before it was sent"
            )));
        }

        inner.notify(Notification::Disconnected);
        inner.notify(Notification::Error(format!("connection lost: {reason}")));

        match reconnect(&inner, &cancel).await {
            Some(next) => {
                link = next;
                commands = inner.activate();
            }
            None => break,
        }
    }

    debug!("supervisor exiting");
}

async fn run_link(
    inner: &Inner,
    link: &mut BrokerLink,
    commands: &mut mpsc::UnboundedReceiver<LinkCommand>,
    cancel: &CancellationToken,
) -> LinkExit {
    let period = inner.tuning.keepalive_interval;
    let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut state = LinkState::default();

    let exit = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break LinkExit::Cancelled,
            Some(LinkCommand::Publish(command)) = commands.recv() => {
                match link.publish(&inner.command_topic(), command.to_bytes(), QoS::AtLeastOnce).await {
                    Ok(Some(packet_id)) => {
                        state.in_flight.insert(packet_id, command);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        inner.notify(Notification::Error(format!("failed to send {command}: {e}")));
                        break LinkExit::Lost(e.to_string());
                    }
                }
            }
            packet = link.next_packet() => match packet {
                Ok(Some(packet)) => {
                    if let Err(e) = handle_packet(inner, link, packet, &mut state).await {
                        break LinkExit::Lost(e.to_string());
                    }
                }
                Ok(None) => break LinkExit::Lost("broker closed the connection".into()),
                Err(e) => break LinkExit::Lost(e.to_string()),
            },
            _ = keepalive.tick() => {
                if state.awaiting_pong {
                    break LinkExit::Lost("keepalive timed out".into());
                }
                if let Err(e) = link.ping().await {
                    break LinkExit::Lost(e.to_string());
                }
                state.awaiting_pong = true;
            }
        }
    };

    if matches!(exit, LinkExit::Lost(_)) {
        for command in state.in_flight.into_values() {
            inner.notify(Notification::Error(format!(
                "{command} not acknowledged before the link dropped"
            )));
        }
    }

    exit
}

async fn handle_packet(
    inner: &Inner,
    link: &mut BrokerLink,
    packet: Packet,
    state: &mut LinkState,
) -> Result<(), doorlink_api::Error> {
    match packet {
        Packet::Publish(publish) => inner.deliver(link, publish).await?,
        Packet::PubAck(ack) => match state.in_flight.remove(&ack.pkid) {
            Some(command) => debug!(%command, packet_id = ack.pkid, "command acknowledged"),
            None => trace!(packet_id = ack.pkid, "PUBACK for untracked publish"),
        },
        Packet::PingResp => state.awaiting_pong = false,
        other => debug!(?other, "ignoring unexpected packet"),
    }
    Ok(())
}

/// Backoff loop. Returns the new link, or `None` when reconnection is no
/// longer wanted or the attempt ceiling has been passed.
///
/// A failed attempt counts as the next unexpected closure: it is reported
/// and consumes another attempt, whether or not a socket was ever opened.
async fn reconnect(inner: &Inner, cancel: &CancellationToken) -> Option<BrokerLink> {
    loop {
        if cancel.is_cancelled() || !inner.reconnect_wanted.load(Ordering::SeqCst) {
            debug!("reconnect no longer wanted");
            return None;
        }

        let attempt = inner.attempts.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        let max = inner.policy.max_attempts;

        let Some(delay) = inner.policy.delay_for(attempt) else {
            error!(max_attempts = max, "reconnection limit reached, giving up");
            inner.reconnect_wanted.store(false, Ordering::SeqCst);
            inner.set_state(ConnectionState::Stopped);
            inner.notify(Notification::Error(
                CoreError::ReconnectExhausted { attempts: max }.to_string(),
            ));
            return None;
        };

        inner.set_state(ConnectionState::Reconnecting { attempt });
        inner.notify(Notification::Reconnecting {
            attempt,
            max,
            delay,
        });
        info!(
            attempt,
            max_attempts = max,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "waiting before reconnect"
        );

        tokio::select! {
            biased;
            () = cancel.cancelled() => return None,
            () = tokio::time::sleep(delay) => {}
        }

        inner.set_state(ConnectionState::Connecting);
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => return None,
            result = inner.establish() => result,
        };

        match result {
            Ok(link) => return Some(link),
            Err(e) => {
                warn!(error = %e, attempt, "reconnect attempt failed");
                inner.notify(Notification::Error(format!(
                    "reconnect attempt {attempt} failed: {e}"
                )));
            }
        }
    }
}
