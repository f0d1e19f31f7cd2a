use super::identity::ClientIdentity;
use super::machine::{Action, ClientEvent, ClientMachine, Phase};
use super::transport::{Transport, WsTransport};
use crate::config::{Config, TimingConfig};
use crate::metrics::{self, MetricsCollector};
use crate::protocol::Frame;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Uniform sample from a closed millisecond window.
fn jitter_in(min_ms: u64, max_ms: u64) -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms))
}

/// Connect and run one virtual client to completion.
///
/// Owns the whole client lifetime: the handshake outcome lands in
/// `connect_ok`, everything after that is the machine's business. No retry
/// on any failure; one task models one user session. The wave's stop bound
/// also covers the handshake itself, so a target that accepts TCP but never
/// answers the upgrade cannot pin the wave open.
pub async fn run_virtual_client(
    config: Arc<Config>,
    identity: ClientIdentity,
    metrics: Arc<MetricsCollector>,
    cancel: CancellationToken,
) {
    trace!(client = identity.ordinal, topic = %identity.topic, "starting virtual client");

    let connected = tokio::select! {
        _ = cancel.cancelled() => {
            metrics.record_rate(metrics::CONNECT_OK, false);
            warn!(client = identity.ordinal, "stopped while still in handshake");
            return;
        }
        connected = WsTransport::connect(&config.target) => connected,
    };

    let transport = match connected {
        Ok(transport) => {
            metrics.record_rate(metrics::CONNECT_OK, true);
            transport
        }
        Err(e) => {
            metrics.record_rate(metrics::CONNECT_OK, false);
            warn!(client = identity.ordinal, "handshake failed: {}", e);
            return;
        }
    };

    let ordinal = identity.ordinal;
    let machine = ClientMachine::new(identity, config.subscription.clone(), metrics);
    let phase = drive(transport, machine, &config.timing, &cancel).await;
    trace!(client = ordinal, ?phase, "virtual client finished");
}

/// Drive an open connection through the protocol lifecycle.
///
/// All suspension points funnel into a single event per iteration: an
/// inbound frame, a timer firing, the wave's stop signal, or a transport
/// close/error. The machine decides what each one means; this loop only
/// performs the resulting actions. Returns the terminal phase.
pub async fn drive<T: Transport>(
    mut transport: T,
    mut machine: ClientMachine,
    timing: &TimingConfig,
    cancel: &CancellationToken,
) -> Phase {
    // Jitters are sampled once per connection, not per tick, so each client
    // keeps a stable (but desynchronized) rhythm
    let heartbeat_period = jitter_in(timing.heartbeat_min_ms, timing.heartbeat_max_ms);
    let subscribe_jitter = jitter_in(
        timing.subscribe_jitter_min_ms,
        timing.subscribe_jitter_max_ms,
    );

    // Both bounds run from connect time, regardless of protocol progress
    let connected_at = Instant::now();
    let hold = tokio::time::sleep_until(connected_at + timing.hold());
    tokio::pin!(hold);
    let sub_timeout = tokio::time::sleep_until(connected_at + timing.subscribe_timeout());
    tokio::pin!(sub_timeout);
    let jitter = tokio::time::sleep(Duration::ZERO);
    tokio::pin!(jitter);

    let mut heartbeat = interval_at(connected_at + heartbeat_period, heartbeat_period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut hold_pending = true;
    let mut sub_timeout_pending = true;
    let mut jitter_armed = false;

    // The connection is already open; the join goes out before anything else
    let mut next_event = Some(ClientEvent::TransportOpened);

    loop {
        let event = match next_event.take() {
            Some(event) => event,
            None => tokio::select! {
                // The wave's stop bound forces Closing regardless of state
                _ = cancel.cancelled() => ClientEvent::HoldExpired,
                _ = &mut hold, if hold_pending => {
                    hold_pending = false;
                    ClientEvent::HoldExpired
                }
                _ = &mut sub_timeout, if sub_timeout_pending => {
                    sub_timeout_pending = false;
                    ClientEvent::SubscribeTimeoutFired
                }
                _ = &mut jitter, if jitter_armed => {
                    jitter_armed = false;
                    ClientEvent::SubscribeJitterElapsed
                }
                _ = heartbeat.tick() => ClientEvent::HeartbeatTick,
                inbound = transport.recv() => match inbound {
                    Ok(Some(text)) => match Frame::decode(&text) {
                        Ok(frame) => ClientEvent::FrameReceived(frame),
                        Err(e) => {
                            trace!("dropping malformed frame: {}", e);
                            continue;
                        }
                    },
                    Ok(None) => ClientEvent::TransportClosed,
                    Err(e) => {
                        debug!("transport error: {}", e);
                        ClientEvent::TransportFailed
                    }
                },
            },
        };

        for action in machine.handle(event) {
            match action {
                Action::Send(frame) => {
                    trace!(frame = %frame, "sending");
                    if let Err(e) = transport.send(frame.encode()).await {
                        debug!("send failed: {}", e);
                        machine.handle(ClientEvent::TransportFailed);
                        return machine.phase();
                    }
                }
                Action::ArmSubscribeJitter => {
                    jitter.as_mut().reset(Instant::now() + subscribe_jitter);
                    jitter_armed = true;
                }
                Action::Close => {
                    if let Err(e) = transport.close().await {
                        trace!("close failed: {}", e);
                    }
                    // We initiated the close, so the closed event is
                    // synthesized instead of read back from the socket
                    next_event = Some(ClientEvent::TransportClosed);
                }
            }
        }

        if machine.phase().is_terminal() {
            return machine.phase();
        }
    }
}
