use super::identity::ClientIdentity;
use crate::config::SubscriptionConfig;
use crate::metrics::{self, MetricsCollector};
use crate::protocol::{
    Frame, Inbound, SubscribePayload, EVENT_SUBSCRIBE, JOIN_MSG_REF, JOIN_REF, SUBSCRIBE_MSG_REF,
};
use smallvec::SmallVec;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Lifecycle phase of one virtual client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    Joining,
    Subscribing,
    Listening,
    Closing,
    Closed,
    Failed,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Closed | Phase::Failed)
    }

    fn is_open(&self) -> bool {
        matches!(self, Phase::Joining | Phase::Subscribing | Phase::Listening)
    }
}

/// Everything that can happen to a client, from any source: inbound frames,
/// timers, and transport lifecycle. The driver funnels all of them through
/// `ClientMachine::handle` so there is exactly one ordering of effects.
#[derive(Debug)]
pub enum ClientEvent {
    /// Transport reached the open state
    TransportOpened,
    /// A decoded inbound frame
    FrameReceived(Frame),
    /// The randomized join-to-subscribe delay elapsed
    SubscribeJitterElapsed,
    /// The subscribe-ack timeout (fixed duration from connect) fired
    SubscribeTimeoutFired,
    /// The jittered heartbeat interval ticked
    HeartbeatTick,
    /// The connection-hold duration (or a wave's stop bound) expired
    HoldExpired,
    /// Transport reported an orderly close
    TransportClosed,
    /// Transport reported an error
    TransportFailed,
}

/// Side effects the driver must perform after an event is handled.
#[derive(Debug, PartialEq)]
pub enum Action {
    Send(Frame),
    /// Start the one-shot jittered delay that ends in `SubscribeJitterElapsed`
    ArmSubscribeJitter,
    /// Stop heartbeats and close the transport
    Close,
}

pub type Actions = SmallVec<[Action; 2]>;

/// Per-client protocol state machine.
///
/// Pure with respect to I/O: it only consumes events and emits actions, and
/// writes observations into the injected collector. Invariants enforced here:
/// the subscribe frame is sent at most once and only after a successful join
/// reply; the subscribe latency sample is recorded at most once; the timeout
/// observation is recorded exactly once per client.
pub struct ClientMachine {
    identity: ClientIdentity,
    subscription: SubscriptionConfig,
    metrics: Arc<MetricsCollector>,
    phase: Phase,
    subscribe_sent: bool,
    subscribe_sent_at: Option<Instant>,
    /// A subscribe reply (either status) has been observed
    subscribe_replied: bool,
    /// A subscribe_ok observation (true or false) has been recorded
    subscribe_outcome_recorded: bool,
    latency_recorded: bool,
    timeout_recorded: bool,
}

impl ClientMachine {
    pub fn new(
        identity: ClientIdentity,
        subscription: SubscriptionConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            identity,
            subscription,
            metrics,
            phase: Phase::Connecting,
            subscribe_sent: false,
            subscribe_sent_at: None,
            subscribe_replied: false,
            subscribe_outcome_recorded: false,
            latency_recorded: false,
            timeout_recorded: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn subscribe_sent(&self) -> bool {
        self.subscribe_sent
    }

    /// Process one event, mutating state and returning the side effects to
    /// perform. Events arriving in a terminal phase are ignored.
    pub fn handle(&mut self, event: ClientEvent) -> Actions {
        let mut actions = Actions::new();

        if self.phase.is_terminal() {
            return actions;
        }

        match event {
            ClientEvent::TransportOpened => {
                if self.phase == Phase::Connecting {
                    self.phase = Phase::Joining;
                    actions.push(Action::Send(Frame::join(
                        &self.identity.topic,
                        &self.identity.userid,
                    )));
                }
            }

            ClientEvent::FrameReceived(frame) => {
                self.on_frame(&frame, &mut actions);
            }

            ClientEvent::SubscribeJitterElapsed => {
                if self.phase == Phase::Subscribing && !self.subscribe_sent {
                    self.subscribe_sent = true;
                    self.subscribe_sent_at = Some(Instant::now());
                    actions.push(Action::Send(self.subscribe_frame()));
                }
            }

            ClientEvent::SubscribeTimeoutFired => {
                if !self.timeout_recorded {
                    self.timeout_recorded = true;
                    let timed_out = !self.subscribe_replied;
                    self.metrics
                        .record_rate(metrics::SUBSCRIBE_TIMEOUT, timed_out);
                    if timed_out {
                        debug!(
                            client = self.identity.ordinal,
                            "no subscribe reply within timeout"
                        );
                    }
                }
            }

            ClientEvent::HeartbeatTick => {
                if self.phase.is_open() {
                    actions.push(Action::Send(Frame::heartbeat()));
                }
            }

            ClientEvent::HoldExpired => {
                self.phase = Phase::Closing;
                actions.push(Action::Close);
            }

            ClientEvent::TransportClosed => {
                if self.phase == Phase::Closing {
                    self.phase = Phase::Closed;
                } else {
                    self.fail("connection closed unexpectedly");
                }
            }

            ClientEvent::TransportFailed => {
                self.fail("transport error");
            }
        }

        actions
    }

    fn on_frame(&mut self, frame: &Frame, actions: &mut Actions) {
        let inbound = match Inbound::classify(frame, &self.subscription.event) {
            Ok(inbound) => inbound,
            Err(e) => {
                // Malformed frames are dropped, never fatal
                trace!(client = self.identity.ordinal, "ignoring frame: {}", e);
                return;
            }
        };

        match inbound {
            Inbound::Reply { msg_ref, ok } if msg_ref == JOIN_MSG_REF => {
                if self.phase != Phase::Joining {
                    return;
                }
                self.metrics.record_rate(metrics::JOIN_OK, ok);
                if ok {
                    self.phase = Phase::Subscribing;
                    actions.push(Action::ArmSubscribeJitter);
                } else {
                    // Join refusal is fatal to this client; one user session,
                    // no retry
                    warn!(
                        client = self.identity.ordinal,
                        topic = %self.identity.topic,
                        "join refused"
                    );
                    self.phase = Phase::Failed;
                    actions.push(Action::Close);
                }
            }

            Inbound::Reply { msg_ref, ok } if msg_ref == SUBSCRIBE_MSG_REF => {
                if !self.subscribe_sent || self.subscribe_replied {
                    return;
                }
                self.subscribe_replied = true;
                self.subscribe_outcome_recorded = true;
                self.metrics.record_rate(metrics::SUBSCRIBE_OK, ok);
                if ok {
                    if let (Some(sent_at), false) = (self.subscribe_sent_at, self.latency_recorded)
                    {
                        self.latency_recorded = true;
                        self.metrics.record_trend(
                            metrics::SUBSCRIBE_LATENCY_MS,
                            sent_at.elapsed().as_millis() as u64,
                        );
                    }
                } else {
                    debug!(client = self.identity.ordinal, "subscribe refused");
                }
                // A refused subscribe is observational only; the client keeps
                // listening either way
                self.phase = Phase::Listening;
            }

            Inbound::Reply { .. } => {}

            Inbound::Broadcast { sent_at } => {
                self.metrics.record_rate(metrics::BROADCAST_RECEIVED, true);
                if let Some(sent_at) = sent_at {
                    let now = chrono::Utc::now().timestamp_millis();
                    if now >= sent_at {
                        self.metrics
                            .record_trend(metrics::BROADCAST_LATENCY_MS, (now - sent_at) as u64);
                    }
                }
            }

            Inbound::Other => {}
        }
    }

    fn subscribe_frame(&self) -> Frame {
        let payload = SubscribePayload::new(
            &self.identity.userid,
            &self.subscription.table,
            &self.subscription.table_field,
            &self.identity.field_value,
            self.subscription.equality,
            &self.subscription.order_by,
            self.subscription.limit,
            &self.subscription.event,
            &self.subscription.pk,
        );
        Frame::new(
            Some(JOIN_REF),
            SUBSCRIBE_MSG_REF,
            &self.identity.topic,
            EVENT_SUBSCRIBE,
            payload.into_map(),
        )
    }

    /// One user session contributes at most one subscribe outcome, so a
    /// mid-session failure only records `false` if no reply did already.
    fn fail(&mut self, reason: &str) {
        debug!(client = self.identity.ordinal, "client failed: {}", reason);
        if !self.subscribe_outcome_recorded {
            self.subscribe_outcome_recorded = true;
            self.metrics.record_rate(metrics::SUBSCRIBE_OK, false);
        }
        self.phase = Phase::Failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TopicConfig;
    use serde_json::{json, Map, Value};

    fn machine() -> (ClientMachine, Arc<MetricsCollector>) {
        let metrics = Arc::new(MetricsCollector::new());
        let identity =
            ClientIdentity::derive(1, &TopicConfig::default(), &SubscriptionConfig::default());
        let machine = ClientMachine::new(identity, SubscriptionConfig::default(), metrics.clone());
        (machine, metrics)
    }

    fn reply(msg_ref: &str, status: &str) -> ClientEvent {
        let mut payload = Map::new();
        payload.insert("status".to_string(), Value::String(status.to_string()));
        ClientEvent::FrameReceived(Frame::new(
            Some("1"),
            msg_ref,
            "user:100001",
            "phx_reply",
            payload,
        ))
    }

    fn open_and_join(machine: &mut ClientMachine) {
        let actions = machine.handle(ClientEvent::TransportOpened);
        assert!(matches!(actions.as_slice(), [Action::Send(f)] if f.event == "phx_join"));
        let actions = machine.handle(reply("1", "ok"));
        assert_eq!(actions.as_slice(), [Action::ArmSubscribeJitter]);
        assert_eq!(machine.phase(), Phase::Subscribing);
    }

    #[test]
    fn test_join_sent_on_open_with_userid() {
        let (mut machine, _) = machine();
        let actions = machine.handle(ClientEvent::TransportOpened);
        match actions.as_slice() {
            [Action::Send(frame)] => {
                assert_eq!(frame.event, "phx_join");
                assert_eq!(frame.join_ref.as_deref(), Some("1"));
                assert_eq!(frame.msg_ref, "1");
                assert_eq!(frame.topic, "user:100001");
                assert_eq!(frame.payload.get("userid"), Some(&json!("100001")));
            }
            other => panic!("unexpected actions: {:?}", other),
        }
        assert_eq!(machine.phase(), Phase::Joining);
    }

    #[test]
    fn test_subscribe_only_after_join_and_jitter() {
        let (mut machine, _) = machine();

        // Jitter firing before join ok must not send anything
        machine.handle(ClientEvent::TransportOpened);
        let actions = machine.handle(ClientEvent::SubscribeJitterElapsed);
        assert!(actions.is_empty());
        assert!(!machine.subscribe_sent());

        let actions = machine.handle(reply("1", "ok"));
        assert_eq!(actions.as_slice(), [Action::ArmSubscribeJitter]);

        let actions = machine.handle(ClientEvent::SubscribeJitterElapsed);
        match actions.as_slice() {
            [Action::Send(frame)] => {
                assert_eq!(frame.event, "subscribe");
                assert_eq!(frame.msg_ref, "2");
                assert_eq!(
                    frame.payload.get("query"),
                    Some(&json!(
                        "select * from posts where (userid = 57) order by updated_at desc limit 5"
                    ))
                );
            }
            other => panic!("unexpected actions: {:?}", other),
        }

        // Subscribe is sent at most once
        let actions = machine.handle(ClientEvent::SubscribeJitterElapsed);
        assert!(actions.is_empty());
    }

    #[test]
    fn test_join_failure_is_fatal() {
        let (mut machine, metrics) = machine();
        machine.handle(ClientEvent::TransportOpened);
        let actions = machine.handle(reply("1", "error"));
        assert_eq!(actions.as_slice(), [Action::Close]);
        assert_eq!(machine.phase(), Phase::Failed);

        let join = metrics.rate(metrics::JOIN_OK).unwrap();
        assert_eq!((join.hits, join.total), (0, 1));
        // Further events are ignored in the terminal phase
        assert!(machine.handle(ClientEvent::HeartbeatTick).is_empty());
    }

    #[test]
    fn test_subscribe_success_records_latency_once() {
        let (mut machine, metrics) = machine();
        open_and_join(&mut machine);
        machine.handle(ClientEvent::SubscribeJitterElapsed);

        machine.handle(reply("2", "ok"));
        assert_eq!(machine.phase(), Phase::Listening);

        let ok = metrics.rate(metrics::SUBSCRIBE_OK).unwrap();
        assert_eq!((ok.hits, ok.total), (1, 1));
        assert_eq!(
            metrics.trend(metrics::SUBSCRIBE_LATENCY_MS).unwrap().count(),
            1
        );

        // A duplicate reply must not double-record
        machine.handle(reply("2", "ok"));
        assert_eq!(metrics.rate(metrics::SUBSCRIBE_OK).unwrap().total, 1);
        assert_eq!(
            metrics.trend(metrics::SUBSCRIBE_LATENCY_MS).unwrap().count(),
            1
        );
    }

    #[test]
    fn test_subscribe_failure_is_not_fatal() {
        // Scenario C: refused subscribe records one failure, zero latency
        // samples, and the client keeps listening
        let (mut machine, metrics) = machine();
        open_and_join(&mut machine);
        machine.handle(ClientEvent::SubscribeJitterElapsed);

        machine.handle(reply("2", "error"));
        assert_eq!(machine.phase(), Phase::Listening);

        let ok = metrics.rate(metrics::SUBSCRIBE_OK).unwrap();
        assert_eq!((ok.hits, ok.total), (0, 1));
        assert!(metrics.trend(metrics::SUBSCRIBE_LATENCY_MS).is_none());

        // Heartbeats keep flowing
        let actions = machine.handle(ClientEvent::HeartbeatTick);
        assert!(matches!(actions.as_slice(), [Action::Send(f)] if f.event == "heartbeat"));
    }

    #[test]
    fn test_timeout_without_reply_then_late_success() {
        // Scenario B half: the timeout fires before any reply
        let (mut machine, metrics) = machine();
        open_and_join(&mut machine);
        machine.handle(ClientEvent::SubscribeJitterElapsed);

        machine.handle(ClientEvent::SubscribeTimeoutFired);
        let timeout = metrics.rate(metrics::SUBSCRIBE_TIMEOUT).unwrap();
        assert_eq!((timeout.hits, timeout.total), (1, 1));

        // The timeout is observational; a late reply still records success
        machine.handle(reply("2", "ok"));
        let ok = metrics.rate(metrics::SUBSCRIBE_OK).unwrap();
        assert_eq!((ok.hits, ok.total), (1, 1));
        // And the timeout observation is never revised
        assert_eq!(metrics.rate(metrics::SUBSCRIBE_TIMEOUT).unwrap().total, 1);
    }

    #[test]
    fn test_timeout_after_reply_records_false() {
        let (mut machine, metrics) = machine();
        open_and_join(&mut machine);
        machine.handle(ClientEvent::SubscribeJitterElapsed);
        machine.handle(reply("2", "ok"));

        machine.handle(ClientEvent::SubscribeTimeoutFired);
        let timeout = metrics.rate(metrics::SUBSCRIBE_TIMEOUT).unwrap();
        assert_eq!((timeout.hits, timeout.total), (0, 1));
    }

    #[test]
    fn test_join_never_completes_no_subscribe_sent() {
        // Scenario B: join reply never arrives; the same timeout catches it
        let (mut machine, metrics) = machine();
        machine.handle(ClientEvent::TransportOpened);

        machine.handle(ClientEvent::SubscribeTimeoutFired);
        let timeout = metrics.rate(metrics::SUBSCRIBE_TIMEOUT).unwrap();
        assert_eq!((timeout.hits, timeout.total), (1, 1));
        assert!(!machine.subscribe_sent());
    }

    #[test]
    fn test_broadcast_latency_from_origin_timestamp() {
        // Scenario A: one domain event 120ms in the past yields one sample
        let (mut machine, metrics) = machine();
        open_and_join(&mut machine);
        machine.handle(ClientEvent::SubscribeJitterElapsed);
        machine.handle(reply("2", "ok"));

        let mut payload = Map::new();
        payload.insert(
            "sent_at".to_string(),
            json!(chrono::Utc::now().timestamp_millis() - 120),
        );
        machine.handle(ClientEvent::FrameReceived(Frame::new(
            None,
            "0",
            "user:100001",
            "posts",
            payload,
        )));

        let latency = metrics.trend(metrics::BROADCAST_LATENCY_MS).unwrap();
        assert_eq!(latency.count(), 1);
        let sample = latency.percentile(100.0).unwrap();
        assert!(
            (115.0..=200.0).contains(&sample),
            "broadcast latency was {}",
            sample
        );

        let received = metrics.rate(metrics::BROADCAST_RECEIVED).unwrap();
        assert_eq!(received.total, 1);
    }

    #[test]
    fn test_broadcast_without_timestamp_records_no_latency() {
        let (mut machine, metrics) = machine();
        open_and_join(&mut machine);
        machine.handle(ClientEvent::FrameReceived(Frame::new(
            None,
            "0",
            "user:100001",
            "posts",
            Map::new(),
        )));

        assert_eq!(metrics.rate(metrics::BROADCAST_RECEIVED).unwrap().total, 1);
        assert!(metrics.trend(metrics::BROADCAST_LATENCY_MS).is_none());
    }

    #[test]
    fn test_hold_expiry_closes() {
        let (mut machine, _) = machine();
        open_and_join(&mut machine);

        let actions = machine.handle(ClientEvent::HoldExpired);
        assert_eq!(actions.as_slice(), [Action::Close]);
        assert_eq!(machine.phase(), Phase::Closing);

        // No heartbeats after closing starts
        assert!(machine.handle(ClientEvent::HeartbeatTick).is_empty());

        machine.handle(ClientEvent::TransportClosed);
        assert_eq!(machine.phase(), Phase::Closed);
    }

    #[test]
    fn test_transport_error_records_failure_once() {
        let (mut machine, metrics) = machine();
        open_and_join(&mut machine);
        machine.handle(ClientEvent::SubscribeJitterElapsed);

        machine.handle(ClientEvent::TransportFailed);
        assert_eq!(machine.phase(), Phase::Failed);
        let ok = metrics.rate(metrics::SUBSCRIBE_OK).unwrap();
        assert_eq!((ok.hits, ok.total), (0, 1));
    }

    #[test]
    fn test_transport_error_after_ack_does_not_double_count() {
        let (mut machine, metrics) = machine();
        open_and_join(&mut machine);
        machine.handle(ClientEvent::SubscribeJitterElapsed);
        machine.handle(reply("2", "ok"));

        machine.handle(ClientEvent::TransportFailed);
        assert_eq!(machine.phase(), Phase::Failed);
        let ok = metrics.rate(metrics::SUBSCRIBE_OK).unwrap();
        assert_eq!((ok.hits, ok.total), (1, 1));
    }

    #[test]
    fn test_unexpected_close_is_failure() {
        let (mut machine, metrics) = machine();
        open_and_join(&mut machine);

        machine.handle(ClientEvent::TransportClosed);
        assert_eq!(machine.phase(), Phase::Failed);
        assert_eq!(metrics.rate(metrics::SUBSCRIBE_OK).unwrap().total, 1);
    }

    #[test]
    fn test_malformed_reply_is_ignored() {
        let (mut machine, _) = machine();
        machine.handle(ClientEvent::TransportOpened);

        // phx_reply without a status field: dropped, client unaffected
        let actions = machine.handle(ClientEvent::FrameReceived(Frame::new(
            Some("1"),
            "1",
            "user:100001",
            "phx_reply",
            Map::new(),
        )));
        assert!(actions.is_empty());
        assert_eq!(machine.phase(), Phase::Joining);
    }
}
