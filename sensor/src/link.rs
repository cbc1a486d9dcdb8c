use std::time::Duration;

use log::{debug, info, warn};
use rand::Rng;

use telemetry_common::{
    relay::RelayPhase, ConnectionState, OutboundEnvelope, RelayEvent, RelaySession,
};

use crate::node::{Board, ControlOutcome, Node};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

impl OutboundMessage {
    pub fn new(topic: &str, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.to_string(),
            payload: payload.into(),
            retain: false,
        }
    }

    pub fn retained(topic: &str, payload: impl Into<String>) -> Self {
        Self {
            retain: true,
            ..Self::new(topic, payload)
        }
    }
}

/// Outbound half of a broker session.
pub trait Link {
    fn publish(&mut self, message: &OutboundMessage) -> anyhow::Result<()>;
}

/// What the caller should do with the socket after a relay frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Continue,
    Close,
    Restart(Duration),
}

/// Relay session plus an outbox of encoded frames waiting for the socket.
pub struct RelayLink<R> {
    session: RelaySession<R>,
    outbox: Vec<String>,
    opened_ms: Option<u64>,
}

impl<R: Rng> RelayLink<R> {
    pub fn new(session: RelaySession<R>) -> Self {
        Self {
            session,
            outbox: Vec::new(),
            opened_ms: None,
        }
    }

    /// Encoded `connect` frame for a socket opened at `now_ms`.
    pub fn open(&mut self, now_ms: u64) -> anyhow::Result<String> {
        self.outbox.clear();
        self.opened_ms = Some(now_ms);
        let connect = self.session.open();
        Ok(connect.encode()?)
    }

    pub fn reset(&mut self) {
        self.session.reset();
        self.outbox.clear();
        self.opened_ms = None;
    }

    /// Asks for a close when the relay left `connect` unanswered for `timeout`.
    pub fn check_handshake(&self, now_ms: u64, timeout: Duration) -> FrameOutcome {
        let awaiting = self.session.phase() == RelayPhase::AwaitingConnack;
        match self.opened_ms {
            Some(opened)
                if awaiting && now_ms.saturating_sub(opened) >= timeout.as_millis() as u64 =>
            {
                warn!(
                    "no connack within {} ms; dropping relay socket",
                    timeout.as_millis()
                );
                FrameOutcome::Close
            }
            _ => FrameOutcome::Continue,
        }
    }

    pub fn drain(&mut self) -> Vec<String> {
        std::mem::take(&mut self.outbox)
    }

    pub fn poll_keep_alive(&mut self, now_ms: u64) {
        if let Some(ping) = self.session.poll_keep_alive(now_ms) {
            self.enqueue(&ping);
        }
    }

    pub fn on_frame<B: Board>(&mut self, frame: &str, node: &mut Node, board: &mut B) -> FrameOutcome {
        let event = match self.session.handle_frame(frame) {
            Ok(event) => event,
            Err(err) => {
                warn!("discarding relay frame: {err}");
                return FrameOutcome::Continue;
            }
        };

        match event {
            RelayEvent::Established {
                client_id,
                outbound,
            } => {
                info!("relay session established as `{client_id}`");
                for envelope in &outbound {
                    self.enqueue(envelope);
                }
                node.transition(ConnectionState::SessionEstablished);
                FrameOutcome::Continue
            }
            RelayEvent::Rejected { return_code } => {
                warn!("relay refused session (return code {return_code})");
                FrameOutcome::Close
            }
            RelayEvent::Message { topic, payload } => {
                if !node.topics().is_control_topic(&topic) {
                    debug!("ignoring relay message on `{topic}`");
                    return FrameOutcome::Continue;
                }
                let now_ms = board.uptime_ms();
                self.control(node, &payload, now_ms, board)
            }
            RelayEvent::Command(raw) => {
                let now_ms = board.uptime_ms();
                self.control(node, &raw, now_ms, board)
            }
            RelayEvent::Acknowledged { kind, message_id } => {
                debug!("relay {kind} for message {message_id:?}");
                FrameOutcome::Continue
            }
            RelayEvent::KeepAliveAnswered => {
                debug!("relay keep-alive answered");
                FrameOutcome::Continue
            }
            RelayEvent::Unexpected(kind) => {
                warn!(
                    "unexpected `{kind}` envelope while {:?}",
                    self.session.phase()
                );
                FrameOutcome::Continue
            }
            RelayEvent::Unrecognized(kind) => {
                warn!("unrecognized relay envelope type `{kind}`");
                FrameOutcome::Continue
            }
        }
    }

    fn control<B: Board>(
        &mut self,
        node: &mut Node,
        payload: &str,
        now_ms: u64,
        board: &mut B,
    ) -> FrameOutcome {
        match node.handle_control(payload, now_ms, board, self) {
            ControlOutcome::Restart(delay) => FrameOutcome::Restart(delay),
            _ => FrameOutcome::Continue,
        }
    }

    fn enqueue(&mut self, envelope: &OutboundEnvelope) {
        match envelope.encode() {
            Ok(frame) => {
                debug!("relay -> {frame}");
                self.outbox.push(frame);
            }
            Err(err) => warn!("failed to encode {} envelope: {err}", envelope.kind()),
        }
    }
}

impl<R: Rng> Link for RelayLink<R> {
    fn publish(&mut self, message: &OutboundMessage) -> anyhow::Result<()> {
        let envelope = self
            .session
            .publish(
                &message.topic,
                &message.payload,
                telemetry_common::relay::QOS_AT_LEAST_ONCE,
                message.retain,
            )
            .ok_or_else(|| anyhow::anyhow!("relay session not established"))?;
        self.enqueue(&envelope);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rand::{rngs::StdRng, SeedableRng};
    use telemetry_common::{DeviceId, RuntimeConfig};

    use super::*;
    use crate::node::tests::FakeBoard;

    fn fixture() -> (Node, RelayLink<StdRng>, FakeBoard) {
        let config = RuntimeConfig::default();
        let mut node = Node::new(DeviceId::from_mac([0, 0, 0, 0, 0, 9]), &config);
        node.transition(ConnectionState::WifiOnly);
        node.transition(ConnectionState::TransportOpen);

        let subscriptions = node
            .topics()
            .control_topics()
            .into_iter()
            .map(str::to_string)
            .collect();
        let session = RelaySession::new(
            node.id().as_str(),
            subscriptions,
            node.topics().status(),
            60,
            StdRng::seed_from_u64(1),
        );
        (node, RelayLink::new(session), FakeBoard::steady(22.0, 45.0))
    }

    fn frame_kind(frame: &str) -> String {
        let value: serde_json::Value = serde_json::from_str(frame).unwrap();
        value["type"].as_str().unwrap().to_string()
    }

    #[test]
    fn handshake_queues_subscribes_before_publish() {
        let (mut node, mut link, mut board) = fixture();

        let connect = link.open(0).unwrap();
        assert_eq!(frame_kind(&connect), "connect");

        let outcome = link.on_frame(
            r#"{"type":"connack","clientId":"relay-9","returnCode":0}"#,
            &mut node,
            &mut board,
        );
        assert_eq!(outcome, FrameOutcome::Continue);
        assert!(node.connectivity().is_established());

        let kinds: Vec<_> = link.drain().iter().map(|f| frame_kind(f)).collect();
        assert_eq!(kinds, vec!["subscribe", "subscribe", "publish"]);
    }

    #[test]
    fn rejected_handshake_asks_to_close() {
        let (mut node, mut link, mut board) = fixture();
        link.open(0).unwrap();

        let outcome = link.on_frame(
            r#"{"type":"connack","returnCode":4}"#,
            &mut node,
            &mut board,
        );
        assert_eq!(outcome, FrameOutcome::Close);
        assert!(!node.connectivity().is_established());
    }

    #[test]
    fn malformed_frame_leaves_state_alone() {
        let (mut node, mut link, mut board) = fixture();
        link.open(0).unwrap();
        let before = node.connectivity().state();

        let outcome = link.on_frame("{{{", &mut node, &mut board);

        assert_eq!(outcome, FrameOutcome::Continue);
        assert_eq!(node.connectivity().state(), before);
        assert!(link.drain().is_empty());
    }

    #[test]
    fn restart_command_is_surfaced_after_status() {
        let (mut node, mut link, mut board) = fixture();
        link.open(0).unwrap();
        link.on_frame(r#"{"type":"connack","returnCode":0}"#, &mut node, &mut board);
        link.drain();

        let outcome = link.on_frame(
            r#"{"type":"publish","topic":"control/all","payload":{"command":"restart"}}"#,
            &mut node,
            &mut board,
        );

        assert!(matches!(outcome, FrameOutcome::Restart(_)));
        let frames = link.drain();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains("restarting"));
    }

    #[test]
    fn publish_before_session_is_an_error() {
        let (_node, mut link, _board) = fixture();
        link.open(0).unwrap();

        let result = link.publish(&OutboundMessage::new("sensors/x", "{}"));
        assert!(result.is_err());
    }

    #[test]
    fn unanswered_connect_times_out() {
        let (mut node, mut link, mut board) = fixture();
        let timeout = Duration::from_millis(500);

        assert_eq!(link.check_handshake(10_000, timeout), FrameOutcome::Continue);

        link.open(1_000).unwrap();
        assert_eq!(link.check_handshake(1_499, timeout), FrameOutcome::Continue);
        assert_eq!(link.check_handshake(1_500, timeout), FrameOutcome::Close);

        link.on_frame(r#"{"type":"connack","returnCode":0}"#, &mut node, &mut board);
        assert_eq!(link.check_handshake(60_000, timeout), FrameOutcome::Continue);

        link.reset();
        assert_eq!(link.check_handshake(60_000, timeout), FrameOutcome::Continue);
    }
}
