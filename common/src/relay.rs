//! Session logic for the WebSocket relay, independent of any socket.
//!
//! The caller owns the socket: it sends whatever envelopes this type hands
//! back and feeds every received text frame into [`RelaySession::handle_frame`].

use rand::Rng;

use crate::envelope::{EnvelopeError, InboundEnvelope, OutboundEnvelope};
use crate::types::DeviceStatus;

pub const QOS_AT_LEAST_ONCE: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayPhase {
    Closed,
    AwaitingConnack,
    Established,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// Handshake accepted. `outbound` must be sent in order.
    Established {
        client_id: String,
        outbound: Vec<OutboundEnvelope>,
    },
    Rejected {
        return_code: u8,
    },
    Message {
        topic: String,
        payload: String,
    },
    Command(String),
    Acknowledged {
        kind: &'static str,
        message_id: Option<u16>,
    },
    KeepAliveAnswered,
    /// A valid envelope that makes no sense in the current phase.
    Unexpected(&'static str),
    Unrecognized(String),
}

#[derive(Debug)]
pub struct RelaySession<R> {
    device_id: String,
    assigned_id: Option<String>,
    subscriptions: Vec<String>,
    status_topic: String,
    keep_alive_secs: u16,
    phase: RelayPhase,
    last_ping_ms: Option<u64>,
    rng: R,
}

impl<R: Rng> RelaySession<R> {
    pub fn new(
        device_id: impl Into<String>,
        subscriptions: Vec<String>,
        status_topic: impl Into<String>,
        keep_alive_secs: u16,
        rng: R,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            assigned_id: None,
            subscriptions,
            status_topic: status_topic.into(),
            keep_alive_secs,
            phase: RelayPhase::Closed,
            last_ping_ms: None,
            rng,
        }
    }

    pub fn phase(&self) -> RelayPhase {
        self.phase
    }

    pub fn is_established(&self) -> bool {
        self.phase == RelayPhase::Established
    }

    /// Server-assigned id once established, the device id before that.
    pub fn client_id(&self) -> &str {
        self.assigned_id.as_deref().unwrap_or(&self.device_id)
    }

    /// Starts a fresh handshake on a newly opened socket.
    pub fn open(&mut self) -> OutboundEnvelope {
        self.assigned_id = None;
        self.last_ping_ms = None;
        self.phase = RelayPhase::AwaitingConnack;
        OutboundEnvelope::Connect {
            client_id: self.device_id.clone(),
            keep_alive: self.keep_alive_secs,
        }
    }

    /// Drops all session state after the socket went away.
    pub fn reset(&mut self) {
        self.assigned_id = None;
        self.last_ping_ms = None;
        self.phase = RelayPhase::Closed;
    }

    /// Decodes and applies one text frame. Decode errors leave the session
    /// untouched.
    pub fn handle_frame(&mut self, frame: &str) -> Result<RelayEvent, EnvelopeError> {
        let envelope = InboundEnvelope::decode(frame)?;
        Ok(self.handle(envelope))
    }

    pub fn handle(&mut self, envelope: InboundEnvelope) -> RelayEvent {
        match envelope {
            InboundEnvelope::Connack {
                client_id,
                return_code,
            } => self.on_connack(client_id, return_code),
            InboundEnvelope::Suback { message_id } => RelayEvent::Acknowledged {
                kind: "suback",
                message_id,
            },
            InboundEnvelope::Puback { message_id } => RelayEvent::Acknowledged {
                kind: "puback",
                message_id,
            },
            InboundEnvelope::Publish { topic, payload } => {
                if self.is_established() {
                    RelayEvent::Message { topic, payload }
                } else {
                    RelayEvent::Unexpected("publish")
                }
            }
            InboundEnvelope::Command(raw) => {
                if self.is_established() {
                    RelayEvent::Command(raw)
                } else {
                    RelayEvent::Unexpected("command")
                }
            }
            InboundEnvelope::Pingresp => RelayEvent::KeepAliveAnswered,
            InboundEnvelope::Unrecognized(kind) => RelayEvent::Unrecognized(kind),
        }
    }

    fn on_connack(&mut self, client_id: Option<String>, return_code: u8) -> RelayEvent {
        if self.phase != RelayPhase::AwaitingConnack {
            return RelayEvent::Unexpected("connack");
        }

        if return_code != 0 {
            self.phase = RelayPhase::Closed;
            return RelayEvent::Rejected { return_code };
        }

        self.assigned_id = client_id.filter(|id| !id.is_empty());
        self.phase = RelayPhase::Established;

        let mut outbound = Vec::with_capacity(self.subscriptions.len() + 1);
        for topic in self.subscriptions.clone() {
            let message_id = self.next_message_id();
            outbound.push(OutboundEnvelope::Subscribe {
                client_id: self.client_id().to_string(),
                topic,
                qos: QOS_AT_LEAST_ONCE,
                message_id,
            });
        }

        let status_topic = self.status_topic.clone();
        outbound.push(self.envelope_publish(
            &status_topic,
            DeviceStatus::Online.as_str(),
            QOS_AT_LEAST_ONCE,
            true,
        ));

        RelayEvent::Established {
            client_id: self.client_id().to_string(),
            outbound,
        }
    }

    /// Wraps a publish in an envelope; `None` until the session is up.
    pub fn publish(
        &mut self,
        topic: &str,
        payload: &str,
        qos: u8,
        retain: bool,
    ) -> Option<OutboundEnvelope> {
        if !self.is_established() {
            return None;
        }
        Some(self.envelope_publish(topic, payload, qos, retain))
    }

    /// Returns a `pingreq` when one keep-alive period has passed since the last.
    pub fn poll_keep_alive(&mut self, now_ms: u64) -> Option<OutboundEnvelope> {
        if !self.is_established() || self.keep_alive_secs == 0 {
            return None;
        }

        let period_ms = u64::from(self.keep_alive_secs) * 1_000;
        match self.last_ping_ms {
            Some(last) if now_ms.saturating_sub(last) < period_ms => None,
            None => {
                self.last_ping_ms = Some(now_ms);
                None
            }
            Some(_) => {
                self.last_ping_ms = Some(now_ms);
                Some(OutboundEnvelope::Pingreq {
                    client_id: self.client_id().to_string(),
                })
            }
        }
    }

    fn envelope_publish(
        &mut self,
        topic: &str,
        payload: &str,
        qos: u8,
        retain: bool,
    ) -> OutboundEnvelope {
        OutboundEnvelope::Publish {
            client_id: self.client_id().to_string(),
            topic: topic.to_string(),
            payload: payload.to_string(),
            qos,
            retain,
            message_id: self.next_message_id(),
        }
    }

    fn next_message_id(&mut self) -> u16 {
        self.rng.gen_range(1..=u16::MAX)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    fn session() -> RelaySession<StdRng> {
        RelaySession::new(
            "esp32-0a0b0c0d0e0f",
            vec![
                "control/esp32-0a0b0c0d0e0f".to_string(),
                "control/all".to_string(),
            ],
            "status/esp32-0a0b0c0d0e0f",
            60,
            StdRng::seed_from_u64(7),
        )
    }

    #[test]
    fn open_sends_connect_and_waits() {
        let mut session = session();
        let connect = session.open();

        assert_eq!(
            connect,
            OutboundEnvelope::Connect {
                client_id: "esp32-0a0b0c0d0e0f".to_string(),
                keep_alive: 60,
            }
        );
        assert_eq!(session.phase(), RelayPhase::AwaitingConnack);
        assert!(session.publish("t", "p", 1, false).is_none());
    }

    #[test]
    fn accepted_connack_subscribes_twice_then_announces() {
        let mut session = session();
        session.open();

        let event = session
            .handle_frame(r#"{"type":"connack","clientId":"relay-42","returnCode":0}"#)
            .unwrap();

        let (client_id, outbound) = match event {
            RelayEvent::Established {
                client_id,
                outbound,
            } => (client_id, outbound),
            other => panic!("expected established, got {other:?}"),
        };

        assert_eq!(client_id, "relay-42");
        assert_eq!(outbound.len(), 3);
        let kinds: Vec<_> = outbound.iter().map(OutboundEnvelope::kind).collect();
        assert_eq!(kinds, vec!["subscribe", "subscribe", "publish"]);

        match &outbound[0] {
            OutboundEnvelope::Subscribe {
                client_id, topic, ..
            } => {
                assert_eq!(client_id, "relay-42");
                assert_eq!(topic, "control/esp32-0a0b0c0d0e0f");
            }
            other => panic!("unexpected {other:?}"),
        }
        match &outbound[2] {
            OutboundEnvelope::Publish {
                topic,
                payload,
                retain,
                ..
            } => {
                assert_eq!(topic, "status/esp32-0a0b0c0d0e0f");
                assert_eq!(payload, "online");
                assert!(*retain);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(session.is_established());
    }

    #[test]
    fn rejected_connack_closes_session() {
        let mut session = session();
        session.open();

        let event = session
            .handle_frame(r#"{"type":"connack","returnCode":5}"#)
            .unwrap();

        assert_eq!(event, RelayEvent::Rejected { return_code: 5 });
        assert_eq!(session.phase(), RelayPhase::Closed);
    }

    #[test]
    fn malformed_frame_changes_nothing() {
        let mut session = session();
        session.open();

        assert!(session.handle_frame("{\"type\":").is_err());
        assert_eq!(session.phase(), RelayPhase::AwaitingConnack);

        session
            .handle_frame(r#"{"type":"connack","returnCode":0}"#)
            .unwrap();
        assert!(session.handle_frame("garbage").is_err());
        assert!(session.is_established());
        assert_eq!(session.client_id(), "esp32-0a0b0c0d0e0f");
    }

    #[test]
    fn duplicate_connack_is_unexpected() {
        let mut session = session();
        session.open();
        session
            .handle_frame(r#"{"type":"connack","returnCode":0}"#)
            .unwrap();

        let event = session
            .handle_frame(r#"{"type":"connack","returnCode":0}"#)
            .unwrap();
        assert_eq!(event, RelayEvent::Unexpected("connack"));
    }

    #[test]
    fn publish_before_connack_is_not_delivered() {
        let mut session = session();
        session.open();

        let event = session
            .handle_frame(r#"{"type":"publish","topic":"control/all","payload":"{}"}"#)
            .unwrap();
        assert_eq!(event, RelayEvent::Unexpected("publish"));
    }

    #[test]
    fn publishes_carry_message_ids() {
        let mut session = session();
        session.open();
        session
            .handle_frame(r#"{"type":"connack","returnCode":0}"#)
            .unwrap();

        let envelope = session
            .publish("sensors/esp32-0a0b0c0d0e0f", "{}", 0, false)
            .unwrap();
        match envelope {
            OutboundEnvelope::Publish { message_id, .. } => assert!(message_id >= 1),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn keep_alive_fires_once_per_period() {
        let mut session = session();
        session.open();
        session
            .handle_frame(r#"{"type":"connack","returnCode":0}"#)
            .unwrap();

        assert!(session.poll_keep_alive(1_000).is_none());
        assert!(session.poll_keep_alive(60_999).is_none());
        assert!(session.poll_keep_alive(61_000).is_some());
        assert!(session.poll_keep_alive(61_500).is_none());
    }

    #[test]
    fn reset_drops_assigned_id() {
        let mut session = session();
        session.open();
        session
            .handle_frame(r#"{"type":"connack","clientId":"relay-1","returnCode":0}"#)
            .unwrap();
        session.reset();

        assert_eq!(session.phase(), RelayPhase::Closed);
        assert_eq!(session.client_id(), "esp32-0a0b0c0d0e0f");
    }
}
