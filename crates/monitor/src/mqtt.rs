use std::time::Duration;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::Deserialize;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::connection::{SessionEvents, SessionOptions, Transport, TransportEvent};
use crate::reading::{SoilReading, UNKNOWN_STATE};

/// Capacity of the rumqttc request channel.
const REQUEST_CAPACITY: usize = 20;

/// How long a closed session's event loop may keep running to flush the
/// DISCONNECT packet before it is aborted.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

/// Payload published by the sensor node. Every field is optional on the
/// wire; absent or `null` fields take the defaults in [`decode_reading`].
#[derive(Debug, Deserialize)]
pub(crate) struct SoilPayload {
    pub(crate) raw: Option<i64>,
    pub(crate) percent: Option<i64>,
    pub(crate) state: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("payload is not a soil reading object: {0}")]
    Json(#[from] serde_json::Error),
}

/// Decode a telemetry payload into a reading stamped with `received_at`.
///
/// Defaults: `raw = 0`, `percent = 0`, `state = "unknown"`. Any timestamp
/// carried in the payload is ignored; receipt time is authoritative.
pub fn decode_reading(payload: &[u8], received_at: OffsetDateTime) -> Result<SoilReading, DecodeError> {
    let text = std::str::from_utf8(payload)?;
    let msg: SoilPayload = serde_json::from_str(text)?;
    Ok(SoilReading::new(
        msg.raw.unwrap_or(0),
        msg.percent.unwrap_or(0),
        msg.state.unwrap_or_else(|| UNKNOWN_STATE.to_string()),
        received_at,
    ))
}

// ---------------------------------------------------------------------------
// Topic helpers
// ---------------------------------------------------------------------------

/// True if `topic` contains a `+` or `#` wildcard character.
pub(crate) fn has_wildcard(topic: &str) -> bool {
    topic.contains(['+', '#'])
}

// ---------------------------------------------------------------------------
// rumqttc transport
// ---------------------------------------------------------------------------

/// [`Transport`] backed by a rumqttc client. Each `open` builds a fresh
/// client/event-loop pair and spawns a task that forwards the events of that
/// one session until it ends.
#[derive(Default)]
pub struct MqttTransport {
    client: Option<AsyncClient>,
    poller: Option<JoinHandle<()>>,
}

impl Transport for MqttTransport {
    fn open(&mut self, options: &SessionOptions, events: SessionEvents) -> Result<()> {
        self.close();

        let mut mqttoptions = MqttOptions::new(&options.client_id, &options.host, options.port);
        mqttoptions.set_keep_alive(options.keep_alive);
        mqttoptions.set_clean_session(true);
        if let Some(username) = &options.username {
            mqttoptions.set_credentials(username, options.password.clone().unwrap_or_default());
        }

        let (client, eventloop) = AsyncClient::new(mqttoptions, REQUEST_CAPACITY);
        self.poller = Some(tokio::spawn(forward_session(eventloop, events)));
        self.client = Some(client);
        Ok(())
    }

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<()> {
        let client = self.client.as_ref().context("no open mqtt session")?;
        client
            .try_subscribe(topic, qos)
            .with_context(|| format!("subscribe to {topic} failed"))?;
        Ok(())
    }

    fn close(&mut self) {
        if let Some(client) = self.client.take() {
            if let Err(e) = client.try_disconnect() {
                debug!("mqtt disconnect request not queued: {e}");
            }
        }
        if let Some(poller) = self.poller.take() {
            tokio::spawn(async move {
                tokio::time::sleep(CLOSE_GRACE).await;
                poller.abort();
            });
        }
    }
}

/// Drive one rumqttc event loop, translating packets into session events.
/// Stops at the first connection error: rumqttc would otherwise reconnect on
/// its own, and reconnect pacing belongs to the connection manager.
async fn forward_session(mut eventloop: EventLoop, events: SessionEvents) {
    loop {
        let event = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => TransportEvent::Connected,
            Ok(Event::Incoming(Packet::Publish(p))) => TransportEvent::Message {
                topic: p.topic.clone(),
                payload: p.payload.to_vec(),
            },
            Ok(Event::Incoming(Packet::Disconnect)) => TransportEvent::Disconnected {
                reason: "broker sent DISCONNECT".to_string(),
            },
            Ok(_) => continue,
            Err(e) => TransportEvent::Disconnected {
                reason: e.to_string(),
            },
        };

        let ended = matches!(event, TransportEvent::Disconnected { .. });
        if !events.send(event) || ended {
            break;
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
