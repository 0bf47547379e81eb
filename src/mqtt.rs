use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, LastWill, MqttOptions, QoS};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;
use crate::engine::{ProtocolEngine, StatusNotify};
use crate::protocol::values::{Action, Sweep};
use crate::registry::Status;

const ONLINE: &str = "online";
const OFFLINE: &str = "offline";

/// Message-bus glue: publishes device state and availability, feeds
/// inbound `{base}/climate/{room}/{field}` commands into the engine.
pub struct MqttBridge {
    client: AsyncClient,
    base_topic: String,
}

impl MqttBridge {
    /// Build the client with a retained last-will so the broker flips
    /// the service offline if the process dies.
    pub fn connect(config: &MqttConfig) -> (Arc<MqttBridge>, EventLoop) {
        let mut options = MqttOptions::new(&config.client_id, &config.server, config.port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_last_will(LastWill::new(
            format!("{}/availability", config.base_topic),
            OFFLINE,
            QoS::AtLeastOnce,
            true,
        ));
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(options, 16);
        let bridge = Arc::new(MqttBridge {
            client,
            base_topic: config.base_topic.clone(),
        });
        (bridge, eventloop)
    }

    /// Drive the broker connection forever, dispatching inbound
    /// commands to the engine. rumqttc reconnects on the next poll
    /// after an error, so this only needs to pace the retries.
    pub async fn run_event_loop(&self, mut eventloop: EventLoop, engine: Arc<ProtocolEngine>) {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("connected to the MQTT broker");
                    self.publish_retained(format!("{}/availability", self.base_topic), ONLINE)
                        .await;
                    let filter = format!("{}/climate/+/+", self.base_topic);
                    if let Err(err) = self.client.subscribe(&filter, QoS::AtMostOnce).await {
                        error!("subscribe to {} failed: {}", filter, err);
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    let Some((room, field)) =
                        split_command_topic(&publish.topic, &self.base_topic)
                    else {
                        debug!("ignoring message on {}", publish.topic);
                        continue;
                    };
                    let payload = String::from_utf8_lossy(&publish.payload).to_string();
                    debug!("inbound command {}/{} = {}", room, field, payload);
                    if let Err(err) = engine.handle_external_command(&room, &field, &payload).await
                    {
                        warn!("rejected command on {}: {}", publish.topic, err);
                    }
                }
                Ok(event) => {
                    debug!("mqtt event: {:?}", event);
                }
                Err(err) => {
                    error!("mqtt connection error: {}", err);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn publish_retained(&self, topic: String, payload: &str) {
        if let Err(err) = self
            .client
            .publish(&topic, QoS::AtLeastOnce, true, payload)
            .await
        {
            error!("publish to {} failed: {}", topic, err);
        }
    }
}

#[async_trait]
impl StatusNotify for MqttBridge {
    async fn state_changed(&self, room: &str, status: &Status) {
        let topic = format!("{}/climate/{}/state", self.base_topic, room_safe(room));
        let payload = state_payload(status).to_string();
        debug!("publishing {} = {}", topic, payload);
        if let Err(err) = self
            .client
            .publish(&topic, QoS::AtMostOnce, false, payload)
            .await
        {
            error!("publish to {} failed: {}", topic, err);
        }
    }

    async fn availability_changed(&self, room: &str, online: bool) {
        let topic = format!("{}/{}/availability", self.base_topic, room_safe(room));
        self.publish_retained(topic, if online { ONLINE } else { OFFLINE })
            .await;
    }
}

/// Topic segments cannot contain spaces.
fn room_safe(room: &str) -> String {
    room.replace(' ', "_")
}

/// Climate entities expect string values throughout; temperatures are
/// rendered with two decimals.
fn state_payload(status: &Status) -> serde_json::Value {
    let mode = match (status.action, status.opmode) {
        (Some(Action::Off) | Some(Action::LockOff), _) => "off".to_string(),
        (_, Some(opmode)) => opmode.to_string(),
        (_, None) => String::new(),
    };
    let swing = if status.sweep == Sweep::Swing {
        "on"
    } else {
        "off"
    };
    let fan = status
        .fan_speed
        .map(|speed| speed.to_string())
        .unwrap_or_default();

    json!({
        "mode": mode,
        "swing_mode": swing,
        "fan_mode": fan,
        "current_temp": format!("{:.2}", status.current_temp),
        "target_temp": status.target_temp.to_string(),
    })
}

/// Extract `(room, field)` from `{base}/climate/{room}/{field}`,
/// skipping our own state publishes echoed back by the wildcard.
fn split_command_topic(topic: &str, base_topic: &str) -> Option<(String, String)> {
    let rest = topic.strip_prefix(base_topic)?.strip_prefix('/')?;
    let mut segments = rest.split('/');
    if segments.next()? != "climate" {
        return None;
    }
    let room = segments.next()?;
    let field = segments.next()?;
    if segments.next().is_some() || field == "state" {
        return None;
    }
    Some((room.to_string(), field.to_string()))
}

#[cfg(test)]
mod tests {
    use crate::protocol::values::{FanSpeed, OpMode};

    use super::*;

    #[test]
    fn state_payload_matches_climate_entity_shape() {
        let status = Status {
            action: Some(Action::On),
            opmode: Some(OpMode::Cool),
            sweep: Sweep::Swing,
            fan_speed: Some(FanSpeed::Auto),
            current_temp: 24.5,
            target_temp: 23,
        };
        assert_eq!(
            state_payload(&status),
            json!({
                "mode": "cool",
                "swing_mode": "on",
                "fan_mode": "auto",
                "current_temp": "24.50",
                "target_temp": "23",
            })
        );
    }

    #[test]
    fn off_and_lockoff_publish_mode_off() {
        let mut status = Status::query();
        status.opmode = Some(OpMode::Heat);

        status.action = Some(Action::Off);
        assert_eq!(state_payload(&status)["mode"], "off");

        status.action = Some(Action::LockOff);
        assert_eq!(state_payload(&status)["mode"], "off");

        status.action = Some(Action::On);
        assert_eq!(state_payload(&status)["mode"], "heat");
    }

    #[test]
    fn command_topics_split_into_room_and_field() {
        assert_eq!(
            split_command_topic("lgaircon/climate/living_room/mode", "lgaircon"),
            Some(("living_room".to_string(), "mode".to_string()))
        );
        assert_eq!(
            split_command_topic("lgaircon/climate/study/target_temp", "lgaircon"),
            Some(("study".to_string(), "target_temp".to_string()))
        );
        // Our own state publishes and foreign topics are ignored.
        assert_eq!(
            split_command_topic("lgaircon/climate/study/state", "lgaircon"),
            None
        );
        assert_eq!(split_command_topic("lgaircon/study/availability", "lgaircon"), None);
        assert_eq!(split_command_topic("other/climate/study/mode", "lgaircon"), None);
    }

    #[test]
    fn room_names_are_sanitized_for_topics() {
        assert_eq!(room_safe("living room"), "living_room");
        assert_eq!(room_safe("study"), "study");
    }
}
