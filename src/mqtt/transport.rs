// MIT License - Copyright (c) 2026 Peter Wright

//! Thin capability over rumqttc: publish, subscribe, run. Owns the broker
//! session, the LWT, and re-subscription after reconnects.

use std::sync::Mutex as StdMutex;

use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_ERROR_PAUSE: Duration = Duration::from_secs(1);
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

/// Broker connection settings, already validated by the config layer.
#[derive(Debug, Clone)]
pub struct MqttTransportSettings {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub qos: QoS,
    /// Instance availability topic; carries the LWT.
    pub availability_topic: String,
    pub online_payload: String,
    pub offline_payload: String,
}

/// A message to publish. Producers enqueue these; the transport task is
/// the single consumer, which keeps per-entity ordering intact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

/// An inbound MQTT message routed to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttInbound {
    pub topic: String,
    pub payload: String,
}

pub struct MqttTransport {
    client: AsyncClient,
    eventloop: Mutex<EventLoop>,
    publish_rx: Mutex<mpsc::UnboundedReceiver<PublishRequest>>,
    routes: StdMutex<Vec<(String, mpsc::UnboundedSender<MqttInbound>)>>,
    reconnect_listeners: StdMutex<Vec<mpsc::UnboundedSender<()>>>,
    settings: MqttTransportSettings,
}

impl MqttTransport {
    /// Build the transport and the sender half of its publish queue.
    pub fn new(settings: MqttTransportSettings) -> (Self, mpsc::UnboundedSender<PublishRequest>) {
        let mut options =
            MqttOptions::new(settings.client_id.as_str(), settings.host.as_str(), settings.port);
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(username), Some(password)) = (&settings.username, &settings.password) {
            options.set_credentials(username.clone(), password.clone());
        }
        options.set_last_will(LastWill::new(
            settings.availability_topic.as_str(),
            settings.offline_payload.clone(),
            settings.qos,
            true,
        ));

        let (client, eventloop) = AsyncClient::new(options, 256);
        let (publish_tx, publish_rx) = mpsc::unbounded_channel();

        let transport = Self {
            client,
            eventloop: Mutex::new(eventloop),
            publish_rx: Mutex::new(publish_rx),
            routes: StdMutex::new(Vec::new()),
            reconnect_listeners: StdMutex::new(Vec::new()),
            settings,
        };
        (transport, publish_tx)
    }

    /// Route messages matching `filter` (MQTT wildcards allowed) to `tx`.
    /// The subscription itself is established on every (re)connect.
    pub fn subscribe_route(&self, filter: impl Into<String>, tx: mpsc::UnboundedSender<MqttInbound>) {
        self.routes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((filter.into(), tx));
    }

    /// Get a ping on every broker (re)connection, once subscriptions are
    /// re-established. The surface uses this to re-run discovery.
    pub fn notify_reconnect(&self, tx: mpsc::UnboundedSender<()>) {
        self.reconnect_listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(tx);
    }

    /// Drive the broker session until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut eventloop = self.eventloop.lock().await;
        let mut publish_rx = self.publish_rx.lock().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => self.on_connected().await,
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let inbound = MqttInbound {
                            topic: publish.topic.clone(),
                            payload: String::from_utf8_lossy(&publish.payload).into_owned(),
                        };
                        self.route(inbound);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("MQTT connection error: {e}");
                        sleep(POLL_ERROR_PAUSE).await;
                    }
                },
                req = publish_rx.recv() => {
                    if let Some(req) = req {
                        self.publish(req).await;
                    }
                }
            }
        }

        self.shutdown(&mut eventloop).await;
    }

    async fn on_connected(&self) {
        info!("connected to MQTT broker at {}:{}", self.settings.host, self.settings.port);

        if let Err(e) = self
            .client
            .publish(
                self.settings.availability_topic.as_str(),
                self.settings.qos,
                true,
                self.settings.online_payload.clone(),
            )
            .await
        {
            warn!("failed to publish online availability: {e}");
        }

        let filters: Vec<String> = {
            let routes = self.routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            routes.iter().map(|(filter, _)| filter.clone()).collect()
        };
        for filter in filters {
            match self.client.subscribe(filter.as_str(), self.settings.qos).await {
                Ok(()) => debug!("subscribed to {filter}"),
                Err(e) => warn!("failed to subscribe to {filter}: {e}"),
            }
        }

        let listeners = self
            .reconnect_listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for tx in listeners.iter() {
            let _ = tx.send(());
        }
    }

    fn route(&self, inbound: MqttInbound) {
        let routes = self.routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for (filter, tx) in routes.iter() {
            if topic_matches(&inbound.topic, filter) {
                let _ = tx.send(inbound.clone());
            }
        }
    }

    async fn publish(&self, req: PublishRequest) {
        match timeout(
            PUBLISH_TIMEOUT,
            self.client.publish(req.topic.as_str(), self.settings.qos, req.retain, req.payload.clone()),
        )
        .await
        {
            Ok(Ok(())) => debug!("published to {} ({} bytes)", req.topic, req.payload.len()),
            Ok(Err(e)) => warn!("failed to publish to {}: {e}", req.topic),
            Err(_) => warn!("publish to {} timed out", req.topic),
        }
    }

    /// Flip availability to offline and disconnect cleanly.
    async fn shutdown(&self, eventloop: &mut EventLoop) {
        debug!("disconnecting from MQTT broker");
        let _ = self
            .client
            .publish(
                self.settings.availability_topic.as_str(),
                self.settings.qos,
                true,
                self.settings.offline_payload.clone(),
            )
            .await;
        let _ = self.client.disconnect().await;
        // Drive the event loop briefly so the offline publish and the
        // DISCONNECT actually hit the wire.
        let _ = timeout(DISCONNECT_GRACE, async {
            loop {
                if eventloop.poll().await.is_err() {
                    break;
                }
            }
        })
        .await;
    }
}

/// MQTT topic filter matching: `+` matches one level, `#` the rest.
pub fn topic_matches(topic: &str, filter: &str) -> bool {
    let topic_parts: Vec<&str> = topic.split('/').collect();
    let filter_parts: Vec<&str> = filter.split('/').collect();

    if filter_parts.last() == Some(&"#") {
        let prefix = &filter_parts[..filter_parts.len() - 1];
        return topic_parts.len() >= prefix.len()
            && prefix
                .iter()
                .zip(&topic_parts)
                .all(|(f, t)| *f == "+" || f == t);
    }

    topic_parts.len() == filter_parts.len()
        && filter_parts
            .iter()
            .zip(&topic_parts)
            .all(|(f, t)| *f == "+" || f == t)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_topic_match() {
        assert!(topic_matches("homeassistant/status", "homeassistant/status"));
        assert!(!topic_matches("homeassistant/status", "homeassistant/other"));
    }

    #[test]
    fn single_level_wildcard() {
        assert!(topic_matches(
            "homeassistant/alarm_control_panel/qolsys_panel/home/set",
            "homeassistant/alarm_control_panel/qolsys_panel/+/set"
        ));
        assert!(!topic_matches(
            "homeassistant/alarm_control_panel/qolsys_panel/home/state",
            "homeassistant/alarm_control_panel/qolsys_panel/+/set"
        ));
        assert!(!topic_matches(
            "homeassistant/alarm_control_panel/qolsys_panel/a/b/set",
            "homeassistant/alarm_control_panel/qolsys_panel/+/set"
        ));
    }

    #[test]
    fn multi_level_wildcard() {
        assert!(topic_matches("qolsys/panel/event", "qolsys/#"));
        assert!(topic_matches("qolsys/a/b/c", "qolsys/#"));
        assert!(!topic_matches("other/panel/event", "qolsys/#"));
    }

    #[test]
    fn length_mismatch_without_wildcard() {
        assert!(!topic_matches("a/b/c", "a/b"));
        assert!(!topic_matches("a/b", "a/b/c"));
    }
}
