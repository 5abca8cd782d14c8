//! MQTT strike feed backed by `rumqttc`.

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{FeedError, FeedEvent, Result, StrikeFeed};
use crate::config::StrikeConfig;

const DEFAULT_MQTT_PORT: u16 = 1883;

/// Capacity of rumqttc's outgoing request queue.
const REQUEST_CAPACITY: usize = 64;

/// Split a `mqtt://host:port` or `tcp://host:port` URL into host and port.
pub fn parse_broker_url(url: &str) -> Result<(String, u16)> {
    let trimmed = url.trim();
    let rest = match trimmed.split_once("://") {
        Some(("mqtt" | "tcp", rest)) => rest,
        Some((scheme, _)) => {
            return Err(FeedError::InvalidEndpoint(format!(
                "unsupported scheme '{}' in {}",
                scheme, url
            )))
        }
        None => trimmed,
    };

    let authority = rest.split('/').next().unwrap_or_default();
    if authority.is_empty() {
        return Err(FeedError::InvalidEndpoint(format!("missing host in {}", url)));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| FeedError::InvalidEndpoint(format!("bad port in {}", url)))?;
            if host.is_empty() {
                return Err(FeedError::InvalidEndpoint(format!("missing host in {}", url)));
            }
            Ok((host.to_string(), port))
        }
        None => Ok((authority.to_string(), DEFAULT_MQTT_PORT)),
    }
}

/// Unique client id: `<prefix>-<hostname>-<8 hex chars>`.
fn client_id(prefix: &str) -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", prefix, host, &suffix[..8])
}

struct Session {
    client: AsyncClient,
    pump: JoinHandle<()>,
}

pub struct MqttFeed {
    host: String,
    port: u16,
    client_id_prefix: String,
    keep_alive: Duration,
    connect_timeout: Duration,
    session: Mutex<Option<Session>>,
}

impl MqttFeed {
    pub fn new(config: &StrikeConfig) -> Result<Self> {
        let (host, port) = parse_broker_url(&config.broker_url)?;
        Ok(Self {
            host,
            port,
            client_id_prefix: config.client_id_prefix.clone(),
            keep_alive: config.keep_alive(),
            connect_timeout: config.connect_timeout(),
            session: Mutex::new(None),
        })
    }

    fn client(&self) -> Result<AsyncClient> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|s| s.client.clone())
            .ok_or(FeedError::NotConnected)
    }

    /// Drive the event loop until the broker acknowledges the connection.
    async fn await_connack(eventloop: &mut EventLoop) -> Result<()> {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    return match ack.code {
                        ConnectReturnCode::Success => Ok(()),
                        code => Err(FeedError::Connect(format!("broker refused: {:?}", code))),
                    };
                }
                Ok(_) => continue,
                Err(e) => return Err(FeedError::Connect(e.to_string())),
            }
        }
    }

    /// Forward publishes to the service until the connection drops.
    async fn pump(mut eventloop: EventLoop, events: mpsc::Sender<FeedEvent>) {
        loop {
            let reason = match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let event = FeedEvent::Message {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    };
                    if events.send(event).await.is_err() {
                        log::debug!("Strike receiver dropped, stopping MQTT pump");
                        return;
                    }
                    continue;
                }
                Ok(Event::Incoming(Packet::Disconnect)) => "broker sent disconnect".to_string(),
                Ok(_) => continue,
                Err(e) => e.to_string(),
            };

            log::warn!("MQTT connection lost: {}", reason);
            let _ = events.send(FeedEvent::Closed { reason }).await;
            return;
        }
    }
}

#[async_trait]
impl StrikeFeed for MqttFeed {
    async fn connect(&self, events: mpsc::Sender<FeedEvent>) -> Result<()> {
        let id = client_id(&self.client_id_prefix);
        log::info!(
            "Connecting to MQTT broker at {}:{} as {}",
            self.host,
            self.port,
            id
        );

        let mut options = MqttOptions::new(id, self.host.clone(), self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        tokio::time::timeout(self.connect_timeout, Self::await_connack(&mut eventloop))
            .await
            .map_err(|_| FeedError::Timeout(self.connect_timeout))??;

        let pump = tokio::spawn(Self::pump(eventloop, events));

        let previous = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Session { client, pump });
        if let Some(old) = previous {
            old.pump.abort();
        }

        log::info!("Connected to MQTT broker at {}:{}", self.host, self.port);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        self.client()?
            .subscribe(topic, QoS::AtMostOnce)
            .await
            .map_err(|e| FeedError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.client()?
            .unsubscribe(topic)
            .await
            .map_err(|e| FeedError::Unsubscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn disconnect(&self) -> Result<()> {
        let session = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(session) = session {
            if let Err(e) = session.client.disconnect().await {
                log::debug!("MQTT disconnect request failed: {}", e);
            }
            session.pump.abort();
            log::info!("Disconnected from MQTT broker");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_broker_urls() {
        assert_eq!(
            parse_broker_url("mqtt://blitzortung.ha.sed.pl:1883").unwrap(),
            ("blitzortung.ha.sed.pl".to_string(), 1883)
        );
        assert_eq!(
            parse_broker_url("tcp://127.0.0.1:11883/").unwrap(),
            ("127.0.0.1".to_string(), 11883)
        );
        assert_eq!(
            parse_broker_url("localhost").unwrap(),
            ("localhost".to_string(), DEFAULT_MQTT_PORT)
        );
    }

    #[test]
    fn rejects_bad_broker_urls() {
        for url in ["wss://host:443", "mqtt://", "mqtt://host:notaport", "mqtt://:1883"] {
            assert!(
                matches!(parse_broker_url(url), Err(FeedError::InvalidEndpoint(_))),
                "{url} should be rejected"
            );
        }
    }

    #[test]
    fn client_ids_are_unique() {
        let a = client_id("strikewatch");
        let b = client_id("strikewatch");
        assert!(a.starts_with("strikewatch-"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn calls_before_connect_fail_cleanly() {
        let feed = MqttFeed::new(&StrikeConfig::default()).unwrap();
        assert!(matches!(feed.subscribe("a/#").await, Err(FeedError::NotConnected)));
        assert!(feed.disconnect().await.is_ok());
    }
}
