//! MQTT publishing of captured message envelopes.
//!
//! One shared broker connection; envelopes go out with QoS 1 and no
//! retain flag. Delivery is at-least-once at best: publish failures are
//! reported to the caller and never retried here.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, TlsConfiguration, Transport};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::collect::{Msg, Publish};

/// How long to wait for the broker to take a single publish.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);
/// MQTT keepalive interval.
const KEEPALIVE: Duration = Duration::from_secs(30);
/// Connection attempts before giving up at startup.
const CONNECT_ATTEMPTS: usize = 5;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("mqtt publish timed out")]
    Timeout,
    #[error("mqtt client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("mqtt connect failed after {attempts} attempts: {last}")]
    ConnectFailed { attempts: usize, last: String },
    #[error("mqtt connect canceled")]
    Canceled,
    #[error("invalid broker url: {0}")]
    BadBroker(String),
    #[error("loading tls credentials: {0}")]
    Tls(#[from] std::io::Error),
    #[error("encoding envelope: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Options for the MQTT connection, straight from the CLI.
#[derive(Debug, Clone, Default)]
pub struct MqttConfig {
    pub broker: String,
    pub client_id: String,
    pub topic: String,
    pub telemetry_topic: String,
    pub key_file: String,
    pub cert_file: String,
}

/// A connected MQTT publisher. The broker connection is driven by a
/// background task; publishes from any task are serialized internally
/// by the client.
pub struct MqttPublisher {
    client: AsyncClient,
    topic: String,
    telemetry_topic: String,
}

impl MqttPublisher {
    /// Connect to the configured broker. The connect observes
    /// cancellation between attempts and gives up after a bounded number
    /// of failures rather than waiting forever on a silent broker.
    pub async fn connect(
        config: &MqttConfig,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<Self, PublishError> {
        let (host, port, tls) = parse_broker(&config.broker)?;

        let client_id = if config.client_id.is_empty() {
            format!("sipcap-{}", std::process::id())
        } else {
            config.client_id.clone()
        };

        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(KEEPALIVE);
        if tls || (!config.key_file.is_empty() && !config.cert_file.is_empty()) {
            options.set_transport(Transport::Tls(tls_configuration(config)?));
        }

        let (client, mut eventloop) = AsyncClient::new(options, 64);

        let mut failures = 0;
        loop {
            tokio::select! {
                _ = shutdown.changed() => return Err(PublishError::Canceled),
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        debug!("mqtt connection acknowledged");
                        break;
                    }
                    Ok(_) => continue,
                    Err(err) => {
                        failures += 1;
                        if failures >= CONNECT_ATTEMPTS {
                            return Err(PublishError::ConnectFailed {
                                attempts: failures,
                                last: err.to_string(),
                            });
                        }
                        warn!(error = %err, attempt = failures, "mqtt connect attempt failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }

        // Keep the connection alive; the event loop must be polled for
        // publishes to make progress.
        let mut loop_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = loop_shutdown.changed() => return,
                    event = eventloop.poll() => {
                        if let Err(err) = event {
                            warn!(error = %err, "mqtt connection error");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        });

        Ok(MqttPublisher {
            client,
            topic: config.topic.clone(),
            telemetry_topic: config.telemetry_topic.clone(),
        })
    }

    async fn send(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        debug!(topic, bytes = payload.len(), "publishing mqtt message");
        match tokio::time::timeout(
            RESPONSE_TIMEOUT,
            self.client.publish(topic, QoS::AtLeastOnce, false, payload),
        )
        .await
        {
            Err(_) => Err(PublishError::Timeout),
            Ok(result) => Ok(result?),
        }
    }

    /// Publish a telemetry payload, if a telemetry topic is configured.
    pub async fn publish_telemetry(&self, payload: Vec<u8>) -> Result<(), PublishError> {
        if self.telemetry_topic.is_empty() {
            return Ok(());
        }
        self.send(&self.telemetry_topic, payload).await
    }

    /// Disconnect from the broker.
    pub async fn close(&self) {
        let _ = self.client.disconnect().await;
    }
}

#[async_trait]
impl Publish for MqttPublisher {
    async fn publish(&self, msg: &Msg) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(msg).map_err(PublishError::Encode)?;
        self.send(&self.topic, payload).await?;
        Ok(())
    }
}

/// Split a broker URL of the form `scheme://host:port` into its parts.
/// `tcp` and `mqtt` mean plaintext; `ssl`, `tls`, and `mqtts` mean TLS.
fn parse_broker(broker: &str) -> Result<(String, u16, bool), PublishError> {
    let (scheme, rest) = broker
        .split_once("://")
        .ok_or_else(|| PublishError::BadBroker(broker.to_string()))?;
    let tls = match scheme {
        "tcp" | "mqtt" => false,
        "ssl" | "tls" | "mqtts" => true,
        _ => return Err(PublishError::BadBroker(broker.to_string())),
    };
    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| PublishError::BadBroker(broker.to_string()))?;
            (host.to_string(), port)
        }
        None => (rest.to_string(), if tls { 8883 } else { 1883 }),
    };
    if host.is_empty() {
        return Err(PublishError::BadBroker(broker.to_string()));
    }
    Ok((host, port, tls))
}

fn tls_configuration(config: &MqttConfig) -> Result<TlsConfiguration, PublishError> {
    let client_auth = if !config.key_file.is_empty() && !config.cert_file.is_empty() {
        let cert = std::fs::read(&config.cert_file)?;
        let key = std::fs::read(&config.key_file)?;
        Some((cert, key))
    } else {
        None
    };
    Ok(TlsConfiguration::Simple {
        ca: Vec::new(),
        alpn: None,
        client_auth,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_url_parsing() {
        assert_eq!(parse_broker("tcp://localhost:1883").unwrap(), ("localhost".into(), 1883, false));
        assert_eq!(parse_broker("ssl://broker.example:8883").unwrap(), ("broker.example".into(), 8883, true));
        assert_eq!(parse_broker("mqtt://broker").unwrap(), ("broker".into(), 1883, false));
        assert_eq!(parse_broker("mqtts://broker").unwrap(), ("broker".into(), 8883, true));
        assert!(matches!(parse_broker("localhost:1883"), Err(PublishError::BadBroker(_))));
        assert!(matches!(parse_broker("http://x"), Err(PublishError::BadBroker(_))));
        assert!(matches!(parse_broker("tcp://host:notaport"), Err(PublishError::BadBroker(_))));
        assert!(matches!(parse_broker("tcp://"), Err(PublishError::BadBroker(_))));
    }

    #[tokio::test]
    async fn connect_gives_up_after_bounded_attempts() {
        // Nothing listens on this port; the connect must fail after its
        // bounded retries instead of looping forever.
        let config = MqttConfig {
            broker: "tcp://127.0.0.1:1".into(),
            ..MqttConfig::default()
        };
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let result = tokio::time::timeout(
            Duration::from_secs(30),
            MqttPublisher::connect(&config, shutdown_rx),
        )
        .await
        .expect("connect returns before the outer timeout");
        assert!(matches!(
            result,
            Err(PublishError::ConnectFailed { attempts: 5, .. })
        ));
    }

    #[tokio::test]
    async fn connect_observes_cancellation() {
        let config = MqttConfig {
            broker: "tcp://240.0.0.1:1883".into(), // blackholed address
            ..MqttConfig::default()
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let connect = tokio::spawn(async move {
            MqttPublisher::connect(&config, shutdown_rx).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), connect)
            .await
            .expect("connect returns promptly on cancel")
            .unwrap();
        assert!(matches!(result, Err(PublishError::Canceled | PublishError::ConnectFailed { .. })));
    }
}
