//! MQTT transport for [`BusClient`] built on `rumqttc`.
//!
//! `connect` drives the event loop until the broker acknowledges the session,
//! so unreachable brokers, refused credentials and silent brokers surface
//! there, once. After `subscribe`, a pump task forwards every PUBLISH into the
//! delivery queue until the connection ends or the consumer goes away.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::bus::{BusClient, BusMessage, DEFAULT_QUEUE_CAPACITY};
use crate::config::BusConfig;
use crate::error::{BusError, Result};

/// Grace period for the DISCONNECT packet to leave before the pump is aborted.
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Capacity of rumqttc's request channel.
const REQUEST_CAPACITY: usize = 10;

/// A connected MQTT session.
pub struct MqttBus {
    client: AsyncClient,
    eventloop: Option<EventLoop>,
    pump: Option<JoinHandle<()>>,
    closed: bool,
}

impl std::fmt::Debug for MqttBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttBus")
            .field("subscribed", &self.pump.is_some())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl MqttBus {
    /// Connect and wait for CONNACK, bounded by `config.connect_timeout_secs`.
    pub async fn connect(config: &BusConfig) -> Result<Self> {
        let mut options = MqttOptions::new(config.client_id(), config.host.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
        options.set_clean_session(true);
        if config.has_credentials() {
            options.set_credentials(config.username.clone(), config.password.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        info!(host = %config.host, port = config.port, "Connecting to {}:{} ...", config.host, config.port);
        let timeout = config.connect_timeout();
        tokio::time::timeout(timeout, wait_for_connack(&mut eventloop, config))
            .await
            .map_err(|_| BusError::ConnectTimeout(timeout))??;
        info!(host = %config.host, port = config.port, "Connected to MQTT broker");

        Ok(Self {
            client,
            eventloop: Some(eventloop),
            pump: None,
            closed: false,
        })
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop, config: &BusConfig) -> Result<()> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(BusError::Refused(format!("{:?}", ack.code)).into())
                };
            }
            Ok(event) => trace!(?event, "Pre-CONNACK event"),
            Err(ConnectionError::ConnectionRefused(code)) => {
                return Err(BusError::Refused(format!("{code:?}")).into());
            }
            Err(e) => {
                return Err(BusError::ConnectFailed {
                    host: config.host.clone(),
                    port: config.port,
                    reason: e.to_string(),
                }
                .into());
            }
        }
    }
}

/// Forward incoming PUBLISH packets until the connection ends or the
/// consumer drops its receiver.
async fn pump(mut eventloop: EventLoop, tx: mpsc::Sender<BusMessage>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = BusMessage::new(publish.topic.clone(), publish.payload.to_vec());
                if tx.send(message).await.is_err() {
                    debug!("Message consumer gone, stopping MQTT pump");
                    break;
                }
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                debug!(pkid = ack.pkid, "Subscription acknowledged");
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("DISCONNECT sent");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "MQTT connection ended");
                break;
            }
        }
    }
}

/// Poll an unsubscribed event loop just long enough to flush DISCONNECT.
async fn flush_disconnect(mut eventloop: EventLoop) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
            Ok(_) => {}
        }
    }
}

#[async_trait]
impl BusClient for MqttBus {
    async fn subscribe(&mut self, pattern: &str) -> Result<mpsc::Receiver<BusMessage>> {
        let eventloop = self.eventloop.take().ok_or_else(|| BusError::Subscribe {
            pattern: pattern.to_string(),
            reason: if self.closed {
                "connection closed".to_string()
            } else {
                "already subscribed".to_string()
            },
        })?;

        self.client
            .subscribe(pattern, QoS::AtMostOnce)
            .await
            .map_err(|e| BusError::Subscribe {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })?;
        info!(pattern, "Subscribed to {pattern}");

        let (tx, rx) = mpsc::channel(DEFAULT_QUEUE_CAPACITY);
        self.pump = Some(tokio::spawn(pump(eventloop, tx)));
        Ok(rx)
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let sent = self.client.disconnect().await;

        if let Some(eventloop) = self.eventloop.take() {
            let _ = tokio::time::timeout(DISCONNECT_GRACE, flush_disconnect(eventloop)).await;
        }
        if let Some(mut handle) = self.pump.take() {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut handle).await.is_err() {
                handle.abort();
            }
        }

        sent.map_err(|e| BusError::Disconnect(e.to_string()))?;
        debug!("Disconnected from MQTT broker");
        Ok(())
    }
}

impl Drop for MqttBus {
    fn drop(&mut self) {
        if let Some(handle) = self.pump.take() {
            handle.abort();
        }
    }
}
