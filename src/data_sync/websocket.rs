use super::events::{ChainEvent, RawLog};
use alloy_primitives::{Address, B256, Bytes};
use eyre::{Result, eyre};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

/// Log object of an `eth_subscribe("logs")` notification.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogNotification {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: String,
    pub log_index: String,
    #[serde(default)]
    pub removed: bool,
}

fn parse_quantity(value: &str, what: &str) -> Result<u64> {
    u64::from_str_radix(value.trim_start_matches("0x"), 16).map_err(|e| eyre!("Invalid {} format: {}", what, e))
}

impl LogNotification {
    pub fn block_number(&self) -> Result<u64> {
        parse_quantity(&self.block_number, "block number")
    }

    pub fn into_raw_log(self) -> Result<RawLog> {
        let block_number = self.block_number()?;
        let log_index = parse_quantity(&self.log_index, "log index")?;
        Ok(RawLog { address: self.address, topics: self.topics, data: self.data, block_number, log_index })
    }
}

/// Turns subscription notifications into [`ChainEvent`]s.
///
/// A run of `removed` logs collapses into rollbacks to the block before the oldest removed
/// log seen so far in the run; an older removal emits a deeper rollback, a newer one nothing.
///
/// The ancestor is an approximation: replaced blocks that carried no subscribed logs are
/// invisible here, so the real fork point may be earlier. Pool state only depends on
/// subscribed logs, so rolling back to the block before the oldest removed one is enough.
#[derive(Debug, Default)]
pub struct NotificationDecoder {
    rolled_back_to: Option<u64>,
}

impl NotificationDecoder {
    pub fn decode(&mut self, text: &str) -> Result<Option<ChainEvent>> {
        let message: Value = serde_json::from_str(text)?;
        let Some(result) = message.get("params").and_then(|p| p.get("result")) else {
            return Ok(None);
        };
        let notification: LogNotification = serde_json::from_value(result.clone())?;

        if notification.removed {
            let candidate = notification.block_number()?.saturating_sub(1);
            let common_ancestor = self.rolled_back_to.map_or(candidate, |a| a.min(candidate));
            if self.rolled_back_to == Some(common_ancestor) {
                return Ok(None);
            }
            self.rolled_back_to = Some(common_ancestor);
            return Ok(Some(ChainEvent::Rollback { common_ancestor }));
        }

        self.rolled_back_to = None;
        Ok(Some(ChainEvent::Logs(vec![notification.into_raw_log()?])))
    }
}

/// Subscribes to pool logs over WebSocket and feeds them to the extractor.
///
/// Every reconnection after the first successful subscription emits [`ChainEvent::Resync`]
/// since logs may have been missed while disconnected.
pub struct LogSubscription {
    rpc_url: String,
    topics: Vec<B256>,
    connection_timeout: Duration,
    max_reconnect_attempts: u32,
    reconnect_delay: Duration,
}

impl LogSubscription {
    pub fn new(
        rpc_url: String,
        topics: Vec<B256>,
        connection_timeout: Duration,
        max_reconnect_attempts: u32,
        reconnect_delay: Duration,
    ) -> Self {
        Self { rpc_url, topics, connection_timeout, max_reconnect_attempts, reconnect_delay }
    }

    pub fn subscribe_request(&self) -> Value {
        serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_subscribe",
            "params": ["logs", { "topics": [self.topics] }]
        })
    }

    /// Returns the event receiver and a shutdown sender.
    pub async fn subscribe(&self, buffer: usize) -> Result<(mpsc::Receiver<ChainEvent>, mpsc::Sender<()>)> {
        Url::parse(&self.rpc_url).map_err(|e| eyre!("Invalid RPC_WSS_URL: {}", e))?;
        let (event_tx, event_rx) = mpsc::channel(buffer);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);

        let rpc_url = self.rpc_url.clone();
        let request = self.subscribe_request();
        let connection_timeout = self.connection_timeout;
        let max_reconnect_attempts = self.max_reconnect_attempts;
        let reconnect_delay = self.reconnect_delay;

        tokio::spawn(async move {
            let mut reconnect_count = 0;
            let mut subscribed_before = false;

            loop {
                let session = Self::connect_and_subscribe(
                    &rpc_url,
                    &request,
                    connection_timeout,
                    &event_tx,
                    &mut shutdown_rx,
                    &mut subscribed_before,
                );
                match session.await {
                    Ok(()) => {
                        info!("Log subscription ended normally");
                        break;
                    }
                    Err(e) => {
                        error!("Log subscription error: {}", e);
                        reconnect_count += 1;
                        if reconnect_count >= max_reconnect_attempts {
                            error!("Max reconnection attempts reached, giving up");
                            break;
                        }
                        warn!("Attempting reconnection #{} in {:?}", reconnect_count, reconnect_delay);
                        sleep(reconnect_delay).await;
                    }
                }
            }
        });

        Ok((event_rx, shutdown_tx))
    }

    async fn connect_and_subscribe(
        rpc_url: &str,
        request: &Value,
        connection_timeout: Duration,
        event_tx: &mpsc::Sender<ChainEvent>,
        shutdown_rx: &mut mpsc::Receiver<()>,
        subscribed_before: &mut bool,
    ) -> Result<()> {
        let url = Url::parse(rpc_url)?;
        info!("Connecting to WebSocket: {}", url);

        let (ws_stream, _) = timeout(connection_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| eyre!("WebSocket connection timeout"))?
            .map_err(|e| eyre!("WebSocket connection failed: {}", e))?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        ws_sender.send(Message::Text(request.to_string().into())).await?;

        let subscription_id = match ws_receiver.next().await {
            Some(Ok(Message::Text(text))) => {
                let response: Value = serde_json::from_str(text.as_str())?;
                if let Some(result) = response.get("result") {
                    result.as_str().ok_or_else(|| eyre!("Invalid subscription ID format"))?.to_string()
                } else if let Some(error) = response.get("error") {
                    return Err(eyre!("Subscription error: {}", error));
                } else {
                    return Err(eyre!("Unexpected subscription response: {}", text));
                }
            }
            Some(Ok(msg)) => return Err(eyre!("Unexpected message type during subscription: {:?}", msg)),
            Some(Err(e)) => return Err(eyre!("WebSocket error during subscription: {}", e)),
            None => return Err(eyre!("WebSocket closed during subscription")),
        };
        info!("Subscribed to pool logs with ID: {}", subscription_id);

        if *subscribed_before {
            warn!("Log feed reconnected, requesting resync");
            event_tx.send(ChainEvent::Resync).await.map_err(|_| eyre!("Event channel is closed"))?;
        }
        *subscribed_before = true;

        let mut decoder = NotificationDecoder::default();
        loop {
            tokio::select! {
                ws_msg = ws_receiver.next() => {
                    match ws_msg {
                        Some(Ok(Message::Text(text))) => match decoder.decode(text.as_str()) {
                            Ok(Some(event)) => {
                                if event_tx.send(event).await.is_err() {
                                    info!("Event channel closed, ending subscription");
                                    return Ok(());
                                }
                            }
                            Ok(None) => {}
                            Err(e) => warn!("Failed to handle WebSocket message: {}", e),
                        },
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await.map_err(|e| eyre!("Failed to send pong: {}", e))?;
                        }
                        Some(Ok(Message::Close(_))) => return Err(eyre!("WebSocket closed by server")),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(eyre!("WebSocket error: {}", e)),
                        None => return Err(eyre!("WebSocket stream ended")),
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!("Received shutdown signal");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification(block: &str, index: &str, removed: bool) -> String {
        serde_json::json!({
            "jsonrpc": "2.0",
            "method": "eth_subscription",
            "params": {
                "subscription": "0x1",
                "result": {
                    "address": "0xb4e16d0168e52d35cacd2c6185b44281ec28c9dc",
                    "topics": ["0x1c411e9a96e071241c2f21f7726b17ae89e3cab4c78be50e062b03a9fffbbad1"],
                    "data": "0x01",
                    "blockNumber": block,
                    "logIndex": index,
                    "removed": removed
                }
            }
        })
        .to_string()
    }

    #[test]
    fn test_decode_log() {
        let mut decoder = NotificationDecoder::default();
        let Some(ChainEvent::Logs(logs)) = decoder.decode(&notification("0x10", "0x2", false)).unwrap() else {
            panic!("expected logs");
        };
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].block_number, 16);
        assert_eq!(logs[0].log_index, 2);
        assert_eq!(logs[0].data, Bytes::from(vec![1u8]));
    }

    #[test]
    fn test_removed_logs_collapse_into_one_rollback() {
        let mut decoder = NotificationDecoder::default();
        assert_eq!(decoder.decode(&notification("0x10", "0x0", true)).unwrap(), Some(ChainEvent::Rollback { common_ancestor: 15 }));
        assert_eq!(decoder.decode(&notification("0x11", "0x0", true)).unwrap(), None);
        // Older removal reaches deeper.
        assert_eq!(decoder.decode(&notification("0xe", "0x0", true)).unwrap(), Some(ChainEvent::Rollback { common_ancestor: 13 }));
        assert!(matches!(decoder.decode(&notification("0xe", "0x0", false)).unwrap(), Some(ChainEvent::Logs(_))));
        assert!(decoder.decode(&notification("0x10", "0x0", true)).unwrap().is_some());
    }

    #[test]
    fn test_newest_first_removals_settle_on_oldest_block() {
        let mut decoder = NotificationDecoder::default();
        let mut rollbacks = Vec::new();
        for block in ["0x12", "0x11", "0x12", "0x10"] {
            if let Some(ChainEvent::Rollback { common_ancestor }) = decoder.decode(&notification(block, "0x0", true)).unwrap() {
                rollbacks.push(common_ancestor);
            }
        }
        assert_eq!(rollbacks, vec![17, 16, 15]);
    }

    #[test]
    fn test_non_notifications_are_ignored() {
        let mut decoder = NotificationDecoder::default();
        assert_eq!(decoder.decode(r#"{"jsonrpc":"2.0","id":1,"result":"0xabc"}"#).unwrap(), None);
        assert!(decoder.decode("not json").is_err());
    }

    #[test]
    fn test_subscribe_request() {
        let topic = B256::repeat_byte(7);
        let subscription =
            LogSubscription::new("wss://node.invalid".to_string(), vec![topic], Duration::from_secs(30), 5, Duration::from_secs(2));
        let request = subscription.subscribe_request();
        assert_eq!(request["params"][0], "logs");
        assert_eq!(request["params"][1]["topics"][0][0], serde_json::to_value(topic).unwrap());
    }
}
