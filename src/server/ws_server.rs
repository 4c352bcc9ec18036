/// WebSocket server pushing rate updates to subscribers
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::data::RatesAggregator;
use crate::error::{Result, StreamError};
use crate::events::BroadcastHub;
use crate::types::{RatesSnapshot, ServerMessage};

pub struct SubscriberServer {
    listener: TcpListener,
    hub: Arc<BroadcastHub>,
    aggregator: Arc<RatesAggregator>,
    buffer: usize,
}

impl SubscriberServer {
    pub async fn bind(
        addr: &str,
        hub: Arc<BroadcastHub>,
        aggregator: Arc<RatesAggregator>,
        buffer: usize,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| StreamError::WebSocketError(format!("Failed to bind {}: {}", addr, e)))?;

        Ok(SubscriberServer {
            listener,
            hub,
            aggregator,
            buffer,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept subscriber connections until shutdown is signalled
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        match self.listener.local_addr() {
            Ok(addr) => info!("Subscriber server listening on ws://{}", addr),
            Err(e) => warn!("Subscriber server listening on unknown address: {}", e),
        }

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        debug!("New WebSocket connection from {}", peer_addr);
                        tokio::spawn(handle_client(
                            stream,
                            peer_addr,
                            Arc::clone(&self.hub),
                            Arc::clone(&self.aggregator),
                            self.buffer,
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => warn!("Failed to accept connection: {}", e),
                },
                _ = shutdown.changed() => break,
            }
        }

        info!("Subscriber server stopped");
    }
}

/// One subscriber connection.
///
/// The writer half drains the hub queue. The reader half only watches for
/// the peer going away; anything the peer sends is ignored.
async fn handle_client(
    stream: TcpStream,
    peer_addr: SocketAddr,
    hub: Arc<BroadcastHub>,
    aggregator: Arc<RatesAggregator>,
    buffer: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake failed for {}: {}", peer_addr, e);
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // Register before the snapshot so no update falls between the two
    let (id, mut rx) = hub.subscribe(buffer).await;

    let snapshot = ServerMessage::Snapshot(RatesSnapshot {
        pairs: aggregator.snapshot().await,
    });
    match serde_json::to_string(&snapshot) {
        Ok(text) => {
            if ws_sender.send(Message::Text(text)).await.is_err() {
                hub.unregister(id).await;
                return;
            }
        }
        Err(e) => error!("Failed to serialize snapshot: {}", e),
    }

    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_sender.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Close(_)) => break,
                Ok(Message::Text(text)) => {
                    debug!("Ignoring text from {}: {}", peer_addr, text);
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("WebSocket error for {}: {}", peer_addr, e);
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => {}
        _ = &mut recv_task => {}
        _ = shutdown.changed() => {}
    }

    send_task.abort();
    recv_task.abort();
    hub.unregister(id).await;

    debug!("WebSocket connection closed for {} ({})", peer_addr, id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::InMemoryHourlyStore;
    use crate::types::Tick;
    use chrono::{TimeZone, Utc};
    use serde_json::Value;
    use std::time::Duration;
    use tokio_tungstenite::connect_async;

    async fn wait_for_subscribers(hub: &BroadcastHub, expected: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while hub.subscriber_count().await != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("subscriber count never settled");
    }

    async fn next_json<S>(ws: &mut S) -> Value
    where
        S: futures_util::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("no frame received")
                .expect("stream ended")
                .expect("websocket error");
            if let Message::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_subscriber_receives_snapshot_then_updates() {
        let pairs = vec!["ETH/USDC".to_string(), "ETH/BTC".to_string()];
        let aggregator = Arc::new(RatesAggregator::new(Arc::new(InMemoryHourlyStore::new()), pairs));
        let hub = Arc::new(BroadcastHub::new());
        aggregator.set_update_callback(hub.clone()).await;

        let server = SubscriberServer::bind("127.0.0.1:0", hub.clone(), aggregator.clone(), 16)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server_task = tokio::spawn(server.run(shutdown_rx));

        let (mut client, _) = connect_async(format!("ws://{}/", addr)).await.unwrap();

        let snapshot = next_json(&mut client).await;
        assert_eq!(snapshot["type"], "snapshot");
        assert_eq!(snapshot["pairs"].as_array().unwrap().len(), 2);
        assert!(snapshot["pairs"][0]["price"].is_null());

        wait_for_subscribers(&hub, 1).await;

        // Client chatter is ignored
        client.send(Message::Text("hello".to_string())).await.unwrap();

        let ts = Utc.with_ymd_and_hms(2025, 1, 1, 10, 5, 0).unwrap();
        aggregator.ingest(Tick::new("ETH/USDC", 2000.0, ts)).await;

        let update = next_json(&mut client).await;
        assert_eq!(update["type"], "rate_update");
        assert_eq!(update["pair"], "ETH/USDC");
        assert_eq!(update["price"], 2000.0);
        assert_eq!(update["hourly_avg"], 2000.0);

        client.close(None).await.unwrap();
        wait_for_subscribers(&hub, 0).await;

        shutdown_tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(5), server_task)
            .await
            .expect("server did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_dead_subscriber_does_not_affect_others() {
        let aggregator = Arc::new(RatesAggregator::new(
            Arc::new(InMemoryHourlyStore::new()),
            vec!["ETH/USDT".to_string()],
        ));
        let hub = Arc::new(BroadcastHub::new());
        aggregator.set_update_callback(hub.clone()).await;

        let server = SubscriberServer::bind("127.0.0.1:0", hub.clone(), aggregator.clone(), 16)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server_task = tokio::spawn(server.run(shutdown_rx));

        let (mut alive, _) = connect_async(format!("ws://{}/", addr)).await.unwrap();
        let (mut leaving, _) = connect_async(format!("ws://{}/", addr)).await.unwrap();
        next_json(&mut alive).await;
        next_json(&mut leaving).await;
        wait_for_subscribers(&hub, 2).await;

        drop(leaving);
        wait_for_subscribers(&hub, 1).await;

        let ts = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        aggregator.ingest(Tick::new("ETH/USDT", 3000.0, ts)).await;

        let update = next_json(&mut alive).await;
        assert_eq!(update["pair"], "ETH/USDT");

        shutdown_tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(5), server_task)
            .await
            .expect("server did not stop")
            .unwrap();
    }
}
