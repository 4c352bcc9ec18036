/// Finnhub WebSocket client for real-time trade data
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::backoff::ReconnectBackoff;
use crate::data::RatesAggregator;
use crate::error::{Result, StreamError};
use crate::types::{Config, PairMapping, Tick};
use crate::utils::time::from_epoch_millis;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Only messages of this type carry trades
const TRADE_MESSAGE_TYPE: &str = "trade";

#[derive(Debug, Serialize)]
struct WsSubscribeRequest<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    symbol: &'a str,
}

#[derive(Debug, Deserialize)]
struct WsEnvelope {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    data: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedConnectionState {
    Disconnected,
    Connecting,
    Subscribed,
    Listening,
    Reconnecting(Duration),
    Stopped,
}

/// Counters for dropped and forwarded feed data
#[derive(Debug, Default)]
pub struct FeedStats {
    messages: AtomicU64,
    malformed: AtomicU64,
    skipped_trades: AtomicU64,
    unmapped_symbols: AtomicU64,
    ticks_forwarded: AtomicU64,
    connect_attempts: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeedStatsSnapshot {
    pub messages: u64,
    pub malformed: u64,
    pub skipped_trades: u64,
    pub unmapped_symbols: u64,
    pub ticks_forwarded: u64,
    pub connect_attempts: u64,
}

impl FeedStats {
    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> FeedStatsSnapshot {
        FeedStatsSnapshot {
            messages: self.messages.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            skipped_trades: self.skipped_trades.load(Ordering::Relaxed),
            unmapped_symbols: self.unmapped_symbols.load(Ordering::Relaxed),
            ticks_forwarded: self.ticks_forwarded.load(Ordering::Relaxed),
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
        }
    }
}

/// Cooperative stop signal for a running client
#[derive(Clone)]
pub struct FeedStopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl FeedStopHandle {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }
}

enum SessionEnd {
    Closed,
    Stopped,
}

pub struct FinnhubClient {
    base_url: String,
    api_key: String,
    reconnect_base_delay: Duration,
    reconnect_max_delay: Duration,
    mappings: Vec<PairMapping>,
    symbol_to_pair: HashMap<String, String>,
    aggregator: Arc<RatesAggregator>,
    state_tx: watch::Sender<FeedConnectionState>,
    stop_tx: Arc<watch::Sender<bool>>,
    stats: Arc<FeedStats>,
}

impl FinnhubClient {
    pub fn new(config: &Config, aggregator: Arc<RatesAggregator>) -> Result<Self> {
        let api_key = config
            .feed
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| {
                StreamError::ConfigError(
                    "FINNHUB_API_KEY is not set. Please configure it in the environment.".to_string(),
                )
            })?;

        let symbol_to_pair = config
            .pairs
            .iter()
            .map(|m| (m.symbol.clone(), m.pair.clone()))
            .collect();

        let (state_tx, _) = watch::channel(FeedConnectionState::Disconnected);
        let (stop_tx, _) = watch::channel(false);

        Ok(FinnhubClient {
            base_url: config.feed.base_url.clone(),
            api_key,
            reconnect_base_delay: config.reconnect_base_delay(),
            reconnect_max_delay: config.reconnect_max_delay(),
            mappings: config.pairs.clone(),
            symbol_to_pair,
            aggregator,
            state_tx,
            stop_tx: Arc::new(stop_tx),
            stats: Arc::new(FeedStats::default()),
        })
    }

    pub fn build_ws_url(&self) -> String {
        format!("{}?token={}", self.base_url, self.api_key)
    }

    fn redacted_url(&self) -> String {
        format!("{}?token=***", self.base_url)
    }

    pub fn stop_handle(&self) -> FeedStopHandle {
        FeedStopHandle {
            tx: Arc::clone(&self.stop_tx),
        }
    }

    pub fn state_receiver(&self) -> watch::Receiver<FeedConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> FeedConnectionState {
        *self.state_tx.borrow()
    }

    pub fn stats(&self) -> Arc<FeedStats> {
        Arc::clone(&self.stats)
    }

    fn set_state(&self, state: FeedConnectionState) {
        debug!("Feed state -> {:?}", state);
        self.state_tx.send_replace(state);
    }

    /// Keep the connection alive and reconnect on failures until stopped
    pub async fn run(&self) {
        let mut stop_rx = self.stop_tx.subscribe();
        let mut backoff = ReconnectBackoff::new(self.reconnect_base_delay, self.reconnect_max_delay);

        loop {
            if *stop_rx.borrow() {
                break;
            }

            self.set_state(FeedConnectionState::Connecting);
            FeedStats::incr(&self.stats.connect_attempts);

            let connected = tokio::select! {
                res = self.connect() => res,
                _ = stop_rx.changed() => break,
            };

            let delay = match connected {
                Err(e) => {
                    let delay = backoff.on_connect_failure();
                    warn!("Finnhub connection error: {}. Reconnecting in {:?}", e, delay);
                    delay
                }
                Ok(ws) => {
                    let (mut write, read) = ws.split();

                    match self.subscribe_all(&mut write).await {
                        Err(e) => {
                            let delay = backoff.on_connect_failure();
                            warn!("Finnhub subscribe failed: {}. Reconnecting in {:?}", e, delay);
                            delay
                        }
                        Ok(()) => {
                            self.set_state(FeedConnectionState::Subscribed);
                            self.set_state(FeedConnectionState::Listening);

                            match self.listen(write, read, &mut stop_rx).await {
                                Ok(SessionEnd::Stopped) => break,
                                Ok(SessionEnd::Closed) => {
                                    let delay = backoff.on_session_ended();
                                    info!("Finnhub WebSocket connection closed. Reconnecting in {:?}", delay);
                                    delay
                                }
                                Err(e) => {
                                    let delay = backoff.on_session_ended();
                                    warn!(
                                        "Finnhub stream error: {} ({}). Reconnecting in {:?}",
                                        e,
                                        e.error_code(),
                                        delay
                                    );
                                    delay
                                }
                            }
                        }
                    }
                }
            };

            self.set_state(FeedConnectionState::Reconnecting(delay));

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop_rx.changed() => {}
            }
        }

        self.set_state(FeedConnectionState::Stopped);
        info!("Finnhub client stopped");
    }

    async fn connect(&self) -> Result<WsStream> {
        info!("Connecting to Finnhub WebSocket at {}", self.redacted_url());

        let (ws_stream, _) = connect_async(self.build_ws_url())
            .await
            .map_err(|e| StreamError::WebSocketError(format!("Connection failed: {}", e)))?;

        info!("Connected to Finnhub WebSocket");
        Ok(ws_stream)
    }

    /// Send one subscribe request per configured pair
    async fn subscribe_all(&self, write: &mut SplitSink<WsStream, Message>) -> Result<()> {
        for mapping in &self.mappings {
            let payload = serde_json::to_string(&WsSubscribeRequest {
                kind: "subscribe",
                symbol: &mapping.symbol,
            })?;

            write
                .send(Message::Text(payload))
                .await
                .map_err(|e| StreamError::SubscribeFailed(format!("{}: {}", mapping.symbol, e)))?;

            info!("Subscribed to {} ({})", mapping.pair, mapping.symbol);
        }

        Ok(())
    }

    async fn listen(
        &self,
        mut write: SplitSink<WsStream, Message>,
        mut read: SplitStream<WsStream>,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd> {
        loop {
            let msg = tokio::select! {
                msg = read.next() => msg,
                _ = stop_rx.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(SessionEnd::Stopped);
                }
            };

            match msg {
                Some(Ok(Message::Text(text))) => {
                    self.handle_message(&text).await;
                }
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => {
                        self.handle_message(&text).await;
                    }
                    Err(_) => {
                        FeedStats::incr(&self.stats.messages);
                        FeedStats::incr(&self.stats.malformed);
                        warn!("Received non-UTF-8 binary frame from Finnhub");
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    debug!("Finnhub closed the connection: {:?}", frame);
                    return Ok(SessionEnd::Closed);
                }
                Some(Ok(_)) => {
                    // Ping/pong are answered by the library
                }
                Some(Err(e)) => {
                    return Err(StreamError::WebSocketDisconnected(e.to_string()));
                }
                None => return Ok(SessionEnd::Closed),
            }
        }
    }

    /// Decode one raw message and forward its ticks; returns ticks the aggregator accepted
    pub async fn handle_message(&self, raw: &str) -> usize {
        FeedStats::incr(&self.stats.messages);

        let ticks = match self.decode_trades(raw) {
            Ok(ticks) => ticks,
            Err(e) => {
                FeedStats::incr(&self.stats.malformed);
                warn!("Received invalid JSON from Finnhub: {} ({})", raw, e);
                return 0;
            }
        };

        let mut forwarded = 0;
        for tick in ticks {
            if self.aggregator.ingest(tick).await {
                FeedStats::incr(&self.stats.ticks_forwarded);
                forwarded += 1;
            }
        }

        forwarded
    }

    /// Turn a raw feed message into ticks for mapped symbols.
    ///
    /// Non-trade messages yield no ticks. Trades missing a symbol, price or
    /// timestamp, or naming an unmapped symbol, are skipped.
    pub fn decode_trades(&self, raw: &str) -> Result<Vec<Tick>> {
        let envelope: WsEnvelope = serde_json::from_str(raw)?;

        if envelope.kind.as_deref() != Some(TRADE_MESSAGE_TYPE) {
            return Ok(Vec::new());
        }

        let trades = envelope.data.unwrap_or_default();
        Ok(trades.iter().filter_map(|trade| self.trade_to_tick(trade)).collect())
    }

    /// Expected fields: `s` symbol, `p` price, `t` timestamp in milliseconds
    fn trade_to_tick(&self, trade: &Value) -> Option<Tick> {
        let symbol = trade.get("s").and_then(Value::as_str);
        let price = trade.get("p").and_then(number_field);
        let ts_ms = trade.get("t").and_then(millis_field);

        let (Some(symbol), Some(price), Some(ts_ms)) = (symbol, price, ts_ms) else {
            FeedStats::incr(&self.stats.skipped_trades);
            debug!("Skipping incomplete trade payload: {}", trade);
            return None;
        };

        let Some(pair) = self.symbol_to_pair.get(symbol) else {
            FeedStats::incr(&self.stats.unmapped_symbols);
            debug!("Ignoring trade for unmapped symbol {}", symbol);
            return None;
        };

        if !price.is_finite() || price <= 0.0 {
            FeedStats::incr(&self.stats.skipped_trades);
            debug!("Skipping trade with unusable price: {}", trade);
            return None;
        }

        let Some(timestamp) = from_epoch_millis(ts_ms) else {
            FeedStats::incr(&self.stats.skipped_trades);
            debug!("Skipping trade with out-of-range timestamp: {}", trade);
            return None;
        };

        Some(Tick::new(pair.clone(), price, timestamp))
    }
}

/// Numbers, or numeric strings
fn number_field(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn millis_field(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        _ => None,
    }
}
