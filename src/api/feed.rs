use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::error::{ExchangeError, ExchangeResult};
use crate::models::MarketData;
use crate::shutdown::Shutdown;

pub const UPBIT_WS_URL: &str = "wss://api.upbit.com/websocket/v1";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Exponential reconnect delay: doubles from `initial` up to `max`
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait now; the following call returns double (capped)
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Subscription message, one per stream type
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Subscription {
    pub ticket: String,
    #[serde(rename = "type")]
    pub stream_type: String,
    pub codes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub url: String,
    pub markets: Vec<String>,
    /// `trade`, `ticker` and/or `orderbook`
    pub stream_types: Vec<String>,
    pub keepalive: Duration,
    pub enqueue_timeout: Duration,
    pub connect_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: UPBIT_WS_URL.to_string(),
            markets: Vec::new(),
            stream_types: vec!["trade".to_string()],
            keepalive: Duration::from_secs(30),
            enqueue_timeout: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(45),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Why a connected session ended
#[derive(Debug)]
enum SessionEnd {
    Shutdown,
    QueueClosed,
    Lost(ExchangeError),
}

/// Streaming market-data connection that keeps itself alive
///
/// Reconnects with backoff until shutdown; every reconnect resubscribes with
/// fresh tickets for the same markets and stream types.
pub struct MarketFeed {
    config: FeedConfig,
}

impl MarketFeed {
    pub fn new(config: FeedConfig) -> Self {
        Self { config }
    }

    /// Fresh subscription set for one connection
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.config
            .stream_types
            .iter()
            .map(|stream_type| Subscription {
                ticket: Uuid::new_v4().to_string(),
                stream_type: stream_type.clone(),
                codes: self.config.markets.clone(),
            })
            .collect()
    }

    /// Run until shutdown or until the receiving side of `tx` is dropped
    pub async fn run(self, tx: mpsc::Sender<MarketData>, mut shutdown: Shutdown) {
        let mut backoff = Backoff::new(self.config.initial_backoff, self.config.max_backoff);

        tracing::info!(
            "📡 Market feed starting: {} markets, streams {:?}",
            self.config.markets.len(),
            self.config.stream_types
        );

        loop {
            if shutdown.is_triggered() {
                break;
            }

            let ws = tokio::select! {
                result = self.connect() => result,
                _ = shutdown.wait() => break,
            };

            match ws {
                Ok(ws) => {
                    backoff.reset();
                    tracing::info!("✓ Market feed connected to {}", self.config.url);

                    match self.session(ws, &tx, &mut shutdown).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::QueueClosed => {
                            tracing::info!("Market data queue closed, stopping feed");
                            break;
                        }
                        SessionEnd::Lost(e) => {
                            tracing::warn!("Market feed connection lost: {}, reconnecting", e);
                        }
                    }
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        "Market feed connect failed: {} (retrying in {:?})",
                        e,
                        delay
                    );
                    if shutdown.sleep_or_shutdown(delay).await {
                        break;
                    }
                }
            }
        }

        tracing::info!("Market feed stopped");
    }

    async fn connect(&self) -> ExchangeResult<WsStream> {
        let (mut ws, _) = tokio::time::timeout(
            self.config.connect_timeout,
            connect_async(self.config.url.as_str()),
        )
        .await
        .map_err(|_| ExchangeError::TransientConnection("connect timed out".into()))?
        .map_err(|e| ExchangeError::TransientConnection(e.to_string()))?;

        for subscription in self.subscriptions() {
            let text = serde_json::to_string(&subscription)?;
            ws.send(Message::Text(text))
                .await
                .map_err(|e| ExchangeError::TransientConnection(format!("subscribe: {}", e)))?;
        }

        Ok(ws)
    }

    async fn session(
        &self,
        ws: WsStream,
        tx: &mpsc::Sender<MarketData>,
        shutdown: &mut Shutdown,
    ) -> SessionEnd {
        let (mut write, mut read) = ws.split();

        let mut keepalive = tokio::time::interval(self.config.keepalive);
        keepalive.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.wait() => {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
                _ = keepalive.tick() => {
                    if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                        return SessionEnd::Lost(ExchangeError::TransientConnection(
                            format!("ping failed: {}", e),
                        ));
                    }
                }
                message = read.next() => {
                    let payload = match message {
                        Some(Ok(Message::Text(text))) => text.into_bytes(),
                        Some(Ok(Message::Binary(bytes))) => bytes,
                        Some(Ok(Message::Close(frame))) => {
                            return SessionEnd::Lost(ExchangeError::TransientConnection(
                                format!("closed by server: {:?}", frame),
                            ));
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            return SessionEnd::Lost(ExchangeError::TransientConnection(
                                e.to_string(),
                            ));
                        }
                        None => {
                            return SessionEnd::Lost(ExchangeError::TransientConnection(
                                "stream ended".into(),
                            ));
                        }
                    };

                    if let Some(end) = self.forward(&payload, tx).await {
                        return end;
                    }
                }
            }
        }
    }

    /// Decode and enqueue one message. Only a closed queue ends the session.
    async fn forward(&self, payload: &[u8], tx: &mpsc::Sender<MarketData>) -> Option<SessionEnd> {
        let data: MarketData = match serde_json::from_slice(payload) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(
                    "Skipping undecodable feed message ({}): {}",
                    e,
                    String::from_utf8_lossy(payload)
                );
                return None;
            }
        };

        match tx.send_timeout(data, self.config.enqueue_timeout).await {
            Ok(()) => None,
            Err(SendTimeoutError::Timeout(data)) => {
                tracing::warn!(
                    market = %data.market,
                    "Market data queue full for {:?}, dropping tick",
                    self.config.enqueue_timeout
                );
                None
            }
            Err(SendTimeoutError::Closed(_)) => Some(SessionEnd::QueueClosed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::ShutdownTrigger;
    use tokio::net::TcpListener;

    fn tick_json(market: &str, price: f64) -> String {
        format!(
            r#"{{"type":"trade","code":"{}","timestamp":1700000000000,"trade_price":{},"trade_volume":0.1}}"#,
            market, price
        )
    }

    fn config(url: String, stream_types: &[&str]) -> FeedConfig {
        FeedConfig {
            url,
            markets: vec!["KRW-BTC".to_string(), "KRW-ETH".to_string()],
            stream_types: stream_types.iter().map(|s| s.to_string()).collect(),
            keepalive: Duration::from_secs(30),
            enqueue_timeout: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(2),
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
        }
    }

    async fn read_subscriptions(
        ws: &mut WebSocketStream<TcpStream>,
        count: usize,
    ) -> Vec<Subscription> {
        let mut subs = Vec::new();
        while subs.len() < count {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => subs.push(serde_json::from_str(&text).unwrap()),
                Some(Ok(_)) => continue,
                other => panic!("unexpected message: {:?}", other),
            }
        }
        subs
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_subscriptions_have_fresh_tickets() {
        let feed = MarketFeed::new(config("ws://unused".into(), &["trade", "ticker"]));
        let first = feed.subscriptions();
        let second = feed.subscriptions();

        assert_eq!(first.len(), 2);
        assert_eq!(first[0].stream_type, "trade");
        assert_eq!(first[1].stream_type, "ticker");
        assert_ne!(first[0].ticket, first[1].ticket);
        assert_ne!(first[0].ticket, second[0].ticket);
        assert_eq!(first[0].codes, vec!["KRW-BTC", "KRW-ETH"]);

        let json = serde_json::to_value(&first[0]).unwrap();
        assert_eq!(json["type"], "trade");
    }

    #[tokio::test]
    async fn test_reconnects_and_resubscribes_after_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (subs_tx, mut subs_rx) = mpsc::unbounded_channel::<Vec<Subscription>>();

        let server = tokio::spawn(async move {
            // First connection: one tick, then an abrupt drop
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            subs_tx.send(read_subscriptions(&mut ws, 2).await).unwrap();
            ws.send(Message::Text(tick_json("KRW-BTC", 100.0)))
                .await
                .unwrap();
            drop(ws);

            // Second connection stays up
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            subs_tx.send(read_subscriptions(&mut ws, 2).await).unwrap();
            ws.send(Message::Text("not json".to_string())).await.unwrap();
            ws.send(Message::Binary(tick_json("KRW-ETH", 200.0).into_bytes()))
                .await
                .unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let trigger = ShutdownTrigger::new();
        let (tx, mut rx) = mpsc::channel(10);
        let feed = MarketFeed::new(config(url, &["trade", "ticker"]));
        let handle = tokio::spawn(feed.run(tx, trigger.subscribe()));

        let timeout = Duration::from_secs(5);
        let first = tokio::time::timeout(timeout, rx.recv()).await.unwrap().unwrap();
        assert_eq!(first.market, "KRW-BTC");
        assert_eq!(first.price(), Some(100.0));

        // Undecodable message skipped, binary frame decoded
        let second = tokio::time::timeout(timeout, rx.recv()).await.unwrap().unwrap();
        assert_eq!(second.market, "KRW-ETH");
        assert_eq!(second.price(), Some(200.0));

        let before = subs_rx.recv().await.unwrap();
        let after = subs_rx.recv().await.unwrap();
        for (a, b) in before.iter().zip(after.iter()) {
            assert_eq!(a.stream_type, b.stream_type);
            assert_eq!(a.codes, b.codes);
            assert_ne!(a.ticket, b.ticket);
        }

        trigger.trigger();
        tokio::time::timeout(timeout, handle).await.unwrap().unwrap();
        server.abort();
    }

    #[tokio::test]
    async fn test_connect_failures_stop_on_shutdown() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let trigger = ShutdownTrigger::new();
        let (tx, _rx) = mpsc::channel(10);
        let handle = tokio::spawn(MarketFeed::new(config(url, &["trade"])).run(tx, trigger.subscribe()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!handle.is_finished());

        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_full_queue_drops_ticks_and_keeps_session() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let accepts = Arc::new(AtomicUsize::new(0));
        let (resume_tx, resume_rx) = tokio::sync::oneshot::channel::<()>();

        let counter = accepts.clone();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            counter.fetch_add(1, Ordering::SeqCst);
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            read_subscriptions(&mut ws, 1).await;

            // The first tick fills the queue, the next two time out
            for price in [1.0, 2.0, 3.0] {
                ws.send(Message::Text(tick_json("KRW-BTC", price)))
                    .await
                    .unwrap();
            }
            resume_rx.await.unwrap();
            ws.send(Message::Text(tick_json("KRW-BTC", 4.0)))
                .await
                .unwrap();

            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        if accepted.is_ok() {
                            counter.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                    message = ws.next() => {
                        if !matches!(message, Some(Ok(_))) {
                            break;
                        }
                    }
                }
            }
        });

        let trigger = ShutdownTrigger::new();
        let (tx, mut rx) = mpsc::channel(1);
        let mut feed_config = config(url, &["trade"]);
        feed_config.enqueue_timeout = Duration::from_millis(50);
        let handle = tokio::spawn(MarketFeed::new(feed_config).run(tx, trigger.subscribe()));

        // Nobody reads for well past two enqueue timeouts
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!handle.is_finished());

        let timeout = Duration::from_secs(5);
        let first = tokio::time::timeout(timeout, rx.recv()).await.unwrap().unwrap();
        assert_eq!(first.price(), Some(1.0));

        resume_tx.send(()).unwrap();
        let next = tokio::time::timeout(timeout, rx.recv()).await.unwrap().unwrap();
        assert_eq!(next.price(), Some(4.0));
        assert_eq!(accepts.load(Ordering::SeqCst), 1);

        trigger.trigger();
        tokio::time::timeout(timeout, handle).await.unwrap().unwrap();
        server.abort();
    }

    #[tokio::test]
    async fn test_feed_stops_when_queue_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            read_subscriptions(&mut ws, 1).await;
            ws.send(Message::Text(tick_json("KRW-BTC", 1.0))).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let trigger = ShutdownTrigger::new();
        let (tx, rx) = mpsc::channel(10);
        drop(rx);

        tokio::time::timeout(
            Duration::from_secs(5),
            MarketFeed::new(config(url, &["trade"])).run(tx, trigger.subscribe()),
        )
        .await
        .unwrap();
        server.abort();
    }
}
