//! 시장 데이터 프로듀서.
//!
//! `bars`/`quotes` 라우트의 토픽마다 랜덤 워크 생성 태스크를 하나씩
//! 띄웁니다. 생성된 가격은 공유 가격 장부에도 기록되어 브로커의
//! 체결/평가 가격으로 쓰입니다.

use async_trait::async_trait;
use rand::Rng;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use terminal_core::domain::SharedPriceBook;
use terminal_core::types::Price;
use terminal_core::{TerminalError, TerminalResult};
use terminal_pubsub::{DataService, Topic, TopicUpdate, UpdateSink};
use tokio::sync::Mutex;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use validator::Validate;

/// `bars` 라우트 구독 파라미터. 알 수 없는 필드는 거부됩니다.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct BarsParams {
    /// 거래 심볼
    #[validate(length(min = 1))]
    pub symbol: String,
    /// 봉 해상도 (예: "1", "5", "1D")
    #[validate(length(min = 1))]
    pub resolution: String,
}

/// `quotes` 라우트 구독 파라미터. 알 수 없는 필드는 거부됩니다.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct QuotesParams {
    /// 거래 심볼
    #[validate(length(min = 1))]
    pub symbol: String,
}

/// 프로듀서가 생성하는 업데이트 종류.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MarketRoute {
    Bars,
    Quotes,
}

/// `bars` 또는 `quotes` 라우트의 데이터 서비스.
///
/// 토픽별 프로듀서 태스크는 [`CancellationToken`]으로 관리되며
/// 마지막 구독 해제 시 취소됩니다.
pub struct MarketDataService {
    route: MarketRoute,
    prices: SharedPriceBook,
    sink: UpdateSink,
    tick: Duration,
    producers: Mutex<HashMap<String, CancellationToken>>,
}

impl MarketDataService {
    /// `bars` 라우트 서비스를 생성합니다.
    pub fn bars(prices: SharedPriceBook, sink: UpdateSink, tick: Duration) -> Self {
        Self::new(MarketRoute::Bars, prices, sink, tick)
    }

    /// `quotes` 라우트 서비스를 생성합니다.
    pub fn quotes(prices: SharedPriceBook, sink: UpdateSink, tick: Duration) -> Self {
        Self::new(MarketRoute::Quotes, prices, sink, tick)
    }

    fn new(route: MarketRoute, prices: SharedPriceBook, sink: UpdateSink, tick: Duration) -> Self {
        Self {
            route,
            prices,
            sink,
            tick,
            producers: Mutex::new(HashMap::new()),
        }
    }

    /// 활성 프로듀서 수를 반환합니다.
    pub async fn producer_count(&self) -> usize {
        self.producers.lock().await.len()
    }

    fn parse_symbol(&self, params: &Value) -> TerminalResult<(String, Option<String>)> {
        match self.route {
            MarketRoute::Bars => {
                let params: BarsParams = serde_json::from_value(params.clone())
                    .map_err(|e| TerminalError::Validation(e.to_string()))?;
                Ok((params.symbol, Some(params.resolution)))
            }
            MarketRoute::Quotes => {
                let params: QuotesParams = serde_json::from_value(params.clone())
                    .map_err(|e| TerminalError::Validation(e.to_string()))?;
                Ok((params.symbol, None))
            }
        }
    }
}

#[async_trait]
impl DataService for MarketDataService {
    async fn create_topic(&self, topic: &Topic) -> TerminalResult<()> {
        let (symbol, resolution) = self.parse_symbol(topic.params())?;
        let token = CancellationToken::new();

        let producer = Producer {
            route: self.route,
            topic: topic.key().to_string(),
            symbol,
            resolution,
            prices: self.prices.clone(),
            sink: self.sink.clone(),
            tick: self.tick,
        };
        let task_token = token.clone();
        tokio::spawn(async move { producer.run(task_token).await });

        self.producers
            .lock()
            .await
            .insert(topic.key().to_string(), token);
        info!(topic = %topic, "Market producer started");
        Ok(())
    }

    async fn remove_topic(&self, topic: &Topic) {
        if let Some(token) = self.producers.lock().await.remove(topic.key()) {
            token.cancel();
            info!(topic = %topic, "Market producer canceled");
        }
    }
}

/// 토픽 하나의 랜덤 워크 프로듀서.
struct Producer {
    route: MarketRoute,
    topic: String,
    symbol: String,
    resolution: Option<String>,
    prices: SharedPriceBook,
    sink: UpdateSink,
    tick: Duration,
}

impl Producer {
    async fn run(self, token: CancellationToken) {
        let mut ticker = interval(self.tick);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(topic = %self.topic, "Producer loop stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let payload = self.next_update();
                    if self
                        .sink
                        .send(TopicUpdate {
                            topic: self.topic.clone(),
                            payload,
                        })
                        .is_err()
                    {
                        debug!(topic = %self.topic, "Dispatcher closed, producer stopping");
                        return;
                    }
                }
            }
        }
    }

    /// 가격을 한 틱 전진시키고 업데이트 payload를 생성합니다.
    fn next_update(&self) -> Value {
        let open = self.prices.mark(&self.symbol);
        let close = random_walk(open);
        self.prices.set(&self.symbol, close);

        let now = chrono::Utc::now();
        match self.route {
            MarketRoute::Bars => json!({
                "symbol": self.symbol,
                "resolution": self.resolution,
                "time": now.timestamp(),
                "open": open,
                "high": open.max(close),
                "low": open.min(close),
                "close": close,
                "volume": rand::thread_rng().gen_range(100..100_000),
            }),
            MarketRoute::Quotes => {
                // 호가 스프레드 5bp
                let half_spread = close * Decimal::new(25, 5);
                json!({
                    "symbol": self.symbol,
                    "bid": close - half_spread,
                    "ask": close + half_spread,
                    "last": close,
                    "timestamp": now.timestamp_millis(),
                })
            }
        }
    }
}

/// 마지막 가격에서 ±20bp 구간의 다음 가격을 뽑습니다.
fn random_walk(last: Price) -> Price {
    let bps = rand::thread_rng().gen_range(-20i64..=20);
    let next = last + last * Decimal::new(bps, 4);
    if next > Decimal::ZERO {
        next
    } else {
        last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use terminal_core::domain::PriceBook;
    use terminal_pubsub::build_topic;
    use tokio::sync::mpsc;

    async fn run_for(duration: Duration) {
        let steps = (duration.as_millis() / 50).max(1);
        for _ in 0..steps {
            tokio::time::advance(Duration::from_millis(50)).await;
            for _ in 0..5 {
                tokio::task::yield_now().await;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_bars_producer_ticks_until_canceled() {
        let prices = PriceBook::seeded();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let service = MarketDataService::bars(prices, tx, Duration::from_secs(1));

        let topic =
            build_topic("bars", &json!({"resolution": "1", "symbol": "AAPL"})).unwrap();
        service.create_topic(&topic).await.unwrap();
        assert_eq!(service.producer_count().await, 1);

        run_for(Duration::from_secs(3)).await;
        let mut updates = Vec::new();
        while let Ok(update) = rx.try_recv() {
            updates.push(update);
        }
        assert!(updates.len() >= 3);
        assert!(updates.iter().all(|u| u.topic == topic.key()));
        assert_eq!(updates[0].payload["symbol"], "AAPL");
        assert_eq!(updates[0].payload["resolution"], "1");

        service.remove_topic(&topic).await;
        assert_eq!(service.producer_count().await, 0);
        run_for(Duration::from_secs(2)).await;
        while rx.try_recv().is_ok() {}
        run_for(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_quotes_update_keeps_spread_around_last() {
        let prices = PriceBook::seeded();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let service = MarketDataService::quotes(prices, tx, Duration::from_secs(1));

        let topic = build_topic("quotes", &json!({"symbol": "MSFT"})).unwrap();
        service.create_topic(&topic).await.unwrap();

        run_for(Duration::from_secs(1)).await;
        let update = rx.recv().await.unwrap();
        let bid: Decimal = update.payload["bid"].as_str().unwrap().parse().unwrap();
        let ask: Decimal = update.payload["ask"].as_str().unwrap().parse().unwrap();
        let last: Decimal = update.payload["last"].as_str().unwrap().parse().unwrap();
        assert!(bid < last && last < ask);
    }

    #[tokio::test(start_paused = true)]
    async fn test_producer_feeds_shared_price_book() {
        let prices = PriceBook::seeded();
        let before = prices.mark("TSLA");
        let (tx, _rx) = mpsc::unbounded_channel();
        let service = MarketDataService::quotes(prices.clone(), tx, Duration::from_secs(1));

        let topic = build_topic("quotes", &json!({"symbol": "TSLA"})).unwrap();
        service.create_topic(&topic).await.unwrap();
        run_for(Duration::from_secs(5)).await;

        // 틱당 ±20bp이므로 5틱 후에도 시작가 근처에 있어야 한다
        let after = prices.mark("TSLA");
        assert!(after > Decimal::ZERO);
        assert!((after - before).abs() / before < Decimal::new(5, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_params_fail_validation() {
        let prices = PriceBook::seeded();
        let (tx, _rx) = mpsc::unbounded_channel();
        let service = MarketDataService::bars(prices, tx, Duration::from_secs(1));

        let topic = build_topic("bars", &json!({"symbol": "AAPL"})).unwrap();
        let err = service.create_topic(&topic).await.unwrap_err();
        assert!(matches!(err, TerminalError::Validation(_)));
        assert_eq!(service.producer_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_superset_params_fail_validation() {
        let prices = PriceBook::seeded();
        let (tx, _rx) = mpsc::unbounded_channel();
        let service = MarketDataService::bars(prices, tx, Duration::from_secs(1));

        // 프로듀서는 정준 파라미터의 토픽에만 발행하므로 초과 필드가
        // 섞인 구독은 거부되어야 한다
        let topic = build_topic(
            "bars",
            &json!({"resolution": "1", "source": "web", "symbol": "AAPL"}),
        )
        .unwrap();
        let err = service.create_topic(&topic).await.unwrap_err();
        assert!(matches!(err, TerminalError::Validation(_)));
        assert_eq!(service.producer_count().await, 0);
    }
}
