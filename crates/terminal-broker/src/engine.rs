//! 브로커 엔진 태스크.
//!
//! 모든 계좌를 단일 태스크가 배타적으로 소유합니다. 외부에서는
//! 커맨드 채널([`BrokerHandle`])로 명령을 넣거나 스냅샷을 읽을 수만
//! 있습니다. 체결 스케줄러는 대기 주문마다 개별 데드라인을 두고
//! 매 검사 후 [1s, 2s) 구간에서 다시 무작위화합니다.

use crate::account::{BrokerAccount, FillOutcome};
use async_trait::async_trait;
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use terminal_core::config::BrokerConfig;
use terminal_core::domain::{
    EquitySnapshot, Execution, ModifyRequest, Order, OrderRequest, OrderType, Position,
    SharedPriceBook,
};
use terminal_core::types::{AccountId, OrderId, Price};
use terminal_core::{TerminalError, TerminalResult};
use terminal_pubsub::{build_topic, DataService, Topic, TopicUpdate, UpdateSink};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, interval_at, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// 체결 스케줄러의 데드라인 검사 주기.
const SCAN_INTERVAL: Duration = Duration::from_millis(100);
/// 부분 체결 확률.
const PARTIAL_FILL_PROBABILITY: f64 = 0.2;

/// 브로커 라우트 구독 파라미터.
///
/// 알 수 없는 필드는 거부됩니다 - 엔진은 정준 파라미터의 토픽에만
/// 발행하므로, 초과 필드가 섞인 토픽은 업데이트를 받을 수 없습니다.
#[derive(Debug, Clone, Deserialize, Serialize, validator::Validate)]
#[serde(deny_unknown_fields)]
pub struct AccountParams {
    /// 대상 계좌
    #[serde(rename = "accountId")]
    #[validate(length(min = 1))]
    pub account_id: String,
}

/// 계좌 상태의 읽기 전용 스냅샷.
#[derive(Debug, Clone, Serialize)]
pub struct AccountSnapshot {
    /// 모든 주문 (ID 순)
    pub orders: Vec<Order>,
    /// 모든 체결 (발생 순)
    pub executions: Vec<Execution>,
    /// 열린 포지션
    pub positions: Vec<Position>,
    /// 현재 자산
    pub equity: EquitySnapshot,
}

/// 엔진 태스크로 보내는 커맨드.
#[derive(Debug)]
pub enum BrokerCommand {
    /// 주문 접수
    PlaceOrder {
        account_id: AccountId,
        request: OrderRequest,
        reply: oneshot::Sender<TerminalResult<Order>>,
    },
    /// 주문 수정
    ModifyOrder {
        account_id: AccountId,
        order_id: OrderId,
        request: ModifyRequest,
        reply: oneshot::Sender<TerminalResult<Order>>,
    },
    /// 주문 취소
    CancelOrder {
        account_id: AccountId,
        order_id: OrderId,
        reply: oneshot::Sender<TerminalResult<Order>>,
    },
    /// 포지션 청산 (반대 방향 시장가 주문, 즉시 체결)
    ClosePosition {
        account_id: AccountId,
        symbol: String,
        reply: oneshot::Sender<TerminalResult<Order>>,
    },
    /// 계좌 스냅샷 조회
    Snapshot {
        account_id: AccountId,
        reply: oneshot::Sender<TerminalResult<AccountSnapshot>>,
    },
    /// 계좌 지연 생성
    EnsureAccount {
        account_id: AccountId,
        reply: oneshot::Sender<TerminalResult<()>>,
    },
}

/// 엔진 커맨드 채널의 외부 핸들.
#[derive(Clone)]
pub struct BrokerHandle {
    commands: mpsc::UnboundedSender<BrokerCommand>,
}

impl BrokerHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<TerminalResult<T>>) -> BrokerCommand,
    ) -> TerminalResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| TerminalError::Internal("broker engine stopped".to_string()))?;
        rx.await
            .map_err(|_| TerminalError::Internal("broker engine dropped reply".to_string()))?
    }

    /// 주문을 접수합니다. 유효하지 않은 요청은 `Rejected` 주문으로
    /// 기록되어 반환됩니다.
    pub async fn place_order(
        &self,
        account_id: impl Into<AccountId>,
        request: OrderRequest,
    ) -> TerminalResult<Order> {
        let account_id = account_id.into();
        self.request(|reply| BrokerCommand::PlaceOrder {
            account_id,
            request,
            reply,
        })
        .await
    }

    /// 미체결 주문을 수정합니다.
    pub async fn modify_order(
        &self,
        account_id: impl Into<AccountId>,
        order_id: OrderId,
        request: ModifyRequest,
    ) -> TerminalResult<Order> {
        let account_id = account_id.into();
        self.request(|reply| BrokerCommand::ModifyOrder {
            account_id,
            order_id,
            request,
            reply,
        })
        .await
    }

    /// 미체결 주문을 취소합니다.
    pub async fn cancel_order(
        &self,
        account_id: impl Into<AccountId>,
        order_id: OrderId,
    ) -> TerminalResult<Order> {
        let account_id = account_id.into();
        self.request(|reply| BrokerCommand::CancelOrder {
            account_id,
            order_id,
            reply,
        })
        .await
    }

    /// 포지션을 현재 마크 가격으로 청산합니다.
    pub async fn close_position(
        &self,
        account_id: impl Into<AccountId>,
        symbol: impl Into<String>,
    ) -> TerminalResult<Order> {
        let account_id = account_id.into();
        let symbol = symbol.into();
        self.request(|reply| BrokerCommand::ClosePosition {
            account_id,
            symbol,
            reply,
        })
        .await
    }

    /// 계좌 스냅샷을 읽습니다.
    pub async fn snapshot(&self, account_id: impl Into<AccountId>) -> TerminalResult<AccountSnapshot> {
        let account_id = account_id.into();
        self.request(|reply| BrokerCommand::Snapshot { account_id, reply })
            .await
    }

    /// 계좌를 지연 생성합니다. 이미 있으면 no-op입니다.
    pub async fn ensure_account(&self, account_id: impl Into<AccountId>) -> TerminalResult<()> {
        let account_id = account_id.into();
        self.request(|reply| BrokerCommand::EnsureAccount { account_id, reply })
            .await
    }
}

/// 브로커 라우트별 업데이트 싱크.
#[derive(Clone)]
pub struct BrokerSinks {
    /// `orders` 라우트
    pub orders: UpdateSink,
    /// `executions` 라우트
    pub executions: UpdateSink,
    /// `positions` 라우트
    pub positions: UpdateSink,
    /// `equity` 라우트
    pub equity: UpdateSink,
}

/// 계좌별 정준 토픽 키. 계좌 생성 시 한 번 계산해 캐시합니다.
#[derive(Debug, Clone)]
struct AccountTopics {
    orders: String,
    executions: String,
    positions: String,
    equity: String,
}

impl AccountTopics {
    fn build(account_id: &str) -> TerminalResult<Self> {
        let params = serde_json::json!({ "accountId": account_id });
        Ok(Self {
            orders: build_topic("orders", &params)?.key().to_string(),
            executions: build_topic("executions", &params)?.key().to_string(),
            positions: build_topic("positions", &params)?.key().to_string(),
            equity: build_topic("equity", &params)?.key().to_string(),
        })
    }
}

struct AccountEntry {
    account: BrokerAccount,
    topics: AccountTopics,
}

/// 브로커 엔진 태스크.
pub struct BrokerEngine {
    config: BrokerConfig,
    prices: SharedPriceBook,
    sinks: BrokerSinks,
    commands: mpsc::UnboundedReceiver<BrokerCommand>,
    accounts: HashMap<AccountId, AccountEntry>,
    /// 주문별 다음 체결 검사 데드라인
    deadlines: HashMap<(AccountId, OrderId), Instant>,
}

impl BrokerEngine {
    /// 엔진과 커맨드 핸들을 생성합니다.
    pub fn new(
        config: BrokerConfig,
        prices: SharedPriceBook,
        sinks: BrokerSinks,
    ) -> (Self, BrokerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                config,
                prices,
                sinks,
                commands: rx,
                accounts: HashMap::new(),
                deadlines: HashMap::new(),
            },
            BrokerHandle { commands: tx },
        )
    }

    /// 커맨드 채널이 닫힐 때까지 엔진을 실행합니다.
    ///
    /// 구성 루트에서 `tokio::spawn`으로 실행합니다.
    pub async fn run(mut self) {
        let mut scan = interval(SCAN_INTERVAL);
        scan.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // 첫 틱이 즉시 발화하지 않게 한 주기 뒤에서 시작한다 -
        // 시작 직후의 커맨드 처리와 경합해 비결정적으로 빈 틱/초과
        // 틱이 발행되는 것을 막는다
        let equity_period = Duration::from_millis(self.config.equity_tick_ms);
        let mut equity_tick = interval_at(Instant::now() + equity_period, equity_period);
        equity_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                _ = scan.tick() => self.scan_due_orders(),
                _ = equity_tick.tick() => self.publish_periodic_equity(),
            }
        }
        info!("Broker command channel closed, engine stopping");
    }

    fn handle_command(&mut self, command: BrokerCommand) {
        match command {
            BrokerCommand::PlaceOrder {
                account_id,
                request,
                reply,
            } => {
                let _ = reply.send(self.place_order(account_id, request));
            }
            BrokerCommand::ModifyOrder {
                account_id,
                order_id,
                request,
                reply,
            } => {
                let _ = reply.send(self.modify_order(&account_id, order_id, request));
            }
            BrokerCommand::CancelOrder {
                account_id,
                order_id,
                reply,
            } => {
                let _ = reply.send(self.cancel_order(&account_id, order_id));
            }
            BrokerCommand::ClosePosition {
                account_id,
                symbol,
                reply,
            } => {
                let _ = reply.send(self.close_position(&account_id, &symbol));
            }
            BrokerCommand::Snapshot { account_id, reply } => {
                let _ = reply.send(self.snapshot(&account_id));
            }
            BrokerCommand::EnsureAccount { account_id, reply } => {
                let _ = reply.send(self.ensure_account(&account_id).map(|_| ()));
            }
        }
    }

    fn ensure_account(&mut self, account_id: &str) -> TerminalResult<&mut AccountEntry> {
        if !self.accounts.contains_key(account_id) {
            let topics = AccountTopics::build(account_id)?;
            let account = BrokerAccount::new(account_id, self.config.initial_balance);
            info!(account_id = %account_id, "Broker account created");
            self.accounts
                .insert(account_id.to_string(), AccountEntry { account, topics });
        }
        self.accounts
            .get_mut(account_id)
            .ok_or_else(|| TerminalError::Internal(format!("account {} vanished", account_id)))
    }

    fn place_order(&mut self, account_id: AccountId, request: OrderRequest) -> TerminalResult<Order> {
        let entry = self.ensure_account(&account_id)?;

        if let Err(e) = request.validate() {
            // 유효하지 않은 주문은 Rejected로 기록되고 스케줄되지 않는다
            let order = entry.account.reject(request);
            let topic = entry.topics.orders.clone();
            warn!(
                account_id = %account_id,
                order_id = order.id,
                error = %e,
                "Order rejected"
            );
            self.publish(&self.sinks.orders, &topic, &order);
            return Ok(order);
        }

        let order = entry.account.place(request)?;
        let topic = entry.topics.orders.clone();
        info!(
            account_id = %account_id,
            order_id = order.id,
            symbol = %order.symbol,
            side = %order.side,
            quantity = %order.quantity,
            "Order placed"
        );
        self.publish(&self.sinks.orders, &topic, &order);

        self.deadlines.insert(
            (account_id, order.id),
            Instant::now() + self.random_fill_delay(),
        );
        Ok(order)
    }

    fn modify_order(
        &mut self,
        account_id: &str,
        order_id: OrderId,
        request: ModifyRequest,
    ) -> TerminalResult<Order> {
        let entry = self
            .accounts
            .get_mut(account_id)
            .ok_or_else(|| TerminalError::NotFound(format!("account {}", account_id)))?;

        // 스케줄러를 거치지 않는 동기 처리 - 체결은 절대 생성되지 않는다
        let order = entry.account.modify(order_id, request)?;
        let topic = entry.topics.orders.clone();
        self.publish(&self.sinks.orders, &topic, &order);
        Ok(order)
    }

    fn cancel_order(&mut self, account_id: &str, order_id: OrderId) -> TerminalResult<Order> {
        let entry = self
            .accounts
            .get_mut(account_id)
            .ok_or_else(|| TerminalError::NotFound(format!("account {}", account_id)))?;

        let order = entry.account.cancel(order_id)?;
        let topic = entry.topics.orders.clone();
        self.deadlines.remove(&(account_id.to_string(), order_id));
        info!(account_id = %account_id, order_id, "Order canceled");
        self.publish(&self.sinks.orders, &topic, &order);
        Ok(order)
    }

    fn close_position(&mut self, account_id: &str, symbol: &str) -> TerminalResult<Order> {
        let price = self.prices.mark(symbol);
        let prices = self.prices.clone();
        let entry = self
            .accounts
            .get_mut(account_id)
            .ok_or_else(|| TerminalError::NotFound(format!("account {}", account_id)))?;

        let position = entry
            .account
            .position(symbol)
            .cloned()
            .ok_or_else(|| TerminalError::NotFound(format!("position {}:{}", account_id, symbol)))?;

        let request = OrderRequest {
            symbol: symbol.to_string(),
            side: position.side.opposite(),
            order_type: OrderType::Market,
            quantity: position.quantity,
            limit_price: None,
            stop_price: None,
        };

        // 청산은 스케줄러를 거치지 않고 현재 마크 가격에 즉시 체결된다
        let working = entry.account.place(request)?;
        let outcome = entry
            .account
            .fill_order(working.id, position.quantity, price, &prices)?;
        let topics = entry.topics.clone();

        info!(
            account_id = %account_id,
            symbol = %symbol,
            order_id = working.id,
            "Position closed"
        );
        self.publish(&self.sinks.orders, &topics.orders, &working);
        self.publish_fill(&topics, &outcome);
        Ok(outcome.order)
    }

    fn snapshot(&mut self, account_id: &str) -> TerminalResult<AccountSnapshot> {
        let prices = self.prices.clone();
        let entry = self.ensure_account(account_id)?;
        Ok(AccountSnapshot {
            orders: entry.account.orders_snapshot(),
            executions: entry.account.executions_snapshot(),
            positions: entry.account.positions_snapshot(),
            equity: entry.account.equity(&prices),
        })
    }

    /// 데드라인이 지난 주문들의 체결을 시도합니다.
    fn scan_due_orders(&mut self) {
        let now = Instant::now();
        let due: Vec<(AccountId, OrderId)> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();

        for (account_id, order_id) in due {
            self.try_fill(&account_id, order_id);
        }
    }

    /// 주문 하나의 체결을 시도합니다.
    ///
    /// 실패는 해당 주문에만 격리됩니다 - 로그를 남기고 데드라인을
    /// 다시 무작위화할 뿐, 주문 상태와 다른 주문에는 영향을 주지
    /// 않습니다.
    fn try_fill(&mut self, account_id: &str, order_id: OrderId) {
        let key = (account_id.to_string(), order_id);
        let prices = self.prices.clone();

        let Some(entry) = self.accounts.get_mut(account_id) else {
            self.deadlines.remove(&key);
            return;
        };
        let Some(order) = entry.account.order(order_id).cloned() else {
            self.deadlines.remove(&key);
            return;
        };
        if !order.status.is_fillable() {
            self.deadlines.remove(&key);
            return;
        }

        let price = fill_price(&order, &prices);
        let remaining = order.remaining_quantity();
        let quantity = if remaining > Decimal::ONE
            && rand::thread_rng().gen_bool(PARTIAL_FILL_PROBABILITY)
        {
            remaining / Decimal::TWO
        } else {
            remaining
        };

        match entry.account.fill_order(order_id, quantity, price, &prices) {
            Ok(outcome) => {
                let topics = entry.topics.clone();
                debug!(
                    account_id = %account_id,
                    order_id,
                    status = %outcome.order.status,
                    quantity = %quantity,
                    price = %price,
                    "Order filled"
                );
                if outcome.order.status.is_fillable() {
                    // 부분 체결 - 데드라인을 다시 무작위화한다
                    self.deadlines
                        .insert(key, Instant::now() + self.random_fill_delay());
                } else {
                    self.deadlines.remove(&key);
                }
                self.publish_fill(&topics, &outcome);
            }
            Err(e) => self.contain_fill_failure(key, e),
        }
    }

    /// 체결 실패를 해당 주문에 격리합니다.
    ///
    /// 주문은 이전 상태 그대로 스케줄에 남아 다음 데드라인에서
    /// 재시도됩니다.
    fn contain_fill_failure(&mut self, key: (AccountId, OrderId), error: TerminalError) {
        let error = TerminalError::Producer(format!("fill failed: {}", error));
        warn!(account_id = %key.0, order_id = key.1, error = %error, "Fill attempt failed");
        self.deadlines
            .insert(key, Instant::now() + self.random_fill_delay());
    }

    /// 주기적 자산 재계산을 모든 계좌에 발행합니다.
    fn publish_periodic_equity(&mut self) {
        let prices = self.prices.clone();
        for entry in self.accounts.values() {
            let equity = entry.account.equity(&prices);
            self.publish(&self.sinks.equity, &entry.topics.equity, &equity);
        }
    }

    fn random_fill_delay(&self) -> Duration {
        let min = self.config.fill_delay_min_ms;
        let max = self.config.fill_delay_max_ms;
        let millis = if max > min {
            rand::thread_rng().gen_range(min..max)
        } else {
            min
        };
        Duration::from_millis(millis)
    }

    /// 체결 결과를 고정 순서로 발행합니다:
    /// 주문 → 체결 → 자산 → 포지션.
    fn publish_fill(&self, topics: &AccountTopics, outcome: &FillOutcome) {
        self.publish(&self.sinks.orders, &topics.orders, &outcome.order);
        self.publish(&self.sinks.executions, &topics.executions, &outcome.execution);
        self.publish(&self.sinks.equity, &topics.equity, &outcome.equity);
        self.publish(&self.sinks.positions, &topics.positions, &outcome.position);
    }

    fn publish<T: Serialize>(&self, sink: &UpdateSink, topic: &str, payload: &T) {
        match serde_json::to_value(payload) {
            Ok(value) => {
                if sink
                    .send(TopicUpdate {
                        topic: topic.to_string(),
                        payload: value,
                    })
                    .is_err()
                {
                    debug!(topic = %topic, "Dispatcher closed, dropping update");
                }
            }
            Err(e) => warn!(topic = %topic, error = %e, "Failed to encode update payload"),
        }
    }
}

/// 주문의 체결 가격을 결정합니다.
///
/// 지정가 주문은 지정 가격, 그 외에는 현재 마크 가격입니다.
fn fill_price(order: &Order, prices: &terminal_core::domain::PriceBook) -> Price {
    match order.order_type {
        OrderType::Limit | OrderType::StopLimit => order
            .limit_price
            .unwrap_or_else(|| prices.mark(&order.symbol)),
        OrderType::Market | OrderType::Stop => prices.mark(&order.symbol),
    }
}

/// `orders`/`executions`/`positions`/`equity` 라우트의 데이터 서비스.
///
/// 첫 구독 시 계좌를 지연 생성합니다. 계좌는 프로세스 수명 동안
/// 유지되므로 마지막 구독 해제는 프로듀서를 따로 중지하지 않습니다.
pub struct BrokerDataService {
    handle: BrokerHandle,
}

impl BrokerDataService {
    /// 새 서비스를 생성합니다.
    pub fn new(handle: BrokerHandle) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl DataService for BrokerDataService {
    async fn create_topic(&self, topic: &Topic) -> TerminalResult<()> {
        let params: AccountParams = serde_json::from_value(topic.params().clone())
            .map_err(|e| TerminalError::Validation(e.to_string()))?;
        self.handle.ensure_account(params.account_id).await
    }

    async fn remove_topic(&self, topic: &Topic) {
        // 계좌 상태는 재구독을 위해 유지된다
        debug!(topic = %topic, "Broker topic released, account state retained");
    }
}
