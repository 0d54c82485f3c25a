//! 브로커 계좌 장부.
//!
//! 계좌 하나의 주문/체결/포지션/자산을 소유합니다. 모든 변경은
//! 엔진 태스크에서만 일어나므로 내부 잠금이 없습니다.

use rust_decimal::Decimal;
use std::collections::HashMap;
use terminal_core::domain::{
    EquitySnapshot, Execution, ModifyRequest, Order, OrderRequest, OrderStatus, Position,
    PriceBook,
};
use terminal_core::types::{AccountId, OrderId, Price, Quantity};
use terminal_core::{TerminalError, TerminalResult};

/// 체결 하나가 계좌에 남긴 결과.
///
/// 발행 순서(주문 → 체결 → 자산 → 포지션)는 호출자가 책임집니다.
#[derive(Debug, Clone)]
pub struct FillOutcome {
    /// 체결 반영 후의 주문
    pub order: Order,
    /// 생성된 체결 기록
    pub execution: Execution,
    /// 재계산된 자산 스냅샷
    pub equity: EquitySnapshot,
    /// 병합된 포지션 (청산 시 수량 0 스냅샷)
    pub position: Position,
}

/// 시뮬레이션 브로커 계좌.
pub struct BrokerAccount {
    account_id: AccountId,
    initial_balance: Decimal,
    realized_pl: Decimal,
    next_order_id: OrderId,
    orders: HashMap<OrderId, Order>,
    executions: Vec<Execution>,
    positions: HashMap<String, Position>,
}

impl BrokerAccount {
    /// 초기 잔고로 새 계좌를 생성합니다.
    pub fn new(account_id: impl Into<AccountId>, initial_balance: Decimal) -> Self {
        Self {
            account_id: account_id.into(),
            initial_balance,
            realized_pl: Decimal::ZERO,
            next_order_id: 1,
            orders: HashMap::new(),
            executions: Vec::new(),
            positions: HashMap::new(),
        }
    }

    /// 계좌 ID를 반환합니다.
    pub fn account_id(&self) -> &AccountId {
        &self.account_id
    }

    fn allocate_order_id(&mut self) -> OrderId {
        let id = self.next_order_id;
        self.next_order_id += 1;
        id
    }

    /// 주문을 접수하고 `Working` 상태로 전이합니다.
    ///
    /// 유효하지 않은 요청은 에러를 반환하며 주문을 만들지 않습니다 -
    /// 거부 주문을 기록하려면 [`reject`](Self::reject)를 사용합니다.
    pub fn place(&mut self, request: OrderRequest) -> TerminalResult<Order> {
        request.validate()?;

        let id = self.allocate_order_id();
        let mut order = Order::from_request(id, self.account_id.clone(), request);
        // Placing은 일시적 상태 - 접수 즉시 체결 대기로 전이한다
        order.status = OrderStatus::Working;

        self.orders.insert(id, order.clone());
        Ok(order)
    }

    /// 유효하지 않은 요청을 `Rejected` 주문으로 기록합니다.
    ///
    /// 거부 주문은 최종 상태로 생성되며 체결 대상이 아닙니다.
    pub fn reject(&mut self, request: OrderRequest) -> Order {
        let id = self.allocate_order_id();
        let mut order = Order::from_request(id, self.account_id.clone(), request);
        order.status = OrderStatus::Rejected;

        self.orders.insert(id, order.clone());
        order
    }

    /// 주문을 취소합니다. 최종 상태의 주문은 취소할 수 없습니다.
    pub fn cancel(&mut self, order_id: OrderId) -> TerminalResult<Order> {
        let order = self.order_mut(order_id)?;
        if order.status.is_terminal() {
            return Err(TerminalError::Order(format!(
                "order {} cannot be canceled in status {}",
                order_id, order.status
            )));
        }

        order.status = OrderStatus::Canceled;
        order.updated_at = chrono::Utc::now();
        Ok(order.clone())
    }

    /// 미체결 주문의 수량/가격을 수정합니다.
    ///
    /// 새 수량은 이미 체결된 수량보다 작을 수 없습니다.
    pub fn modify(&mut self, order_id: OrderId, request: ModifyRequest) -> TerminalResult<Order> {
        let order = self.order_mut(order_id)?;
        if order.status.is_terminal() {
            return Err(TerminalError::Order(format!(
                "order {} cannot be modified in status {}",
                order_id, order.status
            )));
        }

        if let Some(quantity) = request.quantity {
            if quantity <= Decimal::ZERO || quantity < order.filled_quantity {
                return Err(TerminalError::Order(format!(
                    "invalid modified quantity {} for order {}",
                    quantity, order_id
                )));
            }
            order.quantity = quantity;
        }
        if let Some(limit_price) = request.limit_price {
            order.limit_price = Some(limit_price);
        }
        if let Some(stop_price) = request.stop_price {
            order.stop_price = Some(stop_price);
        }
        order.updated_at = chrono::Utc::now();
        Ok(order.clone())
    }

    /// 주문을 조회합니다.
    pub fn order(&self, order_id: OrderId) -> Option<&Order> {
        self.orders.get(&order_id)
    }

    fn order_mut(&mut self, order_id: OrderId) -> TerminalResult<&mut Order> {
        self.orders
            .get_mut(&order_id)
            .ok_or_else(|| TerminalError::NotFound(format!("order {}", order_id)))
    }

    /// 체결 대기 중인 주문 ID 목록을 반환합니다.
    pub fn fillable_order_ids(&self) -> Vec<OrderId> {
        self.orders
            .values()
            .filter(|o| o.status.is_fillable())
            .map(|o| o.id)
            .collect()
    }

    /// 심볼의 포지션을 조회합니다.
    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    /// 체결을 계좌에 반영합니다.
    ///
    /// 주문 갱신, 체결 기록 추가, 포지션 병합, 자산 재계산을 하나의
    /// 원자적 단계로 수행합니다. 어느 단계든 실패하면 계좌는 변경되지
    /// 않습니다.
    pub fn fill_order(
        &mut self,
        order_id: OrderId,
        quantity: Quantity,
        price: Price,
        prices: &PriceBook,
    ) -> TerminalResult<FillOutcome> {
        let order = self.order_mut(order_id)?;
        let symbol = order.symbol.clone();
        let side = order.side;

        order.apply_fill(quantity, price)?;
        let order = order.clone();

        let execution = Execution::new(
            self.account_id.clone(),
            order_id,
            symbol.clone(),
            side,
            quantity,
            price,
        );
        self.executions.push(execution.clone());

        let position = self.merge_position(&symbol, side, quantity, price);
        let equity = self.equity(prices);

        Ok(FillOutcome {
            order,
            execution,
            equity,
            position,
        })
    }

    /// 체결을 포지션에 병합합니다.
    ///
    /// 같은 방향이면 가중 평균으로 합치고, 반대 방향이면 줄인 뒤
    /// 초과분은 반대 포지션으로 플립합니다. 수량 0이 된 포지션은
    /// 제거되고 수량 0 스냅샷이 반환됩니다.
    fn merge_position(
        &mut self,
        symbol: &str,
        side: terminal_core::domain::Side,
        quantity: Quantity,
        price: Price,
    ) -> Position {
        match self.positions.get_mut(symbol) {
            Some(position) if position.side == side => {
                position.add(quantity, price);
                position.clone()
            }
            Some(position) => {
                let flip_quantity = quantity - position.quantity.min(quantity);
                self.realized_pl += position.reduce(quantity, price);

                if position.is_flat() {
                    let flat = position.flat_snapshot();
                    self.positions.remove(symbol);

                    if flip_quantity > Decimal::ZERO {
                        let flipped = Position::new(
                            self.account_id.clone(),
                            symbol,
                            side,
                            flip_quantity,
                            price,
                        );
                        self.positions.insert(symbol.to_string(), flipped.clone());
                        flipped
                    } else {
                        flat
                    }
                } else {
                    position.clone()
                }
            }
            None => {
                let position =
                    Position::new(self.account_id.clone(), symbol, side, quantity, price);
                self.positions.insert(symbol.to_string(), position.clone());
                position
            }
        }
    }

    /// 현재 마크 가격으로 자산 스냅샷을 재계산합니다.
    ///
    /// `잔고 = 초기 잔고 + 누적 실현 손익`,
    /// `자산 = 잔고 + 모든 열린 포지션의 미실현 손익 합`.
    pub fn equity(&self, prices: &PriceBook) -> EquitySnapshot {
        let balance = self.initial_balance + self.realized_pl;
        let unrealized_pl: Decimal = self
            .positions
            .values()
            .map(|p| p.unrealized_pnl(prices.mark(&p.symbol)))
            .sum();

        EquitySnapshot {
            account_id: self.account_id.clone(),
            balance,
            equity: balance + unrealized_pl,
            unrealized_pl,
            realized_pl: self.realized_pl,
            updated_at: chrono::Utc::now(),
        }
    }

    /// 주문 목록 스냅샷 (ID 순).
    pub fn orders_snapshot(&self) -> Vec<Order> {
        let mut orders: Vec<Order> = self.orders.values().cloned().collect();
        orders.sort_by_key(|o| o.id);
        orders
    }

    /// 체결 목록 스냅샷 (발생 순).
    pub fn executions_snapshot(&self) -> Vec<Execution> {
        self.executions.clone()
    }

    /// 열린 포지션 스냅샷.
    pub fn positions_snapshot(&self) -> Vec<Position> {
        let mut positions: Vec<Position> = self.positions.values().cloned().collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        positions
    }
}
