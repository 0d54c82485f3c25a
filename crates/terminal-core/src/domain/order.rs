//! 주문 타입 및 상태 기계.
//!
//! 이 모듈은 브로커 시뮬레이션의 주문 관련 타입을 정의합니다:
//! - `Side` - 주문 방향 (매수/매도)
//! - `OrderType` - 주문 유형 (시장가, 지정가, 스톱 등)
//! - `OrderStatus` - 주문 상태 기계
//! - `OrderRequest` - 주문 요청
//! - `ModifyRequest` - 주문 수정 요청
//! - `Order` - 주문 엔티티

use crate::error::{TerminalError, TerminalResult};
use crate::types::{AccountId, OrderId, Price, Quantity};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// 주문 방향 (매수 또는 매도).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// 매수
    Buy,
    /// 매도
    Sell,
}

impl Side {
    /// 반대 방향을 반환합니다.
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// 주문 유형.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    /// 시장가 주문 - 현재 마크 가격으로 체결
    Market,
    /// 지정가 주문 - 지정 가격에서 체결
    Limit,
    /// 스톱 주문
    Stop,
    /// 지정가 스톱 주문
    StopLimit,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderType::Market => write!(f, "MARKET"),
            OrderType::Limit => write!(f, "LIMIT"),
            OrderType::Stop => write!(f, "STOP"),
            OrderType::StopLimit => write!(f, "STOP_LIMIT"),
        }
    }
}

/// 주문 상태.
///
/// 상태 전이: `Placing → Working → {Filled | PartiallyFilled → Filled |
/// Canceled | Rejected}`. `Placing`은 생성 직후의 일시적 상태입니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// 주문 생성됨 (스케줄러가 관찰하기 전의 일시적 상태)
    Placing,
    /// 체결 대기 중
    Working,
    /// 부분 체결됨
    PartiallyFilled,
    /// 전량 체결됨
    Filled,
    /// 취소됨
    Canceled,
    /// 거부됨
    Rejected,
}

impl OrderStatus {
    /// 주문이 최종 상태인지 확인합니다. 최종 상태에서는
    /// 더 이상의 전이도 체결도 발생하지 않습니다.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected
        )
    }

    /// 주문이 체결 대상인지 확인합니다.
    pub fn is_fillable(&self) -> bool {
        matches!(self, OrderStatus::Working | OrderStatus::PartiallyFilled)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderStatus::Placing => write!(f, "PLACING"),
            OrderStatus::Working => write!(f, "WORKING"),
            OrderStatus::PartiallyFilled => write!(f, "PARTIALLY_FILLED"),
            OrderStatus::Filled => write!(f, "FILLED"),
            OrderStatus::Canceled => write!(f, "CANCELED"),
            OrderStatus::Rejected => write!(f, "REJECTED"),
        }
    }
}

/// 새 주문 생성을 위한 주문 요청.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    /// 거래 심볼
    pub symbol: String,
    /// 주문 방향
    pub side: Side,
    /// 주문 유형
    #[serde(rename = "type")]
    pub order_type: OrderType,
    /// 거래 수량
    pub quantity: Quantity,
    /// 지정가 (지정가 주문에 필수)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<Price>,
    /// 스톱 가격 (스톱 주문에 필수)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<Price>,
}

impl OrderRequest {
    /// 시장가 매수 주문을 생성합니다.
    pub fn market_buy(symbol: impl Into<String>, quantity: Quantity) -> Self {
        Self {
            symbol: symbol.into(),
            side: Side::Buy,
            order_type: OrderType::Market,
            quantity,
            limit_price: None,
            stop_price: None,
        }
    }

    /// 시장가 매도 주문을 생성합니다.
    pub fn market_sell(symbol: impl Into<String>, quantity: Quantity) -> Self {
        Self {
            symbol: symbol.into(),
            side: Side::Sell,
            order_type: OrderType::Market,
            quantity,
            limit_price: None,
            stop_price: None,
        }
    }

    /// 지정가 주문을 생성합니다.
    pub fn limit(
        symbol: impl Into<String>,
        side: Side,
        quantity: Quantity,
        price: Price,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Limit,
            quantity,
            limit_price: Some(price),
            stop_price: None,
        }
    }

    /// 요청이 유효한 주문을 기술하는지 확인합니다.
    pub fn validate(&self) -> TerminalResult<()> {
        if self.symbol.trim().is_empty() {
            return Err(TerminalError::Order("symbol must not be empty".to_string()));
        }
        if self.quantity <= Decimal::ZERO {
            return Err(TerminalError::Order(format!(
                "quantity must be positive, got {}",
                self.quantity
            )));
        }
        match self.order_type {
            OrderType::Limit | OrderType::StopLimit if self.limit_price.is_none() => {
                Err(TerminalError::Order(format!(
                    "{} order requires a limit price",
                    self.order_type
                )))
            }
            OrderType::Stop | OrderType::StopLimit if self.stop_price.is_none() => {
                Err(TerminalError::Order(format!(
                    "{} order requires a stop price",
                    self.order_type
                )))
            }
            _ => Ok(()),
        }
    }
}

/// 주문 수정 요청. `None` 필드는 그대로 유지됩니다.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifyRequest {
    /// 새 수량
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantity: Option<Quantity>,
    /// 새 지정가
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<Price>,
    /// 새 스톱 가격
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<Price>,
}

/// 브로커 계좌가 소유하는 주문 엔티티.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    /// 주문 ID (계좌 내 단조 증가)
    pub id: OrderId,
    /// 소유 계좌
    pub account_id: AccountId,
    /// 거래 심볼
    pub symbol: String,
    /// 주문 방향
    pub side: Side,
    /// 주문 유형
    #[serde(rename = "type")]
    pub order_type: OrderType,
    /// 요청 수량
    pub quantity: Quantity,
    /// 체결된 수량
    pub filled_quantity: Quantity,
    /// 현재 상태
    pub status: OrderStatus,
    /// 지정가
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<Price>,
    /// 스톱 가격
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<Price>,
    /// 평균 체결 가격
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_fill_price: Option<Price>,
    /// 생성 타임스탬프
    pub created_at: DateTime<Utc>,
    /// 마지막 업데이트 타임스탬프
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// 요청으로부터 새 주문을 생성합니다. 상태는 `Placing`입니다.
    pub fn from_request(id: OrderId, account_id: impl Into<AccountId>, request: OrderRequest) -> Self {
        let now = Utc::now();
        Self {
            id,
            account_id: account_id.into(),
            symbol: request.symbol,
            side: request.side,
            order_type: request.order_type,
            quantity: request.quantity,
            filled_quantity: Decimal::ZERO,
            status: OrderStatus::Placing,
            limit_price: request.limit_price,
            stop_price: request.stop_price,
            average_fill_price: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 남은 체결 수량을 반환합니다.
    pub fn remaining_quantity(&self) -> Quantity {
        self.quantity - self.filled_quantity
    }

    /// 체결을 주문에 반영합니다.
    ///
    /// 체결 수량과 평균 체결 가격을 갱신하고, 전량 체결이면 `Filled`,
    /// 아니면 `PartiallyFilled`로 전이합니다.
    pub fn apply_fill(&mut self, quantity: Quantity, price: Price) -> TerminalResult<()> {
        if !self.status.is_fillable() {
            return Err(TerminalError::Order(format!(
                "order {} is not fillable in status {}",
                self.id, self.status
            )));
        }
        if quantity <= Decimal::ZERO || quantity > self.remaining_quantity() {
            return Err(TerminalError::Order(format!(
                "fill quantity {} out of range for order {}",
                quantity, self.id
            )));
        }

        let old_filled = self.filled_quantity;
        let new_filled = old_filled + quantity;

        self.average_fill_price = Some(match self.average_fill_price {
            Some(old_avg) => (old_avg * old_filled + price * quantity) / new_filled,
            None => price,
        });
        self.filled_quantity = new_filled;
        self.status = if new_filled >= self.quantity {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        self.updated_at = Utc::now();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_request_validation() {
        let ok = OrderRequest::market_buy("AAPL", dec!(100));
        assert!(ok.validate().is_ok());

        let zero_qty = OrderRequest::market_buy("AAPL", dec!(0));
        assert!(zero_qty.validate().is_err());

        let mut no_limit = OrderRequest::market_buy("AAPL", dec!(10));
        no_limit.order_type = OrderType::Limit;
        assert!(no_limit.validate().is_err());
    }

    #[test]
    fn test_status_machine() {
        assert!(OrderStatus::Working.is_fillable());
        assert!(OrderStatus::PartiallyFilled.is_fillable());
        assert!(!OrderStatus::Placing.is_fillable());

        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Canceled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(!OrderStatus::Working.is_terminal());
    }

    #[test]
    fn test_apply_fill_full() {
        let request = OrderRequest::market_buy("AAPL", dec!(100));
        let mut order = Order::from_request(1, "ACC-1", request);
        order.status = OrderStatus::Working;

        order.apply_fill(dec!(100), dec!(190)).unwrap();

        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.filled_quantity, dec!(100));
        assert_eq!(order.average_fill_price, Some(dec!(190)));
        assert_eq!(order.remaining_quantity(), dec!(0));
    }

    #[test]
    fn test_apply_fill_partial_then_average() {
        let request = OrderRequest::market_buy("AAPL", dec!(100));
        let mut order = Order::from_request(1, "ACC-1", request);
        order.status = OrderStatus::Working;

        order.apply_fill(dec!(50), dec!(190)).unwrap();
        assert_eq!(order.status, OrderStatus::PartiallyFilled);

        order.apply_fill(dec!(50), dec!(192)).unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        // 평균가: (190*50 + 192*50) / 100 = 191
        assert_eq!(order.average_fill_price, Some(dec!(191)));
    }

    #[test]
    fn test_fill_rejected_in_terminal_state() {
        let request = OrderRequest::market_buy("AAPL", dec!(100));
        let mut order = Order::from_request(1, "ACC-1", request);
        order.status = OrderStatus::Canceled;

        assert!(order.apply_fill(dec!(100), dec!(190)).is_err());
    }
}
