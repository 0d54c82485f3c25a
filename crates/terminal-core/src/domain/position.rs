//! 포지션 추적.
//!
//! 포지션은 계좌+심볼 단위로 존재하며, 같은 심볼에 새 체결이
//! 도착할 때마다 재계산됩니다. 수량이 0이 되면 제거됩니다.

use crate::domain::Side;
use crate::types::{AccountId, Price, Quantity};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// 심볼의 보유량을 나타내는 포지션.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    /// 포지션 ID (`{accountId}:{symbol}`)
    pub id: String,
    /// 소유 계좌
    pub account_id: AccountId,
    /// 거래 심볼
    pub symbol: String,
    /// 포지션 방향
    pub side: Side,
    /// 현재 보유 수량
    pub quantity: Quantity,
    /// 평균 진입 가격
    pub average_price: Price,
    /// 포지션 오픈 타임스탬프
    pub opened_at: DateTime<Utc>,
    /// 마지막 업데이트 타임스탬프
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// 새 포지션을 생성합니다.
    pub fn new(
        account_id: impl Into<AccountId>,
        symbol: impl Into<String>,
        side: Side,
        quantity: Quantity,
        price: Price,
    ) -> Self {
        let account_id = account_id.into();
        let symbol = symbol.into();
        let now = Utc::now();
        Self {
            id: format!("{}:{}", account_id, symbol),
            account_id,
            symbol,
            side,
            quantity,
            average_price: price,
            opened_at: now,
            updated_at: now,
        }
    }

    /// 같은 방향의 체결을 가중 평균으로 합칩니다.
    pub fn add(&mut self, quantity: Quantity, price: Price) {
        let total_cost = self.average_price * self.quantity + price * quantity;
        self.quantity += quantity;
        if !self.quantity.is_zero() {
            self.average_price = total_cost / self.quantity;
        }
        self.updated_at = Utc::now();
    }

    /// 반대 방향의 체결로 포지션을 줄이고 실현 손익을 반환합니다.
    ///
    /// 보유 수량을 초과하는 감소 요청은 보유 수량까지만 적용됩니다.
    /// 초과분(플립)은 호출자가 새 포지션으로 처리합니다.
    pub fn reduce(&mut self, quantity: Quantity, price: Price) -> Decimal {
        let reduce_qty = quantity.min(self.quantity);
        let pnl = match self.side {
            Side::Buy => (price - self.average_price) * reduce_qty,
            Side::Sell => (self.average_price - price) * reduce_qty,
        };

        self.quantity -= reduce_qty;
        self.updated_at = Utc::now();
        pnl
    }

    /// 포지션이 청산되었는지 확인합니다.
    pub fn is_flat(&self) -> bool {
        self.quantity.is_zero()
    }

    /// 마크 가격 기준 미실현 손익을 계산합니다.
    pub fn unrealized_pnl(&self, mark: Price) -> Decimal {
        match self.side {
            Side::Buy => (mark - self.average_price) * self.quantity,
            Side::Sell => (self.average_price - mark) * self.quantity,
        }
    }

    /// 수량 0의 청산 스냅샷을 생성합니다 (제거 알림용).
    pub fn flat_snapshot(&self) -> Self {
        let mut snapshot = self.clone();
        snapshot.quantity = Decimal::ZERO;
        snapshot.updated_at = Utc::now();
        snapshot
    }
}
