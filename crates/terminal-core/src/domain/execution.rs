//! 체결 기록.

use crate::domain::Side;
use crate::types::{AccountId, OrderId, Price, Quantity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 불변 체결 기록. 체결 이벤트마다 추가되며 절대 수정되지 않습니다.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    /// 체결 ID
    pub id: Uuid,
    /// 소유 계좌
    pub account_id: AccountId,
    /// 체결을 생성한 주문
    pub order_id: OrderId,
    /// 거래 심볼
    pub symbol: String,
    /// 체결 방향
    pub side: Side,
    /// 체결 수량
    pub quantity: Quantity,
    /// 체결 가격
    pub price: Price,
    /// 체결 시각
    pub timestamp: DateTime<Utc>,
}

impl Execution {
    /// 새 체결 기록을 생성합니다.
    pub fn new(
        account_id: impl Into<AccountId>,
        order_id: OrderId,
        symbol: impl Into<String>,
        side: Side,
        quantity: Quantity,
        price: Price,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id: account_id.into(),
            order_id,
            symbol: symbol.into(),
            side,
            quantity,
            price,
            timestamp: Utc::now(),
        }
    }
}
