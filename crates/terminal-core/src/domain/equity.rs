//! 계좌 자산 스냅샷.

use crate::types::AccountId;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// 계좌 자산 스냅샷. 모든 체결 후와 주기적 틱마다 재계산됩니다.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquitySnapshot {
    /// 소유 계좌
    #[serde(rename = "accountId")]
    pub account_id: AccountId,
    /// 현금 잔고 (초기 잔고 + 누적 실현 손익)
    pub balance: Decimal,
    /// 총 자산 (잔고 + 미실현 손익)
    pub equity: Decimal,
    /// 미실현 손익
    #[serde(rename = "unrealizedPL")]
    pub unrealized_pl: Decimal,
    /// 실현 손익
    #[serde(rename = "realizedPL")]
    pub realized_pl: Decimal,
    /// 계산 시각
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

impl EquitySnapshot {
    /// 초기 잔고로 스냅샷을 생성합니다.
    pub fn initial(account_id: impl Into<AccountId>, balance: Decimal) -> Self {
        Self {
            account_id: account_id.into(),
            balance,
            equity: balance,
            unrealized_pl: Decimal::ZERO,
            realized_pl: Decimal::ZERO,
            updated_at: Utc::now(),
        }
    }
}
