//! 시스템 전반에서 사용되는 공통 타입.

use rust_decimal::Decimal;

/// 가격 값.
pub type Price = Decimal;

/// 수량 값.
pub type Quantity = Decimal;

/// 계좌 식별자.
pub type AccountId = String;

/// 주문 식별자 (계좌 내 단조 증가 카운터).
pub type OrderId = u64;
