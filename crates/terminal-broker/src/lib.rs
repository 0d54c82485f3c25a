//! 시뮬레이션 브로커 계좌 엔진.
//!
//! 계좌별 주문/체결/포지션/자산을 단일 엔진 태스크가 소유하고,
//! 무작위 지연 체결 스케줄러가 시장가/지정가 주문을 체결합니다.
//! 모든 상태 변화는 실시간 라우트(`orders`, `executions`,
//! `positions`, `equity`)로 발행됩니다.

pub mod account;
pub mod engine;

pub use account::{BrokerAccount, FillOutcome};
pub use engine::{
    AccountParams, AccountSnapshot, BrokerCommand, BrokerDataService, BrokerEngine, BrokerHandle,
    BrokerSinks,
};
