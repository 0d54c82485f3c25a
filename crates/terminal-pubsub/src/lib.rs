//! 실시간 데이터 스트리밍을 위한 토픽 기반 pub/sub 엔진.
//!
//! 구독 수명주기(참조 카운팅), 토픽별 프로듀서 생성/취소, 연결
//! 하트비트/수명 감시, 라우트별 브로드캐스트 팬아웃을 담당합니다.
//!
//! # 오퍼레이션 명명 규칙
//!
//! 라우트마다 동일한 계약을 공유합니다:
//!
//! - `{route}.subscribe` / `{route}.subscribe.response`
//! - `{route}.unsubscribe` / `{route}.unsubscribe.response`
//! - `{route}.update`
//!
//! # 메시지 형식
//!
//! 모든 메시지는 `{"type": string, "payload": object|null}` envelope로
//! 교환됩니다.
//!
//! ```json
//! {"type": "orders.subscribe", "payload": {"accountId": "ACC-1"}}
//! {"type": "orders.subscribe.response",
//!  "payload": {"status": "ok", "message": "", "topic": "orders:{\"accountId\":\"ACC-1\"}"}}
//! {"type": "orders.update", "payload": {...}}
//! ```

pub mod client;
pub mod connection;
pub mod dispatcher;
pub mod registry;
pub mod service;
pub mod topic;
pub mod wire;

pub use client::{ClientHandle, ClientId, OutboundMessage};
pub use connection::{
    Connection, ConnectionManager, ConnectionState, DisconnectReason, CLOSE_NORMAL,
    CLOSE_POLICY_VIOLATION,
};
pub use dispatcher::{BroadcastDispatcher, TopicUpdate, UpdateSink};
pub use registry::{schema_validator, ParamValidator, RouteTable, SubscriptionRegistry};
pub use service::DataService;
pub use topic::{build_topic, Topic};
pub use wire::{Envelope, Operation, ResponseStatus, SubscribeResponse};
