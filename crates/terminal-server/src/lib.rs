//! 트레이딩 터미널 실시간 서버.
//!
//! WebSocket 엔드포인트, 시장 데이터 프로듀서, 브로커 엔진을
//! 하나의 프로세스로 조립합니다.

pub mod app;
pub mod market;
pub mod ws;
