//! 터미널 백엔드의 에러 타입.
//!
//! 이 모듈은 실시간 엔진과 브로커 시뮬레이션 전반에서 사용되는
//! 에러 분류 체계를 정의합니다.

use thiserror::Error;

/// 핵심 터미널 에러.
#[derive(Debug, Error)]
pub enum TerminalError {
    /// 구독 파라미터 검증 실패 (연결은 유지됨)
    #[error("validation failed: {0}")]
    Validation(String),

    /// 토픽 키 직렬화 실패 (연결은 유지됨)
    #[error("topic encoding failed: {0}")]
    Encoding(String),

    /// 알 수 없는 오퍼레이션 또는 파싱 불가능한 envelope (연결 종료)
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// 하트비트 또는 최대 수명 초과 (연결 종료)
    #[error(
        "Connection timed out. Heartbeat interval {heartbeat_secs}. \
         Max connection lifespan {lifespan_secs}"
    )]
    Timeout {
        /// 하트비트 간격 (초)
        heartbeat_secs: f64,
        /// 최대 연결 수명 (초)
        lifespan_secs: f64,
    },

    /// 토픽 프로듀서 또는 스케줄러 내부 실패 (격리됨)
    #[error("producer error: {0}")]
    Producer(String),

    /// 주문 상태 전이 위반
    #[error("order error: {0}")]
    Order(String),

    /// 찾을 수 없음
    #[error("not found: {0}")]
    NotFound(String),

    /// 내부 에러
    #[error("internal error: {0}")]
    Internal(String),
}

/// 터미널 작업을 위한 Result 타입.
pub type TerminalResult<T> = Result<T, TerminalError>;

impl TerminalError {
    /// 연결을 종료시켜야 하는 에러인지 확인합니다.
    ///
    /// 검증/인코딩 실패는 에러 응답 후 연결을 유지하고,
    /// 프로토콜 위반과 타임아웃은 연결을 닫습니다.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            TerminalError::Protocol(_) | TerminalError::Timeout { .. }
        )
    }

    /// 구독 응답으로 클라이언트에 보고되는 에러인지 확인합니다.
    pub fn is_reportable(&self) -> bool {
        matches!(
            self,
            TerminalError::Validation(_) | TerminalError::Encoding(_) | TerminalError::NotFound(_)
        )
    }
}

impl From<serde_json::Error> for TerminalError {
    fn from(err: serde_json::Error) -> Self {
        TerminalError::Encoding(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_fatal() {
        let protocol = TerminalError::Protocol("unknown operation".to_string());
        assert!(protocol.is_connection_fatal());

        let validation = TerminalError::Validation("accountId missing".to_string());
        assert!(!validation.is_connection_fatal());
        assert!(validation.is_reportable());
    }

    #[test]
    fn test_timeout_reason_format() {
        let err = TerminalError::Timeout {
            heartbeat_secs: 30.0,
            lifespan_secs: 3600.0,
        };
        assert_eq!(
            err.to_string(),
            "Connection timed out. Heartbeat interval 30. Max connection lifespan 3600"
        );
    }
}
