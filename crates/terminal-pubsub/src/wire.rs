//! 와이어 메시지 envelope.
//!
//! 클라이언트-서버 간 교환되는 모든 메시지는
//! `{"type": string, "payload": object|null}` 형식입니다.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use terminal_core::{TerminalError, TerminalResult};

/// 와이어 메시지 envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// 오퍼레이션 이름 (예: `orders.subscribe`, `bars.update`)
    #[serde(rename = "type")]
    pub kind: String,
    /// 오퍼레이션별 payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Envelope {
    /// JSON 문자열에서 파싱합니다. 파싱 불가능한 envelope은
    /// 프로토콜 위반입니다.
    pub fn parse(text: &str) -> TerminalResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| TerminalError::Protocol(format!("unparsable envelope: {}", e)))
    }

    /// JSON 문자열로 직렬화합니다.
    pub fn to_json(&self) -> TerminalResult<String> {
        serde_json::to_string(self).map_err(TerminalError::from)
    }

    /// `{route}.update` envelope을 생성합니다.
    pub fn update(route: &str, payload: Value) -> Self {
        Self {
            kind: format!("{}.update", route),
            payload: Some(payload),
        }
    }

    /// `{route}.subscribe.response` envelope을 생성합니다.
    pub fn subscribe_response(route: &str, response: &SubscribeResponse) -> Self {
        Self {
            kind: format!("{}.subscribe.response", route),
            payload: serde_json::to_value(response).ok(),
        }
    }

    /// `{route}.unsubscribe.response` envelope을 생성합니다.
    pub fn unsubscribe_response(route: &str, response: &SubscribeResponse) -> Self {
        Self {
            kind: format!("{}.unsubscribe.response", route),
            payload: serde_json::to_value(response).ok(),
        }
    }

    /// 연결 환영 메시지를 생성합니다.
    pub fn welcome(version: &str) -> Self {
        Self {
            kind: "core.welcome".to_string(),
            payload: Some(serde_json::json!({
                "version": version,
                "timestamp": now_millis(),
            })),
        }
    }
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// 클라이언트가 보낼 수 있는 오퍼레이션.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// `{route}.subscribe`
    Subscribe {
        /// 대상 라우트
        route: String,
    },
    /// `{route}.unsubscribe`
    Unsubscribe {
        /// 대상 라우트
        route: String,
    },
}

impl Operation {
    /// envelope의 `type` 필드에서 오퍼레이션을 파싱합니다.
    ///
    /// 알 수 없는 오퍼레이션은 프로토콜 위반입니다.
    pub fn parse(kind: &str) -> TerminalResult<Self> {
        match kind.rsplit_once('.') {
            Some((route, "subscribe")) if !route.is_empty() && !route.contains('.') => {
                Ok(Operation::Subscribe {
                    route: route.to_string(),
                })
            }
            Some((route, "unsubscribe")) if !route.is_empty() && !route.contains('.') => {
                Ok(Operation::Unsubscribe {
                    route: route.to_string(),
                })
            }
            _ => Err(TerminalError::Protocol(format!(
                "unknown operation type: {}",
                kind
            ))),
        }
    }

    /// 대상 라우트를 반환합니다.
    pub fn route(&self) -> &str {
        match self {
            Operation::Subscribe { route } => route,
            Operation::Unsubscribe { route } => route,
        }
    }
}

/// 구독/구독해제 응답 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    /// 성공
    Ok,
    /// 실패 (연결은 유지됨)
    Error,
}

/// 구독/구독해제 응답 payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeResponse {
    /// 처리 결과
    pub status: ResponseStatus,
    /// 설명 메시지 (성공 시 빈 문자열)
    pub message: String,
    /// 정준 토픽 키 (실패 시 빈 문자열)
    pub topic: String,
}

impl SubscribeResponse {
    /// 성공 응답을 생성합니다.
    pub fn ok(topic: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Ok,
            message: String::new(),
            topic: topic.into(),
        }
    }

    /// 에러 응답을 생성합니다.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Error,
            message: message.into(),
            topic: String::new(),
        }
    }
}
