//! 설정 관리.
//!
//! 이 모듈은 애플리케이션 설정을 정의하고 관리합니다.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// 애플리케이션 설정.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    /// 서버 설정
    pub server: ServerConfig,
    /// WebSocket 연결 설정
    pub connection: ConnectionConfig,
    /// 브로커 시뮬레이션 설정
    pub broker: BrokerConfig,
    /// 시장 데이터 설정
    pub market: MarketConfig,
    /// 로깅 설정
    pub logging: LoggingConfig,
}

/// 서버 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// 바인딩할 호스트
    pub host: String,
    /// 리스닝할 포트
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
        }
    }
}

/// WebSocket 연결 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// 하트비트 간격 (초) - 이 시간 동안 수신 활동이 없으면 연결 종료
    pub heartbeat_secs: f64,
    /// 최대 연결 수명 (초) - 활동과 무관하게 이 시간이 지나면 연결 종료
    pub max_lifespan_secs: f64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: 30.0,
            max_lifespan_secs: 3600.0,
        }
    }
}

impl ConnectionConfig {
    /// 하트비트 간격을 Duration으로 반환합니다.
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs_f64(self.heartbeat_secs)
    }

    /// 최대 연결 수명을 Duration으로 반환합니다.
    pub fn max_lifespan(&self) -> Duration {
        Duration::from_secs_f64(self.max_lifespan_secs)
    }
}

/// 브로커 시뮬레이션 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// 계좌 초기 잔고
    pub initial_balance: Decimal,
    /// 주문별 체결 검사 최소 지연 (밀리초)
    pub fill_delay_min_ms: u64,
    /// 주문별 체결 검사 최대 지연 (밀리초)
    pub fill_delay_max_ms: u64,
    /// 자산 스냅샷 주기적 재계산 간격 (밀리초)
    pub equity_tick_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            initial_balance: Decimal::new(100_000, 0),
            fill_delay_min_ms: 1_000,
            fill_delay_max_ms: 2_000,
            equity_tick_ms: 5_000,
        }
    }
}

/// 시장 데이터 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MarketConfig {
    /// 프로듀서 업데이트 간격 (밀리초)
    pub tick_interval_ms: u64,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
        }
    }
}

/// 로깅 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 로그 레벨
    pub level: String,
    /// 로그 형식 (pretty, json, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl AppConfig {
    /// 파일과 환경 변수에서 설정을 로드합니다.
    ///
    /// 파일이 없으면 기본값에 환경 변수만 적용됩니다.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).required(false))
            .add_source(
                config::Environment::with_prefix("TERMINAL")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// 기본 경로에서 설정을 로드합니다.
    pub fn load_default() -> Result<Self, config::ConfigError> {
        Self::load("config/default.toml")
    }
}
