//! 도메인 프로듀서가 구현하는 데이터 서비스 계약.

use crate::topic::Topic;
use async_trait::async_trait;
use terminal_core::TerminalResult;

/// 라우트별 데이터 프로듀서 계약.
///
/// 구현체는 라우트 구성 시점에 주입됩니다 (전역 레지스트리 없음).
/// `create_topic`은 첫 구독자가 등록될 때, `remove_topic`은 마지막
/// 구독자가 해제될 때 [`SubscriptionRegistry`](crate::registry::SubscriptionRegistry)가
/// 호출합니다.
#[async_trait]
pub trait DataService: Send + Sync {
    /// 토픽의 프로듀서를 시작합니다.
    ///
    /// 구독 승인 전에 호출되므로, 반환이 성공하면 프로듀서가 이미
    /// 동작 중임이 보장됩니다. 실패하면 구독 자체가 거부됩니다.
    async fn create_topic(&self, topic: &Topic) -> TerminalResult<()>;

    /// 토픽의 프로듀서를 중지합니다.
    ///
    /// 이미 큐에 들어간 업데이트는 여전히 전달될 수 있습니다 (best-effort).
    async fn remove_topic(&self, topic: &Topic);
}
