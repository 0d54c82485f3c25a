//! 토픽 키 생성.
//!
//! 구독 파라미터를 정준(canonical) 문자열로 직렬화합니다. 서버와
//! 모든 클라이언트가 동일하게 재현할 수 있어야 하는 계약입니다 -
//! 구현이 조금이라도 어긋나면 프로듀서의 토픽과 구독자의 토픽이
//! 달라져 업데이트가 조용히 유실됩니다.
//!
//! # 정준화 규칙
//!
//! - 객체 키는 모든 중첩 깊이에서 알파벳순으로 정렬
//! - 공백 없이 직렬화
//! - 배열은 원소 순서를 유지하며 각 원소를 재귀적으로 정준화
//! - `null`은 직렬화 전에 빈 문자열로 변환

use serde_json::Value;
use std::collections::BTreeMap;
use terminal_core::{TerminalError, TerminalResult};

/// 정준화된 구독 토픽.
///
/// 두 토픽은 정준 직렬화 결과가 바이트 단위로 동일할 때에만 같습니다.
#[derive(Debug, Clone)]
pub struct Topic {
    route: String,
    key: String,
    params: Value,
}

impl PartialEq for Topic {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Topic {}

impl std::hash::Hash for Topic {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl Topic {
    /// 토픽이 속한 라우트를 반환합니다.
    pub fn route(&self) -> &str {
        &self.route
    }

    /// 정준 토픽 키 (`{route}:{canonical-params}`)를 반환합니다.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// 원본 구독 파라미터를 반환합니다.
    pub fn params(&self) -> &Value {
        &self.params
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key)
    }
}

/// 라우트와 파라미터로 토픽을 생성합니다.
///
/// 파라미터는 JSON 객체여야 합니다. 직렬화할 수 없는 파라미터는
/// `Encoding` 에러로 실패하며 재시도하지 않습니다.
pub fn build_topic(route: &str, params: &Value) -> TerminalResult<Topic> {
    if !params.is_object() {
        return Err(TerminalError::Encoding(format!(
            "subscription params must be a JSON object, got {}",
            type_name(params)
        )));
    }

    let mut canonical = String::with_capacity(64);
    write_canonical(params, &mut canonical)?;

    Ok(Topic {
        route: route.to_string(),
        key: format!("{}:{}", route, canonical),
        params: params.clone(),
    })
}

/// 값을 정준 형태로 직렬화합니다.
fn write_canonical(value: &Value, out: &mut String) -> TerminalResult<()> {
    match value {
        // null은 빈 문자열로 취급
        Value::Null => out.push_str("\"\""),
        Value::Bool(_) | Value::Number(_) => {
            out.push_str(&serde_json::to_string(value)?);
        }
        Value::String(s) => {
            out.push_str(&serde_json::to_string(s)?);
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            out.push('{');
            for (i, (key, item)) in sorted.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_canonical(item, out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_key_format() {
        let topic = build_topic("orders", &json!({"accountId": "ACC-1"})).unwrap();
        assert_eq!(topic.key(), r#"orders:{"accountId":"ACC-1"}"#);
        assert_eq!(topic.route(), "orders");
    }

    #[test]
    fn test_keys_sorted_at_every_depth() {
        let topic = build_topic(
            "bars",
            &json!({"symbol": "AAPL", "range": {"to": 2, "from": 1}, "resolution": "1"}),
        )
        .unwrap();
        assert_eq!(
            topic.key(),
            r#"bars:{"range":{"from":1,"to":2},"resolution":"1","symbol":"AAPL"}"#
        );
    }

    #[test]
    fn test_null_becomes_empty_string() {
        let topic = build_topic("quotes", &json!({"session": null, "symbol": "AAPL"})).unwrap();
        assert_eq!(topic.key(), r#"quotes:{"session":"","symbol":"AAPL"}"#);
    }

    #[test]
    fn test_array_order_preserved() {
        let topic = build_topic("quotes", &json!({"symbols": ["MSFT", "AAPL"]})).unwrap();
        assert_eq!(topic.key(), r#"quotes:{"symbols":["MSFT","AAPL"]}"#);
    }

    #[test]
    fn test_nested_array_elements_canonicalized() {
        let topic = build_topic(
            "quotes",
            &json!({"filters": [{"b": 2, "a": 1}, {"d": null, "c": 3}]}),
        )
        .unwrap();
        assert_eq!(
            topic.key(),
            r#"quotes:{"filters":[{"a":1,"b":2},{"c":3,"d":""}]}"#
        );
    }

    #[test]
    fn test_non_object_params_fail() {
        let err = build_topic("orders", &json!("ACC-1")).unwrap_err();
        assert!(matches!(err, TerminalError::Encoding(_)));
    }

    #[test]
    fn test_permutation_equality() {
        let a = build_topic("orders", &json!({"accountId": "ACC-1", "kind": "open"})).unwrap();
        let b = build_topic("orders", &json!({"kind": "open", "accountId": "ACC-1"})).unwrap();
        assert_eq!(a.key(), b.key());
    }

    proptest! {
        /// 키/값 쌍의 삽입 순서가 달라도 토픽 키는 동일해야 한다.
        /// 키가 중복되면 forward/reversed가 서로 다른 맵이 되므로
        /// hash_map 전략으로 키 유일성을 보장한다.
        #[test]
        fn prop_key_order_irrelevant(pairs in proptest::collection::hash_map(
            "[a-z]{1,8}", any::<i64>(), 1..8,
        ).prop_map(|map| map.into_iter().collect::<Vec<_>>())) {
            let forward = serde_json::Map::from_iter(
                pairs.iter().map(|(k, v)| (k.clone(), json!(v))),
            );
            let reversed = serde_json::Map::from_iter(
                pairs.iter().rev().map(|(k, v)| (k.clone(), json!(v))),
            );

            let a = build_topic("t", &Value::Object(forward)).unwrap();
            let b = build_topic("t", &Value::Object(reversed)).unwrap();
            prop_assert_eq!(a.key(), b.key());
        }
    }
}
