//! 공유 마크 가격 장부.
//!
//! 시장 데이터 프로듀서가 가격을 기록하고 브로커 엔진이 체결/평가
//! 가격으로 읽어갑니다. 알려지지 않은 심볼은 패턴에 따라 합리적인
//! 시드 가격이 동적으로 생성됩니다.

use crate::types::Price;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// 심볼별 마크 가격 장부.
#[derive(Debug, Default)]
pub struct PriceBook {
    prices: RwLock<HashMap<String, Price>>,
}

/// 공유 가능한 가격 장부 타입.
pub type SharedPriceBook = Arc<PriceBook>;

impl PriceBook {
    /// 대표 심볼들이 시드된 가격 장부를 생성합니다.
    pub fn seeded() -> SharedPriceBook {
        let book = PriceBook::default();
        {
            let mut prices = book.prices.write().expect("price book lock poisoned");
            prices.insert("AAPL".to_string(), dec!(192.50));
            prices.insert("MSFT".to_string(), dec!(428.00));
            prices.insert("TSLA".to_string(), dec!(251.30));
            prices.insert("NVDA".to_string(), dec!(131.40));
            prices.insert("SPY".to_string(), dec!(605.50));
            prices.insert("QQQ".to_string(), dec!(528.30));
            prices.insert("BTC-USD".to_string(), dec!(105000));
            prices.insert("ETH-USD".to_string(), dec!(3350));
        }
        Arc::new(book)
    }

    /// 심볼의 마크 가격을 반환합니다. 없으면 동적으로 시드합니다.
    pub fn mark(&self, symbol: &str) -> Price {
        if let Some(price) = self
            .prices
            .read()
            .expect("price book lock poisoned")
            .get(symbol)
        {
            return *price;
        }

        let seed = Self::synthesize(symbol);
        let mut prices = self.prices.write().expect("price book lock poisoned");
        *prices.entry(symbol.to_string()).or_insert(seed)
    }

    /// 심볼의 마크 가격을 갱신합니다.
    pub fn set(&self, symbol: &str, price: Price) {
        self.prices
            .write()
            .expect("price book lock poisoned")
            .insert(symbol.to_string(), price);
    }

    /// 심볼 패턴에 따라 시드 가격을 추정합니다.
    fn synthesize(symbol: &str) -> Price {
        if symbol.contains("USD") || symbol.contains("USDT") {
            // 암호화폐 페어
            dec!(100)
        } else if symbol.chars().all(|c| c.is_ascii_digit()) {
            // 6자리 숫자 코드 주식
            dec!(50000)
        } else {
            // 일반 주식/ETF 티커
            dec!(150)
        }
    }
}
