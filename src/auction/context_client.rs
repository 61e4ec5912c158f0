// src/auction/context_client.rs

use std::fmt;
use std::sync::Arc;

use reqwest::Client;
use serde_json::Value;
use tokio::time::{timeout, Duration};

use crate::logging::op_logger::OpLogger;
use crate::model::ad::ContextualBidResponse;

/// contextual-bid 请求的失败形态。
/// 对调用方来说它们都等价于"这个伙伴没有 contextual 广告"，绝不是竞价失败。
#[derive(Debug, Clone, PartialEq)]
pub enum ContextBidFailure {
    Timeout,
    Network(String),
    MalformedResponse(String),
}

impl fmt::Display for ContextBidFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::Network(reason) => write!(f, "network error: {}", reason),
            Self::MalformedResponse(reason) => write!(f, "malformed response: {}", reason),
        }
    }
}

pub struct ContextBidClient {
    client: Client,
}

impl ContextBidClient {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    /// 把 context 数据 POST 给伙伴换取 contextual 出价与 context signals。
    /// `timeout_ms` 内没有完整应答按失败处理（请求随 future 丢弃被取消）。
    pub async fn request_contextual_bid(
        &self,
        partner: &str,
        context_data: &Value,
        timeout_ms: u64,
        logger: &Arc<OpLogger>,
    ) -> Result<ContextualBidResponse, ContextBidFailure> {
        let budget = Duration::from_millis(timeout_ms);
        let request = self
            .client
            .post(format!("{}/fetch-contextual-bid", partner))
            .header("Content-Type", "application/json")
            .json(context_data);
        let response = match timeout(budget, request.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                logger.log(&format!("Request to {} failed: {}", partner, e));
                return Err(ContextBidFailure::Network(e.to_string()));
            }
            Err(_) => {
                logger.log(&format!("Request to {} failed: timeout", partner));
                return Err(ContextBidFailure::Timeout);
            }
        };
        match timeout(budget, response.json::<ContextualBidResponse>()).await {
            Ok(Ok(parsed)) => {
                logger.log(&format!(
                    "Received context response from {}: {}",
                    partner, parsed.context_signals
                ));
                Ok(parsed)
            }
            Ok(Err(e)) => {
                logger.log(&format!("Request to {} failed: {}", partner, e));
                Err(ContextBidFailure::MalformedResponse(e.to_string()))
            }
            Err(_) => {
                logger.log(&format!("Request to {} failed: timeout", partner));
                Err(ContextBidFailure::Timeout)
            }
        }
    }
}

impl Default for ContextBidClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::storage::ScopedStorage;
    use serde_json::json;

    #[tokio::test]
    async fn unreachable_partner_is_a_network_failure() {
        let client = ContextBidClient::new();
        let storage = ScopedStorage::in_memory("http://localhost:8008");
        let logger = Arc::new(OpLogger::new(storage, "http://publisher.example", true));
        let result = client
            .request_contextual_bid("http://127.0.0.1:1", &json!({"topic": "animals"}), 500, &logger)
            .await;
        // 连接被拒或超时都可以，反正不是成功
        assert!(result.is_err());
    }
}
