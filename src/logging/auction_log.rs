use chrono::Utc;
use serde::{Deserialize, Serialize};

/// **一次端上竞价的聚合日志**
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AuctionLog {
    pub timestamp: String,            // 记录时间
    pub log_type: String,             // 日志类型，固定 "on_device_auction"
    pub site: String,                 // 发起渲染请求的 publisher origin
    pub request_id: String,           // 渲染请求 id
    pub bid_attempts: usize,          // 参与内部竞价的伙伴数量
    pub status: String,               // 竞价结果 "success" or "failure"
    pub winning_partner: Option<String>, // 胜出的伙伴
    pub winning_value: f64,           // 胜出的出价
    pub partner_bid_log: Vec<PartnerBidLog>, // 各伙伴的提案日志
}

/// **单个伙伴内部竞价的提案日志**
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PartnerBidLog {
    pub partner_url: String,    // 伙伴 base URL
    pub bid_value: f64,         // 该伙伴最优提案的出价
    pub description: String,    // 提案描述（contextual / 哪个兴趣组的广告）
}

impl AuctionLog {
    /// **创建竞价聚合日志**
    pub fn new(site: &str, request_id: &str) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            log_type: "on_device_auction".to_string(),
            site: site.to_string(),
            request_id: request_id.to_string(),
            bid_attempts: 0,
            status: "failure".to_string(), // 默认失败，后续可更新
            winning_partner: None,
            winning_value: 0.0,
            partner_bid_log: Vec::new(),
        }
    }

    /// **添加伙伴提案日志**
    pub fn add_partner_bid(&mut self, partner_url: &str, bid_value: f64, description: &str) {
        self.partner_bid_log.push(PartnerBidLog {
            partner_url: partner_url.to_string(),
            bid_value,
            description: description.to_string(),
        });
        self.bid_attempts += 1;
    }

    /// **设置竞价胜出伙伴**
    pub fn set_winner(&mut self, partner_url: &str, value: f64) {
        self.status = "success".to_string();
        self.winning_partner = Some(partner_url.to_string());
        self.winning_value = value;
    }
}
