use std::sync::RwLock;

use crate::model::partner::{Partner, PartnerRegistry};

/// 竞价链路上的超时与开关
#[derive(Clone, Debug)]
pub struct AuctionSettings {
    pub context_bid_timeout_ms: u64,   // contextual-bid 请求的默认超时
    pub ad_fetch_timeout_ms: u64,      // fetch-ads 与竞价函数下载的超时
    pub product_fetch_timeout_ms: u64, // fetch-products 的超时
    pub product_level_enabled: bool,   // 是否启用产品级广告
}

impl Default for AuctionSettings {
    fn default() -> Self {
        Self {
            context_bid_timeout_ms: 500,
            ad_fetch_timeout_ms: 1000,
            product_fetch_timeout_ms: 5000,
            product_level_enabled: true,
        }
    }
}

#[derive(Debug)]
pub struct ConfigManager {
    partners: RwLock<PartnerRegistry>,
    pub settings: AuctionSettings,
}

impl ConfigManager {
    pub fn new(registry: PartnerRegistry, settings: AuctionSettings) -> Self {
        ConfigManager {
            partners: RwLock::new(registry),
            settings,
        }
    }

    /// 从逗号分隔的 base URL 列表构造（CLI 覆盖用）
    pub fn from_args(partner_urls: &str, settings: AuctionSettings) -> Self {
        let mut registry = PartnerRegistry::new();
        for (i, url) in partner_urls.split(',').filter(|s| !s.is_empty()).enumerate() {
            let name = format!("partner{}_network", i + 1);
            registry.add_partner(Partner::new((i as u64) + 1, &name, url.trim(), true, None));
        }
        ConfigManager::new(registry, settings)
    }

    /// 覆盖伙伴注册表（id 重新从 1 分配）
    pub fn update_partners(&self, partners: Vec<Partner>) {
        let mut registry = PartnerRegistry::new();
        for (i, mut partner) in partners.into_iter().enumerate() {
            partner.id = (i as u64) + 1;
            registry.add_partner(partner);
        }
        *self.partners.write().unwrap() = registry;
    }

    pub fn active_partners(&self) -> Vec<Partner> {
        self.partners.read().unwrap().active_partners()
    }

    /// 某个伙伴 contextual-bid 的超时：优先取注册表里的配置，否则用默认值
    pub fn partner_timeout_ms(&self, url: &str) -> u64 {
        self.partners
            .read()
            .unwrap()
            .find_by_url(url)
            .and_then(|p| p.timeout)
            .unwrap_or(self.settings.context_bid_timeout_ms)
    }
}
