// src/store/keys.rs

//! origin 作用域存储里使用的全部键。

pub const INTEREST_GROUPS_KEY: &str = "interest-groups";
pub const ACTIVE_PARTNERS_KEY: &str = "active-partners";
pub const FETCHED_ADS_KEY_PREFIX: &str = "fetched-ads/";
pub const FETCHED_PRODUCTS_KEY_PREFIX: &str = "fetched-products/";
pub const WINNERS_KEY: &str = "winners";
pub const LOGS_KEY: &str = "logs";
pub const LOGS_COUNT_KEY: &str = "logs-count";

/// 某个伙伴的广告缓存键
pub fn fetched_ads_key(partner: &str) -> String {
    format!("{}{}", FETCHED_ADS_KEY_PREFIX, partner)
}

/// 某个伙伴的产品缓存键
pub fn fetched_products_key(partner: &str) -> String {
    format!("{}{}", FETCHED_PRODUCTS_KEY_PREFIX, partner)
}
