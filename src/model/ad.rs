use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::sandbox::{self, CompiledBidFunction, ParseError};

/// **兴趣组（InterestGroup）**
/// 身份由 `(owner, name)` 决定，对外统一使用复合键 `owner_name`。
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct InterestGroup {
    pub owner: String,              // 兴趣组所属站点
    pub name: String,               // 组名（owner 命名空间内唯一）
    pub readers: Vec<String>,       // 允许为该组出广告的伙伴 base URL 列表
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub products: Option<Vec<String>>, // 产品级广告引用的产品 id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,    // 成员资格的绝对过期时间（RFC3339）
}

impl InterestGroup {
    /// 复合键 `owner_name`
    pub fn id(&self) -> String {
        format!("{}_{}", self.owner, self.name)
    }

    /// 成员资格是否已过期（未设置或无法解析的时间戳视为未过期）
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match &self.timeout {
            Some(ts) => match DateTime::parse_from_rfc3339(ts) {
                Ok(expiry) => expiry.with_timezone(&Utc) < now,
                Err(_) => false,
            },
            None => false,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdKind {
    #[default]
    #[serde(rename = "interest-group")]
    InterestGroup,
    #[serde(rename = "contextual")]
    Contextual,
    #[serde(rename = "none")]
    None, // 兜底 "no-ad" 占位
}

/// **从伙伴拉取并缓存在本地的广告**
/// `bid_function` 在拉取候选广告之后懒加载（单独下载源码），
/// 编译结果缓存在 `compiled` 中，不参与序列化。
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct FetchedAd {
    pub id: String,                 // 广告 id，伙伴命名空间内唯一
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>, // 该广告所属兴趣组的复合键
    #[serde(rename = "type", default)]
    pub ad_type: AdKind,
    pub iframe_content: String,     // Ad markup (HTML)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interest_group_signals: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bid_function_src: Option<String>, // 竞价函数源码的下载地址
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bid_function: Option<String>,     // 已下载的竞价函数源码
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub products_count: Option<u32>,      // 产品级广告要渲染的产品数量
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub products_owner: Option<String>,   // 产品目录所属的 owner
    pub ad_partner: String,
    #[serde(skip)]
    pub compiled: OnceCell<CompiledBidFunction>,
}

impl FetchedAd {
    /// 懒编译竞价函数，编译一次后缓存
    pub fn compiled_bid_function(&self) -> Result<&CompiledBidFunction, ParseError> {
        self.compiled.get_or_try_init(|| {
            let src = self.bid_function.as_deref().ok_or(ParseError::EmptySource)?;
            sandbox::compile(src)
        })
    }

    pub fn is_product_level(&self) -> bool {
        self.products_count.is_some()
    }

    /// 兜底广告：竞价全部失败时也要有内容可渲染
    pub fn no_ad() -> Self {
        Self {
            id: "no-ad".to_string(),
            group_name: None,
            ad_type: AdKind::None,
            iframe_content: "<html><body><h1>NO AD</h1><p>TURTLEDOVE cannot select any ad for you :(</p></body></html>".to_string(),
            interest_group_signals: None,
            bid_function_src: None,
            bid_function: None,
            products_count: None,
            products_owner: None,
            ad_partner: "none".to_string(),
            compiled: OnceCell::new(),
        }
    }
}

/// **缓存的产品创意**，以 `(owner, productId)` 为键
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct FetchedProduct {
    pub owner: String,
    pub product_id: String,
    pub iframe_content: String,
}

/// **伙伴对 contextual-bid 请求的应答**
/// `context_signals` 为伙伴自定义的不透明 JSON，之后原样喂给竞价函数。
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ContextualBidResponse {
    #[serde(default)]
    pub context_signals: Value,
    #[serde(default)]
    pub contextual_ad: Option<FetchedAd>,
    #[serde(default)]
    pub contextual_bid_value: Option<f64>,
}

/// **单个伙伴内部竞价的胜出提案**
/// 竞价过程中的临时结果，只会以 WinnerRecord 的形式落盘。
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AdProposition {
    pub partner: String,
    pub ad: Option<FetchedAd>,
    pub value: f64,
    pub description: String,
    pub context_signals: Value,
}

/// **竞价胜出记录**，追加写入 winner history
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct WinnerRecord {
    pub bid_value: f64,
    pub iframe_content: String,
    #[serde(default)]
    pub interest_group_signals: Option<Value>,
    #[serde(default)]
    pub context_signals: Value,
    pub site: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub products_payload: Option<Vec<FetchedProduct>>,
    pub time: String,
}

/// 每个伙伴的广告缓存：外层键为兴趣组复合键，内层键为广告 id。
/// BTreeMap 保证枚举顺序稳定，平局裁决因此是确定性的。
pub type PartnerAdsMap = BTreeMap<String, BTreeMap<String, FetchedAd>>;

/// 每个伙伴的产品缓存：外层键为 owner，内层键为产品 id
pub type PartnerProductsMap = BTreeMap<String, BTreeMap<String, FetchedProduct>>;

/// 全部兴趣组，键为复合键 `owner_name`
pub type InterestGroupMap = BTreeMap<String, InterestGroup>;
