// src/auction/internal.rs

use std::sync::Arc;

use serde_json::Value;

use crate::auction::context_client::ContextBidClient;
use crate::logging::op_logger::OpLogger;
use crate::model::ad::{AdProposition, FetchedAd, PartnerAdsMap};
use crate::sandbox::BiddingSandbox;
use crate::store::keys;
use crate::store::storage::ScopedStorage;

/// **单个伙伴的内部竞价**
/// contextual 出价与该伙伴缓存的兴趣组广告之间的本地比价。
/// contextual 请求失败不会中断流程：没有基线就从零值空提案起评。
/// 任何伙伴都看不到其他伙伴的出价。
pub async fn partner_internal_auction(
    partner: &str,
    bid_request: &Value,
    product_level_enabled: bool,
    storage: &ScopedStorage,
    sandbox: &BiddingSandbox,
    client: &ContextBidClient,
    timeout_ms: u64,
    logger: &Arc<OpLogger>,
) -> AdProposition {
    let ads_map: PartnerAdsMap = storage
        .read_json(&keys::fetched_ads_key(partner))
        .unwrap_or_default();
    // BTreeMap 的迭代顺序给了平局裁决一个稳定的枚举顺序：
    // 先按兴趣组 id、再按广告 id 的字典序
    let mut fetched_ads: Vec<(String, FetchedAd)> = Vec::new();
    for (group_id, group_ads) in ads_map {
        for (_, ad) in group_ads {
            if !product_level_enabled && ad.is_product_level() {
                continue;
            }
            fetched_ads.push((group_id.clone(), ad));
        }
    }

    match client
        .request_contextual_bid(partner, bid_request, timeout_ms, logger)
        .await
    {
        Ok(ctx) => select_best(
            partner,
            ctx.contextual_ad,
            ctx.contextual_bid_value,
            ctx.context_signals,
            &fetched_ads,
            sandbox,
            logger,
        ),
        // contextual 评估失败时退化为只评缓存广告
        Err(_) => select_best(partner, None, None, Value::Null, &fetched_ads, sandbox, logger),
    }
}

/// 在 contextual 基线与缓存广告之间选出本伙伴的最优提案。
/// 只有严格更高的出价才会替换当前最优，平局偏向先被考虑的一方
/// （即 contextual 广告，或枚举顺序靠前的缓存广告）。
pub fn select_best(
    partner: &str,
    contextual_ad: Option<FetchedAd>,
    contextual_bid_value: Option<f64>,
    context_signals: Value,
    fetched_ads: &[(String, FetchedAd)],
    sandbox: &BiddingSandbox,
    logger: &Arc<OpLogger>,
) -> AdProposition {
    let mut best = match contextual_ad {
        Some(ad) => {
            // 出价非负是全局不变量，伙伴声明的负值在这里归零
            let value = contextual_bid_value.unwrap_or(0.0).max(0.0);
            let description = format!("{}'s context ad", partner);
            logger.log(&format!("Consider {}. Value: {}$", description, value));
            AdProposition {
                partner: partner.to_string(),
                ad: Some(ad),
                value,
                description,
                context_signals: context_signals.clone(),
            }
        }
        None => AdProposition {
            partner: partner.to_string(),
            ad: None,
            value: 0.0,
            description: "none".to_string(),
            context_signals: context_signals.clone(),
        },
    };
    for (group_id, ad) in fetched_ads {
        let description = format!("{}'s ad for {} group", partner, group_id);
        let value = sandbox.evaluate_bid(ad, &context_signals);
        logger.log(&format!("Consider {}. Value: {}$", description, value));
        if value > best.value {
            best = AdProposition {
                partner: partner.to_string(),
                ad: Some(ad.clone()),
                value,
                description,
                context_signals: context_signals.clone(),
            };
        }
    }
    best
}
