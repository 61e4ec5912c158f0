use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use rand::seq::SliceRandom;
use serde::Serialize;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::auction::context_client::ContextBidClient;
use crate::auction::internal::partner_internal_auction;
use crate::config::config_manager::ConfigManager;
use crate::logging::auction_log::AuctionLog;
use crate::logging::op_logger::OpLogger;
use crate::model::ad::{
    AdKind, AdProposition, FetchedAd, FetchedProduct, InterestGroupMap, PartnerProductsMap,
    WinnerRecord,
};
use crate::sandbox::BiddingSandbox;
use crate::store::interest_groups::InterestGroupStore;
use crate::store::keys::{self, INTEREST_GROUPS_KEY, WINNERS_KEY};
use crate::store::storage::ScopedStorage;

/// 交给 host 页面的渲染指令。竞价永远有结果可渲染：
/// 没有胜者时带的是 no-ad 兜底内容。
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RenderInstruction {
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_surface_id: Option<String>, // host 页面上要画进的 surface
    pub ad_type: AdKind,
    pub iframe_content: String,
    pub description: String,
    pub bid_value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub products_payload: Option<Vec<FetchedProduct>>,
}

/// **跨伙伴终局竞价**
/// 在各伙伴内部竞价的胜出提案之间取严格最大值。
/// 阈值从 0 起步：出价必须严格大于 0 才可能胜出，全零或全失败时没有胜者；
/// 平局偏向枚举顺序里先出现的提案（调用方保证顺序稳定）。
pub fn perform_auction(propositions: &[AdProposition]) -> Option<&AdProposition> {
    let mut highest_value = 0.0;
    let mut winner = None;
    // 每个伙伴只有一个提案
    for proposition in propositions {
        if proposition.value > highest_value {
            highest_value = proposition.value;
            winner = Some(proposition);
        }
    }
    winner
}

/// **竞价编排 / 渲染管线**
/// 处理一次渲染请求：清理过期成员资格，并发跑所有伙伴的内部竞价，
/// 选出全局胜者，解析产品列表（产品级广告），落盘 WinnerRecord，
/// 产出渲染指令与聚合日志。
pub async fn process_rendering_request(
    bid_requests: &BTreeMap<String, Value>,
    site: &str,
    config: &Arc<ConfigManager>,
    storage: &ScopedStorage,
    store: &InterestGroupStore,
    sandbox: &BiddingSandbox,
) -> (RenderInstruction, AuctionLog) {
    let request_id = Uuid::new_v4().to_string();
    let logger = Arc::new(OpLogger::new(storage.clone(), site, true));
    store.prune_expired(&logger);

    if let Some(first_request) = bid_requests.values().next() {
        logger.log(&format!(
            "Perform an auction for the placement: {}",
            first_request.get("placement").cloned().unwrap_or(Value::Null)
        ));
    }

    let product_level_enabled = config.settings.product_level_enabled;
    let tasks: Vec<_> = bid_requests
        .iter()
        .map(|(partner, request)| {
            let partner = partner.clone();
            let request = request.clone();
            let storage = storage.clone();
            let sandbox = sandbox.clone();
            let logger = Arc::clone(&logger);
            let timeout_ms = config.partner_timeout_ms(&partner);
            tokio::spawn(async move {
                let client = ContextBidClient::new();
                partner_internal_auction(
                    &partner,
                    &request,
                    product_level_enabled,
                    &storage,
                    &sandbox,
                    &client,
                    timeout_ms,
                    &logger,
                )
                .await
            })
        })
        .collect();

    // 等全部内部竞价 settle；单个伙伴挂掉只会丢它自己的提案。
    // join_all 保持 bid_requests 的（排序后）枚举顺序，平局裁决因此是确定的。
    let propositions: Vec<AdProposition> = join_all(tasks)
        .await
        .into_iter()
        .filter_map(|result| result.ok())
        .collect();

    let mut auction_log = AuctionLog::new(site, &request_id);
    for proposition in &propositions {
        auction_log.add_partner_bid(&proposition.partner, proposition.value, &proposition.description);
    }

    let instruction = match perform_auction(&propositions) {
        Some(winning) => {
            logger.log(&format!("Winner: {}.", winning.description));
            auction_log.set_winner(&winning.partner, winning.value);
            let winning_ad = winning.ad.clone().unwrap_or_else(FetchedAd::no_ad);
            let products = if product_level_enabled {
                resolve_products(storage, &winning_ad, &logger)
            } else {
                None
            };
            save_winner(storage, winning, site, products.clone());
            info!(
                "rendering request {} won by {} at {}$",
                request_id, winning.partner, winning.value
            );
            RenderInstruction {
                request_id: request_id.clone(),
                target_surface_id: None,
                ad_type: winning_ad.ad_type,
                iframe_content: winning_ad.iframe_content,
                description: winning.description.clone(),
                bid_value: winning.value,
                products_payload: products,
            }
        }
        None => {
            logger.log("Bidding failed because of: Cannot select winner");
            let no_ad = FetchedAd::no_ad();
            RenderInstruction {
                request_id: request_id.clone(),
                target_surface_id: None,
                ad_type: no_ad.ad_type,
                iframe_content: no_ad.iframe_content,
                description: "none".to_string(),
                bid_value: 0.0,
                products_payload: None,
            }
        }
    };
    logger.save();
    (instruction, auction_log)
}

/// 解析产品级胜出广告要渲染的产品列表。
/// 兴趣组引用的产品没缓存到时，用同 owner 的随机已缓存产品顶替
/// （回退策略，不是错误）；完全没有候选的 id 丢弃。结果洗牌后交给渲染。
fn resolve_products(
    storage: &ScopedStorage,
    ad: &FetchedAd,
    logger: &Arc<OpLogger>,
) -> Option<Vec<FetchedProduct>> {
    ad.products_count?;
    let group_id = ad.group_name.clone()?;
    let owner = ad
        .products_owner
        .clone()
        .unwrap_or_else(|| group_id.split('_').next().unwrap_or("").to_string());

    let groups: InterestGroupMap = storage.read_json(INTEREST_GROUPS_KEY).unwrap_or_default();
    let product_ids = groups
        .get(&group_id)
        .and_then(|group| group.products.clone())
        .unwrap_or_default();
    if product_ids.is_empty() {
        return None;
    }

    let all: PartnerProductsMap = storage
        .read_json(&keys::fetched_products_key(&ad.ad_partner))
        .unwrap_or_default();
    let owner_products = all.get(&owner).cloned().unwrap_or_default();
    let cached: Vec<&FetchedProduct> = owner_products.values().collect();

    let mut rng = rand::thread_rng();
    let mut resolved = Vec::new();
    for product_id in &product_ids {
        match owner_products.get(product_id) {
            Some(product) => resolved.push(product.clone()),
            None => match cached.choose(&mut rng) {
                Some(substitute) => {
                    logger.log(&format!(
                        "Product {} is not cached, substituting {}.",
                        product_id, substitute.product_id
                    ));
                    resolved.push((*substitute).clone());
                }
                None => logger.log(&format!(
                    "Product {} is not cached and {} has no cached substitute.",
                    product_id, owner
                )),
            },
        }
    }
    if resolved.is_empty() {
        return None;
    }
    resolved.shuffle(&mut rng);
    Some(resolved)
}

/// 追加胜出记录。历史只增不删，读取时反转为最新在前。
fn save_winner(
    storage: &ScopedStorage,
    winning: &AdProposition,
    site: &str,
    products: Option<Vec<FetchedProduct>>,
) {
    let ad = match &winning.ad {
        Some(ad) => ad,
        None => return,
    };
    let mut winners: Vec<WinnerRecord> = storage.read_json(WINNERS_KEY).unwrap_or_default();
    winners.push(WinnerRecord {
        bid_value: winning.value,
        iframe_content: ad.iframe_content.clone(),
        interest_group_signals: ad.interest_group_signals.clone(),
        context_signals: winning.context_signals.clone(),
        site: site.to_string(),
        products_payload: products,
        time: Utc::now().to_rfc3339(),
    });
    storage.write_json(WINNERS_KEY, &winners);
}

/// 历史胜出记录，最新在前
pub fn list_winners(storage: &ScopedStorage) -> Vec<WinnerRecord> {
    let mut winners: Vec<WinnerRecord> = storage.read_json(WINNERS_KEY).unwrap_or_default();
    winners.reverse();
    winners
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::config_manager::AuctionSettings;
    use crate::model::ad::{InterestGroup, PartnerAdsMap};
    use crate::model::partner::PartnerRegistry;
    use once_cell::sync::OnceCell;
    use proptest::prelude::*;
    use serde_json::json;
    use tokio::time::Duration;

    fn proposition(partner: &str, value: f64) -> AdProposition {
        AdProposition {
            partner: partner.to_string(),
            ad: None,
            value,
            description: format!("{}'s context ad", partner),
            context_signals: Value::Null,
        }
    }

    #[test]
    fn all_zero_bids_yield_no_winner() {
        let propositions = vec![proposition("http://a.example", 0.0), proposition("http://b.example", 0.0)];
        assert!(perform_auction(&propositions).is_none());
        assert!(perform_auction(&[]).is_none());
    }

    #[test]
    fn ties_are_resolved_by_enumeration_order() {
        let propositions = vec![
            proposition("http://a.example", 1.5),
            proposition("http://b.example", 1.5),
        ];
        let winner = perform_auction(&propositions).unwrap();
        assert_eq!(winner.partner, "http://a.example");
    }

    proptest! {
        #[test]
        fn final_auction_picks_the_strict_maximum(
            values in prop::collection::vec(0.0f64..10.0, 1..8)
        ) {
            let propositions: Vec<AdProposition> = values
                .iter()
                .enumerate()
                .map(|(i, v)| proposition(&format!("http://partner{}.example", i), *v))
                .collect();
            let max = values.iter().cloned().fold(0.0f64, f64::max);
            match perform_auction(&propositions) {
                Some(winner) => {
                    prop_assert!(max > 0.0);
                    prop_assert_eq!(winner.value, max);
                    // 平局时取枚举顺序里第一个到达最大值的提案
                    let first_at_max = values.iter().position(|v| *v == max).unwrap();
                    prop_assert_eq!(&winner.partner, &propositions[first_at_max].partner);
                }
                None => prop_assert!(max <= 0.0),
            }
        }
    }

    fn product(owner: &str, id: &str) -> FetchedProduct {
        FetchedProduct {
            owner: owner.to_string(),
            product_id: id.to_string(),
            iframe_content: format!("<html><body>{}</body></html>", id),
        }
    }

    fn product_level_ad(partner: &str, group_id: &str, owner: &str) -> FetchedAd {
        FetchedAd {
            id: group_id.to_string(),
            group_name: Some(group_id.to_string()),
            ad_type: AdKind::InterestGroup,
            iframe_content: "<html></html>".to_string(),
            interest_group_signals: Some(json!({"owner": owner})),
            bid_function_src: None,
            bid_function: Some("1".to_string()),
            products_count: Some(2),
            products_owner: Some(owner.to_string()),
            ad_partner: partner.to_string(),
            compiled: OnceCell::new(),
        }
    }

    #[test]
    fn product_resolution_substitutes_missing_products() {
        let storage = ScopedStorage::in_memory("http://localhost:8008");
        let logger = Arc::new(OpLogger::new(storage.clone(), "http://publisher.example", true));
        let partner = "http://localhost:8007";
        let owner = "sportequipment.pl";
        let group_id = "sportequipment.pl_bike_parts";

        let mut groups = InterestGroupMap::default();
        groups.insert(
            group_id.to_string(),
            InterestGroup {
                owner: owner.to_string(),
                name: "bike_parts".to_string(),
                readers: vec![partner.to_string()],
                products: Some(vec!["prod-a".to_string(), "prod-b".to_string()]),
                timeout: None,
            },
        );
        storage.write_json(INTEREST_GROUPS_KEY, &groups);

        // prod-b 没缓存到，但同 owner 还有 prod-c 可顶替
        let mut products = PartnerProductsMap::default();
        let owner_products = products.entry(owner.to_string()).or_default();
        owner_products.insert("prod-a".to_string(), product(owner, "prod-a"));
        owner_products.insert("prod-c".to_string(), product(owner, "prod-c"));
        storage.write_json(&keys::fetched_products_key(partner), &products);

        let ad = product_level_ad(partner, group_id, owner);
        let resolved = resolve_products(&storage, &ad, &logger).unwrap();
        assert_eq!(resolved.len(), 2);
        // 没有空洞：每个元素都是真实缓存过的产品
        assert!(resolved
            .iter()
            .all(|p| p.product_id == "prod-a" || p.product_id == "prod-c"));
    }

    #[test]
    fn product_ids_without_any_candidate_are_dropped() {
        let storage = ScopedStorage::in_memory("http://localhost:8008");
        let logger = Arc::new(OpLogger::new(storage.clone(), "http://publisher.example", true));
        let partner = "http://localhost:8007";
        let owner = "sportequipment.pl";
        let group_id = "sportequipment.pl_bike_parts";

        let mut groups = InterestGroupMap::default();
        groups.insert(
            group_id.to_string(),
            InterestGroup {
                owner: owner.to_string(),
                name: "bike_parts".to_string(),
                readers: vec![partner.to_string()],
                products: Some(vec!["prod-a".to_string()]),
                timeout: None,
            },
        );
        storage.write_json(INTEREST_GROUPS_KEY, &groups);

        let ad = product_level_ad(partner, group_id, owner);
        assert!(resolve_products(&storage, &ad, &logger).is_none());
    }

    #[test]
    fn winner_history_appends_and_reads_newest_first() {
        let storage = ScopedStorage::in_memory("http://localhost:8008");
        let first = AdProposition {
            ad: Some(FetchedAd::no_ad()),
            ..proposition("http://a.example", 1.0)
        };
        let second = AdProposition {
            ad: Some(FetchedAd::no_ad()),
            ..proposition("http://b.example", 2.0)
        };
        save_winner(&storage, &first, "http://publisher.example", None);
        save_winner(&storage, &second, "http://publisher.example", None);

        let winners = list_winners(&storage);
        assert_eq!(winners.len(), 2);
        assert_eq!(winners[0].bid_value, 2.0);
        assert_eq!(winners[1].bid_value, 1.0);
    }

    /// 端到端：partner1 的 contextual 出 0.15、兴趣组广告出 baseValue(2.8)+ownerBonus(1)=3.8，
    /// partner2 完全联系不上 → 终局竞价应选中 3.8 的兴趣组广告并落一条 WinnerRecord。
    #[tokio::test]
    async fn end_to_end_auction_with_one_unreachable_partner() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let base = format!("http://127.0.0.1:{}", port);
        let app = crate::mock_partner::app(&base);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let storage = ScopedStorage::in_memory("http://localhost:8008");
        let settings = AuctionSettings {
            context_bid_timeout_ms: 3000,
            ..Default::default()
        };
        let store = InterestGroupStore::new(storage.clone(), settings.clone());
        let site = "http://aboutanimals.pl";
        let logger = Arc::new(OpLogger::new(storage.clone(), site, true));

        store.join(
            InterestGroup {
                owner: "catordog.pl".to_string(),
                name: "cat_lovers".to_string(),
                readers: vec![base.clone()],
                products: None,
                timeout: None,
            },
            Some(600_000),
            true,
            &logger,
        );

        // 等后台拉取任务把广告写进缓存
        let ads_key = keys::fetched_ads_key(&base);
        let mut cached = false;
        for _ in 0..100 {
            if let Some(ads) = storage.read_json::<PartnerAdsMap>(&ads_key) {
                if ads.values().any(|group_ads| !group_ads.is_empty()) {
                    cached = true;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(cached, "mock partner ads were never cached");

        let config = Arc::new(ConfigManager::new(PartnerRegistry::new(), settings));
        let sandbox = BiddingSandbox::default();
        let context_request = json!({
            "site": site,
            "topic": "animals",
            "placement": {"side": "right"},
        });
        let mut bid_requests = BTreeMap::new();
        bid_requests.insert(base.clone(), context_request.clone());
        bid_requests.insert("http://127.0.0.1:1".to_string(), context_request);

        let (instruction, auction_log) =
            process_rendering_request(&bid_requests, site, &config, &storage, &store, &sandbox)
                .await;

        assert!((instruction.bid_value - 3.8).abs() < 1e-9);
        assert_eq!(instruction.ad_type, AdKind::InterestGroup);
        assert_eq!(auction_log.status, "success");
        assert_eq!(auction_log.winning_partner.as_deref(), Some(base.as_str()));

        let winners = list_winners(&storage);
        assert_eq!(winners.len(), 1);
        assert!((winners[0].bid_value - 3.8).abs() < 1e-9);
        assert_eq!(winners[0].site, site);
    }
}
