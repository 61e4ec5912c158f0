// src/store/interest_groups.rs

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use reqwest::Client;
use tokio::time::{timeout, Duration};

use crate::config::config_manager::AuctionSettings;
use crate::logging::op_logger::OpLogger;
use crate::model::ad::{FetchedAd, FetchedProduct, InterestGroup, InterestGroupMap, PartnerAdsMap, PartnerProductsMap};
use crate::store::keys::{self, ACTIVE_PARTNERS_KEY, INTEREST_GROUPS_KEY};
use crate::store::storage::ScopedStorage;

/// **兴趣组存储**
/// join/leave 的主入口。join 落盘成员资格后，对每个 reader 发起
/// fire-and-forget 的广告/产品拉取；单个伙伴的网络失败只记日志，
/// 不会阻塞其他伙伴，也不会让 join 本身失败。
pub struct InterestGroupStore {
    storage: ScopedStorage,
    client: Client,
    settings: AuctionSettings,
}

impl InterestGroupStore {
    pub fn new(storage: ScopedStorage, settings: AuctionSettings) -> Self {
        Self {
            storage,
            client: Client::new(),
            settings,
        }
    }

    /// 加入兴趣组：upsert 成员资格，异步拉取候选广告（以及产品），
    /// 最后把 readers 并入 active-partners。
    pub fn join(
        &self,
        group: InterestGroup,
        membership_timeout_ms: Option<u64>,
        product_level_enabled: bool,
        logger: &Arc<OpLogger>,
    ) {
        self.prune_expired(logger);
        self.store_interest_group(group.clone(), membership_timeout_ms, logger);
        self.fetch_new_ads(&group, logger);
        if product_level_enabled {
            self.fetch_new_products(&group, logger);
        }
        self.update_active_partners(&group.readers);
    }

    /// 离开兴趣组：删除成员资格并清掉每个伙伴为该组缓存的广告
    pub fn leave(&self, group: &InterestGroup, logger: &Arc<OpLogger>) {
        let group_id = group.id();
        let mut all: InterestGroupMap = self
            .storage
            .read_json(INTEREST_GROUPS_KEY)
            .unwrap_or_default();
        if all.remove(&group_id).is_some() {
            logger.log(&format!("Leaving known group: {}", group_id));
            // warning: not thread safe, 与 join 并发时可能互相覆盖
            self.storage.write_json(INTEREST_GROUPS_KEY, &all);
        } else {
            logger.log(&format!("Trying to leave not found group: {}", group_id));
        }
        self.remove_ads(&group_id, logger);
        self.update_active_partners(&[]);
    }

    fn store_interest_group(
        &self,
        mut group: InterestGroup,
        membership_timeout_ms: Option<u64>,
        logger: &Arc<OpLogger>,
    ) {
        let mut all: InterestGroupMap = self
            .storage
            .read_json(INTEREST_GROUPS_KEY)
            .unwrap_or_default();
        let group_id = group.id();
        if all.contains_key(&group_id) {
            logger.log(&format!("Already known group: {}", group_id));
        } else {
            logger.log(&format!("New interest group: {}", group_id));
        }
        if group.timeout.is_none() {
            if let Some(ms) = membership_timeout_ms {
                let expiry = Utc::now() + chrono::Duration::milliseconds(ms as i64);
                group.timeout = Some(expiry.to_rfc3339());
            }
        }
        all.insert(group_id, group);
        self.storage.write_json(INTEREST_GROUPS_KEY, &all);
    }

    /// 清掉每个 active 伙伴为该组缓存的广告
    fn remove_ads(&self, group_id: &str, logger: &Arc<OpLogger>) {
        let active: Vec<String> = self
            .storage
            .read_json(ACTIVE_PARTNERS_KEY)
            .unwrap_or_default();
        for partner in &active {
            let key = keys::fetched_ads_key(partner);
            let mut ads: PartnerAdsMap = self.storage.read_json(&key).unwrap_or_default();
            if ads.remove(group_id).is_some() {
                logger.log(&format!("Removed ads for group {}.", group_id));
                self.storage.write_json(&key, &ads);
            }
        }
    }

    /// 维护 active-partners：并入新出现的 reader，
    /// 清掉广告缓存已空的伙伴（除非它也在本次新增名单里）。
    pub fn update_active_partners(&self, added_readers: &[String]) {
        let active: Vec<String> = self
            .storage
            .read_json(ACTIVE_PARTNERS_KEY)
            .unwrap_or_default();
        let new_partners: Vec<String> = added_readers
            .iter()
            .filter(|partner| !active.contains(partner))
            .cloned()
            .collect();
        let mut partners_to_remove = Vec::new();
        for partner in &active {
            let ads: PartnerAdsMap = self
                .storage
                .read_json(&keys::fetched_ads_key(partner))
                .unwrap_or_default();
            if ads.values().all(|group_ads| group_ads.is_empty()) {
                partners_to_remove.push(partner.clone());
            }
        }
        if !new_partners.is_empty() || !partners_to_remove.is_empty() {
            let updated: Vec<String> = active
                .into_iter()
                .chain(new_partners)
                .filter(|p| !partners_to_remove.contains(p) || added_readers.contains(p))
                .collect();
            self.storage.write_json(ACTIVE_PARTNERS_KEY, &updated);
        }
    }

    /// 清理已过期的成员资格及其缓存广告（join 与每次竞价前调用）
    pub fn prune_expired(&self, logger: &Arc<OpLogger>) {
        let now = Utc::now();
        let mut all: InterestGroupMap = self
            .storage
            .read_json(INTEREST_GROUPS_KEY)
            .unwrap_or_default();
        let expired: Vec<String> = all
            .iter()
            .filter(|(_, group)| group.is_expired(now))
            .map(|(id, _)| id.clone())
            .collect();
        if expired.is_empty() {
            return;
        }
        for group_id in &expired {
            all.remove(group_id);
            logger.log(&format!("Membership of group {} expired.", group_id));
        }
        self.storage.write_json(INTEREST_GROUPS_KEY, &all);
        for group_id in &expired {
            self.remove_ads(group_id, logger);
        }
        self.update_active_partners(&[]);
    }

    /// 对每个 reader 发起 fetch-ads 调用，fire-and-forget
    fn fetch_new_ads(&self, group: &InterestGroup, logger: &Arc<OpLogger>) {
        let fetch_timeout = Duration::from_millis(self.settings.ad_fetch_timeout_ms);
        let group_id = group.id();
        for reader in &group.readers {
            let client = self.client.clone();
            let storage = self.storage.clone();
            let logger = Arc::clone(logger);
            let reader = reader.clone();
            let group_id = group_id.clone();
            tokio::spawn(async move {
                if let Err(reason) =
                    fetch_ads_from_reader(&client, &storage, &reader, &group_id, fetch_timeout, &logger).await
                {
                    logger.log(&format!(
                        "Request to {} for {} failed: {}",
                        reader, group_id, reason
                    ));
                }
            });
        }
    }

    /// 对每个 reader、每个产品 id 发起 fetch-products 调用，fire-and-forget
    fn fetch_new_products(&self, group: &InterestGroup, logger: &Arc<OpLogger>) {
        let products = match &group.products {
            Some(products) => products.clone(),
            None => return,
        };
        let fetch_timeout = Duration::from_millis(self.settings.product_fetch_timeout_ms);
        for reader in &group.readers {
            for product_id in &products {
                let client = self.client.clone();
                let storage = self.storage.clone();
                let logger = Arc::clone(logger);
                let reader = reader.clone();
                let owner = group.owner.clone();
                let product_id = product_id.clone();
                tokio::spawn(async move {
                    if let Err(reason) = fetch_product_from_reader(
                        &client,
                        &storage,
                        &reader,
                        &owner,
                        &product_id,
                        fetch_timeout,
                        &logger,
                    )
                    .await
                    {
                        logger.log(&format!(
                            "Request to {} for {} failed: {}",
                            reader, product_id, reason
                        ));
                    }
                });
            }
        }
    }
}

/// 从一个 reader 拉取候选广告并缓存。
/// 每个候选广告的竞价函数源码单独下载；下载失败的候选直接丢弃，
/// 部分成功是可接受的结果。
async fn fetch_ads_from_reader(
    client: &Client,
    storage: &ScopedStorage,
    reader: &str,
    group_id: &str,
    fetch_timeout: Duration,
    logger: &Arc<OpLogger>,
) -> Result<(), String> {
    let request = client
        .get(format!("{}/fetch-ads", reader))
        .query(&[("interest_group", group_id)]);
    let response = timeout(fetch_timeout, request.send())
        .await
        .map_err(|_| "timeout".to_string())?
        .map_err(|e| e.to_string())?;
    let candidates: Vec<FetchedAd> = timeout(fetch_timeout, response.json())
        .await
        .map_err(|_| "timeout".to_string())?
        .map_err(|e| e.to_string())?;

    let enriched = join_all(
        candidates
            .into_iter()
            .map(|ad| enrich_ad_with_bidding_function(client, ad, fetch_timeout, logger)),
    )
    .await;

    let key = keys::fetched_ads_key(reader);
    let mut all: PartnerAdsMap = storage.read_json(&key).unwrap_or_default();
    let group_ads = all.entry(group_id.to_string()).or_default();
    for mut ad in enriched.into_iter().flatten() {
        ad.group_name.get_or_insert_with(|| group_id.to_string());
        if group_ads.contains_key(&ad.id) {
            logger.log(&format!("Refreshed ad {} from {}.", ad.id, ad.ad_partner));
        } else {
            logger.log(&format!("Fetched new ad {} from {}.", ad.id, ad.ad_partner));
        }
        group_ads.insert(ad.id.clone(), ad);
    }
    storage.write_json(&key, &all);
    Ok(())
}

/// 下载候选广告的竞价函数源码并填进 `bid_function`
async fn enrich_ad_with_bidding_function(
    client: &Client,
    mut ad: FetchedAd,
    fetch_timeout: Duration,
    logger: &Arc<OpLogger>,
) -> Option<FetchedAd> {
    let src_url = match &ad.bid_function_src {
        Some(url) => url.clone(),
        None => {
            logger.log(&format!("Ad {} carries no bid function address", ad.id));
            return None;
        }
    };
    let response = match timeout(fetch_timeout, client.get(&src_url).send()).await {
        Ok(Ok(response)) => response,
        _ => {
            logger.log(&format!("Cannot download bid function for {}", ad.id));
            return None;
        }
    };
    if !response.status().is_success() {
        logger.log(&format!(
            "Request for bid function of ad {} returned {}",
            ad.id,
            response.status()
        ));
        return None;
    }
    match timeout(fetch_timeout, response.text()).await {
        Ok(Ok(source)) => {
            ad.bid_function = Some(source);
            Some(ad)
        }
        _ => {
            logger.log(&format!("Cannot download bid function for {}", ad.id));
            None
        }
    }
}

/// 从一个 reader 拉取单个产品并缓存到 `(owner, productId)` 下
async fn fetch_product_from_reader(
    client: &Client,
    storage: &ScopedStorage,
    reader: &str,
    owner: &str,
    product_id: &str,
    fetch_timeout: Duration,
    logger: &Arc<OpLogger>,
) -> Result<(), String> {
    let request = client
        .get(format!("{}/fetch-products", reader))
        .query(&[("owner", owner), ("product", product_id)]);
    let response = timeout(fetch_timeout, request.send())
        .await
        .map_err(|_| "timeout".to_string())?
        .map_err(|e| e.to_string())?;
    let product: FetchedProduct = timeout(fetch_timeout, response.json())
        .await
        .map_err(|_| "timeout".to_string())?
        .map_err(|e| e.to_string())?;

    let key = keys::fetched_products_key(reader);
    let mut all: PartnerProductsMap = storage.read_json(&key).unwrap_or_default();
    let owner_products = all.entry(product.owner.clone()).or_default();
    if owner_products.contains_key(&product.product_id) {
        logger.log(&format!(
            "Refreshed existing product {} from {} requested by a partner {}",
            product.product_id, product.owner, reader
        ));
    } else {
        logger.log(&format!(
            "Saved new product {} from {} requested by a partner {}",
            product.product_id, product.owner, reader
        ));
    }
    owner_products.insert(product.product_id.clone(), product);
    storage.write_json(&key, &all);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ad::AdKind;
    use once_cell::sync::OnceCell;

    fn test_store() -> (InterestGroupStore, ScopedStorage, Arc<OpLogger>) {
        let storage = ScopedStorage::in_memory("http://localhost:8008");
        let store = InterestGroupStore::new(storage.clone(), AuctionSettings::default());
        let logger = Arc::new(OpLogger::new(storage.clone(), "http://publisher.example", true));
        (store, storage, logger)
    }

    fn group(owner: &str, name: &str, readers: &[&str]) -> InterestGroup {
        InterestGroup {
            owner: owner.to_string(),
            name: name.to_string(),
            readers: readers.iter().map(|r| r.to_string()).collect(),
            products: None,
            timeout: None,
        }
    }

    fn dummy_ad(id: &str, partner: &str) -> FetchedAd {
        FetchedAd {
            id: id.to_string(),
            group_name: None,
            ad_type: AdKind::InterestGroup,
            iframe_content: "<html></html>".to_string(),
            interest_group_signals: None,
            bid_function_src: None,
            bid_function: Some("1".to_string()),
            products_count: None,
            products_owner: None,
            ad_partner: partner.to_string(),
            compiled: OnceCell::new(),
        }
    }

    fn seed_partner_ads(storage: &ScopedStorage, partner: &str, group_id: &str, ad_id: &str) {
        let mut ads = PartnerAdsMap::default();
        ads.entry(group_id.to_string())
            .or_default()
            .insert(ad_id.to_string(), dummy_ad(ad_id, partner));
        storage.write_json(&keys::fetched_ads_key(partner), &ads);
    }

    #[tokio::test]
    async fn join_then_leave_leaves_no_residue() {
        let (store, storage, logger) = test_store();
        // 指向没有服务监听的端口，拉取会失败且只留日志
        let group = group("catordog.pl", "cat_lovers", &["http://127.0.0.1:1"]);
        store.join(group.clone(), None, true, &logger);
        store.leave(&group, &logger);

        let groups: InterestGroupMap = storage.read_json(INTEREST_GROUPS_KEY).unwrap_or_default();
        assert!(groups.is_empty());
        let ads: PartnerAdsMap = storage
            .read_json(&keys::fetched_ads_key("http://127.0.0.1:1"))
            .unwrap_or_default();
        assert!(ads.values().all(|group_ads| group_ads.is_empty()));
    }

    #[tokio::test]
    async fn leaving_unknown_group_is_a_noop() {
        let (store, storage, logger) = test_store();
        store.leave(&group("nobody.example", "ghosts", &[]), &logger);
        let groups: InterestGroupMap = storage.read_json(INTEREST_GROUPS_KEY).unwrap_or_default();
        assert!(groups.is_empty());
    }

    #[tokio::test]
    async fn rejoin_with_new_readers_unions_active_partners() {
        let (store, storage, logger) = test_store();
        let first_reader = "http://127.0.0.1:1";
        let second_reader = "http://127.0.0.1:2";

        store.join(group("catordog.pl", "cat_lovers", &[first_reader]), None, true, &logger);
        // 模拟第一个伙伴已经缓存到广告，否则它会因缓存为空被清出去
        seed_partner_ads(&storage, first_reader, "catordog.pl_cat_lovers", "ad-1");

        store.join(group("catordog.pl", "cat_lovers", &[second_reader]), None, true, &logger);

        let active: Vec<String> = storage.read_json(ACTIVE_PARTNERS_KEY).unwrap_or_default();
        assert!(active.contains(&first_reader.to_string()));
        assert!(active.contains(&second_reader.to_string()));
    }

    #[tokio::test]
    async fn partners_with_empty_cache_are_pruned_unless_just_added() {
        let (store, storage, _logger) = test_store();
        storage.write_json(ACTIVE_PARTNERS_KEY, &vec!["http://127.0.0.1:1".to_string()]);

        // 缓存为空但刚刚加入：保留
        store.update_active_partners(&["http://127.0.0.1:1".to_string()]);
        let active: Vec<String> = storage.read_json(ACTIVE_PARTNERS_KEY).unwrap_or_default();
        assert_eq!(active, vec!["http://127.0.0.1:1".to_string()]);

        // 缓存为空且不在新增名单里：清掉
        store.update_active_partners(&[]);
        let active: Vec<String> = storage.read_json(ACTIVE_PARTNERS_KEY).unwrap_or_default();
        assert!(active.is_empty());
    }

    #[tokio::test]
    async fn expired_membership_is_destroyed_with_its_ads() {
        let (store, storage, logger) = test_store();
        let reader = "http://127.0.0.1:1";
        store.join(group("catordog.pl", "cat_lovers", &[reader]), Some(0), true, &logger);
        seed_partner_ads(&storage, reader, "catordog.pl_cat_lovers", "ad-1");
        storage.write_json(ACTIVE_PARTNERS_KEY, &vec![reader.to_string()]);

        tokio::time::sleep(Duration::from_millis(5)).await;
        store.prune_expired(&logger);

        let groups: InterestGroupMap = storage.read_json(INTEREST_GROUPS_KEY).unwrap_or_default();
        assert!(groups.is_empty());
        let ads: PartnerAdsMap = storage
            .read_json(&keys::fetched_ads_key(reader))
            .unwrap_or_default();
        assert!(ads.values().all(|group_ads| group_ads.is_empty()));
    }

    #[tokio::test]
    async fn explicit_timeout_on_group_is_preserved() {
        let (store, storage, logger) = test_store();
        let mut g = group("catordog.pl", "cat_lovers", &[]);
        g.timeout = Some("2099-01-01T00:00:00+00:00".to_string());
        store.join(g, Some(1), true, &logger);

        let groups: InterestGroupMap = storage.read_json(INTEREST_GROUPS_KEY).unwrap_or_default();
        let stored = groups.get("catordog.pl_cat_lovers").unwrap();
        assert_eq!(stored.timeout.as_deref(), Some("2099-01-01T00:00:00+00:00"));
    }
}
