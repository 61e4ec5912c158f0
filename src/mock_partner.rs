use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{serve, Json, Router};
use once_cell::sync::Lazy;
use rand::Rng;
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::net::TcpListener;
use tokio::time::{sleep, Duration};
use tracing::info;

// 引入 TURTLEDOVE 数据结构，与端上引擎共用同一套 wire 格式
use crate::model::ad::{AdKind, ContextualBidResponse, FetchedAd, FetchedProduct};

/// 伙伴发布的竞价函数（受限表达式语言）：
/// 先做 denied-terms 否决，再算 baseValue + owner bonus
pub const BIDDING_FUNCTION_SRC: &str = "(ctxSig, igSig) =>
  matchesAny(ctxSig.deniedTerms, igSig.name)
    ? 0
    : (igSig.baseValue ?? 0) + (ctxSig.igOwnerBonus[igSig.owner] ?? 0)
";

#[derive(Clone)]
pub struct MockPartnerState {
    pub base: String, // 本伙伴对外的 base URL，写进广告的 adPartner / bidFunctionSrc
}

struct AdDbEntry {
    key: &'static str, // 兴趣组名（按后缀匹配兴趣组复合键）
    base_value: f64,
    products_count: Option<u32>,
}

/// 静态广告库：owner → 该 owner 下有广告素材的兴趣组
static ADS_DB: Lazy<HashMap<&'static str, Vec<AdDbEntry>>> = Lazy::new(|| {
    HashMap::from([
        (
            "catordog.pl",
            vec![
                AdDbEntry { key: "cat_lovers", base_value: 2.8, products_count: None },
                AdDbEntry { key: "dog_lovers", base_value: 2.5, products_count: None },
            ],
        ),
        (
            "trainorplane.pl",
            vec![
                AdDbEntry { key: "train_fans", base_value: 1.9, products_count: None },
                AdDbEntry { key: "plane_fans", base_value: 2.1, products_count: None },
            ],
        ),
        (
            "sportequipment.pl",
            vec![AdDbEntry { key: "bike_parts", base_value: 1.2, products_count: Some(2) }],
        ),
    ])
});

fn generate_ad_html(seed: &str, caption: &str) -> String {
    format!(
        "<html><body style=\"margin:0\"><a href=\"https://{caption}\" target=\"_top\"><img src=\"https://picsum.photos/seed/{seed}/280/180\" alt=\"{caption}\"/></a></body></html>",
        seed = seed,
        caption = caption
    )
}

/// 模拟 fetch-ads：为指定兴趣组返回候选广告列表
async fn handle_fetch_ads(
    State(state): State<MockPartnerState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Vec<FetchedAd>> {
    let interest_group = params.get("interest_group").cloned().unwrap_or_default();
    info!("Mock partner received fetch-ads for: {}", interest_group);

    let owner = interest_group.split('_').next().unwrap_or("").to_string();
    let name = interest_group
        .strip_prefix(&format!("{}_", owner))
        .unwrap_or("")
        .to_string();

    let mut ads = Vec::new();
    if let Some(entries) = ADS_DB.get(owner.as_str()) {
        for entry in entries {
            if !interest_group.ends_with(entry.key) {
                continue;
            }
            ads.push(FetchedAd {
                id: interest_group.clone(),
                group_name: Some(interest_group.clone()),
                ad_type: AdKind::InterestGroup,
                iframe_content: generate_ad_html(&interest_group, &owner),
                interest_group_signals: Some(json!({
                    "owner": owner,
                    "name": name,
                    "baseValue": entry.base_value,
                })),
                bid_function_src: Some(format!("{}/static/bidding-function.js", state.base)),
                bid_function: None,
                products_count: entry.products_count,
                products_owner: entry.products_count.map(|_| owner.clone()),
                ad_partner: state.base.clone(),
                compiled: Default::default(),
            });
        }
    }
    Json(ads)
}

/// 模拟 contextual-bid 应答
/// 按 placement 决定出价，并根据 topic 给相关 owner 发放 bonus 信号。
async fn handle_fetch_contextual_bid(
    State(state): State<MockPartnerState>,
    Json(request): Json<Value>,
) -> Json<ContextualBidResponse> {
    info!("Mock partner received contextual bid request: {}", request);

    // 模拟伙伴的处理延迟（100 ~ 300 毫秒）
    let delay_ms = rand::thread_rng().gen_range(100..300);
    sleep(Duration::from_millis(delay_ms)).await;

    let topic = request
        .get("topic")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();
    let mut ig_owner_bonus = serde_json::Map::new();
    if topic == "animals" {
        ig_owner_bonus.insert("catordog.pl".to_string(), json!(1));
    }
    let denied_terms = request
        .pointer("/adPolicy/deniedTerms")
        .cloned()
        .unwrap_or(Value::Null);
    let context_signals = json!({
        "topic": topic,
        "deniedTerms": denied_terms,
        "igOwnerBonus": ig_owner_bonus,
    });

    // 右侧版位值钱，交通类站点上更值钱
    let side = request
        .pointer("/placement/side")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let site = request.get("site").and_then(|v| v.as_str()).unwrap_or("");
    let is_on_right = side == "right";
    let is_on_transport_site = site.contains("aboutplanes");
    let bid_value = if is_on_right {
        if is_on_transport_site {
            2.0
        } else {
            0.15
        }
    } else {
        0.05
    };

    let ad_id = format!("context_{}-{}", topic, side);
    let contextual_ad = FetchedAd {
        id: ad_id.clone(),
        group_name: None,
        ad_type: AdKind::Contextual,
        iframe_content: generate_ad_html(&ad_id, &topic),
        interest_group_signals: None,
        bid_function_src: None,
        bid_function: None,
        products_count: None,
        products_owner: None,
        ad_partner: state.base.clone(),
        compiled: Default::default(),
    };

    Json(ContextualBidResponse {
        context_signals,
        contextual_ad: Some(contextual_ad),
        contextual_bid_value: Some(bid_value),
    })
}

/// 模拟 fetch-products：按 (owner, product) 返回产品创意
async fn handle_fetch_products(
    Query(params): Query<HashMap<String, String>>,
) -> Json<FetchedProduct> {
    let owner = params.get("owner").cloned().unwrap_or_default();
    let product_id = params.get("product").cloned().unwrap_or_default();
    info!("Mock partner received fetch-products for: {} / {}", owner, product_id);
    let seed = format!("{}-{}", owner, product_id);
    Json(FetchedProduct {
        owner,
        product_id,
        iframe_content: generate_ad_html(&seed, &seed),
    })
}

/// 伙伴发布的竞价函数源码
async fn handle_bidding_function() -> &'static str {
    BIDDING_FUNCTION_SRC
}

pub fn app(base_url: &str) -> Router {
    let state = MockPartnerState {
        base: base_url.to_string(),
    };
    Router::new()
        .route("/fetch-ads", get(handle_fetch_ads))
        .route("/fetch-contextual-bid", post(handle_fetch_contextual_bid))
        .route("/fetch-products", get(handle_fetch_products))
        .route("/static/bidding-function.js", get(handle_bidding_function))
        .with_state(state)
}

/// 启动 Mock 伙伴服务
/// 服务监听指定端口（例如 8007），路由为 fetch-ads / fetch-contextual-bid /
/// fetch-products。请确保端上引擎配置的伙伴 URL 与此一致。
pub async fn start_mock_partner_server(port: u16) {
    let base = format!("http://localhost:{}", port);
    let addr = format!("0.0.0.0:{}", port);
    info!("Mock ad partner running at http://{}", addr);

    let listener = TcpListener::bind(&addr).await.unwrap();
    serve(listener, app(&base)).await.unwrap();
}
