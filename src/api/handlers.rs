use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::auction::engine::{self, RenderInstruction};
use crate::logging::op_logger::OpLogger;
use crate::model::ad::{InterestGroup, WinnerRecord};
use crate::AppState;

/// host 页面发来的 join/leave 请求体
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct StoreRequest {
    pub interest_group: InterestGroup,
    #[serde(default)]
    pub membership_timeout: Option<u64>, // 毫秒，缺省表示成员资格不过期
}

/// host 页面发来的渲染请求体：伙伴 base URL → 该伙伴自定义的 context bid 请求
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RenderingRequest {
    #[serde(default)]
    pub target_surface_id: Option<String>, // host 页面上承载广告的 surface id
    pub contextual_bid_requests: BTreeMap<String, Value>,
}

fn site_origin(headers: &HeaderMap) -> String {
    headers
        .get(axum::http::header::ORIGIN)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("unknown")
        .to_string()
}

/// **处理 joinAdInterestGroup 请求**
pub async fn handle_join_request(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<StoreRequest>,
) -> StatusCode {
    let site = site_origin(&headers);
    let logger = Arc::new(OpLogger::new(state.storage.clone(), &site, true));
    let group_id = request.interest_group.id();

    // join 自身是同步的，广告/产品拉取在后台任务里继续跑
    state.store.join(
        request.interest_group,
        request.membership_timeout,
        state.config.settings.product_level_enabled,
        &logger,
    );
    logger.save();

    state
        .runtime_logger
        .log(
            "INFO",
            &format!(
                r#"{{ "site": "{}", "turtledove_log": "join_handled", "group": "{}" }}"#,
                site, group_id
            ),
        )
        .await;
    StatusCode::OK
}

/// **处理 leaveAdInterestGroup 请求**
pub async fn handle_leave_request(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<StoreRequest>,
) -> StatusCode {
    let site = site_origin(&headers);
    let logger = Arc::new(OpLogger::new(state.storage.clone(), &site, true));
    let group_id = request.interest_group.id();

    state.store.leave(&request.interest_group, &logger);
    logger.save();

    state
        .runtime_logger
        .log(
            "INFO",
            &format!(
                r#"{{ "site": "{}", "turtledove_log": "leave_handled", "group": "{}" }}"#,
                site, group_id
            ),
        )
        .await;
    StatusCode::OK
}

/// **处理 renderAds 请求**
pub async fn handle_render_request(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<RenderingRequest>,
) -> (StatusCode, Json<RenderInstruction>) {
    let site = site_origin(&headers);

    let (mut instruction, auction_log) = engine::process_rendering_request(
        &request.contextual_bid_requests,
        &site,
        &state.config,
        &state.storage,
        &state.store,
        &state.sandbox,
    )
    .await;
    instruction.target_surface_id = request.target_surface_id;

    if let Ok(serialized) = serde_json::to_string(&auction_log) {
        let level = if auction_log.status == "success" { "INFO" } else { "ERROR" };
        state.runtime_logger.log(level, &serialized).await;
    }

    // ✅ 渲染永远有内容可画：没有胜者时返回的是 no-ad 兜底
    (StatusCode::OK, Json(instruction))
}

/// **查询竞价胜出历史（最新在前）**
pub async fn handle_list_winners(State(state): State<Arc<AppState>>) -> Json<Vec<WinnerRecord>> {
    Json(engine::list_winners(&state.storage))
}
