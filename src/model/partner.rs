use proptest::prelude::*;
use proptest::strategy::{Just, ValueTree};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// **广告网络伙伴（Partner）的基础信息**
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Partner {
    pub id: u64,              // 伙伴 ID（由 PartnerRegistry 分配，从 1 开始增长）
    pub name: String,         // 伙伴名称（不包含空格，并以 _network 结尾）
    pub url: String,          // 伙伴 base URL（fetch-ads / fetch-contextual-bid 等路由的前缀）
    pub status: bool,         // 是否启用
    pub timeout: Option<u64>, // 该伙伴 contextual-bid 的超时（毫秒），至少 100
}

impl Partner {
    pub fn new(id: u64, name: &str, url: &str, status: bool, timeout: Option<u64>) -> Self {
        Self {
            id,
            name: name.to_string(),
            url: url.to_string(),
            status,
            timeout,
        }
    }
}

/// **伙伴注册表**
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PartnerRegistry {
    pub partners: HashMap<u64, Partner>,
}

impl PartnerRegistry {
    /// 创建一个新的 PartnerRegistry
    pub fn new() -> Self {
        Self {
            partners: HashMap::new(),
        }
    }

    /// 添加 Partner
    pub fn add_partner(&mut self, partner: Partner) {
        self.partners.insert(partner.id, partner);
    }

    /// 删除 Partner
    pub fn remove_partner(&mut self, partner_id: u64) {
        self.partners.remove(&partner_id);
    }

    /// 获取 Partner 对象
    pub fn get_partner(&self, partner_id: u64) -> Option<&Partner> {
        self.partners.get(&partner_id)
    }

    /// 按 base URL 查找 Partner（竞价时用来取每个伙伴的超时配置）
    pub fn find_by_url(&self, url: &str) -> Option<&Partner> {
        self.partners.values().find(|p| p.url == url)
    }

    /// 获取所有 active 的伙伴（status 为 true 的 Partner）
    pub fn active_partners(&self) -> Vec<Partner> {
        self.partners.values().filter(|p| p.status).cloned().collect()
    }
}

impl Default for PartnerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// 使用 proptest 生成随机的 Partner
/// 其中 URL 固定为指向本地 8007 的 mock 伙伴服务，即 "http://localhost:8007"
/// id 使用占位值 0，后续在 PartnerRegistry 中统一赋值；
/// timeout 值在 [100, 1000) 范围内生成；
/// 名称由正则表达式 "[a-zA-Z]{5,15}" 生成（不含空格），然后追加后缀 "_network"
fn generate_partner() -> impl Strategy<Value = Partner> {
    (
        Just(0u64), // 占位 id
        // 生成 5 到 15 个字母，不包含空格，然后追加 "_network"
        "[a-zA-Z]{5,15}".prop_map(|s| format!("{}{}", s, "_network")),
        Just("http://localhost:8007".to_string()),
        any::<bool>(),
        prop::option::of(100..1000u64),
    )
        .prop_map(|(_dummy_id, name, url, status, timeout)| Partner {
            id: 0,
            name,
            url,
            status,
            timeout,
        })
}

/// 使用 proptest 生成随机的 PartnerRegistry
/// 生成 2~4 个 Partner 后，检查是否至少有一个 active（status 为 true），
/// 如果没有，则将第一个 Partner 的 status 置为 true；同时为所有 Partner 分配顺序 id（从 1 开始）
fn generate_partner_registry() -> impl Strategy<Value = PartnerRegistry> {
    prop::collection::vec(generate_partner(), 2..4).prop_map(|mut partners| {
        // 如果没有 active 伙伴，则将第一个的 status 设为 true
        if !partners.iter().any(|p| p.status) {
            if let Some(first) = partners.first_mut() {
                first.status = true;
            }
        }
        // 为每个 Partner 分配顺序 id，从 1 开始
        for (i, partner) in partners.iter_mut().enumerate() {
            partner.id = (i as u64) + 1;
        }
        let mut registry = PartnerRegistry::new();
        for partner in partners {
            registry.add_partner(partner);
        }
        registry
    })
}

/// 初始化并生成一个随机的 PartnerRegistry，并打印生成的信息
/// （static/partners.json 缺失时的演示兜底）
pub fn init() -> PartnerRegistry {
    let mut runner = proptest::test_runner::TestRunner::default();
    let registry = generate_partner_registry()
        .new_tree(&mut runner)
        .unwrap()
        .current();

    println!("Generated PartnerRegistry with {} Partners", registry.partners.len());
    for partner in registry.partners.values() {
        println!(
            "ID: {}, Name: {}, URL: {}, Status: {}, Timeout: {:?}",
            partner.id, partner.name, partner.url, partner.status, partner.timeout
        );
    }

    // 打印 active 伙伴（status 为 true）的信息
    let active_partners = registry.active_partners();
    println!("\nActive partners:");
    for partner in active_partners {
        println!(
            "ID: {}, Name: {}, URL: {}, Timeout: {:?}",
            partner.id, partner.name, partner.url, partner.timeout
        );
    }

    registry
}
