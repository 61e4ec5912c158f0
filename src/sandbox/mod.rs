//! 竞价函数沙箱。
//!
//! 伙伴提供的竞价函数不会被编译成宿主代码（`new Function(...)` 式的动态
//! 求值会把宿主环境整个暴露给伙伴），而是解析为一门受限表达式语言的 AST，
//! 在带步数与墙钟预算的解释器里执行。求值只能看到传入的两个信号 JSON，
//! 碰不到任何宿主状态。
//!
//! 源码形如：
//!
//! ```text
//! (ctxSig, igSig) =>
//!   matchesAny(ctxSig.deniedTerms, igSig.name)
//!     ? 0
//!     : (igSig.baseValue ?? 0) + (ctxSig.igOwnerBonus[igSig.owner] ?? 0)
//! ```
//!
//! 任何解析错误、类型错误、预算超限、非数值/负值结果在调用边界统一折算为
//! 出价 0，绝不向竞价主流程抛异常。

mod eval;
mod parser;

pub use eval::EvalError;
pub use parser::ParseError;

use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use crate::model::ad::FetchedAd;
use eval::{Evaluator, Val};

/// 编译完成的竞价函数（表达式 AST）
#[derive(Debug, Clone)]
pub struct CompiledBidFunction {
    expr: parser::Expr,
}

/// 把竞价函数源码编译为可重复执行的 AST
pub fn compile(src: &str) -> Result<CompiledBidFunction, ParseError> {
    parser::parse(src).map(|expr| CompiledBidFunction { expr })
}

/// **竞价函数沙箱**
/// 对执行加硬预算：步数上限与墙钟上限，超限按出价 0 处理。
#[derive(Debug, Clone)]
pub struct BiddingSandbox {
    pub max_steps: u64,
    pub time_budget: Duration,
}

impl Default for BiddingSandbox {
    fn default() -> Self {
        Self {
            max_steps: 10_000,
            time_budget: Duration::from_millis(50),
        }
    }
}

impl BiddingSandbox {
    /// 执行一个已编译的竞价函数，结果收敛为非负有限数
    pub fn run(
        &self,
        func: &CompiledBidFunction,
        ctx_signals: &Value,
        ig_signals: &Value,
    ) -> Result<f64, EvalError> {
        let mut evaluator = Evaluator::new(ctx_signals, ig_signals, self.max_steps, self.time_budget);
        let val = evaluator.eval(&func.expr)?;
        Ok(match val {
            Val::Num(n) if n.is_finite() && n >= 0.0 => n,
            other => {
                warn!("bidding function returned non-bid value {:?}, coerced to 0", other);
                0.0
            }
        })
    }

    /// 评估一个缓存广告的出价。任何失败都折算为 0 并记录，异常不外泄。
    pub fn evaluate_bid(&self, ad: &FetchedAd, ctx_signals: &Value) -> f64 {
        let empty = Value::Null;
        let ig_signals = ad.interest_group_signals.as_ref().unwrap_or(&empty);
        let func = match ad.compiled_bid_function() {
            Ok(func) => func,
            Err(e) => {
                warn!("cannot compile bidding function of ad {}: {}", ad.id, e);
                return 0.0;
            }
        };
        match self.run(func, ctx_signals, ig_signals) {
            Ok(value) => value,
            Err(e) => {
                warn!("bidding function of ad {} failed: {}", ad.id, e);
                0.0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::OnceCell;
    use serde_json::json;

    const CANONICAL_FN: &str = "(ctxSig, igSig) => \
        matchesAny(ctxSig.deniedTerms, igSig.name) \
            ? 0 \
            : (igSig.baseValue ?? 0) + (ctxSig.igOwnerBonus[igSig.owner] ?? 0)";

    fn ad_with_function(src: &str, ig_signals: Value) -> FetchedAd {
        FetchedAd {
            id: "test-ad".to_string(),
            group_name: Some("catordog.pl_cat_lovers".to_string()),
            ad_type: Default::default(),
            iframe_content: "<html></html>".to_string(),
            interest_group_signals: Some(ig_signals),
            bid_function_src: None,
            bid_function: Some(src.to_string()),
            products_count: None,
            products_owner: None,
            ad_partner: "http://localhost:8007".to_string(),
            compiled: OnceCell::new(),
        }
    }

    #[test]
    fn canonical_function_adds_base_value_and_owner_bonus() {
        let sandbox = BiddingSandbox::default();
        let ctx = json!({"topic": "animals", "igOwnerBonus": {"catordog.pl": 1}});
        let ig = json!({"owner": "catordog.pl", "name": "cat_lovers", "baseValue": 2.8});
        let ad = ad_with_function(CANONICAL_FN, ig);
        assert!((sandbox.evaluate_bid(&ad, &ctx) - 3.8).abs() < 1e-9);
    }

    #[test]
    fn denied_terms_veto_the_bid() {
        let sandbox = BiddingSandbox::default();
        let ctx = json!({"deniedTerms": ["cat"], "igOwnerBonus": {}});
        let ig = json!({"owner": "catordog.pl", "name": "cat_lovers", "baseValue": 2.8});
        let ad = ad_with_function(CANONICAL_FN, ig);
        assert_eq!(sandbox.evaluate_bid(&ad, &ctx), 0.0);
    }

    #[test]
    fn missing_signals_fall_back_to_zero() {
        let sandbox = BiddingSandbox::default();
        let ad = ad_with_function(CANONICAL_FN, json!({"owner": "x", "name": "y"}));
        // contextual 请求失败时 context signals 为 null
        assert_eq!(sandbox.evaluate_bid(&ad, &Value::Null), 0.0);
    }

    #[test]
    fn parse_error_yields_zero_bid() {
        let sandbox = BiddingSandbox::default();
        let ad = ad_with_function("document.cookie", json!({}));
        assert_eq!(sandbox.evaluate_bid(&ad, &json!({})), 0.0);
    }

    #[test]
    fn missing_source_yields_zero_bid() {
        let sandbox = BiddingSandbox::default();
        let mut ad = ad_with_function("1", json!({}));
        ad.bid_function = None;
        assert_eq!(sandbox.evaluate_bid(&ad, &json!({})), 0.0);
    }

    #[test]
    fn non_numeric_and_negative_results_coerce_to_zero() {
        let sandbox = BiddingSandbox::default();
        for src in ["'not a number'", "-5", "1 / 0", "true"] {
            let ad = ad_with_function(src, json!({}));
            assert_eq!(sandbox.evaluate_bid(&ad, &json!({})), 0.0, "src = {}", src);
        }
    }

    #[test]
    fn type_errors_never_propagate() {
        let sandbox = BiddingSandbox::default();
        // null 参与算术是类型错误而不是 panic
        let ad = ad_with_function("ig.missing + 1", json!({}));
        assert_eq!(sandbox.evaluate_bid(&ad, &json!({})), 0.0);
    }

    #[test]
    fn step_budget_bounds_execution() {
        let sandbox = BiddingSandbox {
            max_steps: 16,
            time_budget: Duration::from_millis(50),
        };
        let long_chain = (0..64).map(|_| "1").collect::<Vec<_>>().join(" + ");
        let func = compile(&long_chain).unwrap();
        assert_eq!(
            sandbox.run(&func, &json!({}), &json!({})),
            Err(EvalError::StepBudgetExceeded)
        );
    }

    #[test]
    fn deterministic_for_identical_inputs() {
        let sandbox = BiddingSandbox::default();
        let ctx = json!({"igOwnerBonus": {"a": 0.5}});
        let ig = json!({"owner": "a", "name": "n", "baseValue": 1.25});
        let ad = ad_with_function(CANONICAL_FN, ig);
        let first = sandbox.evaluate_bid(&ad, &ctx);
        for _ in 0..10 {
            assert_eq!(sandbox.evaluate_bid(&ad, &ctx), first);
        }
    }
}
