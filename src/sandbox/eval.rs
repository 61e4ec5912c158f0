// src/sandbox/eval.rs

use std::fmt;
use std::time::{Duration, Instant};

use serde_json::Value;

use super::parser::{BinaryOp, Builtin, Expr, UnaryOp};

/// 求值期间的中间值。标量会从 JSON 拆箱，数组/对象保持 JSON 形态。
#[derive(Debug, Clone, PartialEq)]
pub enum Val {
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
    Json(Value),
}

impl Val {
    fn from_json(value: &Value) -> Val {
        match value {
            Value::Null => Val::Null,
            Value::Bool(b) => Val::Bool(*b),
            Value::Number(n) => Val::Num(n.as_f64().unwrap_or(f64::NAN)),
            Value::String(s) => Val::Str(s.clone()),
            other => Val::Json(other.clone()),
        }
    }

    fn truthy(&self) -> bool {
        match self {
            Val::Null => false,
            Val::Bool(b) => *b,
            Val::Num(n) => *n != 0.0 && !n.is_nan(),
            Val::Str(s) => !s.is_empty(),
            Val::Json(_) => true, // from_json 之后只剩数组/对象
        }
    }

    fn as_num(&self, op: &'static str) -> Result<f64, EvalError> {
        match self {
            Val::Num(n) => Ok(*n),
            _ => Err(EvalError::TypeMismatch(op)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EvalError {
    StepBudgetExceeded,
    TimeBudgetExceeded,
    TypeMismatch(&'static str),
    WrongArgCount(&'static str),
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StepBudgetExceeded => write!(f, "bidding function exceeded its step budget"),
            Self::TimeBudgetExceeded => write!(f, "bidding function exceeded its time budget"),
            Self::TypeMismatch(op) => write!(f, "type mismatch in '{}'", op),
            Self::WrongArgCount(name) => write!(f, "wrong argument count for '{}'", name),
        }
    }
}

impl std::error::Error for EvalError {}

/// 单次求值的执行器，持有步数与墙钟预算
pub struct Evaluator<'a> {
    params: [&'a Value; 2],
    steps_left: u64,
    deadline: Instant,
}

impl<'a> Evaluator<'a> {
    pub fn new(ctx: &'a Value, ig: &'a Value, max_steps: u64, time_budget: Duration) -> Self {
        Self {
            params: [ctx, ig],
            steps_left: max_steps,
            deadline: Instant::now() + time_budget,
        }
    }

    fn tick(&mut self) -> Result<(), EvalError> {
        if self.steps_left == 0 {
            return Err(EvalError::StepBudgetExceeded);
        }
        self.steps_left -= 1;
        // 墙钟检查摊薄到每 64 步一次
        if self.steps_left % 64 == 0 && Instant::now() > self.deadline {
            return Err(EvalError::TimeBudgetExceeded);
        }
        Ok(())
    }

    pub fn eval(&mut self, expr: &Expr) -> Result<Val, EvalError> {
        self.tick()?;
        match expr {
            Expr::Num(n) => Ok(Val::Num(*n)),
            Expr::Str(s) => Ok(Val::Str(s.clone())),
            Expr::Bool(b) => Ok(Val::Bool(*b)),
            Expr::Null => Ok(Val::Null),
            Expr::Param(i) => Ok(Val::from_json(self.params[*i])),
            // 缺失字段与对 null 的字段访问都得到 null，交给 `??` 处理
            Expr::Field(base, name) => match self.eval(base)? {
                Val::Json(Value::Object(map)) => {
                    Ok(map.get(name).map(Val::from_json).unwrap_or(Val::Null))
                }
                _ => Ok(Val::Null),
            },
            Expr::Index(base, index) => {
                let base = self.eval(base)?;
                let index = self.eval(index)?;
                match (base, index) {
                    (Val::Json(Value::Object(map)), Val::Str(key)) => {
                        Ok(map.get(&key).map(Val::from_json).unwrap_or(Val::Null))
                    }
                    (Val::Json(Value::Array(items)), Val::Num(n)) => {
                        if n.is_finite() && n >= 0.0 {
                            Ok(items
                                .get(n as usize)
                                .map(Val::from_json)
                                .unwrap_or(Val::Null))
                        } else {
                            Ok(Val::Null)
                        }
                    }
                    _ => Ok(Val::Null),
                }
            }
            Expr::Unary(op, inner) => {
                let val = self.eval(inner)?;
                match op {
                    UnaryOp::Not => Ok(Val::Bool(!val.truthy())),
                    UnaryOp::Neg => Ok(Val::Num(-val.as_num("-")?)),
                }
            }
            Expr::Binary(op, lhs, rhs) => self.eval_binary(*op, lhs, rhs),
            Expr::Ternary(cond, then, otherwise) => {
                if self.eval(cond)?.truthy() {
                    self.eval(then)
                } else {
                    self.eval(otherwise)
                }
            }
            Expr::Call(builtin, args) => self.eval_call(*builtin, args),
        }
    }

    fn eval_binary(&mut self, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> Result<Val, EvalError> {
        // 短路运算符不能先求右侧
        match op {
            BinaryOp::And => {
                let l = self.eval(lhs)?;
                if !l.truthy() {
                    return Ok(Val::Bool(false));
                }
                return Ok(Val::Bool(self.eval(rhs)?.truthy()));
            }
            BinaryOp::Or => {
                let l = self.eval(lhs)?;
                if l.truthy() {
                    return Ok(Val::Bool(true));
                }
                return Ok(Val::Bool(self.eval(rhs)?.truthy()));
            }
            BinaryOp::Coalesce => {
                let l = self.eval(lhs)?;
                if matches!(l, Val::Null) {
                    return self.eval(rhs);
                }
                return Ok(l);
            }
            _ => {}
        }
        let l = self.eval(lhs)?;
        let r = self.eval(rhs)?;
        match op {
            BinaryOp::Add => match (&l, &r) {
                (Val::Str(a), Val::Str(b)) => Ok(Val::Str(format!("{}{}", a, b))),
                _ => Ok(Val::Num(l.as_num("+")? + r.as_num("+")?)),
            },
            BinaryOp::Sub => Ok(Val::Num(l.as_num("-")? - r.as_num("-")?)),
            BinaryOp::Mul => Ok(Val::Num(l.as_num("*")? * r.as_num("*")?)),
            BinaryOp::Div => Ok(Val::Num(l.as_num("/")? / r.as_num("/")?)),
            BinaryOp::Lt => Self::compare(&l, &r, "<", |o| o == std::cmp::Ordering::Less),
            BinaryOp::Le => Self::compare(&l, &r, "<=", |o| o != std::cmp::Ordering::Greater),
            BinaryOp::Gt => Self::compare(&l, &r, ">", |o| o == std::cmp::Ordering::Greater),
            BinaryOp::Ge => Self::compare(&l, &r, ">=", |o| o != std::cmp::Ordering::Less),
            BinaryOp::Eq => Ok(Val::Bool(Self::loose_eq(&l, &r))),
            BinaryOp::Ne => Ok(Val::Bool(!Self::loose_eq(&l, &r))),
            BinaryOp::And | BinaryOp::Or | BinaryOp::Coalesce => unreachable!(),
        }
    }

    fn compare(
        l: &Val,
        r: &Val,
        op: &'static str,
        accept: fn(std::cmp::Ordering) -> bool,
    ) -> Result<Val, EvalError> {
        match (l, r) {
            (Val::Num(a), Val::Num(b)) => match a.partial_cmp(b) {
                Some(ordering) => Ok(Val::Bool(accept(ordering))),
                None => Ok(Val::Bool(false)), // NaN 与任何数都不可比
            },
            (Val::Str(a), Val::Str(b)) => Ok(Val::Bool(accept(a.cmp(b)))),
            _ => Err(EvalError::TypeMismatch(op)),
        }
    }

    fn loose_eq(l: &Val, r: &Val) -> bool {
        match (l, r) {
            (Val::Null, Val::Null) => true,
            (Val::Bool(a), Val::Bool(b)) => a == b,
            (Val::Num(a), Val::Num(b)) => a == b,
            (Val::Str(a), Val::Str(b)) => a == b,
            (Val::Json(a), Val::Json(b)) => a == b,
            _ => false,
        }
    }

    fn eval_call(&mut self, builtin: Builtin, args: &[Expr]) -> Result<Val, EvalError> {
        match builtin {
            Builtin::Includes => {
                if args.len() != 2 {
                    return Err(EvalError::WrongArgCount("includes"));
                }
                let haystack = self.eval(&args[0])?;
                let needle = self.eval(&args[1])?;
                match (haystack, needle) {
                    (Val::Str(h), Val::Str(n)) => Ok(Val::Bool(h.contains(&n))),
                    _ => Ok(Val::Bool(false)), // 任一侧缺失时视为不匹配
                }
            }
            Builtin::MatchesAny => {
                if args.len() != 2 {
                    return Err(EvalError::WrongArgCount("matchesAny"));
                }
                let list = self.eval(&args[0])?;
                let subject = self.eval(&args[1])?;
                let (items, subject) = match (list, subject) {
                    (Val::Json(Value::Array(items)), Val::Str(s)) => (items, s),
                    _ => return Ok(Val::Bool(false)),
                };
                let matched = items
                    .iter()
                    .filter_map(|item| item.as_str())
                    .any(|term| subject.contains(term));
                Ok(Val::Bool(matched))
            }
            Builtin::Min | Builtin::Max => {
                let name = if builtin == Builtin::Min { "min" } else { "max" };
                if args.len() != 2 {
                    return Err(EvalError::WrongArgCount(name));
                }
                let a = self.eval(&args[0])?.as_num(name)?;
                let b = self.eval(&args[1])?.as_num(name)?;
                Ok(Val::Num(if builtin == Builtin::Min {
                    a.min(b)
                } else {
                    a.max(b)
                }))
            }
        }
    }
}
