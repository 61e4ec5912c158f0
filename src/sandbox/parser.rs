// src/sandbox/parser.rs

use std::fmt;

/// 二元运算符
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
    Coalesce, // `??`
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

/// 沙箱内置函数，白名单之外的调用一律拒绝
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Includes,   // includes(haystack, needle) -> bool，子串匹配
    MatchesAny, // matchesAny(list, str) -> bool，列表中任一元素是 str 的子串
    Min,
    Max,
}

impl Builtin {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "includes" => Some(Builtin::Includes),
            "matchesAny" => Some(Builtin::MatchesAny),
            "min" => Some(Builtin::Min),
            "max" => Some(Builtin::Max),
            _ => None,
        }
    }
}

/// 受限竞价语言的表达式 AST
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Num(f64),
    Str(String),
    Bool(bool),
    Null,
    Param(usize), // 0 = context signals, 1 = interest group signals
    Field(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    Call(Builtin, Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    EmptySource,
    UnexpectedChar(char, usize),
    UnexpectedToken(String, usize),
    UnexpectedEnd,
    UnknownIdentifier(String, usize),
    UnknownFunction(String, usize),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptySource => write!(f, "bidding function source is empty"),
            Self::UnexpectedChar(c, pos) => write!(f, "unexpected character '{}' at byte {}", c, pos),
            Self::UnexpectedToken(t, pos) => write!(f, "unexpected token '{}' at byte {}", t, pos),
            Self::UnexpectedEnd => write!(f, "unexpected end of bidding function source"),
            Self::UnknownIdentifier(name, pos) => {
                write!(f, "unknown identifier '{}' at byte {}", name, pos)
            }
            Self::UnknownFunction(name, pos) => {
                write!(f, "call to unknown function '{}' at byte {}", name, pos)
            }
        }
    }
}

impl std::error::Error for ParseError {}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Num(f64),
    Str(String),
    Ident(String),
    Punct(&'static str),
}

impl Tok {
    fn describe(&self) -> String {
        match self {
            Tok::Num(n) => n.to_string(),
            Tok::Str(s) => format!("\"{}\"", s),
            Tok::Ident(s) => s.clone(),
            Tok::Punct(p) => p.to_string(),
        }
    }
}

/// 词法分析，返回 (token, 源码字节偏移) 列表
fn lex(src: &str) -> Result<Vec<(Tok, usize)>, ParseError> {
    let chars: Vec<(usize, char)> = src.char_indices().collect();
    let mut toks = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let (start, c) = chars[i];
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        // 跳过 `//` 行注释，伙伴发布的源码文件里通常带说明
        if c == '/' && matches!(chars.get(i + 1), Some((_, '/'))) {
            while i < chars.len() && chars[i].1 != '\n' {
                i += 1;
            }
            continue;
        }
        if c.is_ascii_digit() {
            let mut end = i;
            while end < chars.len() && chars[end].1.is_ascii_digit() {
                end += 1;
            }
            if end < chars.len() && chars[end].1 == '.' {
                end += 1;
                while end < chars.len() && chars[end].1.is_ascii_digit() {
                    end += 1;
                }
            }
            let text: String = chars[i..end].iter().map(|(_, ch)| ch).collect();
            let num = text
                .parse::<f64>()
                .map_err(|_| ParseError::UnexpectedToken(text.clone(), start))?;
            toks.push((Tok::Num(num), start));
            i = end;
            continue;
        }
        if c.is_ascii_alphabetic() || c == '_' {
            let mut end = i;
            while end < chars.len() && (chars[end].1.is_ascii_alphanumeric() || chars[end].1 == '_') {
                end += 1;
            }
            let text: String = chars[i..end].iter().map(|(_, ch)| ch).collect();
            toks.push((Tok::Ident(text), start));
            i = end;
            continue;
        }
        if c == '"' || c == '\'' {
            let quote = c;
            let mut text = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    None => return Err(ParseError::UnexpectedEnd),
                    Some((_, ch)) if *ch == quote => {
                        i += 1;
                        break;
                    }
                    Some((_, '\\')) if i + 1 < chars.len() => {
                        text.push(chars[i + 1].1);
                        i += 2;
                    }
                    Some((_, ch)) => {
                        text.push(*ch);
                        i += 1;
                    }
                }
            }
            toks.push((Tok::Str(text), start));
            continue;
        }
        // 双字符标点优先匹配
        let next = chars.get(i + 1).map(|(_, ch)| *ch);
        let punct2 = match (c, next) {
            ('=', Some('>')) => Some("=>"),
            ('=', Some('=')) => Some("=="),
            ('!', Some('=')) => Some("!="),
            ('<', Some('=')) => Some("<="),
            ('>', Some('=')) => Some(">="),
            ('&', Some('&')) => Some("&&"),
            ('|', Some('|')) => Some("||"),
            ('?', Some('?')) => Some("??"),
            _ => None,
        };
        if let Some(p) = punct2 {
            toks.push((Tok::Punct(p), start));
            i += 2;
            continue;
        }
        let punct1 = match c {
            '(' => Some("("),
            ')' => Some(")"),
            '[' => Some("["),
            ']' => Some("]"),
            '.' => Some("."),
            ',' => Some(","),
            '?' => Some("?"),
            ':' => Some(":"),
            '+' => Some("+"),
            '-' => Some("-"),
            '*' => Some("*"),
            '/' => Some("/"),
            '!' => Some("!"),
            '<' => Some("<"),
            '>' => Some(">"),
            _ => None,
        };
        match punct1 {
            Some(p) => {
                toks.push((Tok::Punct(p), start));
                i += 1;
            }
            None => return Err(ParseError::UnexpectedChar(c, start)),
        }
    }
    Ok(toks)
}

struct Parser {
    toks: Vec<(Tok, usize)>,
    pos: usize,
    params: [String; 2],
}

/// 解析竞价函数源码。
/// 可选的箭头函数头 `(ctxName, igName) =>` 声明两个形参名，
/// 省略时默认使用 `ctx` 和 `ig`。
pub fn parse(src: &str) -> Result<Expr, ParseError> {
    let toks = lex(src)?;
    if toks.is_empty() {
        return Err(ParseError::EmptySource);
    }
    let mut parser = Parser {
        toks,
        pos: 0,
        params: ["ctx".to_string(), "ig".to_string()],
    };
    parser.try_parse_header();
    let expr = parser.parse_expr()?;
    match parser.peek() {
        None => Ok(expr),
        Some((tok, pos)) => Err(ParseError::UnexpectedToken(tok.describe(), *pos)),
    }
}

impl Parser {
    fn peek(&self) -> Option<&(Tok, usize)> {
        self.toks.get(self.pos)
    }

    fn next(&mut self) -> Option<(Tok, usize)> {
        let tok = self.toks.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat_punct(&mut self, p: &str) -> bool {
        if matches!(self.peek(), Some((Tok::Punct(q), _)) if *q == p) {
            self.pos += 1;
            return true;
        }
        false
    }

    fn expect_punct(&mut self, p: &'static str) -> Result<(), ParseError> {
        match self.next() {
            Some((Tok::Punct(q), _)) if q == p => Ok(()),
            Some((tok, pos)) => Err(ParseError::UnexpectedToken(tok.describe(), pos)),
            None => Err(ParseError::UnexpectedEnd),
        }
    }

    /// 尝试吃掉 `(a, b) =>` 函数头；不匹配时完全回退
    fn try_parse_header(&mut self) {
        let saved = self.pos;
        if !self.eat_punct("(") {
            return;
        }
        let first = match self.next() {
            Some((Tok::Ident(name), _)) => name,
            _ => {
                self.pos = saved;
                return;
            }
        };
        if !self.eat_punct(",") {
            self.pos = saved;
            return;
        }
        let second = match self.next() {
            Some((Tok::Ident(name), _)) => name,
            _ => {
                self.pos = saved;
                return;
            }
        };
        if !self.eat_punct(")") || !self.eat_punct("=>") {
            self.pos = saved;
            return;
        }
        self.params = [first, second];
    }

    // 优先级（从低到高）：?: < || < && < ?? < == != < 比较 < + - < * / < 一元 < 后缀
    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        self.parse_ternary()
    }

    fn parse_ternary(&mut self) -> Result<Expr, ParseError> {
        let cond = self.parse_or()?;
        if self.eat_punct("?") {
            let then = self.parse_ternary()?;
            self.expect_punct(":")?;
            let otherwise = self.parse_ternary()?;
            return Ok(Expr::Ternary(Box::new(cond), Box::new(then), Box::new(otherwise)));
        }
        Ok(cond)
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_and()?;
        while self.eat_punct("||") {
            let rhs = self.parse_and()?;
            lhs = Expr::Binary(BinaryOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_coalesce()?;
        while self.eat_punct("&&") {
            let rhs = self.parse_coalesce()?;
            lhs = Expr::Binary(BinaryOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_coalesce(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_equality()?;
        while self.eat_punct("??") {
            let rhs = self.parse_equality()?;
            lhs = Expr::Binary(BinaryOp::Coalesce, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_equality(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_comparison()?;
        loop {
            let op = if self.eat_punct("==") {
                BinaryOp::Eq
            } else if self.eat_punct("!=") {
                BinaryOp::Ne
            } else {
                break;
            };
            let rhs = self.parse_comparison()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = if self.eat_punct("<=") {
                BinaryOp::Le
            } else if self.eat_punct(">=") {
                BinaryOp::Ge
            } else if self.eat_punct("<") {
                BinaryOp::Lt
            } else if self.eat_punct(">") {
                BinaryOp::Gt
            } else {
                break;
            };
            let rhs = self.parse_additive()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = if self.eat_punct("+") {
                BinaryOp::Add
            } else if self.eat_punct("-") {
                BinaryOp::Sub
            } else {
                break;
            };
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = if self.eat_punct("*") {
                BinaryOp::Mul
            } else if self.eat_punct("/") {
                BinaryOp::Div
            } else {
                break;
            };
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        if self.eat_punct("!") {
            let inner = self.parse_unary()?;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(inner)));
        }
        if self.eat_punct("-") {
            let inner = self.parse_unary()?;
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(inner)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.eat_punct(".") {
                match self.next() {
                    Some((Tok::Ident(name), _)) => {
                        expr = Expr::Field(Box::new(expr), name);
                    }
                    Some((tok, pos)) => {
                        return Err(ParseError::UnexpectedToken(tok.describe(), pos))
                    }
                    None => return Err(ParseError::UnexpectedEnd),
                }
                continue;
            }
            if self.eat_punct("[") {
                let index = self.parse_expr()?;
                self.expect_punct("]")?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
                continue;
            }
            break;
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        match self.next() {
            Some((Tok::Num(n), _)) => Ok(Expr::Num(n)),
            Some((Tok::Str(s), _)) => Ok(Expr::Str(s)),
            Some((Tok::Ident(name), pos)) => match name.as_str() {
                "true" => Ok(Expr::Bool(true)),
                "false" => Ok(Expr::Bool(false)),
                "null" => Ok(Expr::Null),
                _ => {
                    if let Some(idx) = self.params.iter().position(|p| *p == name) {
                        return Ok(Expr::Param(idx));
                    }
                    // 形参以外的裸标识符只允许是内置函数调用
                    if matches!(self.peek(), Some((Tok::Punct("("), _))) {
                        let builtin = Builtin::from_name(&name)
                            .ok_or(ParseError::UnknownFunction(name, pos))?;
                        self.expect_punct("(")?;
                        let mut args = Vec::new();
                        if !self.eat_punct(")") {
                            loop {
                                args.push(self.parse_expr()?);
                                if self.eat_punct(")") {
                                    break;
                                }
                                self.expect_punct(",")?;
                            }
                        }
                        return Ok(Expr::Call(builtin, args));
                    }
                    Err(ParseError::UnknownIdentifier(name, pos))
                }
            },
            Some((Tok::Punct("("), _)) => {
                let inner = self.parse_expr()?;
                self.expect_punct(")")?;
                Ok(inner)
            }
            Some((tok, pos)) => Err(ParseError::UnexpectedToken(tok.describe(), pos)),
            None => Err(ParseError::UnexpectedEnd),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_arrow_header_and_renames_params() {
        let expr = parse("(ctxSig, igSig) => igSig.baseValue ?? 0").unwrap();
        assert_eq!(
            expr,
            Expr::Binary(
                BinaryOp::Coalesce,
                Box::new(Expr::Field(Box::new(Expr::Param(1)), "baseValue".to_string())),
                Box::new(Expr::Num(0.0)),
            )
        );
    }

    #[test]
    fn defaults_to_ctx_and_ig_without_header() {
        let expr = parse("ctx.topic == 'animals' ? 1 : 0").unwrap();
        assert!(matches!(expr, Expr::Ternary(_, _, _)));
    }

    #[test]
    fn rejects_unknown_identifiers_and_functions() {
        assert!(matches!(parse("window.location"), Err(ParseError::UnknownIdentifier(_, _))));
        assert!(matches!(parse("eval('1')"), Err(ParseError::UnknownFunction(_, _))));
    }

    #[test]
    fn rejects_trailing_garbage() {
        assert!(matches!(parse("1 + 2 2"), Err(ParseError::UnexpectedToken(_, _))));
    }

    #[test]
    fn indexing_binds_tighter_than_arithmetic() {
        let expr = parse("ctx.igOwnerBonus[ig.owner] + 1").unwrap();
        match expr {
            Expr::Binary(BinaryOp::Add, lhs, _) => {
                assert!(matches!(*lhs, Expr::Index(_, _)));
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }
}
