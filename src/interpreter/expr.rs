//! Expression syntax tree and the recursive-descent parser that builds it.
//!
//! Operator precedence, loosest first: conditional, `||`, `&&`, equality,
//! comparison, additive, multiplicative, unary, then traversals
//! (`.attr`, `[index]`, `[*]`) on a primary term.

use super::lexer::{self, Spanned, StrPart, SyntaxError, Token};
use crate::graph::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Template(Vec<TemplatePart>),
    List(Vec<Expr>),
    Object(Vec<(Expr, Expr)>),
    /// A root name: `var`, `local`, `count`, a resource type, a `for` binding.
    Variable(String),
    GetAttr(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    /// `source[*]` followed by traversals applied to every element.
    Splat(Box<Expr>, Vec<Traversal>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Conditional(Box<Expr>, Box<Expr>, Box<Expr>),
    Call {
        name: String,
        args: Vec<Expr>,
        expand_last: bool,
    },
    For(Box<ForExpr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TemplatePart {
    Lit(String),
    Interp(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Traversal {
    Attr(String),
    Index(Expr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForExpr {
    pub key_var: Option<String>,
    pub value_var: String,
    pub collection: Expr,
    /// Present for `{for …}` map comprehensions.
    pub key: Option<Expr>,
    pub value: Expr,
    pub condition: Option<Expr>,
    /// `=> value...` collects duplicate keys into lists.
    pub grouping: bool,
}

/// A static reference found in an expression: root name plus the
/// attribute names along its traversal chain (`aws_subnet.a[0].id`
/// yields root `aws_subnet`, attrs `["a", "id"]`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Reference {
    pub root: String,
    pub attrs: Vec<String>,
}

impl Expr {
    /// Every reference chain in the expression, including those inside
    /// index expressions and function arguments.
    pub fn references(&self) -> Vec<Reference> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references(&self, out: &mut Vec<Reference>) {
        if let Some(reference) = self.chain() {
            out.push(reference);
        }
        match self {
            Expr::Literal(_) | Expr::Variable(_) => {}
            Expr::Template(parts) => {
                for part in parts {
                    if let TemplatePart::Interp(e) = part {
                        e.collect_references(out);
                    }
                }
            }
            Expr::List(items) => items.iter().for_each(|e| e.collect_references(out)),
            Expr::Object(entries) => {
                for (k, v) in entries {
                    k.collect_references(out);
                    v.collect_references(out);
                }
            }
            Expr::GetAttr(inner, _) => inner.collect_nested(out),
            Expr::Index(inner, index) => {
                inner.collect_nested(out);
                index.collect_references(out);
            }
            Expr::Splat(inner, steps) => {
                inner.collect_nested(out);
                for step in steps {
                    if let Traversal::Index(e) = step {
                        e.collect_references(out);
                    }
                }
            }
            Expr::Unary(_, e) => e.collect_references(out),
            Expr::Binary(_, a, b) => {
                a.collect_references(out);
                b.collect_references(out);
            }
            Expr::Conditional(c, a, b) => {
                c.collect_references(out);
                a.collect_references(out);
                b.collect_references(out);
            }
            Expr::Call { args, .. } => args.iter().for_each(|e| e.collect_references(out)),
            Expr::For(f) => {
                f.collection.collect_references(out);
                let bound = |r: &Reference| {
                    r.root == f.value_var || f.key_var.as_deref() == Some(r.root.as_str())
                };
                let mut inner = Vec::new();
                if let Some(k) = &f.key {
                    k.collect_references(&mut inner);
                }
                f.value.collect_references(&mut inner);
                if let Some(c) = &f.condition {
                    c.collect_references(&mut inner);
                }
                out.extend(inner.into_iter().filter(|r| !bound(r)));
            }
        }
    }

    /// Walk below the outermost traversal without re-reporting the chain.
    fn collect_nested(&self, out: &mut Vec<Reference>) {
        match self {
            Expr::GetAttr(inner, _) => inner.collect_nested(out),
            Expr::Index(inner, index) => {
                inner.collect_nested(out);
                index.collect_references(out);
            }
            Expr::Splat(inner, steps) => {
                inner.collect_nested(out);
                for step in steps {
                    if let Traversal::Index(e) = step {
                        e.collect_references(out);
                    }
                }
            }
            Expr::Variable(_) => {}
            other => other.collect_references(out),
        }
    }

    /// The reference chain this expression is, if it is one.
    fn chain(&self) -> Option<Reference> {
        match self {
            Expr::Variable(root) => Some(Reference {
                root: root.clone(),
                attrs: Vec::new(),
            }),
            Expr::GetAttr(inner, name) => {
                let mut r = inner.chain()?;
                r.attrs.push(name.clone());
                Some(r)
            }
            Expr::Index(inner, _) => inner.chain(),
            Expr::Splat(inner, steps) => {
                let mut r = inner.chain()?;
                r.attrs.extend(steps.iter().filter_map(|s| match s {
                    Traversal::Attr(name) => Some(name.clone()),
                    Traversal::Index(_) => None,
                }));
                Some(r)
            }
            _ => None,
        }
    }
}

/// Parse a bare expression (`length(var.subnets) > 1 ? 2 : 1`).
pub fn parse_expression(src: &str) -> Result<Expr, SyntaxError> {
    let tokens = lexer::tokenize(src)?;
    let mut parser = Parser::new(&tokens, src.len());
    let expr = parser.expression()?;
    parser.finish()?;
    Ok(expr)
}

/// Parse template text (`web-${var.env}`). A template that is exactly one
/// interpolation yields that expression unwrapped, so its value keeps its
/// type instead of becoming a string.
pub fn parse_template(src: &str) -> Result<Expr, SyntaxError> {
    let parts = lexer::tokenize_template(src)?;
    template_from_parts(&parts, src.len())
}

fn template_from_parts(parts: &[StrPart], end: usize) -> Result<Expr, SyntaxError> {
    let mut out = Vec::with_capacity(parts.len());
    for part in parts {
        match part {
            StrPart::Lit(s) => out.push(TemplatePart::Lit(s.clone())),
            StrPart::Interp { tokens, .. } => {
                let inner_end = tokens.last().map(|t| t.offset + 1).unwrap_or(end);
                let mut parser = Parser::new(tokens, inner_end);
                let expr = parser.expression()?;
                parser.finish()?;
                out.push(TemplatePart::Interp(expr));
            }
        }
    }
    Ok(match out.as_slice() {
        [TemplatePart::Interp(expr)] => expr.clone(),
        [TemplatePart::Lit(s)] => Expr::Literal(Value::string(s.clone())),
        _ => Expr::Template(out),
    })
}

struct Parser<'t> {
    tokens: &'t [Spanned],
    pos: usize,
    end: usize,
}

impl<'t> Parser<'t> {
    fn new(tokens: &'t [Spanned], end: usize) -> Self {
        Self {
            tokens,
            pos: 0,
            end,
        }
    }

    fn peek(&self) -> Option<&'t Token> {
        self.tokens.get(self.pos).map(|t| &t.token)
    }

    fn peek_at(&self, ahead: usize) -> Option<&'t Token> {
        self.tokens.get(self.pos + ahead).map(|t| &t.token)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map(|t| t.offset).unwrap_or(self.end)
    }

    fn is_punct(&self, p: &str) -> bool {
        matches!(self.peek(), Some(Token::Punct(q)) if *q == p)
    }

    fn is_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(name)) if name == kw)
    }

    fn eat(&mut self, p: &str) -> bool {
        if self.is_punct(p) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, p: &str) -> Result<(), SyntaxError> {
        if self.eat(p) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", p)))
        }
    }

    fn ident(&mut self) -> Result<String, SyntaxError> {
        match self.peek() {
            Some(Token::Ident(name)) => {
                self.pos += 1;
                Ok(name.clone())
            }
            _ => Err(self.error("expected identifier")),
        }
    }

    fn error<M: Into<String>>(&self, message: M) -> SyntaxError {
        SyntaxError::new(message, self.offset())
    }

    fn finish(&self) -> Result<(), SyntaxError> {
        match self.peek() {
            None => Ok(()),
            Some(token) => Err(self.error(format!("unexpected trailing {:?}", token))),
        }
    }

    // ─── Operators ──────────────────────────────────────────────

    fn expression(&mut self) -> Result<Expr, SyntaxError> {
        let cond = self.binary(0)?;
        if !self.eat("?") {
            return Ok(cond);
        }
        let then = self.expression()?;
        self.expect(":")?;
        let otherwise = self.expression()?;
        Ok(Expr::Conditional(
            Box::new(cond),
            Box::new(then),
            Box::new(otherwise),
        ))
    }

    fn binary(&mut self, level: usize) -> Result<Expr, SyntaxError> {
        const LEVELS: &[&[(&str, BinaryOp)]] = &[
            &[("||", BinaryOp::Or)],
            &[("&&", BinaryOp::And)],
            &[("==", BinaryOp::Eq), ("!=", BinaryOp::Ne)],
            &[
                ("<=", BinaryOp::Le),
                (">=", BinaryOp::Ge),
                ("<", BinaryOp::Lt),
                (">", BinaryOp::Gt),
            ],
            &[("+", BinaryOp::Add), ("-", BinaryOp::Sub)],
            &[
                ("*", BinaryOp::Mul),
                ("/", BinaryOp::Div),
                ("%", BinaryOp::Mod),
            ],
        ];
        if level == LEVELS.len() {
            return self.unary();
        }
        let mut left = self.binary(level + 1)?;
        'outer: loop {
            for (p, op) in LEVELS[level] {
                if self.eat(p) {
                    let right = self.binary(level + 1)?;
                    left = Expr::Binary(*op, Box::new(left), Box::new(right));
                    continue 'outer;
                }
            }
            return Ok(left);
        }
    }

    fn unary(&mut self) -> Result<Expr, SyntaxError> {
        if self.eat("!") {
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(self.unary()?)));
        }
        if self.eat("-") {
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.unary()?)));
        }
        self.postfix()
    }

    // ─── Traversals ─────────────────────────────────────────────

    fn postfix(&mut self) -> Result<Expr, SyntaxError> {
        let mut expr = self.primary()?;
        loop {
            if self.is_punct(".") && matches!(self.peek_at(1), Some(Token::Punct("*"))) {
                self.pos += 2;
                let steps = self.splat_steps()?;
                expr = Expr::Splat(Box::new(expr), steps);
            } else if self.eat(".") {
                match self.peek() {
                    Some(Token::Ident(name)) => {
                        self.pos += 1;
                        expr = Expr::GetAttr(Box::new(expr), name.clone());
                    }
                    Some(Token::Number(n)) => {
                        self.pos += 1;
                        expr = Expr::Index(Box::new(expr), Box::new(Expr::Literal(n.clone())));
                    }
                    _ => return Err(self.error("expected attribute name")),
                }
            } else if self.is_punct("[") && matches!(self.peek_at(1), Some(Token::Punct("*"))) {
                self.pos += 2;
                self.expect("]")?;
                let steps = self.splat_steps()?;
                expr = Expr::Splat(Box::new(expr), steps);
            } else if self.eat("[") {
                let index = self.expression()?;
                self.expect("]")?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else {
                return Ok(expr);
            }
        }
    }

    fn splat_steps(&mut self) -> Result<Vec<Traversal>, SyntaxError> {
        let mut steps = Vec::new();
        loop {
            if self.is_punct(".") && matches!(self.peek_at(1), Some(Token::Ident(_))) {
                self.pos += 1;
                steps.push(Traversal::Attr(self.ident()?));
            } else if self.is_punct("[") && !matches!(self.peek_at(1), Some(Token::Punct("*"))) {
                self.pos += 1;
                let index = self.expression()?;
                self.expect("]")?;
                steps.push(Traversal::Index(index));
            } else {
                return Ok(steps);
            }
        }
    }

    // ─── Terms ──────────────────────────────────────────────────

    fn primary(&mut self) -> Result<Expr, SyntaxError> {
        let offset = self.offset();
        let Some(token) = self.peek() else {
            return Err(self.error("unexpected end of expression"));
        };
        match token {
            Token::Number(n) => {
                self.pos += 1;
                Ok(Expr::Literal(n.clone()))
            }
            Token::Str(parts) => {
                self.pos += 1;
                let expr = template_from_parts(parts, self.end)?;
                // A quoted string is always a string, even `"${1}"`.
                Ok(match expr {
                    e @ (Expr::Literal(Value::String(_)) | Expr::Template(_)) => e,
                    other => Expr::Template(vec![TemplatePart::Interp(other)]),
                })
            }
            Token::Ident(name) => {
                self.pos += 1;
                match name.as_str() {
                    "true" => Ok(Expr::Literal(Value::Bool(true))),
                    "false" => Ok(Expr::Literal(Value::Bool(false))),
                    "null" => Ok(Expr::Literal(Value::Null)),
                    _ if self.is_punct("(") => self.call(name.clone()),
                    _ => Ok(Expr::Variable(name.clone())),
                }
            }
            Token::Punct("(") => {
                self.pos += 1;
                let inner = self.expression()?;
                self.expect(")")?;
                Ok(inner)
            }
            Token::Punct("[") => {
                self.pos += 1;
                if self.is_keyword("for") {
                    return self.for_expr(false);
                }
                let mut items = Vec::new();
                while !self.eat("]") {
                    items.push(self.expression()?);
                    if !self.eat(",") && !self.is_punct("]") {
                        return Err(self.error("expected ',' or ']'"));
                    }
                }
                Ok(Expr::List(items))
            }
            Token::Punct("{") => {
                self.pos += 1;
                if self.is_keyword("for") {
                    return self.for_expr(true);
                }
                self.object()
            }
            other => Err(SyntaxError::new(format!("unexpected {:?}", other), offset)),
        }
    }

    fn call(&mut self, name: String) -> Result<Expr, SyntaxError> {
        self.expect("(")?;
        let mut args = Vec::new();
        let mut expand_last = false;
        while !self.eat(")") {
            args.push(self.expression()?);
            if self.eat("...") {
                expand_last = true;
                self.expect(")")?;
                break;
            }
            if !self.eat(",") && !self.is_punct(")") {
                return Err(self.error("expected ',' or ')'"));
            }
        }
        Ok(Expr::Call {
            name,
            args,
            expand_last,
        })
    }

    fn object(&mut self) -> Result<Expr, SyntaxError> {
        let mut entries = Vec::new();
        while !self.eat("}") {
            let key = match (self.peek(), self.peek_at(1)) {
                (Some(Token::Ident(name)), Some(Token::Punct("=" | ":"))) => {
                    self.pos += 1;
                    Expr::Literal(Value::string(name.clone()))
                }
                _ => self.expression()?,
            };
            if !self.eat("=") {
                self.expect(":")?;
            }
            let value = self.expression()?;
            entries.push((key, value));
            self.eat(",");
        }
        Ok(Expr::Object(entries))
    }

    /// After the opening bracket: `for k, v in coll : body [if cond]`.
    fn for_expr(&mut self, is_map: bool) -> Result<Expr, SyntaxError> {
        self.pos += 1; // `for`
        let first = self.ident()?;
        let (key_var, value_var) = if self.eat(",") {
            (Some(first), self.ident()?)
        } else {
            (None, first)
        };
        if !self.is_keyword("in") {
            return Err(self.error("expected 'in'"));
        }
        self.pos += 1;
        let collection = self.expression()?;
        self.expect(":")?;
        let (key, value, grouping) = if is_map {
            let key = self.expression()?;
            self.expect("=>")?;
            let value = self.expression()?;
            let grouping = self.eat("...");
            (Some(key), value, grouping)
        } else {
            (None, self.expression()?, false)
        };
        let condition = if self.is_keyword("if") {
            self.pos += 1;
            Some(self.expression()?)
        } else {
            None
        };
        self.expect(if is_map { "}" } else { "]" })?;
        Ok(Expr::For(Box::new(ForExpr {
            key_var,
            value_var,
            collection,
            key,
            value,
            condition,
            grouping,
        })))
    }
}
