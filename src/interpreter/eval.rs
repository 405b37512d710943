//! Expression evaluation against a lookup scope.
//!
//! The evaluator never resolves references itself: a reference chain
//! (`var.x`, `aws_subnet.a[1].id`, `module.net.vpc_id`) is reduced to a
//! root name plus concrete steps and handed to a [`Scope`], which consumes
//! as many steps as it understands. Remaining steps are applied to the
//! returned value generically.

use regex::Regex;
use std::collections::BTreeMap;
use thiserror::Error;

use super::expr::{BinaryOp, Expr, ForExpr, TemplatePart, Traversal, UnaryOp};
use crate::graph::Value;

/// One concrete step of a reference chain.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Attr(String),
    Index(Value),
    Splat,
}

/// Answer from a [`Scope`] for a reference chain.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// The value of the first `consumed` steps.
    Found { value: Value, consumed: usize },
    /// Known name whose value is not available yet.
    Pending,
    /// Nothing by this name will ever exist.
    Missing(String),
}

pub trait Scope {
    fn lookup(&self, root: &str, steps: &[Step]) -> Lookup;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    /// Depends on a value a later pass may produce.
    #[error("pending")]
    Pending,
    /// Cannot be reduced; retrying will not help.
    #[error("{0}")]
    Unresolvable(String),
}

pub type EvalResult = std::result::Result<Value, EvalError>;

fn fail<T, M: Into<String>>(message: M) -> std::result::Result<T, EvalError> {
    Err(EvalError::Unresolvable(message.into()))
}

/// Evaluator state: the scope plus `for`/instance bindings.
pub struct Evaluator<'s> {
    scope: &'s dyn Scope,
    bindings: Vec<(String, Value)>,
}

impl<'s> Evaluator<'s> {
    pub fn new(scope: &'s dyn Scope) -> Self {
        Self {
            scope,
            bindings: Vec::new(),
        }
    }

    /// Bind a root name (`count`, `each`) for every evaluation.
    pub fn bind<S: Into<String>>(mut self, name: S, value: Value) -> Self {
        self.bindings.push((name.into(), value));
        self
    }

    fn binding(&self, name: &str) -> Option<&Value> {
        self.bindings
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn eval(&mut self, expr: &Expr) -> EvalResult {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Template(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        TemplatePart::Lit(s) => out.push_str(s),
                        TemplatePart::Interp(e) => out.push_str(&self.eval(e)?.to_template_string()),
                    }
                }
                Ok(Value::String(out))
            }
            Expr::List(items) => items
                .iter()
                .map(|e| self.eval(e))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            Expr::Object(entries) => {
                let mut map = BTreeMap::new();
                for (k, v) in entries {
                    let key = self.eval(k)?;
                    let key = key_string(&key)?;
                    map.insert(key, self.eval(v)?);
                }
                Ok(Value::Map(map))
            }
            Expr::Variable(_) | Expr::GetAttr(..) | Expr::Index(..) | Expr::Splat(..) => {
                self.traverse(expr)
            }
            Expr::Unary(op, inner) => {
                let v = self.eval(inner)?;
                reject_unresolved(&v)?;
                match op {
                    UnaryOp::Not => match v.as_bool() {
                        Some(b) => Ok(Value::Bool(!b)),
                        None => fail(format!("cannot negate {}", v.type_name())),
                    },
                    UnaryOp::Neg => match v {
                        Value::Int(i) => Ok(Value::Int(-i)),
                        other => match other.as_f64() {
                            Some(f) => Ok(number(-f)),
                            None => fail(format!("cannot negate {}", other.type_name())),
                        },
                    },
                }
            }
            Expr::Binary(op, a, b) => self.binary(*op, a, b),
            Expr::Conditional(c, a, b) => {
                let cond = self.eval(c)?;
                reject_unresolved(&cond)?;
                match cond.as_bool() {
                    Some(true) => self.eval(a),
                    Some(false) => self.eval(b),
                    None => fail(format!("condition is {}, not bool", cond.type_name())),
                }
            }
            Expr::Call {
                name,
                args,
                expand_last,
            } => self.call(name, args, *expand_last),
            Expr::For(f) => self.for_expr(f),
        }
    }

    // ─── References ─────────────────────────────────────────────

    fn traverse(&mut self, expr: &Expr) -> EvalResult {
        let mut steps = Vec::new();
        let root = self.flatten(expr, &mut steps)?;
        match root {
            Root::Name(name) => {
                if let Some(bound) = self.binding(&name).cloned() {
                    return apply_steps(bound, &steps);
                }
                match self.scope.lookup(&name, &steps) {
                    Lookup::Found { value, consumed } => apply_steps(value, &steps[consumed..]),
                    Lookup::Pending => Err(EvalError::Pending),
                    Lookup::Missing(message) => fail(message),
                }
            }
            Root::Value(value) => apply_steps(value, &steps),
        }
    }

    /// Reduce a traversal chain to its root and concrete steps, evaluating
    /// index expressions along the way.
    fn flatten(&mut self, expr: &Expr, steps: &mut Vec<Step>) -> Result<Root, EvalError> {
        match expr {
            Expr::Variable(name) => Ok(Root::Name(name.clone())),
            Expr::GetAttr(inner, name) => {
                let root = self.flatten(inner, steps)?;
                steps.push(Step::Attr(name.clone()));
                Ok(root)
            }
            Expr::Index(inner, index) => {
                let root = self.flatten(inner, steps)?;
                let key = self.eval(index)?;
                reject_unresolved(&key)?;
                steps.push(Step::Index(key));
                Ok(root)
            }
            Expr::Splat(inner, rest) => {
                let root = self.flatten(inner, steps)?;
                steps.push(Step::Splat);
                for step in rest {
                    match step {
                        Traversal::Attr(name) => steps.push(Step::Attr(name.clone())),
                        Traversal::Index(e) => {
                            let key = self.eval(e)?;
                            steps.push(Step::Index(key));
                        }
                    }
                }
                Ok(root)
            }
            other => Ok(Root::Value(self.eval(other)?)),
        }
    }

    // ─── Operators ──────────────────────────────────────────────

    fn binary(&mut self, op: BinaryOp, a: &Expr, b: &Expr) -> EvalResult {
        // Short-circuit so `var.x != null && var.x.y` works.
        if matches!(op, BinaryOp::And | BinaryOp::Or) {
            let left = self.eval(a)?;
            reject_unresolved(&left)?;
            let Some(l) = left.as_bool() else {
                return fail(format!("logical operand is {}", left.type_name()));
            };
            if (op == BinaryOp::And && !l) || (op == BinaryOp::Or && l) {
                return Ok(Value::Bool(l));
            }
            let right = self.eval(b)?;
            reject_unresolved(&right)?;
            return match right.as_bool() {
                Some(r) => Ok(Value::Bool(r)),
                None => fail(format!("logical operand is {}", right.type_name())),
            };
        }

        let left = self.eval(a)?;
        let right = self.eval(b)?;
        reject_unresolved(&left)?;
        reject_unresolved(&right)?;
        match op {
            BinaryOp::Eq => Ok(Value::Bool(values_equal(&left, &right))),
            BinaryOp::Ne => Ok(Value::Bool(!values_equal(&left, &right))),
            _ => {
                let (Some(x), Some(y)) = (left.as_f64(), right.as_f64()) else {
                    return fail(format!(
                        "operator needs numbers, got {} and {}",
                        left.type_name(),
                        right.type_name()
                    ));
                };
                let both_int = matches!((&left, &right), (Value::Int(_), Value::Int(_)));
                match op {
                    BinaryOp::Lt => Ok(Value::Bool(x < y)),
                    BinaryOp::Le => Ok(Value::Bool(x <= y)),
                    BinaryOp::Gt => Ok(Value::Bool(x > y)),
                    BinaryOp::Ge => Ok(Value::Bool(x >= y)),
                    BinaryOp::Add => Ok(int_or_float(both_int, x + y)),
                    BinaryOp::Sub => Ok(int_or_float(both_int, x - y)),
                    BinaryOp::Mul => Ok(int_or_float(both_int, x * y)),
                    BinaryOp::Div if y == 0.0 => fail("division by zero"),
                    BinaryOp::Div => Ok(number(x / y)),
                    BinaryOp::Mod if y == 0.0 => fail("modulo by zero"),
                    BinaryOp::Mod => Ok(number(x % y)),
                    _ => unreachable!("logical and equality operators handled above"),
                }
            }
        }
    }

    fn for_expr(&mut self, f: &ForExpr) -> EvalResult {
        let collection = self.eval(&f.collection)?;
        reject_unresolved(&collection)?;
        let pairs: Vec<(Value, Value)> = match collection {
            Value::List(items) => items
                .into_iter()
                .enumerate()
                .map(|(i, v)| (Value::Int(i as i64), v))
                .collect(),
            Value::Map(map) => map.into_iter().map(|(k, v)| (Value::String(k), v)).collect(),
            Value::Null => Vec::new(),
            other => return fail(format!("cannot iterate over {}", other.type_name())),
        };

        let mut list = Vec::new();
        let mut map: BTreeMap<String, Value> = BTreeMap::new();
        for (k, v) in pairs {
            let depth = self.bindings.len();
            if let Some(key_var) = &f.key_var {
                self.bindings.push((key_var.clone(), k));
            }
            self.bindings.push((f.value_var.clone(), v));
            let result = self.for_item(f, &mut list, &mut map);
            self.bindings.truncate(depth);
            result?;
        }
        Ok(if f.key.is_some() {
            Value::Map(map)
        } else {
            Value::List(list)
        })
    }

    fn for_item(
        &mut self,
        f: &ForExpr,
        list: &mut Vec<Value>,
        map: &mut BTreeMap<String, Value>,
    ) -> Result<(), EvalError> {
        if let Some(cond) = &f.condition {
            let keep = self.eval(cond)?;
            reject_unresolved(&keep)?;
            match keep.as_bool() {
                Some(true) => {}
                Some(false) => return Ok(()),
                None => return fail("for condition is not bool"),
            }
        }
        let value = self.eval(&f.value)?;
        match &f.key {
            None => list.push(value),
            Some(key_expr) => {
                let key = key_string(&self.eval(key_expr)?)?;
                if f.grouping {
                    match map.entry(key).or_insert_with(|| Value::List(Vec::new())) {
                        Value::List(items) => items.push(value),
                        _ => unreachable!("grouped entries are lists"),
                    }
                } else if map.contains_key(&key) {
                    return fail(format!("duplicate key '{}' in for expression", key));
                } else {
                    map.insert(key, value);
                }
            }
        }
        Ok(())
    }

    // ─── Functions ──────────────────────────────────────────────

    fn call(&mut self, name: &str, args: &[Expr], expand_last: bool) -> EvalResult {
        if name == "try" || name == "can" {
            let mut last = String::from("try() has no arguments");
            for arg in args {
                match self.eval(arg) {
                    Ok(v) if !v.contains_unresolved() => {
                        return Ok(if name == "can" { Value::Bool(true) } else { v });
                    }
                    Ok(_) => last = "argument is unresolved".to_string(),
                    Err(EvalError::Pending) => return Err(EvalError::Pending),
                    Err(EvalError::Unresolvable(message)) => last = message,
                }
            }
            return if name == "can" {
                Ok(Value::Bool(false))
            } else {
                fail(last)
            };
        }

        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval(arg)?);
        }
        if expand_last {
            match values.pop() {
                Some(Value::List(items)) => values.extend(items),
                Some(other) => return fail(format!("cannot expand {}", other.type_name())),
                None => {}
            }
        }
        for v in &values {
            reject_unresolved(v)?;
        }
        call_function(name, values)
    }
}

enum Root {
    Name(String),
    Value(Value),
}

/// Apply traversal steps to an already-known value.
pub fn apply_steps(value: Value, steps: &[Step]) -> EvalResult {
    let mut current = value;
    for (i, step) in steps.iter().enumerate() {
        if let Value::Unresolved(_) = current {
            return Ok(current);
        }
        current = match step {
            Step::Attr(name) => match current {
                Value::Map(mut map) => match map.remove(name) {
                    Some(v) => v,
                    None => return fail(format!("no attribute '{}'", name)),
                },
                other => return fail(format!("cannot read '{}' of {}", name, other.type_name())),
            },
            Step::Index(key) => index_value(current, key)?,
            Step::Splat => {
                let items = match current {
                    Value::List(items) => items,
                    Value::Null => Vec::new(),
                    single => vec![single],
                };
                let rest = &steps[i + 1..];
                return items
                    .into_iter()
                    .map(|item| apply_steps(item, rest))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::List);
            }
        };
    }
    Ok(current)
}

fn index_value(value: Value, key: &Value) -> EvalResult {
    match value {
        Value::List(mut items) => {
            let Some(i) = key.as_i64() else {
                return fail(format!("list index must be a number, got {}", key.type_name()));
            };
            if i < 0 || i as usize >= items.len() {
                return fail(format!("index {} out of range for list of {}", i, items.len()));
            }
            Ok(items.swap_remove(i as usize))
        }
        Value::Map(mut map) => {
            let k = key_string(key)?;
            map.remove(&k)
                .ok_or_else(|| EvalError::Unresolvable(format!("no key '{}'", k)))
        }
        other => fail(format!("cannot index {}", other.type_name())),
    }
}

fn reject_unresolved(v: &Value) -> Result<(), EvalError> {
    if v.contains_unresolved() {
        fail("depends on an unresolved value")
    } else {
        Ok(())
    }
}

fn key_string(v: &Value) -> Result<String, EvalError> {
    match v {
        Value::String(s) => Ok(s.clone()),
        Value::Int(_) | Value::Float(_) | Value::Bool(_) => Ok(v.to_template_string()),
        other => fail(format!("{} cannot be used as a key", other.type_name())),
    }
}

fn number(f: f64) -> Value {
    if f.fract() == 0.0 && f.abs() < 9.0e15 {
        Value::Int(f as i64)
    } else {
        Value::Float(f)
    }
}

fn int_or_float(both_int: bool, f: f64) -> Value {
    if both_int {
        Value::Int(f as i64)
    } else {
        number(f)
    }
}

/// Equality with numbers compared by value (`1 == 1.0`).
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => a.as_f64() == b.as_f64(),
        (Value::List(x), Value::List(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(p, q)| values_equal(p, q))
        }
        (Value::Map(x), Value::Map(y)) => {
            x.len() == y.len()
                && x.iter()
                    .zip(y)
                    .all(|((k1, v1), (k2, v2))| k1 == k2 && values_equal(v1, v2))
        }
        _ => a == b,
    }
}

fn arity(name: &str, args: &[Value], min: usize, max: usize) -> Result<(), EvalError> {
    if args.len() < min || args.len() > max {
        fail(format!("{}() takes {}..{} arguments, got {}", name, min, max, args.len()))
    } else {
        Ok(())
    }
}

fn list_arg<'v>(name: &str, v: &'v Value) -> Result<&'v [Value], EvalError> {
    v.as_list()
        .ok_or_else(|| EvalError::Unresolvable(format!("{}() expects a list, got {}", name, v.type_name())))
}

fn map_arg<'v>(name: &str, v: &'v Value) -> Result<&'v BTreeMap<String, Value>, EvalError> {
    v.as_map()
        .ok_or_else(|| EvalError::Unresolvable(format!("{}() expects a map, got {}", name, v.type_name())))
}

fn str_arg(name: &str, v: &Value) -> Result<String, EvalError> {
    match v {
        Value::String(s) => Ok(s.clone()),
        Value::Int(_) | Value::Float(_) | Value::Bool(_) => Ok(v.to_template_string()),
        other => fail(format!("{}() expects a string, got {}", name, other.type_name())),
    }
}

fn num_arg(name: &str, v: &Value) -> Result<f64, EvalError> {
    v.as_f64()
        .ok_or_else(|| EvalError::Unresolvable(format!("{}() expects a number, got {}", name, v.type_name())))
}

/// Sorted, de-duplicated set semantics: strings sort lexically.
pub fn to_set(items: &[Value]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();
    for item in items {
        if !out.iter().any(|seen| values_equal(seen, item)) {
            out.push(item.clone());
        }
    }
    if out.iter().all(|v| matches!(v, Value::String(_))) {
        out.sort_by(|a, b| a.as_str().cmp(&b.as_str()));
    }
    out
}

fn flatten_into(items: &[Value], out: &mut Vec<Value>) {
    for item in items {
        match item {
            Value::List(inner) => flatten_into(inner, out),
            other => out.push(other.clone()),
        }
    }
}

fn call_function(name: &str, args: Vec<Value>) -> EvalResult {
    match name {
        "length" => {
            arity(name, &args, 1, 1)?;
            match &args[0] {
                Value::List(items) => Ok(Value::Int(items.len() as i64)),
                Value::Map(map) => Ok(Value::Int(map.len() as i64)),
                Value::String(s) => Ok(Value::Int(s.chars().count() as i64)),
                other => fail(format!("length() of {}", other.type_name())),
            }
        }
        "element" => {
            arity(name, &args, 2, 2)?;
            let items = list_arg(name, &args[0])?;
            if items.is_empty() {
                return fail("element() of an empty list");
            }
            let i = num_arg(name, &args[1])? as i64;
            Ok(items[i.rem_euclid(items.len() as i64) as usize].clone())
        }
        "lookup" => {
            arity(name, &args, 2, 3)?;
            let map = map_arg(name, &args[0])?;
            let key = str_arg(name, &args[1])?;
            match (map.get(&key), args.get(2)) {
                (Some(v), _) => Ok(v.clone()),
                (None, Some(default)) => Ok(default.clone()),
                (None, None) => fail(format!("lookup() found no key '{}'", key)),
            }
        }
        "concat" => {
            let mut out = Vec::new();
            for arg in &args {
                out.extend(list_arg(name, arg)?.iter().cloned());
            }
            Ok(Value::List(out))
        }
        "join" => {
            arity(name, &args, 2, usize::MAX)?;
            let sep = str_arg(name, &args[0])?;
            let mut parts = Vec::new();
            for list in &args[1..] {
                for item in list_arg(name, list)? {
                    parts.push(str_arg(name, item)?);
                }
            }
            Ok(Value::String(parts.join(&sep)))
        }
        "split" => {
            arity(name, &args, 2, 2)?;
            let sep = str_arg(name, &args[0])?;
            let text = str_arg(name, &args[1])?;
            if text.is_empty() {
                return Ok(Value::List(vec![Value::string("")]));
            }
            Ok(Value::List(text.split(sep.as_str()).map(Value::string).collect()))
        }
        "keys" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::List(map_arg(name, &args[0])?.keys().cloned().map(Value::String).collect()))
        }
        "values" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::List(map_arg(name, &args[0])?.values().cloned().collect()))
        }
        "tolist" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::List(list_arg(name, &args[0])?.to_vec()))
        }
        "toset" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::List(to_set(list_arg(name, &args[0])?)))
        }
        "tomap" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::Map(map_arg(name, &args[0])?.clone()))
        }
        "tostring" => {
            arity(name, &args, 1, 1)?;
            match &args[0] {
                Value::Null => Ok(Value::Null),
                v => str_arg(name, v).map(Value::String),
            }
        }
        "tonumber" => {
            arity(name, &args, 1, 1)?;
            match &args[0] {
                Value::Null => Ok(Value::Null),
                v => num_arg(name, v).map(number),
            }
        }
        "max" | "min" => {
            arity(name, &args, 1, usize::MAX)?;
            let mut best: Option<f64> = None;
            for arg in &args {
                let n = num_arg(name, arg)?;
                best = Some(match best {
                    None => n,
                    Some(b) if name == "max" => b.max(n),
                    Some(b) => b.min(n),
                });
            }
            Ok(number(best.unwrap_or_default()))
        }
        "upper" | "lower" => {
            arity(name, &args, 1, 1)?;
            let s = str_arg(name, &args[0])?;
            Ok(Value::String(if name == "upper" {
                s.to_uppercase()
            } else {
                s.to_lowercase()
            }))
        }
        "format" => {
            arity(name, &args, 1, usize::MAX)?;
            let spec = str_arg(name, &args[0])?;
            format_string(&spec, &args[1..]).map(Value::String)
        }
        "coalesce" => args
            .into_iter()
            .find(|v| !v.is_null() && v.as_str() != Some(""))
            .ok_or_else(|| EvalError::Unresolvable("coalesce() found no non-empty argument".into())),
        "contains" => {
            arity(name, &args, 2, 2)?;
            let items = list_arg(name, &args[0])?;
            Ok(Value::Bool(items.iter().any(|v| values_equal(v, &args[1]))))
        }
        "merge" => {
            let mut out = BTreeMap::new();
            for arg in &args {
                if arg.is_null() {
                    continue;
                }
                out.extend(map_arg(name, arg)?.clone());
            }
            Ok(Value::Map(out))
        }
        "flatten" => {
            arity(name, &args, 1, 1)?;
            let mut out = Vec::new();
            flatten_into(list_arg(name, &args[0])?, &mut out);
            Ok(Value::List(out))
        }
        "distinct" => {
            arity(name, &args, 1, 1)?;
            let mut out: Vec<Value> = Vec::new();
            for item in list_arg(name, &args[0])? {
                if !out.iter().any(|seen| values_equal(seen, item)) {
                    out.push(item.clone());
                }
            }
            Ok(Value::List(out))
        }
        "range" => {
            arity(name, &args, 1, 3)?;
            let nums = args
                .iter()
                .map(|a| num_arg(name, a))
                .collect::<Result<Vec<_>, _>>()?;
            let (start, end, step) = match nums.as_slice() {
                [end] => (0.0, *end, 1.0),
                [start, end] => (*start, *end, if end >= start { 1.0 } else { -1.0 }),
                [start, end, step] => (*start, *end, *step),
                _ => unreachable!("arity checked"),
            };
            if step == 0.0 {
                return fail("range() step cannot be zero");
            }
            let mut out = Vec::new();
            let mut x = start;
            while (step > 0.0 && x < end) || (step < 0.0 && x > end) {
                out.push(number(x));
                x += step;
                if out.len() > 1024 {
                    return fail("range() produces too many elements");
                }
            }
            Ok(Value::List(out))
        }
        "replace" => {
            arity(name, &args, 3, 3)?;
            let text = str_arg(name, &args[0])?;
            let search = str_arg(name, &args[1])?;
            let with = str_arg(name, &args[2])?;
            if search.len() > 1 && search.starts_with('/') && search.ends_with('/') {
                let re = Regex::new(&search[1..search.len() - 1])
                    .map_err(|e| EvalError::Unresolvable(format!("replace() pattern: {}", e)))?;
                Ok(Value::String(re.replace_all(&text, with.as_str()).into_owned()))
            } else {
                Ok(Value::String(text.replace(&search, &with)))
            }
        }
        _ => fail(format!("unsupported function {}()", name)),
    }
}

fn format_string(spec: &str, args: &[Value]) -> Result<String, EvalError> {
    let mut out = String::new();
    let mut chars = spec.chars().peekable();
    let mut next = args.iter();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        // Optional precision, e.g. `%.2f`.
        let mut precision = None;
        if chars.peek() == Some(&'.') {
            chars.next();
            let mut digits = String::new();
            while let Some(d) = chars.peek().filter(|d| d.is_ascii_digit()) {
                digits.push(*d);
                chars.next();
            }
            precision = digits.parse::<usize>().ok();
        }
        let verb = chars.next();
        if verb == Some('%') {
            out.push('%');
            continue;
        }
        let Some(arg) = next.next() else {
            return fail("format() has too few arguments");
        };
        match verb {
            Some('s') | Some('v') => out.push_str(&arg.to_template_string()),
            Some('q') => out.push_str(&format!("{:?}", arg.to_template_string())),
            Some('d') => out.push_str(&(num_arg("format", arg)? as i64).to_string()),
            Some('f') => {
                let n = num_arg("format", arg)?;
                out.push_str(&format!("{:.*}", precision.unwrap_or(6), n));
            }
            other => return fail(format!("format() verb {:?} not supported", other)),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::super::expr::parse_expression;
    use super::*;

    /// Scope backed by a flat `root.attr` table.
    struct TableScope(BTreeMap<String, Value>);

    impl Scope for TableScope {
        fn lookup(&self, root: &str, steps: &[Step]) -> Lookup {
            if root == "pending" {
                return Lookup::Pending;
            }
            match steps.first() {
                Some(Step::Attr(name)) => match self.0.get(&format!("{}.{}", root, name)) {
                    Some(v) => Lookup::Found {
                        value: v.clone(),
                        consumed: 1,
                    },
                    None => Lookup::Missing(format!("unknown {}.{}", root, name)),
                },
                _ => Lookup::Missing(root.to_string()),
            }
        }
    }

    fn scope() -> TableScope {
        let mut table = BTreeMap::new();
        table.insert("var.n".to_string(), Value::Int(3));
        table.insert("var.env".to_string(), Value::string("prod"));
        table.insert(
            "var.subnets".to_string(),
            Value::List(vec![Value::string("b"), Value::string("a"), Value::string("b")]),
        );
        let mut tags = BTreeMap::new();
        tags.insert("team".to_string(), Value::string("core"));
        tags.insert("app".to_string(), Value::string("web"));
        table.insert("var.tags".to_string(), Value::Map(tags));
        table.insert("var.missing_later".to_string(), Value::unresolved("x.y"));
        TableScope(table)
    }

    fn eval(src: &str) -> EvalResult {
        let scope = scope();
        let expr = parse_expression(src).unwrap();
        Evaluator::new(&scope).eval(&expr)
    }

    #[test]
    fn test_arithmetic_and_comparison() {
        assert_eq!(eval("var.n * 2 + 1").unwrap(), Value::Int(7));
        assert_eq!(eval("var.n / 2").unwrap(), Value::Float(1.5));
        assert_eq!(eval("var.n > 2 && var.env == \"prod\"").unwrap(), Value::Bool(true));
        assert_eq!(eval("1 == 1.0").unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_conditional_short_circuit() {
        assert_eq!(eval("var.n > 5 ? pending.x : \"small\"").unwrap(), Value::string("small"));
        assert_eq!(eval("false && pending.x").unwrap(), Value::Bool(false));
        assert_eq!(eval("pending.x").unwrap_err(), EvalError::Pending);
    }

    #[test]
    fn test_collections_and_functions() {
        assert_eq!(eval("length(var.subnets)").unwrap(), Value::Int(3));
        assert_eq!(
            eval("toset(var.subnets)").unwrap(),
            Value::List(vec![Value::string("a"), Value::string("b")])
        );
        assert_eq!(eval("join(\",\", keys(var.tags))").unwrap(), Value::string("app,team"));
        assert_eq!(eval("element(var.subnets, 4)").unwrap(), Value::string("a"));
        assert_eq!(eval("lookup(var.tags, \"nope\", \"dflt\")").unwrap(), Value::string("dflt"));
        assert_eq!(eval("max(1, var.n, 2)").unwrap(), Value::Int(3));
        assert_eq!(eval("max([4, 9]...)").unwrap(), Value::Int(9));
        assert_eq!(eval("format(\"%s-%d\", var.env, 7)").unwrap(), Value::string("prod-7"));
        assert_eq!(
            eval("replace(\"a-b-c\", \"/-/\", \"_\")").unwrap(),
            Value::string("a_b_c")
        );
        assert_eq!(eval("range(3)").unwrap().as_list().unwrap().len(), 3);
        assert_eq!(eval("coalesce(\"\", null, \"x\")").unwrap(), Value::string("x"));
    }

    #[test]
    fn test_for_expressions() {
        assert_eq!(
            eval("[for s in var.subnets : upper(s) if s != \"a\"]").unwrap(),
            Value::List(vec![Value::string("B"), Value::string("B")])
        );
        let grouped = eval("{for s in var.subnets : s => s...}").unwrap();
        assert_eq!(grouped.as_map().unwrap()["b"].as_list().unwrap().len(), 2);
        assert!(eval("{for s in var.subnets : s => 1}").is_err());
    }

    #[test]
    fn test_index_and_splat_on_values() {
        assert_eq!(eval("var.subnets[1]").unwrap(), Value::string("a"));
        assert_eq!(eval("var.tags[\"team\"]").unwrap(), Value::string("core"));
        assert!(eval("var.subnets[7]").is_err());
        assert_eq!(
            eval("[{a = 1}, {a = 2}][*].a").unwrap(),
            Value::List(vec![Value::Int(1), Value::Int(2)])
        );
    }

    #[test]
    fn test_unresolved_operands() {
        // A bare reference passes the placeholder through.
        assert_eq!(eval("var.missing_later").unwrap(), Value::unresolved("x.y"));
        // Templates embed it as text, arithmetic refuses it.
        assert_eq!(
            eval("\"id-${var.missing_later}\"").unwrap(),
            Value::string("id-${x.y}")
        );
        assert!(matches!(
            eval("var.missing_later + 1"),
            Err(EvalError::Unresolvable(_))
        ));
    }

    #[test]
    fn test_try_and_unknown_function() {
        assert_eq!(eval("try(var.tags.nope, \"fallback\")").unwrap(), Value::string("fallback"));
        assert_eq!(eval("try(pending.x, 1)").unwrap_err(), EvalError::Pending);
        assert!(matches!(eval("frobnicate(1)"), Err(EvalError::Unresolvable(_))));
    }

    #[test]
    fn test_bindings_shadow_scope() {
        let scope = scope();
        let expr = parse_expression("\"${each.key}-${count.index}\"").unwrap();
        let mut each = BTreeMap::new();
        each.insert("key".to_string(), Value::string("a"));
        let mut count = BTreeMap::new();
        count.insert("index".to_string(), Value::Int(0));
        let mut ev = Evaluator::new(&scope)
            .bind("each", Value::Map(each))
            .bind("count", Value::Map(count));
        assert_eq!(ev.eval(&expr).unwrap(), Value::string("a-0"));
    }
}
