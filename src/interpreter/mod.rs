//! Expression & cardinality interpreter.
//!
//! Reduces raw attribute expressions to literal values and repetition
//! constructs (`count`, `for_each`) to concrete instance counts:
//!
//! - [`lexer`] and [`expr`] turn template and expression text into a tree,
//! - [`eval`] evaluates a tree against a lookup scope,
//! - [`resolve`] drives fixed-point substitution over a whole record set.

pub mod eval;
pub mod expr;
pub mod lexer;
pub mod resolve;

pub use eval::{EvalError, Evaluator, Lookup, Scope, Step};
pub use expr::{parse_expression, parse_template, Expr};
pub use lexer::SyntaxError;
pub use resolve::{Interpreter, Resolution, ResolvedResource, DEFAULT_MAX_ITERATIONS};
