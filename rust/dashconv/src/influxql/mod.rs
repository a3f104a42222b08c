//! InfluxQL front end: tokenizer, parser and structured-target lowering.

pub mod ast;
pub mod lexer;
pub mod parser;
pub mod structured;

pub use ast::{QueryShape, SelectQuery};
pub use parser::parse;
pub use structured::{lower_target, LoweredTarget};
