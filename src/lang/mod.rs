//! The restricted analysis language candidate code is written in.
//!
//! Pipeline: [`lexer::lex`] → [`parser::parse`] → [`interp::Interpreter`].
//! The static capability scan in [`crate::analyzer`] runs between parsing
//! and interpretation.

pub mod ast;
pub mod interp;
pub mod lexer;
pub mod parser;

pub use ast::Program;
pub use parser::parse;
