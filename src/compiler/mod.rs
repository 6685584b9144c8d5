//! Source-to-bytecode compilation.
//!
//! There is no AST stage: [`codegen::compile`] drives the scanner directly
//! and emits bytecode while parsing, producing the top-level script as a
//! heap-allocated function object.

mod codegen;
pub mod scanner;

pub use codegen::{compile, compile_with_roots};
