//! Kopa policy analysis: a minimal Rego rule graph and the dependency
//! traversal that discovers which resource kinds a policy consumes.

#![forbid(unsafe_code)]

mod graph;
mod rego;
mod store;

pub use graph::{analyze, Analysis, CompileError, CompiledPolicy, Rule};
pub use rego::{parse_module, ParseError, ParsedRule, Ref, RefSegment};
pub use store::{PolicySink, PolicyStore};
