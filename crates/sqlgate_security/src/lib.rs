//! SQLGate Security Module
//!
//! Provides:
//! - **Policy**: table/column allowlist, row cap, statement kinds, forbidden patterns
//! - **Validator**: AST-based SQL validation and `LIMIT` sanitization
//! - **Resolver**: scope-aware table/column resolution and `*` expansion
//! - **ErrorKind**: the failure taxonomy every layer reports with

mod error;
mod lexical;
pub mod policy;
mod resolver;
pub mod validator;

pub use error::{ErrorKind, PolicyError};
pub use policy::{
    ForbiddenPattern, PolicyBuilder, PolicyConfig, SecurityPolicy, StatementKind, TableConfig,
    TableRule, WildcardMode, DEFAULT_FORBIDDEN_PATTERNS, DEFAULT_MAX_ROWS,
};
pub use validator::{validate, Rejection, ValidationOutcome};
