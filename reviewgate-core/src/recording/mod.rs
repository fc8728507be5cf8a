//! Types for recording webhook and platform API traffic as JSON lines.

pub mod sanitizer;
pub mod types;

pub use sanitizer::{Sanitizer, SENSITIVE_HEADERS};
pub use types::*;
