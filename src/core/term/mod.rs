//! Escape sequence interpretation
//!
//! - **style**: colors, attribute flags and styled spans
//! - **parser**: the stateful byte-stream interpreter

pub mod parser;
pub mod style;

pub use parser::{finish, interpret, InterpreterState};
pub use style::{AttrFlags, StyledSpan, TextAttrs};
