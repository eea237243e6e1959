//! Host terminal output.
//!
//! - **render**: incremental, styled printing of a session's scrollback

pub mod render;

pub use render::SpanRenderer;
