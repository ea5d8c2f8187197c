//! REST collaborators of the streaming core

pub mod time;

pub use time::HttpTimeSource;
