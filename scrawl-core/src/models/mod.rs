//! Data models shared between the CLI and the sync engine.

mod document;

pub use document::Document;
