//! Utilities module - text canonicalization and content digests

pub mod text_utils;

pub use text_utils::TextUtils;
