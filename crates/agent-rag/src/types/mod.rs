//! Core types for knowledge ingestion

pub mod document;

pub use document::{hash_content, ContentType, Document, Fragment, Provenance};
