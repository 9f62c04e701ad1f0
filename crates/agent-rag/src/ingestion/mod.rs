//! Text extraction and fragmentation

mod extractor;
mod fragmenter;

pub use extractor::{DocumentExtractor, ExtractedText};
pub use fragmenter::{FragmentSpan, Fragmenter};
