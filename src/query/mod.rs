// Read side of the index

pub mod engine;

pub use engine::{CompletionItem, QueryEngine};
