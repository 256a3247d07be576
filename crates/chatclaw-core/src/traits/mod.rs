//! Trait seams between the dispatch core and its collaborators.

pub mod activator;

pub use activator::Activator;
