//! Execution serializers on top of the shared Tokio worker pool.

pub mod strand;

pub use strand::{Strand, StrandClosed};
