//! Grid storage and indexing

mod field;
mod layout;

pub use field::{Field3D, SpectralField};
pub use layout::GridLayout;
