pub mod filter;
pub mod range;
pub mod state;
pub mod types;

pub use filter::{Filter, FilterSpec, VariantColumns};
pub use range::{Range, RangeSet};
pub use state::{FilterState, FilterStateType};
pub use types::*;
