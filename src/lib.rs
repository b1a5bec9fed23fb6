pub mod config;
pub mod core;
pub mod logging;
pub mod services;
pub mod session;
pub mod sql;

// Re-export commonly used types
pub use core::{Filter, FilterAction, FilterSpec, FilterState, RangeSet, ScopeId, VariantColumns};
pub use services::{FilterRegistry, FiltersChanged, QueryExecutor};
pub use session::{FilterSession, SessionEvent};
pub use sql::{Condition, ConditionMatrix};
