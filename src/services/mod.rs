pub mod compiler;
pub mod count;
pub mod notifier;
pub mod registry;

pub use compiler::ConditionCompiler;
pub use count::{FilteredCount, FilteredCountRefresher, QueryExecutor};
pub use notifier::{ChangeNotifier, FilterListener, FilterRef, FiltersChanged, LastMutation, listener};
pub use registry::FilterRegistry;
