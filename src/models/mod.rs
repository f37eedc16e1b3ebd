pub mod agent_io;
pub mod public;
pub mod table;

pub use public::*;
pub use table::{ColumnType, ResultTable, TableColumn};
