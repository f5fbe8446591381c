pub mod config;
pub mod table;
pub mod transactions;
pub mod simulation;

pub use crate::config::{ConfigError, SimulationConfig, TableConfig, TableVariant};
pub use crate::table::{
    InstrumentedLockingTable, LockingTable, OptimizedLockingTable, Row, StandardLockingTable,
    TupleId, NOT_MODIFIED,
};
pub use crate::transactions::{IsolationLevel, Transaction, TransactionError, TransactionKind};
pub use crate::simulation::{RunReport, Simulation, SimulationError};
