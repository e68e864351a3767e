//! CSV extract-transform-load into PostgreSQL
//!
//! A [`LoadTrigger`] names a stored CSV object. The [`CsvLoader`] fetches it,
//! infers or reconciles a schema, and loads the rows through a [`Warehouse`],
//! recording every load in an [`AuditLog`].

pub mod audit;
pub mod loader;
pub mod schema;
pub mod transform;
pub mod trigger;
pub mod warehouse;

pub use audit::{AuditLog, AuditRecord, AuditStatus, LoadStage, MemoryAuditLog, PgAuditLog};
pub use loader::{CsvLoader, LoadOutcome, LoaderConfig};
pub use schema::{infer_schema, ColumnType, InferredColumn, InferredSchema};
pub use trigger::{triggers_from_event, DispatchSummary, LoadDispatcher, LoadTrigger};
pub use warehouse::{MemoryWarehouse, PgWarehouse, TableColumn, Warehouse};
