pub mod claim;
pub mod compactor;
pub mod config;
pub mod limits;
pub mod model;
pub mod observability;
pub mod store;
pub mod wal;
