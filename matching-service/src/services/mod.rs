//! Services module for matching-service.

pub mod database;
pub mod metrics;

pub use database::{Database, ManualMatchFields, TransactionUpdate};
pub use metrics::{
    init_metrics, record_error, record_match_operation, record_transactions_classified,
    render_metrics,
};
