pub mod account_status;
pub mod audit;
pub mod exports;
pub mod report_filters;
pub mod report_store;
pub mod scheduler;
