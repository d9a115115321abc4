pub mod table_service;
pub mod user_rollup;
