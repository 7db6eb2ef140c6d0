pub mod domains;
pub mod expiry;
pub mod log_retention;
pub mod project_cleanup;
