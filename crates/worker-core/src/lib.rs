pub mod formatters;
pub mod models;
pub mod schemas;
