pub mod kubernetes;
pub mod observability;
pub mod redis;
