pub mod connect;
pub mod models;
pub mod mutations;
pub mod queries;
