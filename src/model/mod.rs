pub mod common;
pub mod database;
pub mod gateway;
pub mod query;
pub mod response;

pub use common::*;
pub use database::*;
pub use gateway::*;
pub use query::*;
pub use response::*;
