pub mod database;
pub mod schema;
pub mod writer;
