// Durable storage
pub mod postgres;

pub use postgres::PostgresStore;
