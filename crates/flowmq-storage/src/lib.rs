// Postgres storage layer with sqlx

pub mod store;

pub use store::PgStateStore;
