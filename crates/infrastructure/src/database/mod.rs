pub mod manager;
pub mod postgres;

pub use manager::DatabaseManager;
pub use postgres::{
    PostgresQueueRepository, PostgresRunRepository, PostgresSourceExecutor,
    PostgresTaskRunRepository,
};
