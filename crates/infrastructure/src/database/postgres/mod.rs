pub mod postgres_queue_repository;
pub mod postgres_run_repository;
pub mod postgres_source_executor;
pub mod postgres_task_run_repository;

pub use postgres_queue_repository::*;
pub use postgres_run_repository::PostgresRunRepository;
pub use postgres_source_executor::*;
pub use postgres_task_run_repository::*;
