pub mod config;
pub mod errors;
pub mod models;
pub mod services;
pub mod traits;

pub use config::AppConfig;
pub use errors::*;
pub use services::CompletionNotifier;

/// 统一的Result类型
pub type QueuerResult<T> = std::result::Result<T, QueuerError>;
