pub mod handler;
pub mod repository;
pub mod source;
pub mod transport;
pub mod trigger;
pub mod worker;

pub use handler::*;
pub use repository::*;
pub use source::*;
pub use transport::*;
pub use trigger::*;
pub use worker::*;
