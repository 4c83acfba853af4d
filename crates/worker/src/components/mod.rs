pub mod entry_processor;
pub mod schema_validator;

pub use entry_processor::EntryProcessor;
pub use schema_validator::SchemaValidator;
