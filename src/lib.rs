pub mod approval;
pub mod audit;
pub mod canonical;
pub mod config;
pub mod dependency;
pub mod error;
pub mod section;
pub mod service;
pub mod signature;
pub mod status;
pub mod storage;
pub mod store;
pub mod template;
pub mod token_cache;
pub mod types;
pub mod utils;
pub mod validation;

pub use error::{ErrorKind, RecordError, SignatureFailure};
pub use service::{ApiError, RecordService};
