pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod group;
pub mod hash;
pub mod merge;
pub mod naming;
pub mod partition;
pub mod reduce;
pub mod restore;
pub mod sort;
pub mod stream;
pub mod table;

pub use config::EngineConfig;
pub use dispatch::{Dispatcher, JobSpec, Operation};
pub use error::{Error, Result};
