pub mod batch_planner;
pub mod bigram;
pub mod config;
pub mod corpus;
pub mod dataloader;
pub mod device;
pub mod error;
pub mod hellaswag;
pub mod logger;
pub mod model;
pub mod observability;
pub mod random;
pub mod sampler;
pub mod scheduler;
pub mod shard;
pub mod tokenizer;
pub mod trainer;
pub mod writer;

pub use error::{Error, Result};
