//! Entropy-pool CSPRNG.
//!
//! A 256-byte SHA-1 mixed pool, seeded by background slow polls over files,
//! URLs, programs and custom sources, stirred inline by a fast poll, and
//! exported through an X9.17-style AES-256 output stage.

pub mod config;
pub mod entropy;
pub mod error;
pub mod pool;
pub mod prng;

pub use config::{EnvProperties, GeneratorConfig, PropertyMap, PropertySource, SourceDescriptor, SourceRegistry};
pub use entropy::collector::PollState;
pub use entropy::{EntropyError, EntropySource};
pub use error::CsprngError;
pub use prng::{Csprng, OUTPUT_SIZE};

