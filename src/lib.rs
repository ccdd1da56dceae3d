//! Deduplicating, content-addressed, versioned backup engine.
//!
//! See `backup::repository` for the composition root. The crate never
//! initializes a logger itself; callers wire up `env_logger` (or
//! anything else `log` supports) before driving these APIs.

pub mod backup;
pub mod context;
pub mod error;
pub mod io;
pub mod mac;
pub mod resource;
pub mod storage;

pub use context::AppContext;
pub use error::{RepoError, Result};
pub use mac::Mac;
