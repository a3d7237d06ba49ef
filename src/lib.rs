pub mod config;
pub mod context;
pub mod error;
pub mod kv;
pub mod lock;
pub mod meta;
pub mod quota;
pub mod slice;

pub use context::Context;
pub use error::{MetaError, Result};
pub use meta::{Ino, Meta, ROOT_INODE};
