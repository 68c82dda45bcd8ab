//! Core types and utilities

pub mod types;
pub mod error;
pub mod logging;
pub mod handle;
pub mod clock;

pub use types::*;
pub use error::Error;
pub use handle::{HandleId, OwnerHandle, Shared, WeakHandle};
pub use clock::{Clock, ManualClock, SystemClock};
