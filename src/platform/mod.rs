//! Platform abstraction layer
//!
//! Handles browser/native differences for:
//! - Time (`Date.now()` vs `SystemTime`)
//! - Storage (LocalStorage on web, files natively)

pub mod storage;
pub mod time;

#[cfg(target_arch = "wasm32")]
pub use storage::LocalStorage;
#[cfg(not(target_arch = "wasm32"))]
pub use storage::FileStorage;
pub use storage::{MemoryStorage, Storage};
pub use time::{Clock, ManualClock, SystemClock};
