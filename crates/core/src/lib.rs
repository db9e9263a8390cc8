//! `flowforge-core` — primitives shared by every flowforge crate.
//!
//! Nothing in here touches threads, IO or the engine itself: tenant identity,
//! the injectable clock, and the core error type.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock, instant_after};
pub use error::{CoreError, CoreResult};
pub use id::TenantId;
