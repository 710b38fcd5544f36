//! Protocol handlers
//!
//! Each role dispatches incoming [`SyncMessage`](super::protocol::SyncMessage)s
//! through a single `match`:
//! - [`leader`]: validation, membership, request fan-out, collision merge
//! - [`follower`]: applying leader broadcasts, catch-up, acknowledgements
//! - [`shared`]: delta collection and the `set_data` merge used by both

pub mod follower;
pub mod leader;
pub mod shared;

pub use follower::FollowerExit;
pub use shared::{MergeMode, MergeReport};
