//! Per-claim-batch worker identity.
//!
//! Every background loop mints a fresh [`OwnerToken`] each time it starts a claim
//! cycle's lease (not once per process) so that a crashed-and-restarted worker never
//! appears to still own rows it claimed before the crash — ownership is reestablished
//! by `ReapExpired`, not by token reuse.

use uuid::Uuid;

pub type OwnerToken = Uuid;

pub fn new_owner_token() -> OwnerToken {
    Uuid::new_v4()
}
