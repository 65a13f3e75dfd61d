use std::sync::Arc;
use std::time::Duration;
use crate::auth::credential::{AccessToken, TokenCredential};
use crate::reactor::clock::{Clock, ManualClock};

/// Hands out the same token over and over, always valid for a fixed time from the clock's
///  current time
pub struct FixedTokenCredential {
    clock: Arc<ManualClock>,
    lifetime: Duration,
}

impl FixedTokenCredential {
    pub fn valid_for(clock: Arc<ManualClock>, lifetime: Duration) -> FixedTokenCredential {
        FixedTokenCredential { clock, lifetime }
    }
}

impl TokenCredential for FixedTokenCredential {
    fn get_token(&self) -> anyhow::Result<AccessToken> {
        Ok(AccessToken::new("test-token", self.clock.wall_clock() + self.lifetime))
    }
}
