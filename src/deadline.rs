//! Per-operation deadlines threaded through every remote call.

use crate::error::{Error, Result};
use std::time::{Duration, Instant};

/// Budget for single-secret reads, writes and disables.
pub const POINT_LOOKUP: Duration = Duration::from_secs(10);
/// Budget for resolving every secret of a container at one version.
pub const CONTAINER_VERSIONS: Duration = Duration::from_secs(10);
/// Budget for enumerating the full history of one secret.
pub const SECRET_HISTORY: Duration = Duration::from_secs(30);
/// Budget for reading the current value of every secret in a container.
pub const CONTAINER_LISTING: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    operation: &'static str,
    expires_at: Instant,
}

impl Deadline {
    pub fn after(operation: &'static str, budget: Duration) -> Self {
        Self {
            operation,
            expires_at: Instant::now() + budget,
        }
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }

    /// Time left before the deadline, or `DeadlineExceeded` once it has passed.
    pub fn remaining(&self) -> Result<Duration> {
        let now = Instant::now();
        if now >= self.expires_at {
            return Err(Error::DeadlineExceeded {
                operation: self.operation,
            });
        }
        Ok(self.expires_at - now)
    }

    pub fn check(&self) -> Result<()> {
        self.remaining().map(|_| ())
    }
}
