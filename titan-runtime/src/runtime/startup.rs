//! Startup tasks and seed-data resolution
//!
//! A silo runs its startup tasks in declared order after joining the
//! cluster and before opening the external listener. Any failure is
//! fatal: the silo marks itself dead and aborts the join.

use std::fmt;

use async_trait::async_trait;

use crate::config::SeedConfig;
use crate::error::Result;
use crate::runtime::RuntimeHandle;

/// One deterministic unit of silo bring-up work
#[async_trait]
pub trait StartupTask: Send + Sync + 'static {
    /// Name used in bring-up logs
    fn name(&self) -> &str;

    /// Execute the task; an error aborts the silo join
    async fn run(&self, runtime: &RuntimeHandle) -> Result<()>;
}

/// Where seed data was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedOrigin {
    /// Explicit file path from configuration
    File,
    /// Resource embedded in the binary
    Embedded,
}

impl fmt::Display for SeedOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File => write!(f, "file"),
            Self::Embedded => write!(f, "embedded"),
        }
    }
}

/// Resolve the seed document for a catalog: the configured file path wins,
/// then the embedded resource. `Ok(None)` means the caller falls back to
/// its hard-coded data (which it should log).
pub fn resolve_seed_document(
    seed: &SeedConfig,
    embedded: Option<&'static str>,
) -> Result<Option<(SeedOrigin, String)>> {
    if let Some(path) = &seed.path {
        let text = std::fs::read_to_string(path)?;
        return Ok(Some((SeedOrigin::File, text)));
    }
    if let Some(resource) = embedded {
        return Ok(Some((SeedOrigin::Embedded, resource.to_string())));
    }
    Ok(None)
}
