//! Estimating how many inference requests may be in flight at once.
//!
//! The backend shares its accelerator with the model weights, so the safe
//! request concurrency depends on how much memory is left over. We query
//! that once per run; if the query fails for any reason we degrade to a
//! conservative fixed bound rather than failing the run.

use async_trait::async_trait;
use tokio::process::Command;

use crate::prelude::*;

/// Lower clamp on the concurrency bound.
const MIN_CONCURRENCY: usize = 1;

/// Upper clamp on the concurrency bound.
const MAX_CONCURRENCY: usize = 4;

/// Bound used whenever the telemetry query fails or no device is present.
const FALLBACK_CONCURRENCY: usize = 2;

/// Approximate accelerator memory consumed by one in-flight request, in MiB.
const PER_REQUEST_MIB: u64 = 3 * 1024;

/// A strategy for choosing the run's concurrency bound.
///
/// Implementations must never fail: any internal fault degrades to a safe
/// fixed value. The bound is computed once, before dispatch, and holds for
/// the lifetime of the run.
#[async_trait]
pub trait CapacityEstimator: Send + Sync {
    /// The maximum number of concurrently in-flight inference requests.
    /// Always in `[MIN_CONCURRENCY, MAX_CONCURRENCY]`.
    async fn concurrency_bound(&self) -> usize;
}

/// A fixed concurrency bound, for `--jobs` and for environments without
/// accelerator access.
pub struct FixedCapacity(pub usize);

#[async_trait]
impl CapacityEstimator for FixedCapacity {
    async fn concurrency_bound(&self) -> usize {
        self.0.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY)
    }
}

/// Estimate capacity from free accelerator memory, as reported by
/// `nvidia-smi`.
pub struct GpuMemoryCapacity {
    /// The program to run. Overridable so tests can point at a missing
    /// binary.
    command: String,
}

impl Default for GpuMemoryCapacity {
    fn default() -> Self {
        Self {
            command: "nvidia-smi".to_owned(),
        }
    }
}

#[async_trait]
impl CapacityEstimator for GpuMemoryCapacity {
    async fn concurrency_bound(&self) -> usize {
        match self.query_free_mib().await {
            Ok(free_mib) => {
                let bound = bound_from_free_mib(free_mib);
                debug!(free_mib, bound, "Estimated concurrency from free accelerator memory");
                bound
            }
            Err(err) => {
                debug!("Falling back to fixed concurrency: {:?}", err);
                FALLBACK_CONCURRENCY
            }
        }
    }
}

impl GpuMemoryCapacity {
    #[cfg(test)]
    fn with_command(command: &str) -> Self {
        Self {
            command: command.to_owned(),
        }
    }

    /// Ask `nvidia-smi` for device 0's free memory, in MiB.
    async fn query_free_mib(&self) -> Result<u64> {
        let output = Command::new(&self.command)
            .args(["--query-gpu=memory.free", "--format=csv,noheader,nounits"])
            .output()
            .await
            .with_context(|| format!("failed to run {}", self.command))?;
        if !output.status.success() {
            anyhow::bail!("{} exited with {}", self.command, output.status);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_free_mib(&stdout)
            .ok_or_else(|| anyhow::anyhow!("no devices reported by {}", self.command))
    }
}

/// Parse the first device's free memory from `nvidia-smi` query output.
///
/// One line per device; we only size against device 0.
fn parse_free_mib(output: &str) -> Option<u64> {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.parse::<u64>().ok())
}

/// Compute the concurrency bound from free memory, clamped to `[1, 4]`.
fn bound_from_free_mib(free_mib: u64) -> usize {
    ((free_mib / PER_REQUEST_MIB) as usize).clamp(MIN_CONCURRENCY, MAX_CONCURRENCY)
}
