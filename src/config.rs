use crate::event::Tick;

/// Tunable constants for the replication protocol, plus the two
/// simulation-only timing constants governing this crate's virtual clock
/// (neither appears in the distilled protocol description, which assumed a
/// host framework supplying wall-clock timeouts).
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Replication factor.
    pub n: usize,
    /// Read quorum.
    pub r: usize,
    /// Write quorum.
    pub w: usize,
    /// Virtual ring replicas per node.
    pub t: u32,
    /// Ticks a sent request waits for a response before escalating to the
    /// failure detector.
    pub response_timeout: Tick,
    /// Ticks between successive periodic probes of the oldest failed node.
    pub retry_interval: Tick,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            n: 3,
            r: 2,
            w: 2,
            t: 10,
            response_timeout: 10,
            retry_interval: 5,
        }
    }
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.r + self.w > self.n,
            "read+write quorum must exceed replication factor: R({}) + W({}) <= N({})",
            self.r,
            self.w,
            self.n
        );
        Ok(())
    }
}
