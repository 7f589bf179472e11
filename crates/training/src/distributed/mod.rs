//! Process coordination for data-parallel training.
//!
//! A [`DistributedContext`] is built once per process from the launcher's
//! environment and handed to the trainer. When no launcher variables are
//! present, or the rendezvous fails, the process trains alone.

mod group;
mod replicated;

pub use group::{LoopbackGroup, ProcessGroup, TcpProcessGroup};
pub use replicated::ReplicatedModel;

use std::time::Duration;

use tracing::{info, warn};

use crate::config::{DistributedConfig, InitMethod};

pub const MASTER_ADDR: &str = "MASTER_ADDR";
pub const MASTER_PORT: &str = "MASTER_PORT";

impl InitMethod {
    /// Variables carrying (rank, world size, local rank).
    pub fn variables(self) -> (&'static str, &'static str, &'static str) {
        match self {
            InitMethod::Slurm => ("SLURM_PROCID", "SLURM_NTASKS", "SLURM_LOCALID"),
            InitMethod::Ompi => (
                "OMPI_COMM_WORLD_RANK",
                "OMPI_COMM_WORLD_SIZE",
                "OMPI_COMM_WORLD_LOCAL_RANK",
            ),
            InitMethod::Env => ("RANK", "WORLD_SIZE", "LOCAL_RANK"),
        }
    }
}

pub struct DistributedContext {
    rank: usize,
    world_size: usize,
    local_rank: usize,
    distributed: bool,
    group: Option<Box<dyn ProcessGroup>>,
}

impl std::fmt::Debug for DistributedContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedContext")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .field("local_rank", &self.local_rank)
            .field("distributed", &self.distributed)
            .finish()
    }
}

impl DistributedContext {
    pub fn single_process() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            local_rank: 0,
            distributed: false,
            group: None,
        }
    }

    pub fn with_group(group: Box<dyn ProcessGroup>, local_rank: usize) -> Self {
        Self {
            rank: group.rank(),
            world_size: group.world_size(),
            local_rank,
            distributed: true,
            group: Some(group),
        }
    }

    /// One rank of a run whose peers are assumed to hold identical state.
    pub fn simulated(rank: usize, world_size: usize) -> Self {
        Self::with_group(Box::new(LoopbackGroup::new(rank, world_size)), 0)
    }

    pub fn from_env(config: &DistributedConfig) -> Self {
        Self::from_lookup(config, |key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(config: &DistributedConfig, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if !config.enabled {
            return Self::single_process();
        }

        let (rank_var, size_var, local_var) = config.init.variables();
        let parse = |key: &str| lookup(key).and_then(|value| value.trim().parse::<usize>().ok());
        let (Some(rank), Some(world_size)) = (parse(rank_var), parse(size_var)) else {
            info!("no {rank_var}/{size_var} in the environment; using a single process");
            return Self::single_process();
        };
        if world_size <= 1 {
            return Self::single_process();
        }
        let local_rank = parse(local_var).unwrap_or(0);

        let Some(port) = parse(MASTER_PORT) else {
            warn!("{MASTER_PORT} is not set; using a single process");
            return Self::single_process();
        };
        let host = lookup(MASTER_ADDR).unwrap_or_else(|| "127.0.0.1".to_string());
        let addr = format!("{host}:{port}");
        let timeout = Duration::from_secs(config.timeout_secs);

        match TcpProcessGroup::rendezvous(&addr, rank, world_size, timeout) {
            Ok(group) => {
                info!(rank, world_size, local_rank, %addr, "joined process group");
                Self::with_group(Box::new(group), local_rank)
            }
            Err(err) => {
                warn!(rank, world_size, "{err}; using a single process");
                Self::single_process()
            }
        }
    }

    pub fn is_distributed(&self) -> bool {
        self.distributed
    }

    /// `None` outside of a process group.
    pub fn rank(&self) -> Option<usize> {
        self.distributed.then_some(self.rank)
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn local_rank(&self) -> usize {
        self.local_rank
    }

    /// The process allowed to write checkpoints, metrics and progress.
    pub fn is_primary(&self) -> bool {
        !self.distributed || self.rank == 0
    }

    /// Hands the group to the model wrapper; the context keeps its identity.
    pub fn take_group(&mut self) -> Option<Box<dyn ProcessGroup>> {
        self.group.take()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn missing_variables_mean_single_process() {
        let ctx = DistributedContext::from_lookup(&DistributedConfig::default(), lookup(&[]));
        assert!(!ctx.is_distributed());
        assert_eq!(ctx.rank(), None);
        assert!(ctx.is_primary());
    }

    #[test]
    fn world_of_one_is_not_distributed() {
        let ctx = DistributedContext::from_lookup(
            &DistributedConfig::default(),
            lookup(&[("SLURM_PROCID", "0"), ("SLURM_NTASKS", "1")]),
        );
        assert!(!ctx.is_distributed());
        assert_eq!(ctx.world_size(), 1);
    }

    #[test]
    fn unreachable_rendezvous_falls_back() {
        let config = DistributedConfig {
            init: InitMethod::Ompi,
            timeout_secs: 1,
            ..DistributedConfig::default()
        };
        let ctx = DistributedContext::from_lookup(
            &config,
            lookup(&[
                ("OMPI_COMM_WORLD_RANK", "1"),
                ("OMPI_COMM_WORLD_SIZE", "2"),
                ("MASTER_ADDR", "127.0.0.1"),
                ("MASTER_PORT", "1"),
            ]),
        );
        assert!(!ctx.is_distributed());
        assert!(ctx.is_primary());
    }

    #[test]
    fn simulated_rank_is_not_primary() {
        let mut ctx = DistributedContext::simulated(1, 2);
        assert!(ctx.is_distributed());
        assert_eq!(ctx.rank(), Some(1));
        assert!(!ctx.is_primary());
        assert!(ctx.take_group().is_some());
        assert_eq!(ctx.rank(), Some(1));
    }
}
