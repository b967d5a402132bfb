use std::sync::Arc;

use crate::{config::Config, message::NodeId, ring::Ring};

struct ClusterInner {
    nodes: Vec<NodeId>,
    ring: Ring,
    config: Config,
}

/// The fixed, shared view of the node set and ring. Built once at startup
/// and cheaply cloned (an `Arc` clone) into every node; there is no rebuild
/// operation since ring reconfiguration after startup is out of scope.
#[derive(Clone)]
pub struct Cluster(Arc<ClusterInner>);

impl Cluster {
    pub fn new(nodes: Vec<NodeId>, config: Config) -> anyhow::Result<Self> {
        config.validate()?;
        let ring = Ring::build(&nodes, config.t);
        Ok(Self(Arc::new(ClusterInner {
            nodes,
            ring,
            config,
        })))
    }

    pub fn ring(&self) -> &Ring {
        &self.0.ring
    }

    pub fn config(&self) -> &Config {
        &self.0.config
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.0.nodes
    }
}
