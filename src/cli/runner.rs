// Runner - Simulation execution logic
// Principle: Build the network from CLI input, run it, report every node

use crate::cli::config::{ConfigError, RandpaConfig};
use crate::cli::{SimulateCmd, Topology};
use crate::simulator::{Millis, NodeIndex, NodeKind, SimConfig, SimError, Simulator};
use crate::types::primitives::BlockNumber;
use serde::Serialize;
use tracing::info;

/// Final state of one simulated node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeReport {
    pub index: NodeIndex,
    pub producer: bool,
    pub head: BlockNumber,
    pub lib: BlockNumber,
    pub frozen: Option<bool>,
}

/// Outcome of a simulation run
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub elapsed_ms: Millis,
    pub nodes: Vec<NodeReport>,
}

impl SimulationReport {
    /// Lowest lib across all nodes
    pub fn min_lib(&self) -> BlockNumber {
        self.nodes.iter().map(|n| n.lib).min().unwrap_or(0)
    }
}

/// Run the simulation described by `cmd`
pub fn run_simulation(cmd: &SimulateCmd) -> Result<SimulationReport, RunnerError> {
    if cmd.nodes == 0 {
        return Err(RunnerError::Config("at least one producer is required".to_string()));
    }

    let randpa = match &cmd.config {
        Some(path) => RandpaConfig::load(path)?,
        None => SimConfig::default().randpa,
    };
    let config = SimConfig {
        slot_ms: cmd.slot_ms,
        conf_number: cmd.conf_number,
        randpa,
    };

    info!(
        "🚀 Simulating {} producers and {} full nodes over a {:?} topology",
        cmd.nodes, cmd.full_nodes, cmd.topology
    );

    let mut sim = Simulator::new(config);
    for _ in 0..cmd.nodes {
        sim.add_node(NodeKind::Producer, !cmd.no_randpa)?;
    }
    for _ in 0..cmd.full_nodes {
        sim.add_node(NodeKind::FullNode, !cmd.no_randpa)?;
    }
    sim.load_graph(&build_graph(cmd.topology, cmd.nodes + cmd.full_nodes, cmd.delay_ms))?;

    // Let the last slot's messages settle before reporting
    let end = cmd.slots * cmd.slot_ms + cmd.slot_ms / 2;
    sim.run_until(end);

    let nodes = sim
        .nodes()
        .iter()
        .map(|node| NodeReport {
            index: node.index(),
            producer: node.kind() == NodeKind::Producer,
            head: node.head_height(),
            lib: node.lib_height(),
            frozen: node.is_frozen(),
        })
        .collect();

    let report = SimulationReport {
        elapsed_ms: sim.now(),
        nodes,
    };
    info!("✅ Simulation finished, lowest lib: {}", report.min_lib());
    Ok(report)
}

/// Adjacency list of `count` nodes with uniform link delay
pub fn build_graph(topology: Topology, count: usize, delay: Millis) -> Vec<Vec<(NodeIndex, Millis)>> {
    let mut graph = vec![Vec::new(); count];
    match topology {
        Topology::Mesh => {
            for (a, edges) in graph.iter_mut().enumerate() {
                edges.extend((a + 1..count).map(|b| (b, delay)));
            }
        }
        Topology::Star => {
            for b in 1..count {
                graph[0].push((b, delay));
            }
        }
        Topology::Chain | Topology::Ring => {
            for a in 1..count {
                graph[a - 1].push((a, delay));
            }
            if topology == Topology::Ring && count > 2 {
                graph[count - 1].push((0, delay));
            }
        }
    }
    graph
}

/// Runner errors
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Simulation error: {0}")]
    Simulation(#[from] SimError),
}

impl From<ConfigError> for RunnerError {
    fn from(e: ConfigError) -> Self {
        RunnerError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(nodes: usize, topology: Topology) -> SimulateCmd {
        SimulateCmd {
            nodes,
            full_nodes: 0,
            topology,
            delay_ms: 10,
            slots: 6,
            slot_ms: 200,
            conf_number: None,
            no_randpa: false,
            config: None,
            format: "text".to_string(),
        }
    }

    #[test]
    fn test_build_graph_shapes() {
        let mesh = build_graph(Topology::Mesh, 3, 5);
        assert_eq!(mesh, vec![vec![(1, 5), (2, 5)], vec![(2, 5)], vec![]]);

        let star = build_graph(Topology::Star, 3, 5);
        assert_eq!(star[0], vec![(1, 5), (2, 5)]);
        assert!(star[1].is_empty());

        let ring = build_graph(Topology::Ring, 4, 5);
        assert_eq!(ring[3], vec![(0, 5)]);
        let chain = build_graph(Topology::Chain, 4, 5);
        assert!(chain[3].is_empty());
    }

    #[test]
    fn test_run_simulation_finalizes() {
        let report = run_simulation(&cmd(3, Topology::Mesh)).unwrap();
        assert_eq!(report.nodes.len(), 3);
        assert!(report.min_lib() >= 1);
        assert!(report.nodes.iter().all(|n| n.frozen == Some(false)));
    }

    #[test]
    fn test_run_simulation_without_randpa() {
        let mut cmd = cmd(3, Topology::Chain);
        cmd.no_randpa = true;
        let report = run_simulation(&cmd).unwrap();
        // Six blocks, confirmation depth six
        assert_eq!(report.min_lib(), 0);
        assert!(report.nodes.iter().all(|n| n.frozen.is_none()));
    }

    #[test]
    fn test_run_simulation_requires_producers() {
        assert!(matches!(
            run_simulation(&cmd(0, Topology::Mesh)),
            Err(RunnerError::Config(_))
        ));
    }
}
