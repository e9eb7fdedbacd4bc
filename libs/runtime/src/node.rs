//! Node Process
//!
//! Every runtime hosts one node process, named after the runtime and
//! addressed by the router's node id. It spawns children on request, keeps
//! track of the other nodes it has joined, and on shutdown ends its children
//! before taking the router down.

use crate::error::{ProcessError, Result};
use crate::process::{CommandFn, DistProcess, ProcessType};
use runtime_config::defaults::{process::SHUTDOWN_TIMEOUT_MS, routing};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use types::{Command, CommandKind, ProcessId};

/// State of the node process.
#[derive(Debug, Default)]
pub struct Node {
    children: Vec<ProcessId>,
    nodes: BTreeSet<ProcessId>,
}

impl ProcessType for Node {
    const TYPE_NAME: &'static str = routing::NODE_TYPE;

    fn commands() -> Vec<(CommandKind, CommandFn<Self>)> {
        vec![
            (CommandKind::New, on_new),
            (CommandKind::NodeJoin, on_node_join),
            (CommandKind::NodeAck, on_node_ack),
            (CommandKind::NodeLeave, on_node_leave),
        ]
    }

    /// The node is driven by its caller; there is no main body.
    fn run(_process: &mut DistProcess<Self>) -> Result<()> {
        Ok(())
    }
}

fn on_new(node: &mut DistProcess<Node>, src: Option<ProcessId>, command: Command) -> Result<()> {
    let Command::New {
        seqno,
        pid_type,
        count,
        names,
        setup,
    } = command
    else {
        return Ok(());
    };
    let Some(requester) = src else {
        warn!(pid_type = %pid_type, "New without requester; dropped");
        return Ok(());
    };

    let setup = setup.map(|request| (requester.clone(), request));
    let spawned = match node
        .runtime()
        .spawn(&pid_type, &requester, count, &names, setup)
    {
        Ok(spawned) => spawned,
        Err(e) => {
            error!(pid_type = %pid_type, requester = %requester, error = %e, "Cannot spawn");
            Vec::new()
        }
    };
    node.state.children.extend(spawned.iter().cloned());
    node.send_command(&requester, Command::NewAck { seqno, spawned })
}

fn on_node_join(
    node: &mut DistProcess<Node>,
    src: Option<ProcessId>,
    command: Command,
) -> Result<()> {
    let Command::NodeJoin { seqno } = command else {
        return Ok(());
    };
    let Some(peer) = src else {
        return Ok(());
    };
    info!(peer = %peer, "Node joined");
    let mut nodes: Vec<ProcessId> = node.state.nodes.iter().cloned().collect();
    nodes.push(node.id().clone());
    node.state.nodes.insert(peer.clone());
    node.send_command(&peer, Command::NodeAck { seqno, nodes })
}

fn on_node_ack(
    node: &mut DistProcess<Node>,
    src: Option<ProcessId>,
    command: Command,
) -> Result<()> {
    if let Command::NodeAck { nodes, .. } = &command {
        let me = node.id().clone();
        node.state
            .nodes
            .extend(nodes.iter().filter(|n| **n != me).cloned());
    }
    node.on_ack(src, command)
}

fn on_node_leave(
    node: &mut DistProcess<Node>,
    src: Option<ProcessId>,
    _command: Command,
) -> Result<()> {
    if let Some(peer) = src {
        if node.state.nodes.remove(&peer) {
            info!(peer = %peer, "Node left");
        }
    }
    Ok(())
}

impl DistProcess<Node> {
    /// Children spawned by this node and not yet ended.
    pub fn children(&self) -> &[ProcessId] {
        &self.state.children
    }

    /// Other nodes this node knows of.
    pub fn nodes(&self) -> Vec<ProcessId> {
        self.state.nodes.iter().cloned().collect()
    }

    /// Join the node `peer`, learning the nodes it knows.
    pub fn join(&mut self, peer: &ProcessId) -> Result<Vec<ProcessId>> {
        self.request(CommandKind::NodeJoin, std::slice::from_ref(peer), |seqno| {
            Command::NodeJoin { seqno }
        })?;
        self.state.nodes.insert(peer.clone());
        info!(peer = %peer, known = self.state.nodes.len(), "Joined node");
        Ok(self.nodes())
    }

    /// Find a peer through `host:port` and join its node.
    pub fn bootstrap(&mut self, host: &str, port: u16) -> Result<ProcessId> {
        let timeout = self.runtime().config().bootstrap_timeout();
        let peer = self.runtime().router().bootstrap_node(host, port, timeout)?;
        self.join(&peer)?;
        Ok(peer)
    }

    /// Answer requests for `duration`, running labels named `serve`.
    pub fn serve(&mut self, duration: Duration) -> Result<()> {
        let deadline = Instant::now() + duration;
        while let Some(left) = deadline.checked_duration_since(Instant::now()) {
            if left.is_zero() {
                break;
            }
            self.label("serve", true, Some(left))?;
            self.reset_timer();
        }
        Ok(())
    }

    /// End every child, tell the other nodes we are leaving, then stop the
    /// router. Children that do not acknowledge in time are left behind.
    pub fn shutdown(mut self) -> Result<()> {
        let router = std::sync::Arc::clone(self.runtime().router());
        let children: Vec<ProcessId> = std::mem::take(&mut self.state.children)
            .into_iter()
            .filter(|child| router.is_local(child))
            .collect();

        let grace = Duration::from_millis(SHUTDOWN_TIMEOUT_MS);
        let mut outcome = Ok(());
        if !children.is_empty() {
            let timeout = self.command_timeout().map_or(grace, |t| t.min(grace));
            self.set_command_timeout(Some(timeout));
            match self.end(&children, 0) {
                Ok(ended) => debug!(count = ended.len(), "Children ended"),
                Err(e) => {
                    warn!(error = %e, "Children did not all acknowledge End");
                    outcome = Err(e);
                }
            }
        }

        for peer in self.nodes() {
            if let Err(e) = self.send_command(&peer, Command::NodeLeave) {
                debug!(peer = %peer, error = %e, "NodeLeave not delivered");
            }
        }

        self.runtime().shutdown(grace);
        match outcome {
            Err(ProcessError::Terminated { .. }) => Ok(()),
            other => other,
        }
    }
}
