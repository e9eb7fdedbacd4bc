//! Envelopes, router control messages and process commands
//!
//! Every datagram or TCP frame carries exactly one [`Envelope`]. An envelope
//! without a destination is addressed to the receiving router itself and
//! must carry a [`Control`] payload; everything else carries a [`Command`]
//! for the destination process.

use crate::{ProcessId, Term};
use serde::{Deserialize, Serialize};
use std::fmt;

/// `(source, destination, payload)` as it travels between routers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub src: Option<ProcessId>,
    pub dest: Option<ProcessId>,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(src: Option<ProcessId>, dest: Option<ProcessId>, payload: Payload) -> Self {
        Self { src, dest, payload }
    }

    /// True for router-to-router control traffic.
    pub fn is_control(&self) -> bool {
        self.dest.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Control(Control),
    Command(Command),
}

impl From<Control> for Payload {
    fn from(c: Control) -> Self {
        Payload::Control(c)
    }
}

impl From<Command> for Payload {
    fn from(c: Command) -> Self {
        Payload::Command(c)
    }
}

/// Router control protocol used for bootstrap and membership.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Control {
    /// Discovery request carrying the sender's known named processes.
    Hello { known: Vec<ProcessId> },
    /// Reply to `Hello` identifying the answering node.
    Ack { node: ProcessId, known: Vec<ProcessId> },
    /// Liveness and name propagation.
    Ping { ids: Vec<ProcessId> },
    /// The node is leaving; purge it from membership.
    Bye { node: ProcessId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlKind {
    Hello,
    Ack,
    Ping,
    Bye,
}

impl Control {
    pub fn kind(&self) -> ControlKind {
        match self {
            Control::Hello { .. } => ControlKind::Hello,
            Control::Ack { .. } => ControlKind::Ack,
            Control::Ping { .. } => ControlKind::Ping,
            Control::Bye { .. } => ControlKind::Bye,
        }
    }
}

impl fmt::Display for ControlKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ControlKind::Hello => "HELLO",
            ControlKind::Ack => "ACK",
            ControlKind::Ping => "PING",
            ControlKind::Bye => "BYE",
        })
    }
}

/// Setup instructions forwarded with a spawn request, so children can set
/// themselves up and acknowledge the requester directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetupRequest {
    pub seqno: u64,
    pub args: Vec<Term>,
}

/// Commands exchanged between processes.
///
/// Requests that expect replies carry a sequence number; the matching
/// `*Ack` echoes it so the issuer can correlate the reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// User-level message, stamped with the sender's logical clock.
    Message { clock: Option<u64>, body: Term },
    New {
        seqno: u64,
        pid_type: String,
        count: usize,
        names: Vec<String>,
        setup: Option<SetupRequest>,
    },
    NewAck { seqno: u64, spawned: Vec<ProcessId> },
    Setup { seqno: u64, args: Vec<Term> },
    SetupAck { seqno: u64 },
    Start { seqno: u64 },
    StartAck { seqno: u64 },
    End { seqno: u64, code: i32 },
    EndAck { seqno: u64, code: i32 },
    Resolve { seqno: u64, name: String },
    ResolveAck { seqno: u64, id: Option<ProcessId> },
    NodeJoin { seqno: u64 },
    NodeAck { seqno: u64, nodes: Vec<ProcessId> },
    NodeLeave,
}

/// Closed set of command kinds; doubles as the dispatch table index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(usize)]
pub enum CommandKind {
    Message = 0,
    New,
    NewAck,
    Setup,
    SetupAck,
    Start,
    StartAck,
    End,
    EndAck,
    Resolve,
    ResolveAck,
    NodeJoin,
    NodeAck,
    NodeLeave,
}

impl CommandKind {
    pub const COUNT: usize = 14;

    pub const ALL: [CommandKind; Self::COUNT] = [
        CommandKind::Message,
        CommandKind::New,
        CommandKind::NewAck,
        CommandKind::Setup,
        CommandKind::SetupAck,
        CommandKind::Start,
        CommandKind::StartAck,
        CommandKind::End,
        CommandKind::EndAck,
        CommandKind::Resolve,
        CommandKind::ResolveAck,
        CommandKind::NodeJoin,
        CommandKind::NodeAck,
        CommandKind::NodeLeave,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// The request kind an acknowledgement kind answers.
    pub fn request_of(self) -> Option<CommandKind> {
        match self {
            CommandKind::NewAck => Some(CommandKind::New),
            CommandKind::SetupAck => Some(CommandKind::Setup),
            CommandKind::StartAck => Some(CommandKind::Start),
            CommandKind::EndAck => Some(CommandKind::End),
            CommandKind::ResolveAck => Some(CommandKind::Resolve),
            CommandKind::NodeAck => Some(CommandKind::NodeJoin),
            _ => None,
        }
    }

    pub fn is_ack(self) -> bool {
        self.request_of().is_some()
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Message { .. } => CommandKind::Message,
            Command::New { .. } => CommandKind::New,
            Command::NewAck { .. } => CommandKind::NewAck,
            Command::Setup { .. } => CommandKind::Setup,
            Command::SetupAck { .. } => CommandKind::SetupAck,
            Command::Start { .. } => CommandKind::Start,
            Command::StartAck { .. } => CommandKind::StartAck,
            Command::End { .. } => CommandKind::End,
            Command::EndAck { .. } => CommandKind::EndAck,
            Command::Resolve { .. } => CommandKind::Resolve,
            Command::ResolveAck { .. } => CommandKind::ResolveAck,
            Command::NodeJoin { .. } => CommandKind::NodeJoin,
            Command::NodeAck { .. } => CommandKind::NodeAck,
            Command::NodeLeave => CommandKind::NodeLeave,
        }
    }

    /// For acknowledgements: the answered request kind, its sequence number
    /// and the reply value.
    pub fn ack(&self) -> Option<(CommandKind, u64, Term)> {
        let (seqno, result) = match self {
            Command::NewAck { seqno, spawned } => (
                *seqno,
                Term::list(spawned.iter().cloned().map(Term::Pid)),
            ),
            Command::SetupAck { seqno } | Command::StartAck { seqno } => (*seqno, Term::Nil),
            Command::EndAck { seqno, code } => (*seqno, Term::Int((*code).into())),
            Command::ResolveAck { seqno, id } => (
                *seqno,
                id.clone().map(Term::Pid).unwrap_or(Term::Nil),
            ),
            Command::NodeAck { seqno, nodes } => (
                *seqno,
                Term::list(nodes.iter().cloned().map(Term::Pid)),
            ),
            _ => return None,
        };
        let request = self.kind().request_of()?;
        Some((request, seqno, result))
    }
}
