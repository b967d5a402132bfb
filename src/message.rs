use std::{fmt, sync::Arc};

use crate::clock::VectorClock;

pub type Seqno = u64;
pub type Key = String;
pub type Value = String;

/// A unique stable node name. Cheap to clone (wraps `Arc<str>`), the way
/// addresses elsewhere in this codebase are cloned freely across handlers.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct NodeId(Arc<str>);

impl NodeId {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::hash::Hash for NodeId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        // delegate to the inner str content rather than the `Arc` pointer,
        // so `DigestHash` over a `NodeId` is reproducible across clones
        self.0.as_bytes().hash(state)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Put,
    Get,
    Ping,
    ClientPut,
    ClientGet,
}

#[derive(Debug, Clone)]
pub struct ClientPut {
    pub from: NodeId,
    pub to: NodeId,
    pub seqno: Seqno,
    pub key: Key,
    pub value: Value,
    pub clock: VectorClock,
}

#[derive(Debug, Clone)]
pub struct ClientPutRsp {
    pub from: NodeId,
    pub to: NodeId,
    pub seqno: Seqno,
    pub clock: VectorClock,
}

#[derive(Debug, Clone)]
pub struct ClientGet {
    pub from: NodeId,
    pub to: NodeId,
    pub seqno: Seqno,
    pub key: Key,
}

#[derive(Debug, Clone)]
pub struct ClientGetRsp {
    pub from: NodeId,
    pub to: NodeId,
    pub seqno: Seqno,
    pub values: Vec<Value>,
    pub clocks: Vec<VectorClock>,
}

#[derive(Debug, Clone)]
pub struct PutReq {
    pub from: NodeId,
    pub to: NodeId,
    pub seqno: Seqno,
    pub key: Key,
    pub value: Value,
    pub clock: VectorClock,
    pub handoff: Option<Vec<NodeId>>,
}

#[derive(Debug, Clone)]
pub struct PutRsp {
    pub from: NodeId,
    pub to: NodeId,
    pub seqno: Seqno,
    pub key: Key,
    pub value: Value,
    pub clock: VectorClock,
}

#[derive(Debug, Clone)]
pub struct GetReq {
    pub from: NodeId,
    pub to: NodeId,
    pub seqno: Seqno,
    pub key: Key,
}

#[derive(Debug, Clone)]
pub struct GetRsp {
    pub from: NodeId,
    pub to: NodeId,
    pub seqno: Seqno,
    pub key: Key,
    pub value: Option<Value>,
    pub clock: Option<VectorClock>,
}

#[derive(Debug, Clone)]
pub struct PingReq {
    pub from: NodeId,
    pub to: NodeId,
    pub seqno: Seqno,
}

#[derive(Debug, Clone)]
pub struct PingRsp {
    pub from: NodeId,
    pub to: NodeId,
    pub seqno: Seqno,
}

#[derive(Debug, Clone, derive_more::From)]
pub enum Message {
    ClientPut(ClientPut),
    ClientPutRsp(ClientPutRsp),
    ClientGet(ClientGet),
    ClientGetRsp(ClientGetRsp),
    PutReq(PutReq),
    PutRsp(PutRsp),
    GetReq(GetReq),
    GetRsp(GetRsp),
    PingReq(PingReq),
    PingRsp(PingRsp),
}

impl Message {
    pub fn from_node(&self) -> &NodeId {
        match self {
            Message::ClientPut(m) => &m.from,
            Message::ClientPutRsp(m) => &m.from,
            Message::ClientGet(m) => &m.from,
            Message::ClientGetRsp(m) => &m.from,
            Message::PutReq(m) => &m.from,
            Message::PutRsp(m) => &m.from,
            Message::GetReq(m) => &m.from,
            Message::GetRsp(m) => &m.from,
            Message::PingReq(m) => &m.from,
            Message::PingRsp(m) => &m.from,
        }
    }

    pub fn to_node(&self) -> &NodeId {
        match self {
            Message::ClientPut(m) => &m.to,
            Message::ClientPutRsp(m) => &m.to,
            Message::ClientGet(m) => &m.to,
            Message::ClientGetRsp(m) => &m.to,
            Message::PutReq(m) => &m.to,
            Message::PutRsp(m) => &m.to,
            Message::GetReq(m) => &m.to,
            Message::GetRsp(m) => &m.to,
            Message::PingReq(m) => &m.to,
            Message::PingRsp(m) => &m.to,
        }
    }

    pub fn seqno(&self) -> Seqno {
        match self {
            Message::ClientPut(m) => m.seqno,
            Message::ClientPutRsp(m) => m.seqno,
            Message::ClientGet(m) => m.seqno,
            Message::ClientGetRsp(m) => m.seqno,
            Message::PutReq(m) => m.seqno,
            Message::PutRsp(m) => m.seqno,
            Message::GetReq(m) => m.seqno,
            Message::GetRsp(m) => m.seqno,
            Message::PingReq(m) => m.seqno,
            Message::PingRsp(m) => m.seqno,
        }
    }

    pub fn key(&self) -> Option<&Key> {
        match self {
            Message::PutReq(m) => Some(&m.key),
            Message::GetReq(m) => Some(&m.key),
            Message::ClientPut(m) => Some(&m.key),
            Message::ClientGet(m) => Some(&m.key),
            _ => None,
        }
    }

    pub fn request_kind(&self) -> Option<RequestKind> {
        match self {
            Message::PutReq(_) => Some(RequestKind::Put),
            Message::GetReq(_) => Some(RequestKind::Get),
            Message::PingReq(_) => Some(RequestKind::Ping),
            Message::ClientPut(_) => Some(RequestKind::ClientPut),
            Message::ClientGet(_) => Some(RequestKind::ClientGet),
            _ => None,
        }
    }

    pub fn response_kind(&self) -> Option<RequestKind> {
        match self {
            Message::PutRsp(_) => Some(RequestKind::Put),
            Message::GetRsp(_) => Some(RequestKind::Get),
            Message::PingRsp(_) => Some(RequestKind::Ping),
            Message::ClientPutRsp(_) => Some(RequestKind::ClientPut),
            Message::ClientGetRsp(_) => Some(RequestKind::ClientGet),
            _ => None,
        }
    }

    pub fn is_request(&self) -> bool {
        self.request_kind().is_some()
    }

    pub fn is_response(&self) -> bool {
        self.response_kind().is_some()
    }

    /// Clone of this message re-addressed to `to`, preserving everything
    /// else including `from`. Used by forwarding and by ring-based retry.
    pub fn with_to(&self, to: NodeId) -> Message {
        let mut clone = self.clone();
        match &mut clone {
            Message::ClientPut(m) => m.to = to,
            Message::ClientPutRsp(m) => m.to = to,
            Message::ClientGet(m) => m.to = to,
            Message::ClientGetRsp(m) => m.to = to,
            Message::PutReq(m) => m.to = to,
            Message::PutRsp(m) => m.to = to,
            Message::GetReq(m) => m.to = to,
            Message::GetRsp(m) => m.to = to,
            Message::PingReq(m) => m.to = to,
            Message::PingRsp(m) => m.to = to,
        }
        clone
    }
}

/// Whether a response-timer's matching key for this request kind includes
/// the destination identity. Internal fan-out requests (`Put`/`Get`/`Ping`)
/// are never re-addressed after being sent, so the destination disambiguates
/// concurrently outstanding siblings under the same seqno. Client-facing
/// requests may be forwarded to a coordinator other than the one first
/// addressed, so their timer must match regardless of destination.
pub fn matches_on_responder(kind: RequestKind) -> bool {
    matches!(kind, RequestKind::Put | RequestKind::Get | RequestKind::Ping)
}
