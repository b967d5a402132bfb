use std::collections::HashMap;

use rand::seq::SliceRandom;
use tracing::{debug, warn};

use crate::{
    clock::VectorClock,
    cluster::Cluster,
    event::{Node, Scheduler, TimerReason},
    message::{ClientGet, ClientGetRsp, ClientPut, ClientPutRsp, Key, Message, NodeId, Seqno, Value},
};

/// What a client was waiting on for a given seqno, kept around so a
/// timed-out request can be reissued without re-deriving it from the
/// response that never arrived.
enum PendingOp {
    Put { key: Key, value: Value, clock: VectorClock },
    Get { key: Key },
}

/// Issues client PUT/GET against the cluster and retries the whole
/// operation against a freshly chosen destination on timeout. Unlike
/// `StorageNode`, a client has no replica duties: its only inbound traffic
/// is `ClientPutRsp`/`ClientGetRsp`.
pub struct ClientNode {
    id: NodeId,
    cluster: Cluster,
    seq: Seqno,
    pending: HashMap<Seqno, PendingOp>,
    last_reply: Option<Message>,
}

impl ClientNode {
    pub fn new(id: NodeId, cluster: Cluster) -> Self {
        Self {
            id,
            cluster,
            seq: 0,
            pending: HashMap::new(),
            last_reply: None,
        }
    }

    pub fn last_reply(&self) -> Option<&Message> {
        self.last_reply.as_ref()
    }

    fn next_seqno(&mut self) -> Seqno {
        self.seq += 1;
        self.seq
    }

    /// A uniformly random storage node, excluding `avoid` when given. This
    /// crate has no client-side liveness view (that's the storage nodes'
    /// job), so "live" here just means "some member of the fixed node set".
    fn random_dest(&self, avoid: Option<&NodeId>) -> NodeId {
        let nodes = self.cluster.nodes();
        let candidates: Vec<&NodeId> = match avoid {
            Some(avoid) if nodes.len() > 1 => nodes.iter().filter(|n| *n != avoid).collect(),
            _ => nodes.iter().collect(),
        };
        (*candidates
            .choose(&mut rand::thread_rng())
            .expect("cluster has at least one node"))
        .clone()
    }

    /// Build a `ClientPut` for `key`/`value`. `metadata` is the set of
    /// causally known clocks the caller has observed for this key so far;
    /// an empty slice starts from an empty clock (the spec's singleton
    /// `(null,)` case), otherwise the client asserts convergence over all
    /// of them before replicating. Returns the message for the caller to
    /// hand to `Scheduler::send_message` after registering this node.
    pub fn put(&mut self, key: Key, metadata: &[VectorClock], value: Value, dest: Option<NodeId>) -> Message {
        let clock = if metadata.is_empty() {
            VectorClock::new()
        } else {
            VectorClock::converge(metadata)
        };
        let seqno = self.next_seqno();
        let to = dest.unwrap_or_else(|| self.random_dest(None));
        self.pending.insert(
            seqno,
            PendingOp::Put {
                key: key.clone(),
                value: value.clone(),
                clock: clock.clone(),
            },
        );
        Message::ClientPut(ClientPut {
            from: self.id.clone(),
            to,
            seqno,
            key,
            value,
            clock,
        })
    }

    pub fn get(&mut self, key: Key, dest: Option<NodeId>) -> Message {
        let seqno = self.next_seqno();
        let to = dest.unwrap_or_else(|| self.random_dest(None));
        self.pending.insert(seqno, PendingOp::Get { key: key.clone() });
        Message::ClientGet(ClientGet {
            from: self.id.clone(),
            to,
            seqno,
            key,
        })
    }
}

impl Node for ClientNode {
    fn id(&self) -> &NodeId {
        &self.id
    }

    fn timer_priority(&self) -> i32 {
        // clients have no periodic timers and no fan-out siblings to
        // race against; any value works, this one just documents that
        // clients sit below storage nodes' retry timer in urgency
        25
    }

    fn rcvmsg(&mut self, msg: Message, _ctx: &mut Scheduler) -> anyhow::Result<()> {
        match msg {
            Message::ClientPutRsp(ref rsp) => {
                if self.pending.remove(&rsp.seqno).is_none() {
                    debug!(seqno = rsp.seqno, "superfluous client put response discarded");
                    return Ok(());
                }
                self.last_reply = Some(msg);
                Ok(())
            }
            Message::ClientGetRsp(ref rsp) => {
                if self.pending.remove(&rsp.seqno).is_none() {
                    debug!(seqno = rsp.seqno, "superfluous client get response discarded");
                    return Ok(());
                }
                self.last_reply = Some(msg);
                Ok(())
            }
            other => anyhow::bail!("client {:?} received non-reply message {other:?}", self.id),
        }
    }

    /// Retry: reissue the whole operation against a fresh destination,
    /// using the *original* pre-coordinator-update clock (not whatever the
    /// coordinator may have computed) — the at-least-once semantics relied
    /// on by vector-clock coalescing for idempotence.
    fn rsp_timer_pop(&mut self, req: Message, ctx: &mut Scheduler) -> anyhow::Result<()> {
        let seqno = req.seqno();
        let Some(op) = self.pending.remove(&seqno) else {
            return Ok(());
        };
        let previous_dest = req.to_node().clone();
        warn!(client = %self.id, %previous_dest, seqno, "client request timed out, retrying");
        let dest = self.random_dest(Some(&previous_dest));
        let retry = match op {
            PendingOp::Put { key, value, clock } => self.put(key, &[clock], value, Some(dest)),
            PendingOp::Get { key } => self.get(key, Some(dest)),
        };
        ctx.send_message(retry)
    }

    fn on_timer(&mut self, _reason: TimerReason, _ctx: &mut Scheduler) -> anyhow::Result<()> {
        unreachable!("clients arm no named timers")
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
