use std::collections::{HashMap, HashSet, VecDeque};

use tracing::{debug, info, warn};

use crate::{
    cluster::Cluster,
    clock::VectorClock,
    event::{Node, Scheduler, TimerReason},
    message::{
        ClientGet, ClientGetRsp, ClientPut, ClientPutRsp, GetReq, GetRsp, Key, Message, NodeId,
        PingReq, PingRsp, PutReq, PutRsp, RequestKind, Seqno, Value,
    },
};

const NODE_TIMER_PRIORITY: i32 = 20;
const RETRY_TIMER_PRIORITY: i32 = 15;

/// The replicated key-value store node: coordinator for the keys it owns in
/// the preference list, replica for every `PutReq`/`GetReq` it is sent,
/// failure detector and hinted-handoff holder for its peers.
pub struct StorageNode {
    id: NodeId,
    cluster: Cluster,
    seq: Seqno,

    local_store: HashMap<Key, (Value, VectorClock)>,

    pending_put_rsp: HashMap<Seqno, HashSet<NodeId>>,
    pending_put_msg: HashMap<Seqno, ClientPut>,
    pending_get_rsp: HashMap<Seqno, HashMap<NodeId, (Option<Value>, Option<VectorClock>)>>,
    pending_get_msg: HashMap<Seqno, ClientGet>,
    pending_req: HashMap<RequestKind, HashMap<Seqno, Vec<Message>>>,

    /// Believed-down peers; a `VecDeque` rather than a set so duplicate
    /// failure observations are preserved (see `SPEC_FULL.md` REDESIGN
    /// FLAGS) and the periodic probe can pop the oldest one.
    failed_nodes: VecDeque<NodeId>,
    pending_handoffs: HashMap<NodeId, HashSet<Key>>,

    /// Whether a `Retry` timer is currently in flight for this node. The
    /// retry timer only runs while there's something to probe: it is armed
    /// on the first observed failure and stops re-arming itself once
    /// `failed_nodes` drains empty, rather than ticking forever (which
    /// would keep `Scheduler::schedule` from ever reaching quiescence).
    retry_timer_armed: bool,
}

impl StorageNode {
    pub fn new(id: NodeId, cluster: Cluster) -> Self {
        Self {
            id,
            cluster,
            seq: 0,
            local_store: HashMap::new(),
            pending_put_rsp: HashMap::new(),
            pending_put_msg: HashMap::new(),
            pending_get_rsp: HashMap::new(),
            pending_get_msg: HashMap::new(),
            pending_req: HashMap::new(),
            failed_nodes: VecDeque::new(),
            pending_handoffs: HashMap::new(),
            retry_timer_armed: false,
        }
    }

    fn next_seqno(&mut self) -> Seqno {
        self.seq += 1;
        self.seq
    }

    fn failed_list(&self) -> Vec<NodeId> {
        self.failed_nodes.iter().cloned().collect()
    }

    /// Mark `node` failed from this node's point of view, exactly as
    /// `rsp_timer_pop` would. Exposed for deliberate failure injection
    /// (operational tooling and deterministic tests) without needing to
    /// actually wait out a response timeout.
    pub fn mark_failed(&mut self, node: NodeId, ctx: &mut Scheduler) {
        self.note_failure(node, ctx);
    }

    pub fn local_store(&self) -> &HashMap<Key, (Value, VectorClock)> {
        &self.local_store
    }

    fn note_failure(&mut self, node: NodeId, ctx: &mut Scheduler) {
        self.failed_nodes.push_back(node);
        if !self.retry_timer_armed {
            self.retry_timer_armed = true;
            let interval = self.cluster.config().retry_interval;
            ctx.start_timer(self.id.clone(), TimerReason::Retry, RETRY_TIMER_PRIORITY, interval);
        }
    }

    fn handle_client_put(&mut self, msg: ClientPut, ctx: &mut Scheduler) -> anyhow::Result<()> {
        let n = self.cluster.config().n;
        let failed = self.failed_list();
        let (preferred, mut avoided) = self.cluster.ring().find_nodes(&msg.key, n, &failed);
        avoided.truncate(n);
        let non_extra = n.saturating_sub(avoided.len());

        if !preferred.iter().any(|node| *node == self.id) {
            let dest = preferred
                .first()
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("ring produced no preferred node for key"))?;
            debug!(key = %msg.key, %dest, "forwarding client put to coordinator");
            ctx.forward_message(Message::ClientPut(msg), dest)?;
            return Ok(());
        }

        let seqno = self.next_seqno();
        let mut clock = msg.clock.clone();
        clock.update(&self.id, seqno)?;

        self.pending_put_rsp.insert(seqno, HashSet::new());
        self.pending_put_msg.insert(seqno, msg.clone());
        self.pending_req
            .entry(RequestKind::Put)
            .or_default()
            .insert(seqno, Vec::new());

        for (i, node) in preferred.iter().take(n).enumerate() {
            let handoff = (i >= non_extra).then(|| avoided.clone());
            let req = Message::PutReq(PutReq {
                from: self.id.clone(),
                to: node.clone(),
                seqno,
                key: msg.key.clone(),
                value: msg.value.clone(),
                clock: clock.clone(),
                handoff,
            });
            self.pending_req
                .get_mut(&RequestKind::Put)
                .unwrap()
                .get_mut(&seqno)
                .unwrap()
                .push(req.clone());
            ctx.send_message(req)?;
        }
        Ok(())
    }

    fn handle_client_get(&mut self, msg: ClientGet, ctx: &mut Scheduler) -> anyhow::Result<()> {
        let n = self.cluster.config().n;
        let failed = self.failed_list();
        let (preferred, _avoided) = self.cluster.ring().find_nodes(&msg.key, n, &failed);

        if !preferred.iter().any(|node| *node == self.id) {
            let dest = preferred
                .first()
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("ring produced no preferred node for key"))?;
            debug!(key = %msg.key, %dest, "forwarding client get to coordinator");
            ctx.forward_message(Message::ClientGet(msg), dest)?;
            return Ok(());
        }

        let seqno = self.next_seqno();
        self.pending_get_rsp.insert(seqno, HashMap::new());
        self.pending_get_msg.insert(seqno, msg.clone());
        self.pending_req
            .entry(RequestKind::Get)
            .or_default()
            .insert(seqno, Vec::new());

        for node in preferred.iter().take(n) {
            let req = Message::GetReq(GetReq {
                from: self.id.clone(),
                to: node.clone(),
                seqno,
                key: msg.key.clone(),
            });
            self.pending_req
                .get_mut(&RequestKind::Get)
                .unwrap()
                .get_mut(&seqno)
                .unwrap()
                .push(req.clone());
            ctx.send_message(req)?;
        }
        Ok(())
    }

    fn handle_put_req(&mut self, req: PutReq, ctx: &mut Scheduler) -> anyhow::Result<()> {
        self.local_store
            .insert(req.key.clone(), (req.value.clone(), req.clock.clone()));
        if let Some(handoff) = &req.handoff {
            for failed in handoff {
                self.note_failure(failed.clone(), ctx);
                self.pending_handoffs
                    .entry(failed.clone())
                    .or_default()
                    .insert(req.key.clone());
            }
        }
        let rsp = Message::PutRsp(PutRsp {
            from: self.id.clone(),
            to: req.from.clone(),
            seqno: req.seqno,
            key: req.key,
            value: req.value,
            clock: req.clock,
        });
        ctx.send_message(rsp)
    }

    fn handle_get_req(&mut self, req: GetReq, ctx: &mut Scheduler) -> anyhow::Result<()> {
        let (value, clock) = match self.local_store.get(&req.key) {
            Some((v, c)) => (Some(v.clone()), Some(c.clone())),
            None => (None, None),
        };
        let rsp = Message::GetRsp(GetRsp {
            from: self.id.clone(),
            to: req.from.clone(),
            seqno: req.seqno,
            key: req.key,
            value,
            clock,
        });
        ctx.send_message(rsp)
    }

    fn handle_put_rsp(&mut self, rsp: PutRsp, ctx: &mut Scheduler) -> anyhow::Result<()> {
        let Some(set) = self.pending_put_rsp.get_mut(&rsp.seqno) else {
            debug!(seqno = rsp.seqno, "superfluous put response discarded");
            return Ok(());
        };
        set.insert(rsp.from.clone());
        if set.len() >= self.cluster.config().w {
            self.pending_put_rsp.remove(&rsp.seqno);
            self.pending_req
                .get_mut(&RequestKind::Put)
                .map(|m| m.remove(&rsp.seqno));
            let original = self
                .pending_put_msg
                .remove(&rsp.seqno)
                .ok_or_else(|| anyhow::anyhow!("quorum met with no tracked put message"))?;
            let client_rsp = Message::ClientPutRsp(ClientPutRsp {
                from: self.id.clone(),
                to: original.from,
                seqno: original.seqno,
                clock: rsp.clock,
            });
            ctx.send_message(client_rsp)?;
        }
        Ok(())
    }

    fn handle_get_rsp(&mut self, rsp: GetRsp, ctx: &mut Scheduler) -> anyhow::Result<()> {
        let Some(replies) = self.pending_get_rsp.get_mut(&rsp.seqno) else {
            debug!(seqno = rsp.seqno, "superfluous get response discarded");
            return Ok(());
        };
        replies.insert(rsp.from.clone(), (rsp.value, rsp.clock));
        if replies.len() >= self.cluster.config().r {
            let replies = self.pending_get_rsp.remove(&rsp.seqno).unwrap();
            self.pending_req
                .get_mut(&RequestKind::Get)
                .map(|m| m.remove(&rsp.seqno));
            let original = self
                .pending_get_msg
                .remove(&rsp.seqno)
                .ok_or_else(|| anyhow::anyhow!("quorum met with no tracked get message"))?;

            let pairs = replies
                .into_values()
                .filter_map(|(value, clock)| Some((value?, clock?)))
                .collect();
            let coalesced = VectorClock::coalesce(pairs);
            let (values, clocks) = coalesced.into_iter().unzip();

            let client_rsp = Message::ClientGetRsp(ClientGetRsp {
                from: self.id.clone(),
                to: original.from,
                seqno: original.seqno,
                values,
                clocks,
            });
            ctx.send_message(client_rsp)?;
        }
        Ok(())
    }

    fn handle_ping_req(&mut self, req: PingReq, ctx: &mut Scheduler) -> anyhow::Result<()> {
        let rsp = Message::PingRsp(PingRsp {
            from: self.id.clone(),
            to: req.from,
            seqno: req.seqno,
        });
        ctx.send_message(rsp)
    }

    fn handle_ping_rsp(&mut self, rsp: PingRsp, ctx: &mut Scheduler) -> anyhow::Result<()> {
        let recovered = rsp.from.clone();
        info!(node = %recovered, "peer recovered");
        self.failed_nodes.retain(|n| *n != recovered);
        if let Some(keys) = self.pending_handoffs.remove(&recovered) {
            for key in keys {
                if let Some((value, clock)) = self.local_store.get(&key).cloned() {
                    let seqno = self.next_seqno();
                    let req = Message::PutReq(PutReq {
                        from: self.id.clone(),
                        to: recovered.clone(),
                        seqno,
                        key,
                        value,
                        clock,
                        handoff: None,
                    });
                    // fire-and-forget: no client is waiting on this replay,
                    // its eventual `PutRsp` is a harmless superfluous reply
                    ctx.send_message(req)?;
                }
            }
        }
        Ok(())
    }

    fn retry_request(&mut self, req: Message, ctx: &mut Scheduler) -> anyhow::Result<()> {
        let Some(kind) = req.request_kind() else {
            return Ok(());
        };
        // only internal Dynamo requests are retried via the ring; pings and
        // client-facing requests have their own recovery paths
        if !matches!(kind, RequestKind::Put | RequestKind::Get) {
            return Ok(());
        }
        let key = req
            .key()
            .ok_or_else(|| anyhow::anyhow!("put/get request missing key"))?
            .clone();
        let seqno = req.seqno();
        let n = self.cluster.config().n;
        let failed = self.failed_list();
        let (preferred, _avoided) = self.cluster.ring().find_nodes(&key, n, &failed);

        let already_sent: HashSet<NodeId> = self
            .pending_req
            .get(&kind)
            .and_then(|m| m.get(&seqno))
            .into_iter()
            .flatten()
            .map(|m| m.to_node().clone())
            .collect();

        if let Some(node) = preferred.iter().find(|node| !already_sent.contains(*node)) {
            let new_req = req.with_to(node.clone());
            self.pending_req
                .entry(kind)
                .or_default()
                .entry(seqno)
                .or_default()
                .push(new_req.clone());
            ctx.send_message(new_req)?;
        } else {
            warn!(%key, seqno, "no alternate node available to retry request");
        }
        Ok(())
    }
}

impl Node for StorageNode {
    fn id(&self) -> &NodeId {
        &self.id
    }

    fn timer_priority(&self) -> i32 {
        NODE_TIMER_PRIORITY
    }

    fn rcvmsg(&mut self, msg: Message, ctx: &mut Scheduler) -> anyhow::Result<()> {
        match msg {
            Message::ClientPut(m) => self.handle_client_put(m, ctx),
            Message::ClientGet(m) => self.handle_client_get(m, ctx),
            Message::PutReq(m) => self.handle_put_req(m, ctx),
            Message::PutRsp(m) => self.handle_put_rsp(m, ctx),
            Message::GetReq(m) => self.handle_get_req(m, ctx),
            Message::GetRsp(m) => self.handle_get_rsp(m, ctx),
            Message::PingReq(m) => self.handle_ping_req(m, ctx),
            Message::PingRsp(m) => self.handle_ping_rsp(m, ctx),
            Message::ClientPutRsp(_) | Message::ClientGetRsp(_) => {
                anyhow::bail!("storage node {:?} received a client-facing response", self.id)
            }
        }
    }

    fn rsp_timer_pop(&mut self, req: Message, ctx: &mut Scheduler) -> anyhow::Result<()> {
        let to = req.to_node().clone();
        warn!(node = %self.id, peer = %to, "response timed out");
        self.note_failure(to.clone(), ctx);
        let mut escalated = ctx.cancel_timers_to(&self.id, &to);
        escalated.push(req);
        for req in escalated {
            self.retry_request(req, ctx)?;
        }
        Ok(())
    }

    fn on_timer(&mut self, reason: TimerReason, ctx: &mut Scheduler) -> anyhow::Result<()> {
        match reason {
            TimerReason::Retry => {
                if let Some(node) = self.failed_nodes.pop_front() {
                    let seqno = self.next_seqno();
                    ctx.send_message(Message::PingReq(PingReq {
                        from: self.id.clone(),
                        to: node,
                        seqno,
                    }))?;
                }
                if self.failed_nodes.is_empty() {
                    // nothing left to probe; don't re-arm. `note_failure`
                    // restarts the timer the next time a peer is marked down.
                    self.retry_timer_armed = false;
                } else {
                    let interval = self.cluster.config().retry_interval;
                    ctx.start_timer(self.id.clone(), TimerReason::Retry, RETRY_TIMER_PRIORITY, interval);
                }
                Ok(())
            }
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
