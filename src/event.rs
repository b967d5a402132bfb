use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap, VecDeque},
};

use crate::message::{matches_on_responder, Message, NodeId, RequestKind, Seqno};

/// This crate's virtual time unit. Has no relation to wall-clock time: it
/// only orders timer deadlines relative to one another. Messages carry no
/// simulated latency (see `Scheduler::schedule`), so `Tick` only advances
/// when a timer fires.
pub type Tick = u64;

pub type TimerId = u64;

/// Named periodic/ad hoc timers, as opposed to the per-request response
/// timers the scheduler arms automatically. Currently the only named timer
/// in this protocol is the storage node's periodic failed-node probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerReason {
    Retry,
}

/// A participant in the simulation. Every node type (storage node, client)
/// implements this; the scheduler dispatches to it by removing it from its
/// registry for the duration of the call, so handlers can freely call back
/// into the scheduler (`ctx`) without any aliasing conflict.
pub trait Node: std::any::Any {
    fn id(&self) -> &NodeId;

    /// This node's priority for response-timer tie-breaking: lower fires
    /// earlier among timers with equal deadlines.
    fn timer_priority(&self) -> i32;

    fn rcvmsg(&mut self, msg: Message, ctx: &mut Scheduler) -> anyhow::Result<()>;

    /// A response-timer armed by this node for `req` expired with no
    /// matching reply.
    fn rsp_timer_pop(&mut self, req: Message, ctx: &mut Scheduler) -> anyhow::Result<()>;

    fn on_timer(&mut self, reason: TimerReason, ctx: &mut Scheduler) -> anyhow::Result<()>;

    /// Erased self-reference, so a driver holding only `&Scheduler` can look
    /// a concrete node type back up by id (e.g. a client's `last_reply`)
    /// after handing ownership of it to the scheduler's registry.
    fn as_any(&self) -> &dyn std::any::Any;

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;
}

enum TimerPayload {
    Response(Message),
    Named(TimerReason),
}

struct TimerMeta {
    deadline: Tick,
    owner: NodeId,
    payload: TimerPayload,
}

#[derive(PartialEq, Eq)]
struct HeapKey {
    deadline: Tick,
    priority: i32,
    seq: u64,
    id: TimerId,
}

impl PartialOrd for HeapKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline, self.priority, self.seq).cmp(&(other.deadline, other.priority, other.seq))
    }
}

/// The deterministic, single-threaded event scheduler. Owns every node, a
/// FIFO message queue, and a timer min-heap (lazily pruned on pop — a
/// cancelled timer is simply absent from `active_timers` when it surfaces).
///
/// Messages are delivered with zero simulated latency: `schedule` always
/// fully drains the message queue before considering the next timer, and a
/// fired timer's resulting messages are themselves fully drained before the
/// timer after that is allowed to fire. This keeps delivery FIFO per
/// (sender, receiver) pair (a consequence of one global FIFO queue) while
/// timers remain the only source of virtual duration.
pub struct Scheduler {
    nodes: HashMap<NodeId, Box<dyn Node>>,
    queue: VecDeque<Message>,
    active_timers: HashMap<TimerId, TimerMeta>,
    heap: BinaryHeap<Reverse<HeapKey>>,
    now: Tick,
    next_timer_id: TimerId,
    next_timer_seq: u64,
    response_timeout: Tick,
}

impl Scheduler {
    pub fn new(response_timeout: Tick) -> Self {
        Self {
            nodes: HashMap::new(),
            queue: VecDeque::new(),
            active_timers: HashMap::new(),
            heap: BinaryHeap::new(),
            now: 0,
            next_timer_id: 0,
            next_timer_seq: 0,
            response_timeout,
        }
    }

    pub fn register(&mut self, node: Box<dyn Node>) {
        self.nodes.insert(node.id().clone(), node);
    }

    pub fn now(&self) -> Tick {
        self.now
    }

    /// Look up a registered node by id and downcast it to `T`. Used by
    /// drivers (demo binaries, tests) to inspect a client's accumulated
    /// state after `schedule()` has run to quiescence.
    pub fn node<T: 'static>(&self, id: &NodeId) -> Option<&T> {
        self.nodes.get(id)?.as_any().downcast_ref::<T>()
    }

    pub fn node_mut<T: 'static>(&mut self, id: &NodeId) -> Option<&mut T> {
        self.nodes.get_mut(id)?.as_any_mut().downcast_mut::<T>()
    }

    /// Remove the node `id` from the registry for the duration of `f`, so
    /// `f` can hold a mutable reference to it alongside `&mut Scheduler`
    /// without aliasing its own entry — the same dance `deliver` and
    /// `fire_next_timer` use to invoke a handler. Used by drivers that need
    /// to call a concrete node type's own methods (e.g. administrative
    /// failure injection) rather than going through the `Node` trait.
    pub fn with_node<R>(&mut self, id: &NodeId, f: impl FnOnce(&mut dyn Node, &mut Scheduler) -> R) -> Option<R> {
        let mut node = self.nodes.remove(id)?;
        let result = f(node.as_mut(), self);
        self.nodes.insert(id.clone(), node);
        Some(result)
    }

    fn response_key_from_request(req: &Message) -> (NodeId, Option<NodeId>, RequestKind, Seqno) {
        let kind = req.request_kind().expect("request message");
        let responder = matches_on_responder(kind).then(|| req.to_node().clone());
        (req.from_node().clone(), responder, kind, req.seqno())
    }

    fn response_key_from_reply(rsp: &Message) -> (NodeId, Option<NodeId>, RequestKind, Seqno) {
        let kind = rsp.response_kind().expect("response message");
        let responder = matches_on_responder(kind).then(|| rsp.from_node().clone());
        (rsp.to_node().clone(), responder, kind, rsp.seqno())
    }

    /// Enqueue `msg`. Requests get a response-timer armed at the sender;
    /// responses first cancel any matching outstanding response-timer.
    pub fn send_message(&mut self, msg: Message) -> anyhow::Result<()> {
        if msg.is_response() {
            let key = Self::response_key_from_reply(&msg);
            let stale = self.active_timers.iter().find_map(|(&id, meta)| match &meta.payload {
                TimerPayload::Response(req) if Self::response_key_from_request(req) == key => {
                    Some(id)
                }
                _ => None,
            });
            if let Some(id) = stale {
                self.active_timers.remove(&id);
            }
        }
        if msg.is_request() {
            let owner = msg.from_node().clone();
            let priority = self
                .nodes
                .get(&owner)
                .map(|node| node.timer_priority())
                .unwrap_or(i32::MAX);
            let timeout = self.response_timeout;
            self.arm_timer(owner, priority, timeout, TimerPayload::Response(msg.clone()));
        }
        self.queue.push_back(msg);
        Ok(())
    }

    /// Re-address `msg` to `new_dest`, preserving `from_node`, without
    /// arming a new timer: the original request's response-timer (armed
    /// when it was first sent) remains valid because client-facing
    /// requests match on `(requester, kind, seqno)` regardless of
    /// destination.
    pub fn forward_message(&mut self, msg: Message, new_dest: NodeId) -> anyhow::Result<()> {
        self.queue.push_back(msg.with_to(new_dest));
        Ok(())
    }

    /// Cancel every response-timer armed by `owner` targeting `to`, and
    /// return the originating requests.
    pub fn cancel_timers_to(&mut self, owner: &NodeId, to: &NodeId) -> Vec<Message> {
        let matching: Vec<TimerId> = self
            .active_timers
            .iter()
            .filter(|(_, meta)| {
                &meta.owner == owner
                    && matches!(&meta.payload, TimerPayload::Response(req) if req.to_node() == to)
            })
            .map(|(&id, _)| id)
            .collect();
        matching
            .into_iter()
            .filter_map(|id| self.active_timers.remove(&id))
            .filter_map(|meta| match meta.payload {
                TimerPayload::Response(req) => Some(req),
                TimerPayload::Named(_) => None,
            })
            .collect()
    }

    pub fn start_timer(
        &mut self,
        owner: NodeId,
        reason: TimerReason,
        priority: i32,
        delay: Tick,
    ) -> TimerId {
        self.arm_timer(owner, priority, delay, TimerPayload::Named(reason))
    }

    pub fn cancel_timer(&mut self, id: TimerId) {
        self.active_timers.remove(&id);
    }

    fn arm_timer(
        &mut self,
        owner: NodeId,
        priority: i32,
        delay: Tick,
        payload: TimerPayload,
    ) -> TimerId {
        let id = self.next_timer_id;
        self.next_timer_id += 1;
        let seq = self.next_timer_seq;
        self.next_timer_seq += 1;
        let deadline = self.now + delay;
        self.heap.push(Reverse(HeapKey {
            deadline,
            priority,
            seq,
            id,
        }));
        self.active_timers.insert(
            id,
            TimerMeta {
                deadline,
                owner,
                payload,
            },
        );
        id
    }

    fn deliver(&mut self, msg: Message) -> anyhow::Result<()> {
        let to = msg.to_node().clone();
        let Some(mut node) = self.nodes.remove(&to) else {
            anyhow::bail!("message addressed to unregistered node {to:?}")
        };
        let result = node.rcvmsg(msg, self);
        self.nodes.insert(to, node);
        result
    }

    fn fire_next_timer(&mut self) -> anyhow::Result<bool> {
        loop {
            let Some(Reverse(key)) = self.heap.pop() else {
                return Ok(false);
            };
            let Some(meta) = self.active_timers.remove(&key.id) else {
                continue; // cancelled; lazily dropped
            };
            self.now = self.now.max(meta.deadline);
            let Some(mut node) = self.nodes.remove(&meta.owner) else {
                anyhow::bail!("timer owned by unregistered node {:?}", meta.owner)
            };
            let result = match meta.payload {
                TimerPayload::Response(req) => node.rsp_timer_pop(req, self),
                TimerPayload::Named(reason) => node.on_timer(reason, self),
            };
            self.nodes.insert(meta.owner, node);
            result?;
            return Ok(true);
        }
    }

    /// Drain the message queue and timer heap until both are empty.
    pub fn schedule(&mut self) -> anyhow::Result<()> {
        loop {
            if let Some(msg) = self.queue.pop_front() {
                self.deliver(msg)?;
                continue;
            }
            if self.fire_next_timer()? {
                continue;
            }
            return Ok(());
        }
    }
}
