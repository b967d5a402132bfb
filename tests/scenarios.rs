//! End-to-end scenarios driving a full cluster through the public
//! `ClientNode`/`StorageNode`/`Scheduler` surface, the way a front end would.

use dynamo::{
    client::ClientNode,
    cluster::Cluster,
    config::Config,
    event::{Node, Scheduler},
    message::{Message, NodeId},
    node::StorageNode,
};

fn build_cluster(names: &[&str]) -> Cluster {
    // so a failing scenario's `warn!`/`info!` trail (coordinator forwarding,
    // failure detection, handoff replay) is visible in the test output,
    // the same way the teacher's own binaries call `tracing_subscriber` at
    // startup rather than leaving `tracing`'s output nowhere to go
    let _ = tracing_subscriber::fmt::try_init();
    let nodes = names.iter().map(|n| NodeId::new(*n)).collect();
    Cluster::new(nodes, Config::default()).unwrap()
}

fn build_scheduler(cluster: &Cluster) -> Scheduler {
    let mut scheduler = Scheduler::new(cluster.config().response_timeout);
    for node in cluster.nodes() {
        scheduler.register(Box::new(StorageNode::new(node.clone(), cluster.clone())));
    }
    scheduler
}

const NAMES: [&str; 5] = ["a", "b", "c", "d", "e"];

#[test]
fn s1_happy_put_then_get() {
    let cluster = build_cluster(&NAMES);
    let mut scheduler = build_scheduler(&cluster);

    let dest = cluster.nodes()[0].clone();
    let client_id = NodeId::new("client-put");
    let mut client = ClientNode::new(client_id.clone(), cluster.clone());
    let put_msg = client.put("x".into(), &[], "1".into(), Some(dest.clone()));
    scheduler.register(Box::new(client));
    scheduler.send_message(put_msg).unwrap();
    scheduler.schedule().unwrap();

    let (preferred, _) = cluster.ring().find_nodes("x", cluster.config().n, &[]);
    let client: &ClientNode = scheduler.node(&client_id).unwrap();
    let Some(Message::ClientPutRsp(rsp)) = client.last_reply() else {
        panic!("expected a ClientPutRsp");
    };
    assert_eq!(rsp.from, preferred[0], "coordinator must be preference-list head");
    assert_eq!(rsp.clock.get(&preferred[0]), 1);

    let get_id = NodeId::new("client-get");
    let mut get_client = ClientNode::new(get_id.clone(), cluster.clone());
    let get_msg = get_client.get("x".into(), Some(dest));
    scheduler.register(Box::new(get_client));
    scheduler.send_message(get_msg).unwrap();
    scheduler.schedule().unwrap();

    let get_client: &ClientNode = scheduler.node(&get_id).unwrap();
    let Some(Message::ClientGetRsp(rsp)) = get_client.last_reply() else {
        panic!("expected a ClientGetRsp");
    };
    assert_eq!(rsp.values, vec!["1".to_string()]);
    assert_eq!(rsp.clocks.len(), 1);
    assert_eq!(rsp.clocks[0].get(&preferred[0]), 1);
}

/// S2 (concurrent writes) and S3 (write-through convergence), as a single
/// continuous narrative: any of the N preference-list members can coordinate
/// a PUT it is addressed directly (only a non-member forwards), so two
/// clients addressing two different preference-list members for the same
/// key get two independent coordinators without either observing the
/// other's reply.
#[test]
fn s2_concurrent_writes_then_s3_converge() {
    let cluster = build_cluster(&NAMES);
    let mut scheduler = build_scheduler(&cluster);
    let (preferred, _) = cluster.ring().find_nodes("x", cluster.config().n, &[]);
    assert!(preferred.len() >= 2);

    let client_a_id = NodeId::new("client-a");
    let mut client_a = ClientNode::new(client_a_id.clone(), cluster.clone());
    let put_a = client_a.put("x".into(), &[], "a".into(), Some(preferred[1].clone()));
    scheduler.register(Box::new(client_a));

    let client_b_id = NodeId::new("client-b");
    let mut client_b = ClientNode::new(client_b_id.clone(), cluster.clone());
    let put_b = client_b.put("x".into(), &[], "b".into(), Some(preferred[0].clone()));
    scheduler.register(Box::new(client_b));

    // Both operations are enqueued before either is driven to completion,
    // so neither coordinator's fan-out/quorum collection can observe the
    // other's in-flight state.
    scheduler.send_message(put_a).unwrap();
    scheduler.send_message(put_b).unwrap();
    scheduler.schedule().unwrap();

    let a: &ClientNode = scheduler.node(&client_a_id).unwrap();
    let Some(Message::ClientPutRsp(rsp_a)) = a.last_reply() else {
        panic!("expected a ClientPutRsp for client a");
    };
    let coord_a = rsp_a.from.clone();
    let b: &ClientNode = scheduler.node(&client_b_id).unwrap();
    let Some(Message::ClientPutRsp(rsp_b)) = b.last_reply() else {
        panic!("expected a ClientPutRsp for client b");
    };
    let coord_b = rsp_b.from.clone();
    assert_ne!(coord_a, coord_b, "the two writes must have had distinct coordinators");

    let get_id = NodeId::new("client-get-1");
    let mut get_client = ClientNode::new(get_id.clone(), cluster.clone());
    let get_msg = get_client.get("x".into(), Some(preferred[0].clone()));
    scheduler.register(Box::new(get_client));
    scheduler.send_message(get_msg).unwrap();
    scheduler.schedule().unwrap();

    let get_client: &ClientNode = scheduler.node(&get_id).unwrap();
    let Some(Message::ClientGetRsp(rsp)) = get_client.last_reply() else {
        panic!("expected a ClientGetRsp");
    };
    let mut values = rsp.values.clone();
    values.sort();
    assert_eq!(values, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(rsp.clocks.len(), 2, "concurrent writes must coalesce to two surviving versions");

    // S3: a client that has observed both concurrent versions asserts
    // convergence over them on its next write.
    let converge_id = NodeId::new("client-converge");
    let mut converge_client = ClientNode::new(converge_id.clone(), cluster.clone());
    let put_c = converge_client.put("x".into(), &rsp.clocks, "c".into(), Some(preferred[0].clone()));
    scheduler.register(Box::new(converge_client));
    scheduler.send_message(put_c).unwrap();
    scheduler.schedule().unwrap();

    let get2_id = NodeId::new("client-get-2");
    let mut get2 = ClientNode::new(get2_id.clone(), cluster.clone());
    let get2_msg = get2.get("x".into(), Some(preferred[0].clone()));
    scheduler.register(Box::new(get2));
    scheduler.send_message(get2_msg).unwrap();
    scheduler.schedule().unwrap();

    let get2: &ClientNode = scheduler.node(&get2_id).unwrap();
    let Some(Message::ClientGetRsp(rsp2)) = get2.last_reply() else {
        panic!("expected a ClientGetRsp");
    };
    assert_eq!(rsp2.values, vec!["c".to_string()], "convergent write must collapse to one version");
    assert_eq!(rsp2.clocks.len(), 1);
}

/// S4: a replica already believed down when a PUT is coordinated gets
/// skipped in favor of the next preference-list member, which records a
/// hint; recovery (a successful ping) replays the held value to it.
///
/// The failure is injected directly via `StorageNode::mark_failed` rather
/// than by waiting out a real response timeout: the window during which a
/// node is *recorded* as failed but not yet *dequeued* by the periodic
/// retry probe is by design narrow (the probe eagerly claims the oldest
/// entry the moment it fires), so driving the precondition deterministically
/// is both simpler and more robust than racing the retry timer. `down`
/// itself stays a live, responsive node throughout: only the coordinator's
/// bookkeeping treats it as unreachable, which is enough to steer the PUT's
/// initial fan-out away from it and onto the stand-in with a hint attached.
#[test]
fn s4_failure_triggers_hinted_handoff_and_replay() {
    let cluster = build_cluster(&NAMES);
    let mut scheduler = build_scheduler(&cluster);

    let (top4, _) = cluster.ring().find_nodes("k", 4, &[]);
    assert_eq!(top4.len(), 4, "need a 4th node to stand in for the failed replica");
    let coordinator_id = top4[0].clone();
    let down = top4[2].clone(); // the 3rd replica, about to be marked down

    scheduler
        .with_node(&coordinator_id, |node, ctx| {
            let coordinator: &mut StorageNode = node
                .as_any_mut()
                .downcast_mut()
                .expect("coordinator is a StorageNode");
            coordinator.mark_failed(down.clone(), ctx);
        })
        .expect("coordinator is registered");

    let client_id = NodeId::new("client-handoff");
    let mut client = ClientNode::new(client_id.clone(), cluster.clone());
    let put_msg = client.put("k".into(), &[], "v".into(), Some(coordinator_id.clone()));
    scheduler.register(Box::new(client));
    scheduler.send_message(put_msg).unwrap();
    scheduler.schedule().unwrap();

    let client: &ClientNode = scheduler.node(&client_id).unwrap();
    assert!(
        matches!(client.last_reply(), Some(Message::ClientPutRsp(_))),
        "put must still reach quorum by routing around the node the coordinator believes down"
    );

    // Running the scheduler to quiescence also drains the stand-in's own
    // retry probe against `down`, which (since `down` is actually live)
    // succeeds and replays the held write.
    let replica: &StorageNode = scheduler.node(&down).unwrap();
    let (value, _clock) = replica
        .local_store()
        .get("k")
        .expect("hinted write must have been replayed to the recovered node");
    assert_eq!(value, "v");
}

/// S5: a GET for a key nobody has ever written returns no values and no
/// clocks, rather than erroring or blocking forever.
#[test]
fn s5_get_missing_key_returns_empty() {
    let cluster = build_cluster(&NAMES);
    let mut scheduler = build_scheduler(&cluster);

    let dest = cluster.nodes()[0].clone();
    let client_id = NodeId::new("client-miss");
    let mut client = ClientNode::new(client_id.clone(), cluster.clone());
    let get_msg = client.get("never-written".into(), Some(dest));
    scheduler.register(Box::new(client));
    scheduler.send_message(get_msg).unwrap();
    scheduler.schedule().unwrap();

    let client: &ClientNode = scheduler.node(&client_id).unwrap();
    let Some(Message::ClientGetRsp(rsp)) = client.last_reply() else {
        panic!("expected a ClientGetRsp");
    };
    assert!(rsp.values.is_empty());
    assert!(rsp.clocks.is_empty());
}

/// S6: a `ClientPut` addressed to a node outside the key's preference list
/// is forwarded to, and served by, the preference list's head.
#[test]
fn s6_non_member_forwards_to_coordinator() {
    let cluster = build_cluster(&NAMES);
    let mut scheduler = build_scheduler(&cluster);

    let (preferred, _) = cluster.ring().find_nodes("y", cluster.config().n, &[]);
    let non_member = cluster
        .nodes()
        .iter()
        .find(|n| !preferred.contains(n))
        .cloned()
        .expect("a 5-node cluster with n=3 has non-members to pick from");

    let client_id = NodeId::new("client-forward");
    let mut client = ClientNode::new(client_id.clone(), cluster.clone());
    let put_msg = client.put("y".into(), &[], "v".into(), Some(non_member));
    scheduler.register(Box::new(client));
    scheduler.send_message(put_msg).unwrap();
    scheduler.schedule().unwrap();

    let client: &ClientNode = scheduler.node(&client_id).unwrap();
    let Some(Message::ClientPutRsp(rsp)) = client.last_reply() else {
        panic!("expected a ClientPutRsp");
    };
    assert_eq!(rsp.from, preferred[0], "forwarded put must be served by the coordinator");
}
