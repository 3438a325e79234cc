use shardtt_core::remote::{Collective, Rendezvous, RemoteWindow, TcpCollective, TcpWindow, WindowServer};
use shardtt_core::{
    Bound, CollectiveMerge, DistributedTable, MergeOutcome, Move, StopSignal, TableMode, TtConfig,
    TtError, Value,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(10);

struct Node {
    table: Arc<DistributedTable>,
    _server: WindowServer,
}

/// ループバック上に2ノードを立てる。rank 0 が集団通信をホストする
fn spawn_pair(mode: TableMode) -> (Vec<Node>, Vec<SocketAddr>, Arc<Rendezvous>) {
    let rendezvous = Arc::new(Rendezvous::new(2, TIMEOUT));
    let mut tables = Vec::new();
    let mut servers = Vec::new();
    for rank in 0..2 {
        let config = TtConfig {
            hash_mb: 1,
            node_count: 2,
            rank,
            mode,
            merge_batch: 8192,
            ..TtConfig::default()
        };
        let table = DistributedTable::new(config).unwrap();
        let collective = (rank == 0).then(|| Arc::clone(&rendezvous));
        let server = WindowServer::spawn("127.0.0.1:0", Arc::clone(table.store()), collective).unwrap();
        tables.push(table);
        servers.push(server);
    }

    let peers: Vec<SocketAddr> = servers.iter().map(WindowServer::local_addr).collect();
    let nodes = tables
        .into_iter()
        .zip(servers)
        .map(|(table, server)| {
            let window: Arc<dyn RemoteWindow> = Arc::new(TcpWindow::new(peers.clone()));
            Node {
                table: Arc::new(table.attach_window(window)),
                _server: server,
            }
        })
        .collect();
    (nodes, peers, rendezvous)
}

#[test]
fn test_remote_save_over_tcp() {
    let (nodes, _peers, _rv) = spawn_pair(TableMode::Sharded);
    let key = (0x5151u64 << 48) | (0xE000 << 32) | 123;
    assert_eq!(nodes[0].table.owner_of(key), 1);

    let probe = nodes[0].table.probe(key).unwrap();
    assert!(probe.is_remote());
    nodes[0]
        .table
        .save(&probe, Value::new(-300), Bound::Upper, 6, Move::from_u16(9), Value::new(5), 0)
        .unwrap();
    assert_eq!(nodes[0].table.flush().unwrap(), 1);

    let at_owner = nodes[1].table.probe(key).unwrap();
    assert!(at_owner.found);
    assert_eq!(at_owner.data.value.raw(), -300);
    assert_eq!(at_owner.data.eval.raw(), 5);
    assert_eq!(at_owner.data.bound, Bound::Upper);

    // 逆方向も同じ接続形態で動く
    let back = (0x0707u64 << 48) | (0x0010 << 32) | 5;
    assert_eq!(nodes[1].table.owner_of(back), 0);
    assert!(!nodes[1].table.probe(back).unwrap().found);
    assert_eq!(nodes[1].table.stats().remote_gets, 1);
}

#[test]
fn test_tcp_window_rejects_out_of_range_index() {
    let (_nodes, peers, _rv) = spawn_pair(TableMode::Sharded);
    let window = TcpWindow::new(peers);
    let cluster = shardtt_core::tt::Cluster::empty_at(0);
    let err = window.put(1, 1 << 20, &cluster).unwrap_err();
    assert!(matches!(err, TtError::Protocol { .. }));
    // エラー応答の後も接続は使える
    assert!(window.get(1, 42).is_ok());
}

#[test]
fn test_stopped_server_is_unreachable() {
    let (mut nodes, _peers, _rv) = spawn_pair(TableMode::Sharded);
    let node1 = nodes.pop().unwrap();
    drop(node1);

    let key = (0x0001u64 << 48) | (0xF000 << 32) | 77;
    let err = nodes[0].table.probe(key).unwrap_err();
    assert!(matches!(err, TtError::Unreachable { node: 1, .. }));
}

#[test]
fn test_collective_merge_over_tcp() {
    let (nodes, peers, rendezvous) = spawn_pair(TableMode::Replicated);
    for (rank, node) in nodes.iter().enumerate() {
        for i in 1..=5u64 {
            let key = ((rank as u64 + 1) << 56) | (i << 48) | (rank as u64 * 10 + i);
            let probe = node.table.probe(key).unwrap();
            node.table
                .save(&probe, Value::new(i as i32), Bound::Exact, 4, Move::NONE, Value::ZERO, 0)
                .unwrap();
        }
    }

    let collectives: [Arc<dyn Collective>; 2] = [rendezvous, Arc::new(TcpCollective::new(peers[0], TIMEOUT))];
    let outcomes: Vec<MergeOutcome> = std::thread::scope(|scope| {
        let handles: Vec<_> = nodes
            .iter()
            .zip(collectives)
            .map(|(node, collective)| {
                let merge = CollectiveMerge::new(Arc::clone(&node.table), collective);
                scope.spawn(move || merge.merge_pass(&StopSignal::new()).unwrap())
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert_eq!(outcomes, vec![MergeOutcome::Completed { batches: 4 }; 2]);

    let count = nodes[0].table.cluster_count();
    assert_eq!(
        nodes[0].table.store().read_range(0..count),
        nodes[1].table.store().read_range(0..count)
    );
    for node in &nodes {
        for rank in 0..2u64 {
            for i in 1..=5u64 {
                let key = ((rank + 1) << 56) | (i << 48) | (rank * 10 + i);
                assert!(node.table.probe(key).unwrap().found);
            }
        }
    }
}
