use shardtt_core::remote::{Collective, LocalFabric, Rendezvous};
use shardtt_core::{
    Bound, CollectiveMerge, DistributedTable, MergeOutcome, Move, StopSignal, TableMode, TtConfig,
    TtError, Value,
};
use std::sync::Arc;
use std::time::Duration;

const NODES: usize = 3;

fn replicated_tables(nodes: usize) -> Vec<Arc<DistributedTable>> {
    (0..nodes)
        .map(|rank| {
            let config = TtConfig {
                hash_mb: 1,
                node_count: nodes,
                rank,
                mode: TableMode::Replicated,
                merge_batch: 4096,
                ..TtConfig::default()
            };
            Arc::new(DistributedTable::new(config).unwrap())
        })
        .collect()
}

fn save(table: &DistributedTable, key: u64, value: i32, depth: i32) {
    let probe = table.probe(key).unwrap();
    assert!(!probe.is_remote());
    table
        .save(&probe, Value::new(value), Bound::Exact, depth, Move::NONE, Value::ZERO, table.generation())
        .unwrap();
}

fn key(rank: usize, i: u64) -> u64 {
    ((rank as u64 + 1) << 56) | (i << 48) | (rank as u64 * 100 + i)
}

/// 全ノードで同時にマージパスを1回実行する
fn merge_all(
    tables: &[Arc<DistributedTable>],
    collective: Arc<dyn Collective>,
    stops: &[StopSignal],
) -> Vec<MergeOutcome> {
    std::thread::scope(|scope| {
        let handles: Vec<_> = tables
            .iter()
            .zip(stops)
            .map(|(table, stop)| {
                let merge = CollectiveMerge::new(Arc::clone(table), Arc::clone(&collective));
                scope.spawn(move || merge.merge_pass(stop).unwrap())
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

#[test]
fn test_replicated_tables_converge_after_merge() {
    let tables = replicated_tables(NODES);
    for (rank, table) in tables.iter().enumerate() {
        for i in 1..=10 {
            save(table, key(rank, i), (rank * 100) as i32 + i as i32, 5);
        }
    }

    let fabric = LocalFabric::new(NODES, Duration::from_secs(10));
    let stops = vec![StopSignal::new(); NODES];
    let outcomes = merge_all(&tables, fabric.collective(), &stops);
    for outcome in outcomes {
        assert_eq!(outcome, MergeOutcome::Completed { batches: 8 });
    }

    let reference = tables[0].store().read_range(0..tables[0].cluster_count());
    for table in &tables[1..] {
        assert_eq!(table.store().read_range(0..table.cluster_count()), reference);
    }
    for table in &tables {
        for rank in 0..NODES {
            for i in 1..=10 {
                let probe = table.probe(key(rank, i)).unwrap();
                assert!(probe.found, "rank {} misses key {i} of rank {rank}", table.rank());
                assert_eq!(probe.data.value.raw(), (rank * 100) as i32 + i as i32);
            }
        }
        assert_eq!(table.stats().merge_batches, 8);
    }
}

#[test]
fn test_merge_keeps_the_most_valuable_entries_per_cluster() {
    let tables = replicated_tables(2);
    // 同じクラスター（インデックス7）に各ノードが2局面ずつ
    let index = 7u64;
    save(&tables[0], (1 << 48) | index, 1, 10);
    save(&tables[0], (2 << 48) | index, 2, 2);
    save(&tables[1], (3 << 48) | index, 3, 8);
    save(&tables[1], (4 << 48) | index, 4, 1);

    let fabric = LocalFabric::new(2, Duration::from_secs(10));
    let stops = vec![StopSignal::new(); 2];
    merge_all(&tables, fabric.collective(), &stops);

    for table in &tables {
        let cluster = table.store().load(index as usize);
        let keys: Vec<u16> = cluster.entries().iter().map(|e| e.key16()).collect();
        assert_eq!(keys, vec![1, 3, 2]);
    }
}

#[test]
fn test_stop_on_any_node_cancels_the_pass_everywhere() {
    let tables = replicated_tables(NODES);
    save(&tables[1], key(1, 1), 11, 3);

    let fabric = LocalFabric::new(NODES, Duration::from_secs(10));
    let stops = vec![StopSignal::new(), StopSignal::new(), StopSignal::new()];
    stops[2].stop();
    let outcomes = merge_all(&tables, fabric.collective(), &stops);
    for outcome in outcomes {
        assert_eq!(outcome, MergeOutcome::Cancelled { batches: 0 });
    }
    // 何も書き換わらない
    assert!(!tables[0].probe(key(1, 1)).unwrap().found);
    assert!(tables[1].probe(key(1, 1)).unwrap().found);
}

#[test]
fn test_run_returns_when_stopped() {
    let tables = replicated_tables(2);
    let fabric = LocalFabric::new(2, Duration::from_secs(10));
    let collective: Arc<dyn Collective> = fabric.collective();
    let stop = StopSignal::new();

    let passes: Vec<usize> = std::thread::scope(|scope| {
        let handles: Vec<_> = tables
            .iter()
            .map(|table| {
                let merge = CollectiveMerge::new(Arc::clone(table), Arc::clone(&collective));
                let stop = stop.clone();
                scope.spawn(move || merge.run(&stop).unwrap())
            })
            .collect();
        std::thread::sleep(Duration::from_millis(50));
        stop.stop();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    // 両ノードは同じバッチ境界で止まる
    assert_eq!(passes[0], passes[1]);
}

#[test]
fn test_missing_participant_times_out() {
    let tables = replicated_tables(2);
    let collective: Arc<dyn Collective> = Arc::new(Rendezvous::new(2, Duration::from_millis(200)));
    let merge = CollectiveMerge::new(Arc::clone(&tables[0]), collective);
    let err = merge.merge_pass(&StopSignal::new()).unwrap_err();
    assert!(matches!(err, TtError::CollectiveTimeout { round: 0 }));
}
