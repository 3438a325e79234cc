//! 同一プロセス内のリモートウィンドウ
//!
//! N 個のノードのストアを1つのプロセスに置き、ノードをスレッドとして動かす。
//! テストと `simulate` サブコマンドで使う。ノードを切り離すと、そのノードへの
//! アクセスは `TtError::Unreachable` になる。

use super::{Rendezvous, RemoteWindow};
use crate::error::{TtError, TtResult};
use crate::partition::NodeId;
use crate::tt::{Cluster, ClusterStore};
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// 同一プロセス内のノード群
pub struct LocalFabric {
    stores: RwLock<Vec<Option<Arc<ClusterStore>>>>,
    collective: Arc<Rendezvous>,
    /// ウィンドウ操作の回数（get / put / put_batch 1回ずつ）
    calls: AtomicU64,
}

impl LocalFabric {
    pub fn new(node_count: usize, collective_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            stores: RwLock::new(vec![None; node_count]),
            collective: Arc::new(Rendezvous::new(node_count, collective_timeout)),
            calls: AtomicU64::new(0),
        })
    }

    pub fn node_count(&self) -> usize {
        self.stores.read().len()
    }

    /// ノード `node` のストアを接続する
    pub fn attach(&self, node: NodeId, store: Arc<ClusterStore>) {
        self.stores.write()[node] = Some(store);
    }

    /// ノード `node` を切り離す（到達不能にする）
    pub fn detach(&self, node: NodeId) {
        self.stores.write()[node] = None;
    }

    /// このファブリックに対するウィンドウ
    pub fn port(self: &Arc<Self>) -> FabricPort {
        FabricPort {
            fabric: Arc::clone(self),
        }
    }

    /// 全ノードで共有する集団通信
    pub fn collective(&self) -> Arc<Rendezvous> {
        Arc::clone(&self.collective)
    }

    /// これまでのウィンドウ操作の回数
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    fn store(&self, node: NodeId) -> TtResult<Arc<ClusterStore>> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        match self.stores.read().get(node) {
            Some(Some(store)) => Ok(Arc::clone(store)),
            Some(None) => Err(TtError::Unreachable {
                node,
                reason: "node is not attached".to_string(),
            }),
            None => Err(TtError::Unreachable {
                node,
                reason: "no such node".to_string(),
            }),
        }
    }
}

fn check_index(node: NodeId, store: &ClusterStore, index: usize) -> TtResult<()> {
    if store.contains_index(index) {
        Ok(())
    } else {
        Err(TtError::Protocol {
            detail: format!("node {node}: cluster index {index} out of range"),
        })
    }
}

/// `LocalFabric` を通るリモートウィンドウ
#[derive(Clone)]
pub struct FabricPort {
    fabric: Arc<LocalFabric>,
}

impl FabricPort {
    pub fn fabric(&self) -> &Arc<LocalFabric> {
        &self.fabric
    }
}

impl RemoteWindow for FabricPort {
    fn get(&self, node: NodeId, key: u64) -> TtResult<Cluster> {
        let store = self.fabric.store(node)?;
        Ok(store.load(store.index_of(key)))
    }

    fn put(&self, node: NodeId, index: usize, cluster: &Cluster) -> TtResult<()> {
        let store = self.fabric.store(node)?;
        check_index(node, &store, index)?;
        store.store(index, cluster);
        Ok(())
    }

    fn put_batch(&self, node: NodeId, writes: &[(usize, Cluster)]) -> TtResult<()> {
        let store = self.fabric.store(node)?;
        for (index, cluster) in writes {
            check_index(node, &store, *index)?;
            store.store(*index, cluster);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tt::{TtEntry, verify_tag};

    #[test]
    fn test_fabric_get_put() {
        let fabric = LocalFabric::new(2, Duration::from_secs(1));
        let store = Arc::new(ClusterStore::new(1).unwrap());
        fabric.attach(1, Arc::clone(&store));
        let port = fabric.port();

        let key = 0xABCD_0000_0000_0011u64;
        let index = store.index_of(key);
        let mut cluster = port.get(1, key).unwrap();
        assert!(verify_tag(index, &cluster, "test"));
        *cluster.entry_mut(2) = TtEntry::from_parts(0xABCD, 1, 2, 3, 4, 5);
        port.put(1, index, &cluster).unwrap();

        assert_eq!(store.load(index), cluster);
        assert_eq!(fabric.calls(), 2);
    }

    #[test]
    fn test_fabric_unreachable_node() {
        let fabric = LocalFabric::new(2, Duration::from_secs(1));
        let port = fabric.port();
        assert!(matches!(port.get(1, 5), Err(TtError::Unreachable { node: 1, .. })));
        assert!(matches!(port.get(7, 5), Err(TtError::Unreachable { node: 7, .. })));

        fabric.attach(1, Arc::new(ClusterStore::new(1).unwrap()));
        assert!(port.get(1, 5).is_ok());
        fabric.detach(1);
        assert!(matches!(port.put(1, 0, &Cluster::empty_at(0)), Err(TtError::Unreachable { .. })));
    }

    #[test]
    fn test_fabric_rejects_out_of_range_index() {
        let fabric = LocalFabric::new(1, Duration::from_secs(1));
        fabric.attach(0, Arc::new(ClusterStore::new(0).unwrap()));
        let err = fabric.port().put(0, 1, &Cluster::empty_at(1)).unwrap_err();
        assert!(matches!(err, TtError::Protocol { .. }));
    }
}
