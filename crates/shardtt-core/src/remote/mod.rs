//! リモートアクセス層
//!
//! - `RemoteWindow`: 他ノードのクラスターストアに対する get / put
//! - `CriticalSection`: 全スレッド・全宛先で共有する唯一のロック
//! - `RemoteAccess`: ウィンドウ操作を必ずクリティカルセクション内で行う窓口
//! - `Collective`: 集団マージの all-reduce
//!
//! 実装は同一プロセス内の `LocalFabric`（テスト・シミュレーション用）と
//! TCP 上の `TcpWindow` / `WindowServer` / `TcpCollective`。
//! リモート往復は再試行しない。

mod fabric;
mod rendezvous;
mod tcp;
pub mod wire;

pub use fabric::{FabricPort, LocalFabric};
pub use rendezvous::Rendezvous;
pub use tcp::{TcpCollective, TcpWindow, WindowServer};

use crate::error::TtResult;
use crate::partition::NodeId;
use crate::tt::Cluster;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// 他ノードのクラスターストアへの窓
///
/// クラスターは常に1単位でコピーされ、フィールド単位の転送はしない。
pub trait RemoteWindow: Send + Sync {
    /// `node` 上で `key` が指すクラスターを読み出す
    ///
    /// インデックスは相手ノードがキーから計算する。呼び出し側は返ってきた
    /// タグを自分の期待インデックスと照合する。
    fn get(&self, node: NodeId, key: u64) -> TtResult<Cluster>;

    /// `node` のクラスター `index` を上書きする
    fn put(&self, node: NodeId, index: usize, cluster: &Cluster) -> TtResult<()>;

    /// 同じ宛先への複数の書き込み
    fn put_batch(&self, node: NodeId, writes: &[(usize, Cluster)]) -> TtResult<()> {
        for (index, cluster) in writes {
            self.put(node, *index, cluster)?;
        }
        Ok(())
    }
}

/// リモートウィンドウ操作を直列化するプロセス全体のクリティカルセクション
///
/// 同じスレッドからの再入を許す。ガードのドロップで必ず解放される。
pub struct CriticalSection {
    lock: ReentrantMutex<()>,
    acquisitions: AtomicU64,
}

impl Default for CriticalSection {
    fn default() -> Self {
        Self::new()
    }
}

/// `CriticalSection::enter` のガード
pub struct CriticalGuard<'a> {
    _guard: ReentrantMutexGuard<'a, ()>,
}

impl CriticalSection {
    pub fn new() -> Self {
        Self {
            lock: ReentrantMutex::new(()),
            acquisitions: AtomicU64::new(0),
        }
    }

    /// クリティカルセクションに入る
    pub fn enter(&self) -> CriticalGuard<'_> {
        let guard = self.lock.lock();
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        CriticalGuard { _guard: guard }
    }

    /// これまでに入った回数（再入も数える）
    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::Relaxed)
    }
}

/// クリティカルセクションを伴うリモートアクセス
#[derive(Clone)]
pub struct RemoteAccess {
    window: Arc<dyn RemoteWindow>,
    section: Arc<CriticalSection>,
}

impl RemoteAccess {
    pub fn new(window: Arc<dyn RemoteWindow>, section: Arc<CriticalSection>) -> Self {
        Self { window, section }
    }

    /// クラスター1つを読み出す
    pub fn get(&self, node: NodeId, key: u64) -> TtResult<Cluster> {
        let _cs = self.section.enter();
        self.window.get(node, key)
    }

    /// クラスター1つを書き込む
    pub fn put(&self, node: NodeId, index: usize, cluster: &Cluster) -> TtResult<()> {
        let _cs = self.section.enter();
        self.window.put(node, index, cluster)
    }

    /// 同じ宛先への書き込みを、クリティカルセクション1回でまとめて適用する
    pub fn put_all(&self, node: NodeId, writes: &[(usize, Cluster)]) -> TtResult<()> {
        let _cs = self.section.enter();
        self.window.put_batch(node, writes)
    }
}

/// 集団マージの all-reduce
///
/// 全参加者が同じ `round` で呼び出し、全員の `batch` をマージした結果を
/// 受け取る。いずれかの参加者が `stop` を立てていれば `None`。
/// マージの順位付けには rank 0 の `generation` を使う。
pub trait Collective: Send + Sync {
    fn all_reduce(
        &self,
        round: u64,
        rank: NodeId,
        generation: u8,
        stop: bool,
        batch: Vec<Cluster>,
    ) -> TtResult<Option<Vec<Cluster>>>;
}
