//! DistributedTable本体
//!
//! - ローカルストア・世代カウンター・分割関数・リモートアクセス・
//!   読み取りキャッシュ・書き込みバッファ・統計を1つのコンテキストにまとめる
//! - 探索スレッドは `Arc<DistributedTable>` を共有して probe / save する
//!
//! ロック順序: 書き込みバッファ → クリティカルセクション。
//! 読み取りキャッシュのロックはリモート往復の間は持たない。

use crate::config::{TableMode, TtConfig};
use crate::error::{TtError, TtResult};
use crate::partition::{NodeId, Partitioner, ProbeKey, partitioner_for};
use crate::read_cache::ReadCache;
use crate::remote::{CriticalSection, RemoteAccess, RemoteWindow};
use crate::stats::{StatsSnapshot, TableStats};
use crate::tt::{
    CLUSTER_SIZE, Cluster, ClusterStore, GENERATION_DELTA, GENERATION_MASK, TtData, key16_of,
    verify_tag,
};
use crate::types::{Bound, Depth, Move, Value};
use crate::write_buffer::{PendingWrite, WriteBuffer};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

/// hashfull の標本にするクラスター数（約1000エントリ）
pub const HASHFULL_SAMPLE_CLUSTERS: usize = 1000 / CLUSTER_SIZE;

/// 分散置換表
pub struct DistributedTable {
    config: TtConfig,
    store: Arc<ClusterStore>,
    /// 世代カウンター（下位2bitは使用しない）
    generation8: AtomicU8,
    partitioner: Arc<dyn Partitioner>,
    section: Arc<CriticalSection>,
    remote: Option<RemoteAccess>,
    read_cache: Mutex<ReadCache>,
    write_buffer: Mutex<WriteBuffer>,
    stats: TableStats,
}

impl DistributedTable {
    /// リモートウィンドウなしで作成
    ///
    /// 単一ノード、または replicated 構成（全キーがローカル）で使う。
    /// sharded 構成で他ノードが所有するキーを probe すると `TtError::Unreachable`。
    pub fn new(config: TtConfig) -> TtResult<Self> {
        config.validate()?;
        let store = Arc::new(ClusterStore::new(config.hash_mb)?);
        let partitioner = partitioner_for(config.partition);

        log::debug!(
            "[TT Resize] rank {}/{}: {} clusters, mode {:?}, partition {}",
            config.rank,
            config.node_count,
            store.cluster_count(),
            config.mode,
            partitioner.name()
        );

        Ok(Self {
            read_cache: Mutex::new(ReadCache::new(config.read_cache_capacity)),
            write_buffer: Mutex::new(WriteBuffer::new(config.write_buffer_capacity)),
            config,
            store,
            generation8: AtomicU8::new(0),
            partitioner,
            section: Arc::new(CriticalSection::new()),
            remote: None,
            stats: TableStats::new(),
        })
    }

    /// リモートウィンドウ付きで作成
    pub fn with_window(config: TtConfig, window: Arc<dyn RemoteWindow>) -> TtResult<Self> {
        Ok(Self::new(config)?.attach_window(window))
    }

    /// リモートウィンドウを接続する
    ///
    /// ストアを先に公開し、全ノードのアドレスが揃ってからウィンドウを張る場合に使う。
    pub fn attach_window(mut self, window: Arc<dyn RemoteWindow>) -> Self {
        self.remote = Some(RemoteAccess::new(window, Arc::clone(&self.section)));
        self
    }

    /// 分割関数を差し替える
    pub fn with_partitioner(mut self, partitioner: Arc<dyn Partitioner>) -> Self {
        self.partitioner = partitioner;
        self
    }

    /// サイズを変更
    ///
    /// クラスター数が変わらなければ何もしない。変わった場合は全体がゼロに
    /// なるので、読み取りキャッシュと書き込み待ちも捨てる。
    pub fn resize(&self, megabytes: usize) -> TtResult<bool> {
        let changed = self.store.resize(megabytes)?;
        if changed {
            self.write_buffer.lock().discard();
            self.read_cache.lock().clear();
        }
        Ok(changed)
    }

    /// ローカルストアをゼロクリア（世代は保持）
    pub fn clear(&self) {
        self.write_buffer.lock().discard();
        self.read_cache.lock().clear();
        self.store.clear();
    }

    /// 新しい探索を開始（世代を進める）
    pub fn new_search(&self) {
        self.generation8.fetch_add(GENERATION_DELTA, Ordering::Relaxed);
    }

    /// 現在の世代を取得
    #[inline]
    pub fn generation(&self) -> u8 {
        self.generation8.load(Ordering::Relaxed)
    }

    /// `key` を所有するノード
    pub fn owner_of(&self, key: impl Into<ProbeKey>) -> NodeId {
        self.owner(&key.into())
    }

    #[inline]
    fn owner(&self, key: &ProbeKey) -> NodeId {
        match self.config.mode {
            TableMode::Replicated => self.config.rank,
            TableMode::Sharded if self.config.node_count == 1 => self.config.rank,
            TableMode::Sharded => self.partitioner.owner(key, self.config.node_count),
        }
    }

    /// 置換表を検索
    ///
    /// 空エントリか key16 が一致するエントリがあればそのスロット、なければ
    /// 置換価値が最小のスロットを書き込み先として返す。ヒットしたエントリの
    /// 世代が古ければ現在の世代に更新する（Bound は保持）。
    pub fn probe(&self, key: impl Into<ProbeKey>) -> TtResult<ProbeResult> {
        let key = key.into();
        let owner = self.owner(&key);
        let index = self.store.index_of(key.key);
        let generation8 = self.generation();

        if owner == self.config.rank {
            self.stats.record_local_probe();
            let cluster = self.store.load(index);
            let (found, slot) = select_slot(&cluster, key.key, generation8);
            let entry = cluster.entry(slot);
            let data = if found { entry.read() } else { TtData::EMPTY };

            if found && entry.generation() != (generation8 & GENERATION_MASK) {
                let mut refreshed = *entry;
                refreshed.refresh(generation8);
                self.store.store_entry(index, slot, &refreshed);
            }

            return Ok(ProbeResult {
                found,
                data,
                key: key.key,
                target: ProbeTarget::Local { index, slot },
            });
        }

        let mut snapshot = self.fetch_remote(owner, key.key, index)?;
        let (found, slot) = select_slot(&snapshot, key.key, generation8);
        let data = if found { snapshot.entry(slot).read() } else { TtData::EMPTY };

        // リモートの世代更新は手元のコピーにだけ反映し、次の save で所有ノードへ届く
        if found && snapshot.entry(slot).generation() != (generation8 & GENERATION_MASK) {
            snapshot.entry_mut(slot).refresh(generation8);
            self.read_cache.lock().insert(owner, index, snapshot);
        }

        Ok(ProbeResult {
            found,
            data,
            key: key.key,
            target: ProbeTarget::Remote {
                node: owner,
                index,
                slot,
                snapshot,
            },
        })
    }

    /// リモートクラスターを取得（読み取りキャッシュ優先）
    fn fetch_remote(&self, node: NodeId, key: u64, index: usize) -> TtResult<Cluster> {
        if let Some(cluster) = self.read_cache.lock().lookup(node, index) {
            self.stats.record_cache_hit();
            return Ok(cluster);
        }
        self.stats.record_cache_miss();

        let remote = self.remote_access(node)?;

        // 書き込み待ちがあれば先に届ける
        if self.write_buffer.lock().contains(node, index) {
            self.flush()?;
        }

        let cluster = remote.get(node, key)?;
        self.stats.record_remote_get();
        if !verify_tag(index, &cluster, "remote") {
            self.stats.record_integrity_warning();
        }
        self.read_cache.lock().insert(node, index, cluster);
        Ok(cluster)
    }

    fn remote_access(&self, node: NodeId) -> TtResult<&RemoteAccess> {
        self.remote.as_ref().ok_or_else(|| TtError::Unreachable {
            node,
            reason: "no remote window attached".to_string(),
        })
    }

    /// probe で得た書き込み先に保存する
    ///
    /// ローカルならその場で書き込み、リモートなら書き込みバッファに積む。
    #[allow(clippy::too_many_arguments)]
    pub fn save(
        &self,
        handle: &ProbeResult,
        value: Value,
        bound: Bound,
        depth: Depth,
        mv: Move,
        eval: Value,
        generation8: u8,
    ) -> TtResult<()> {
        match handle.target {
            ProbeTarget::Local { index, slot } => {
                let mut entry = *self.store.load(index).entry(slot);
                entry.save(handle.key, value, bound, depth, mv, eval, generation8);
                self.store.store_entry(index, slot, &entry);
                Ok(())
            }
            ProbeTarget::Remote {
                node,
                index,
                slot,
                snapshot,
            } => {
                let cluster = {
                    let mut cache = self.read_cache.lock();
                    let mut cluster = cache.lookup(node, index).unwrap_or(snapshot);
                    cluster
                        .entry_mut(slot)
                        .save(handle.key, value, bound, depth, mv, eval, generation8);
                    cache.insert(node, index, cluster);
                    cluster
                };
                let write = PendingWrite {
                    node,
                    index,
                    cluster,
                };
                let mut buffer = self.write_buffer.lock();
                let pending = buffer.len() + 1;
                let flushed = buffer.enqueue(write, |node, writes| self.apply_remote(node, writes))?;
                if flushed {
                    self.stats.record_flush();
                    log::debug!("[TT Flush] buffer full: flushed {pending} clusters");
                }
                Ok(())
            }
        }
    }

    fn apply_remote(&self, node: NodeId, writes: &[(usize, Cluster)]) -> TtResult<()> {
        self.remote_access(node)?.put_all(node, writes)?;
        self.stats.record_remote_puts(writes.len());
        Ok(())
    }

    /// 書き込みバッファを明示的に吐き出す
    ///
    /// 書き込んだ宛先ノードの数を返す。
    pub fn flush(&self) -> TtResult<usize> {
        let mut buffer = self.write_buffer.lock();
        if buffer.is_empty() {
            return Ok(0);
        }
        let pending = buffer.len();
        let destinations = buffer.flush_with(|node, writes| self.apply_remote(node, writes))?;
        self.stats.record_flush();
        log::debug!("[TT Flush] flushed {pending} clusters to {destinations} nodes");
        Ok(destinations)
    }

    /// 置換表の使用率を1000分率で返す
    ///
    /// 先頭 `HASHFULL_SAMPLE_CLUSTERS` クラスターのうち、現在の世代のエントリの
    /// 割合。標本が全て埋まっていれば 1000。
    pub fn hashfull(&self) -> i32 {
        let generation8 = self.generation() & GENERATION_MASK;
        let sample = HASHFULL_SAMPLE_CLUSTERS.min(self.store.cluster_count());
        let mut count = 0usize;
        self.store.scan_prefix(sample, |cluster| {
            count += cluster
                .entries()
                .iter()
                .filter(|e| !e.is_empty() && e.generation() == generation8)
                .count();
        });
        (count * 1000 / (sample * CLUSTER_SIZE)) as i32
    }

    /// 統計のスナップショット
    pub fn stats(&self) -> StatsSnapshot {
        self.stats
            .snapshot(self.section.acquisitions(), self.store.integrity_failures())
    }

    pub(crate) fn stats_collector(&self) -> &TableStats {
        &self.stats
    }

    /// ローカルストア（ファブリックやサーバーに公開する）
    pub fn store(&self) -> &Arc<ClusterStore> {
        &self.store
    }

    /// リモートアクセスのクリティカルセクション
    pub fn critical_section(&self) -> &Arc<CriticalSection> {
        &self.section
    }

    pub fn config(&self) -> &TtConfig {
        &self.config
    }

    #[inline]
    pub fn cluster_count(&self) -> usize {
        self.store.cluster_count()
    }

    #[inline]
    pub fn rank(&self) -> NodeId {
        self.config.rank
    }

    #[inline]
    pub fn node_count(&self) -> usize {
        self.config.node_count
    }

    #[inline]
    pub fn mode(&self) -> TableMode {
        self.config.mode
    }

    #[inline]
    pub fn merge_batch(&self) -> usize {
        self.config.merge_batch
    }

    /// 書き込み待ちのクラスター数
    pub fn pending_writes(&self) -> usize {
        self.write_buffer.lock().len()
    }

    pub fn partitioner_name(&self) -> &'static str {
        self.partitioner.name()
    }
}

/// クラスター内の書き込み先を選ぶ。`(found, slot)`
fn select_slot(cluster: &Cluster, key: u64, generation8: u8) -> (bool, usize) {
    match cluster.find(key16_of(key)) {
        Some(slot) => (!cluster.entry(slot).is_empty(), slot),
        None => (false, cluster.select_victim(generation8)),
    }
}

/// probe の書き込み先
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeTarget {
    /// このノードのストア
    Local { index: usize, slot: usize },
    /// 他ノードのストア。`snapshot` は probe 時点の手元のコピー
    Remote {
        node: NodeId,
        index: usize,
        slot: usize,
        snapshot: Cluster,
    },
}

/// probe結果
#[derive(Clone, Copy, Debug)]
pub struct ProbeResult {
    /// ヒットしたか
    pub found: bool,
    /// 読み取ったデータ
    pub data: TtData,
    key: u64,
    target: ProbeTarget,
}

impl ProbeResult {
    #[inline]
    pub fn key(&self) -> u64 {
        self.key
    }

    #[inline]
    pub fn target(&self) -> &ProbeTarget {
        &self.target
    }

    #[inline]
    pub fn is_remote(&self) -> bool {
        matches!(self.target, ProbeTarget::Remote { .. })
    }
}
