//! 集団マージ（replicated 構成）
//!
//! 全ノードがテーブル全体のコピーを持ち、固定サイズのバッチごとに
//! all-reduce で突き合わせる。対応するクラスター同士は
//!
//! 1. 2 × C 個のエントリを連結し、空エントリを捨てる
//! 2. 同じ key16 のエントリは順位の高い方だけを残す
//! 3. 置換価値（`TtEntry::replace_value`）の降順に並べ、上位 C 個を残す
//!
//! という規則でマージする。順位は置換価値、同値ならエントリのバイト列で
//! 決まる全順序なので、マージは可換かつ結合的で、リダクションの木の形に
//! よらず同じ結果になる。

use crate::error::{TtError, TtResult};
use crate::remote::Collective;
use crate::table::DistributedTable;
use crate::tt::{CLUSTER_SIZE, Cluster, ENTRY_BYTES, TtEntry};
use smallvec::SmallVec;
use std::cmp::Reverse;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// マージ時の順位キー（大きいほど残る）
#[inline]
fn rank_key(entry: &TtEntry, generation8: u8) -> (i32, [u8; ENTRY_BYTES]) {
    let mut bytes = [0u8; ENTRY_BYTES];
    entry.encode_into(&mut bytes);
    (entry.replace_value(generation8), bytes)
}

/// 2つのクラスターをマージする
///
/// 結果のタグは `a` のもの（対応するクラスター同士なので `b` と同じ）。
pub fn merge_clusters(a: &Cluster, b: &Cluster, generation8: u8) -> Cluster {
    let mut pool: SmallVec<[TtEntry; 2 * CLUSTER_SIZE]> = a
        .entries()
        .iter()
        .chain(b.entries())
        .filter(|e| !e.is_empty())
        .copied()
        .collect();

    // key16 ごとに最上位だけを残す
    pool.sort_unstable_by_key(|e| (e.key16(), Reverse(rank_key(e, generation8))));
    pool.dedup_by_key(|e| e.key16());

    pool.sort_unstable_by_key(|e| Reverse(rank_key(e, generation8)));

    let mut entries = [TtEntry::EMPTY; CLUSTER_SIZE];
    for (slot, entry) in entries.iter_mut().zip(pool) {
        *slot = entry;
    }
    Cluster::from_entries(entries, a.tag())
}

/// rank 順に並んだ各参加者のバッチを要素ごとに畳み込む
pub fn reduce_batches(contributions: &[Vec<Cluster>], generation8: u8) -> TtResult<Vec<Cluster>> {
    let Some((first, rest)) = contributions.split_first() else {
        return Ok(Vec::new());
    };
    let mut merged = first.clone();
    for (rank, batch) in rest.iter().enumerate() {
        if batch.len() != merged.len() {
            return Err(TtError::Protocol {
                detail: format!(
                    "rank {} contributed {} clusters, expected {}",
                    rank + 1,
                    batch.len(),
                    merged.len()
                ),
            });
        }
        for (acc, other) in merged.iter_mut().zip(batch) {
            *acc = merge_clusters(acc, other, generation8);
        }
    }
    Ok(merged)
}

/// 協調的なキャンセルのためのトークン
#[derive(Clone, Debug, Default)]
pub struct StopSignal {
    flag: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// 停止を要求する
    pub fn stop(&self) {
        self.flag.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// 停止要求を取り消す（次のパスを始める前に）
    pub fn reset(&self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// マージパスの結果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    /// 全バッチを処理した
    Completed { batches: usize },
    /// バッチ境界で停止した（`batches` は適用済みのバッチ数）
    Cancelled { batches: usize },
}

/// 集団マージのタスク
///
/// 参加する全ノードが同じ順序でパスを実行しなければならない。ラウンド番号は
/// 各ノードのタスクが独立に数える。
pub struct CollectiveMerge {
    table: Arc<DistributedTable>,
    collective: Arc<dyn Collective>,
    round: AtomicU64,
}

impl CollectiveMerge {
    pub fn new(table: Arc<DistributedTable>, collective: Arc<dyn Collective>) -> Self {
        Self {
            table,
            collective,
            round: AtomicU64::new(0),
        }
    }

    /// これまでに参加したラウンドの数（次のラウンド番号）
    pub fn rounds(&self) -> u64 {
        self.round.load(Ordering::Relaxed)
    }

    /// テーブル全体を1回マージする
    ///
    /// 停止信号はバッチごとに1回だけ参照され、全参加者の停止ビットの論理和で
    /// 判定されるので、全ノードが同じバッチ境界で止まる。
    pub fn merge_pass(&self, stop: &StopSignal) -> TtResult<MergeOutcome> {
        let store = self.table.store();
        let count = store.cluster_count();
        let batch = self.table.merge_batch();
        let batches = count.div_ceil(batch);

        for done in 0..batches {
            let start = done * batch;
            let end = (start + batch).min(count);
            let local = store.read_range(start..end);
            let round = self.round.fetch_add(1, Ordering::Relaxed);

            let reduced = {
                let _cs = self.table.critical_section().enter();
                self.collective.all_reduce(
                    round,
                    self.table.rank(),
                    self.table.generation(),
                    stop.is_stopped(),
                    local,
                )?
            };

            let Some(clusters) = reduced else {
                log::debug!("[TT Merge] cancelled at batch {done}/{batches} (round {round})");
                return Ok(MergeOutcome::Cancelled { batches: done });
            };
            if clusters.len() != end - start {
                return Err(TtError::Protocol {
                    detail: format!(
                        "reduction returned {} clusters for a batch of {}",
                        clusters.len(),
                        end - start
                    ),
                });
            }
            store.write_range(start, &clusters);
            self.table.stats_collector().record_merge_batch();
        }
        Ok(MergeOutcome::Completed { batches })
    }

    /// 停止されるまでマージパスを繰り返す
    ///
    /// 完了したパスの数を返す。
    pub fn run(&self, stop: &StopSignal) -> TtResult<usize> {
        let mut passes = 0;
        loop {
            match self.merge_pass(stop)? {
                MergeOutcome::Completed { batches } => {
                    passes += 1;
                    if self.table.rank() == 0 {
                        log::info!("[TT Merge] pass {passes} completed ({batches} batches)");
                    }
                }
                MergeOutcome::Cancelled { batches } => {
                    if self.table.rank() == 0 {
                        log::info!(
                            "[TT Merge] stopped after {passes} passes ({batches} batches into the next)"
                        );
                    }
                    return Ok(passes);
                }
            }
        }
    }
}
