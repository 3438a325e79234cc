//! ノードローカルのクラスターストア
//!
//! `ClusterArena` を `RwLock` で包み、探索スレッドからは共有参照のまま
//! probe / save でき、`resize` だけが配列を差し替えられるようにする。
//! アクセスのたびにクラスタータグを検証する。
//!
//! クラスターは4ワードに跨るので、クラスター単位の読み書きはインデックスで
//! 分けたストライプロックの中で行う。同じクラスターへの get / put は
//! 送り元のノードがどこであっても所有ノード側で直列化される。

use super::arena::{ClusterArena, cluster_count_for};
use super::cluster::{Cluster, tag_for_index};
use super::entry::TtEntry;
use crate::error::TtResult;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

/// クラスターコピー用ロックの本数（2の冪）
const COPY_STRIPES: usize = 64;

/// タグ不一致をリリースビルドでも panic させるか
const STRICT_INTEGRITY: bool = cfg!(any(debug_assertions, feature = "strict-integrity"));

/// クラスタータグを検証する
///
/// 不一致はストレージか分割関数の破損を意味する。デバッグビルド
/// （または `strict-integrity` フィーチャ）では panic し、それ以外では警告を
/// 出してそのクラスターをそのまま答えとして使う。一致していれば `true`。
pub fn verify_tag(index: usize, cluster: &Cluster, origin: &str) -> bool {
    let expected = tag_for_index(index);
    if cluster.tag() == expected {
        return true;
    }
    log::warn!(
        "[TT Integrity] cluster tag mismatch at index {index} ({origin}): expected {expected:#06x}, found {:#06x}",
        cluster.tag()
    );
    if STRICT_INTEGRITY {
        panic!("[TT Integrity] cluster tag mismatch at index {index} ({origin})");
    }
    false
}

/// ノードローカルのクラスターストア
pub struct ClusterStore {
    arena: RwLock<ClusterArena>,
    /// `index % COPY_STRIPES` ごとのクラスターコピー用ロック
    copy_locks: Box<[Mutex<()>]>,
    /// ローカルアクセスで検出したタグ不一致の回数
    integrity_failures: AtomicU64,
}

impl ClusterStore {
    /// 新しいストアを作成（サイズはMB単位）
    pub fn new(megabytes: usize) -> TtResult<Self> {
        let arena = ClusterArena::allocate(cluster_count_for(megabytes), megabytes)?;
        Ok(Self {
            arena: RwLock::new(arena),
            copy_locks: (0..COPY_STRIPES).map(|_| Mutex::new(())).collect(),
            integrity_failures: AtomicU64::new(0),
        })
    }

    #[inline]
    fn copy_lock(&self, index: usize) -> MutexGuard<'_, ()> {
        self.copy_locks[index & (COPY_STRIPES - 1)].lock()
    }

    /// サイズを変更
    ///
    /// クラスター数が変わらなければ何もせず `false` を返す。変わった場合は
    /// 新しい配列をゼロクリア済みで確保して差し替える。確保に失敗した場合は
    /// 元の配列を残したまま `TtError::Alloc` を返す。
    pub fn resize(&self, megabytes: usize) -> TtResult<bool> {
        let new_count = cluster_count_for(megabytes);
        if new_count == self.cluster_count() {
            return Ok(false);
        }

        let arena = ClusterArena::allocate(new_count, megabytes)?;
        let old_count = std::mem::replace(&mut *self.arena.write(), arena).len();
        log::info!(
            "[TT Resize] {megabytes}MB: {old_count} -> {new_count} clusters ({} bytes each)",
            super::CLUSTER_BYTES
        );
        Ok(true)
    }

    /// 全クラスターをゼロクリアする
    pub fn clear(&self) {
        let arena = self.arena.read();
        // ストライプは常に番号順に取る
        let _copies: Vec<_> = self.copy_locks.iter().map(|lock| lock.lock()).collect();
        arena.clear();
    }

    #[inline]
    pub fn cluster_count(&self) -> usize {
        self.arena.read().len()
    }

    /// キーからローカルのクラスターインデックスを求める
    #[inline]
    pub fn index_of(&self, key: u64) -> usize {
        crate::partition::cluster_index(key, self.cluster_count())
    }

    /// インデックスが範囲内か
    #[inline]
    pub fn contains_index(&self, index: usize) -> bool {
        index < self.cluster_count()
    }

    /// クラスターを読み出し、タグを検証する
    pub fn load(&self, index: usize) -> Cluster {
        let cluster = {
            let arena = self.arena.read();
            let _copy = self.copy_lock(index);
            arena.load(index)
        };
        if !verify_tag(index, &cluster, "local") {
            self.integrity_failures.fetch_add(1, Ordering::Relaxed);
        }
        cluster
    }

    /// クラスター全体を書き込む
    ///
    /// タグは常にインデックスから書き直す。受け取ったクラスターのタグが
    /// 不一致なら整合性警告を出す。
    pub fn store(&self, index: usize, cluster: &Cluster) {
        if !verify_tag(index, cluster, "store") {
            self.integrity_failures.fetch_add(1, Ordering::Relaxed);
        }
        let tagged = Cluster::from_entries(*cluster.entries(), tag_for_index(index));
        let arena = self.arena.read();
        let _copy = self.copy_lock(index);
        arena.store(index, &tagged);
    }

    /// 1エントリだけを書き込む
    #[inline]
    pub fn store_entry(&self, index: usize, slot: usize, entry: &TtEntry) {
        let arena = self.arena.read();
        let _copy = self.copy_lock(index);
        arena.store_entry(index, slot, entry);
    }

    /// `range` のクラスターをまとめて読み出す（マージのバッチ用）
    pub fn read_range(&self, range: Range<usize>) -> Vec<Cluster> {
        let arena = self.arena.read();
        let clusters: Vec<Cluster> = range
            .clone()
            .map(|i| {
                let _copy = self.copy_lock(i);
                arena.load(i)
            })
            .collect();
        drop(arena);
        for (index, cluster) in range.zip(&clusters) {
            if !verify_tag(index, cluster, "batch") {
                self.integrity_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
        clusters
    }

    /// `start` から連続するクラスターをまとめて書き込む（マージのバッチ用）
    pub fn write_range(&self, start: usize, clusters: &[Cluster]) {
        let arena = self.arena.read();
        for (offset, cluster) in clusters.iter().enumerate() {
            let index = start + offset;
            let _copy = self.copy_lock(index);
            arena.store(index, &Cluster::from_entries(*cluster.entries(), tag_for_index(index)));
        }
    }

    /// 先頭 `count` クラスターを走査する（hashfull の標本用）
    pub fn scan_prefix<F: FnMut(&Cluster)>(&self, count: usize, mut f: F) {
        let arena = self.arena.read();
        for index in 0..count.min(arena.len()) {
            f(&arena.load(index));
        }
    }

    /// これまでに検出したタグ不一致の回数
    pub fn integrity_failures(&self) -> u64 {
        self.integrity_failures.load(Ordering::Relaxed)
    }
}
