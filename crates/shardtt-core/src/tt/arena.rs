//! クラスター配列（アリーナ）
//!
//! アラインメント契約:
//! - 各クラスターは `AtomicCluster`（32バイト、`align(32)`）として連続配置される
//! - 32 は 64（キャッシュライン）の約数なので、どのクラスターもキャッシュラインを跨がない
//! - アクセスはすべてインデックス経由。生ポインタ演算は行わない
//!
//! 各クラスターは4つの `AtomicU64` ワードに固定レイアウトのバイト列を保持する。
//! アリーナ自身は排他を取らない（クラスター単位の直列化は `ClusterStore` の役割）。
//! エントリ単位の書き込みはそのエントリのバイトだけを CAS でマージする
//! （隣接エントリの同時書き込みを潰さない）。

use super::cluster::{CLUSTER_BYTES, Cluster};
use super::entry::{ENTRY_BYTES, TtEntry};
use crate::error::{TtError, TtResult};
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

const WORDS: usize = CLUSTER_BYTES / 8;

/// 1クラスター分のアトミックなワード列
#[repr(C, align(32))]
pub(crate) struct AtomicCluster {
    words: [AtomicU64; WORDS],
}

// クラスターは32バイトであることを保証（キャッシュライン64バイトの約数）
const _: () = assert!(std::mem::size_of::<AtomicCluster>() == CLUSTER_BYTES);
const _: () = assert!(std::mem::align_of::<AtomicCluster>() == CLUSTER_BYTES);

impl AtomicCluster {
    fn new(cluster: &Cluster) -> Self {
        let words = to_words(&cluster.to_bytes());
        Self {
            words: [
                AtomicU64::new(words[0]),
                AtomicU64::new(words[1]),
                AtomicU64::new(words[2]),
                AtomicU64::new(words[3]),
            ],
        }
    }

    #[inline]
    fn load(&self) -> Cluster {
        let mut bytes = [0u8; CLUSTER_BYTES];
        for (i, word) in self.words.iter().enumerate() {
            bytes[i * 8..(i + 1) * 8].copy_from_slice(&word.load(Ordering::Acquire).to_le_bytes());
        }
        Cluster::from_bytes(&bytes)
    }

    #[inline]
    fn store(&self, cluster: &Cluster) {
        for (word, value) in self.words.iter().zip(to_words(&cluster.to_bytes())) {
            word.store(value, Ordering::Release);
        }
    }

    /// `bytes` のうち `range` に含まれるバイトだけを書き込む
    fn store_range(&self, bytes: &[u8; CLUSTER_BYTES], range: Range<usize>) {
        let values = to_words(bytes);
        for (i, word) in self.words.iter().enumerate() {
            let mask = byte_mask(i, &range);
            if mask == 0 {
                continue;
            }
            let ours = values[i] & mask;
            // 失敗しない（クロージャが常に Some を返す）
            let _ = word.fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                Some((cur & !mask) | ours)
            });
        }
    }
}

#[inline]
fn to_words(bytes: &[u8; CLUSTER_BYTES]) -> [u64; WORDS] {
    let mut words = [0u64; WORDS];
    for (i, w) in words.iter_mut().enumerate() {
        let mut chunk = [0u8; 8];
        chunk.copy_from_slice(&bytes[i * 8..(i + 1) * 8]);
        *w = u64::from_le_bytes(chunk);
    }
    words
}

/// ワード `word` のうち、バイト範囲 `range` に重なる部分のマスク
#[inline]
fn byte_mask(word: usize, range: &Range<usize>) -> u64 {
    let start = word * 8;
    let mut mask = 0u64;
    for b in 0..8 {
        if range.contains(&(start + b)) {
            mask |= 0xFF << (b * 8);
        }
    }
    mask
}

/// 要求サイズ（MB）から2の冪に切り下げたクラスター数を求める
///
/// 1クラスターに満たないサイズは1クラスターに丸める。
pub fn cluster_count_for(megabytes: usize) -> usize {
    let clusters = megabytes.saturating_mul(1024 * 1024) / CLUSTER_BYTES;
    if clusters == 0 { 1 } else { 1usize << clusters.ilog2() }
}

/// キャッシュラインに整列したクラスター配列
pub struct ClusterArena {
    clusters: Vec<AtomicCluster>,
}

impl ClusterArena {
    /// `count` 個のクラスターを確保し、ゼロクリアしてタグを書き込む
    ///
    /// `megabytes` はエラー報告用の要求サイズ。
    pub fn allocate(count: usize, megabytes: usize) -> TtResult<Self> {
        let mut clusters = Vec::new();
        clusters.try_reserve_exact(count).map_err(|_| TtError::Alloc { megabytes })?;
        clusters.extend((0..count).map(|i| AtomicCluster::new(&Cluster::empty_at(i))));
        Ok(Self { clusters })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    #[inline]
    pub fn load(&self, index: usize) -> Cluster {
        self.clusters[index].load()
    }

    /// クラスター全体を書き込む
    #[inline]
    pub fn store(&self, index: usize, cluster: &Cluster) {
        self.clusters[index].store(cluster);
    }

    /// 1エントリだけを書き込む（同じクラスターの他のエントリとタグには触れない）
    pub fn store_entry(&self, index: usize, slot: usize, entry: &TtEntry) {
        let mut bytes = [0u8; CLUSTER_BYTES];
        let range = Cluster::entry_range(slot);
        debug_assert_eq!(range.len(), ENTRY_BYTES);
        entry.encode_into(&mut bytes[range.clone()]);
        self.clusters[index].store_range(&bytes, range);
    }

    /// 全クラスターをゼロクリアしてタグを書き直す
    pub fn clear(&self) {
        for (i, cluster) in self.clusters.iter().enumerate() {
            cluster.store(&Cluster::empty_at(i));
        }
    }

    #[cfg(test)]
    pub(crate) fn tag_ok(&self, index: usize) -> bool {
        self.load(index).tag() == super::cluster::tag_for_index(index)
    }
}
