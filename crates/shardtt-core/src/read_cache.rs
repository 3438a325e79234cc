//! リモートクラスターの読み取りキャッシュ
//!
//! 最近取得したリモートクラスターを最近使った順に保持する。先頭（スロット0）が
//! 最新で、挿入すると古いものが後ろへずれ、容量を超えると末尾が落ちる。
//! クラスター全体を保持するので、ヒットすればそのクラスター内のどのキーの
//! probe にも答えられる。容量は `cluster_count` と無関係に固定。

use crate::partition::NodeId;
use crate::tt::Cluster;
use std::collections::VecDeque;

#[derive(Clone, Copy, Debug)]
struct CachedCluster {
    node: NodeId,
    index: usize,
    cluster: Cluster,
}

/// リモートクラスターの MRU キャッシュ
#[derive(Debug)]
pub struct ReadCache {
    slots: VecDeque<CachedCluster>,
    capacity: usize,
}

impl ReadCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn position(&self, node: NodeId, index: usize) -> Option<usize> {
        self.slots.iter().position(|c| c.node == node && c.index == index)
    }

    /// キャッシュを引く。ヒットしたクラスターは先頭へ移る
    pub fn lookup(&mut self, node: NodeId, index: usize) -> Option<Cluster> {
        let pos = self.position(node, index)?;
        let hit = self.slots.remove(pos)?;
        self.slots.push_front(hit);
        Some(hit.cluster)
    }

    /// クラスターを先頭に入れる（同じクラスターがあれば置き換える）
    pub fn insert(&mut self, node: NodeId, index: usize, cluster: Cluster) {
        if self.capacity == 0 {
            return;
        }
        if let Some(pos) = self.position(node, index) {
            self.slots.remove(pos);
        }
        self.slots.push_front(CachedCluster {
            node,
            index,
            cluster,
        });
        self.slots.truncate(self.capacity);
    }

    /// 全て捨てる
    pub fn clear(&mut self) {
        self.slots.clear();
    }

    /// キャッシュされているクラスターの `(node, index)` を新しい順に
    pub fn keys(&self) -> impl Iterator<Item = (NodeId, usize)> + '_ {
        self.slots.iter().map(|c| (c.node, c.index))
    }
}
