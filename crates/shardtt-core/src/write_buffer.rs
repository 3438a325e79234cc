//! リモート書き込みバッファ
//!
//! リモートが所有するエントリへの `save` はすぐには書き込まず、
//! `(宛先ノード, クラスターインデックス, クラスターのスナップショット)` として積む。
//! 容量に達したら宛先ごとにまとめて一括で書き込み、バッファを空にする。
//! 永続化はしない（クラッシュで失われても置換表としては問題ない）。

use crate::error::TtResult;
use crate::partition::NodeId;
use crate::tt::Cluster;
use std::collections::BTreeMap;

/// 書き込み待ちの1件
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingWrite {
    pub node: NodeId,
    pub index: usize,
    pub cluster: Cluster,
}

/// 容量付きの書き込みバッファ
#[derive(Debug)]
pub struct WriteBuffer {
    pending: Vec<PendingWrite>,
    capacity: usize,
}

impl WriteBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: Vec::with_capacity(capacity),
            capacity,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// 同じクラスターへの書き込みが積まれているか
    pub fn contains(&self, node: NodeId, index: usize) -> bool {
        self.pending.iter().any(|w| w.node == node && w.index == index)
    }

    /// 積まれているスナップショット（新しいもの）
    pub fn pending_cluster(&self, node: NodeId, index: usize) -> Option<Cluster> {
        self.pending
            .iter()
            .find(|w| w.node == node && w.index == index)
            .map(|w| w.cluster)
    }

    /// 書き込みを積む
    ///
    /// 同じクラスターへの書き込みが既にあれば新しいスナップショットで置き換える。
    /// 積んだ結果が容量に達したら `apply` で一括書き込みし、バッファを空にする。
    /// 一括書き込みをしたら `true`。
    pub fn enqueue<F>(&mut self, write: PendingWrite, apply: F) -> TtResult<bool>
    where
        F: FnMut(NodeId, &[(usize, Cluster)]) -> TtResult<()>,
    {
        if let Some(existing) = self
            .pending
            .iter_mut()
            .find(|w| w.node == write.node && w.index == write.index)
        {
            existing.cluster = write.cluster;
        } else {
            self.pending.push(write);
        }

        if self.pending.len() >= self.capacity {
            self.flush_with(apply)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// 積まれている書き込みを宛先ごとにまとめて `apply` に渡す
    ///
    /// 宛先1つにつき `apply` は1回だけ呼ばれる。失敗してもバッファは空になり、
    /// 最初のエラーを返す（再試行はしない）。書き込んだ宛先の数を返す。
    pub fn flush_with<F>(&mut self, mut apply: F) -> TtResult<usize>
    where
        F: FnMut(NodeId, &[(usize, Cluster)]) -> TtResult<()>,
    {
        let groups = group_by_node(std::mem::take(&mut self.pending));
        let destinations = groups.len();
        for (node, writes) in &groups {
            apply(*node, writes)?;
        }
        Ok(destinations)
    }

    /// 書き込まずに全て捨てる
    pub fn discard(&mut self) {
        self.pending.clear();
    }
}

/// 宛先ノードごとにまとめる（積んだ順を保つ）
fn group_by_node(pending: Vec<PendingWrite>) -> BTreeMap<NodeId, Vec<(usize, Cluster)>> {
    let mut groups: BTreeMap<NodeId, Vec<(usize, Cluster)>> = BTreeMap::new();
    for write in pending {
        groups.entry(write.node).or_default().push((write.index, write.cluster));
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TtError;

    fn write(node: NodeId, index: usize) -> PendingWrite {
        PendingWrite {
            node,
            index,
            cluster: Cluster::empty_at(index),
        }
    }

    #[test]
    fn test_flush_at_capacity_groups_by_destination() {
        let mut buffer = WriteBuffer::new(4);
        let mut calls: Vec<(NodeId, Vec<usize>)> = Vec::new();
        let mut record = |node: NodeId, writes: &[(usize, Cluster)]| -> TtResult<()> {
            calls.push((node, writes.iter().map(|(i, _)| *i).collect()));
            Ok(())
        };

        assert!(!buffer.enqueue(write(2, 10), &mut record).unwrap());
        assert!(!buffer.enqueue(write(1, 11), &mut record).unwrap());
        assert!(!buffer.enqueue(write(2, 12), &mut record).unwrap());
        assert!(buffer.enqueue(write(1, 13), &mut record).unwrap());
        assert!(buffer.is_empty());

        assert_eq!(calls, vec![(1, vec![11, 13]), (2, vec![10, 12])]);
    }

    #[test]
    fn test_same_cluster_is_coalesced() {
        let mut buffer = WriteBuffer::new(3);
        let never = |_: NodeId, _: &[(usize, Cluster)]| -> TtResult<()> { panic!("flushed too early") };

        buffer.enqueue(write(1, 5), never).unwrap();
        let mut newer = write(1, 5);
        newer.cluster.entry_mut(0).refresh(8);
        buffer.enqueue(newer, never).unwrap();

        assert_eq!(buffer.len(), 1);
        assert!(buffer.contains(1, 5));
        assert!(!buffer.contains(2, 5));
        assert_eq!(buffer.pending_cluster(1, 5), Some(newer.cluster));
    }

    #[test]
    fn test_failed_flush_still_empties_buffer() {
        let mut buffer = WriteBuffer::new(8);
        buffer.enqueue(write(0, 1), |_, _| Ok(())).unwrap();
        buffer.enqueue(write(1, 2), |_, _| Ok(())).unwrap();

        let err = buffer
            .flush_with(|node, _| {
                Err(TtError::Unreachable {
                    node,
                    reason: "down".to_string(),
                })
            })
            .unwrap_err();
        assert!(matches!(err, TtError::Unreachable { node: 0, .. }));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_flush_of_empty_buffer_is_noop() {
        let mut buffer = WriteBuffer::new(2);
        assert_eq!(buffer.flush_with(|_, _| panic!("nothing to write")).unwrap(), 0);
    }
}
