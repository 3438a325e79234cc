//! クラスターとその固定レイアウト
//!
//! レイアウト（バージョン1、リトルエンディアン、32バイト）:
//!
//! | offset       | 幅 | 内容 |
//! |--------------|----|------|
//! | 10 * i       | 10 | エントリ i（`entry` モジュールのフィールド順） |
//! | 30           | 2  | クラスタータグ（ローカルインデックスの下位16bit） |
//!
//! メモリ上（`ClusterArena`）とワイヤ上（`remote::wire`）の両方でこのバイト列を
//! そのまま使う。フィールド順と幅は設定によって変わらない。

use super::entry::{ENTRY_BYTES, TtEntry};
use super::{CACHE_LINE_SIZE, CLUSTER_SIZE};

/// クラスターのバイト幅
pub const CLUSTER_BYTES: usize = 32;

/// レイアウトのバージョン。ワイヤヘッダに載る
pub const LAYOUT_VERSION: u8 = 1;

const TAG_OFFSET: usize = CLUSTER_SIZE * ENTRY_BYTES;

// クラスターはキャッシュラインを跨がない
const _: () = assert!(CACHE_LINE_SIZE % CLUSTER_BYTES == 0);
const _: () = assert!(TAG_OFFSET + 2 == CLUSTER_BYTES);

/// ローカルインデックスからクラスタータグを求める
#[inline]
pub const fn tag_for_index(index: usize) -> u16 {
    index as u16
}

/// クラスター構造
/// 同じハッシュインデックスに対して複数のエントリを持つ
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Hash)]
pub struct Cluster {
    entries: [TtEntry; CLUSTER_SIZE],
    tag: u16,
}

impl Cluster {
    /// 空のクラスター（タグ0）
    pub const EMPTY: Cluster = Cluster {
        entries: [TtEntry::EMPTY; CLUSTER_SIZE],
        tag: 0,
    };

    /// 指定インデックス用の空クラスター
    #[inline]
    pub const fn empty_at(index: usize) -> Self {
        Self {
            entries: [TtEntry::EMPTY; CLUSTER_SIZE],
            tag: tag_for_index(index),
        }
    }

    #[inline]
    pub const fn from_entries(entries: [TtEntry; CLUSTER_SIZE], tag: u16) -> Self {
        Self { entries, tag }
    }

    #[inline]
    pub fn tag(&self) -> u16 {
        self.tag
    }

    #[inline]
    pub fn entries(&self) -> &[TtEntry; CLUSTER_SIZE] {
        &self.entries
    }

    #[inline]
    pub fn entry(&self, slot: usize) -> &TtEntry {
        &self.entries[slot]
    }

    #[inline]
    pub fn entry_mut(&mut self, slot: usize) -> &mut TtEntry {
        &mut self.entries[slot]
    }

    /// 空でないエントリ数
    pub fn occupied(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_empty()).count()
    }

    /// 空エントリ、または key16 が一致するエントリの位置
    #[inline]
    pub fn find(&self, key16: u16) -> Option<usize> {
        self.entries.iter().position(|e| e.is_empty() || e.key16() == key16)
    }

    /// 置換するエントリを選択（置換価値が最小のもの、同値なら先頭側）
    #[inline]
    pub fn select_victim(&self, generation8: u8) -> usize {
        let mut replace = 0;
        let mut min_value = self.entries[0].replace_value(generation8);

        for (slot, entry) in self.entries.iter().enumerate().skip(1) {
            let value = entry.replace_value(generation8);
            if value < min_value {
                min_value = value;
                replace = slot;
            }
        }
        replace
    }

    /// 固定レイアウトへエンコード
    pub fn to_bytes(&self) -> [u8; CLUSTER_BYTES] {
        let mut bytes = [0u8; CLUSTER_BYTES];
        for (i, entry) in self.entries.iter().enumerate() {
            entry.encode_into(&mut bytes[i * ENTRY_BYTES..(i + 1) * ENTRY_BYTES]);
        }
        bytes[TAG_OFFSET..].copy_from_slice(&self.tag.to_le_bytes());
        bytes
    }

    /// 固定レイアウトからデコード
    pub fn from_bytes(bytes: &[u8; CLUSTER_BYTES]) -> Self {
        let mut entries = [TtEntry::EMPTY; CLUSTER_SIZE];
        for (i, entry) in entries.iter_mut().enumerate() {
            *entry = TtEntry::decode_from(&bytes[i * ENTRY_BYTES..(i + 1) * ENTRY_BYTES]);
        }
        let tag = u16::from_le_bytes([bytes[TAG_OFFSET], bytes[TAG_OFFSET + 1]]);
        Self { entries, tag }
    }

    /// エントリ `slot` が占めるバイト範囲
    #[inline]
    pub(crate) fn entry_range(slot: usize) -> std::ops::Range<usize> {
        slot * ENTRY_BYTES..(slot + 1) * ENTRY_BYTES
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Bound;

    fn entry(key16: u16, gen_bound8: u8, depth8: i8) -> TtEntry {
        TtEntry::from_parts(key16, 0, 0, 0, gen_bound8, depth8)
    }

    #[test]
    fn test_cluster_layout_v1() {
        let cluster = Cluster::from_entries(
            [
                TtEntry::from_parts(0x0102, 0x0304, 0x0506, 0x0708, 0x09, 0x0A),
                TtEntry::from_parts(0x1112, 0x1314, 0x1516, 0x1718, 0x19, 0x1A),
                TtEntry::from_parts(0x2122, 0x2324, 0x2526, 0x2728, 0x29, 0x2A),
            ],
            0x3132,
        );
        let expected: [u8; CLUSTER_BYTES] = [
            0x02, 0x01, 0x04, 0x03, 0x06, 0x05, 0x08, 0x07, 0x09, 0x0A, //
            0x12, 0x11, 0x14, 0x13, 0x16, 0x15, 0x18, 0x17, 0x19, 0x1A, //
            0x22, 0x21, 0x24, 0x23, 0x26, 0x25, 0x28, 0x27, 0x29, 0x2A, //
            0x32, 0x31,
        ];
        assert_eq!(cluster.to_bytes(), expected);
        assert_eq!(Cluster::from_bytes(&expected), cluster);
    }

    #[test]
    fn test_cluster_find_prefers_first_empty_or_match() {
        let mut cluster = Cluster::empty_at(5);
        assert_eq!(cluster.find(0x1111), Some(0));

        *cluster.entry_mut(0) = entry(0x2222, 0, 3);
        *cluster.entry_mut(1) = entry(0x1111, 0, 3);
        assert_eq!(cluster.find(0x1111), Some(1));
        assert_eq!(cluster.find(0x3333), Some(2));

        *cluster.entry_mut(2) = entry(0x4444, 0, 3);
        assert_eq!(cluster.find(0x3333), None);
    }

    #[test]
    fn test_select_victim_matches_formula() {
        let generation8 = 40u8;
        let cases: [[(u8, i8); 3]; 4] = [
            [(40, 10), (36, 12), (20, 30)],
            [(40, 5), (40, 5), (40, 5)],
            [(0, 100), (40, 1), (36, 2)],
            [(40 | Bound::Exact as u8, 9), (32 | Bound::Lower as u8, 17), (28, 30)],
        ];

        for case in cases {
            let cluster = Cluster::from_entries(
                [
                    entry(1, case[0].0, case[0].1),
                    entry(2, case[1].0, case[1].1),
                    entry(3, case[2].0, case[2].1),
                ],
                0,
            );
            let values: Vec<i32> = case
                .iter()
                .map(|&(g, d)| d as i32 - ((259 + generation8 as i32 - g as i32) & 0xFC) * 2)
                .collect();
            let min = *values.iter().min().unwrap();
            let expected = values.iter().position(|&v| v == min).unwrap();
            assert_eq!(cluster.select_victim(generation8), expected, "case {case:?}");
        }
    }

    #[test]
    fn test_generation_wrap_ranking() {
        // 世代252・深さ20 のエントリと、現在世代・深さ5 のエントリ
        let old = entry(1, 252, 20);

        // 252: 同世代なので深い方が価値が高い
        assert_eq!(old.replace_value(252), 20);

        // 0: 一周しても経過は1世代（age 4）として扱われる
        let fresh0 = entry(2, 0, 5);
        assert_eq!(old.relative_age(0), 4);
        assert_eq!(old.replace_value(0), 12);
        assert_eq!(fresh0.replace_value(0), 5);
        let cluster = Cluster::from_entries([old, fresh0, entry(3, 0, 50)], 0);
        assert_eq!(cluster.select_victim(0), 1);

        // 4: 経過2世代（age 8）。素朴な差分なら 4 - 252 で「未来」に見えてしまう
        let fresh4 = entry(2, 4, 5);
        assert_eq!(old.relative_age(4), 8);
        assert_eq!(old.replace_value(4), 4);
        assert_eq!(fresh4.replace_value(4), 5);
        let cluster = Cluster::from_entries([fresh4, old, entry(3, 4, 50)], 0);
        assert_eq!(cluster.select_victim(4), 1);
    }
}
