//! 分割関数（キー → 所有ノード、クラスターインデックス）
//!
//! 64bitキーのビットは次のように使い分ける:
//!
//! | bits    | 用途 |
//! |---------|------|
//! | 0..32   | クラスターインデックス（`key & (cluster_count - 1)`、最大 2^32 クラスター） |
//! | 32..48  | 所有ノード（`PositionKeyPartitioner`） |
//! | 48..64  | クラスター内照合用の key16 |
//!
//! 所有ノードとノード内の配置が相関しないよう、互いに素なビットを読む。
//! 構造キー（歩・駒割りなど不可逆な手でしか変わらないキー）で分割する
//! `StructuralPartitioner` も選べる。

use crate::config::PartitionKind;
use std::fmt::Debug;
use std::sync::Arc;

/// ノード番号（rank）
pub type NodeId = usize;

/// 所有ノードの計算に使うビット位置
pub const OWNER_SHIFT: u32 = 32;

/// インデックスに使えるビット数の上限（所有ビットと重ならないこと）
pub const MAX_INDEX_BITS: u32 = OWNER_SHIFT;

/// probe に渡すキー
///
/// `key` は局面の64bitハッシュ。`pawn_key` / `material_key` は構造キーで、
/// 構造キーで分割する場合にだけ使われる（0 は「未指定」）。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ProbeKey {
    pub key: u64,
    pub pawn_key: u64,
    pub material_key: u64,
}

impl ProbeKey {
    #[inline]
    pub const fn new(key: u64) -> Self {
        Self {
            key,
            pawn_key: 0,
            material_key: 0,
        }
    }

    /// 構造キー付きで作成
    #[inline]
    pub const fn with_structure(key: u64, pawn_key: u64, material_key: u64) -> Self {
        Self {
            key,
            pawn_key,
            material_key,
        }
    }
}

impl From<u64> for ProbeKey {
    #[inline]
    fn from(key: u64) -> Self {
        Self::new(key)
    }
}

/// キーからローカルのクラスターインデックスを求める
#[inline]
pub fn cluster_index(key: u64, cluster_count: usize) -> usize {
    debug_assert!(cluster_count.is_power_of_two());
    (key & (cluster_count as u64 - 1)) as usize
}

/// 16bitの値を [0, node_count) に一様に写す
#[inline]
fn scale16(bits: u64, node_count: usize) -> NodeId {
    (((bits & 0xFFFF) * node_count as u64) >> 16) as NodeId
}

/// 所有ノードを決める戦略
///
/// 実装は純関数でなければならない（同じ入力に対して常に同じノード）。
pub trait Partitioner: Send + Sync + Debug {
    /// `key` を所有するノード（`0..node_count`）
    fn owner(&self, key: &ProbeKey, node_count: usize) -> NodeId;

    /// ログ表示用の名前
    fn name(&self) -> &'static str;
}

/// 局面キーの bits 32..48 で分割する
#[derive(Clone, Copy, Debug, Default)]
pub struct PositionKeyPartitioner;

impl Partitioner for PositionKeyPartitioner {
    #[inline]
    fn owner(&self, key: &ProbeKey, node_count: usize) -> NodeId {
        scale16(key.key >> OWNER_SHIFT, node_count)
    }

    fn name(&self) -> &'static str {
        "position-key"
    }
}

/// 構造キー（歩・駒割り）で分割する
///
/// 構造キーは不可逆な手でしか変わらないため、探索の枝が長い間同じノードに
/// 留まる。構造キーが両方 0 のときは局面キーで分割する。
#[derive(Clone, Copy, Debug, Default)]
pub struct StructuralPartitioner;

impl StructuralPartitioner {
    /// 64bit の乗算ハッシュ（フィボナッチハッシュ）
    const MIX: u64 = 0x9E37_79B9_7F4A_7C15;
}

impl Partitioner for StructuralPartitioner {
    #[inline]
    fn owner(&self, key: &ProbeKey, node_count: usize) -> NodeId {
        if key.pawn_key == 0 && key.material_key == 0 {
            return PositionKeyPartitioner.owner(key, node_count);
        }
        let mixed = (key.pawn_key ^ key.material_key.rotate_left(29)).wrapping_mul(Self::MIX);
        scale16(mixed >> 48, node_count)
    }

    fn name(&self) -> &'static str {
        "structural"
    }
}

/// 設定に対応する分割関数
pub fn partitioner_for(kind: PartitionKind) -> Arc<dyn Partitioner> {
    match kind {
        PartitionKind::PositionKey => Arc::new(PositionKeyPartitioner),
        PartitionKind::Structural => Arc::new(StructuralPartitioner),
    }
}
