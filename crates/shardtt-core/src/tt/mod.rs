//! 置換表のローカル部分
//!
//! - `TtEntry`: エントリ（10バイト、16bitキー）
//! - `Cluster`: エントリのグループ（32バイト、キャッシュライン64バイトの約数）
//! - `ClusterArena`: アラインメント保証付きのクラスター配列
//! - `ClusterStore`: ノードローカルの共有ストア（resize / clear / 整合性チェック）
//!
//! クラスターインデックスは64bitキーの下位ビット、クラスター内マッチングは
//! 上位16bitで行う。10バイトエントリ × 3 + 2バイトのタグ = 32バイト/クラスター。
//! メモリ上の表現とワイヤ上の表現は同一のバイト列（`cluster` モジュール参照）。

mod arena;
mod cluster;
mod entry;
mod store;

pub use arena::{ClusterArena, cluster_count_for};
pub use cluster::{CLUSTER_BYTES, Cluster, LAYOUT_VERSION, tag_for_index};
pub use entry::{ENTRY_BYTES, TtData, TtEntry, key16_of};
pub use store::{ClusterStore, verify_tag};

/// クラスターサイズ（エントリ数）
pub const CLUSTER_SIZE: usize = 3;

/// キャッシュラインサイズ。クラスターサイズはこの約数でなければならない
pub const CACHE_LINE_SIZE: usize = 64;

/// Generation関連の定数
///
/// 下位2bitは Bound に使うため、世代は4刻みで進む。
pub const GENERATION_DELTA: u8 = 4;
/// 256（世代の法）+ 3（Bound の2bitを打ち消す）
pub const GENERATION_CYCLE: i32 = 259;
pub const GENERATION_MASK: u8 = 0xFC;

/// 同一局面の再保存で深さ以外のフィールドを上書きする猶予（plies）
pub const DEPTH_SLACK: i32 = 4;
