//! # shardtt-core
//!
//! 複数ノードで1つの置換表を共有するための分散置換表ライブラリ。
//!
//! ## モジュール構成
//!
//! - `types`: 基本型（Value, Move, Bound, Depth）
//! - `tt`: ノードローカルの置換表（エントリ・クラスター・ストア）
//! - `partition`: キーから所有ノードを決める分割関数
//! - `remote`: リモートウィンドウ・クリティカルセクション・集団通信（同一プロセス / TCP）
//! - `read_cache`: リモートクラスターの読み取りキャッシュ
//! - `write_buffer`: リモート書き込みのバッファ
//! - `table`: `DistributedTable`（probe / save / flush / hashfull）
//! - `merge`: replicated 構成の集団マージ
//! - `stats`: 統計
//! - `config`: 設定
//!

// 基本型
pub mod error;
pub mod types;

// ローカル置換表
pub mod tt;

// 分散
pub mod partition;
pub mod read_cache;
pub mod remote;
pub mod write_buffer;

// 本体
pub mod config;
pub mod merge;
pub mod stats;
pub mod table;

pub use config::{PartitionKind, TableMode, TtConfig};
pub use error::{TtError, TtResult};
pub use merge::{CollectiveMerge, MergeOutcome, StopSignal};
pub use partition::{NodeId, Partitioner, ProbeKey};
pub use stats::StatsSnapshot;
pub use table::{DistributedTable, ProbeResult, ProbeTarget};
pub use types::{Bound, Depth, Move, Value};
