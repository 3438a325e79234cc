//! 置換表のエラー型
//!
//! メモリ確保失敗とリモート通信失敗は探索にとって致命的であり、
//! 呼び出し側（ノードのプロセス）が終了を判断する。

use crate::partition::NodeId;

/// 置換表の操作で発生するエラー
#[derive(thiserror::Error, Debug)]
pub enum TtError {
    /// クラスター配列の確保に失敗
    #[error("Failed to allocate {megabytes}MB for transposition table")]
    Alloc { megabytes: usize },

    /// リモートウィンドウに到達できない
    #[error("Node {node} is unreachable: {reason}")]
    Unreachable { node: NodeId, reason: String },

    /// 応答がワイヤフォーマットに従っていない
    #[error("Malformed reply from node {node}: {detail}")]
    MalformedReply { node: NodeId, detail: String },

    /// 相手ノードがエラーフレームを返した
    #[error("Protocol error: {detail}")]
    Protocol { detail: String },

    /// 集団通信ラウンドがタイムアウトした
    #[error("Collective round {round} timed out")]
    CollectiveTimeout { round: u64 },

    /// 設定値が不正
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O エラー
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// 置換表操作の結果型
pub type TtResult<T> = Result<T, TtError>;
