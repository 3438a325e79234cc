//! 置換表の設定
//!
//! TOML の例:
//!
//! ```toml
//! hash_mb = 256
//! node_count = 4
//! rank = 1
//! read_cache_capacity = 16
//! write_buffer_capacity = 64
//! mode = "sharded"          # or "replicated"
//! partition = "structural"  # or "position-key"
//! merge_batch = 256
//! collective_timeout_ms = 30000
//! ```

use crate::error::{TtError, TtResult};
use crate::partition::{MAX_INDEX_BITS, NodeId};
use crate::tt::cluster_count_for;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// テーブルの構成
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TableMode {
    /// 各ノードが所有するクラスターだけを保持し、他はリモートアクセスする
    #[default]
    Sharded,
    /// 全ノードが全体のコピーを持ち、定期的に集団マージで突き合わせる
    Replicated,
}

/// 所有ノードを決める分割関数の種類
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionKind {
    /// 局面キーのビットで分割
    #[default]
    PositionKey,
    /// 歩・駒割りの構造キーで分割
    Structural,
}

/// 置換表の設定
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtConfig {
    /// 各ノードの置換表サイズ（MB）
    pub hash_mb: usize,
    /// ノード数
    pub node_count: usize,
    /// このノードの番号
    pub rank: NodeId,
    /// リモートクラスターの読み取りキャッシュ容量
    pub read_cache_capacity: usize,
    /// リモート書き込みバッファの容量
    pub write_buffer_capacity: usize,
    pub mode: TableMode,
    pub partition: PartitionKind,
    /// 集団マージ1回あたりのクラスター数
    pub merge_batch: usize,
    /// 集団通信1ラウンドのタイムアウト（ミリ秒）
    pub collective_timeout_ms: u64,
}

impl Default for TtConfig {
    fn default() -> Self {
        Self {
            hash_mb: 16,
            node_count: 1,
            rank: 0,
            read_cache_capacity: 16,
            write_buffer_capacity: 64,
            mode: TableMode::Sharded,
            partition: PartitionKind::PositionKey,
            merge_batch: 256,
            collective_timeout_ms: 30_000,
        }
    }
}

impl TtConfig {
    /// 単一ノード用の設定
    pub fn single(hash_mb: usize) -> Self {
        Self {
            hash_mb,
            ..Self::default()
        }
    }

    /// TOML 文字列から読み込んで検証する
    pub fn from_toml_str(text: &str) -> TtResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| TtError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// TOML ファイルから読み込んで検証する
    pub fn load(path: impl AsRef<Path>) -> TtResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// 設定値を検証する
    pub fn validate(&self) -> TtResult<()> {
        if self.node_count == 0 {
            return Err(TtError::InvalidConfig("node_count must be at least 1".to_string()));
        }
        if self.rank >= self.node_count {
            return Err(TtError::InvalidConfig(format!(
                "rank {} is out of range for {} nodes",
                self.rank, self.node_count
            )));
        }
        if self.read_cache_capacity == 0 {
            return Err(TtError::InvalidConfig("read_cache_capacity must be at least 1".to_string()));
        }
        if self.write_buffer_capacity == 0 {
            return Err(TtError::InvalidConfig(
                "write_buffer_capacity must be at least 1".to_string(),
            ));
        }
        if self.merge_batch == 0 {
            return Err(TtError::InvalidConfig("merge_batch must be at least 1".to_string()));
        }
        let clusters = cluster_count_for(self.hash_mb);
        if clusters.ilog2() > MAX_INDEX_BITS {
            return Err(TtError::InvalidConfig(format!(
                "hash_mb {} yields {clusters} clusters; at most 2^{MAX_INDEX_BITS} are addressable",
                self.hash_mb
            )));
        }
        Ok(())
    }

    #[inline]
    pub fn collective_timeout(&self) -> Duration {
        Duration::from_millis(self.collective_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = TtConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.mode, TableMode::Sharded);
        assert_eq!(config.collective_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_parse_toml() {
        let config = TtConfig::from_toml_str(
            r#"
            hash_mb = 64
            node_count = 4
            rank = 3
            mode = "replicated"
            partition = "structural"
            "#,
        )
        .unwrap();
        assert_eq!(config.hash_mb, 64);
        assert_eq!(config.rank, 3);
        assert_eq!(config.mode, TableMode::Replicated);
        assert_eq!(config.partition, PartitionKind::Structural);
        // 省略したフィールドは既定値
        assert_eq!(config.write_buffer_capacity, 64);
        assert_eq!(config.merge_batch, 256);
    }

    #[test]
    fn test_reject_invalid_values() {
        let cases = [
            TtConfig { node_count: 0, ..TtConfig::default() },
            TtConfig { node_count: 2, rank: 2, ..TtConfig::default() },
            TtConfig { read_cache_capacity: 0, ..TtConfig::default() },
            TtConfig { write_buffer_capacity: 0, ..TtConfig::default() },
            TtConfig { merge_batch: 0, ..TtConfig::default() },
            // 2^33 クラスター（256GB）
            TtConfig { hash_mb: 256 * 1024, ..TtConfig::default() },
        ];
        for config in cases {
            assert!(matches!(config.validate(), Err(TtError::InvalidConfig(_))), "{config:?}");
        }
    }

    #[test]
    fn test_reject_unknown_mode() {
        assert!(TtConfig::from_toml_str("mode = \"mirrored\"").is_err());
    }
}
