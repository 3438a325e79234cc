//! ノードプロセスの設定
//!
//! TOML ファイルの最上位に置換表の設定（`TtConfig`）、`[node]` に通信先、
//! `[workload]` に合成探索の負荷を書く。
//!
//! ```toml
//! hash_mb = 64
//! node_count = 2
//! rank = 0
//! mode = "sharded"
//!
//! [node]
//! listen = "0.0.0.0:7100"
//! peers = ["10.0.0.1:7100", "10.0.0.2:7100"]
//!
//! [workload]
//! threads = 4
//! iterations = 8
//! ```

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use shardtt_core::TtConfig;
use std::net::SocketAddr;
use std::path::Path;

/// `[node]`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// 待ち受けアドレス（省略時は `peers[rank]`）
    pub listen: Option<SocketAddr>,
    /// rank 順の全ノードのアドレス
    pub peers: Vec<SocketAddr>,
}

/// `[workload]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// 探索スレッド数
    pub threads: usize,
    /// 反復（1反復ごとに世代を進め、最後に書き込みバッファを吐き出す）
    pub iterations: usize,
    /// 1スレッド・1反復あたりの probe 数
    pub probes_per_iteration: usize,
    pub seed: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            iterations: 8,
            probes_per_iteration: 20_000,
            seed: 0x5EED_7AB1_E000_0001,
        }
    }
}

/// ノードプロセスの設定全体
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    #[serde(flatten)]
    pub table: TtConfig,
    pub node: NodeSection,
    pub workload: WorkloadConfig,
}

/// コマンドラインからの上書き
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub rank: Option<usize>,
    pub hash_mb: Option<usize>,
    pub threads: Option<usize>,
    pub nodes: Option<usize>,
}

impl NodeConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).context("failed to parse node configuration")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("in {}", path.display()))
    }

    /// コマンドラインの値で上書きする
    pub fn apply(&mut self, overrides: &Overrides) {
        if let Some(rank) = overrides.rank {
            self.table.rank = rank;
        }
        if let Some(hash_mb) = overrides.hash_mb {
            self.table.hash_mb = hash_mb;
        }
        if let Some(threads) = overrides.threads {
            self.workload.threads = threads;
        }
        if let Some(nodes) = overrides.nodes {
            self.table.node_count = nodes;
        }
    }

    /// 置換表と負荷の設定を検証する
    pub fn validate(&self) -> Result<()> {
        self.table.validate()?;
        if self.workload.threads == 0 {
            bail!("workload.threads must be at least 1");
        }
        Ok(())
    }

    /// TCP ノードとして動くための検証
    pub fn validate_for_serve(&self) -> Result<()> {
        self.validate()?;
        if self.node.peers.len() != self.table.node_count {
            bail!(
                "node.peers lists {} addresses but node_count is {}",
                self.node.peers.len(),
                self.table.node_count
            );
        }
        Ok(())
    }

    /// 待ち受けアドレス
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.node
            .listen
            .or_else(|| self.node.peers.get(self.table.rank).copied())
            .with_context(|| format!("no listen address for rank {}", self.table.rank))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardtt_core::TableMode;

    const SAMPLE: &str = r#"
hash_mb = 8
node_count = 2
rank = 1
mode = "replicated"
merge_batch = 512

[node]
peers = ["127.0.0.1:7100", "127.0.0.1:7101"]

[workload]
threads = 2
seed = 7
"#;

    #[test]
    fn test_parse_sample() {
        let config = NodeConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.table.hash_mb, 8);
        assert_eq!(config.table.rank, 1);
        assert_eq!(config.table.mode, TableMode::Replicated);
        assert_eq!(config.table.merge_batch, 512);
        // 書かなかった値は既定値
        assert_eq!(config.table.read_cache_capacity, TtConfig::default().read_cache_capacity);
        assert_eq!(config.workload.threads, 2);
        assert_eq!(config.workload.iterations, WorkloadConfig::default().iterations);
        config.validate_for_serve().unwrap();
        assert_eq!(config.listen_addr().unwrap(), "127.0.0.1:7101".parse().unwrap());
    }

    #[test]
    fn test_overrides() {
        let mut config = NodeConfig::from_toml_str(SAMPLE).unwrap();
        config.apply(&Overrides {
            rank: Some(0),
            hash_mb: Some(2),
            threads: Some(6),
            nodes: None,
        });
        assert_eq!(config.table.rank, 0);
        assert_eq!(config.table.hash_mb, 2);
        assert_eq!(config.workload.threads, 6);
        assert_eq!(config.listen_addr().unwrap(), "127.0.0.1:7100".parse().unwrap());
    }

    #[test]
    fn test_peer_count_must_match() {
        let mut config = NodeConfig::from_toml_str(SAMPLE).unwrap();
        config.table.node_count = 3;
        config.table.rank = 0;
        assert!(config.validate().is_ok());
        assert!(config.validate_for_serve().is_err());
    }

    #[test]
    fn test_empty_file_is_single_node() {
        let config = NodeConfig::from_toml_str("").unwrap();
        assert_eq!(config.table.node_count, 1);
        config.validate().unwrap();
        assert!(config.listen_addr().is_err());
    }
}
