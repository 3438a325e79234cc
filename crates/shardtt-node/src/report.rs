//! 終了時の統計出力

use anyhow::Result;
use serde::Serialize;
use shardtt_core::{DistributedTable, NodeId, StatsSnapshot};

use crate::workload::WorkloadSummary;

/// 1ノード分の結果
#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub rank: NodeId,
    pub mode: String,
    pub partition: &'static str,
    pub cluster_count: usize,
    pub hashfull: i32,
    pub merge_passes: usize,
    pub workload: WorkloadSummary,
    pub stats: StatsSnapshot,
}

impl NodeReport {
    pub fn collect(table: &DistributedTable, workload: WorkloadSummary, merge_passes: usize) -> Self {
        Self {
            rank: table.rank(),
            mode: format!("{:?}", table.mode()).to_lowercase(),
            partition: table.partitioner_name(),
            cluster_count: table.cluster_count(),
            hashfull: table.hashfull(),
            merge_passes,
            workload,
            stats: table.stats(),
        }
    }
}

/// 標準出力に書き出す（`json` なら1行1ノードの JSON）
pub fn print_reports(reports: &[NodeReport], json: bool) -> Result<()> {
    for report in reports {
        if json {
            println!("{}", serde_json::to_string(report)?);
        } else {
            println!(
                "rank {} ({}, {} clusters): {} probes, hit rate {:.1}%, hashfull {}, merge passes {}",
                report.rank,
                report.mode,
                report.cluster_count,
                report.workload.probes,
                report.workload.hit_rate(),
                report.hashfull,
                report.merge_passes
            );
            println!("  {}", report.stats.summary());
        }
    }
    Ok(())
}
