//! 合成探索負荷
//!
//! 実際の探索の代わりに、乱数の局面キーで probe / save を繰り返す。
//! キーの多くは全ノード・全スレッドで共通の「頻出局面」から引くので、
//! 他スレッド・他ノードが保存したエントリにヒットする。

use anyhow::Result;
use rand::{RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::Serialize;
use shardtt_core::{Bound, DistributedTable, Move, NodeId, ProbeKey, TtResult, Value};
use std::ops::AddAssign;
use std::time::Instant;

use crate::config::WorkloadConfig;

/// 頻出局面の数
const HOT_KEYS: usize = 4096;
/// 頻出局面から引く割合（1/1024 単位）
const HOT_RATIO: u32 = 800;

/// 負荷の集計
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkloadSummary {
    pub iterations: usize,
    pub probes: u64,
    pub hits: u64,
    /// ヒットして探索を打ち切った回数
    pub cutoffs: u64,
    pub saves: u64,
}

impl AddAssign for WorkloadSummary {
    fn add_assign(&mut self, rhs: Self) {
        self.probes += rhs.probes;
        self.hits += rhs.hits;
        self.cutoffs += rhs.cutoffs;
        self.saves += rhs.saves;
    }
}

impl WorkloadSummary {
    pub fn hit_rate(&self) -> f64 {
        if self.probes == 0 {
            0.0
        } else {
            self.hits as f64 / self.probes as f64 * 100.0
        }
    }
}

/// 頻出局面のキー（シードだけで決まる）
pub fn hot_keys(seed: u64) -> Vec<ProbeKey> {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    (0..HOT_KEYS)
        .map(|_| {
            let key = rng.next_u64();
            let pawn_key = rng.next_u64();
            let material_key = rng.next_u64();
            ProbeKey::with_structure(key, pawn_key, material_key)
        })
        .collect()
}

/// 1スレッド分の1反復
pub fn run_thread(
    table: &DistributedTable,
    hot: &[ProbeKey],
    seed: u64,
    probes: usize,
) -> TtResult<WorkloadSummary> {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    let mut summary = WorkloadSummary::default();
    let generation8 = table.generation();

    for _ in 0..probes {
        let key = if rng.next_u32() % 1024 < HOT_RATIO {
            hot[rng.next_u32() as usize % hot.len()]
        } else {
            ProbeKey::new(rng.next_u64())
        };
        let depth = (rng.next_u32() % 24) as i32 + 1;

        let probe = table.probe(key)?;
        summary.probes += 1;
        if probe.found {
            summary.hits += 1;
            if probe.data.depth >= depth {
                summary.cutoffs += 1;
                continue;
            }
        }

        let value = Value::new((rng.next_u32() % 2001) as i32 - 1000);
        let bound = match rng.next_u32() % 3 {
            0 => Bound::Upper,
            1 => Bound::Lower,
            _ => Bound::Exact,
        };
        let mv = Move::from_u16((rng.next_u32() & 0x7FFF) as u16 | 1);
        table.save(&probe, value, bound, depth, mv, value, generation8)?;
        summary.saves += 1;
    }
    Ok(summary)
}

/// 全反復を実行する
///
/// 反復の始めに世代を進め、全スレッドの終了後に書き込みバッファを吐き出す。
pub fn drive(table: &DistributedTable, config: &WorkloadConfig, rank: NodeId) -> Result<WorkloadSummary> {
    let hot = hot_keys(config.seed);
    let mut total = WorkloadSummary::default();

    for iteration in 0..config.iterations {
        let started = Instant::now();
        table.new_search();

        let results: Vec<TtResult<WorkloadSummary>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..config.threads)
                .map(|thread| {
                    let hot = &hot;
                    let seed = config.seed
                        ^ ((rank as u64) << 48)
                        ^ ((iteration as u64) << 24)
                        ^ (thread as u64 + 1);
                    scope.spawn(move || run_thread(table, hot, seed, config.probes_per_iteration))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
                .collect()
        });

        let mut summary = WorkloadSummary::default();
        for result in results {
            summary += result?;
        }
        table.flush()?;

        log::info!(
            "[Workload] rank {rank} iteration {}/{}: {} probes, hit rate {:.1}%, hashfull {}, {:.0} ms",
            iteration + 1,
            config.iterations,
            summary.probes,
            summary.hit_rate(),
            table.hashfull(),
            started.elapsed().as_secs_f64() * 1000.0
        );
        total += summary;
        total.iterations += 1;
    }
    Ok(total)
}
