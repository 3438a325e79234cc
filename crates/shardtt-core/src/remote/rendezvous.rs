//! 同一プロセス内の集団通信（all-reduce）
//!
//! 全参加者が同じラウンドでバッチを持ち寄り、最後に到着した参加者が
//! rank 順にマージする。結果を全員が受け取るまで次のラウンドの到着は待たされる。
//! rank 0 の `WindowServer` がこれをホストすれば、TCP 越しの参加者も同じ
//! ラウンドに参加できる。

use super::Collective;
use crate::error::{TtError, TtResult};
use crate::merge::reduce_batches;
use crate::partition::NodeId;
use crate::tt::Cluster;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Contribution {
    generation: u8,
    stop: bool,
    batch: Vec<Cluster>,
}

struct RoundState {
    /// 現在集めているラウンド
    round: u64,
    slots: Vec<Option<Contribution>>,
    arrived: usize,
    /// 確定した結果（全員が読み終わるまで保持）
    result: Option<Arc<TtResult<Option<Vec<Cluster>>>>>,
    /// 結果をまだ受け取っていない参加者数
    readers_left: usize,
}

/// 同一プロセス内の all-reduce
pub struct Rendezvous {
    participants: usize,
    timeout: Duration,
    state: Mutex<RoundState>,
    condvar: Condvar,
}

impl Rendezvous {
    pub fn new(participants: usize, timeout: Duration) -> Self {
        Self {
            participants,
            timeout,
            state: Mutex::new(RoundState {
                round: 0,
                slots: (0..participants).map(|_| None).collect(),
                arrived: 0,
                result: None,
                readers_left: 0,
            }),
            condvar: Condvar::new(),
        }
    }

    fn reduce(slots: &mut [Option<Contribution>]) -> TtResult<Option<Vec<Cluster>>> {
        let contributions: Vec<Contribution> = slots.iter_mut().filter_map(Option::take).collect();
        if contributions.iter().any(|c| c.stop) {
            return Ok(None);
        }
        let generation = contributions.first().map_or(0, |c| c.generation);
        let batches: Vec<Vec<Cluster>> = contributions.into_iter().map(|c| c.batch).collect();
        reduce_batches(&batches, generation).map(Some)
    }
}

impl Collective for Rendezvous {
    fn all_reduce(
        &self,
        round: u64,
        rank: NodeId,
        generation: u8,
        stop: bool,
        batch: Vec<Cluster>,
    ) -> TtResult<Option<Vec<Cluster>>> {
        if rank >= self.participants {
            return Err(TtError::Protocol {
                detail: format!("rank {rank} is not a participant (of {})", self.participants),
            });
        }
        let deadline = Instant::now() + self.timeout;
        let mut state = self.state.lock();

        // 前のラウンドの結果が読み終わるまで待つ
        while state.result.is_some() {
            if self.condvar.wait_until(&mut state, deadline).timed_out() && state.result.is_some() {
                return Err(TtError::CollectiveTimeout { round });
            }
        }
        if state.round != round {
            return Err(TtError::Protocol {
                detail: format!("rank {rank} joined round {round} while round {} is open", state.round),
            });
        }
        if state.slots[rank].is_some() {
            return Err(TtError::Protocol {
                detail: format!("rank {rank} contributed twice to round {round}"),
            });
        }

        state.slots[rank] = Some(Contribution {
            generation,
            stop,
            batch,
        });
        state.arrived += 1;

        if state.arrived == self.participants {
            let result = Self::reduce(&mut state.slots);
            state.result = Some(Arc::new(result));
            state.readers_left = self.participants;
            self.condvar.notify_all();
        } else {
            while state.result.is_none() {
                if self.condvar.wait_until(&mut state, deadline).timed_out() && state.result.is_none() {
                    // 寄与を取り下げて、残りの参加者だけでラウンドが成立しないようにする
                    state.slots[rank] = None;
                    state.arrived -= 1;
                    return Err(TtError::CollectiveTimeout { round });
                }
            }
        }

        let result = state.result.clone();
        state.readers_left -= 1;
        if state.readers_left == 0 {
            state.result = None;
            state.arrived = 0;
            state.round += 1;
            self.condvar.notify_all();
        }
        drop(state);

        match result.as_deref() {
            Some(Ok(clusters)) => Ok(clusters.clone()),
            Some(Err(e)) => Err(TtError::Protocol {
                detail: e.to_string(),
            }),
            None => Err(TtError::Protocol {
                detail: format!("round {round} closed without a result"),
            }),
        }
    }
}
