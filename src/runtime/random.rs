use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::flow::nodes::WeightedBranch;

/// 可注入的随机源，random 节点通过它抽签
pub trait RandomSource: Send + Sync {
    /// 返回 `[0, upper)` 内的整数，`upper` 必须大于 0
    fn below(&self, upper: u64) -> u64;
}

/// 线程本地随机数
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn below(&self, upper: u64) -> u64 {
        rand::rng().random_range(0..upper)
    }
}

/// 固定种子，测试与回放使用
pub struct SeededRandom {
    rng: Mutex<StdRng>,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl RandomSource for SeededRandom {
    fn below(&self, upper: u64) -> u64 {
        self.rng.lock().random_range(0..upper)
    }
}

/// 按权重抽取分支；总权重为 0 时返回 None
pub fn pick_weighted<'a>(
    branches: &'a [WeightedBranch],
    random: &dyn RandomSource,
) -> Option<&'a WeightedBranch> {
    let total: u64 = branches.iter().map(|b| u64::from(b.weight)).sum();
    if total == 0 {
        return None;
    }
    let mut draw = random.below(total);
    for branch in branches {
        let weight = u64::from(branch.weight);
        if draw < weight {
            return Some(branch);
        }
        draw -= weight;
    }
    None
}
