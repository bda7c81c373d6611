//! 节点选择策略
//!
//! 入参只包含健康节点; 游标由调用方持有, 每次调用都会推进。

use std::time::Duration;

use super::{Node, Strategy};

/// 从 `nodes` 中按策略选出一个下标
pub(crate) fn select(
    strategy: Strategy,
    nodes: &[&Node],
    cursor: &mut usize,
    slow_latency: Duration,
) -> Option<usize> {
    if nodes.is_empty() {
        return None;
    }

    let picked = match strategy {
        Strategy::RoundRobin => round_robin(nodes.len(), cursor),
        Strategy::LeastLoaded => least_loaded(nodes, slow_latency),
        Strategy::WeightedRoundRobin => weighted_round_robin(nodes, cursor),
        Strategy::RandomWeighted => random_weighted(nodes),
    };
    Some(picked)
}

fn round_robin(len: usize, cursor: &mut usize) -> usize {
    let picked = *cursor % len;
    *cursor = cursor.wrapping_add(1);
    picked
}

/// 负载分最低者胜出, 并列时取靠前的节点
fn least_loaded(nodes: &[&Node], slow_latency: Duration) -> usize {
    let mut best = 0;
    let mut best_score = f64::INFINITY;
    for (idx, node) in nodes.iter().enumerate() {
        let score = node.load_score(slow_latency);
        if score < best_score {
            best = idx;
            best_score = score;
        }
    }
    best
}

/// 每个节点按权重展开成虚拟槽位后循环
fn weighted_round_robin(nodes: &[&Node], cursor: &mut usize) -> usize {
    let total: usize = nodes.iter().map(|n| n.weight as usize).sum();
    if total == 0 {
        *cursor = cursor.wrapping_add(1);
        return 0;
    }

    let mut slot = *cursor % total;
    *cursor = cursor.wrapping_add(1);
    for (idx, node) in nodes.iter().enumerate() {
        let weight = node.weight as usize;
        if slot < weight {
            return idx;
        }
        slot -= weight;
    }
    0
}

fn random_weighted(nodes: &[&Node]) -> usize {
    let total: u64 = nodes.iter().map(|n| n.weight as u64).sum();
    if total == 0 {
        return 0;
    }

    let mut draw = rand::random_range(0..total);
    for (idx, node) in nodes.iter().enumerate() {
        let weight = node.weight as u64;
        if draw < weight {
            return idx;
        }
        draw -= weight;
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Endpoint;

    fn node(id: &str, weight: u32, active: u32) -> Node {
        let mut n = Node::new(id, Endpoint::new("127.0.0.1", 8080, "k"), weight);
        n.active_jobs = active;
        n
    }

    #[test]
    fn test_weighted_round_robin_expands_weights() {
        let a = node("a", 2, 0);
        let b = node("b", 1, 0);
        let nodes = [&a, &b];
        let mut cursor = 0;
        let picks: Vec<usize> = (0..6)
            .map(|_| weighted_round_robin(&nodes, &mut cursor))
            .collect();
        assert_eq!(picks, vec![0, 0, 1, 0, 0, 1]);
    }

    #[test]
    fn test_zero_weights_fall_back_to_first() {
        let a = node("a", 0, 0);
        let b = node("b", 0, 0);
        let mut cursor = 0;
        assert_eq!(weighted_round_robin(&[&a, &b], &mut cursor), 0);
        assert_eq!(random_weighted(&[&a, &b]), 0);
    }

    #[test]
    fn test_random_weighted_skips_zero_weight() {
        let a = node("a", 0, 0);
        let b = node("b", 3, 0);
        for _ in 0..50 {
            assert_eq!(random_weighted(&[&a, &b]), 1);
        }
    }

    #[test]
    fn test_least_loaded_prefers_first_on_tie() {
        let a = node("a", 1, 1);
        let b = node("b", 1, 1);
        assert_eq!(least_loaded(&[&a, &b], Duration::from_secs(5)), 0);
    }
}
