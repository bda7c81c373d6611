//! 负载均衡器集成测试
//!
//! 包含四类测试场景:
//! 1. 各选择策略
//! 2. 任务记账与租约
//! 3. 健康巡检与恢复
//! 4. 节点发现与后台循环

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use scan_pool::balancer::{Node, StaticDiscovery};
use scan_pool::config::BalancerConfig;
use scan_pool::engine::Endpoint;
use scan_pool::{LoadBalancer, Strategy};
use test_utils::{init_logger, wait_until, FakeConnector};

fn balancer(strategy: Strategy, connector: Arc<FakeConnector>) -> LoadBalancer {
    let config = BalancerConfig {
        strategy,
        health_check_interval: Duration::from_millis(20),
        health_timeout: Duration::from_millis(50),
        ..BalancerConfig::default()
    };
    LoadBalancer::new(config, connector).unwrap()
}

fn add(lb: &LoadBalancer, port: u16, weight: u32) -> String {
    lb.add_endpoint("localhost", port, "test-key", weight)
}

mod strategies {
    use super::*;

    #[test]
    fn test_round_robin_cycles_healthy_nodes() {
        let lb = balancer(Strategy::RoundRobin, FakeConnector::new());
        let a = add(&lb, 9001, 1);
        let b = add(&lb, 9002, 1);
        let c = add(&lb, 9003, 1);

        let picks: Vec<String> = (0..6).map(|_| lb.select_node().unwrap().id).collect();
        assert_eq!(picks, vec![a.clone(), b.clone(), c.clone(), a, b, c]);
    }

    #[test]
    fn test_least_loaded_prefers_idle_node_and_breaks_ties_by_order() {
        let lb = balancer(Strategy::LeastLoaded, FakeConnector::new());
        let a = add(&lb, 9001, 1);
        let b = add(&lb, 9002, 1);

        assert_eq!(lb.select_node().unwrap().id, a);
        lb.assign(&"job-1".to_string()).unwrap();
        assert_eq!(lb.select_node().unwrap().id, b);
    }

    #[test]
    fn test_weighted_round_robin_follows_weights() {
        let lb = balancer(Strategy::WeightedRoundRobin, FakeConnector::new());
        let heavy = add(&lb, 9001, 3);
        let light = add(&lb, 9002, 1);

        let picks: Vec<String> = (0..8).map(|_| lb.select_node().unwrap().id).collect();
        assert_eq!(picks.iter().filter(|id| **id == heavy).count(), 6);
        assert_eq!(picks.iter().filter(|id| **id == light).count(), 2);
    }

    #[test]
    fn test_random_weighted_never_picks_zero_weight_node() {
        let lb = balancer(Strategy::RandomWeighted, FakeConnector::new());
        let zero = add(&lb, 9001, 0);
        let live = add(&lb, 9002, 5);

        for _ in 0..200 {
            let picked = lb.select_node().unwrap().id;
            assert_ne!(picked, zero);
            assert_eq!(picked, live);
        }
    }

    #[test]
    fn test_empty_registry_selects_nothing() {
        let lb = balancer(Strategy::RoundRobin, FakeConnector::new());
        assert!(lb.select_node().is_none());
        assert!(lb.assign(&"job-1".to_string()).is_none());
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("round_robin".parse::<Strategy>().unwrap(), Strategy::RoundRobin);
        assert_eq!("least_connections".parse::<Strategy>().unwrap(), Strategy::LeastLoaded);
        assert_eq!("random".parse::<Strategy>().unwrap(), Strategy::RandomWeighted);
        assert!("fastest".parse::<Strategy>().is_err());
    }
}

mod accounting {
    use super::*;

    #[test]
    fn test_assign_and_release_counters() {
        let lb = balancer(Strategy::LeastLoaded, FakeConnector::new());
        let id = add(&lb, 9001, 1);
        let job = "job-1".to_string();

        lb.assign(&job).unwrap();
        lb.assign(&job).unwrap();
        let node = lb.node(&id).unwrap();
        assert_eq!(node.active_jobs, 2);
        assert_eq!(node.total_jobs, 2);

        lb.release(&id, &job);
        lb.release(&id, &job);
        lb.release(&id, &job);
        let node = lb.node(&id).unwrap();
        assert_eq!(node.active_jobs, 0);
        assert_eq!(node.total_jobs, 2);
    }

    #[test]
    fn test_release_unknown_node_is_ignored() {
        let lb = balancer(Strategy::LeastLoaded, FakeConnector::new());
        lb.release("engine-nowhere-1", &"job-1".to_string());
        assert!(lb.nodes().is_empty());
    }

    #[test]
    fn test_lease_releases_on_drop() {
        let lb = Arc::new(balancer(Strategy::LeastLoaded, FakeConnector::new()));
        let id = add(&lb, 9001, 1);
        {
            let lease = lb.lease(&"job-1".to_string()).unwrap();
            assert_eq!(lease.node().id, id);
            assert_eq!(lb.node(&id).unwrap().active_jobs, 1);
        }
        assert_eq!(lb.node(&id).unwrap().active_jobs, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_assign_keeps_counters_exact_and_even() {
        const JOBS: usize = 60;
        let lb = Arc::new(balancer(Strategy::LeastLoaded, FakeConnector::new()));
        let ids: Vec<String> = (0..3u16).map(|n| add(&lb, 9001 + n, 1)).collect();

        let assigns: Vec<_> = (0..JOBS)
            .map(|n| {
                let lb = lb.clone();
                tokio::spawn(async move { lb.assign(&format!("job-{n}")).map(|node| node.id) })
            })
            .collect();
        for handle in assigns {
            assert!(handle.await.unwrap().is_some());
        }

        let active: Vec<u32> = ids.iter().map(|id| lb.node(id).unwrap().active_jobs).collect();
        assert_eq!(active.iter().map(|n| *n as usize).sum::<usize>(), JOBS);
        let spread = active.iter().max().unwrap() - active.iter().min().unwrap();
        assert!(spread <= 1, "uneven assignment: {active:?}");
        assert_eq!(lb.status().total_jobs_processed, JOBS as u64);

        let releases: Vec<_> = (0..JOBS)
            .map(|n| {
                let lb = lb.clone();
                let id = ids[n % ids.len()].clone();
                tokio::spawn(async move { lb.release(&id, &format!("job-{n}")) })
            })
            .collect();
        for handle in releases {
            handle.await.unwrap();
        }
        assert_eq!(lb.status().total_active_jobs, 0);
    }

    #[test]
    fn test_add_node_replaces_same_id() {
        let lb = balancer(Strategy::LeastLoaded, FakeConnector::new());
        add(&lb, 9001, 1);
        lb.add_node(Node::from_endpoint(Endpoint::new("localhost", 9001, "test-key"), 4));
        let nodes = lb.nodes();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].weight, 4);

        lb.remove_node(&nodes[0].id);
        lb.remove_node(&nodes[0].id);
        assert!(lb.nodes().is_empty());
    }

    #[test]
    fn test_status_snapshot() {
        let lb = balancer(Strategy::RoundRobin, FakeConnector::new());
        add(&lb, 9001, 1);
        add(&lb, 9002, 1);
        lb.assign(&"job-1".to_string()).unwrap();

        let status = lb.status();
        assert_eq!(status.strategy, Strategy::RoundRobin);
        assert_eq!(status.total_nodes, 2);
        assert_eq!(status.healthy_nodes, 2);
        assert_eq!(status.unhealthy_nodes, 0);
        assert_eq!(status.total_active_jobs, 1);
        assert_eq!(status.total_jobs_processed, 1);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["strategy"], "round_robin");
        assert_eq!(json["nodes"].as_array().unwrap().len(), 2);
    }
}

mod health {
    use super::*;

    #[tokio::test]
    async fn test_unhealthy_node_excluded_then_recovers() {
        init_logger();
        let connector = FakeConnector::new();
        let lb = balancer(Strategy::RoundRobin, connector.clone());
        let a = add(&lb, 9001, 1);
        let b = add(&lb, 9002, 1);

        connector.engine_at(9001).set_healthy(false);
        lb.health_check_all().await;
        assert!(!lb.node(&a).unwrap().healthy);
        assert_eq!(lb.node(&a).unwrap().latency, Duration::from_secs(10));
        for _ in 0..4 {
            assert_eq!(lb.select_node().unwrap().id, b);
        }

        connector.engine_at(9001).set_healthy(true);
        lb.health_check_all().await;
        lb.health_check_all().await;
        let node = lb.node(&a).unwrap();
        assert!(node.healthy);
        assert!(node.last_health_check.is_some());
        assert_eq!(lb.status().healthy_nodes, 2);
    }

    #[tokio::test]
    async fn test_slow_probe_counts_as_failure() {
        let connector = FakeConnector::new();
        let lb = balancer(Strategy::LeastLoaded, connector.clone());
        let a = add(&lb, 9001, 1);

        connector.engine_at(9001).set_health_delay(Duration::from_millis(200));
        lb.health_check_all().await;
        assert!(!lb.node(&a).unwrap().healthy);
        assert!(lb.select_node().is_none());
    }
}

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn test_start_discovers_and_loop_tracks_health() {
        init_logger();
        let connector = FakeConnector::new();
        let lb = Arc::new(balancer(Strategy::LeastLoaded, connector.clone()));
        let discovery = StaticDiscovery::new(vec![
            Endpoint::new("localhost", 9001, "test-key"),
            Endpoint::new("localhost", 9002, "test-key"),
        ]);

        lb.start(&discovery).await;
        assert_eq!(lb.nodes().len(), 2);
        assert_eq!(lb.rediscover(&discovery).await, 0);

        connector.engine_at(9002).set_healthy(false);
        let lb2 = lb.clone();
        assert!(wait_until(Duration::from_secs(2), move || lb2.status().healthy_nodes == 1).await);

        lb.stop().await;
        // 停止后巡检不再运行
        connector.engine_at(9002).set_healthy(true);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(lb.status().healthy_nodes, 1);
    }
}

proptest! {
    #[test]
    fn test_active_jobs_never_underflow(ops in proptest::collection::vec(any::<bool>(), 0..64)) {
        let lb = balancer(Strategy::LeastLoaded, FakeConnector::new());
        let id = add(&lb, 9001, 1);
        let job = "job".to_string();
        let mut expected: u32 = 0;
        let mut assigned: u64 = 0;

        for assign in ops {
            if assign {
                lb.assign(&job).unwrap();
                expected += 1;
                assigned += 1;
            } else {
                lb.release(&id, &job);
                expected = expected.saturating_sub(1);
            }
        }

        let node = lb.node(&id).unwrap();
        prop_assert_eq!(node.active_jobs, expected);
        prop_assert_eq!(node.total_jobs, assigned);
    }
}
