//! 待调度任务队列
//!
//! 无界 FIFO; 取不到实例的任务重新排到队尾。

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::job::ScanJob;

#[derive(Debug, Default)]
pub struct JobQueue {
    jobs: Mutex<VecDeque<ScanJob>>,
    available: Notify,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 入队到队尾
    pub fn push(&self, job: ScanJob) {
        let depth = {
            let mut jobs = self.jobs.lock();
            jobs.push_back(job);
            jobs.len()
        };
        metrics::gauge!("scan_pool_queue_depth").set(depth as f64);
        self.available.notify_one();
    }

    /// 非阻塞出队
    pub fn try_pop(&self) -> Option<ScanJob> {
        let mut jobs = self.jobs.lock();
        let job = jobs.pop_front();
        metrics::gauge!("scan_pool_queue_depth").set(jobs.len() as f64);
        job
    }

    /// 等待直到有任务可取
    pub async fn pop(&self) -> ScanJob {
        loop {
            if let Some(job) = self.try_pop() {
                return job;
            }
            self.available.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }

    /// 清空队列, 返回被丢弃的任务
    pub fn drain(&self) -> Vec<ScanJob> {
        let drained: Vec<ScanJob> = self.jobs.lock().drain(..).collect();
        metrics::gauge!("scan_pool_queue_depth").set(0.0);
        drained
    }

    /// 当前排队任务ID, 按出队顺序
    pub fn job_ids(&self) -> Vec<String> {
        self.jobs.lock().iter().map(|j| j.id.clone()).collect()
    }
}
