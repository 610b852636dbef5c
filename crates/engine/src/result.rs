use std::collections::VecDeque;
use std::time::Duration;
use serde::Serialize;

/// Default size of the recent-results window
pub const RECENT_RESULTS_CAPACITY: usize = 100;

/// Outcome of one executed job
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobResult {
    pub file_name: String,
    pub success: bool,
    pub message: String,
    pub error: Option<String>,
    pub duration: Duration,
    /// Conversion attempts made
    pub attempts: u32,
}

impl JobResult {
    pub fn succeeded(file_name: &str, duration: Duration, attempts: u32) -> Self {
        Self {
            file_name: file_name.to_string(),
            success: true,
            message: "Processed successfully".to_string(),
            error: None,
            duration,
            attempts,
        }
    }

    pub fn failed(file_name: &str, message: &str, error: String, duration: Duration, attempts: u32) -> Self {
        Self {
            file_name: file_name.to_string(),
            success: false,
            message: message.to_string(),
            error: Some(error),
            duration,
            attempts,
        }
    }
}

/// Bounded window of the latest results, oldest dropped first
#[derive(Debug, Clone)]
pub struct RecentResults {
    capacity: usize,
    items: VecDeque<JobResult>,
}

impl Default for RecentResults {
    fn default() -> Self {
        Self::with_capacity(RECENT_RESULTS_CAPACITY)
    }
}

impl RecentResults {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            items: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, result: JobResult) {
        while self.items.len() >= self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(result);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Newest last
    pub fn iter(&self) -> impl Iterator<Item = &JobResult> {
        self.items.iter()
    }

    /// The newest `n` results, newest last
    pub fn tail(&self, n: usize) -> Vec<JobResult> {
        let skip = self.items.len().saturating_sub(n);
        self.items.iter().skip(skip).cloned().collect()
    }
}
