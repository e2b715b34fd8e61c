//! Named event counters.
//!
//! Counters are the only value workers return: each worker keeps its own
//! [`EventCounter`] and the command merges them on completion into a single
//! report.

use std::collections::BTreeMap;

use human_repr::HumanCount;
use tokio::task::JoinHandle;

use crate::prelude::*;

#[derive(Debug, Clone)]
pub struct EventCounter {
    name: String,
    counters: BTreeMap<String, i64>,
}

impl EventCounter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            counters: BTreeMap::new(),
        }
    }

    pub fn log(&mut self, name: &str) {
        self.log_n(name, 1);
    }

    pub fn log_n(&mut self, name: &str, n: i64) {
        *self.counters.entry(name.to_string()).or_default() += n;
    }

    pub fn get(&self, name: &str) -> i64 {
        self.counters.get(name).copied().unwrap_or_default()
    }

    /// Adds all of the child's counters into this counter.
    pub fn merge_child(&mut self, child: EventCounter) {
        for (name, value) in child.counters {
            *self.counters.entry(name).or_default() += value;
        }
    }

    /// Awaits the workers and merges each returned counter on arrival.
    /// A worker failure is surfaced after the remaining workers are gathered.
    pub async fn gather_stats(&mut self, workers: Vec<JoinHandle<Result<EventCounter>>>) -> Result {
        let mut first_error = None;
        for worker in workers {
            match worker.await.context("a worker has panicked")? {
                Ok(child) => self.merge_child(child),
                Err(error) => {
                    self.log("errors");
                    first_error.get_or_insert(error);
                }
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    pub fn format_report(&self) -> String {
        let width = self
            .counters
            .keys()
            .map(|name| name.len())
            .max()
            .unwrap_or_default();
        let mut report = format!("{}:", self.name);
        for (name, value) in &self.counters {
            report.push_str(&format!("\n  {name:width$} : {}", value.human_count_bare()));
        }
        report
    }

    /// Prints the final report through the log.
    pub fn print(&self) {
        for line in self.format_report().lines() {
            info!("{line}");
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::spawn;

    use super::*;

    #[test]
    fn merge_child_adds_counters() {
        let mut parent = EventCounter::new("parent");
        parent.log_n("read", 2);

        let mut child = EventCounter::new("child");
        child.log("read");
        child.log("errors");

        parent.merge_child(child);
        assert_eq!(parent.get("read"), 3);
        assert_eq!(parent.get("errors"), 1);
        assert_eq!(parent.get("missing"), 0);
    }

    #[test]
    fn negative_increments_are_allowed() {
        let mut stats = EventCounter::new("fetch");
        stats.log_n("accounts total", 5);
        stats.log_n("accounts total", -2);
        assert_eq!(stats.get("accounts total"), 3);
    }

    #[tokio::test]
    async fn gather_stats_merges_worker_results() -> Result {
        let mut stats = EventCounter::new("command");
        let workers = (0..3)
            .map(|_| {
                spawn(async {
                    let mut stats = EventCounter::new("worker");
                    stats.log("done");
                    Ok(stats)
                })
            })
            .collect();
        stats.gather_stats(workers).await?;
        assert_eq!(stats.get("done"), 3);
        Ok(())
    }
}
