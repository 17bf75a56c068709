//! Thread Timeline
//!
//! Records when each logical thread of a job starts and ends. Threads are
//! named `T` plus their hierarchy, so `T1.2` is the second thread spawned by
//! the root. Used for saved results and the `--timeline` chart.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};

use crate::execution::thread::ThreadEndCode;

const CHART_WIDTH: f64 = 50.0;
const LABEL_WIDTH: usize = 14;

/// Lifetime of one logical thread.
#[derive(Debug, Clone)]
pub struct ThreadSpan {
    /// Timeline name, e.g. `T1.3`
    pub name: String,
    pub started: Instant,
    pub started_at: DateTime<Local>,
    /// End time and end code, `None` while the thread is live
    pub ended: Option<(Instant, ThreadEndCode)>,
}

impl ThreadSpan {
    /// Nesting depth, 0 for the root.
    pub fn depth(&self) -> usize {
        self.name.matches('.').count()
    }

    pub fn duration(&self) -> Option<Duration> {
        self.ended.map(|(end, _)| end.duration_since(self.started))
    }

    fn marker(&self) -> char {
        match self.ended {
            None => '>',
            Some((_, ThreadEndCode::Ok)) => '#',
            Some((_, ThreadEndCode::StoppedByParent)) => 'x',
            Some((_, ThreadEndCode::DuplicateSignal)) => '!',
        }
    }
}

/// Start and end times of every thread of one job.
#[derive(Debug, Clone)]
pub struct ThreadTimeline {
    spans: Vec<ThreadSpan>,
    origin: Instant,
}

impl ThreadTimeline {
    pub fn new() -> Self {
        Self {
            spans: Vec::new(),
            origin: Instant::now(),
        }
    }

    pub fn thread_started(&mut self, hierarchy: &str) {
        self.spans.push(ThreadSpan {
            name: format!("T{}", hierarchy),
            started: Instant::now(),
            started_at: Local::now(),
            ended: None,
        });
    }

    /// Closes the open span of a thread. Unknown threads are ignored.
    pub fn thread_finished(&mut self, hierarchy: &str, end_code: ThreadEndCode) {
        let name = format!("T{}", hierarchy);
        if let Some(span) = self
            .spans
            .iter_mut()
            .rev()
            .find(|s| s.name == name && s.ended.is_none())
        {
            span.ended = Some((Instant::now(), end_code));
        }
    }

    /// Spans in start order.
    pub fn spans(&self) -> &[ThreadSpan] {
        &self.spans
    }

    pub fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }

    /// Milliseconds each finished thread ran, by name.
    pub fn durations(&self) -> BTreeMap<String, u64> {
        self.spans
            .iter()
            .filter_map(|s| s.duration().map(|d| (s.name.clone(), d.as_millis() as u64)))
            .collect()
    }

    /// Largest number of threads that were live at the same moment.
    pub fn peak_concurrency(&self) -> usize {
        let mut edges: Vec<(Instant, i32)> = Vec::with_capacity(self.spans.len() * 2);
        for span in &self.spans {
            edges.push((span.started, 1));
            if let Some((end, _)) = span.ended {
                edges.push((end, -1));
            }
        }
        // Ends sort before starts at the same instant.
        edges.sort();

        let mut live = 0i32;
        let mut peak = 0i32;
        for (_, delta) in edges {
            live += delta;
            peak = peak.max(live);
        }
        peak as usize
    }

    /// ASCII Gantt chart, one lane per thread indented by depth.
    ///
    /// `#` ran to completion, `x` was stopped by its parent, `!` ended on a
    /// duplicate signal and `>` is still running.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nThread Timeline:\n\n");

        let now = Instant::now();
        let total = now.duration_since(self.origin).as_millis();
        if total == 0 || self.spans.is_empty() {
            return output;
        }
        let scale = CHART_WIDTH / total as f64;

        for span in &self.spans {
            let start = span.started.duration_since(self.origin).as_millis();
            let end = span
                .ended
                .map(|(end, _)| end.duration_since(self.origin).as_millis())
                .unwrap_or(total);
            let offset = (start as f64 * scale) as usize;
            let width = ((end.saturating_sub(start)) as f64 * scale).max(1.0) as usize;

            let label = format!("{}{}", "  ".repeat(span.depth()), span.name);
            output.push_str(&format!(
                "{} |{}{}| {} ms\n",
                fit(&label, LABEL_WIDTH),
                " ".repeat(offset),
                span.marker().to_string().repeat(width),
                end.saturating_sub(start)
            ));
        }

        output.push_str(&format!(
            "\n{} threads, peak {} live, {} ms\n",
            self.spans.len(),
            self.peak_concurrency(),
            total
        ));
        output
    }
}

impl Default for ThreadTimeline {
    fn default() -> Self {
        Self::new()
    }
}

fn fit(label: &str, width: usize) -> String {
    if label.chars().count() <= width {
        format!("{:width$}", label, width = width)
    } else {
        let head: String = label.chars().take(width - 3).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn test_empty_timeline() {
        let timeline = ThreadTimeline::default();
        assert!(timeline.spans().is_empty());
        assert!(timeline.durations().is_empty());
        assert_eq!(timeline.peak_concurrency(), 0);
    }

    #[test]
    fn test_durations_cover_finished_threads() {
        let mut timeline = ThreadTimeline::new();
        timeline.thread_started("1");
        sleep(Duration::from_millis(30));
        timeline.thread_finished("1", ThreadEndCode::Ok);
        timeline.thread_started("1.2");

        let durations = timeline.durations();
        assert!(durations["T1"] >= 30);
        assert!(!durations.contains_key("T1.2"));
        assert_eq!(timeline.spans()[1].depth(), 1);
    }

    #[test]
    fn test_finish_of_unknown_thread_is_ignored() {
        let mut timeline = ThreadTimeline::new();
        timeline.thread_finished("7", ThreadEndCode::Ok);
        assert!(timeline.spans().is_empty());
    }

    #[test]
    fn test_peak_concurrency() {
        let mut timeline = ThreadTimeline::new();
        timeline.thread_started("1");
        timeline.thread_started("1.1");
        timeline.thread_started("1.2");
        timeline.thread_finished("1.1", ThreadEndCode::Ok);
        timeline.thread_finished("1.2", ThreadEndCode::StoppedByParent);
        timeline.thread_started("1.3");
        timeline.thread_finished("1.3", ThreadEndCode::Ok);
        timeline.thread_finished("1", ThreadEndCode::Ok);

        assert_eq!(timeline.peak_concurrency(), 3);
    }

    #[test]
    fn test_gantt_chart_marks_end_codes() {
        let mut timeline = ThreadTimeline::new();
        timeline.thread_started("1");
        timeline.thread_started("1.2");
        sleep(Duration::from_millis(40));
        timeline.thread_finished("1.2", ThreadEndCode::StoppedByParent);
        timeline.thread_started("1.3");

        let chart = timeline.gantt_chart();
        assert!(chart.contains("  T1.2"));
        assert!(chart.contains("x|"));
        assert!(chart.contains(">|"));
        assert!(chart.contains("3 threads"));
    }

    #[test]
    fn test_fit_label() {
        assert_eq!(fit("T1.2.3.4.5.6.7.8", 14), "T1.2.3.4.5....");
        assert_eq!(fit("T1", 4), "T1  ");
    }
}
