//! Running generation statistics

use chrono::{DateTime, Utc};
use kiln_cache::CacheStats;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Per-backend attempt counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendStats {
    pub successes: u64,
    pub failures: u64,
    /// Time spent in attempts, successful or not
    pub total_time_secs: f64,
    /// Raw artifact bytes from successful attempts
    pub total_bytes: u64,
    pub last_used: Option<DateTime<Utc>>,
}

impl BackendStats {
    pub fn attempts(&self) -> u64 {
        self.successes + self.failures
    }

    pub fn average_time_secs(&self) -> f64 {
        match self.attempts() {
            0 => 0.0,
            n => self.total_time_secs / n as f64,
        }
    }

    pub fn average_size_mb(&self) -> f64 {
        match self.successes {
            0 => 0.0,
            n => self.total_bytes as f64 / n as f64 / (1024.0 * 1024.0),
        }
    }
}

/// Totals since the coordinator was created
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationStats {
    /// New artifacts produced by a backend
    pub total_generated: u64,
    pub cache_hits: u64,
    /// Requests whose whole fallback chain failed
    pub failed_generations: u64,
    /// Wall time of successful generations
    pub total_time_secs: f64,
    pub backends: BTreeMap<String, BackendStats>,
}

impl GenerationStats {
    pub fn average_time_secs(&self) -> f64 {
        match self.total_generated {
            0 => 0.0,
            n => self.total_time_secs / n as f64,
        }
    }

    /// Cache hits over all non-failed requests
    pub fn hit_ratio(&self) -> f64 {
        let served = self.cache_hits + self.total_generated;
        match served {
            0 => 0.0,
            n => self.cache_hits as f64 / n as f64,
        }
    }

    pub(crate) fn record_hit(&mut self) {
        self.cache_hits += 1;
    }

    pub(crate) fn record_generated(&mut self, secs: f64) {
        self.total_generated += 1;
        self.total_time_secs += secs;
    }

    pub(crate) fn record_failed(&mut self) {
        self.failed_generations += 1;
    }

    pub(crate) fn record_attempt(&mut self, backend: &str, success: bool, secs: f64, bytes: u64) {
        let entry = self.backends.entry(backend.to_string()).or_default();
        if success {
            entry.successes += 1;
            entry.total_bytes += bytes;
        } else {
            entry.failures += 1;
        }
        entry.total_time_secs += secs;
        entry.last_used = Some(Utc::now());
    }
}

/// Generation totals joined with global cache occupancy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatisticsReport {
    pub generation: GenerationStats,
    pub cache: CacheStats,
}

impl fmt::Display for StatisticsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let g = &self.generation;
        writeln!(f, "Generated:     {}", g.total_generated)?;
        writeln!(f, "Cache hits:    {} ({:.1}%)", g.cache_hits, g.hit_ratio() * 100.0)?;
        writeln!(f, "Failed:        {}", g.failed_generations)?;
        writeln!(
            f,
            "Time:          {:.1}s total, {:.1}s average",
            g.total_time_secs,
            g.average_time_secs()
        )?;
        write!(f, "Cache:         {}", self.cache)?;
        for (name, b) in &g.backends {
            write!(
                f,
                "\n  {:<10} {} ok / {} failed, {:.1}s avg, {:.2} MB avg",
                name,
                b.successes,
                b.failures,
                b.average_time_secs(),
                b.average_size_mb()
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_ratios_are_zero() {
        let stats = GenerationStats::default();
        assert_eq!(stats.average_time_secs(), 0.0);
        assert_eq!(stats.hit_ratio(), 0.0);
    }

    #[test]
    fn test_counters() {
        let mut stats = GenerationStats::default();
        stats.record_generated(4.0);
        stats.record_generated(2.0);
        stats.record_hit();
        stats.record_hit();
        stats.record_failed();

        assert_eq!(stats.average_time_secs(), 3.0);
        assert_eq!(stats.hit_ratio(), 0.5);
        assert_eq!(stats.failed_generations, 1);
    }

    #[test]
    fn test_backend_counters() {
        let mut stats = GenerationStats::default();
        stats.record_attempt("meshy", false, 1.0, 0);
        stats.record_attempt("meshy", true, 3.0, 2 * 1024 * 1024);

        let meshy = &stats.backends["meshy"];
        assert_eq!(meshy.attempts(), 2);
        assert_eq!(meshy.average_time_secs(), 2.0);
        assert_eq!(meshy.average_size_mb(), 2.0);
        assert!(meshy.last_used.is_some());
    }

    #[test]
    fn test_report_display() {
        let mut report = StatisticsReport::default();
        report.generation.record_generated(1.0);
        report.generation.record_attempt("sf3d", true, 1.0, 1024);
        let text = report.to_string();
        assert!(text.contains("Generated:     1"));
        assert!(text.contains("sf3d"));
    }
}
