//! Running performance counters.

use serde::Serialize;

/// Latency and throughput accumulated over every generation of a backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceStats {
    pub generations: u64,
    pub total_tokens: u64,
    pub total_time_ms: u64,
    /// `None` until the first generation is recorded.
    pub min_time_ms: Option<u64>,
    pub max_time_ms: u64,
}

impl PerformanceStats {
    pub fn record(&mut self, elapsed_ms: u64, tokens: u32) {
        self.generations += 1;
        self.total_tokens += u64::from(tokens);
        self.total_time_ms = self.total_time_ms.saturating_add(elapsed_ms);
        self.min_time_ms = Some(self.min_time_ms.map_or(elapsed_ms, |m| m.min(elapsed_ms)));
        self.max_time_ms = self.max_time_ms.max(elapsed_ms);
    }

    pub fn average_time_ms(&self) -> f64 {
        if self.generations == 0 {
            0.0
        } else {
            self.total_time_ms as f64 / self.generations as f64
        }
    }

    pub fn tokens_per_second(&self) -> f64 {
        if self.total_time_ms == 0 {
            0.0
        } else {
            self.total_tokens as f64 * 1000.0 / self.total_time_ms as f64
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record() {
        let mut stats = PerformanceStats::default();
        assert_eq!(stats.average_time_ms(), 0.0);
        assert_eq!(stats.min_time_ms, None);

        stats.record(100, 10);
        stats.record(300, 30);

        assert_eq!(stats.generations, 2);
        assert_eq!(stats.total_tokens, 40);
        assert_eq!(stats.min_time_ms, Some(100));
        assert_eq!(stats.max_time_ms, 300);
        assert_eq!(stats.average_time_ms(), 200.0);
        assert_eq!(stats.tokens_per_second(), 100.0);

        stats.reset();
        assert_eq!(stats, PerformanceStats::default());
    }
}
