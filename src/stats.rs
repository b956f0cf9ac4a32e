use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics collected across the download and aggregation passes
#[derive(Default, Debug)]
pub struct PipelineStats {
    pub chunks_fetched: AtomicU64,
    pub chunks_cached: AtomicU64,
    pub fetch_retries: AtomicU64,
    pub revisions_counted: AtomicU64,
    pub records_malformed: AtomicU64,
    pub records_out_of_range: AtomicU64,
    pub revisions_missing: AtomicU64,
    pub slices_computed: AtomicU64,
    pub slices_cached: AtomicU64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_chunks_fetched(&self) {
        self.chunks_fetched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_chunks_cached(&self) {
        self.chunks_cached.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_retries(&self) {
        self.fetch_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_counted(&self, count: u64) {
        self.revisions_counted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_malformed(&self, count: u64) {
        self.records_malformed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_out_of_range(&self, count: u64) {
        self.records_out_of_range.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_missing(&self, count: u64) {
        self.revisions_missing.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_slices_computed(&self) {
        self.slices_computed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_slices_cached(&self) {
        self.slices_cached.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fetched(&self) -> u64 {
        self.chunks_fetched.load(Ordering::Relaxed)
    }

    pub fn cached(&self) -> u64 {
        self.chunks_cached.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.fetch_retries.load(Ordering::Relaxed)
    }

    pub fn counted(&self) -> u64 {
        self.revisions_counted.load(Ordering::Relaxed)
    }

    pub fn malformed(&self) -> u64 {
        self.records_malformed.load(Ordering::Relaxed)
    }

    pub fn out_of_range(&self) -> u64 {
        self.records_out_of_range.load(Ordering::Relaxed)
    }

    pub fn missing(&self) -> u64 {
        self.revisions_missing.load(Ordering::Relaxed)
    }

    pub fn slices_computed(&self) -> u64 {
        self.slices_computed.load(Ordering::Relaxed)
    }

    pub fn slices_cached(&self) -> u64 {
        self.slices_cached.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values_are_zero() {
        let stats = PipelineStats::new();
        assert_eq!(stats.fetched(), 0);
        assert_eq!(stats.cached(), 0);
        assert_eq!(stats.retries(), 0);
        assert_eq!(stats.counted(), 0);
        assert_eq!(stats.malformed(), 0);
        assert_eq!(stats.out_of_range(), 0);
        assert_eq!(stats.missing(), 0);
        assert_eq!(stats.slices_computed(), 0);
        assert_eq!(stats.slices_cached(), 0);
    }

    #[test]
    fn chunk_counters() {
        let stats = PipelineStats::new();
        stats.inc_chunks_fetched();
        stats.inc_chunks_fetched();
        stats.inc_chunks_cached();
        stats.inc_retries();
        assert_eq!(stats.fetched(), 2);
        assert_eq!(stats.cached(), 1);
        assert_eq!(stats.retries(), 1);
    }

    #[test]
    fn record_counters() {
        let stats = PipelineStats::new();
        stats.add_counted(40);
        stats.add_counted(8);
        stats.add_malformed(1);
        stats.add_out_of_range(12);
        stats.add_missing(3);
        assert_eq!(stats.counted(), 48);
        assert_eq!(stats.malformed(), 1);
        assert_eq!(stats.out_of_range(), 12);
        assert_eq!(stats.missing(), 3);
    }

    #[test]
    fn counters_are_shared_across_threads() {
        let stats = std::sync::Arc::new(PipelineStats::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let stats = stats.clone();
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        stats.inc_slices_computed();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(stats.slices_computed(), 1000);
    }
}
