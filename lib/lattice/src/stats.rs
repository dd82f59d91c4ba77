//! Per-request-type timing. Durations are sampled when a request finishes
//! and accumulated in a histogram keyed by the request code.

use hashbrown::HashMap;

/// Identifies a request type for stats purposes.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct RequestType(pub u16);

#[derive(Debug, Default, Copy, Clone)]
struct TimeHistogram {
    count: u64,
    total_time_micros: u64,
}

pub struct RequestStats {
    histograms: HashMap<RequestType, TimeHistogram>,
}

impl RequestStats {
    pub fn new() -> RequestStats {
        RequestStats {
            histograms: HashMap::new(),
        }
    }

    /// Records one completed request. `start_micros` must not lie in the
    /// future relative to `now_micros`; that is a programming error.
    pub fn request_finished(&mut self, request_type: RequestType, start_micros: u64, now_micros: u64) {
        if start_micros > now_micros {
            panic!(
                "Request start time {} lies after completion time {}",
                start_micros, now_micros
            );
        }

        let histogram = self
            .histograms
            .entry(request_type)
            .or_insert_with(TimeHistogram::default);

        histogram.count += 1;
        histogram.total_time_micros += now_micros - start_micros;
    }

    pub fn count(&self, request_type: RequestType) -> u64 {
        self.histograms.get(&request_type).map_or(0, |h| h.count)
    }

    pub fn total_time_micros(&self, request_type: RequestType) -> u64 {
        self.histograms
            .get(&request_type)
            .map_or(0, |h| h.total_time_micros)
    }

    pub fn mean_time_micros(&self, request_type: RequestType) -> u64 {
        match self.histograms.get(&request_type) {
            Some(histogram) if histogram.count > 0 => histogram.total_time_micros / histogram.count,
            _ => 0,
        }
    }

    /// True when the type has been observed at least once since construction,
    /// regardless of intervening `clear` calls.
    pub fn request_has_occurred(&self, request_type: RequestType) -> bool {
        self.histograms.contains_key(&request_type)
    }

    /// Zeroes all histograms but keeps their keys.
    pub fn clear(&mut self) {
        for histogram in self.histograms.values_mut() {
            *histogram = TimeHistogram::default();
        }
    }
}
