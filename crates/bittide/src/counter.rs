use tokio::time::Instant;

/// Exponential Moving Average (EMA) smoothing factor
/// Higher values = more responsive to changes, lower values = smoother
const EMA_ALPHA: f64 = 0.3;

/// Counter of rates, used in downloaded and uploaded.
///
/// Only touched from inside the engine task, so it holds plain numbers.
#[derive(Debug, Clone)]
pub struct Counter {
    total_downloaded: u64,
    total_uploaded: u64,

    window_downloaded: u64,
    window_uploaded: u64,
    last_update: Instant,
    ema_download: f64,
    ema_upload: f64,
}

impl Default for Counter {
    fn default() -> Self {
        Self {
            total_downloaded: 0,
            total_uploaded: 0,
            window_downloaded: 0,
            window_uploaded: 0,
            last_update: Instant::now(),
            ema_download: 0.0,
            ema_upload: 0.0,
        }
    }
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record downloaded bytes
    pub fn record_download(&mut self, bytes: u64) {
        self.total_downloaded += bytes;
        self.window_downloaded += bytes;
    }

    /// Record uploaded bytes
    pub fn record_upload(&mut self, bytes: u64) {
        self.total_uploaded += bytes;
        self.window_uploaded += bytes;
    }

    pub fn total_download(&self) -> u64 {
        self.total_downloaded
    }

    pub fn total_upload(&self) -> u64 {
        self.total_uploaded
    }

    /// Download rate in bytes per second.
    pub fn download_rate(&self) -> f64 {
        self.ema_download
    }

    /// Upload rate in bytes per second.
    pub fn upload_rate(&self) -> f64 {
        self.ema_upload
    }

    pub fn update_rates(&mut self) {
        self.update_rates_at(Instant::now());
    }

    /// Update rates with EMA smoothing
    pub fn update_rates_at(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_update).as_secs_f64();

        if elapsed < 0.001 {
            return;
        }

        let downloaded = std::mem::take(&mut self.window_downloaded);
        let uploaded = std::mem::take(&mut self.window_uploaded);
        let dl_rate = downloaded as f64 / elapsed;
        let ul_rate = uploaded as f64 / elapsed;

        self.ema_download = if self.ema_download == 0.0 {
            dl_rate
        } else {
            EMA_ALPHA * dl_rate + (1.0 - EMA_ALPHA) * self.ema_download
        };

        self.ema_upload = if self.ema_upload == 0.0 {
            ul_rate
        } else {
            EMA_ALPHA * ul_rate + (1.0 - EMA_ALPHA) * self.ema_upload
        };

        self.last_update = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn counter_rates() {
        let mut counter = Counter::new();
        let start = counter.last_update;

        counter.record_download(1000);
        counter.record_upload(500);

        // first update sets the EMA to the instantaneous rate
        counter.update_rates_at(start + Duration::from_millis(100));
        assert_eq!(counter.download_rate().round(), 10_000.0);
        assert_eq!(counter.upload_rate().round(), 5_000.0);

        // same data, the rate stays put
        counter.record_download(1000);
        counter.record_upload(500);
        counter.update_rates_at(start + Duration::from_millis(200));
        assert_eq!(counter.download_rate().round(), 10_000.0);
        assert_eq!(counter.upload_rate().round(), 5_000.0);

        // double the data, EMA moves 30% of the way
        counter.record_download(2000);
        counter.record_upload(1000);
        counter.update_rates_at(start + Duration::from_millis(300));
        assert_eq!(counter.download_rate().round(), 13_000.0);
        assert_eq!(counter.upload_rate().round(), 6_500.0);

        assert_eq!(counter.total_download(), 4000);
        assert_eq!(counter.total_upload(), 2000);
    }

    #[test]
    fn ignores_tiny_windows() {
        let mut counter = Counter::new();
        let start = counter.last_update;
        counter.record_download(1000);
        counter.update_rates_at(start);
        assert_eq!(counter.download_rate(), 0.0);
        assert_eq!(counter.total_download(), 1000);
    }
}
