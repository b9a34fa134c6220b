use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const BYTES_PER_KB: u64 = 1024;

/// Size of the slices a rate-limited body is drained in. Small enough that
/// pacing stays smooth, large enough to keep syscall overhead down.
pub(crate) const DRAIN_BLOCK_SIZE: usize = 256 * 1024;

#[derive(Debug)]
struct LimiterState {
    start: Instant,
    bytes_consumed: u128,
}

/// Process-local byte-rate limiter shared by multiple call sites.
///
/// Pacing is elapsed-time based: after consuming N bytes the caller sleeps
/// until N / rate seconds have passed since the limiter was created, which
/// smooths bursts without a timer thread.
#[derive(Debug)]
pub struct ByteRateLimiter {
    bytes_per_sec: u64,
    state: Mutex<LimiterState>,
}

impl ByteRateLimiter {
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            bytes_per_sec,
            state: Mutex::new(LimiterState {
                start: Instant::now(),
                bytes_consumed: 0,
            }),
        }
    }

    pub fn consume(&self, bytes: usize) {
        if bytes == 0 || self.bytes_per_sec == 0 {
            return;
        }

        let sleep_duration = {
            let mut state = match self.state.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            state.bytes_consumed = state.bytes_consumed.saturating_add(bytes as u128);

            let elapsed_secs = state.start.elapsed().as_secs_f64();
            let expected_secs = state.bytes_consumed as f64 / self.bytes_per_sec as f64;
            if expected_secs > elapsed_secs {
                Some(Duration::from_secs_f64(expected_secs - elapsed_secs))
            } else {
                None
            }
        }; // lock released before sleeping

        if let Some(d) = sleep_duration {
            std::thread::sleep(d);
        }
    }
}

/// Read adaptor that applies an optional shared byte-rate limiter.
pub struct LimitedReader<'a, R> {
    inner: R,
    limiter: Option<&'a ByteRateLimiter>,
}

impl<'a, R> LimitedReader<'a, R> {
    pub fn new(inner: R, limiter: Option<&'a ByteRateLimiter>) -> Self {
        Self { inner, limiter }
    }
}

impl<R: Read> Read for LimitedReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        if let Some(limiter) = self.limiter {
            limiter.consume(n);
        }
        Ok(n)
    }
}

/// The per-direction transport limiters of one vault client.
///
/// A requested value of 0 means "unlimited" and is resolved once, at
/// construction time, against the configured default for that direction;
/// the resolved limiters are then shared across credential refreshes.
#[derive(Debug, Clone, Default)]
pub struct TransportLimits {
    pub upload: Option<Arc<ByteRateLimiter>>,
    pub download: Option<Arc<ByteRateLimiter>>,
}

impl TransportLimits {
    pub fn resolve(
        requested_upload_kb: u64,
        requested_download_kb: u64,
        default_upload_kb: u64,
        default_download_kb: u64,
    ) -> Self {
        Self {
            upload: limiter_for(resolve_rate_kb(requested_upload_kb, default_upload_kb)),
            download: limiter_for(resolve_rate_kb(requested_download_kb, default_download_kb)),
        }
    }
}

fn resolve_rate_kb(requested_kb: u64, default_kb: u64) -> u64 {
    if requested_kb == 0 {
        default_kb
    } else {
        requested_kb
    }
}

fn limiter_for(rate_kb: u64) -> Option<Arc<ByteRateLimiter>> {
    if rate_kb == 0 {
        None
    } else {
        Some(Arc::new(ByteRateLimiter::new(rate_kb * BYTES_PER_KB)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_requested_falls_back_to_config_default() {
        assert_eq!(resolve_rate_kb(0, 512), 512);
        assert_eq!(resolve_rate_kb(256, 512), 256);
        assert_eq!(resolve_rate_kb(0, 0), 0);
    }

    #[test]
    fn unlimited_directions_carry_no_limiter() {
        let limits = TransportLimits::resolve(0, 0, 0, 0);
        assert!(limits.upload.is_none());
        assert!(limits.download.is_none());

        let limits = TransportLimits::resolve(128, 0, 0, 64);
        assert!(limits.upload.is_some());
        assert!(limits.download.is_some());
    }

    #[test]
    fn limited_reader_counts_through_limiter() {
        // A generous rate so the test never actually sleeps.
        let limiter = ByteRateLimiter::new(u64::MAX / 2);
        let data = vec![7u8; 4096];
        let mut reader = LimitedReader::new(&data[..], Some(&limiter));

        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);

        let state = limiter.state.lock().unwrap();
        assert_eq!(state.bytes_consumed, 4096);
    }

    #[test]
    fn limiter_paces_consumption() {
        // 1 MiB/s, consume 100 KiB => expected elapsed ~0.1s.
        let limiter = ByteRateLimiter::new(1024 * 1024);
        let start = Instant::now();
        limiter.consume(100 * 1024);
        limiter.consume(1);
        assert!(start.elapsed() >= Duration::from_millis(80));
    }
}
