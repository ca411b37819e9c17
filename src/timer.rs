use rand::Rng;
use std::time::Duration;

/// Fraction of the base delay that jitter may add or remove.
const JITTER_RATIO: f64 = 0.1;

/// Randomizes `base` within +/-10% so nodes started together drift apart.
pub fn jitter(base: Duration) -> Duration {
    let base_ms = base.as_millis() as u64;
    let spread = (base_ms as f64 * JITTER_RATIO) as u64;
    if spread == 0 {
        return base;
    }
    let mut rng = rand::thread_rng();
    let ms = rng.gen_range(base_ms - spread..=base_ms + spread);
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_window() {
        let base = Duration::from_secs(30);
        for _ in 0..1_000 {
            let d = jitter(base);
            assert!(d >= Duration::from_secs(27), "{:?} too short", d);
            assert!(d <= Duration::from_secs(33), "{:?} too long", d);
        }
    }

    #[test]
    fn jitter_actually_varies() {
        let base = Duration::from_secs(30);
        let first = jitter(base);
        assert!((0..100).any(|_| jitter(base) != first));
    }

    #[test]
    fn tiny_delays_pass_through() {
        assert_eq!(jitter(Duration::ZERO), Duration::ZERO);
        assert_eq!(jitter(Duration::from_millis(5)), Duration::from_millis(5));
    }
}
