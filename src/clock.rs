use tokio::time::Instant;

/// Monotonic clock anchored at connection start. Header timestamps are 32-bit
///  microsecond values relative to this anchor, wrapping after ~71 minutes -
///  peers only ever compare timestamps over intervals far below that.
///
/// Built on `tokio::time::Instant` so that paused-time test runtimes drive it.
#[derive(Clone, Copy, Debug)]
pub struct Clock {
    start: Instant,
}

impl Clock {
    pub fn now() -> Clock {
        Clock { start: Instant::now() }
    }

    pub fn started_at(start: Instant) -> Clock {
        Clock { start }
    }

    /// microseconds since the anchor
    pub fn elapsed_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    /// wrapped 32-bit timestamp for header stamping
    pub fn timestamp(&self) -> u32 {
        self.elapsed_us() as u32
    }

    pub fn instant_at_us(&self, us: u64) -> Instant {
        self.start + std::time::Duration::from_micros(us)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::runtime::Builder;

    #[test]
    fn test_elapsed_advances_with_paused_time() {
        let rt = Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async {
            let clock = Clock::now();
            assert_eq!(clock.elapsed_us(), 0);

            tokio::time::sleep(Duration::from_micros(2500)).await;
            assert_eq!(clock.elapsed_us(), 2500);
            assert_eq!(clock.timestamp(), 2500);
        });
    }

    #[test]
    fn test_instant_at_us() {
        let rt = Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async {
            let clock = Clock::now();
            let t = clock.instant_at_us(1000);
            assert_eq!(t - Instant::now(), Duration::from_millis(1));
        });
    }
}
