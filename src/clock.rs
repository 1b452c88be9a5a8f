use std::time::Duration;

/// Blocking pause between polls and retries.
///
/// Production code uses [`ThreadSleep`]; tests substitute a recorder so
/// polling loops run without real delays.
pub trait Sleep {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleep;

impl Sleep for ThreadSleep {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}
