use std::{
    pin::Pin,
    task::{Context, Poll},
};

use tokio::time::{self, sleep, Duration, Instant};

use futures::{Future, Stream};

/// Milliseconds since the Unix epoch, wall-clock.
pub fn now() -> i64 {
    use chrono::Utc;
    Utc::now().timestamp_millis() as i64
}

/// Spawns the given future on the executor's worker pool.
pub fn spawn_local<F: Future<Output = ()> + 'static + Send>(f: F) {
    tokio::spawn(async { f.await });
}

/// Waits for `dur`.
pub async fn wait(dur: Duration) {
    sleep(dur).await;
}

/// Waits for `ms` milliseconds before returning.
pub async fn wait_ms(ms: u64) {
    wait(Duration::from_millis(ms)).await;
}

/// A periodic stream producing the wall-clock millisecond timestamp it fired at.
pub struct Interval {
    interval: time::Interval,
    next: i64,
    dur: i64,
}

impl Interval {
    /// Creates a stream of ticks starting at `next_millis` and firing every `dur`.
    pub fn new(next_millis: i64, dur: Duration) -> Self {
        let delay = (next_millis - now()).max(0) as u64;
        let next = Instant::now()
            .checked_add(Duration::from_millis(delay))
            .unwrap();
        Self {
            interval: time::interval_at(next, dur),
            next: next_millis,
            dur: dur.as_millis() as i64,
        }
    }

    /// Creates a stream of ticks starting now and firing every `dur`.
    pub fn new_interval(dur: Duration) -> Self {
        Self::new(now(), dur)
    }
}

impl Stream for Interval {
    type Item = i64;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.interval.poll_tick(cx) {
            Poll::Ready(_) => {
                let this = self.next;
                self.next += self.dur;
                Poll::Ready(Some(this))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
