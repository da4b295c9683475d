// src/core/agents/capture.rs

//! Screenshot capture raced against a timeout.
//!
//! A normal attempt navigates and captures on its own task. If the timer wins,
//! the race is marked timed out and one fallback capture of whatever the tab
//! currently shows decides the outcome. Only one writer can move the race out
//! of `Pending`, and only the fallback can move it out of `TimedOut`, so a late
//! normal attempt cannot change a recorded result.

use crate::core::error::{ProbeError, ProbeResult};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// A browser tab the race drives.
pub trait RenderTab: Send + Sync {
    /// Navigates to `url`, waits `delay` for the page to settle, returns a PNG.
    fn navigate_and_capture(&self, url: &str, delay: Duration) -> BoxFuture<'_, ProbeResult<Vec<u8>>>;

    /// PNG of whatever is rendered right now.
    fn capture_current(&self) -> BoxFuture<'_, ProbeResult<Vec<u8>>>;

    fn close(&self) -> BoxFuture<'_, ()>;
}

/// Hands out fresh tabs.
pub trait Renderer: Send + Sync {
    fn open_tab(&self) -> BoxFuture<'_, ProbeResult<Arc<dyn RenderTab>>>;
}

/// Writes captured image bytes somewhere durable.
pub type Sink = Arc<dyn Fn(&[u8]) -> ProbeResult<()> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure(String),
}

impl Outcome {
    fn from_result(result: ProbeResult<()>) -> Self {
        match result {
            Ok(()) => Outcome::Success,
            Err(e) => Outcome::Failure(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaceState {
    Pending,
    Completed(Outcome),
    TimedOut,
    Fallback(Outcome),
}

impl RaceState {
    /// The terminal outcome, if one has been recorded.
    pub fn outcome(&self) -> Option<&Outcome> {
        match self {
            RaceState::Completed(o) | RaceState::Fallback(o) => Some(o),
            RaceState::Pending | RaceState::TimedOut => None,
        }
    }
}

#[derive(Debug)]
pub struct CaptureRace {
    state: Mutex<RaceState>,
}

impl Default for CaptureRace {
    fn default() -> Self {
        Self {
            state: Mutex::new(RaceState::Pending),
        }
    }
}

impl CaptureRace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the normal attempt's outcome. `record` runs under the state lock
    /// and only while the race is still pending. Returns whether it ran.
    pub fn complete_with(&self, record: impl FnOnce() -> Outcome) -> bool {
        let mut state = self.state.lock();
        if *state != RaceState::Pending {
            return false;
        }
        *state = RaceState::Completed(record());
        true
    }

    /// `Pending` → `TimedOut`. Returns false when the normal attempt already won.
    pub fn time_out(&self) -> bool {
        let mut state = self.state.lock();
        if *state != RaceState::Pending {
            return false;
        }
        *state = RaceState::TimedOut;
        true
    }

    /// Records the fallback's outcome; only valid after `time_out`.
    pub fn fallback_with(&self, record: impl FnOnce() -> Outcome) -> bool {
        let mut state = self.state.lock();
        if *state != RaceState::TimedOut {
            return false;
        }
        *state = RaceState::Fallback(record());
        true
    }

    pub fn state(&self) -> RaceState {
        self.state.lock().clone()
    }
}

/// Captures `url` in `tab`, bounded by `limit`, and returns the final state of
/// the race. The tab is closed on every path.
pub async fn run_capture_race(
    tab: Arc<dyn RenderTab>,
    url: &str,
    delay: Duration,
    limit: Duration,
    sink: Sink,
) -> RaceState {
    let race = Arc::new(CaptureRace::new());

    let mut normal = {
        let race = race.clone();
        let tab = tab.clone();
        let sink = sink.clone();
        let url = url.to_string();
        tokio::spawn(async move {
            let result = tab.navigate_and_capture(&url, delay).await;
            race.complete_with(|| Outcome::from_result(result.and_then(|png| sink(&png))))
        })
    };

    tokio::select! {
        joined = &mut normal => {
            if let Err(e) = joined {
                warn!(%url, error = %e, "Capture task ended abnormally.");
                race.complete_with(|| Outcome::Failure(e.to_string()));
            }
        }
        _ = sleep(limit) => {
            // The recorded outcome no longer depends on the normal attempt.
            normal.abort();
            if race.time_out() {
                debug!(%url, ?limit, "Capture timed out, taking fallback screenshot.");
                let result = match timeout(limit, tab.capture_current()).await {
                    Ok(result) => result,
                    Err(_) => Err(ProbeError::Timeout(limit)),
                };
                race.fallback_with(|| Outcome::from_result(result.and_then(|png| sink(&png))));
            }
        }
    }

    if timeout(limit, tab.close()).await.is_err() {
        warn!(%url, "Closing the capture tab timed out.");
    }
    race.state()
}

/// Opens a tab on `renderer` and runs the race in it. A tab that cannot be
/// opened in time is a failure.
pub async fn capture(renderer: &dyn Renderer, url: &str, delay: Duration, limit: Duration, sink: Sink) -> Outcome {
    let tab = match timeout(limit, renderer.open_tab()).await {
        Ok(Ok(tab)) => tab,
        Ok(Err(e)) => return Outcome::Failure(e.to_string()),
        Err(_) => return Outcome::Failure(ProbeError::Timeout(limit).to_string()),
    };
    let state = run_capture_race(tab, url, delay, limit, sink).await;
    state
        .outcome()
        .cloned()
        .unwrap_or_else(|| Outcome::Failure("capture ended without an outcome".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Copy)]
    enum Script {
        FastSuccess,
        FastFailure,
        /// Succeeds after the given delay.
        Slow(Duration),
        Hang,
    }

    struct FakeTab {
        script: Script,
        fallback_ok: bool,
        fallbacks: AtomicUsize,
        closes: AtomicUsize,
        normal_done: AtomicUsize,
    }

    impl FakeTab {
        fn new(script: Script, fallback_ok: bool) -> Arc<Self> {
            Arc::new(Self {
                script,
                fallback_ok,
                fallbacks: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
                normal_done: AtomicUsize::new(0),
            })
        }
    }

    impl RenderTab for FakeTab {
        fn navigate_and_capture(&self, _url: &str, _delay: Duration) -> BoxFuture<'_, ProbeResult<Vec<u8>>> {
            async move {
                let result = match self.script {
                    Script::FastSuccess => Ok(b"normal".to_vec()),
                    Script::FastFailure => Err(ProbeError::Render("net::ERR_CONNECTION_REFUSED".into())),
                    Script::Slow(d) => {
                        sleep(d).await;
                        Ok(b"late".to_vec())
                    }
                    Script::Hang => futures::future::pending().await,
                };
                self.normal_done.fetch_add(1, Ordering::SeqCst);
                result
            }
            .boxed()
        }

        fn capture_current(&self) -> BoxFuture<'_, ProbeResult<Vec<u8>>> {
            async move {
                self.fallbacks.fetch_add(1, Ordering::SeqCst);
                if self.fallback_ok {
                    Ok(b"fallback".to_vec())
                } else {
                    Err(ProbeError::Render("blank".into()))
                }
            }
            .boxed()
        }

        fn close(&self) -> BoxFuture<'_, ()> {
            async move {
                self.closes.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        }
    }

    fn recording_sink() -> (Sink, Arc<Mutex<Vec<Vec<u8>>>>) {
        let written = Arc::new(Mutex::new(Vec::new()));
        let sink_written = written.clone();
        let sink: Sink = Arc::new(move |png: &[u8]| -> ProbeResult<()> {
            sink_written.lock().push(png.to_vec());
            Ok(())
        });
        (sink, written)
    }

    const LIMIT: Duration = Duration::from_millis(100);

    #[test]
    fn test_state_machine_single_writer() {
        let race = CaptureRace::new();
        assert!(race.complete_with(|| Outcome::Success));
        assert!(!race.time_out());
        assert!(!race.fallback_with(|| Outcome::Failure("x".into())));
        assert_eq!(race.state(), RaceState::Completed(Outcome::Success));

        let race = CaptureRace::new();
        assert!(!race.fallback_with(|| Outcome::Success));
        assert!(race.time_out());
        assert!(!race.complete_with(|| Outcome::Success));
        assert!(race.fallback_with(|| Outcome::Failure("blank".into())));
        assert!(!race.fallback_with(|| Outcome::Success));
        assert_eq!(race.state(), RaceState::Fallback(Outcome::Failure("blank".into())));
    }

    #[tokio::test]
    async fn test_fast_success() {
        let tab = FakeTab::new(Script::FastSuccess, true);
        let (sink, written) = recording_sink();
        let state = run_capture_race(tab.clone(), "http://a/", Duration::ZERO, LIMIT, sink).await;
        assert_eq!(state, RaceState::Completed(Outcome::Success));
        assert_eq!(*written.lock(), vec![b"normal".to_vec()]);
        assert_eq!(tab.fallbacks.load(Ordering::SeqCst), 0);
        assert_eq!(tab.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fast_failure() {
        let tab = FakeTab::new(Script::FastFailure, true);
        let (sink, written) = recording_sink();
        let state = run_capture_race(tab.clone(), "http://a/", Duration::ZERO, LIMIT, sink).await;
        assert!(matches!(state, RaceState::Completed(Outcome::Failure(_))));
        assert!(written.lock().is_empty());
        assert_eq!(tab.fallbacks.load(Ordering::SeqCst), 0);
        assert_eq!(tab.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_write_failure_counts_as_failure() {
        let tab = FakeTab::new(Script::FastSuccess, true);
        let sink: Sink = Arc::new(|_: &[u8]| -> ProbeResult<()> { Err(ProbeError::Io(std::io::Error::other("disk full"))) });
        let state = run_capture_race(tab, "http://a/", Duration::ZERO, LIMIT, sink).await;
        assert!(matches!(state, RaceState::Completed(Outcome::Failure(_))));
    }

    #[tokio::test]
    async fn test_slow_attempt_is_cancelled_after_timeout() {
        let tab = FakeTab::new(Script::Slow(LIMIT * 3), true);
        let (sink, written) = recording_sink();
        let state = run_capture_race(tab.clone(), "http://a/", Duration::ZERO, LIMIT, sink).await;
        assert_eq!(state, RaceState::Fallback(Outcome::Success));

        // The abandoned attempt is cancelled; it never writes or flips the result.
        sleep(LIMIT * 4).await;
        assert_eq!(tab.normal_done.load(Ordering::SeqCst), 0);
        assert_eq!(*written.lock(), vec![b"fallback".to_vec()]);
        assert_eq!(tab.fallbacks.load(Ordering::SeqCst), 1);
        assert_eq!(tab.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_hang_runs_fallback_once() {
        let tab = FakeTab::new(Script::Hang, false);
        let (sink, written) = recording_sink();
        let state = run_capture_race(tab.clone(), "http://a/", Duration::ZERO, LIMIT, sink).await;
        assert!(matches!(state, RaceState::Fallback(Outcome::Failure(_))));
        assert_eq!(tab.fallbacks.load(Ordering::SeqCst), 1);
        assert_eq!(tab.closes.load(Ordering::SeqCst), 1);
        assert!(written.lock().is_empty());
    }

    struct FakeRenderer {
        tab: Option<Arc<FakeTab>>,
    }

    impl Renderer for FakeRenderer {
        fn open_tab(&self) -> BoxFuture<'_, ProbeResult<Arc<dyn RenderTab>>> {
            async move {
                match &self.tab {
                    Some(tab) => Ok(tab.clone() as Arc<dyn RenderTab>),
                    None => futures::future::pending().await,
                }
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_every_script_yields_exactly_one_outcome() {
        let scripts = [
            Script::FastSuccess,
            Script::FastFailure,
            Script::Slow(LIMIT * 2),
            Script::Hang,
        ];
        for script in scripts {
            for fallback_ok in [true, false] {
                let tab = FakeTab::new(script, fallback_ok);
                let (sink, written) = recording_sink();
                let state = run_capture_race(tab.clone(), "http://a/", Duration::ZERO, LIMIT, sink).await;
                sleep(LIMIT * 2).await;

                let outcome = state.outcome().expect("race ended without an outcome");
                assert_eq!(*outcome == Outcome::Success, written.lock().len() == 1);
                assert!(written.lock().len() <= 1);
                assert_eq!(tab.closes.load(Ordering::SeqCst), 1);
            }
        }
    }

    #[tokio::test]
    async fn test_capture_through_renderer() {
        let renderer = FakeRenderer {
            tab: Some(FakeTab::new(Script::FastSuccess, true)),
        };
        let (sink, written) = recording_sink();
        let outcome = capture(&renderer, "http://a/", Duration::ZERO, LIMIT, sink).await;
        assert_eq!(outcome, Outcome::Success);
        assert_eq!(written.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_tab_that_never_opens_is_a_failure() {
        let renderer = FakeRenderer { tab: None };
        let (sink, written) = recording_sink();
        let outcome = capture(&renderer, "http://a/", Duration::ZERO, LIMIT, sink).await;
        assert_ne!(outcome, Outcome::Success);
        assert!(written.lock().is_empty());
    }
}
