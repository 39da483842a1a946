//! A small terminal animation shown while a request waits for response headers.

use std::io::{self, Write};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Frames cycled by the spinner.
pub const FRAMES: [&str; 4] = ["|", "/", "-", "\\"];

/// Default time between frames.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(120);

const CLEAR_LINE: &str = "\r\x1b[2K";

/// A running spinner task.
///
/// Call [`Spinner::stop`] to end the animation and wait for the task to finish.
/// Dropping a spinner without stopping it aborts the task, so the animation
/// never outlives the scope that started it.
pub struct Spinner {
    stop: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Spinner {
    /// Starts a spinner on stderr.
    pub fn start(interval: Duration, label: &str) -> Self {
        Self::start_with_writer(interval, label, io::stderr())
    }

    /// Starts a spinner that writes to `out`.
    pub fn start_with_writer<W>(interval: Duration, label: &str, mut out: W) -> Self
    where
        W: Write + Send + 'static,
    {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let label = label.to_string();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut frame = 0usize;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        let _ = write!(out, "\r{} {label}", FRAMES[frame % FRAMES.len()]);
                        let _ = out.flush();
                        frame += 1;
                    }
                }
            }
            let _ = write!(out, "{CLEAR_LINE}");
            let _ = out.flush();
        });
        Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        }
    }

    /// A spinner that draws nothing, for non-interactive output.
    pub fn disabled() -> Self {
        Self {
            stop: None,
            handle: None,
        }
    }

    /// Returns true if the spinner task is running.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signals the spinner to stop and waits until the line is cleared.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for Spinner {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
