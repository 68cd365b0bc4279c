//! Optional per-node health probe.
//!
//! A detached watcher thread that periodically stats a per-node clone
//! path and hands the list of nodes whose path has gone missing to a
//! caller-supplied drain callback. The probe shares no state with the
//! selection engine; it only talks to the drain hook.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error};

/// Default time between clone-path sweeps.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(120);

/// Handle to a running health probe thread.
pub struct HealthProbe {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl HealthProbe {
    /// Start the watcher. Every `interval` it stats
    /// `<root>/<node>/clone` for each node name and calls `drain` with
    /// the names that failed, if any.
    pub fn spawn<F>(
        root: PathBuf,
        node_names: Vec<String>,
        interval: Duration,
        drain: F,
    ) -> HealthProbe
    where
        F: Fn(&[String]) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            let mut last_test = Instant::now();
            while !stop_flag.load(Ordering::Relaxed) {
                if last_test.elapsed() >= interval {
                    debug!("running clone-path node state test");
                    let mut down_nodes = Vec::new();
                    for name in &node_names {
                        let clone_path = root.join(name).join("clone");
                        if std::fs::metadata(&clone_path).is_err() {
                            error!("stat {}: failed", clone_path.display());
                            down_nodes.push(name.clone());
                        }
                    }
                    if !down_nodes.is_empty() {
                        drain(&down_nodes);
                    }
                    last_test = Instant::now();
                }
                thread::sleep(Duration::from_secs(1));
            }
        });
        HealthProbe {
            stop,
            handle: Some(handle),
        }
    }

    /// Stop the watcher and join it.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("could not join health probe thread");
            }
        }
    }
}

impl Drop for HealthProbe {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_probe_reports_missing_paths() {
        let reported: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reported);
        let probe = HealthProbe::spawn(
            PathBuf::from("/nonexistent-probe-root"),
            vec!["n0".to_string()],
            Duration::from_millis(0),
            move |down| {
                sink.lock().unwrap().extend_from_slice(down);
            },
        );
        // The zero interval makes the first sweep immediate.
        thread::sleep(Duration::from_millis(100));
        probe.stop();
        assert!(reported.lock().unwrap().contains(&"n0".to_string()));
    }
}
