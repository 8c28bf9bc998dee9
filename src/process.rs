//! Backend process supervisor
//!
//! Backends launch lazily on the first proxied request. A single
//! process-global launch mutex makes child creation single-flight: at most
//! one fork+exec is in progress at any moment, which also serializes the
//! port counter. Requests that queued on the mutex re-check the running slot
//! before launching so a site never gets two children.
//!
//! Teardown is bleed-out: whoever clears the running slot owns the run and
//! polls its in-flight counter until it drains (or the window expires), then
//! kills and reaps the child.

use crate::registry::Site;
use parking_lot::Mutex;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{error, info, warn};

/// Loopback ports are drawn from a counter starting above this value.
const PORT_BASE: u32 = 15000;

/// How long an errored run blocks relaunching.
pub const ERROR_RETRY: Duration = Duration::from_secs(5);

/// Window after spawn during which the proxy retries backend dials.
pub const WARMUP: Duration = Duration::from_secs(20);

/// Drain poll cadence and iteration cap: at most 100 x 100 ms before SIGKILL.
const DRAIN_POLL: Duration = Duration::from_millis(100);
const DRAIN_MAX_TRIES: u32 = 100;

/// One launched (or failed-to-launch) backend.
pub struct RunningSite {
    /// Random 31-bit tag for log correlation and the pid file name.
    pub tag: u32,
    /// `localhost:<port>` the backend was told to listen on.
    pub addr: String,
    /// Wall-clock of the launch attempt, re-stamped after the spawn returns
    /// so the warm-up window measures from when the caller continues.
    pub start: Instant,
    error: AtomicBool,
    working: AtomicI64,
    child: Mutex<Option<Child>>,
}

impl RunningSite {
    pub fn error(&self) -> bool {
        self.error.load(Ordering::Relaxed)
    }

    /// In-flight requests currently proxied to this backend.
    pub fn working(&self) -> i64 {
        self.working.load(Ordering::SeqCst)
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.lock().as_ref().and_then(|c| c.id())
    }

    pub fn pid_file(&self) -> String {
        format!("{}.pid", self.tag)
    }

    /// Wrap an externally managed backend address (tests drive the proxy
    /// data path against in-process listeners through this).
    #[cfg(test)]
    pub(crate) fn adopted(addr: String) -> Arc<Self> {
        Arc::new(Self {
            tag: rand::random::<u32>() & 0x7fff_ffff,
            addr,
            start: Instant::now(),
            error: AtomicBool::new(false),
            working: AtomicI64::new(0),
            child: Mutex::new(None),
        })
    }

    /// Like [`adopted`](Self::adopted), with the start stamp shifted into
    /// the past so the warm-up window is already over.
    #[cfg(test)]
    pub(crate) fn adopted_aged(addr: String, age: Duration) -> Arc<Self> {
        Arc::new(Self {
            tag: rand::random::<u32>() & 0x7fff_ffff,
            addr,
            start: Instant::now().checked_sub(age).unwrap_or_else(Instant::now),
            error: AtomicBool::new(false),
            working: AtomicI64::new(0),
            child: Mutex::new(None),
        })
    }
}

/// RAII increment of a run's in-flight counter; decrements on every exit
/// path, including mid-stream drops of the response body.
pub struct WorkingGuard {
    run: Arc<RunningSite>,
}

impl WorkingGuard {
    pub fn new(run: Arc<RunningSite>) -> Self {
        run.working.fetch_add(1, Ordering::SeqCst);
        Self { run }
    }
}

impl Drop for WorkingGuard {
    fn drop(&mut self) {
        self.run.working.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Launches and tears down backends. One instance per server.
pub struct Supervisor {
    /// Held across the whole launch sequence: port allocation, spawn, pid
    /// file write, publication. The only lock in the crate that spans I/O.
    launch_lock: tokio::sync::Mutex<()>,
    next_port: AtomicU32,
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            launch_lock: tokio::sync::Mutex::new(()),
            next_port: AtomicU32::new(PORT_BASE),
        }
    }

    /// Return the site's backend, launching one if needed.
    ///
    /// An errored run younger than [`ERROR_RETRY`] is returned as-is (the
    /// caller answers 500); older ones are cleared and replaced. The
    /// double-check after acquiring the launch mutex closes the window where
    /// a request that queued behind another launch would start a second
    /// child.
    pub async fn ensure_running(&self, site: &Arc<Site>) -> Arc<RunningSite> {
        if let Some(run) = site.running.get() {
            if !run.error() {
                return run;
            }
            if run.start.elapsed() < ERROR_RETRY {
                return run;
            }
            info!(site = %site.id, run = run.tag, "removing errored app");
            site.running.clear_if(&run);
        }

        let _launching = self.launch_lock.lock().await;
        if let Some(run) = site.running.get() {
            return run;
        }
        let run = self.launch(site).await;
        site.running.publish(run.clone());
        run
    }

    async fn launch(&self, site: &Arc<Site>) -> Arc<RunningSite> {
        info!(site = %site.id, version = site.version, hosts = ?site.hostnames, "launching app");

        let tag = rand::random::<u32>() & 0x7fff_ffff;
        let port = self.next_port.fetch_add(1, Ordering::SeqCst) + 1;
        let addr = format!("localhost:{}", port);

        let failed = |err: anyhow::Error| {
            warn!(site = %site.id, run = tag, error = %err, "launch error");
            Arc::new(RunningSite {
                tag,
                addr: addr.clone(),
                start: Instant::now(),
                error: AtomicBool::new(true),
                working: AtomicI64::new(0),
                child: Mutex::new(None),
            })
        };

        let mut child = match spawn_child(site, port) {
            Ok(child) => child,
            Err(err) => return failed(err),
        };
        let pid = child.id().unwrap_or_default();

        if let Err(err) = tokio::fs::write(format!("{}.pid", tag), pid.to_string()).await {
            let _ = child.kill().await;
            return failed(anyhow::Error::new(err).context("writing pid file"));
        }

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(read_child_log(stdout, site.id.clone(), tag));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(read_child_log(stderr, site.id.clone(), tag));
        }

        info!(site = %site.id, run = tag, pid, port, "launched app");

        Arc::new(RunningSite {
            tag,
            addr,
            // Stamp after the spawn so the warm-up window starts when the
            // caller gets to continue, not when launching began.
            start: Instant::now(),
            error: AtomicBool::new(false),
            working: AtomicI64::new(0),
            child: Mutex::new(Some(child)),
        })
    }

    /// Bleed out and kill a backend.
    ///
    /// Clears the site's running slot if it still points at `run`; the call
    /// that clears it owns teardown and schedules the drain task. Everyone
    /// else returns immediately (the run is already orphaned).
    pub fn stop(&self, site: &Arc<Site>, run: &Arc<RunningSite>, err: Option<anyhow::Error>) {
        if let Some(err) = err {
            info!(site = %site.id, run = run.tag, error = %err, "stopping app after error");
        }

        if !site.running.clear_if(run) {
            return;
        }

        let site_id = site.id.clone();
        let run = run.clone();
        tokio::spawn(async move {
            drain_and_kill(site_id, run).await;
        });
    }

    /// Tear down every live backend (server shutdown).
    pub fn stop_all(&self, sites: &[Arc<Site>]) {
        for site in sites {
            if let Some(run) = site.running.get() {
                self.stop(site, &run, None);
            }
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// Substitute `${PORT}` and whitespace-split the command template into argv.
fn build_argv(command: &str, port: u32) -> anyhow::Result<Vec<String>> {
    let substituted = command.replace("${PORT}", &port.to_string());
    let argv: Vec<String> = substituted.split_whitespace().map(str::to_string).collect();
    if argv.is_empty() {
        anyhow::bail!("empty command");
    }
    Ok(argv)
}

fn spawn_child(site: &Site, port: u32) -> anyhow::Result<Child> {
    let argv = build_argv(&site.command, port)?;

    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .current_dir(&site.data)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    for entry in &site.env {
        if let Some((key, value)) = entry.split_once('=') {
            cmd.env(key, value);
        }
    }
    cmd.env("PORT", port.to_string());

    Ok(cmd.spawn()?)
}

/// Pipe a child's output line-by-line into the server log.
async fn read_child_log<R: AsyncRead + Unpin>(stream: R, site: String, tag: u32) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!(site = %site, run = tag, "{}", line),
            Ok(None) => return,
            Err(err) => {
                warn!(site = %site, run = tag, error = %err, "reading app output");
                return;
            }
        }
    }
}

async fn drain_and_kill(site_id: String, run: Arc<RunningSite>) {
    let mut tries = 0u32;
    loop {
        let working = run.working();
        assert!(working >= 0, "in-flight counter went negative: {}", working);
        if working == 0 {
            break;
        }
        tries += 1;
        if tries > DRAIN_MAX_TRIES {
            warn!(site = %site_id, run = run.tag, working, "force stopping app");
            break;
        }
        tokio::time::sleep(DRAIN_POLL).await;
    }

    let child = run.child.lock().take();
    let Some(mut child) = child else {
        return;
    };
    let pid = child.id().unwrap_or_default();
    if let Err(err) = child.start_kill() {
        warn!(site = %site_id, run = run.tag, pid, error = %err, "killing app");
    }
    match child.wait().await {
        Ok(status) => info!(site = %site_id, run = run.tag, pid, %status, "stopped app"),
        Err(err) => error!(site = %site_id, run = run.tag, pid, error = %err, "reaping app"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RunningSlot;
    use std::path::PathBuf;

    fn site_with_command(id: &str, command: &str) -> Arc<Site> {
        Arc::new(Site {
            id: id.to_string(),
            version: 1,
            hostnames: vec!["example.com".to_string()],
            paths: vec!["/".to_string()],
            command: command.to_string(),
            env: Vec::new(),
            data: PathBuf::from("/tmp"),
            cert_id: Vec::new(),
            https_only: false,
            running: RunningSlot::new(),
        })
    }

    fn sleeper_site(id: &str) -> Arc<Site> {
        site_with_command(id, "sleep 60")
    }

    fn cleanup(run: &RunningSite) {
        let _ = std::fs::remove_file(run.pid_file());
    }

    #[test]
    fn argv_substitution_and_split() {
        let argv = build_argv("node server.js --port ${PORT}", 15001).unwrap();
        assert_eq!(argv, vec!["node", "server.js", "--port", "15001"]);

        // Every occurrence is replaced.
        let argv = build_argv("app ${PORT} ${PORT}", 15002).unwrap();
        assert_eq!(argv, vec!["app", "15002", "15002"]);

        assert!(build_argv("", 15003).is_err());
        assert!(build_argv("   ", 15003).is_err());
    }

    #[test]
    fn ports_are_monotonic() {
        let supervisor = Supervisor::new();
        let a = supervisor.next_port.fetch_add(1, Ordering::SeqCst) + 1;
        let b = supervisor.next_port.fetch_add(1, Ordering::SeqCst) + 1;
        assert_eq!(a, 15001);
        assert_eq!(b, 15002);
    }

    #[test]
    fn working_guard_counts() {
        let run = RunningSite::adopted("localhost:1".to_string());
        assert_eq!(run.working(), 0);
        let g1 = WorkingGuard::new(run.clone());
        let g2 = WorkingGuard::new(run.clone());
        assert_eq!(run.working(), 2);
        drop(g1);
        assert_eq!(run.working(), 1);
        drop(g2);
        assert_eq!(run.working(), 0);
    }

    #[tokio::test]
    async fn launch_failure_marks_error_and_backs_off() {
        let supervisor = Supervisor::new();
        let site = site_with_command("broken", "hatchery-no-such-binary-3f9a");

        let run = supervisor.ensure_running(&site).await;
        assert!(run.error());
        assert!(site.running.get().is_some());

        // Within the retry window the same errored run is handed back.
        let again = supervisor.ensure_running(&site).await;
        assert!(Arc::ptr_eq(&run, &again));
        cleanup(&run);
    }

    #[tokio::test]
    async fn ten_concurrent_first_requests_launch_once() {
        let supervisor = Arc::new(Supervisor::new());
        let site = sleeper_site("single-flight");

        let mut handles = Vec::new();
        for _ in 0..10 {
            let supervisor = supervisor.clone();
            let site = site.clone();
            handles.push(tokio::spawn(async move {
                supervisor.ensure_running(&site).await
            }));
        }

        let mut runs = Vec::new();
        for handle in handles {
            runs.push(handle.await.unwrap());
        }

        for run in &runs {
            assert!(Arc::ptr_eq(run, &runs[0]));
        }
        assert!(!runs[0].error());
        assert!(runs[0].pid().is_some());

        supervisor.stop(&site, &runs[0], None);
        tokio::time::sleep(Duration::from_millis(300)).await;
        cleanup(&runs[0]);
    }

    #[tokio::test]
    async fn relaunch_gets_a_fresh_port() {
        let supervisor = Arc::new(Supervisor::new());
        let site = sleeper_site("fresh-port");

        let first = supervisor.ensure_running(&site).await;
        supervisor.stop(&site, &first, None);
        assert!(site.running.get().is_none());

        let second = supervisor.ensure_running(&site).await;
        assert!(!Arc::ptr_eq(&first, &second));
        assert_ne!(first.addr, second.addr);

        supervisor.stop(&site, &second, None);
        tokio::time::sleep(Duration::from_millis(300)).await;
        cleanup(&first);
        cleanup(&second);
    }

    #[tokio::test]
    async fn stop_is_owned_by_whoever_clears_the_slot() {
        let supervisor = Arc::new(Supervisor::new());
        let site = sleeper_site("stop-owner");

        let run = supervisor.ensure_running(&site).await;
        supervisor.stop(&site, &run, None);
        assert!(site.running.get().is_none());

        // A second stop for the same run is a no-op: the slot no longer
        // points at it and the first caller owns teardown.
        supervisor.stop(&site, &run, Some(anyhow::anyhow!("late loser")));
        tokio::time::sleep(Duration::from_millis(300)).await;
        cleanup(&run);
    }

    #[tokio::test]
    async fn drain_waits_for_in_flight_requests() {
        let supervisor = Arc::new(Supervisor::new());
        let site = sleeper_site("bleed-out");

        let run = supervisor.ensure_running(&site).await;
        let guard = WorkingGuard::new(run.clone());

        supervisor.stop(&site, &run, None);
        assert!(site.running.get().is_none());

        // The child survives while a request is in flight.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(run.pid().is_some());

        // Once the request finishes, the drain task kills and reaps.
        drop(guard);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(run.child.lock().is_none());
        cleanup(&run);
    }

    #[tokio::test]
    async fn pid_file_is_written() {
        let supervisor = Arc::new(Supervisor::new());
        let site = sleeper_site("pid-file");

        let run = supervisor.ensure_running(&site).await;
        let written = std::fs::read_to_string(run.pid_file()).unwrap();
        assert_eq!(written, run.pid().unwrap().to_string());

        supervisor.stop(&site, &run, None);
        tokio::time::sleep(Duration::from_millis(300)).await;
        cleanup(&run);
    }
}
