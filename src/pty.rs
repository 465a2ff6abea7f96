//! PTY process capability.
//!
//! The session manager only talks to [`PtySpawner`] and [`PtyProcess`]; the
//! portable-pty backed implementation lives here alongside them. Output and
//! exit are delivered in order on one channel per process so that the final
//! output chunk is always observed before the exit event.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const PTY_READ_BUFFER_SIZE: usize = 4096;
const PTY_WRITE_CHUNK_SIZE: usize = 512;
const PTY_INPUT_CHANNEL_SIZE: usize = 1024;

#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Used for log prefixes only.
    pub label: String,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: String,
    pub cols: u16,
    pub rows: u16,
    /// Complete environment; nothing is inherited implicitly.
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
}

impl ExitInfo {
    /// Reported to clients when a session is killed explicitly.
    pub fn killed() -> Self {
        Self {
            exit_code: None,
            signal: Some("SIGKILL".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    Data(String),
    Exit(ExitInfo),
}

pub trait PtyProcess: Send + Sync {
    fn pid(&self) -> Option<u32>;
    fn write(&self, data: &[u8]) -> std::io::Result<()>;
    fn resize(&self, cols: u16, rows: u16) -> std::io::Result<()>;
    /// Forceful termination; no grace period.
    fn kill(&self) -> std::io::Result<()>;
}

pub struct SpawnedPty {
    pub process: Box<dyn PtyProcess>,
    pub events: mpsc::UnboundedReceiver<PtyEvent>,
}

pub trait PtySpawner: Send + Sync {
    fn spawn(&self, request: SpawnRequest) -> anyhow::Result<SpawnedPty>;
}

// =============================================================================
// portable-pty backend
// =============================================================================

#[derive(Debug, Default, Clone, Copy)]
pub struct NativePtySpawner;

impl PtySpawner for NativePtySpawner {
    fn spawn(&self, request: SpawnRequest) -> anyhow::Result<SpawnedPty> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: request.rows,
                cols: request.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("failed to open pty")?;

        let mut cmd = CommandBuilder::new(&request.program);
        cmd.args(&request.args);
        cmd.cwd(&request.cwd);
        cmd.env_clear();
        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("failed to spawn {}", request.program))?;
        drop(pair.slave);

        let pid = child.process_id();
        let reader = pair
            .master
            .try_clone_reader()
            .context("failed to clone pty reader")?;
        let writer = pair.master.take_writer().context("failed to take pty writer")?;

        let (input_tx, input_rx) = std::sync::mpsc::sync_channel(PTY_INPUT_CHANNEL_SIZE);
        spawn_writer_thread(request.label.clone(), writer, input_rx);

        let killed = Arc::new(AtomicBool::new(false));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        spawn_reader_thread(
            request.label.clone(),
            reader,
            child,
            killed.clone(),
            event_tx,
        );

        info!("[pty:{}] spawned {} (pid: {:?})", request.label, request.program, pid);

        Ok(SpawnedPty {
            process: Box::new(NativePty {
                label: request.label,
                pid,
                master: Mutex::new(pair.master),
                input_tx,
                killed,
            }),
            events: event_rx,
        })
    }
}

struct NativePty {
    label: String,
    pid: Option<u32>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    input_tx: std::sync::mpsc::SyncSender<Vec<u8>>,
    killed: Arc<AtomicBool>,
}

impl PtyProcess for NativePty {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Hands the bytes to the writer thread. The channel is bounded, so a
    /// shell that stops reading eventually blocks the caller.
    fn write(&self, data: &[u8]) -> std::io::Result<()> {
        self.input_tx.send(data.to_vec()).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pty input channel closed")
        })
    }

    fn resize(&self, cols: u16, rows: u16) -> std::io::Result<()> {
        self.master
            .lock()
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    }

    fn kill(&self) -> std::io::Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "pty child has no pid",
            ));
        };
        self.killed.store(true, Ordering::SeqCst);
        match kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => {
                warn!("[pty:{}] SIGKILL to {} failed: {}", self.label, pid, e);
                Err(std::io::Error::from(e))
            }
        }
    }
}

/// Dedicated thread for PTY writes, fed by a bounded channel. Writes go out in
/// small chunks so the PTY buffer can drain between them.
fn spawn_writer_thread(
    label: String,
    mut writer: Box<dyn Write + Send>,
    input_rx: std::sync::mpsc::Receiver<Vec<u8>>,
) {
    std::thread::spawn(move || {
        let mut total_bytes_written: usize = 0;

        while let Ok(data) = input_rx.recv() {
            for chunk in data.chunks(PTY_WRITE_CHUNK_SIZE) {
                if let Err(e) = writer.write_all(chunk).and_then(|_| writer.flush()) {
                    error!(
                        "[writer:{}] write failed: {} (errno: {:?})",
                        label,
                        e,
                        e.raw_os_error()
                    );
                    return;
                }
                std::thread::yield_now();
            }
            total_bytes_written += data.len();
        }

        info!(
            "[writer:{}] channel closed after {} bytes",
            label, total_bytes_written
        );
    });
}

fn spawn_reader_thread(
    label: String,
    mut reader: Box<dyn Read + Send>,
    mut child: Box<dyn Child + Send>,
    killed: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<PtyEvent>,
) {
    std::thread::spawn(move || {
        let mut buf = [0u8; PTY_READ_BUFFER_SIZE];
        let mut decoder = Utf8Carry::default();
        let mut total_bytes_read: usize = 0;

        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    total_bytes_read += n;
                    let text = decoder.feed(&buf[..n]);
                    if !text.is_empty() {
                        let _ = events.send(PtyEvent::Data(text));
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // EIO is how Linux reports a closed slave side.
                    if e.raw_os_error() != Some(nix::libc::EIO) {
                        warn!("[reader:{}] read error: {}", label, e);
                    }
                    break;
                }
            }
        }

        let rest = decoder.finish();
        if !rest.is_empty() {
            let _ = events.send(PtyEvent::Data(rest));
        }

        let exit = match child.wait() {
            Ok(status) => ExitInfo {
                exit_code: i32::try_from(status.exit_code()).ok(),
                signal: killed
                    .load(Ordering::SeqCst)
                    .then(|| "SIGKILL".to_string()),
            },
            Err(e) => {
                warn!("[reader:{}] wait failed: {}", label, e);
                ExitInfo {
                    exit_code: None,
                    signal: None,
                }
            }
        };

        info!(
            "[reader:{}] EOF after {} bytes, exit: {:?}",
            label, total_bytes_read, exit
        );
        let _ = events.send(PtyEvent::Exit(exit));
    });
}

/// Streaming UTF-8 decoder that holds back an incomplete trailing sequence
/// until the next read completes it. Invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub(crate) struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    pub(crate) fn feed(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    out.push_str(valid);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid_up_to = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid_up_to]));
                    match e.error_len() {
                        None => {
                            self.pending.drain(..valid_up_to);
                            return out;
                        }
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid_up_to + bad);
                        }
                    }
                }
            }
        }
    }

    pub(crate) fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

/// In-memory spawner for exercising session logic without a real PTY.
#[cfg(test)]
pub(crate) mod fake {
    use super::*;

    #[derive(Clone)]
    pub(crate) struct FakeHandle {
        pub request: SpawnRequest,
        events: mpsc::UnboundedSender<PtyEvent>,
        written: Arc<Mutex<Vec<u8>>>,
        sizes: Arc<Mutex<Vec<(u16, u16)>>>,
        killed: Arc<AtomicBool>,
    }

    impl FakeHandle {
        pub(crate) fn emit(&self, data: &str) {
            let _ = self.events.send(PtyEvent::Data(data.to_string()));
        }

        pub(crate) fn exit(&self, code: i32) {
            let _ = self.events.send(PtyEvent::Exit(ExitInfo {
                exit_code: Some(code),
                signal: None,
            }));
        }

        pub(crate) fn written(&self) -> String {
            String::from_utf8_lossy(&self.written.lock()).into_owned()
        }

        pub(crate) fn sizes(&self) -> Vec<(u16, u16)> {
            self.sizes.lock().clone()
        }

        pub(crate) fn was_killed(&self) -> bool {
            self.killed.load(Ordering::SeqCst)
        }
    }

    struct FakeProcess {
        handle: FakeHandle,
    }

    impl PtyProcess for FakeProcess {
        fn pid(&self) -> Option<u32> {
            Some(4242)
        }

        fn write(&self, data: &[u8]) -> std::io::Result<()> {
            self.handle.written.lock().extend_from_slice(data);
            Ok(())
        }

        fn resize(&self, cols: u16, rows: u16) -> std::io::Result<()> {
            self.handle.sizes.lock().push((cols, rows));
            Ok(())
        }

        fn kill(&self) -> std::io::Result<()> {
            if !self.handle.killed.swap(true, Ordering::SeqCst) {
                let _ = self.handle.events.send(PtyEvent::Exit(ExitInfo::killed()));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeSpawner {
        handles: Mutex<Vec<FakeHandle>>,
        fail: AtomicBool,
    }

    impl FakeSpawner {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub(crate) fn fail_next_spawns(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }

        pub(crate) fn spawn_count(&self) -> usize {
            self.handles.lock().len()
        }

        pub(crate) fn last(&self) -> FakeHandle {
            self.handles
                .lock()
                .last()
                .cloned()
                .expect("nothing spawned yet")
        }
    }

    impl PtySpawner for FakeSpawner {
        fn spawn(&self, request: SpawnRequest) -> anyhow::Result<SpawnedPty> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("no such file or directory: {}", request.program);
            }
            let (tx, rx) = mpsc::unbounded_channel();
            let handle = FakeHandle {
                request,
                events: tx,
                written: Arc::default(),
                sizes: Arc::default(),
                killed: Arc::default(),
            };
            self.handles.lock().push(handle.clone());
            Ok(SpawnedPty {
                process: Box::new(FakeProcess { handle }),
                events: rx,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sh_request(args: &[&str]) -> SpawnRequest {
        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), "/usr/bin:/bin".to_string());
        env.insert("TERM".to_string(), "xterm-256color".to_string());
        SpawnRequest {
            label: "test".to_string(),
            program: "/bin/sh".to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            cwd: "/tmp".to_string(),
            cols: 80,
            rows: 24,
            env,
        }
    }

    async fn collect_until_exit(
        events: &mut mpsc::UnboundedReceiver<PtyEvent>,
    ) -> (String, ExitInfo) {
        let mut output = String::new();
        loop {
            match tokio::time::timeout(Duration::from_secs(10), events.recv())
                .await
                .expect("pty event timed out")
            {
                Some(PtyEvent::Data(data)) => output.push_str(&data),
                Some(PtyEvent::Exit(exit)) => return (output, exit),
                None => panic!("event channel closed before exit"),
            }
        }
    }

    #[test]
    fn carry_holds_split_multibyte_sequences() {
        let mut carry = Utf8Carry::default();
        let bytes = "a✓b".as_bytes();
        assert_eq!(carry.feed(&bytes[..2]), "a");
        assert_eq!(carry.feed(&bytes[2..3]), "");
        assert_eq!(carry.feed(&bytes[3..]), "✓b");
        assert_eq!(carry.finish(), "");
    }

    #[test]
    fn carry_replaces_invalid_bytes() {
        let mut carry = Utf8Carry::default();
        assert_eq!(carry.feed(&[b'x', 0xff, b'y']), "x\u{fffd}y");
        assert_eq!(carry.feed(&[0xe2, 0x9c]), "");
        assert_eq!(carry.finish(), "\u{fffd}");
    }

    #[tokio::test]
    async fn native_spawn_reports_output_then_exit() {
        let spawned = NativePtySpawner
            .spawn(sh_request(&["-c", "echo pty-hello; exit 3"]))
            .unwrap();
        let mut events = spawned.events;
        let (output, exit) = collect_until_exit(&mut events).await;
        assert!(output.contains("pty-hello"), "output: {output:?}");
        assert_eq!(exit.exit_code, Some(3));
        assert_eq!(exit.signal, None);
    }

    #[tokio::test]
    async fn native_kill_is_forceful() {
        let spawned = NativePtySpawner
            .spawn(sh_request(&["-c", "exec sleep 30"]))
            .unwrap();
        let mut events = spawned.events;
        tokio::time::sleep(Duration::from_millis(100)).await;
        spawned.process.kill().unwrap();
        let (_, exit) = collect_until_exit(&mut events).await;
        assert_eq!(exit.signal.as_deref(), Some("SIGKILL"));
    }

    #[tokio::test]
    async fn native_write_and_resize() {
        let spawned = NativePtySpawner.spawn(sh_request(&[])).unwrap();
        let mut events = spawned.events;
        spawned.process.resize(120, 40).unwrap();
        spawned.process.write(b"stty size; exit\n").unwrap();
        let (output, _) = collect_until_exit(&mut events).await;
        assert!(output.contains("40 120"), "output: {output:?}");
    }
}
