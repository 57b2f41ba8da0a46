/// GDB/MI protocol controller
///
/// Owns the debugger process and its pipes and runs the background tasks that
/// read its output:
///
/// - ingestion splits stdout into lines, parses them, and routes async records
///   to the dispatch queue and everything else to the result queue
/// - dispatch hands async records to the callbacks registered per class
/// - a stderr drain logs whatever GDB prints on stderr
///
/// # Usage contract
///
/// [`GdbController::exec`] is meant for one caller issuing one command at a
/// time. Every command is sent with a fresh numeric token and results carrying
/// a different token are discarded, so a late answer to a timed-out command
/// cannot be mistaken for the answer to the next one. Results without a token
/// are still matched positionally. Overlapping `exec` calls are serialized.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::Config;
use crate::events::{run_dispatch, CallbackRegistry};
use crate::parser::parse_record;
use crate::process::{GdbPipes, GdbProcess, ProcessError};
use crate::types::{AsyncRecord, Payload, Record, ResultRecord};

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("Failed to write command: {0}")]
    WriteError(#[from] std::io::Error),
    #[error("GDB session closed")]
    SessionClosed,
    #[error("Controller is not attached to a GDB process")]
    NoProcess,
}

pub type Result<T> = std::result::Result<T, ControllerError>;

type CommandWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Controls one GDB session over the machine interface
pub struct GdbController {
    process: Option<GdbProcess>,
    stdin: Mutex<CommandWriter>,
    results: Mutex<mpsc::UnboundedReceiver<Record>>,
    callbacks: CallbackRegistry,
    token_counter: AtomicU64,
    ingesting: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    default_timeout: Duration,
}

impl GdbController {
    /// Start GDB in MI mode and begin reading its output
    pub fn spawn(config: &Config) -> Result<Self> {
        let (process, pipes) = GdbProcess::start(config)?;
        let GdbPipes { stdin, stdout, stderr } = pipes;

        let mut controller = Self::from_io(stdin, stdout, config);
        let shutdown = controller.shutdown.subscribe();
        controller
            .tasks
            .push(tokio::spawn(drain_stderr(stderr, shutdown)));
        controller.process = Some(process);

        Ok(controller)
    }

    /// Build a controller over arbitrary byte streams instead of a child process
    pub fn from_io<W, R>(writer: W, reader: R, config: &Config) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (result_tx, result_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let callbacks = CallbackRegistry::new();
        let ingesting = Arc::new(AtomicBool::new(true));

        let ingestion = tokio::spawn(run_ingestion(
            reader,
            config.read_chunk.max(1),
            result_tx,
            event_tx,
            ingesting.clone(),
            shutdown.subscribe(),
        ));
        let dispatch = tokio::spawn(run_dispatch(
            callbacks.clone(),
            event_rx,
            shutdown.subscribe(),
        ));

        Self {
            process: None,
            stdin: Mutex::new(Box::new(writer)),
            results: Mutex::new(result_rx),
            callbacks,
            token_counter: AtomicU64::new(1),
            ingesting,
            shutdown,
            tasks: vec![ingestion, dispatch],
            default_timeout: config.exec_timeout(),
        }
    }

    /// Write a raw command line to GDB without waiting for an answer
    pub async fn send(&self, command: &str) -> Result<()> {
        log::debug!("SEND: {}", command);

        let mut stdin = self.stdin.lock().await;
        stdin.write_all(command.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Send a command and wait up to `timeout` for its result record
    ///
    /// Returns `Ok(None)` when no result arrived in time. Stream output and
    /// prompts seen while waiting are discarded.
    pub async fn exec(&self, command: &str, timeout: Duration) -> Result<Option<ResultRecord>> {
        let mut results = self.results.lock().await;

        let token = self.token_counter.fetch_add(1, Ordering::SeqCst);
        let deadline = Instant::now() + timeout;
        self.send(&format!("{token}{command}")).await?;

        loop {
            let record = match tokio::time::timeout_at(deadline, results.recv()).await {
                Ok(Some(record)) => record,
                Ok(None) => {
                    log::debug!("RECV[{}]: session closed while waiting", token);
                    return Err(ControllerError::SessionClosed);
                }
                Err(_) => {
                    log::debug!("RECV[{}]: no answer within {:?}", token, timeout);
                    return Ok(None);
                }
            };

            let Record::Result(result) = record else {
                continue;
            };

            match result.token {
                Some(other) if other != token => {
                    log::warn!("RECV[{}]: discarding stale result for token {}", token, other);
                }
                _ => {
                    log::debug!("RECV[{}]: class={}", token, result.class);
                    return Ok(Some(result));
                }
            }
        }
    }

    /// [`exec`](Self::exec) with the configured default timeout
    pub async fn exec_default(&self, command: &str) -> Result<Option<ResultRecord>> {
        self.exec(command, self.default_timeout).await
    }

    /// Install or replace the callback for an async class such as `stopped`
    ///
    /// Events already queued when this is called may or may not see the new
    /// callback. Callbacks run on the dispatch task; a panic is logged and the
    /// next event is still delivered.
    pub fn register_callback<F>(&self, async_class: &str, callback: F)
    where
        F: Fn(&Payload) + Send + Sync + 'static,
    {
        self.callbacks.register(async_class, callback);
    }

    /// Send SIGINT to GDB, which interrupts a running inferior
    pub fn interrupt(&self) -> Result<()> {
        let process = self.process.as_ref().ok_or(ControllerError::NoProcess)?;
        Ok(process.interrupt()?)
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(GdbProcess::id)
    }

    /// Whether GDB's output is still being read
    pub fn is_running(&self) -> bool {
        self.ingesting.load(Ordering::SeqCst)
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Stop the background tasks, kill GDB and wait for everything to finish
    pub async fn shutdown(&mut self) -> Result<()> {
        if self.is_running() {
            let _ = self.send("-gdb-exit").await;
        }
        self.shutdown.send_replace(true);

        if let Some(mut process) = self.process.take() {
            if let Err(e) = process.kill().await {
                log::debug!("GDB process already gone: {}", e);
            }
        }

        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        self.ingesting.store(false, Ordering::SeqCst);

        Ok(())
    }
}

async fn run_ingestion<R>(
    mut reader: R,
    chunk: usize,
    results: mpsc::UnboundedSender<Record>,
    events: mpsc::UnboundedSender<AsyncRecord>,
    ingesting: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin,
{
    log::debug!("GDB stdout reader started");
    let mut buf = vec![0u8; chunk];
    let mut pending: Vec<u8> = Vec::new();

    loop {
        let n = tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    log::debug!("GDB stdout: EOF reached");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    log::error!("GDB stdout read error: {}", e);
                    break;
                }
            },
            _ = shutdown.changed() => break,
        };

        pending.extend_from_slice(&buf[..n]);
        while let Some(end) = pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = pending.drain(..=end).collect();
            route_line(&String::from_utf8_lossy(&line), &results, &events);
        }
    }

    if !pending.is_empty() {
        route_line(&String::from_utf8_lossy(&pending), &results, &events);
    }
    ingesting.store(false, Ordering::SeqCst);
    log::debug!("GDB stdout reader finished");
}

fn route_line(
    line: &str,
    results: &mpsc::UnboundedSender<Record>,
    events: &mpsc::UnboundedSender<AsyncRecord>,
) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    log::trace!("GDB_OUT: {}", line);

    match parse_record(line) {
        Ok(Some(Record::Async(record))) => {
            let _ = events.send(record);
        }
        Ok(Some(record)) => {
            let _ = results.send(record);
        }
        Ok(None) => log::trace!("GDB_OUT: not a record, dropped"),
        Err(e) => log::warn!("GDB_PARSE_ERROR: '{}' -> {}", line, e),
    }
}

async fn drain_stderr<R>(stderr: R, mut shutdown: watch::Receiver<bool>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stderr).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if !line.is_empty() {
                        log::debug!("GDB stderr: {}", line);
                    }
                }
                Ok(None) | Err(_) => break,
            },
            _ = shutdown.changed() => break,
        }
    }
    log::debug!("GDB stderr reader finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ResultClass, Value};
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
    use tokio_test::{assert_err, assert_ok};

    /// Controller wired to an in-memory pipe; the other end plays GDB
    fn controller_pair(
        timeout_ms: u64,
    ) -> (GdbController, ReadHalf<DuplexStream>, WriteHalf<DuplexStream>) {
        let (ours, theirs) = tokio::io::duplex(4096);
        let (reader, writer) = tokio::io::split(ours);
        let config = Config {
            exec_timeout_ms: timeout_ms,
            ..Config::default()
        };
        let controller = GdbController::from_io(writer, reader, &config);
        let (gdb_reader, gdb_writer) = tokio::io::split(theirs);
        (controller, gdb_reader, gdb_writer)
    }

    /// Answer `<token><command>` lines with `<token>^done,cmd="<command>"`
    fn spawn_echo_gdb(reader: ReadHalf<DuplexStream>, mut writer: WriteHalf<DuplexStream>) {
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let split = line.find(|c: char| !c.is_ascii_digit()).unwrap_or(line.len());
                let (token, command) = line.split_at(split);
                if command.contains("slow") {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                }
                let reply = format!(
                    "~\"echo\"\n=thread-group-added,id=\"i1\"\n\
                     {token}^done,cmd=\"{command}\"\n(gdb)\n"
                );
                if writer.write_all(reply.as_bytes()).await.is_err() {
                    break;
                }
            }
        });
    }

    #[tokio::test]
    async fn test_sequential_exec_returns_matching_results() {
        let (controller, gdb_reader, gdb_writer) = controller_pair(1_000);
        spawn_echo_gdb(gdb_reader, gdb_writer);

        let a = controller.exec_default("-command-a").await.unwrap().unwrap();
        let b = controller.exec_default("-command-b").await.unwrap().unwrap();

        assert_eq!(a.class, ResultClass::Done);
        assert_eq!(a.payload.get("cmd"), Some(&Value::from("-command-a")));
        assert_eq!(b.payload.get("cmd"), Some(&Value::from("-command-b")));
        assert_eq!(b.token, a.token.map(|t| t + 1));
    }

    #[tokio::test]
    async fn test_late_result_is_not_given_to_next_command() {
        let (controller, gdb_reader, gdb_writer) = controller_pair(1_000);
        spawn_echo_gdb(gdb_reader, gdb_writer);

        let slow = assert_ok!(controller.exec("-slow", Duration::from_millis(50)).await);
        assert!(slow.is_none());

        let next = controller.exec("-next", Duration::from_secs(2)).await.unwrap().unwrap();
        assert_eq!(next.payload.get("cmd"), Some(&Value::from("-next")));
    }

    #[tokio::test]
    async fn test_exec_times_out_without_answer() {
        let (controller, _gdb_reader, _gdb_writer) = controller_pair(1_000);

        let started = Instant::now();
        let result = assert_ok!(controller.exec("-never", Duration::from_millis(100)).await);
        assert!(result.is_none());
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_untokened_result_matches_positionally() {
        let (controller, gdb_reader, mut gdb_writer) = controller_pair(1_000);
        tokio::spawn(async move {
            let mut lines = BufReader::new(gdb_reader).lines();
            while let Ok(Some(_)) = lines.next_line().await {
                gdb_writer
                    .write_all(b"^error,msg=\"No symbol table is loaded.\"\n")
                    .await
                    .unwrap();
            }
        });

        let result = controller.exec_default("-symbol-info").await.unwrap().unwrap();
        assert!(result.is_error());
        assert_eq!(result.error_message(), Some("No symbol table is loaded."));
    }

    #[tokio::test]
    async fn test_async_event_reaches_callback_once() {
        let (controller, _gdb_reader, mut gdb_writer) = controller_pair(1_000);
        let (hit_tx, mut hit_rx) = mpsc::unbounded_channel();
        controller.register_callback("stopped", move |payload| {
            let _ = hit_tx.send(payload.clone());
        });

        gdb_writer
            .write_all(b"*stopped,reason=\"breakpoint-hit\",frame={func=\"main\"}\n")
            .await
            .unwrap();

        let payload = tokio::time::timeout(Duration::from_secs(2), hit_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload.get("reason"), Some(&Value::from("breakpoint-hit")));
        assert_eq!(
            payload.get("frame").and_then(|f| f.get("func")),
            Some(&Value::from("main"))
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_err!(hit_rx.try_recv());
    }

    #[tokio::test]
    async fn test_reregistered_callback_replaces_old_one() {
        let (controller, _gdb_reader, mut gdb_writer) = controller_pair(1_000);
        let (old_tx, mut old_rx) = mpsc::unbounded_channel::<()>();
        let (new_tx, mut new_rx) = mpsc::unbounded_channel::<()>();

        controller.register_callback("stopped", move |_| {
            let _ = old_tx.send(());
        });
        controller.register_callback("stopped", move |_| {
            let _ = new_tx.send(());
        });

        gdb_writer.write_all(b"*stopped,reason=\"exited-normally\"\n").await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), new_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_err!(old_rx.try_recv());
    }

    #[tokio::test]
    async fn test_lines_split_across_reads_are_reassembled() {
        let (controller, _gdb_reader, mut gdb_writer) = controller_pair(1_000);
        let (hit_tx, mut hit_rx) = mpsc::unbounded_channel();
        controller.register_callback("stopped", move |payload| {
            let _ = hit_tx.send(payload.clone());
        });

        gdb_writer.write_all(b"*stopped,reason=\"end-st").await.unwrap();
        gdb_writer.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        gdb_writer.write_all(b"epping-range\"\r\n").await.unwrap();

        let payload = tokio::time::timeout(Duration::from_secs(2), hit_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload.get("reason"), Some(&Value::from("end-stepping-range")));
    }

    #[tokio::test]
    async fn test_malformed_lines_do_not_stop_ingestion() {
        let (controller, gdb_reader, mut gdb_writer) = controller_pair(1_000);
        tokio::spawn(async move {
            let mut lines = BufReader::new(gdb_reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let token: String = line.chars().take_while(char::is_ascii_digit).collect();
                let reply = format!("^done,broken={{\nnoise\n{token}^done,ok=\"1\"\n");
                gdb_writer.write_all(reply.as_bytes()).await.unwrap();
            }
        });

        let result = controller.exec_default("-anything").await.unwrap().unwrap();
        assert_eq!(result.payload.get("ok"), Some(&Value::from("1")));
        assert!(controller.is_running());
    }

    #[tokio::test]
    async fn test_closed_output_ends_session() {
        let (mut controller, gdb_reader, gdb_writer) = controller_pair(1_000);
        drop(gdb_writer);
        drop(gdb_reader);

        let deadline = Instant::now() + Duration::from_secs(2);
        while controller.is_running() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!controller.is_running());
        assert!(controller.exec_default("-exec-run").await.is_err());

        assert_ok!(controller.shutdown().await);
    }

    #[tokio::test]
    async fn test_interrupt_needs_a_process() {
        let (controller, _gdb_reader, _gdb_writer) = controller_pair(1_000);
        assert!(matches!(controller.interrupt(), Err(ControllerError::NoProcess)));
        assert_eq!(controller.pid(), None);
    }

    #[tokio::test]
    async fn test_shutdown_stops_tasks() {
        let (mut controller, _gdb_reader, _gdb_writer) = controller_pair(1_000);
        assert!(controller.is_running());
        assert_ok!(controller.shutdown().await);
        assert!(!controller.is_running());
    }
}
