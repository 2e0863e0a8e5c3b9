//! Control-mode protocol client
//!
//! Owns one `tmux -C` channel: commands go out on the writer, a reader task
//! classifies everything tmux prints. Replies are correlated to commands in
//! FIFO order; tmux answers commands strictly in the order it read them, so
//! the reply block that opens next always belongs to the oldest command
//! still waiting.
//!
//! Notifications are forwarded, in arrival order, to a single
//! [`NotificationStream`] which ends once the channel closes.

use crate::commands::TmuxCommand;
use crate::error::{Result, TmuxError};
use crate::parser::{BlockHeader, ControlLine, LineBuffer, Notification, parse_line};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Read size for the control channel
const READ_CHUNK: usize = 16 * 1024;

/// How long `shutdown` waits for tmux to exit after stdin closes
const EXIT_GRACE: Duration = Duration::from_millis(500);

type Reply = std::result::Result<Vec<String>, String>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A command written to tmux whose reply block has not been seen yet.
struct PendingCommand {
    command: String,
    /// `None` for fire-and-forget commands
    responder: Option<oneshot::Sender<Reply>>,
}

/// Commands awaiting a reply, in the order they were written.
///
/// `open` lives under the same lock so a command can never be queued after
/// the reader has given up on the channel.
#[derive(Default)]
struct PendingQueue {
    open: bool,
    commands: VecDeque<PendingCommand>,
}

type SharedQueue = Arc<Mutex<PendingQueue>>;

/// Reply to a submitted command, awaited separately from the write.
pub struct PendingReply {
    command: String,
    receiver: oneshot::Receiver<Reply>,
    timeout: Duration,
}

impl PendingReply {
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Wait for the reply block, up to the client's command timeout.
    pub async fn wait(self) -> Result<Vec<String>> {
        match tokio::time::timeout(self.timeout, self.receiver).await {
            Err(_) => Err(TmuxError::CommandTimeout {
                command: self.command,
                timeout_ms: self.timeout.as_millis() as u64,
            }),
            Ok(Err(_)) => Err(TmuxError::ChannelClosed),
            Ok(Ok(Ok(lines))) => Ok(lines),
            Ok(Ok(Err(message))) => Err(TmuxError::CommandFailed {
                command: self.command,
                message,
            }),
        }
    }
}

/// Notifications from one control channel, in arrival order.
pub struct NotificationStream {
    receiver: mpsc::UnboundedReceiver<Notification>,
}

impl NotificationStream {
    /// Next notification, or [`TmuxError::ChannelClosed`] once tmux has gone
    /// away and everything before that has been delivered.
    pub async fn next(&mut self) -> Result<Notification> {
        self.receiver.recv().await.ok_or(TmuxError::ChannelClosed)
    }
}

/// Client side of one `tmux -C` control channel.
pub struct ProtocolClient {
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    pending: SharedQueue,
    notifications: Mutex<Option<NotificationStream>>,
    reader: JoinHandle<()>,
    child: Mutex<Option<Child>>,
    timeout: Duration,
}

impl ProtocolClient {
    /// Start `tmux -C new-session -A` for `session`, creating it in `cwd` if
    /// it does not exist yet.
    ///
    /// `TMUX` is removed from the child's environment so the command works
    /// from inside another tmux session.
    pub fn spawn(tmux_path: &Path, session: &str, cwd: &Path, timeout: Duration) -> Result<Self> {
        log::info!(
            "Starting control channel: {} -C new-session -A -s {} -c {}",
            tmux_path.display(),
            session,
            cwd.display()
        );

        let mut child = Command::new(tmux_path)
            .args(["-C", "new-session", "-A", "-s", session, "-c"])
            .arg(cwd)
            .env_remove("TMUX")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TmuxError::Spawn {
                path: tmux_path.display().to_string(),
                source,
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(TmuxError::Transport(std::io::Error::other(
                "tmux stdio was not captured",
            )));
        };

        if let Some(stderr) = child.stderr.take() {
            let session = session.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log::warn!("tmux[{session}] stderr: {line}");
                }
            });
        }

        let client = Self::from_io(stdout, stdin, timeout);
        *client.child.lock() = Some(child);
        Ok(client)
    }

    /// Run the protocol over an arbitrary byte stream pair.
    pub fn from_io<R, W>(reader: R, writer: W, timeout: Duration) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let pending: SharedQueue = Arc::new(Mutex::new(PendingQueue {
            open: true,
            commands: VecDeque::new(),
        }));
        let (tx, rx) = mpsc::unbounded_channel();
        let control = ControlReader::new(Arc::clone(&pending), tx);
        let reader = tokio::spawn(read_loop(reader, control));

        Self {
            writer: tokio::sync::Mutex::new(Some(Box::new(writer))),
            pending,
            notifications: Mutex::new(Some(NotificationStream { receiver: rx })),
            reader,
            child: Mutex::new(None),
            timeout,
        }
    }

    /// Take the notification stream. Only the first call gets it.
    pub fn take_notifications(&self) -> Option<NotificationStream> {
        self.notifications.lock().take()
    }

    pub fn is_open(&self) -> bool {
        self.pending.lock().open
    }

    pub fn command_timeout(&self) -> Duration {
        self.timeout
    }

    /// Write a command without waiting for its reply. A `%error` answer is
    /// logged by the reader.
    pub async fn send(&self, command: &TmuxCommand) -> Result<()> {
        self.write(command, None).await
    }

    /// Write a command and return a handle to its reply.
    pub async fn submit(&self, command: &TmuxCommand) -> Result<PendingReply> {
        let (tx, rx) = oneshot::channel();
        self.write(command, Some(tx)).await?;
        Ok(PendingReply {
            command: command.as_str().to_string(),
            receiver: rx,
            timeout: self.timeout,
        })
    }

    /// Write a command and wait for the lines of its reply block.
    pub async fn execute(&self, command: &TmuxCommand) -> Result<Vec<String>> {
        self.submit(command).await?.wait().await
    }

    async fn write(
        &self,
        command: &TmuxCommand,
        responder: Option<oneshot::Sender<Reply>>,
    ) -> Result<()> {
        // Held across the write so queue order always matches wire order
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(TmuxError::ChannelClosed);
        };

        {
            let mut pending = self.pending.lock();
            if !pending.open {
                return Err(TmuxError::ChannelClosed);
            }
            pending.commands.push_back(PendingCommand {
                command: command.as_str().to_string(),
                responder,
            });
        }

        log::trace!("TX: {}", command.as_str());
        let bytes = command.as_bytes();
        let written = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = written {
            log::warn!("Control channel write failed: {e}");
            *guard = None;
            close_queue(&self.pending);
            return Err(TmuxError::Transport(e));
        }
        Ok(())
    }

    /// Close the channel and reap the tmux process.
    ///
    /// Closing stdin makes tmux detach the control client; the process is
    /// killed if it has not exited after a short grace period. Commands still
    /// waiting fail with [`TmuxError::ChannelClosed`].
    pub async fn shutdown(&self) {
        if let Some(mut writer) = self.writer.lock().await.take()
            && let Err(e) = writer.shutdown().await
        {
            log::debug!("Closing control channel stdin failed: {e}");
        }

        let child = self.child.lock().take();
        if let Some(mut child) = child {
            match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
                Ok(Ok(status)) => log::debug!("tmux control client exited: {status}"),
                Ok(Err(e)) => log::warn!("Waiting for tmux failed: {e}"),
                Err(_) => {
                    log::warn!("tmux did not exit after stdin closed, killing it");
                    if let Err(e) = child.kill().await {
                        log::warn!("Killing tmux failed: {e}");
                    }
                }
            }
        }

        close_queue(&self.pending);
        self.reader.abort();
    }
}

impl Drop for ProtocolClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Mark the channel closed and drop every waiting responder, which wakes
/// their receivers with an error.
fn close_queue(pending: &SharedQueue) {
    let dropped = {
        let mut pending = pending.lock();
        pending.open = false;
        std::mem::take(&mut pending.commands)
    };
    if !dropped.is_empty() {
        log::debug!(
            "Control channel closed with {} command(s) unanswered",
            dropped.len()
        );
    }
}

async fn read_loop<R: AsyncRead + Unpin>(mut reader: R, mut control: ControlReader) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                log::info!("Control channel reached EOF");
                break;
            }
            Ok(n) => control.feed(&buf[..n]),
            Err(e) => {
                log::warn!("Control channel read failed: {e}");
                break;
            }
        }
    }
    control.finish();
}

// ============================================================================
// Reader state machine
// ============================================================================

/// A reply block between `%begin` and its matching `%end`/`%error`.
struct OpenBlock {
    header: BlockHeader,
    /// The command this block answers; `None` for blocks tmux emits on its
    /// own, such as the one for the command line it was started with
    owner: Option<PendingCommand>,
    output: Vec<String>,
}

/// Turns raw channel bytes into replies and notifications.
struct ControlReader {
    lines: LineBuffer,
    block: Option<OpenBlock>,
    pending: SharedQueue,
    notifications: mpsc::UnboundedSender<Notification>,
}

impl ControlReader {
    fn new(pending: SharedQueue, notifications: mpsc::UnboundedSender<Notification>) -> Self {
        Self {
            lines: LineBuffer::new(),
            block: None,
            pending,
            notifications,
        }
    }

    fn feed(&mut self, chunk: &[u8]) {
        for line in self.lines.push(chunk) {
            self.handle_line(&line);
        }
    }

    fn handle_line(&mut self, line: &[u8]) {
        log::trace!("RX: {}", String::from_utf8_lossy(line));

        if let Some(block) = self.block.as_mut() {
            // Inside a block only the matching terminator ends it; command
            // output may itself start with '%'
            match block_terminator(line, block.header.number) {
                Some(Terminator::End) => self.close_block(true),
                Some(Terminator::Error) => self.close_block(false),
                None => block
                    .output
                    .push(String::from_utf8_lossy(line).into_owned()),
            }
            return;
        }

        match parse_line(line) {
            Ok(ControlLine::Begin(header)) => self.open_block(header),
            Ok(ControlLine::End(header)) | Ok(ControlLine::Error(header)) => {
                log::warn!("Unmatched block terminator for command {}", header.number);
            }
            Ok(ControlLine::Notification(notification)) => {
                // The receiver may already be gone during teardown
                let _ = self.notifications.send(notification);
            }
            Ok(ControlLine::Data(data)) => {
                if !data.is_empty() {
                    log::debug!("Ignoring data outside a reply block: {data}");
                }
            }
            Err(e) => log::warn!("Skipping control line: {e}"),
        }
    }

    fn open_block(&mut self, header: BlockHeader) {
        let owner = if header.from_client() {
            let owner = self.pending.lock().commands.pop_front();
            if owner.is_none() {
                log::warn!("Reply block {} has no pending command", header.number);
            }
            owner
        } else {
            None
        };
        self.block = Some(OpenBlock {
            header,
            owner,
            output: Vec::new(),
        });
    }

    fn close_block(&mut self, success: bool) {
        let Some(block) = self.block.take() else {
            return;
        };
        let Some(owner) = block.owner else {
            if !success {
                log::warn!("tmux reported an error: {}", block.output.join("\n"));
            }
            return;
        };

        let reply = if success {
            Ok(block.output)
        } else {
            Err(block.output.join("\n"))
        };

        match owner.responder {
            Some(responder) => {
                let _ = responder.send(reply);
            }
            None => {
                if let Err(message) = reply {
                    log::warn!("tmux rejected `{}`: {}", owner.command, message);
                }
            }
        }
    }

    /// End of stream: nothing more will be answered.
    fn finish(&mut self) {
        if self.lines.pending_len() > 0 {
            log::debug!(
                "Discarding {} bytes of unterminated output",
                self.lines.pending_len()
            );
        }
        self.block = None;
        close_queue(&self.pending);
    }
}

enum Terminator {
    End,
    Error,
}

fn block_terminator(line: &[u8], number: u64) -> Option<Terminator> {
    let kind = if line.starts_with(b"%end ") {
        Terminator::End
    } else if line.starts_with(b"%error ") {
        Terminator::Error
    } else {
        return None;
    };
    match parse_line(line) {
        Ok(ControlLine::End(header)) | Ok(ControlLine::Error(header))
            if header.number == number =>
        {
            Some(kind)
        }
        _ => None,
    }
}
