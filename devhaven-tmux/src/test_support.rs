//! In-process stand-in for a tmux control client, for unit tests.

use crate::client::ProtocolClient;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

pub(crate) type Reply = Result<Vec<String>, String>;

/// Answers every command through `respond` and records what it was sent.
pub(crate) struct ScriptedHost {
    pub client: Arc<ProtocolClient>,
    commands: Arc<Mutex<Vec<String>>>,
    inject: mpsc::UnboundedSender<String>,
}

impl ScriptedHost {
    pub fn start(respond: impl Fn(&str) -> Reply + Send + 'static) -> Self {
        let (client_io, host_io) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_io);
        let client = Arc::new(ProtocolClient::from_io(
            client_read,
            client_write,
            Duration::from_secs(2),
        ));

        let commands = Arc::new(Mutex::new(Vec::new()));
        let (inject, mut injected) = mpsc::unbounded_channel::<String>();
        let recorded = Arc::clone(&commands);

        tokio::spawn(async move {
            let (host_read, mut host_write) = tokio::io::split(host_io);
            let mut lines = BufReader::new(host_read).lines();
            let mut number = 0u64;
            loop {
                let out = tokio::select! {
                    line = lines.next_line() => {
                        let Ok(Some(line)) = line else { break };
                        recorded.lock().push(line.clone());
                        number += 1;
                        match respond(&line) {
                            Ok(output) => reply_block(number, &output, "%end"),
                            Err(message) => reply_block(number, &[message], "%error"),
                        }
                    }
                    Some(raw) = injected.recv() => format!("{raw}\n"),
                };
                if host_write.write_all(out.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        Self {
            client,
            commands,
            inject,
        }
    }

    /// Answer everything with an empty success block.
    pub fn accepting() -> Self {
        Self::start(|_| Ok(Vec::new()))
    }

    /// Write a raw line, such as a notification, to the client.
    pub fn inject(&self, line: &str) {
        let _ = self.inject.send(line.to_string());
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }
}

fn reply_block(number: u64, output: &[String], terminator: &str) -> String {
    let mut block = format!("%begin 1700000000 {number} 1\n");
    for line in output {
        block.push_str(line);
        block.push('\n');
    }
    block.push_str(&format!("{terminator} 1700000000 {number} 1\n"));
    block
}
