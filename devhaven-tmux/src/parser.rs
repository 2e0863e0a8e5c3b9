//! Control-mode line protocol parser
//!
//! tmux control mode speaks a line protocol on stdout:
//! - `%begin <time> <number> <flags>` ... `%end|%error <time> <number> <flags>`
//!   delimit the reply to one command
//! - any other line starting with `%` is an asynchronous notification
//!
//! Lines are handled as bytes because `%output` payloads carry raw UTF-8 that
//! tmux may split across two notifications. Only the payload is unescaped;
//! every other field is ASCII.

use crate::error::{Result, TmuxError};
use crate::types::{ParsedId, TmuxPaneId, TmuxSessionId, TmuxWindowId};

/// Asynchronous notification from the tmux server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Pane output (`%output` or `%extended-output`), already unescaped
    Output { pane_id: TmuxPaneId, data: Vec<u8> },
    WindowAdd { window_id: TmuxWindowId },
    WindowClose { window_id: TmuxWindowId },
    WindowRenamed { window_id: TmuxWindowId, name: String },
    /// The active pane of a window changed
    WindowPaneChanged {
        window_id: TmuxWindowId,
        pane_id: TmuxPaneId,
    },
    LayoutChange {
        window_id: TmuxWindowId,
        layout: String,
    },
    /// A pane entered or left a mode such as copy mode
    PaneModeChanged { pane_id: TmuxPaneId },
    /// tmux stopped sending output for a pane (pause-after)
    Pause { pane_id: TmuxPaneId },
    /// Output for a paused pane resumed
    Continue { pane_id: TmuxPaneId },
    SubscriptionChanged {
        name: String,
        value: String,
        window_id: Option<TmuxWindowId>,
        pane_id: Option<TmuxPaneId>,
    },
    /// The control client is now attached to a different session
    SessionChanged {
        session_id: TmuxSessionId,
        name: String,
    },
    SessionRenamed { name: String },
    /// The current window of the attached session changed
    SessionWindowChanged {
        session_id: TmuxSessionId,
        window_id: TmuxWindowId,
    },
    /// A session was created or destroyed somewhere on the server
    SessionsChanged,
    /// The control client is exiting; tmux may give a reason
    Exit { reason: Option<String> },
    /// Anything not recognised above
    Unknown { raw: String },
}

impl Notification {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::Output { .. } => "output",
            Notification::WindowAdd { .. } => "window-add",
            Notification::WindowClose { .. } => "window-close",
            Notification::WindowRenamed { .. } => "window-renamed",
            Notification::WindowPaneChanged { .. } => "window-pane-changed",
            Notification::LayoutChange { .. } => "layout-change",
            Notification::PaneModeChanged { .. } => "pane-mode-changed",
            Notification::Pause { .. } => "pause",
            Notification::Continue { .. } => "continue",
            Notification::SubscriptionChanged { .. } => "subscription-changed",
            Notification::SessionChanged { .. } => "session-changed",
            Notification::SessionRenamed { .. } => "session-renamed",
            Notification::SessionWindowChanged { .. } => "session-window-changed",
            Notification::SessionsChanged => "sessions-changed",
            Notification::Exit { .. } => "exit",
            Notification::Unknown { .. } => "unknown",
        }
    }
}

/// Header shared by `%begin`, `%end` and `%error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub time: i64,
    pub number: u64,
    pub flags: u32,
}

impl BlockHeader {
    /// Whether the block answers a command written by this control client,
    /// as opposed to the command tmux was started with.
    pub fn from_client(&self) -> bool {
        self.flags & 1 == 1
    }
}

/// One classified control-mode line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlLine {
    Begin(BlockHeader),
    End(BlockHeader),
    Error(BlockHeader),
    Notification(Notification),
    /// A line without a `%` prefix: command output inside a block
    Data(String),
}

// ============================================================================
// Line framing
// ============================================================================

/// Accumulates raw reads and yields complete lines.
///
/// Partial lines stay buffered until their newline arrives; the trailing
/// `\r` of CRLF endings is stripped.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every complete line it finishes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.pending[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            let mut line = &self.pending[start..end];
            if let Some(stripped) = line.strip_suffix(b"\r") {
                line = stripped;
            }
            lines.push(line.to_vec());
            start = end + 1;
        }
        self.pending.drain(..start);
        lines
    }

    /// Bytes waiting for a newline
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

// ============================================================================
// Line parsing
// ============================================================================

/// Classify one complete line (without its newline).
///
/// Unknown `%` keywords become [`Notification::Unknown`]; a known keyword
/// whose arguments do not parse is a [`TmuxError::Parse`].
pub fn parse_line(line: &[u8]) -> Result<ControlLine> {
    if line.first() != Some(&b'%') {
        return Ok(ControlLine::Data(String::from_utf8_lossy(line).into_owned()));
    }

    let (keyword, args) = match line.iter().position(|&b| b == b' ') {
        Some(pos) => (&line[..pos], &line[pos + 1..]),
        None => (line, &line[line.len()..]),
    };

    // %output is the hot path and the only one carrying binary payload
    match keyword {
        b"%output" => return parse_output(line, args).map(ControlLine::Notification),
        b"%extended-output" => {
            return parse_extended_output(line, args).map(ControlLine::Notification);
        }
        _ => {}
    }

    let raw = String::from_utf8_lossy(line);
    let untrimmed = String::from_utf8_lossy(args);
    let args = untrimmed.trim_end();

    let parsed = match keyword {
        b"%begin" => ControlLine::Begin(parse_header(&raw, args)?),
        b"%end" => ControlLine::End(parse_header(&raw, args)?),
        b"%error" => ControlLine::Error(parse_header(&raw, args)?),
        b"%window-add" => ControlLine::Notification(Notification::WindowAdd {
            window_id: window_arg(&raw, args)?,
        }),
        b"%window-close" => ControlLine::Notification(Notification::WindowClose {
            window_id: window_arg(&raw, args)?,
        }),
        b"%window-renamed" => {
            let (id, name) = split_first(args);
            ControlLine::Notification(Notification::WindowRenamed {
                window_id: window_arg(&raw, id)?,
                name: name.to_string(),
            })
        }
        b"%window-pane-changed" => {
            let (window, pane) = split_first(args);
            ControlLine::Notification(Notification::WindowPaneChanged {
                window_id: window_arg(&raw, window)?,
                pane_id: pane_arg(&raw, pane)?,
            })
        }
        b"%layout-change" => {
            let mut parts = args.split_whitespace();
            let window_id = window_arg(&raw, parts.next().unwrap_or_default())?;
            let layout = parts
                .next()
                .ok_or_else(|| TmuxError::parse(raw.to_string(), "missing layout"))?;
            ControlLine::Notification(Notification::LayoutChange {
                window_id,
                layout: layout.to_string(),
            })
        }
        b"%pane-mode-changed" => ControlLine::Notification(Notification::PaneModeChanged {
            pane_id: pane_arg(&raw, args)?,
        }),
        b"%pause" => ControlLine::Notification(Notification::Pause {
            pane_id: pane_arg(&raw, args)?,
        }),
        b"%continue" => ControlLine::Notification(Notification::Continue {
            pane_id: pane_arg(&raw, args)?,
        }),
        b"%subscription-changed" => {
            ControlLine::Notification(parse_subscription_changed(&raw, &untrimmed)?)
        }
        b"%session-changed" => {
            let (id, name) = split_first(args);
            ControlLine::Notification(Notification::SessionChanged {
                session_id: session_arg(&raw, id)?,
                name: name.to_string(),
            })
        }
        b"%session-renamed" => {
            // tmux >= 2.9 prefixes the session id
            let (first, rest) = split_first(args);
            let name = match ParsedId::parse(first) {
                Some(ParsedId::Session(_)) => rest,
                _ => args,
            };
            ControlLine::Notification(Notification::SessionRenamed {
                name: name.to_string(),
            })
        }
        b"%session-window-changed" => {
            let (session, window) = split_first(args);
            ControlLine::Notification(Notification::SessionWindowChanged {
                session_id: session_arg(&raw, session)?,
                window_id: window_arg(&raw, window)?,
            })
        }
        b"%sessions-changed" => ControlLine::Notification(Notification::SessionsChanged),
        b"%exit" => ControlLine::Notification(Notification::Exit {
            reason: (!args.is_empty()).then(|| args.to_string()),
        }),
        _ => ControlLine::Notification(Notification::Unknown {
            raw: raw.into_owned(),
        }),
    };
    Ok(parsed)
}

/// Decode tmux's octal escaping (`\ooo`) of output payloads.
///
/// A backslash not followed by three octal digits is kept literally.
pub fn unescape_output(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;

    while i < data.len() {
        if data[i] == b'\\'
            && i + 3 < data.len()
            && data[i + 1..=i + 3].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let value = (data[i + 1] - b'0') as u16 * 64
                + (data[i + 2] - b'0') as u16 * 8
                + (data[i + 3] - b'0') as u16;
            if value <= u8::MAX as u16 {
                out.push(value as u8);
                i += 4;
                continue;
            }
        }
        out.push(data[i]);
        i += 1;
    }

    out
}

fn parse_output(line: &[u8], args: &[u8]) -> Result<Notification> {
    let (pane, data) = match args.iter().position(|&b| b == b' ') {
        Some(pos) => (&args[..pos], &args[pos + 1..]),
        None => (args, &args[args.len()..]),
    };
    let pane_id = pane_arg(&String::from_utf8_lossy(line), &String::from_utf8_lossy(pane))?;
    Ok(Notification::Output {
        pane_id,
        data: unescape_output(data),
    })
}

/// `%extended-output %N <age> ... : <data>`
fn parse_extended_output(line: &[u8], args: &[u8]) -> Result<Notification> {
    let raw = String::from_utf8_lossy(line);
    let separator = find_subslice(args, b" : ")
        .ok_or_else(|| TmuxError::parse(raw.to_string(), "missing ' : ' separator"))?;
    let meta = String::from_utf8_lossy(&args[..separator]);
    let pane = meta.split_whitespace().next().unwrap_or_default();
    Ok(Notification::Output {
        pane_id: pane_arg(&raw, pane)?,
        data: unescape_output(&args[separator + 3..]),
    })
}

/// `%subscription-changed <name> $S @W <index> %P ... : <value>`
///
/// Window and pane fields are `-` when the subscription is not scoped to one.
fn parse_subscription_changed(raw: &str, args: &str) -> Result<Notification> {
    let (meta, value) = match args.find(" : ") {
        Some(pos) => (&args[..pos], &args[pos + 3..]),
        None => (args, ""),
    };
    let mut tokens = meta.split_whitespace();
    let name = tokens
        .next()
        .ok_or_else(|| TmuxError::parse(raw, "missing subscription name"))?;

    let mut window_id = None;
    let mut pane_id = None;
    for token in tokens {
        match ParsedId::parse(token) {
            Some(ParsedId::Window(id)) if window_id.is_none() => window_id = Some(id),
            Some(ParsedId::Pane(id)) if pane_id.is_none() => pane_id = Some(id),
            _ => {}
        }
    }

    Ok(Notification::SubscriptionChanged {
        name: name.to_string(),
        value: value.to_string(),
        window_id,
        pane_id,
    })
}

fn parse_header(raw: &str, args: &str) -> Result<BlockHeader> {
    let mut parts = args.split_whitespace();
    let mut field = |what: &str| {
        parts
            .next()
            .ok_or_else(|| TmuxError::parse(raw, format!("missing {what}")))
    };
    let time = field("time")?
        .parse()
        .map_err(|_| TmuxError::parse(raw, "bad time"))?;
    let number = field("command number")?
        .parse()
        .map_err(|_| TmuxError::parse(raw, "bad command number"))?;
    let flags = match parts.next() {
        Some(flags) => flags
            .parse()
            .map_err(|_| TmuxError::parse(raw, "bad flags"))?,
        None => 0,
    };
    Ok(BlockHeader {
        time,
        number,
        flags,
    })
}

fn split_first(args: &str) -> (&str, &str) {
    match args.split_once(' ') {
        Some((first, rest)) => (first, rest),
        None => (args, ""),
    }
}

fn pane_arg(raw: &str, token: &str) -> Result<TmuxPaneId> {
    ParsedId::parse(token.trim())
        .and_then(ParsedId::as_pane)
        .ok_or_else(|| TmuxError::parse(raw, format!("expected pane id, got {token:?}")))
}

fn window_arg(raw: &str, token: &str) -> Result<TmuxWindowId> {
    ParsedId::parse(token.trim())
        .and_then(ParsedId::as_window)
        .ok_or_else(|| TmuxError::parse(raw, format!("expected window id, got {token:?}")))
}

fn session_arg(raw: &str, token: &str) -> Result<TmuxSessionId> {
    ParsedId::parse(token.trim())
        .and_then(ParsedId::as_session)
        .ok_or_else(|| TmuxError::parse(raw, format!("expected session id, got {token:?}")))
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
