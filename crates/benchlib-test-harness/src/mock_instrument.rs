//! Scripted SCPI instrument for driving whole acquisitions in tests.
//!
//! Where [`MockTransport`](crate::MockTransport) insists on an exact,
//! ordered command sequence, [`MockInstrument`] behaves like a forgiving
//! instrument: it answers the queries it has been scripted for, in any
//! order and as often as they are asked, silently accepts every other
//! command, and records everything it received.
//!
//! Replies can be fixed, can step through a sequence, or can change with
//! (tokio) time, which together with `#[tokio::test(start_paused = true)]`
//! lets trigger-status polling be tested deterministically.
//!
//! ```
//! use benchlib_test_harness::MockInstrument;
//! use std::time::Duration;
//!
//! let scope = MockInstrument::new();
//! scope.reply("*IDN?", "RIGOL TECHNOLOGIES,DS1104Z,DS1ZA0001,00.04.04");
//! scope.reply_timed(":TRIG:STAT?", &[(Duration::ZERO, "WAIT"), (Duration::from_millis(500), "TD")]);
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use benchlib_core::error::{Error, Result};
use benchlib_core::transport::Transport;

/// How a scripted query is answered.
#[derive(Debug, Clone)]
enum Script {
    /// Always the same reply.
    Fixed(Vec<u8>),
    /// Replies in turn; the last one repeats.
    Sequence { replies: Vec<Vec<u8>>, next: usize },
    /// The reply with the greatest offset not after the time elapsed since
    /// the query was first asked.
    Timed {
        steps: Vec<(Duration, Vec<u8>)>,
        first_asked: Option<Instant>,
    },
}

impl Script {
    fn answer(&mut self) -> Option<Vec<u8>> {
        match self {
            Script::Fixed(reply) => Some(reply.clone()),
            Script::Sequence { replies, next } => {
                let reply = replies.get(*next).or_else(|| replies.last()).cloned();
                if *next < replies.len() {
                    *next += 1;
                }
                reply
            }
            Script::Timed { steps, first_asked } => {
                let elapsed = first_asked.get_or_insert_with(Instant::now).elapsed();
                steps
                    .iter()
                    .filter(|(offset, _)| *offset <= elapsed)
                    .max_by_key(|(offset, _)| *offset)
                    .map(|(_, reply)| reply.clone())
            }
        }
    }
}

#[derive(Debug)]
struct State {
    scripts: HashMap<String, Script>,
    /// One-shot raw replies, consumed before any script for the command.
    raw: HashMap<String, VecDeque<Vec<u8>>>,
    pending: VecDeque<u8>,
    commands: Vec<String>,
    connected: bool,
    chunk_size: usize,
}

/// A scripted oscilloscope implementing [`Transport`].
///
/// Clones share state, so a test can hand one clone to the driver under
/// test and keep another to add scripts and inspect the command log.
///
/// `*OPC?` answers `1` unless scripted otherwise.
#[derive(Debug, Clone)]
pub struct MockInstrument {
    state: Arc<Mutex<State>>,
}

fn line(text: &str) -> Vec<u8> {
    let mut bytes = text.as_bytes().to_vec();
    bytes.push(b'\n');
    bytes
}

impl MockInstrument {
    /// Create a connected instrument with no scripts.
    pub fn new() -> Self {
        let mut scripts = HashMap::new();
        scripts.insert("*OPC?".to_string(), Script::Fixed(line("1")));
        MockInstrument {
            state: Arc::new(Mutex::new(State {
                scripts,
                raw: HashMap::new(),
                pending: VecDeque::new(),
                commands: Vec::new(),
                connected: true,
                chunk_size: usize::MAX,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Always answer `query` with `text` plus a newline.
    pub fn reply(&self, query: &str, text: &str) {
        self.lock()
            .scripts
            .insert(query.to_string(), Script::Fixed(line(text)));
    }

    /// Answer `query` with each of `texts` in turn, repeating the last.
    pub fn reply_sequence(&self, query: &str, texts: &[&str]) {
        self.lock().scripts.insert(
            query.to_string(),
            Script::Sequence {
                replies: texts.iter().map(|t| line(t)).collect(),
                next: 0,
            },
        );
    }

    /// Answer `query` depending on how long ago it was first asked.
    ///
    /// Each step is `(offset, text)`. Before the smallest offset the query
    /// goes unanswered.
    pub fn reply_timed(&self, query: &str, steps: &[(Duration, &str)]) {
        self.lock().scripts.insert(
            query.to_string(),
            Script::Timed {
                steps: steps.iter().map(|(d, t)| (*d, line(t))).collect(),
                first_asked: None,
            },
        );
    }

    /// Queue raw bytes sent back, once, the next time `command` arrives.
    ///
    /// Queued replies take precedence over scripts and work for commands
    /// without a `?` as well.
    pub fn queue_raw(&self, command: &str, bytes: &[u8]) {
        self.lock()
            .raw
            .entry(command.to_string())
            .or_default()
            .push_back(bytes.to_vec());
    }

    /// Make bytes readable without any command.
    pub fn push_bytes(&self, bytes: &[u8]) {
        self.lock().pending.extend(bytes);
    }

    /// Every command received so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    /// How many times `command` has been received.
    pub fn count(&self, command: &str) -> usize {
        self.lock().commands.iter().filter(|c| *c == command).count()
    }

    /// Forget the command log.
    pub fn clear_commands(&self) {
        self.lock().commands.clear();
    }

    /// Number of reply bytes not yet read.
    pub fn unread(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn set_connected(&self, connected: bool) {
        self.lock().connected = connected;
    }

    /// Hand out at most `chunk_size` bytes per read.
    pub fn set_chunk_size(&self, chunk_size: usize) {
        self.lock().chunk_size = chunk_size.max(1);
    }
}

impl Default for MockInstrument {
    fn default() -> Self {
        Self::new()
    }
}

/// Frame `payload` the way Rigol firmware does: `#9`, nine length digits,
/// the payload and a trailing newline.
pub fn ieee_block(payload: &[u8]) -> Vec<u8> {
    let mut out = format!("#9{:09}", payload.len()).into_bytes();
    out.extend_from_slice(payload);
    out.push(b'\n');
    out
}

#[async_trait]
impl Transport for MockInstrument {
    async fn open(&mut self) -> Result<()> {
        self.lock().connected = true;
        Ok(())
    }

    fn terminator(&self) -> &'static str {
        "\n"
    }

    async fn send(&mut self, command: &str) -> Result<usize> {
        let mut state = self.lock();
        if !state.connected {
            return Err(Error::NotConnected);
        }
        state.commands.push(command.to_string());
        tracing::trace!(command, "Mock instrument received");

        let raw = state.raw.get_mut(command).and_then(|queue| queue.pop_front());
        let reply = match raw {
            Some(bytes) => Some(bytes),
            None => state.scripts.get_mut(command).and_then(Script::answer),
        };
        if let Some(reply) = reply {
            state.pending.extend(reply);
        }
        Ok(command.len() + 1)
    }

    async fn read_begin(&mut self) -> Result<()> {
        Ok(())
    }

    async fn read_data(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.lock();
        if !state.connected {
            return Err(Error::NotConnected);
        }
        let n = buf.len().min(state.pending.len()).min(state.chunk_size);
        for (slot, byte) in buf.iter_mut().zip(state.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn read_complete(&self) -> bool {
        self.lock().pending.is_empty()
    }

    async fn close(&mut self) -> Result<()> {
        let mut state = self.lock();
        state.connected = false;
        state.pending.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }

    fn description(&self) -> String {
        "mock-instrument".to_string()
    }
}
