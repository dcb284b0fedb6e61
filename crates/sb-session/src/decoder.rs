//! Streaming decoder for the host's input channel.
//!
//! Input arrives in arbitrary chunks. The decoder reassembles UTF-8 across
//! chunk boundaries, strips the NUL probe trigger, and pulls resize
//! directives (`ESC [ 8 ; rows ; cols t`) out of the text. Everything else
//! passes through in order.

use std::sync::LazyLock;
use std::time::{Duration, Instant};

use regex::Regex;
use sb_core::types::TerminalSize;
use tracing::debug;

static RESIZE_DIRECTIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[8;([0-9]+);([0-9]+)t").expect("valid resize directive regex")
});

/// Matches any strict prefix of a resize directive, starting at its ESC.
static RESIZE_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\x1b(?:\[(?:8(?:;(?:[0-9]+(?:;[0-9]*)?)?)?)?)?$")
        .expect("valid resize prefix regex")
});

/// Longest directive prefix worth holding back.
pub const MAX_HELD_BYTES: usize = 24;

const FORCE_PROBE_BYTE: char = '\0';

/// What one batch of input turned into.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecoderOutput {
    /// Text to forward to the PTY.
    pub text: String,
    /// Resize directives in the order they appeared.
    pub resizes: Vec<TerminalSize>,
    /// A NUL arrived outside the cooldown window.
    pub force_probe: bool,
}

impl DecoderOutput {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.resizes.is_empty() && !self.force_probe
    }
}

#[derive(Debug)]
pub struct InputDecoder {
    /// Undecoded trailing bytes, at most one incomplete UTF-8 sequence.
    carry: Vec<u8>,
    /// Decoded text that may still turn into a resize directive.
    held: String,
    held_since: Option<Instant>,
    last_forced_probe: Option<Instant>,
    force_cooldown: Duration,
    hold_window: Duration,
    resync_drops: u64,
}

impl InputDecoder {
    pub fn new(force_cooldown: Duration, hold_window: Duration) -> Self {
        Self {
            carry: Vec::with_capacity(4),
            held: String::new(),
            held_since: None,
            last_forced_probe: None,
            force_cooldown,
            hold_window,
            resync_drops: 0,
        }
    }

    /// Process one chunk read from the input channel.
    pub fn feed(&mut self, bytes: &[u8], now: Instant) -> DecoderOutput {
        self.carry.extend_from_slice(bytes);
        let decoded = self.decode_carry();

        let mut out = DecoderOutput::default();

        let nul_count = decoded.matches(FORCE_PROBE_BYTE).count();
        let decoded = if nul_count > 0 {
            if self.force_probe_due(now) {
                self.last_forced_probe = Some(now);
                out.force_probe = true;
            } else {
                debug!(nul_count, "probe trigger within cooldown, ignored");
            }
            decoded.replace(FORCE_PROBE_BYTE, "")
        } else {
            decoded
        };

        let had_held = !self.held.is_empty();
        let mut combined = std::mem::take(&mut self.held);
        combined.push_str(&decoded);

        let body_len = match held_suffix_start(&combined) {
            Some(start) => {
                // Still the same pending prefix when it begins where the old
                // one did.
                if !(start == 0 && had_held) {
                    self.held_since = Some(now);
                }
                self.held = combined[start..].to_string();
                start
            }
            None => {
                self.held_since = None;
                combined.len()
            }
        };

        out.text = extract_resizes(&combined[..body_len], &mut out.resizes);
        out
    }

    /// Release held text once it has waited out the hold window.
    pub fn flush_expired(&mut self, now: Instant) -> Option<String> {
        let deadline = self.hold_deadline()?;
        if now >= deadline {
            Some(self.flush())
        } else {
            None
        }
    }

    /// Release held text unconditionally.
    pub fn flush(&mut self) -> String {
        self.held_since = None;
        std::mem::take(&mut self.held)
    }

    /// When held text will be released if nothing else arrives.
    pub fn hold_deadline(&self) -> Option<Instant> {
        if self.held.is_empty() {
            return None;
        }
        self.held_since.map(|since| since + self.hold_window)
    }

    /// Bytes waiting for the rest of a UTF-8 sequence.
    pub fn pending_bytes(&self) -> usize {
        self.carry.len()
    }

    pub fn held_text(&self) -> &str {
        &self.held
    }

    /// Bytes discarded to resynchronise on invalid input.
    pub fn resync_drops(&self) -> u64 {
        self.resync_drops
    }

    pub fn reset(&mut self) {
        self.carry.clear();
        self.held.clear();
        self.held_since = None;
        self.last_forced_probe = None;
        self.resync_drops = 0;
    }

    fn force_probe_due(&self, now: Instant) -> bool {
        match self.last_forced_probe {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.force_cooldown,
        }
    }

    /// Decode as much of the carry buffer as possible.
    ///
    /// An incomplete trailing sequence stays buffered. An invalid byte at the
    /// front is dropped when more bytes follow it; on its own it waits.
    fn decode_carry(&mut self) -> String {
        let mut text = String::new();
        loop {
            match std::str::from_utf8(&self.carry) {
                Ok(valid) => {
                    text.push_str(valid);
                    self.carry.clear();
                    return text;
                }
                Err(e) => {
                    let valid_up_to = e.valid_up_to();
                    let invalid = e.error_len().is_some();
                    if valid_up_to > 0 {
                        if let Ok(prefix) = std::str::from_utf8(&self.carry[..valid_up_to]) {
                            text.push_str(prefix);
                        }
                        self.carry.drain(..valid_up_to);
                    }
                    if !invalid || self.carry.len() <= 1 {
                        return text;
                    }
                    let dropped = self.carry.remove(0);
                    self.resync_drops += 1;
                    debug!(byte = dropped, "dropped undecodable input byte");
                }
            }
        }
    }
}

impl Default for InputDecoder {
    fn default() -> Self {
        Self::new(Duration::from_millis(1500), Duration::from_millis(50))
    }
}

/// Start of a trailing run that could still grow into a resize directive.
fn held_suffix_start(text: &str) -> Option<usize> {
    let start = text.rfind('\x1b')?;
    let suffix = &text[start..];
    (suffix.len() <= MAX_HELD_BYTES && RESIZE_PREFIX.is_match(suffix)).then_some(start)
}

/// Remove every resize directive from `text`, collecting valid sizes.
fn extract_resizes(text: &str, resizes: &mut Vec<TerminalSize>) -> String {
    let mut cleaned = String::with_capacity(text.len());
    let mut last = 0;
    for caps in RESIZE_DIRECTIVE.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        cleaned.push_str(&text[last..whole.start()]);
        last = whole.end();

        let rows = caps[1].parse::<u16>().ok();
        let cols = caps[2].parse::<u16>().ok();
        match rows.zip(cols).and_then(|(rows, cols)| TerminalSize::new(rows, cols)) {
            Some(size) => resizes.push(size),
            None => debug!(directive = ?whole.as_str(), "ignoring unusable resize directive"),
        }
    }
    cleaned.push_str(&text[last..]);
    cleaned
}
