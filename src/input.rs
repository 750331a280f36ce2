//! Password entry: key events, the wipe-on-drop entry buffer and the key queue.
//!
//! Passwords may mix typed characters with arrow keys. Arrow keys are folded
//! into the byte representation as two-byte markers, a NUL followed by one
//! of four control bytes. Typed text never contains control characters (they
//! are refused on entry), so a marker can never be confused with user text.

use std::fmt;

use tokio::sync::mpsc;
use zeroize::{Zeroize, Zeroizing};

const MARKER_PREFIX: u8 = 0x00;
const MARKER_LEN: usize = 2;
const INITIAL_CAPACITY: usize = 256;

/// Default bound for the producer/consumer key queue.
pub const KEY_QUEUE_CAPACITY: usize = 16;

/// An arrow key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    pub const ALL: [Direction; 4] = [
        Direction::Up,
        Direction::Down,
        Direction::Left,
        Direction::Right,
    ];

    /// The reserved byte pair standing for this key inside a password.
    pub const fn marker(self) -> [u8; MARKER_LEN] {
        let id = match self {
            Direction::Up => 0x01,
            Direction::Down => 0x02,
            Direction::Left => 0x03,
            Direction::Right => 0x04,
        };
        [MARKER_PREFIX, id]
    }

    fn from_marker(bytes: &[u8]) -> Option<Direction> {
        match bytes {
            [MARKER_PREFIX, 0x01] => Some(Direction::Up),
            [MARKER_PREFIX, 0x02] => Some(Direction::Down),
            [MARKER_PREFIX, 0x03] => Some(Direction::Left),
            [MARKER_PREFIX, 0x04] => Some(Direction::Right),
            _ => None,
        }
    }

    /// Arrow shown to the user when this key is entered.
    pub const fn glyph(self) -> char {
        match self {
            Direction::Up => '\u{2191}',
            Direction::Down => '\u{2193}',
            Direction::Left => '\u{2190}',
            Direction::Right => '\u{2192}',
        }
    }
}

/// One logical unit of password input.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum EntryKey {
    Char(char),
    Arrow(Direction),
}

impl fmt::Debug for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryKey::Char(_) => write!(f, "Char(*)"),
            EntryKey::Arrow(dir) => write!(f, "Arrow({:?})", dir),
        }
    }
}

/// What the terminal layer reports for each captured keystroke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryAction {
    Key(EntryKey),
    Backspace,
    /// Enter: verify what has been typed
    Submit,
    /// Escape: discard what has been typed
    Cancel,
    /// Ctrl-C
    Interrupt,
}

/// How a logical unit is drawn: masked, or the arrow that was pressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Glyph {
    Masked,
    Arrow(Direction),
}

impl Glyph {
    pub const fn symbol(self) -> char {
        match self {
            Glyph::Masked => '*',
            Glyph::Arrow(dir) => dir.glyph(),
        }
    }
}

fn is_continuation(byte: u8) -> bool {
    byte & 0xC0 == 0x80
}

fn ends_with_marker(data: &[u8]) -> bool {
    data.len() >= MARKER_LEN && Direction::from_marker(&data[data.len() - MARKER_LEN..]).is_some()
}

/// Accumulates a password as it is typed.
///
/// Every path that discards bytes overwrites them first: backspace, clear,
/// growth into a larger allocation, and drop.
pub struct SecureBuffer {
    data: Zeroizing<Vec<u8>>,
}

impl SecureBuffer {
    pub fn new() -> Self {
        Self {
            data: Zeroizing::new(Vec::with_capacity(INITIAL_CAPACITY)),
        }
    }

    /// Append one logical unit. Returns false if the key was refused.
    pub fn push(&mut self, key: EntryKey) -> bool {
        match key {
            EntryKey::Char(c) => self.append_char(c),
            EntryKey::Arrow(dir) => {
                self.append_marker(dir);
                true
            }
        }
    }

    /// Append a UTF-8 encoded character. Control characters are refused.
    pub fn append_char(&mut self, c: char) -> bool {
        if c.is_control() {
            return false;
        }
        let mut encoded = [0u8; 4];
        let bytes = c.encode_utf8(&mut encoded).as_bytes();
        self.extend(bytes);
        encoded.zeroize();
        true
    }

    pub fn append_marker(&mut self, dir: Direction) {
        self.extend(&dir.marker());
    }

    fn extend(&mut self, bytes: &[u8]) {
        let needed = self.data.len() + bytes.len();
        if needed > self.data.capacity() {
            let mut grown = Zeroizing::new(Vec::with_capacity(needed.max(self.data.capacity() * 2)));
            grown.extend_from_slice(&self.data);
            // The old allocation is zeroized when `grown` drops
            std::mem::swap(&mut self.data, &mut grown);
        }
        self.data.extend_from_slice(bytes);
    }

    /// Remove the last logical unit: an arrow marker or one character.
    ///
    /// Returns false if the buffer was already empty.
    pub fn backspace(&mut self) -> bool {
        let len = self.data.len();
        if len == 0 {
            return false;
        }

        let remove = if ends_with_marker(&self.data) {
            MARKER_LEN
        } else {
            let mut n = 1;
            while n < len && n < 4 && is_continuation(self.data[len - n]) {
                n += 1;
            }
            n
        };

        let new_len = len - remove;
        self.data[new_len..].zeroize();
        self.data.truncate(new_len);
        true
    }

    /// Overwrite every byte with zero, then empty the buffer.
    pub fn clear(&mut self) {
        self.data.zeroize();
    }

    /// End of the entry session. Equivalent to [`clear`](Self::clear), then drop.
    pub fn destroy(mut self) {
        self.clear();
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of logical units (an arrow counts as one).
    pub fn visual_len(&self) -> usize {
        self.glyphs().len()
    }

    /// One glyph per logical unit, for drawing the entry field.
    pub fn glyphs(&self) -> Vec<Glyph> {
        let data = self.data.as_slice();
        let mut glyphs = Vec::new();
        let mut i = 0;
        while i < data.len() {
            if let Some(dir) = data
                .get(i..i + MARKER_LEN)
                .and_then(Direction::from_marker)
            {
                glyphs.push(Glyph::Arrow(dir));
                i += MARKER_LEN;
                continue;
            }
            if !is_continuation(data[i]) {
                glyphs.push(Glyph::Masked);
            }
            i += 1;
        }
        glyphs
    }

    /// Copy the contents out for verification.
    ///
    /// The copy lives in a [`Snapshot`] that wipes itself when dropped; there
    /// is no other way to read the bytes.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            bytes: Zeroizing::new(self.data.to_vec()),
        }
    }

    /// True if every byte of `range` in the allocation is zero, including
    /// bytes past the current length.
    #[cfg(test)]
    fn is_wiped(&self, range: std::ops::Range<usize>) -> bool {
        assert!(range.end <= self.data.capacity());
        let base = self.data.as_ptr();
        // SAFETY: `range` lies inside the allocation, and callers only ask
        // about bytes that were written before.
        range.into_iter().all(|i| unsafe { *base.add(i) } == 0)
    }
}

impl Default for SecureBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SecureBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecureBuffer([REDACTED; {} bytes])", self.data.len())
    }
}

/// A wipe-on-drop copy of a [`SecureBuffer`].
pub struct Snapshot {
    bytes: Zeroizing<Vec<u8>>,
}

impl Snapshot {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Snapshot([REDACTED; {} bytes])", self.bytes.len())
    }
}

/// Create a bounded FIFO between the input poller and the render loop.
pub fn key_queue(capacity: usize) -> (KeySender, KeyQueue) {
    let (tx, rx) = mpsc::channel(capacity);
    (KeySender(tx), KeyQueue(rx))
}

/// Producer half, owned by the input polling thread.
pub struct KeySender(mpsc::Sender<EntryAction>);

impl KeySender {
    /// Queue an action, waiting for room if the consumer is behind.
    ///
    /// Must be called from a plain thread, not from async code. Returns false
    /// once the consumer has gone away.
    pub fn push(&self, action: EntryAction) -> bool {
        self.0.blocking_send(action).is_ok()
    }
}

/// Consumer half, drained by the render loop once per frame.
pub struct KeyQueue(mpsc::Receiver<EntryAction>);

impl KeyQueue {
    /// Take the next queued action without waiting.
    pub fn poll(&mut self) -> Option<EntryAction> {
        self.0.try_recv().ok()
    }

    /// Take everything queued so far, oldest first.
    pub fn drain(&mut self) -> Vec<EntryAction> {
        std::iter::from_fn(|| self.poll()).collect()
    }

    /// Refuse further actions. A producer waiting for room is released.
    pub fn close(&mut self) {
        self.0.close();
    }
}
