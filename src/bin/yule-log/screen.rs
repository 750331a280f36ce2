//! Terminal side of the lock: the full screen lock loop and the password prompt.

use std::io::{self, BufRead, IsTerminal, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use color_eyre::eyre::{eyre, Result as EyreResult};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::style::{Print, PrintStyledContent, Stylize};
use crossterm::terminal::{self, ClearType};
use crossterm::{cursor, execute, queue};
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::{interval, MissedTickBehavior};
use yule_log::input::{
    key_queue, Direction, EntryAction, EntryKey, Glyph, KeyQueue, KeySender, SecureBuffer,
    KEY_QUEUE_CAPACITY,
};
use yule_log::{LockEpisode, LockError, UnlockOutcome};
use zeroize::Zeroizing;

use crate::commands::format_duration;

const REDRAW_INTERVAL: Duration = Duration::from_millis(30);
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

const BANNER: &str = "yule-log: session locked";
const HINT: &str = "Enter to unlock, Esc to clear";

/// Map a terminal key event to an entry action. Only presses count.
pub fn translate(key: KeyEvent) -> Option<EntryAction> {
    if key.kind != KeyEventKind::Press {
        return None;
    }
    let action = match key.code {
        KeyCode::Enter => EntryAction::Submit,
        KeyCode::Backspace => EntryAction::Backspace,
        KeyCode::Esc => EntryAction::Cancel,
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
            EntryAction::Interrupt
        }
        KeyCode::Up => EntryAction::Key(EntryKey::Arrow(Direction::Up)),
        KeyCode::Down => EntryAction::Key(EntryKey::Arrow(Direction::Down)),
        KeyCode::Left => EntryAction::Key(EntryKey::Arrow(Direction::Left)),
        KeyCode::Right => EntryAction::Key(EntryKey::Arrow(Direction::Right)),
        KeyCode::Char(c)
            if !key
                .modifiers
                .intersects(KeyModifiers::CONTROL | KeyModifiers::ALT) =>
        {
            EntryAction::Key(EntryKey::Char(c))
        }
        _ => return None,
    };
    Some(action)
}

/// Raw mode, plus the alternate screen for the lock loop. Restored on drop.
struct TerminalGuard {
    fullscreen: bool,
}

impl TerminalGuard {
    fn raw() -> io::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self { fullscreen: false })
    }

    fn fullscreen() -> io::Result<Self> {
        terminal::enable_raw_mode()?;
        let guard = Self { fullscreen: true };
        execute!(io::stdout(), terminal::EnterAlternateScreen, cursor::Hide)?;
        Ok(guard)
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        if self.fullscreen {
            if let Err(e) = execute!(io::stdout(), cursor::Show, terminal::LeaveAlternateScreen) {
                log::warn!("Failed to leave alternate screen: {}", e);
            }
        }
        if let Err(e) = terminal::disable_raw_mode() {
            log::warn!("Failed to restore terminal mode: {}", e);
        }
    }
}

/// Reads terminal events on a plain thread and feeds the key queue.
struct KeyPump {
    queue: KeyQueue,
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl KeyPump {
    fn spawn() -> io::Result<Self> {
        let (sender, queue) = key_queue(KEY_QUEUE_CAPACITY);
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let stop = stop.clone();
            thread::Builder::new()
                .name("key-input".into())
                .spawn(move || pump_keys(&sender, &stop))?
        };
        Ok(Self {
            queue,
            stop,
            handle: Some(handle),
        })
    }

    fn poll(&mut self) -> Option<EntryAction> {
        self.queue.poll()
    }

    fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }
}

impl Drop for KeyPump {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        self.queue.close();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Key input thread panicked");
            }
        }
    }
}

fn pump_keys(sender: &KeySender, stop: &AtomicBool) {
    while !stop.load(Ordering::Relaxed) {
        match event::poll(POLL_TIMEOUT) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                log::error!("Polling terminal input failed: {}", e);
                return;
            }
        }
        match event::read() {
            Ok(Event::Key(key)) => {
                if let Some(action) = translate(key) {
                    if !sender.push(action) {
                        return;
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                log::error!("Reading terminal input failed: {}", e);
                return;
            }
        }
    }
}

enum Exit {
    Unlocked(Vec<LockError>),
    Signal(&'static str),
    InputClosed,
}

/// Show the lock screen until the right password is entered.
///
/// SIGTERM and SIGHUP end the lock without a password so the socket is
/// never left restricted by a dying process.
#[tokio::main(flavor = "current_thread")]
pub async fn run_lock_screen(mut episode: LockEpisode) -> EyreResult<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;

    let terminal = TerminalGuard::fullscreen()?;
    let mut pump = KeyPump::spawn()?;
    let mut ticker = interval(REDRAW_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let locked_since = Instant::now();
    let mut stdout = io::stdout();

    let exit = loop {
        select! {
            _ = ticker.tick() => {
                if let Some(release_errors) = apply_keys(&mut episode, &mut pump) {
                    break Exit::Unlocked(release_errors);
                }
                if pump.is_finished() {
                    break Exit::InputClosed;
                }
                draw(&mut stdout, &episode, locked_since)?;
            }
            Some(_) = sigterm.recv() => break Exit::Signal("SIGTERM"),
            Some(_) = sighup.recv() => break Exit::Signal("SIGHUP"),
        }
    };

    drop(pump);
    drop(terminal);

    match exit {
        Exit::Unlocked(mut release_errors) => {
            if release_errors.is_empty() {
                Ok(())
            } else {
                let cause = release_errors.remove(0);
                Err(LockError::aggregate(cause, release_errors).into())
            }
        }
        Exit::Signal(name) => {
            log::info!("Exiting on {}", name);
            episode.abort()?;
            Ok(())
        }
        Exit::InputClosed => {
            episode.abort()?;
            Err(eyre!("terminal input closed; lock released"))
        }
    }
}

/// Feed queued keys to the episode; returns the release errors once unlocked.
fn apply_keys(episode: &mut LockEpisode, pump: &mut KeyPump) -> Option<Vec<LockError>> {
    while let Some(action) = pump.poll() {
        if let Some(UnlockOutcome::Unlocked { release_errors }) = episode.handle(action) {
            return Some(release_errors);
        }
    }
    None
}

fn draw(out: &mut impl Write, episode: &LockEpisode, locked_since: Instant) -> io::Result<()> {
    let (cols, rows) = terminal::size()?;
    let mid = rows / 2;
    let elapsed = format!("locked for {}", format_duration(locked_since.elapsed().as_secs()));
    let glyphs = episode.glyphs();

    centered_line(out, cols, mid.saturating_sub(2), BANNER)?;
    centered_line(out, cols, mid.saturating_sub(1), &elapsed)?;

    queue!(
        out,
        cursor::MoveTo(centered_column(cols, glyphs.len()), mid),
        terminal::Clear(ClearType::CurrentLine),
    )?;
    print_glyphs(out, &glyphs)?;

    centered_line(out, cols, mid.saturating_add(2), HINT)?;
    out.flush()
}

fn centered_column(cols: u16, width: usize) -> u16 {
    let width = u16::try_from(width).unwrap_or(cols);
    cols.saturating_sub(width) / 2
}

fn centered_line(out: &mut impl Write, cols: u16, row: u16, text: &str) -> io::Result<()> {
    queue!(
        out,
        cursor::MoveTo(0, row),
        terminal::Clear(ClearType::CurrentLine),
        cursor::MoveTo(centered_column(cols, text.chars().count()), row),
        Print(text),
    )
}

fn print_glyphs(out: &mut impl Write, glyphs: &[Glyph]) -> io::Result<()> {
    for glyph in glyphs {
        match glyph {
            Glyph::Masked => queue!(out, Print(glyph.symbol()))?,
            Glyph::Arrow(_) => queue!(out, PrintStyledContent(glyph.symbol().yellow()))?,
        }
    }
    Ok(())
}

/// Ask for a secret on the terminal, echoing one mask per logical unit.
///
/// Returns `None` if the user pressed Esc or Ctrl-C. When stdin is not a
/// terminal one line is read from it instead, without arrow keys.
pub fn prompt_secret(label: &str) -> io::Result<Option<SecureBuffer>> {
    if !io::stdin().is_terminal() {
        print!("{}", label);
        io::stdout().flush()?;
        let secret = read_secret_line();
        println!();
        return secret;
    }

    let _raw = TerminalGuard::raw()?;
    let mut out = io::stdout();
    let mut buffer = SecureBuffer::new();
    let start = u16::try_from(label.chars().count()).unwrap_or(0);
    execute!(out, Print(label))?;

    loop {
        let Event::Key(key) = event::read()? else {
            continue;
        };
        match translate(key) {
            Some(EntryAction::Key(key)) => {
                buffer.push(key);
            }
            Some(EntryAction::Backspace) => {
                buffer.backspace();
            }
            Some(EntryAction::Submit) => {
                execute!(out, Print("\r\n"))?;
                return Ok(Some(buffer));
            }
            Some(EntryAction::Cancel | EntryAction::Interrupt) => {
                execute!(out, Print("\r\n"))?;
                return Ok(None);
            }
            None => continue,
        }
        queue!(
            out,
            cursor::MoveToColumn(start),
            terminal::Clear(ClearType::UntilNewLine),
        )?;
        print_glyphs(&mut out, &buffer.glyphs())?;
        out.flush()?;
    }
}

fn read_secret_line() -> io::Result<Option<SecureBuffer>> {
    let mut line = Zeroizing::new(String::new());
    if io::stdin().lock().read_line(&mut line)? == 0 {
        return Ok(None);
    }
    let mut buffer = SecureBuffer::new();
    for c in line.trim_end_matches(['\r', '\n']).chars() {
        buffer.append_char(c);
    }
    Ok(Some(buffer))
}

/// Ask a yes/no question on stdin; anything but "y" or "yes" is no.
pub fn confirm(question: &str) -> io::Result<bool> {
    print!("{} [y/N] ", question);
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(
        answer.trim().to_ascii_lowercase().as_str(),
        "y" | "yes"
    ))
}
