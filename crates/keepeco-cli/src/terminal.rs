//! Terminal-facing implementations of the core collaborator traits.

use async_trait::async_trait;
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use dialoguer::FuzzySelect;
use keepeco_core::{Chooser, Clipboard, KeyEvent, KeySource, NamedKey, Secret};
use std::io::{self, Read};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

// ── Keys ────────────────────────────────────────────────────────────────────

/// Reads single key presses in raw mode.
///
/// Raw mode is only held while a read is outstanding, so everything the
/// session prints between keys lands on a cooked terminal.
#[derive(Debug, Default)]
pub struct TerminalKeys {
    reader: Option<JoinHandle<()>>,
}

#[async_trait]
impl KeySource for TerminalKeys {
    async fn next_key(&mut self) -> io::Result<KeyEvent> {
        self.release().await;
        let (tx, rx) = oneshot::channel();
        self.reader = Some(tokio::task::spawn_blocking(move || {
            let outcome = read_key(|| tx.is_closed());
            if let Some(result) = outcome.transpose() {
                let _ = tx.send(result);
            }
        }));
        rx.await
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "key reader stopped"))?
    }

    /// The reader notices a dropped receiver within one poll interval and
    /// leaves raw mode on its way out.
    async fn release(&mut self) {
        if let Some(reader) = self.reader.take() {
            let _ = reader.await;
        }
    }
}

struct RawMode;

impl RawMode {
    fn enable() -> io::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

/// Blocks until a key is pressed. Returns `Ok(None)` once `abandoned`
/// reports that nobody is waiting for the answer any more.
fn read_key(abandoned: impl Fn() -> bool) -> io::Result<Option<KeyEvent>> {
    let _raw = RawMode::enable()?;
    while !abandoned() {
        if !event::poll(POLL_INTERVAL)? {
            continue;
        }
        if let Event::Key(key) = event::read()? {
            if key.kind == KeyEventKind::Press {
                return Ok(Some(translate(key)));
            }
        }
    }
    Ok(None)
}

fn translate(key: event::KeyEvent) -> KeyEvent {
    match key.code {
        KeyCode::Char(c)
            if !key
                .modifiers
                .intersects(KeyModifiers::CONTROL | KeyModifiers::ALT) =>
        {
            KeyEvent::Char(c)
        }
        KeyCode::Enter => KeyEvent::Named(NamedKey::Enter),
        KeyCode::Esc => KeyEvent::Named(NamedKey::Escape),
        KeyCode::Tab => KeyEvent::Named(NamedKey::Tab),
        KeyCode::Backspace => KeyEvent::Named(NamedKey::Backspace),
        _ => KeyEvent::Named(NamedKey::Other),
    }
}

// ── Clipboard ───────────────────────────────────────────────────────────────

/// Marks the helper process that owns a copied value on Linux.
pub const CLIPBOARD_HELPER_ENV: &str = "KEEPECO_CLIPBOARD_HELPER";

/// System clipboard.
///
/// X11 selections vanish with the process that owns them, so on Linux each
/// copy is handed to a detached helper (this binary, re-executed with
/// [`CLIPBOARD_HELPER_ENV`] set) that holds the value until another client
/// takes the selection over. Elsewhere the clipboard is written in-process.
#[derive(Default)]
pub struct SystemClipboard {
    #[cfg(target_os = "linux")]
    helpers: Vec<std::process::Child>,
    #[cfg(not(target_os = "linux"))]
    inner: Option<arboard::Clipboard>,
}

#[cfg(target_os = "linux")]
impl Clipboard for SystemClipboard {
    fn write_text(&mut self, text: &str) -> anyhow::Result<()> {
        use std::io::Write;
        use std::process::{Command, Stdio};

        // Earlier helpers exit once the new one takes the selection.
        self.helpers
            .retain_mut(|child| matches!(child.try_wait(), Ok(None)));

        let mut child = Command::new(std::env::current_exe()?)
            .env(CLIPBOARD_HELPER_ENV, "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        let stdin = child.stdin.take();
        self.helpers.push(child);
        if let Some(mut stdin) = stdin {
            stdin.write_all(text.as_bytes())?;
        }
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
impl Clipboard for SystemClipboard {
    fn write_text(&mut self, text: &str) -> anyhow::Result<()> {
        let clipboard = match self.inner.take() {
            Some(clipboard) => clipboard,
            None => arboard::Clipboard::new()?,
        };
        self.inner.insert(clipboard).set_text(text)?;
        Ok(())
    }
}

pub fn is_clipboard_helper() -> bool {
    cfg!(target_os = "linux") && std::env::var_os(CLIPBOARD_HELPER_ENV).is_some()
}

/// Body of the helper process: take the value from stdin and keep serving it.
pub fn serve_clipboard() -> anyhow::Result<()> {
    let payload = read_payload(io::stdin().lock())?;
    let mut clipboard = arboard::Clipboard::new()?;
    hold_text(&mut clipboard, payload.expose())
}

fn read_payload(mut input: impl Read) -> io::Result<Secret> {
    let mut text = String::new();
    input.read_to_string(&mut text)?;
    Ok(Secret::new(text))
}

#[cfg(target_os = "linux")]
fn hold_text(clipboard: &mut arboard::Clipboard, text: &str) -> anyhow::Result<()> {
    use arboard::SetExtLinux;
    clipboard.set().wait().text(text)?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn hold_text(clipboard: &mut arboard::Clipboard, text: &str) -> anyhow::Result<()> {
    clipboard.set_text(text)?;
    Ok(())
}

// ── Chooser ─────────────────────────────────────────────────────────────────

pub struct FuzzyChooser {
    prompt: String,
}

impl FuzzyChooser {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
        }
    }
}

impl Chooser for FuzzyChooser {
    fn choose(&mut self, candidates: &[String]) -> io::Result<Option<usize>> {
        if candidates.is_empty() {
            return Ok(None);
        }
        FuzzySelect::new()
            .with_prompt(self.prompt.as_str())
            .items(candidates)
            .default(0)
            .interact_opt()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}
