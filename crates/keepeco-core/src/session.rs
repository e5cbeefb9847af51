//! Interactive copy loop for one selected entry.
//!
//! Each round waits for either a key press or the inactivity timeout. `u`,
//! `U` and `p` copy a field and wait again; Enter copies the password and
//! ends the session; anything else ends it immediately.

use crate::db::{Database, Entry, ProtectedError, PASSWORD, TITLE, URL, USERNAME};
use async_trait::async_trait;
use std::io::{self, Write};
use std::time::Duration;
use tracing::warn;
use zeroize::Zeroizing;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(180);

// ── Collaborators ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamedKey {
    Enter,
    Escape,
    Tab,
    Backspace,
    Other,
}

/// A single captured key press.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEvent {
    Char(char),
    Named(NamedKey),
}

#[async_trait]
pub trait KeySource: Send {
    /// Resolves with the next key press. Dropping the future abandons the wait.
    async fn next_key(&mut self) -> io::Result<KeyEvent>;

    /// Waits until an abandoned `next_key` has given the terminal back.
    async fn release(&mut self) {}
}

pub trait Clipboard {
    fn write_text(&mut self, text: &str) -> anyhow::Result<()>;
}

// ── State machine ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyAction {
    UserName,
    Url,
    /// `then_quit` is set for Enter, which copies once and leaves.
    Password { then_quit: bool },
    Quit,
}

impl CopyAction {
    pub fn for_key(key: KeyEvent) -> Self {
        match key {
            KeyEvent::Char('u') => CopyAction::UserName,
            KeyEvent::Char('U') => CopyAction::Url,
            KeyEvent::Char('p') => CopyAction::Password { then_quit: false },
            KeyEvent::Char(_) => CopyAction::Quit,
            KeyEvent::Named(NamedKey::Enter) => CopyAction::Password { then_quit: true },
            KeyEvent::Named(_) => CopyAction::Quit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Expired,
    Quit,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("terminal: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Protected(#[from] ProtectedError),
}

pub struct CopySession<'a, W: Write> {
    database: &'a mut Database,
    entry: &'a Entry,
    clipboard: &'a mut dyn Clipboard,
    keys: &'a mut dyn KeySource,
    out: W,
    timeout: Duration,
}

impl<'a, W: Write> CopySession<'a, W> {
    pub fn new(
        database: &'a mut Database,
        entry: &'a Entry,
        clipboard: &'a mut dyn Clipboard,
        keys: &'a mut dyn KeySource,
        out: W,
    ) -> Self {
        Self {
            database,
            entry,
            clipboard,
            keys,
            out,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn run(mut self) -> Result<SessionEnd, SessionError> {
        self.present()?;
        loop {
            self.prompt()?;
            let key = tokio::select! {
                _ = tokio::time::sleep(self.timeout) => None,
                key = self.keys.next_key() => Some(key?),
            };
            let Some(key) = key else {
                self.keys.release().await;
                writeln!(
                    self.out,
                    "Exit because there was no operation for {} seconds",
                    self.timeout.as_secs()
                )?;
                return Ok(SessionEnd::Expired);
            };

            match CopyAction::for_key(key) {
                CopyAction::UserName => {
                    self.copy(USERNAME)?;
                    writeln!(self.out, "=> UserName copied.")?;
                }
                CopyAction::Url => {
                    self.copy(URL)?;
                    writeln!(self.out, "=> URL copied.")?;
                }
                CopyAction::Password { then_quit } => {
                    self.copy(PASSWORD)?;
                    writeln!(self.out, "=> Password copied.")?;
                    if then_quit {
                        return Ok(SessionEnd::Quit);
                    }
                }
                CopyAction::Quit => return Ok(SessionEnd::Quit),
            }
        }
    }

    fn present(&mut self) -> Result<(), SessionError> {
        let title = self.field(TITLE)?;
        let username = self.field(USERNAME)?;
        let url = self.field(URL)?;
        writeln!(self.out, "\"{}/{}\" selected.", self.entry.prefix, *title)?;
        writeln!(self.out, "Username: {}", *username)?;
        writeln!(self.out, "URL: {}", *url)?;
        Ok(())
    }

    fn prompt(&mut self) -> io::Result<()> {
        writeln!(self.out)?;
        writeln!(self.out, "Press ENTER to copy password and quit")?;
        writeln!(self.out, "or continuous copy? [p]Password [u]UserName [U]URL")?;
        self.out.flush()
    }

    /// Any field, protected or not, read under a scoped unlock.
    fn field(&mut self, key: &str) -> Result<Zeroizing<String>, ProtectedError> {
        let access = self.database.unlock_scoped();
        let value = access.reveal(self.entry, key)?;
        Ok(value)
    }

    fn copy(&mut self, key: &str) -> Result<(), ProtectedError> {
        let value = self.field(key)?;
        if let Err(e) = self.clipboard.write_text(&value) {
            warn!(field = key, error = %e, "clipboard write failed");
        }
        Ok(())
    }
}
