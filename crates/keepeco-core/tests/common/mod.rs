#![allow(dead_code)]

use async_trait::async_trait;
use keepeco_core::db::{PASSWORD, TITLE, URL, USERNAME};
use keepeco_core::{
    Chooser, Clipboard, Database, DecodeError, Decoder, EntryRecord, Group, KeyEvent, KeySource,
    Keystore, KeystoreError, Secret,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn entry(title: &str) -> EntryRecord {
    EntryRecord::new()
        .with_field(TITLE, title)
        .with_field(USERNAME, &format!("{}-user", title.to_lowercase()))
        .with_field(URL, &format!("https://{}.example", title.to_lowercase()))
        .with_protected(PASSWORD, &format!("{}-pw", title.to_lowercase()))
}

/// Root with `/A/Login` and `/B/Site`.
pub fn sample_tree() -> Group {
    Group::new("Root")
        .with_group(Group::new("A").with_entry(entry("Login")))
        .with_group(Group::new("B").with_entry(entry("Site")))
}

// ── Decoder ─────────────────────────────────────────────────────────────────

pub struct ScriptedDecoder {
    root: Group,
    delay: Duration,
    failure: Option<String>,
    expected_secret: Option<String>,
    pub finished: Arc<AtomicBool>,
    pub calls: AtomicUsize,
}

impl ScriptedDecoder {
    pub fn new(root: Group) -> Self {
        Self {
            root,
            delay: Duration::ZERO,
            failure: None,
            expected_secret: None,
            finished: Arc::new(AtomicBool::new(false)),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self, reason: &str) -> Self {
        self.failure = Some(reason.to_string());
        self
    }

    pub fn expecting_secret(mut self, secret: &str) -> Self {
        self.expected_secret = Some(secret.to_string());
        self
    }
}

impl Decoder for ScriptedDecoder {
    fn open(&self, _path: &Path, secret: &Secret) -> Result<Database, DecodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        let result = if let Some(reason) = &self.failure {
            Err(DecodeError::Rejected(reason.clone()))
        } else if matches!(&self.expected_secret, Some(expected) if expected != secret.expose()) {
            Err(DecodeError::Rejected("invalid credentials".to_string()))
        } else {
            Ok(Database::new(self.root.clone())?)
        };
        self.finished.store(true, Ordering::SeqCst);
        result
    }
}

// ── Keystore ────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryKeystore {
    items: Mutex<HashMap<String, String>>,
    fail_writes: bool,
    pub writes: AtomicUsize,
}

impl MemoryKeystore {
    pub fn failing_writes() -> Self {
        Self {
            fail_writes: true,
            ..Self::default()
        }
    }

    pub fn stored(&self, service: &str) -> Option<String> {
        self.items.lock().get(service).cloned()
    }
}

impl Keystore for MemoryKeystore {
    fn get(&self, service: &str) -> Result<Secret, KeystoreError> {
        self.items
            .lock()
            .get(service)
            .map(|s| Secret::new(s.clone()))
            .ok_or(KeystoreError::NotFound)
    }

    fn set(&self, service: &str, secret: &Secret) -> Result<(), KeystoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes {
            return Err(KeystoreError::Backend("write refused".to_string()));
        }
        self.items
            .lock()
            .insert(service.to_string(), secret.expose().to_string());
        Ok(())
    }
}

// ── Chooser ─────────────────────────────────────────────────────────────────

pub struct ScriptedChooser {
    pick: Option<usize>,
    pub shown: Vec<Vec<String>>,
    watch: Option<Arc<AtomicBool>>,
    pub decode_done_when_shown: Vec<bool>,
}

impl ScriptedChooser {
    pub fn picking(index: usize) -> Self {
        Self {
            pick: Some(index),
            shown: Vec::new(),
            watch: None,
            decode_done_when_shown: Vec::new(),
        }
    }

    pub fn cancelling() -> Self {
        Self {
            pick: None,
            ..Self::picking(0)
        }
    }

    /// Record the flag's value every time the list is shown.
    pub fn watching(mut self, flag: Arc<AtomicBool>) -> Self {
        self.watch = Some(flag);
        self
    }
}

impl Chooser for ScriptedChooser {
    fn choose(&mut self, candidates: &[String]) -> io::Result<Option<usize>> {
        self.shown.push(candidates.to_vec());
        if let Some(flag) = &self.watch {
            self.decode_done_when_shown.push(flag.load(Ordering::SeqCst));
        }
        Ok(self.pick)
    }
}

// ── Clipboard ───────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingClipboard {
    pub writes: Vec<String>,
    pub fail: bool,
}

impl Clipboard for RecordingClipboard {
    fn write_text(&mut self, text: &str) -> anyhow::Result<()> {
        if self.fail {
            anyhow::bail!("no display");
        }
        self.writes.push(text.to_string());
        Ok(())
    }
}

// ── Keys ────────────────────────────────────────────────────────────────────

pub enum KeyStep {
    Press(Duration, KeyEvent),
    Fail,
}

/// Replays key presses after the given delays, then waits forever.
#[derive(Default)]
pub struct ScriptedKeys {
    steps: VecDeque<KeyStep>,
    pub releases: usize,
}

impl ScriptedKeys {
    pub fn new(keys: &[KeyEvent]) -> Self {
        Self {
            steps: keys
                .iter()
                .map(|k| KeyStep::Press(Duration::ZERO, *k))
                .collect(),
            releases: 0,
        }
    }

    pub fn from_steps(steps: Vec<KeyStep>) -> Self {
        Self {
            steps: steps.into(),
            releases: 0,
        }
    }

    pub fn remaining(&self) -> usize {
        self.steps.len()
    }
}

#[async_trait]
impl KeySource for ScriptedKeys {
    async fn next_key(&mut self) -> io::Result<KeyEvent> {
        match self.steps.pop_front() {
            Some(KeyStep::Press(delay, key)) => {
                tokio::time::sleep(delay).await;
                Ok(key)
            }
            Some(KeyStep::Fail) => Err(io::Error::new(io::ErrorKind::Other, "tty closed")),
            None => std::future::pending().await,
        }
    }

    async fn release(&mut self) {
        self.releases += 1;
    }
}
