//! Unlock a password database once, pick an entry, copy its fields.

pub mod cache;
pub mod crypto;
pub mod db;
pub mod kdbx;
pub mod paths;
pub mod secret;
pub mod secure_storage;
pub mod session;
pub mod unlock;

pub use cache::{CacheError, CacheStore};
pub use db::{Database, Entries, Entry, EntryRecord, Group};
pub use kdbx::{DecodeError, Decoder, KdbxDecoder};
pub use secret::{Secret, SecretSource};
pub use secure_storage::{Keystore, KeystoreError, KeyringStore, NullKeystore};
pub use session::{
    Clipboard, CopySession, KeyEvent, KeySource, NamedKey, SessionEnd, SessionError, DEFAULT_TIMEOUT,
};
pub use unlock::{CandidateOrigin, Chooser, Orchestrator, Selection, UnlockError, UnlockRequest};
