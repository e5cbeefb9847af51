//! Decoded credential database: group tree, flattened entries and
//! protected field access.

use crate::crypto::{CryptoError, FieldCipher, SealedValue};
use std::collections::BTreeMap;
use zeroize::Zeroizing;

pub const TITLE: &str = "Title";
pub const USERNAME: &str = "UserName";
pub const URL: &str = "URL";
pub const PASSWORD: &str = "Password";

const TRASH_PREFIX: &str = "99_trash";
const EXCLUDED_ROOT_GROUPS: &[&str] = &["ゴミ箱", "Backup"];

// ── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ProtectedError {
    #[error("protected fields are locked")]
    Locked,
    #[error("protected field {0} could not be opened")]
    Corrupt(String),
    #[error("seal protected field: {0}")]
    Seal(#[from] CryptoError),
}

// ── Tree model ──────────────────────────────────────────────────────────────

#[derive(Clone)]
enum FieldValue {
    Plain(String),
    Pending(Zeroizing<String>),
    Sealed(SealedValue),
}

impl std::fmt::Debug for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Plain(value) => f.debug_tuple("Plain").field(value).finish(),
            FieldValue::Pending(_) => f.write_str("Pending(***)"),
            FieldValue::Sealed(value) => f.debug_tuple("Sealed").field(value).finish(),
        }
    }
}

/// One credential record as read from the file.
#[derive(Debug, Clone, Default)]
pub struct EntryRecord {
    fields: BTreeMap<String, FieldValue>,
}

impl EntryRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, key: &str, value: &str) -> Self {
        self.set_field(key, value);
        self
    }

    pub fn with_protected(mut self, key: &str, value: &str) -> Self {
        self.set_protected(key, value);
        self
    }

    pub fn set_field(&mut self, key: &str, value: &str) {
        self.fields
            .insert(key.to_string(), FieldValue::Plain(value.to_string()));
    }

    /// Stored sealed once the record becomes part of a [`Database`].
    pub fn set_protected(&mut self, key: &str, value: &str) {
        self.fields.insert(
            key.to_string(),
            FieldValue::Pending(Zeroizing::new(value.to_string())),
        );
    }

    /// Plain field content; empty for missing and for protected fields.
    pub fn content(&self, key: &str) -> &str {
        match self.fields.get(key) {
            Some(FieldValue::Plain(value)) => value,
            _ => "",
        }
    }

    fn seal_pending(&mut self, cipher: &FieldCipher) -> Result<(), CryptoError> {
        for value in self.fields.values_mut() {
            if let FieldValue::Pending(plain) = value {
                *value = FieldValue::Sealed(cipher.seal(plain)?);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Group {
    pub name: String,
    pub entries: Vec<EntryRecord>,
    pub groups: Vec<Group>,
}

impl Group {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_entry(mut self, entry: EntryRecord) -> Self {
        self.entries.push(entry);
        self
    }

    pub fn with_group(mut self, group: Group) -> Self {
        self.groups.push(group);
        self
    }

    fn seal_pending(&mut self, cipher: &FieldCipher) -> Result<(), CryptoError> {
        for entry in &mut self.entries {
            entry.seal_pending(cipher)?;
        }
        for group in &mut self.groups {
            group.seal_pending(cipher)?;
        }
        Ok(())
    }
}

// ── Flattened view ──────────────────────────────────────────────────────────

/// An entry tagged with the slash separated path of the groups above it.
#[derive(Debug, Clone)]
pub struct Entry {
    pub prefix: String,
    record: EntryRecord,
}

impl Entry {
    pub fn content(&self, key: &str) -> &str {
        self.record.content(key)
    }

    pub fn title(&self) -> &str {
        self.content(TITLE)
    }

    /// `{prefix}/{Title}` with newlines removed from the title.
    pub fn candidate(&self) -> String {
        format!("{}/{}", self.prefix, strip_newlines(self.title()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct Entries(Vec<Entry>);

impl Entries {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Entry> {
        self.0.get(index)
    }

    /// Display strings, index aligned with the entries.
    pub fn candidates(&self) -> Vec<String> {
        self.0.iter().map(Entry::candidate).collect()
    }

    pub fn into_vec(self) -> Vec<Entry> {
        self.0
    }
}

/// Depth-first flatten starting at `root`.
///
/// A group's direct entries come before its subgroups. Subgroups of the root
/// itself that look like a trash or backup bin are skipped with their whole
/// subtree; deeper groups with the same names are kept.
pub fn flatten(root: &Group) -> Entries {
    let mut out = Vec::with_capacity(20);
    flatten_group("", root, &mut out);
    Entries(out)
}

fn flatten_group(prefix: &str, group: &Group, out: &mut Vec<Entry>) {
    for record in &group.entries {
        out.push(Entry {
            prefix: prefix.to_string(),
            record: record.clone(),
        });
    }
    for sub in &group.groups {
        if prefix.is_empty() && is_excluded_root_group(&sub.name) {
            continue;
        }
        let sub_prefix = format!("{}/{}", prefix, strip_newlines(&sub.name));
        flatten_group(&sub_prefix, sub, out);
    }
}

fn is_excluded_root_group(name: &str) -> bool {
    name.starts_with(TRASH_PREFIX) || EXCLUDED_ROOT_GROUPS.contains(&name)
}

fn strip_newlines(value: &str) -> String {
    value.replace('\n', "")
}

// ── Handle ──────────────────────────────────────────────────────────────────

/// A decoded database. Protected fields stay sealed in memory and can only
/// be read while the handle is unlocked.
pub struct Database {
    root: Group,
    cipher: FieldCipher,
    unlocked: bool,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("root", &self.root.name)
            .field("unlocked", &self.unlocked)
            .finish()
    }
}

impl Database {
    pub fn new(mut root: Group) -> Result<Self, ProtectedError> {
        let cipher = FieldCipher::generate();
        root.seal_pending(&cipher)?;
        Ok(Self {
            root,
            cipher,
            unlocked: false,
        })
    }

    pub fn flatten(&self) -> Entries {
        flatten(&self.root)
    }

    pub fn is_unlocked(&self) -> bool {
        self.unlocked
    }

    pub fn unlock_protected(&mut self) {
        self.unlocked = true;
    }

    pub fn lock_protected(&mut self) {
        self.unlocked = false;
    }

    /// Unlock until the returned guard is dropped.
    pub fn unlock_scoped(&mut self) -> ProtectedAccess<'_> {
        self.unlock_protected();
        ProtectedAccess { db: self }
    }

    /// Read a field of `entry`, protected or not. Missing fields read as "".
    pub fn reveal(&self, entry: &Entry, key: &str) -> Result<Zeroizing<String>, ProtectedError> {
        match entry.record.fields.get(key) {
            None => Ok(Zeroizing::new(String::new())),
            Some(FieldValue::Plain(value)) => Ok(Zeroizing::new(value.clone())),
            Some(_) if !self.unlocked => Err(ProtectedError::Locked),
            Some(FieldValue::Pending(value)) => Ok(value.clone()),
            Some(FieldValue::Sealed(value)) => self
                .cipher
                .open(value)
                .map_err(|_| ProtectedError::Corrupt(key.to_string())),
        }
    }
}

pub struct ProtectedAccess<'a> {
    db: &'a mut Database,
}

impl ProtectedAccess<'_> {
    pub fn reveal(&self, entry: &Entry, key: &str) -> Result<Zeroizing<String>, ProtectedError> {
        self.db.reveal(entry, key)
    }
}

impl Drop for ProtectedAccess<'_> {
    fn drop(&mut self) {
        self.db.lock_protected();
    }
}
