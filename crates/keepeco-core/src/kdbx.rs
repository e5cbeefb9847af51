use crate::db::{Database, EntryRecord, Group, ProtectedError, PASSWORD};
use crate::secret::Secret;
use keepass::db::Node;
use keepass::DatabaseKey;
use std::fs::File;
use std::io;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("open database file: {0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Rejected(String),
    #[error("seal protected fields: {0}")]
    Protect(#[from] ProtectedError),
    #[error("decode task ended without a result")]
    TaskFailed,
}

/// Turns a database file plus its secret into a [`Database`].
pub trait Decoder: Send + Sync {
    fn open(&self, path: &Path, secret: &Secret) -> Result<Database, DecodeError>;
}

/// KeePass KDBX 3.1/4 files.
#[derive(Debug, Default, Clone, Copy)]
pub struct KdbxDecoder;

impl Decoder for KdbxDecoder {
    fn open(&self, path: &Path, secret: &Secret) -> Result<Database, DecodeError> {
        let mut file = File::open(path)?;
        let key = DatabaseKey::new().with_password(secret.expose());
        let kdbx = keepass::Database::open(&mut file, key)
            .map_err(|e| DecodeError::Rejected(e.to_string()))?;
        Ok(Database::new(convert_group(&kdbx.root))?)
    }
}

fn convert_group(group: &keepass::db::Group) -> Group {
    let mut out = Group::new(group.name.clone());
    for node in &group.children {
        match node {
            Node::Group(sub) => out.groups.push(convert_group(sub)),
            Node::Entry(entry) => out.entries.push(convert_entry(entry)),
        }
    }
    out
}

/// Only the password is sealed; every other field stays readable without an
/// unlock, whatever protection flag the file carries.
fn convert_entry(entry: &keepass::db::Entry) -> EntryRecord {
    let mut record = EntryRecord::new();
    for key in entry.fields.keys() {
        let Some(text) = entry.get(key) else {
            continue;
        };
        if key == PASSWORD {
            record.set_protected(key, text);
        } else {
            record.set_field(key, text);
        }
    }
    record
}
