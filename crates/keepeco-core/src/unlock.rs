//! Races the encrypted candidate cache against a full database decode.
//!
//! The decode always runs in the background. A cache hit lets the chooser
//! open immediately; the decode is then awaited after the selection, since
//! copying needs the live handle and the selected index is only meaningful
//! against the freshly flattened entries.

use crate::cache::{CacheError, CacheStore};
use crate::db::{Database, Entries, Entry};
use crate::kdbx::{DecodeError, Decoder};
use crate::secret::{Secret, SecretSource};
use crate::secure_storage::Keystore;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Fuzzy selection over the candidate list.
pub trait Chooser {
    /// `Ok(None)` when the user backs out without choosing.
    fn choose(&mut self, candidates: &[String]) -> io::Result<Option<usize>>;
}

#[derive(Debug, thiserror::Error)]
pub enum UnlockError {
    #[error("stat database file: {0}")]
    Stat(#[source] io::Error),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("chooser: {0}")]
    Chooser(#[source] io::Error),
    #[error("selection cancelled")]
    SelectionCancelled,
    #[error("selected index {index} is outside {len} entries")]
    SelectionOutOfRange { index: usize, len: usize },
    #[error("cached candidates no longer match the database; run again")]
    CandidateMismatch,
}

#[derive(Debug, Clone)]
pub struct UnlockRequest {
    pub db_path: PathBuf,
    pub secret: Secret,
    pub source: SecretSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOrigin {
    Cache,
    Decode,
}

/// A chosen entry together with the live handle it belongs to.
#[derive(Debug)]
pub struct Selection {
    pub database: Database,
    pub entry: Entry,
    pub index: usize,
    pub origin: CandidateOrigin,
}

struct Decoded {
    database: Database,
    entries: Entries,
}

/// Background decode whose result can be taken exactly once.
struct PendingDecode {
    rx: oneshot::Receiver<Result<Decoded, DecodeError>>,
}

impl PendingDecode {
    fn spawn(decoder: Arc<dyn Decoder>, path: PathBuf, secret: Secret) -> Self {
        let (tx, rx) = oneshot::channel();
        tokio::task::spawn_blocking(move || {
            let started = Instant::now();
            let result = decoder.open(&path, &secret).map(|database| {
                let entries = database.flatten();
                Decoded { database, entries }
            });
            debug!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                ok = result.is_ok(),
                "database decode finished"
            );
            let _ = tx.send(result);
        });
        Self { rx }
    }

    async fn wait(self) -> Result<Decoded, DecodeError> {
        self.rx.await.map_err(|_| DecodeError::TaskFailed)?
    }
}

enum Stage {
    /// Candidates came from the cache; the decode is still outstanding.
    Cached {
        candidates: Vec<String>,
        pending: PendingDecode,
    },
    Fresh {
        candidates: Vec<String>,
        decoded: Decoded,
    },
}

impl Stage {
    fn candidates(&self) -> &[String] {
        match self {
            Stage::Cached { candidates, .. } | Stage::Fresh { candidates, .. } => candidates,
        }
    }
}

pub struct Orchestrator {
    decoder: Arc<dyn Decoder>,
    keystore: Arc<dyn Keystore>,
    cache: Option<CacheStore>,
}

impl Orchestrator {
    pub fn new(
        decoder: Arc<dyn Decoder>,
        keystore: Arc<dyn Keystore>,
        cache: Option<CacheStore>,
    ) -> Self {
        Self {
            decoder,
            keystore,
            cache,
        }
    }

    /// Unlock the database, let `chooser` pick an entry and return it with
    /// a live handle whose entries are index consistent with what was shown.
    pub async fn select(
        &self,
        request: UnlockRequest,
        chooser: &mut dyn Chooser,
    ) -> Result<Selection, UnlockError> {
        let db_key = request.db_path.to_string_lossy().into_owned();
        let modified = std::fs::metadata(&request.db_path)
            .and_then(|meta| meta.modified())
            .map_err(UnlockError::Stat)?;

        let pending = PendingDecode::spawn(
            self.decoder.clone(),
            request.db_path.clone(),
            request.secret.clone(),
        );

        let stage = match self.load_cached(&db_key, &request.secret, modified)? {
            Some(candidates) => Stage::Cached {
                candidates,
                pending,
            },
            None => {
                let decoded = self.finish_decode(pending, &request).await?;
                let candidates = decoded.entries.candidates();
                self.store_candidates(&db_key, &request.secret, modified, &candidates)?;
                Stage::Fresh {
                    candidates,
                    decoded,
                }
            }
        };

        let index = chooser
            .choose(stage.candidates())
            .map_err(UnlockError::Chooser)?
            .ok_or(UnlockError::SelectionCancelled)?;

        let (decoded, origin) = match stage {
            Stage::Fresh { decoded, .. } => (decoded, CandidateOrigin::Decode),
            Stage::Cached {
                candidates,
                pending,
            } => {
                let decoded = self.finish_decode(pending, &request).await?;
                let fresh = decoded.entries.candidates();
                if fresh != candidates {
                    warn!(
                        cached = candidates.len(),
                        fresh = fresh.len(),
                        "cached candidates diverged from database"
                    );
                    self.store_candidates(&db_key, &request.secret, modified, &fresh)?;
                    return Err(UnlockError::CandidateMismatch);
                }
                (decoded, CandidateOrigin::Cache)
            }
        };

        let len = decoded.entries.len();
        if index >= len {
            return Err(UnlockError::SelectionOutOfRange { index, len });
        }
        let entry = decoded.entries.into_vec().swap_remove(index);
        Ok(Selection {
            database: decoded.database,
            entry,
            index,
            origin,
        })
    }

    fn load_cached(
        &self,
        db_key: &str,
        secret: &Secret,
        modified: SystemTime,
    ) -> Result<Option<Vec<String>>, UnlockError> {
        let Some(cache) = &self.cache else {
            return Ok(None);
        };
        match cache.load(db_key, secret, modified) {
            Ok(candidates) => {
                debug!(count = candidates.len(), "candidate cache hit");
                Ok(Some(candidates))
            }
            Err(CacheError::Unavailable) => {
                debug!("candidate cache miss");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn store_candidates(
        &self,
        db_key: &str,
        secret: &Secret,
        modified: SystemTime,
        candidates: &[String],
    ) -> Result<(), UnlockError> {
        let Some(cache) = &self.cache else {
            return Ok(());
        };
        match cache.save(db_key, secret, modified, candidates) {
            Ok(()) => Ok(()),
            Err(e) if e.is_recoverable() => {
                warn!(error = %e, "failed to write candidate cache");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn finish_decode(
        &self,
        pending: PendingDecode,
        request: &UnlockRequest,
    ) -> Result<Decoded, UnlockError> {
        let decoded = pending.wait().await?;
        if request.source == SecretSource::Prompt {
            let service = request.db_path.to_string_lossy();
            match self.keystore.set(&service, &request.secret) {
                Ok(()) => info!("database secret saved to keystore"),
                Err(e) => warn!(error = %e, "failed to save password"),
            }
        }
        Ok(decoded)
    }
}
