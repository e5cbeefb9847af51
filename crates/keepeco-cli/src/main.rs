mod terminal;

use anyhow::{Context, Result};
use clap::Parser;
use keepeco_core::paths::expand_path;
use keepeco_core::secure_storage::DEFAULT_ACCOUNT;
use keepeco_core::{
    CacheStore, CopySession, KdbxDecoder, KeyringStore, Keystore, KeystoreError, NullKeystore,
    Orchestrator, Secret, SecretSource, Selection, UnlockError, UnlockRequest,
};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use terminal::{FuzzyChooser, SystemClipboard, TerminalKeys};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "keepeco")]
#[command(about = "Pick a KeePass entry and copy its fields to the clipboard", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the .kdbx database; `~` and `$VAR` are expanded
    database: String,

    /// Seconds without a key press before the copy session ends
    #[arg(
        long,
        env = "KEEPECO_TIMEOUT",
        default_value_t = 180,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    timeout: u64,

    /// Never read or write the OS keystore; always prompt
    #[arg(long)]
    no_keystore: bool,

    /// Always decode the database and leave the candidate cache alone
    #[arg(long)]
    no_cache: bool,

    /// Directory for encrypted candidate caches
    #[arg(long, env = "KEEPECO_CACHE_DIR")]
    cache_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    if terminal::is_clipboard_helper() {
        if let Err(err) = terminal::serve_clipboard() {
            abort(err);
        }
        return;
    }
    init_tracing();
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        abort(err);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("KEEPECO_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let db_path = expand_path(&cli.database).context("Failed to expand homedir")?;
    std::fs::metadata(&db_path)
        .with_context(|| format!("Failed to stat file {}", db_path.display()))?;

    let keystore: Arc<dyn Keystore> = if cli.no_keystore {
        Arc::new(NullKeystore)
    } else {
        Arc::new(KeyringStore::new(DEFAULT_ACCOUNT))
    };
    let (secret, source) = acquire_secret(keystore.as_ref(), &db_path, !cli.no_keystore)?;

    let cache = if cli.no_cache {
        None
    } else {
        Some(
            cli.cache_dir
                .map(CacheStore::new)
                .unwrap_or_else(CacheStore::for_current_user),
        )
    };
    debug!(cache = ?cache.as_ref().map(|c| c.dir().to_path_buf()), "candidate cache");

    let orchestrator = Orchestrator::new(Arc::new(KdbxDecoder), keystore, cache);
    let request = UnlockRequest {
        db_path,
        secret,
        source,
    };
    let Selection {
        mut database,
        entry,
        origin,
        ..
    } = orchestrator
        .select(request, &mut FuzzyChooser::new("entry"))
        .await
        .map_err(unlock_failure)?;
    debug!(?origin, "entry selected");

    let mut clipboard = SystemClipboard::default();
    let mut keys = TerminalKeys::default();
    let end = CopySession::new(&mut database, &entry, &mut clipboard, &mut keys, io::stdout())
        .with_timeout(Duration::from_secs(cli.timeout))
        .run()
        .await
        .context("Failed to scan input")?;
    debug!(?end, "copy session finished");
    Ok(())
}

/// Keystore first; on a miss, prompt without echo.
fn acquire_secret(
    keystore: &dyn Keystore,
    db_path: &Path,
    announce: bool,
) -> Result<(Secret, SecretSource)> {
    match keystore.get(&db_path.to_string_lossy()) {
        Ok(secret) => return Ok((secret, SecretSource::Keystore)),
        Err(KeystoreError::NotFound) => {}
        Err(e) => return Err(e).context("Failed to query keystore"),
    }

    if announce {
        println!("Password entry for the database must be created in the default keychain.");
    }
    let password = rpassword::prompt_password(format!("Enter password for {}: ", db_path.display()))
        .context("Failed to read input")?;
    Ok((Secret::new(password), SecretSource::Prompt))
}

fn unlock_failure(err: UnlockError) -> anyhow::Error {
    let context = match &err {
        UnlockError::Stat(_) | UnlockError::Decode(_) => "Failed to open database",
        UnlockError::Cache(_) => "Failed to load cache",
        UnlockError::Chooser(_)
        | UnlockError::SelectionCancelled
        | UnlockError::SelectionOutOfRange { .. }
        | UnlockError::CandidateMismatch => "Failed to select a candidate",
    };
    anyhow::Error::new(err).context(context)
}

fn abort(err: anyhow::Error) -> ! {
    eprintln!("{err:#}");
    std::process::exit(1);
}
