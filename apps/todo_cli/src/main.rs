mod config;
mod view;

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shared::{
    action::Action,
    domain::{RecordId, StorageHandle},
};
use storage::Storage;
use todo_core::{
    AppContext, OfflineRemote, RemoteService, SimulatedRemote, StoreNotice, StoreOptions,
};
use tokio_stream::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    config::{RemoteMode, Settings},
    view::ListView,
};

#[derive(Parser, Debug)]
#[command(name = "todo", version, about = "Todo list with optimistic remote confirmation")]
struct Args {
    #[arg(long, default_value = config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    #[arg(long)]
    database_url: Option<String>,
    /// Use a remote that never answers; new records roll back.
    #[arg(long)]
    offline: bool,
    #[arg(long)]
    remote_delay_ms: Option<u64>,
    #[arg(long)]
    remote_error_percent: Option<u32>,
    /// Print records as JSON instead of a list.
    #[arg(long)]
    json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    List,
    /// Create a record and wait for the remote to confirm it.
    Add { title: Option<String> },
    Rename {
        #[arg(allow_negative_numbers = true)]
        id: i64,
        title: String,
    },
    Complete {
        #[arg(allow_negative_numbers = true)]
        id: i64,
    },
    Reopen {
        #[arg(allow_negative_numbers = true)]
        id: i64,
    },
    Delete {
        #[arg(allow_negative_numbers = true)]
        id: i64,
    },
    ClearCompleted,
    /// Hard-remove soft-deleted rows.
    Purge,
    /// Run a scripted session against an in-memory database, printing every update.
    Demo,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();
    let args = Args::parse();
    let settings = resolve_settings(&args)?;
    info!(
        database_url = %settings.database_url,
        remote = ?settings.remote,
        delete_mode = ?settings.delete_mode,
        "settings loaded"
    );

    match args.command {
        Command::Demo => run_demo(&settings).await,
        Command::Purge => {
            let storage = open_storage(&settings.database_url).await?;
            let purged = storage.purge_soft_deleted().await?;
            println!("purged {purged} soft-deleted records");
            Ok(())
        }
        command => run_command(&settings, command, args.json).await,
    }
}

fn resolve_settings(args: &Args) -> Result<Settings> {
    let mut settings = config::load_settings(&args.config)?;
    if let Some(url) = &args.database_url {
        settings.database_url = url.clone();
    }
    if args.offline {
        settings.remote = RemoteMode::Offline;
    }
    if let Some(ms) = args.remote_delay_ms {
        settings.remote_delay_ms = ms;
    }
    if let Some(percent) = args.remote_error_percent {
        settings.remote_error_percent = percent.min(100);
    }
    settings.database_url = config::normalize_database_url(&settings.database_url);
    Ok(settings)
}

async fn open_storage(database_url: &str) -> Result<Storage> {
    let storage = Storage::new(database_url)
        .await
        .with_context(|| format!("failed to open database '{database_url}'"))?;
    storage.health_check().await?;
    Ok(storage)
}

/// The remote collaborator, plus the simulator itself when there is one so
/// outstanding calls can be drained before exit.
fn remote_for(settings: &Settings) -> (Arc<dyn RemoteService>, Option<Arc<SimulatedRemote>>) {
    match settings.remote {
        RemoteMode::Offline => (Arc::new(OfflineRemote), None),
        RemoteMode::Simulated => {
            let remote = Arc::new(SimulatedRemote::new(
                settings.remote_delay(),
                settings.remote_error_percent,
            ));
            (remote.clone(), Some(remote))
        }
    }
}

async fn run_command(settings: &Settings, command: Command, json: bool) -> Result<()> {
    let storage = open_storage(&settings.database_url).await?;
    let (remote, simulator) = remote_for(settings);
    let (ctx, _updates) = AppContext::start(
        storage,
        remote,
        StoreOptions {
            delete_mode: settings.delete_mode,
        },
    )
    .await?;
    let mut notices = ctx.notices();

    match command {
        Command::List => {}
        Command::Add { title } => {
            let handle = create(&ctx).await?;
            if let Some(text) = title {
                act_on(&ctx, handle, |id| Action::UpdateTitle { id, text }).await?;
            }
            await_confirmations(&ctx, settings).await?;
        }
        Command::Rename { id, title } => {
            ctx.dispatch(Action::BeginEditTitle { id: RecordId(id) })?;
            ctx.dispatch(Action::UpdateTitle {
                id: RecordId(id),
                text: title,
            })?;
        }
        Command::Complete { id } => ctx.dispatch(Action::SetCompleted {
            id: RecordId(id),
            completed: true,
        })?,
        Command::Reopen { id } => ctx.dispatch(Action::SetCompleted {
            id: RecordId(id),
            completed: false,
        })?,
        Command::Delete { id } => ctx.dispatch(Action::Delete { id: RecordId(id) })?,
        Command::ClearCompleted => ctx.dispatch(Action::DeleteAllCompleted)?,
        Command::Demo | Command::Purge => {
            anyhow::bail!("{command:?} does not run against a live context")
        }
    }

    ctx.settle().await?;
    if let Some(simulator) = &simulator {
        drain(simulator, settings).await;
    }
    while let Ok(notice) = notices.try_recv() {
        report(&notice);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&ctx.records().await?)?);
    } else {
        print!("{}", ListView::new(&ctx.projection()).render());
    }

    ctx.shutdown().await?;
    Ok(())
}

async fn run_demo(settings: &Settings) -> Result<()> {
    let storage = open_storage("sqlite::memory:").await?;
    let demo_settings = Settings {
        remote_delay_ms: settings.remote_delay_ms.min(300),
        ..settings.clone()
    };
    let (remote, simulator) = remote_for(&demo_settings);
    let (ctx, updates) = AppContext::start(storage, remote, StoreOptions::default()).await?;

    let initial = ctx.projection();
    let consumer = tokio::spawn(async move {
        let mut view = ListView::new(&initial);
        let mut stream = updates.into_stream();
        while let Some(update) = stream.next().await {
            view.apply(&update)?;
            println!(
                "-- update {} ({} edits)\n{}",
                view.applied(),
                update.script.len(),
                view.render()
            );
        }
        anyhow::Ok(view.applied())
    });

    let milk = create(&ctx).await?;
    act_on(&ctx, milk, |id| Action::UpdateTitle {
        id,
        text: "buy milk".into(),
    })
    .await?;
    let dog = create(&ctx).await?;
    act_on(&ctx, dog, |id| Action::UpdateTitle {
        id,
        text: "walk the dog".into(),
    })
    .await?;
    let draft = create(&ctx).await?;
    for handle in [milk, draft] {
        act_on(&ctx, handle, |id| Action::SetCompleted {
            id,
            completed: true,
        })
        .await?;
    }
    await_confirmations(&ctx, &demo_settings).await?;

    // The draft is still being edited, so clearing leaves it in place.
    ctx.dispatch(Action::DeleteAllCompleted)?;
    ctx.settle().await?;
    if let Some(simulator) = &simulator {
        drain(simulator, &demo_settings).await;
    }

    ctx.shutdown().await?;
    let applied = consumer.await.context("update consumer panicked")??;
    println!("applied {applied} updates");
    Ok(())
}

/// Dispatches `Create` and returns the storage handle of the new record.
async fn create(ctx: &AppContext) -> Result<StorageHandle> {
    ctx.dispatch(Action::Create)?;
    ctx.settle().await?;
    ctx.snapshot()
        .await?
        .editing
        .context("new record is not marked as editing")
}

/// Dispatches the action built from the record's current id. Ids change on
/// confirmation, so records are tracked by handle between steps.
async fn act_on(
    ctx: &AppContext,
    handle: StorageHandle,
    action: impl FnOnce(RecordId) -> Action,
) -> Result<()> {
    let current = ctx
        .records()
        .await?
        .into_iter()
        .find(|r| r.storage_handle == Some(handle));
    match current {
        Some(record) => ctx.dispatch(action(record.id))?,
        None => warn!(%handle, "record is gone; the remote rejected it"),
    }
    ctx.settle().await?;
    Ok(())
}

/// Waits until no pending records remain, or until a confirmation could no
/// longer plausibly arrive.
async fn await_confirmations(ctx: &AppContext, settings: &Settings) -> Result<()> {
    let deadline =
        tokio::time::Instant::now() + settings.remote_delay() * 2 + Duration::from_secs(1);
    loop {
        ctx.settle().await?;
        let pending = ctx
            .records()
            .await?
            .iter()
            .filter(|r| r.is_pending())
            .count();
        if pending == 0 {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(pending, "gave up waiting for remote confirmations");
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

async fn drain(simulator: &SimulatedRemote, settings: &Settings) {
    let deadline = tokio::time::Instant::now() + settings.remote_delay() + Duration::from_secs(1);
    while simulator.in_flight() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

fn report(notice: &StoreNotice) {
    match notice {
        StoreNotice::TransactionFailed { action, message } => {
            eprintln!("warning: {action} was not saved: {message}");
        }
    }
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
