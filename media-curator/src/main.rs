use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use media_curator::config::AppConfig;
use media_curator::coordinator::{PipelineCoordinator, RunSummary, Until};
use media_curator::logging::init_logging;
use media_curator::pipeline::{ItemId, PipelineEvent};
use media_curator::project::{MediaItem, Project, ProjectStore};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(short, long, env = "MEDIA_CURATOR_CONFIG")]
    config: Option<PathBuf>,

    /// Tracing filter directive, e.g. `media_curator=debug`
    #[arg(long, env = "MEDIA_CURATOR_LOG")]
    log_filter: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an empty project for a category
    CreateProject { name: String, category: String },
    /// List the projects under the projects directory
    ListProjects,
    /// Add media items from a JSON array file
    Import { project: String, file: PathBuf },
    /// Mark an item as rejected
    Reject { project: String, id: ItemId },
    /// Download every pending item
    Download { project: String },
    /// Scale every downloaded item
    Scale { project: String },
    /// Upload every scaled item, then the manifests
    Upload { project: String },
    /// Scale and upload in one run, publishing manifests at the end
    Process { project: String },
    /// Re-publish the index, catalog and category list
    Publish { project: String },
    /// Delete the project's remote catalog and drop its category
    DeleteCategory { project: String },
    /// Forget every item and rejection, keeping files on disk
    ResetProject { project: String },
    /// Remove the project directory and everything in it
    DeleteProject {
        project: String,
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let config = AppConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    let (logging, _guard) = init_logging(&config.log_dir, config.log_filter.as_deref())
        .context("Failed to initialize logging")?;
    if let Some(directive) = args.log_filter.as_deref() {
        logging.set_filter(directive)?;
    }
    debug!(filter = %logging.get_filter(), log_dir = %logging.log_dir().display(), "Logging ready");
    logging.cleanup_old_logs().await;

    let store = ProjectStore::new(&config.projects_dir, config.storage.bucket.clone());

    match args.command {
        Command::CreateProject { name, category } => {
            let project = store
                .create(&name, &category)
                .await
                .with_context(|| format!("Failed to create project {}", name))?;
            println!("Created {} at {}", project.name, project.path.display());
        }
        Command::ListProjects => {
            for dir in store.list().await? {
                match store.load(&dir).await {
                    Ok(project) => println!(
                        "{}\t{}\t{} items",
                        project.name,
                        project.category_id,
                        project.media.len()
                    ),
                    Err(e) => println!("{}\t(unreadable: {})", dir.display(), e),
                }
            }
        }
        Command::Import { project, file } => {
            let mut project = open(&store, &project).await?;
            let raw = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let items: Vec<MediaItem> = serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse {}", file.display()))?;
            let added = project.add_media(items);
            store.save(&project).await?;
            println!("Added {} items to {}", added, project.name);
        }
        Command::Reject { project, id } => {
            let mut project = open(&store, &project).await?;
            project.reject_media(id);
            store.save(&project).await?;
            println!("Rejected item {} in {}", id, project.name);
        }
        Command::Download { project } => {
            let mut project = open(&store, &project).await?;
            let coordinator = PipelineCoordinator::new(config)?;
            let mut rx = coordinator.subscribe();
            let queued = coordinator.queue_downloads(&mut project);
            store.save(&project).await?;
            let summary = run(&coordinator, &mut rx, &mut project, &store, Until::Downloads, queued)
                .await?;
            report("download", &summary);
        }
        Command::Scale { project } => {
            let mut project = open(&store, &project).await?;
            let coordinator = PipelineCoordinator::new(config)?;
            let mut rx = coordinator.subscribe();
            let queued = coordinator.queue_scales(&mut project);
            store.save(&project).await?;
            let summary = run(&coordinator, &mut rx, &mut project, &store, Until::Processing, queued)
                .await?;
            report("scale", &summary);
        }
        Command::Upload { project } => {
            let mut project = open(&store, &project).await?;
            let coordinator = PipelineCoordinator::new(config)?;
            let mut rx = coordinator.subscribe();
            let queued = coordinator.queue_uploads(&project).await?;
            let summary = run(&coordinator, &mut rx, &mut project, &store, Until::Processing, queued)
                .await?;
            report("upload", &summary);
        }
        Command::Process { project } => {
            let mut project = open(&store, &project).await?;
            let coordinator = PipelineCoordinator::new(config)?.with_chained_uploads(true);
            let mut rx = coordinator.subscribe();
            let mut queued = coordinator.queue_item_uploads(&project)?;
            queued += coordinator.queue_scales(&mut project);
            store.save(&project).await?;

            let summary = run(&coordinator, &mut rx, &mut project, &store, Until::Processing, queued)
                .await?;
            report("process", &summary);

            if !summary.cancelled && summary.uploaded > 0 {
                coordinator.publish_manifests(&project).await?;
                let summary =
                    run(&coordinator, &mut rx, &mut project, &store, Until::Processing, 3).await?;
                report("publish", &summary);
            }
        }
        Command::Publish { project } => {
            let mut project = open(&store, &project).await?;
            let coordinator = PipelineCoordinator::new(config)?;
            let mut rx = coordinator.subscribe();
            coordinator.publish_manifests(&project).await?;
            let summary =
                run(&coordinator, &mut rx, &mut project, &store, Until::Processing, 3).await?;
            report("publish", &summary);
        }
        Command::DeleteCategory { project } => {
            let mut project = open(&store, &project).await?;
            let coordinator = PipelineCoordinator::new(config)?;
            let mut rx = coordinator.subscribe();
            coordinator.delete_category(&project).await?;
            let summary =
                run(&coordinator, &mut rx, &mut project, &store, Until::Processing, 2).await?;
            report("delete-category", &summary);
        }
        Command::ResetProject { project } => {
            let mut project = open(&store, &project).await?;
            let cleared = project.reset();
            store.save(&project).await?;
            println!("Reset {}: {} items cleared", project.name, cleared);
        }
        Command::DeleteProject { project, yes } => {
            let project = open(&store, &project).await?;
            if !yes {
                anyhow::bail!(
                    "Refusing to delete {} without --yes ({} items, files in {})",
                    project.name,
                    project.media.len(),
                    project.path.display()
                );
            }
            store.delete(&project.path).await?;
            println!("Deleted {}", project.name);
        }
    }

    Ok(())
}

async fn open(store: &ProjectStore, name: &str) -> anyhow::Result<Project> {
    store
        .open(name)
        .await
        .with_context(|| format!("Failed to open project {}", name))
}

/// Drive the coordinator with a progress bar until `until` drains or Ctrl-C.
async fn run(
    coordinator: &PipelineCoordinator,
    rx: &mut tokio::sync::broadcast::Receiver<PipelineEvent>,
    project: &mut Project,
    store: &ProjectStore,
    until: Until,
    queued: usize,
) -> anyhow::Result<RunSummary> {
    let shutdown = CancellationToken::new();
    let signal = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling");
                shutdown.cancel();
            }
        })
    };

    let pb = ProgressBar::new(queued as u64);
    pb.enable_steady_tick(Duration::from_millis(120));
    pb.set_style(
        ProgressStyle::with_template("{spinner:.blue} [{elapsed_precise}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    let display = spawn_display(coordinator, pb.clone());

    let result = coordinator
        .drive(rx, project, store, until, &shutdown)
        .await
        .context("Pipeline run failed");

    signal.abort();
    display.abort();
    pb.finish_and_clear();
    result
}

/// Advance the bar on terminal events and show byte progress in its message.
fn spawn_display(coordinator: &PipelineCoordinator, pb: ProgressBar) -> JoinHandle<()> {
    let mut events = coordinator.subscribe();
    let mut progress = coordinator.subscribe_progress();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) if event.is_terminal() => {
                        if pb.position() >= pb.length().unwrap_or(0) {
                            // Chained uploads grow the run
                            pb.inc_length(1);
                        }
                        pb.inc(1);
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                },
                update = progress.recv() => match update {
                    Ok(update) => {
                        let message = match update.percent() {
                            Some(percent) => format!(
                                "item {}: {} ({}%)",
                                update.item_id,
                                HumanBytes(update.received),
                                percent
                            ),
                            None => format!("item {}: {}", update.item_id, HumanBytes(update.received)),
                        };
                        pb.set_message(message);
                    }
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                },
            }
        }
    })
}

fn report(action: &str, summary: &RunSummary) {
    info!(
        completed = summary.completed,
        failed = summary.failed,
        cancelled = summary.cancelled,
        "{} finished",
        action
    );
    println!(
        "{}: {} completed, {} failed{}",
        action,
        summary.completed,
        summary.failed,
        if summary.cancelled { " (cancelled)" } else { "" }
    );
    for (item_id, kind, error) in &summary.failures {
        println!("  {} {}: {}", kind, item_id, error);
    }
}
