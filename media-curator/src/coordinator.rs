//! Sequencing of project items through the pipelines.
//!
//! The coordinator decides which items need which stage, names their output
//! files, publishes the manifest batch and folds pipeline events back into
//! the project. The pipelines themselves never chain stages; that happens
//! here, in response to completion events.

use std::path::PathBuf;

use chrono::Utc;
use tokio::sync::broadcast::{
    self,
    error::{RecvError, TryRecvError},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::manifest::{CategoryList, IndexManifest, build_catalog, write_temp_manifest};
use crate::pipeline::{
    DownloadPipeline, EventBus, ItemId, PipelineEvent, ProcessingPipeline, ProgressUpdate,
    TaskError, TaskKind, UploadTask,
};
use crate::project::{Project, ProjectStore};
use crate::{Error, Result};

/// Which drain ends a [`PipelineCoordinator::drive`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Until {
    /// The download pool is empty.
    Downloads,
    /// Both the scale and upload pools are empty.
    Processing,
}

/// Terminal outcomes observed during one drive.
#[derive(Debug, Default, Clone)]
pub struct RunSummary {
    pub completed: usize,
    pub failed: usize,
    /// Item uploads that finished (manifests excluded).
    pub uploaded: usize,
    pub failures: Vec<(ItemId, TaskKind, TaskError)>,
    /// The run stopped because shutdown was requested.
    pub cancelled: bool,
}

impl RunSummary {
    fn record(&mut self, event: &PipelineEvent) {
        match event {
            PipelineEvent::TaskCompleted { kind, .. } => {
                self.completed += 1;
                if *kind == TaskKind::Upload {
                    self.uploaded += 1;
                }
            }
            PipelineEvent::TaskFailed {
                item_id,
                kind,
                error,
                ..
            } => {
                self.failed += 1;
                self.failures.push((*item_id, *kind, error.clone()));
            }
            _ => {}
        }
    }
}

pub struct PipelineCoordinator {
    config: AppConfig,
    bus: EventBus,
    downloads: DownloadPipeline,
    processing: ProcessingPipeline,
    chain_uploads: bool,
}

impl PipelineCoordinator {
    pub fn new(config: AppConfig) -> Result<Self> {
        let bus = EventBus::default();
        let downloads = DownloadPipeline::new(&config.download, bus.clone())?;
        let processing = ProcessingPipeline::new(&config.transcode, &config.storage, bus.clone());
        Ok(Self {
            config,
            bus,
            downloads,
            processing,
            chain_uploads: false,
        })
    }

    /// Enqueue an item's upload as soon as its scale completes.
    pub fn with_chained_uploads(mut self, enabled: bool) -> Self {
        self.chain_uploads = enabled;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.bus.subscribe()
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressUpdate> {
        self.bus.subscribe_progress()
    }

    pub fn downloads(&self) -> &DownloadPipeline {
        &self.downloads
    }

    pub fn processing(&self) -> &ProcessingPipeline {
        &self.processing
    }

    /// Queue a download for every pending item that has a usable URL.
    pub fn queue_downloads(&self, project: &mut Project) -> usize {
        let raw_dir = project.raw_dir();
        let max_width = self.config.download.max_width;
        let mut count = 0;

        for item in project
            .media
            .iter_mut()
            .filter(|m| !m.is_rejected && !m.is_downloaded)
        {
            let Some(url) = item.download_url(max_width) else {
                debug!("Item {} has no download URL", item.id);
                continue;
            };
            let dest = raw_dir.join(item.raw_file_name());
            item.local_raw_path = Some(dest.clone());
            self.downloads.enqueue(item.id, url, dest);
            count += 1;
        }

        info!("Queued {} downloads for {}", count, project.name);
        count
    }

    /// Queue a scale for every downloaded item whose raw file is on disk.
    pub fn queue_scales(&self, project: &mut Project) -> usize {
        let scaled_dir = project.scaled_dir();
        let mut count = 0;

        for item in project
            .media
            .iter_mut()
            .filter(|m| !m.is_rejected && m.is_downloaded && !m.is_scaled && m.raw_file_exists())
        {
            let Some(input) = item.local_raw_path.clone() else {
                continue;
            };
            let output = scaled_dir.join(item.scaled_file_name());
            item.local_scaled_path = Some(output.clone());
            self.processing.scale().enqueue(item.id, item.kind, input, output);
            count += 1;
        }

        info!("Queued {} scales for {}", count, project.name);
        count
    }

    fn object_key(&self, file: &std::path::Path) -> Option<String> {
        let name = file.file_name()?.to_string_lossy();
        Some(format!("{}{}", self.config.storage.media_prefix, name))
    }

    fn require_bucket(project: &Project) -> Result<()> {
        if project.s3_bucket.trim().is_empty() {
            return Err(Error::validation(format!(
                "project {} has no bucket configured",
                project.name
            )));
        }
        Ok(())
    }

    fn enqueue_item_upload(&self, project: &Project, item_id: ItemId, scaled: PathBuf) -> bool {
        let Some(key) = self.object_key(&scaled) else {
            return false;
        };
        self.processing
            .upload()
            .enqueue(UploadTask::object(item_id, scaled, project.s3_bucket.clone(), key));
        true
    }

    /// Queue uploads of every scaled, not yet uploaded item. No manifests.
    pub fn queue_item_uploads(&self, project: &Project) -> Result<usize> {
        Self::require_bucket(project)?;

        let mut count = 0;
        for item in project
            .media
            .iter()
            .filter(|m| !m.is_rejected && m.is_scaled && !m.is_uploaded && m.scaled_file_exists())
        {
            let Some(scaled) = item.local_scaled_path.clone() else {
                continue;
            };
            if self.enqueue_item_upload(project, item.id, scaled) {
                count += 1;
            }
        }

        info!("Queued {} uploads for {}", count, project.name);
        Ok(count)
    }

    /// Queue item uploads, then the manifest batch if anything was queued.
    pub async fn queue_uploads(&self, project: &Project) -> Result<usize> {
        let count = self.queue_item_uploads(project)?;
        if count > 0 {
            self.publish_manifests(project).await?;
        }
        Ok(count)
    }

    /// Write and enqueue the index, catalog and categories manifests.
    pub async fn publish_manifests(&self, project: &Project) -> Result<()> {
        Self::require_bucket(project)?;
        let temp_dir = &self.config.temp_dir;
        let bucket = project.s3_bucket.clone();
        let transcode = &self.config.transcode;

        let index = IndexManifest::new(
            &project.category_id,
            &project.name,
            &self.config.storage.media_prefix,
            (transcode.target_width, transcode.target_height),
            Utc::now(),
        );
        let index_path = write_temp_manifest(temp_dir, "index", &index).await?;
        self.processing
            .upload()
            .enqueue(UploadTask::index(index_path, bucket.clone()));

        let catalog = build_catalog(&project.media);
        let catalog_path = write_temp_manifest(temp_dir, "catalog", &catalog).await?;
        self.processing.upload().enqueue(UploadTask::catalog(
            catalog_path,
            bucket.clone(),
            &project.category_id,
        ));

        let categories_path = self.config.categories_path();
        let mut categories = CategoryList::load(&categories_path).await?;
        categories.upsert(&project.category_id, &project.name);
        categories.save(&categories_path).await?;
        let temp_categories = write_temp_manifest(temp_dir, "categories", &categories).await?;
        self.processing
            .upload()
            .enqueue(UploadTask::categories(temp_categories, bucket));

        info!(
            "Queued manifests for category {} ({} catalog entries)",
            project.category_id,
            catalog.len()
        );
        Ok(())
    }

    /// Remove the project's category: delete its remote catalog and republish the category list.
    pub async fn delete_category(&self, project: &Project) -> Result<()> {
        Self::require_bucket(project)?;
        let bucket = project.s3_bucket.clone();

        self.processing
            .upload()
            .enqueue(UploadTask::remote_delete(bucket.clone(), &project.category_id));

        let categories_path = self.config.categories_path();
        let mut categories = CategoryList::load(&categories_path).await?;
        if !categories.remove(&project.category_id) {
            debug!("Category {} was not listed locally", project.category_id);
        }
        categories.save(&categories_path).await?;
        let temp_categories =
            write_temp_manifest(&self.config.temp_dir, "categories", &categories).await?;
        self.processing
            .upload()
            .enqueue(UploadTask::categories(temp_categories, bucket));

        info!("Queued removal of category {}", project.category_id);
        Ok(())
    }

    /// Fold a pipeline event into the project. Returns whether the project changed.
    pub fn apply_event(&self, project: &mut Project, event: &PipelineEvent) -> bool {
        self.apply(project, event, self.chain_uploads)
    }

    fn apply(&self, project: &mut Project, event: &PipelineEvent, chain: bool) -> bool {
        let PipelineEvent::TaskCompleted {
            item_id,
            kind,
            output,
            ..
        } = event
        else {
            return false;
        };

        let chain_to = {
            let Some(item) = project.item_mut(*item_id) else {
                return false;
            };
            match kind {
                TaskKind::Download => {
                    if let Some(path) = output {
                        item.local_raw_path = Some(path.clone());
                    }
                    item.is_downloaded = true;
                    None
                }
                TaskKind::Scale => {
                    if let Some(path) = output {
                        item.local_scaled_path = Some(path.clone());
                    }
                    item.is_scaled = true;
                    (chain && !item.is_rejected && !item.is_uploaded)
                        .then(|| item.local_scaled_path.clone())
                        .flatten()
                }
                TaskKind::Upload => {
                    item.is_uploaded = true;
                    None
                }
                _ => return false,
            }
        };

        if let Some(scaled) = chain_to {
            if Self::require_bucket(project).is_ok() {
                self.enqueue_item_upload(project, *item_id, scaled);
            } else {
                warn!("Not chaining upload of item {}: no bucket", item_id);
            }
        }
        true
    }

    fn is_done(&self, until: Until) -> bool {
        match until {
            Until::Downloads => self.downloads.is_drained(),
            Until::Processing => self.processing.is_idle(),
        }
    }

    async fn handle_event(
        &self,
        event: PipelineEvent,
        project: &mut Project,
        store: &ProjectStore,
        summary: &mut RunSummary,
        chain: bool,
    ) -> Result<()> {
        summary.record(&event);
        if let PipelineEvent::TaskFailed {
            item_id,
            kind,
            error,
            ..
        } = &event
        {
            warn!("{} of item {} failed: {}", kind, item_id, error);
        }
        if self.apply(project, &event, chain) {
            store.save(project).await?;
        }
        Ok(())
    }

    /// Apply every event already buffered on `rx`.
    async fn flush_buffered(
        &self,
        rx: &mut broadcast::Receiver<PipelineEvent>,
        project: &mut Project,
        store: &ProjectStore,
        summary: &mut RunSummary,
        chain: bool,
    ) -> Result<()> {
        loop {
            match rx.try_recv() {
                Ok(event) => {
                    self.handle_event(event, project, store, summary, chain)
                        .await?
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!("Event receiver lagged, {} events skipped", skipped)
                }
                Err(_) => return Ok(()),
            }
        }
    }

    /// Consume events, applying and saving them, until `until` drains or
    /// `shutdown` fires. On shutdown every pipeline is cancelled first and
    /// completions that were already published are still applied, without
    /// chaining new uploads.
    ///
    /// Subscribe with [`Self::subscribe`] before enqueueing work so no event
    /// is missed.
    pub async fn drive(
        &self,
        rx: &mut broadcast::Receiver<PipelineEvent>,
        project: &mut Project,
        store: &ProjectStore,
        until: Until,
        shutdown: &CancellationToken,
    ) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        let chain = self.chain_uploads;

        loop {
            if self.is_done(until) {
                // Terminal events are published before a pool reports idle,
                // so everything left for this run is already buffered.
                self.flush_buffered(rx, project, store, &mut summary, chain)
                    .await?;
                // Applying a completion may have chained more work
                if self.is_done(until) {
                    break;
                }
                continue;
            }

            let event = tokio::select! {
                biased;
                event = rx.recv() => event,
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, cancelling pipelines");
                    self.cancel_all().await;
                    // Cancelled work is silent, so what is buffered finished before the cancel
                    self.flush_buffered(rx, project, store, &mut summary, false)
                        .await?;
                    summary.cancelled = true;
                    break;
                }
            };

            match event {
                Ok(event) => {
                    self.handle_event(event, project, store, &mut summary, chain)
                        .await?
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Event receiver lagged, {} events skipped", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }

        store.save(project).await?;
        Ok(summary)
    }

    /// Cancel every pipeline and wait for their cleanup.
    pub async fn cancel_all(&self) {
        tokio::join!(self.downloads.cancel_all(), self.processing.cancel_all());
    }
}
