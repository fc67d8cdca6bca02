//! Scale and upload pools driven through stand-in tools, plus full coordinator runs.

mod common;

use common::*;
use media_curator::config::{AppConfig, StorageConfig, TranscodeConfig};
use media_curator::coordinator::{PipelineCoordinator, Until};
use media_curator::manifest::CatalogEntry;
use media_curator::pipeline::{
    EventBus, MediaKind, PipelineEvent, ProcessingPipeline, Stage, TaskError, TranscodePipeline,
    UploadTask,
};
use media_curator::project::{MediaItem, ProjectStore};
use tokio_util::sync::CancellationToken;

fn is_scale_drain(event: &PipelineEvent) -> bool {
    matches!(
        event,
        PipelineEvent::StageDrained {
            stage: Stage::Scale
        }
    )
}

#[tokio::test]
async fn test_missing_ffmpeg_fails_with_install_hint() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.mp4");
    std::fs::write(&input, b"raw").unwrap();

    let bus = EventBus::default();
    let mut rx = bus.subscribe();
    let config = TranscodeConfig {
        ffmpeg_path: dir.path().join("no-such-ffmpeg").to_string_lossy().into_owned(),
        ..TranscodeConfig::default()
    };
    let scale = TranscodePipeline::new(&config, bus);
    let output = dir.path().join("scaled").join("out.mp4");
    scale.enqueue(5, MediaKind::Video, &input, &output);

    let events = collect_until(&mut rx, is_scale_drain).await;
    let error = events
        .iter()
        .find_map(|e| match e {
            PipelineEvent::TaskFailed { item_id: 5, error, .. } => Some(error.clone()),
            _ => None,
        })
        .unwrap();

    assert!(error.is_tool_not_found());
    assert_eq!(error.to_string(), "ffmpeg not found. Please install ffmpeg.");
    assert!(!output.exists());
}

#[cfg(unix)]
#[tokio::test]
async fn test_scale_success_and_failure() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.jpg");
    std::fs::write(&input, b"raw").unwrap();

    let bus = EventBus::default();
    let mut rx = bus.subscribe();
    let good = TranscodePipeline::new(
        &TranscodeConfig {
            ffmpeg_path: fake_ffmpeg(dir.path()).to_string_lossy().into_owned(),
            ..TranscodeConfig::default()
        },
        bus.clone(),
    );
    let output = dir.path().join("scaled").join("in.jpg");
    good.enqueue(1, MediaKind::Image, &input, &output);

    let events = collect_until(&mut rx, is_scale_drain).await;
    assert!(events.iter().any(|e| matches!(
        e,
        PipelineEvent::TaskCompleted { item_id: 1, output: Some(p), .. } if *p == output
    )));
    assert_eq!(std::fs::read_to_string(&output).unwrap(), "scaled");

    let broken = TranscodePipeline::new(
        &TranscodeConfig {
            ffmpeg_path: failing_ffmpeg(dir.path()).to_string_lossy().into_owned(),
            ..TranscodeConfig::default()
        },
        bus,
    );
    let second = dir.path().join("scaled").join("second.jpg");
    broken.enqueue(2, MediaKind::Image, &input, &second);

    let events = collect_until(&mut rx, is_scale_drain).await;
    let error = events
        .iter()
        .find_map(|e| match e {
            PipelineEvent::TaskFailed { item_id: 2, error, .. } => Some(error.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(
        error,
        TaskError::ProcessFailed {
            tool: "ffmpeg".to_string(),
            code: Some(1),
            message: "Invalid data found when processing input".to_string(),
        }
    );
    assert!(!second.exists());
}

#[cfg(unix)]
#[tokio::test]
async fn test_processing_pools_signal_joint_completion() {
    let dir = tempfile::tempdir().unwrap();
    let remote = dir.path().join("remote");
    let log = dir.path().join("aws.log");
    let input = dir.path().join("in.jpg");
    std::fs::write(&input, b"raw").unwrap();

    let bus = EventBus::default();
    let mut rx = bus.subscribe();
    let processing = ProcessingPipeline::new(
        &TranscodeConfig {
            ffmpeg_path: fake_ffmpeg(dir.path()).to_string_lossy().into_owned(),
            ..TranscodeConfig::default()
        },
        &StorageConfig {
            aws_path: fake_aws(dir.path(), &remote, &log).to_string_lossy().into_owned(),
            ..StorageConfig::default()
        },
        bus,
    );

    processing
        .scale()
        .enqueue(1, MediaKind::Image, &input, dir.path().join("out.jpg"));
    processing.upload().enqueue(UploadTask::object(
        2,
        &input,
        "assets",
        "media/in.jpg",
    ));

    let events = collect_until(&mut rx, |e| *e == PipelineEvent::AllTasksCompleted).await;
    let drains: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, PipelineEvent::StageDrained { .. }))
        .collect();
    assert_eq!(drains.len(), 2);
    assert!(processing.is_idle());
    assert_eq!(std::fs::read(remote.join("media/in.jpg")).unwrap(), b"raw");
}

#[cfg(unix)]
fn coordinator_config(dir: &std::path::Path) -> AppConfig {
    let remote = dir.join("remote");
    let log = dir.join("aws.log");
    let mut config = AppConfig::default();
    config.projects_dir = dir.join("data").join("projects");
    config.temp_dir = dir.join("tmp");
    config.transcode.ffmpeg_path = fake_ffmpeg(dir).to_string_lossy().into_owned();
    config.storage.aws_path = fake_aws(dir, &remote, &log).to_string_lossy().into_owned();
    config.storage.bucket = "assets".to_string();
    config
}

#[cfg(unix)]
#[tokio::test]
async fn test_upload_run_publishes_catalog_with_scaled_items() {
    let dir = tempfile::tempdir().unwrap();
    let config = coordinator_config(dir.path());
    let store = ProjectStore::new(&config.projects_dir, config.storage.bucket.clone());
    let categories_path = config.categories_path();

    let mut project = store.create("Espresso Shots", "espresso").await.unwrap();
    let scaled = project.scaled_dir().join("11_Ana_12s.mp4");
    std::fs::write(&scaled, b"0123456789").unwrap();
    project.add_media([
        MediaItem {
            kind: MediaKind::Video,
            id: 11,
            duration: 12,
            author: "Ana".to_string(),
            is_downloaded: true,
            is_scaled: true,
            local_scaled_path: Some(scaled),
            ..MediaItem::default()
        },
        MediaItem {
            kind: MediaKind::Video,
            id: 12,
            author: "Not scaled".to_string(),
            ..MediaItem::default()
        },
    ]);
    store.save(&project).await.unwrap();

    let coordinator = PipelineCoordinator::new(config.clone()).unwrap();
    let mut rx = coordinator.subscribe();
    let mut watcher = coordinator.subscribe();

    assert_eq!(coordinator.queue_uploads(&project).await.unwrap(), 1);
    let summary = coordinator
        .drive(
            &mut rx,
            &mut project,
            &store,
            Until::Processing,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(summary.failed, 0, "{:?}", summary.failures);
    assert_eq!(summary.uploaded, 1);
    assert_eq!(summary.completed, 4);

    let remote = dir.path().join("remote");
    assert_eq!(
        std::fs::read(remote.join("media/11_Ana_12s.mp4")).unwrap(),
        b"0123456789"
    );
    let catalog: Vec<CatalogEntry> = serde_json::from_str(
        &std::fs::read_to_string(remote.join("catalogs/espresso.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(catalog.len(), 1);
    assert_eq!(catalog[0].id, 11);
    assert_eq!(catalog[0].bytes, 10);
    assert_eq!(catalog[0].duration_s, Some(12));

    let index: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(remote.join("index.json")).unwrap())
            .unwrap();
    assert_eq!(index["prefixes"][0]["catalog"], "catalogs/espresso.json");
    assert!(remote.join("categories.json").is_file());
    assert!(categories_path.is_file());

    // Temp manifests are removed once uploaded
    assert!(files_with_suffix(&config.temp_dir, ".json").is_empty());

    let reloaded = store.open("Espresso Shots").await.unwrap();
    assert!(reloaded.item(11).unwrap().is_uploaded);
    assert!(!reloaded.item(12).unwrap().is_uploaded);

    let seen = drain_buffered(&mut watcher);
    assert!(seen.contains(&PipelineEvent::AllTasksCompleted));
}

#[cfg(unix)]
#[tokio::test]
async fn test_process_run_chains_uploads_after_scaling() {
    let dir = tempfile::tempdir().unwrap();
    let config = coordinator_config(dir.path());
    let store = ProjectStore::new(&config.projects_dir, config.storage.bucket.clone());

    let mut project = store.create("Latte Art", "latte").await.unwrap();
    let mut items = Vec::new();
    for id in 1..=3 {
        let raw = project.raw_dir().join(format!("{}_x.jpg", id));
        std::fs::write(&raw, b"raw").unwrap();
        items.push(MediaItem {
            kind: MediaKind::Image,
            id,
            author: "x".to_string(),
            is_downloaded: true,
            local_raw_path: Some(raw),
            ..MediaItem::default()
        });
    }
    project.add_media(items);

    let coordinator = PipelineCoordinator::new(config)
        .unwrap()
        .with_chained_uploads(true);
    let mut rx = coordinator.subscribe();
    assert_eq!(coordinator.queue_scales(&mut project), 3);

    let summary = coordinator
        .drive(
            &mut rx,
            &mut project,
            &store,
            Until::Processing,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(summary.failed, 0, "{:?}", summary.failures);
    assert_eq!(summary.uploaded, 3);
    for id in 1..=3 {
        let item = project.item(id).unwrap();
        assert!(item.is_scaled && item.is_uploaded);
        assert!(
            dir.path()
                .join("remote/media")
                .join(format!("{}_x.jpg", id))
                .is_file()
        );
    }
    assert!(coordinator.processing().is_idle());
}

#[cfg(unix)]
#[tokio::test]
async fn test_delete_category_removes_only_its_catalog() {
    let dir = tempfile::tempdir().unwrap();
    let config = coordinator_config(dir.path());
    let store = ProjectStore::new(&config.projects_dir, config.storage.bucket.clone());
    let mut project = store.create("Mocha", "mocha").await.unwrap();

    let mut categories = media_curator::manifest::CategoryList::default();
    categories.upsert("mocha", "Mocha");
    categories.upsert("latte", "Latte");
    categories.save(&config.categories_path()).await.unwrap();

    let coordinator = PipelineCoordinator::new(config.clone()).unwrap();
    let mut rx = coordinator.subscribe();
    coordinator.delete_category(&project).await.unwrap();
    let summary = coordinator
        .drive(
            &mut rx,
            &mut project,
            &store,
            Until::Processing,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(summary.failed, 0, "{:?}", summary.failures);

    let log = std::fs::read_to_string(dir.path().join("aws.log")).unwrap();
    assert!(log.contains("s3 rm s3://assets/catalogs/mocha.json"));
    assert_eq!(log.matches(" rm ").count(), 1);

    let local = media_curator::manifest::CategoryList::load(&config.categories_path())
        .await
        .unwrap();
    assert!(local.get("mocha").is_none());
    assert!(local.get("latte").is_some());
}
