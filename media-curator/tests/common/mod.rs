//! Shared fixtures: a local media server, stand-in tool scripts and event helpers.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::Path as UrlPath;
use axum::http::StatusCode;
use axum::routing::get;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::broadcast;
use url::Url;

use media_curator::pipeline::PipelineEvent;

/// Body served for `/media/<name>`.
pub fn media_body(name: &str) -> String {
    format!("payload for {}", name)
}

async fn serve_media(UrlPath(name): UrlPath<String>) -> String {
    media_body(&name)
}

/// Sends one chunk, then never finishes.
async fn stall() -> Body {
    let first = futures::stream::once(async { Ok::<_, std::io::Error>(Bytes::from_static(b"partial")) });
    Body::from_stream(first.chain(futures::stream::pending()))
}

/// Serves `/media/{name}`, `/stall/{name}` and a 404 at `/missing`.
pub async fn spawn_media_server() -> SocketAddr {
    let app = Router::new()
        .route("/media/{name}", get(serve_media))
        .route("/stall/{name}", get(stall))
        .route("/missing", get(|| async { StatusCode::NOT_FOUND }));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

pub fn url(addr: SocketAddr, path: &str) -> Url {
    Url::parse(&format!("http://{}{}", addr, path)).unwrap()
}

/// Receive events until `done` matches one, returning everything seen.
pub async fn collect_until(
    rx: &mut broadcast::Receiver<PipelineEvent>,
    done: impl Fn(&PipelineEvent) -> bool,
) -> Vec<PipelineEvent> {
    let mut seen = Vec::new();
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let event = rx.recv().await.unwrap();
            let stop = done(&event);
            seen.push(event);
            if stop {
                break;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out, events so far: {:#?}", seen));
    seen
}

/// Everything already buffered on `rx`.
pub fn drain_buffered(rx: &mut broadcast::Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(event);
    }
    seen
}

pub fn files_with_suffix(dir: &Path, suffix: &str) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.to_string_lossy().ends_with(suffix))
        .collect()
}

/// Write an executable shell script.
#[cfg(unix)]
pub fn write_script(path: &Path, body: &str) {
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    {
        let mut file = std::fs::File::create(path).unwrap();
        file.write_all(format!("#!/bin/sh\n{}\n", body).as_bytes()).unwrap();
        file.sync_all().unwrap();
    }
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

/// Stand-in ffmpeg: writes a small file at its last argument.
#[cfg(unix)]
pub fn fake_ffmpeg(dir: &Path) -> PathBuf {
    let path = dir.join("ffmpeg");
    write_script(
        &path,
        r#"for last; do :; done
printf 'scaled' > "$last""#,
    );
    path
}

/// Stand-in ffmpeg that fails with a message on stderr.
#[cfg(unix)]
pub fn failing_ffmpeg(dir: &Path) -> PathBuf {
    let path = dir.join("ffmpeg-broken");
    write_script(&path, "echo 'Invalid data found when processing input' >&2\nexit 1");
    path
}

/// Stand-in storage CLI: logs its arguments and copies `cp` sources under `remote`.
#[cfg(unix)]
pub fn fake_aws(dir: &Path, remote: &Path, log: &Path) -> PathBuf {
    let path = dir.join("aws");
    write_script(
        &path,
        &format!(
            r#"echo "$@" >> '{log}'
if [ "$2" = "cp" ]; then
  key="${{4#s3://*/}}"
  mkdir -p "$(dirname '{remote}'/"$key")"
  cp "$3" '{remote}'/"$key"
fi"#,
            log = log.display(),
            remote = remote.display(),
        ),
    );
    path
}
