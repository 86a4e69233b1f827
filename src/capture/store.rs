//! Artifact store.
//!
//! # Responsibilities
//! - Persist JSON metadata artifacts (awaitable, so ordering can be enforced)
//! - Open streaming sinks for raw request/response bodies
//!
//! # Design Decisions
//! - Write-only: the proxy never reads an artifact back
//! - Filenames are cycle-scoped, so concurrent cycles never contend
//! - Body write failures are swallowed by [`BodyCapture`]; delivery never waits on them

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};

use crate::observability::metrics;

/// Streaming destination for a raw body artifact.
pub type BodySink = Pin<Box<dyn AsyncWrite + Send>>;

/// Write-only sink for capture artifacts, addressed by filename.
pub trait ArtifactStore: Send + Sync + 'static {
    fn write_json(&self, name: String, contents: Vec<u8>) -> BoxFuture<'static, io::Result<()>>;

    fn create_body(&self, name: String) -> BoxFuture<'static, io::Result<BodySink>>;
}

/// Artifact store rooted at a directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    /// Use `root`, creating it if needed.
    pub async fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        tracing::info!(directory = %root.display(), "Capture directory ready");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl ArtifactStore for FsArtifactStore {
    fn write_json(&self, name: String, contents: Vec<u8>) -> BoxFuture<'static, io::Result<()>> {
        let path = self.path_of(&name);
        async move { tokio::fs::write(path, contents).await }.boxed()
    }

    fn create_body(&self, name: String) -> BoxFuture<'static, io::Result<BodySink>> {
        let path = self.path_of(&name);
        async move {
            let file = tokio::fs::File::create(path).await?;
            Ok(Box::pin(BufWriter::new(file)) as BodySink)
        }
        .boxed()
    }
}

/// A body artifact being streamed to the store.
///
/// The first failure is logged and the sink dropped; later writes become
/// no-ops. [`finish`](Self::finish) reports whether the whole body landed.
pub struct BodyCapture {
    name: String,
    label: &'static str,
    sink: Option<BodySink>,
    failed: bool,
}

impl BodyCapture {
    pub async fn open(store: &dyn ArtifactStore, name: String, label: &'static str) -> Self {
        match store.create_body(name.clone()).await {
            Ok(sink) => Self {
                name,
                label,
                sink: Some(sink),
                failed: false,
            },
            Err(e) => {
                tracing::warn!(artifact = %name, error = %e, "Could not open body artifact");
                metrics::record_artifact_failure(label);
                Self {
                    name,
                    label,
                    sink: None,
                    failed: true,
                }
            }
        }
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub async fn write(&mut self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        if let Err(e) = sink.write_all(chunk).await {
            self.fail(e);
        }
    }

    /// Flush and close. Returns true when every byte was persisted.
    pub async fn finish(mut self) -> bool {
        if let Some(mut sink) = self.sink.take() {
            let closed = match sink.flush().await {
                Ok(()) => sink.shutdown().await,
                Err(e) => Err(e),
            };
            if let Err(e) = closed {
                self.fail(e);
            }
        }
        !self.failed
    }

    fn fail(&mut self, error: io::Error) {
        tracing::warn!(artifact = %self.name, error = %error, "Body artifact write failed");
        metrics::record_artifact_failure(self.label);
        self.sink = None;
        self.failed = true;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory stores for unit tests.

    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::task::{Context, Poll};
    use std::time::Duration;

    /// Keeps artifacts in memory; optional per-file write delays.
    #[derive(Clone, Default)]
    pub struct MemoryStore {
        pub files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
        pub delays: Arc<Mutex<HashMap<String, Duration>>>,
        pub fail_all: bool,
    }

    impl MemoryStore {
        pub fn failing() -> Self {
            Self {
                fail_all: true,
                ..Default::default()
            }
        }

        pub fn delay(&self, name: &str, delay: Duration) {
            self.delays.lock().unwrap().insert(name.to_string(), delay);
        }

        pub fn get(&self, name: &str) -> Option<Vec<u8>> {
            self.files.lock().unwrap().get(name).cloned()
        }

        pub fn json(&self, name: &str) -> Option<serde_json::Value> {
            self.get(name).and_then(|b| serde_json::from_slice(&b).ok())
        }
    }

    impl ArtifactStore for MemoryStore {
        fn write_json(&self, name: String, contents: Vec<u8>) -> BoxFuture<'static, io::Result<()>> {
            let store = self.clone();
            async move {
                let delay = store.delays.lock().unwrap().get(&name).copied();
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                if store.fail_all {
                    return Err(io::Error::other("disk full"));
                }
                store.files.lock().unwrap().insert(name, contents);
                Ok(())
            }
            .boxed()
        }

        fn create_body(&self, name: String) -> BoxFuture<'static, io::Result<BodySink>> {
            let store = self.clone();
            async move {
                if store.fail_all {
                    return Err(io::Error::other("disk full"));
                }
                store.files.lock().unwrap().insert(name.clone(), Vec::new());
                Ok(Box::pin(MemorySink { store, name }) as BodySink)
            }
            .boxed()
        }
    }

    struct MemorySink {
        store: MemoryStore,
        name: String,
    }

    impl AsyncWrite for MemorySink {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let mut files = self.store.files.lock().unwrap();
            files.entry(self.name.clone()).or_default().extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }
}
