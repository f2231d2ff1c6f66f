//! JSONL sink for `quotaguard`. Appends one control-plane event per line.
//! Always writes; bring your own path.

use quotaguard::telemetry::{BoxSinkFuture, ControlEvent, TelemetrySink};
use std::io;
use std::path::PathBuf;
use std::task::{Context, Poll};

#[derive(Clone, Debug)]
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl tower_service::Service<ControlEvent> for JsonlSink {
    type Response = ();
    type Error = io::Error;
    type Future = BoxSinkFuture<io::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: ControlEvent) -> Self::Future {
        let path = self.path.clone();
        let line = event.to_json().to_string() + "\n";
        Box::pin(async move {
            use tokio::io::AsyncWriteExt;
            let mut file =
                tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await.map_err(|err| {
                tracing::warn!(target: "quotaguard::jsonl", path = %path.display(), error = %err, "flush failed");
                err
            })
        })
    }
}

impl TelemetrySink for JsonlSink {
    type SinkError = io::Error;
}
