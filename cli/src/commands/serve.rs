use std::path::PathBuf;

use color_eyre::eyre::Result;
use ibp::{IncrementalServer, ServerOptions, SourceInfo, SourceInfoMap, WatchScope};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::UserConfig;

pub fn run(socket: Option<PathBuf>, config: &UserConfig) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let options = ServerOptions {
        socket_path: socket.unwrap_or_else(|| config.socket_path()),
        supported_versions: config.supported_versions(),
    };
    runtime.block_on(serve(options))
}

async fn serve(options: ServerOptions) -> Result<()> {
    let server = IncrementalServer::with_options(options);
    let cancel = CancellationToken::new();
    server.serve(cancel.clone())?;

    for (key, value) in server.env() {
        println!("export {}={}", key, value);
    }

    let version = tokio::select! {
        version = server.wait_for_connection() => version,
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            None
        }
    };

    let Some(version) = version else {
        info!("No client connected, shutting down");
        server.close().await?;
        return Ok(());
    };

    if !server.watching_scope(WatchScope::Sources) {
        warn!(%version, "Client is not watching sources");
    }

    let mut batches = BatchReader::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut first = true;

    while let Some(line) = lines.next_line().await? {
        if let Some(batch) = batches.push_line(&line) {
            send(&server, batch, &mut first).await?;
        }
    }
    if let Some(batch) = batches.finish() {
        send(&server, batch, &mut first).await?;
    }

    server.exit(None).await?;
    server.close().await?;
    Ok(())
}

async fn send(server: &IncrementalServer, batch: SourceInfoMap, first: &mut bool) -> Result<()> {
    if std::mem::take(first) {
        server.init(WatchScope::Sources, batch).await?;
    } else {
        server.cycle(WatchScope::Sources, batch).await?;
    }
    Ok(())
}

/// Groups stdin lines into change batches separated by blank lines.
///
/// `-path` marks a deletion, `+path` or a bare path a changed source file.
#[derive(Debug, Default)]
struct BatchReader {
    current: SourceInfoMap,
}

impl BatchReader {
    fn push_line(&mut self, line: &str) -> Option<SourceInfoMap> {
        let line = line.trim();
        if line.is_empty() {
            return self.take();
        }

        let (path, info) = match line.strip_prefix('-') {
            Some(path) => (path, None),
            None => (
                line.strip_prefix('+').unwrap_or(line),
                Some(SourceInfo::source()),
            ),
        };
        self.current.insert(path.trim().to_string(), info);
        None
    }

    fn finish(mut self) -> Option<SourceInfoMap> {
        self.take()
    }

    fn take(&mut self) -> Option<SourceInfoMap> {
        if self.current.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.current))
        }
    }
}
