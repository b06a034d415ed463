use std::collections::BTreeMap;
use std::path::PathBuf;

use color_eyre::eyre::{eyre, Result};
use ibp::{
    CapabilityRequest, ClientOptions, CycleEvent, IncrementalClient, UnixSocketTransport,
    WatchScope, PROTOCOL_SOCKET_ENV,
};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::config::UserConfig;

pub fn run(
    socket: Option<PathBuf>,
    scopes: Vec<WatchScope>,
    otel: bool,
    config: &UserConfig,
) -> Result<()> {
    let socket = socket
        .or_else(|| std::env::var_os(PROTOCOL_SOCKET_ENV).map(PathBuf::from))
        .ok_or_else(|| eyre!("No --socket given and {} is not set", PROTOCOL_SOCKET_ENV))?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let options = ClientOptions {
        supported_versions: config.supported_versions(),
        ..ClientOptions::default()
    };
    let client = IncrementalClient::<UnixSocketTransport>::with_options(socket, options);
    let caps = config.capability_request(&scopes, otel);

    runtime.block_on(watch(client, caps))
}

async fn watch(
    mut client: IncrementalClient<UnixSocketTransport>,
    caps: CapabilityRequest,
) -> Result<()> {
    client.connect(caps).await?;
    info!(version = ?client.version(), "Watching for cycles");

    let mut cycles = client.await_cycles().await?;
    loop {
        let next = tokio::select! {
            next = cycles.next() => next,
            _ = tokio::signal::ctrl_c() => break,
        };

        match next {
            Some(Ok(cycle)) => println!("{}", cycle_json(&cycle)),
            Some(Err(e)) => {
                debug!(error = %e, "Server went away");
                break;
            }
            None => break,
        }
    }

    cycles.stop().await?;
    drop(cycles);
    client.disconnect().await?;
    Ok(())
}

/// One cycle as a single JSON line with paths in sorted order.
fn cycle_json(cycle: &CycleEvent) -> Value {
    let sources: BTreeMap<_, _> = cycle.sources.iter().collect();

    let mut line = json!({
        "cycle_id": cycle.cycle_id,
        "scope": cycle.scope.map(|s| s.as_str()),
        "sources": sources,
    });
    if let Some(trace_id) = &cycle.trace.trace_id {
        line["trace_id"] = json!(trace_id);
    }
    line
}
