use anyhow::{anyhow, bail, Context};
use clap::Parser;
use std::fs::{File, OpenOptions};
use std::path::Path;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use tftp_client::{Cli, Client, Event, Op, State};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if args.verbose { "debug" } else { "info" }));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = args.config();
    info!(
        "timeout: {} ms, retry: {}, local port: {}",
        config.timeout.as_millis(),
        config.max_retries,
        config.local_port
    );
    let (client, mut events, engine) = Client::spawn(config);

    let (host, port) = match &args.op {
        Op::Get { host, port, .. } | Op::Put { host, port, .. } => (host.clone(), *port),
    };
    client.connect(&host, port).await?;
    wait_connected(&mut events).await?;

    let start = Instant::now();
    match args.op {
        Op::Get { remote, local, .. } => {
            let local = local.unwrap_or_else(|| base_name(&remote).into());
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&local)
                .with_context(|| format!("open {}", local.display()))?;
            client.download(&remote, file).await?;
        }
        Op::Put { local, remote, .. } => {
            let file = File::open(&local).with_context(|| format!("open {}", local.display()))?;
            let remote = match remote {
                Some(remote) => remote,
                None => base_name(&local.to_string_lossy()).to_string(),
            };
            client.upload(file, &remote).await?;
        }
    }

    let (bytes, result) = wait_done(&mut events).await;
    client.close();
    drop(client);
    engine.await?;
    result?;

    let cost = start.elapsed();
    println!(
        "{} bytes, cost: {:.3}s, speed: {:.2} KB/s",
        bytes,
        cost.as_secs_f64(),
        bytes as f64 / cost.as_secs_f64() / 1024.0
    );
    Ok(())
}

async fn wait_connected(events: &mut UnboundedReceiver<Event>) -> anyhow::Result<()> {
    while let Some(event) = events.recv().await {
        debug!("{event:?}");
        match event {
            Event::StateChanged(State::Connected) => return Ok(()),
            Event::Error { code, message } => bail!("{code}: {message}"),
            _ => (),
        }
    }
    Err(anyhow!("engine stopped"))
}

async fn wait_done(events: &mut UnboundedReceiver<Event>) -> (u64, anyhow::Result<()>) {
    let mut bytes = 0;
    let mut failure = None;
    while let Some(event) = events.recv().await {
        match event {
            Event::Progress { done, total } => {
                bytes = done;
                match total {
                    Some(total) => eprint!("\r{done}/{total} bytes"),
                    None => eprint!("\r{done} bytes"),
                }
            }
            Event::Error { code, message } => failure = Some(anyhow!("{code}: {message}")),
            Event::Done { success } => {
                eprintln!();
                return match (success, failure) {
                    (true, _) => (bytes, Ok(())),
                    (false, Some(e)) => (bytes, Err(e)),
                    (false, None) => (bytes, Err(anyhow!("transfer failed"))),
                };
            }
            Event::StateChanged(state) => debug!("state {state:?}"),
        }
    }
    (bytes, Err(anyhow!("engine stopped")))
}

fn base_name(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(path)
}
