use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use clap::Parser;
use logfleet_core::{HostSpec, QueryRequest};
use logfleet_engine::file::FileFleet;
use logfleet_engine::{EngineConfig, FleetEngine};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Query local log files as a fleet and print the merged, time-ordered
/// view plus the per-minute histogram.
#[derive(Parser, Debug)]
#[command(name = "logfleet")]
struct Args {
    /// Host definition as `id=/path/to/logfile`; repeatable.
    #[arg(long = "host", required = true)]
    hosts: Vec<String>,
    /// Glob pattern selecting active hosts (empty selects all).
    #[arg(long, default_value = "")]
    filter: String,
    /// Range start, RFC3339. Defaults to one hour before --to.
    #[arg(long)]
    from: Option<DateTime<Utc>>,
    /// Range end, RFC3339. Defaults to now.
    #[arg(long)]
    to: Option<DateTime<Utc>>,
    /// Substring each matching line must contain.
    #[arg(long, default_value = "")]
    query: String,
    /// Number of additional load-earlier rounds after the fresh query.
    #[arg(long, default_value_t = 0)]
    earlier: u32,
}

fn parse_hosts(args: &[String]) -> Result<Vec<HostSpec>> {
    let mut specs = Vec::new();
    for entry in args {
        let Some((id, path)) = entry.split_once('=') else {
            bail!("invalid --host '{entry}', expected id=/path/to/logfile");
        };
        specs.push(HostSpec::with_addr(id.trim(), path.trim()));
    }
    Ok(specs)
}

/// Wait until the fleet went idle again and the latest response stopped
/// changing.
async fn settle(
    state_rx: &mut tokio::sync::watch::Receiver<logfleet_core::FleetState>,
    resp_rx: &mut tokio::sync::watch::Receiver<Option<logfleet_core::QueryResponse>>,
) -> Result<logfleet_core::QueryResponse> {
    let settled = tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            let quiet = tokio::time::timeout(Duration::from_millis(300), resp_rx.changed()).await;
            match quiet {
                Ok(changed) => changed.context("engine stopped")?,
                Err(_elapsed) => {
                    let busy = state_rx.borrow().busy;
                    let ready = resp_rx.borrow().is_some();
                    if !busy && ready {
                        return Ok::<_, anyhow::Error>(resp_rx.borrow().clone().unwrap_or_default());
                    }
                }
            }
        }
    })
    .await
    .context("query did not settle")??;
    Ok(settled)
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let specs = parse_hosts(&args.hosts)?;
    let to = args.to.unwrap_or_else(Utc::now);
    let from = args.from.unwrap_or(to - ChronoDuration::hours(1));
    if from > to {
        bail!("--from {from} is after --to {to}");
    }

    let handle = FleetEngine::spawn(specs, Arc::new(FileFleet), EngineConfig::default());
    handle.set_hosts_filter(args.filter.clone())?;

    let mut state_rx = handle.state();
    let mut resp_rx = handle.responses();

    info!(event = "query", from = %from, to = %to, query = %args.query);
    handle.query(QueryRequest {
        from,
        to,
        query: args.query.clone(),
        load_earlier: false,
    })?;
    let mut resp = settle(&mut state_rx, &mut resp_rx).await?;

    for round in 0..args.earlier {
        info!(event = "load_earlier", round = round + 1);
        handle.query(QueryRequest {
            from,
            to,
            query: args.query.clone(),
            load_earlier: true,
        })?;
        resp = settle(&mut state_rx, &mut resp_rx).await?;
    }

    for msg in &resp.logs {
        let marker = if msg.decreased_timestamp { "~" } else { " " };
        println!(
            "{}{} {} {}",
            marker,
            msg.time.format("%Y-%m-%d %H:%M:%S"),
            msg.host,
            msg.msg
        );
    }
    println!();
    for (minute, stat) in &resp.minute_stats {
        let when = DateTime::<Utc>::from_timestamp(*minute, 0)
            .map(|t| t.format("%H:%M").to_string())
            .unwrap_or_else(|| minute.to_string());
        println!("{when}  {:>6}", stat.num_msgs);
    }
    println!(
        "\n{} shown of {} matched",
        resp.logs.len(),
        resp.num_msgs_total
    );

    let state = state_rx.borrow().clone();
    if !state.connected {
        bail!("no host became reachable");
    }

    handle.shutdown();
    Ok(())
}
