//! Workload generator for exercising basalt against a live cluster.
//!
//! This binary issues read/write statements through the driver, records a
//! per-operation JSON history with client-side latencies, and can be used
//! for soak runs, retry-path checks, and latency comparisons.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use basalt_driver::policies::ConstantSpeculativeExecutionPolicy;
use basalt_driver::{Cluster, Consistency, CqlValue, Session, Statement};
use clap::{Parser, Subcommand};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::time;

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "basalt-workload")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    Run(RunArgs),
}

/// CLI options for running the workload.
#[derive(Parser, Debug, Clone)]
struct RunArgs {
    /// Comma-separated contact points, e.g. `127.0.0.1:9042,127.0.0.1:9043`
    #[arg(long)]
    nodes: String,

    /// Keyspace-qualified table with an `id int PRIMARY KEY, payload text`
    /// shape to read and write.
    #[arg(long, default_value = "basalt_bench.kv")]
    table: String,

    /// Number of concurrent client tasks sharing one session.
    #[arg(long, default_value_t = 10)]
    clients: usize,

    /// Number of hot keys used by the workload.
    #[arg(long, default_value_t = 100)]
    keys: usize,

    /// Percent of operations that are writes (rest are reads).
    #[arg(long, default_value_t = 50)]
    write_pct: u8,

    /// Total runtime for the workload.
    #[arg(long, default_value = "30s")]
    duration: humantime::Duration,

    /// Consistency level for all operations.
    #[arg(long, default_value = "one")]
    consistency: String,

    /// Enable speculative executions for reads with this delay.
    #[arg(long)]
    speculative_delay: Option<humantime::Duration>,

    /// Deterministic seed; 0 picks a random one.
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Write a JSON history to this path.
    #[arg(long, default_value = ".tmp/basalt/history.json")]
    out: PathBuf,
}

/// Metadata embedded in the history file for reproducibility.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
struct HistoryMeta {
    nodes: Vec<String>,
    table: String,
    clients: usize,
    keys: usize,
    write_pct: u8,
    duration_ms: u64,
    seed: u64,
    consistency: String,
}

/// Full workload history with per-operation records.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
struct History {
    meta: HistoryMeta,
    ops: Vec<OpRecord>,
}

/// Single operation record captured during the workload run.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
struct OpRecord {
    client: usize,
    op: OpKind,
    key: i32,
    call_us: u64,
    return_us: u64,
    result: OpResult,
}

/// Operation kind.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum OpKind {
    Read,
    Write,
}

/// Result of an operation with structured error encoding.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OpResult {
    Ok,
    Empty,
    Err { error: String },
}

#[tokio::main]
/// Parse CLI args, initialize logging, and dispatch.
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Run(args) => run(args).await,
    }
}

fn parse_nodes(raw: &str) -> anyhow::Result<Vec<SocketAddr>> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<SocketAddr>()
                .with_context(|| format!("invalid node address {part:?}"))
        })
        .collect()
}

fn parse_consistency(raw: &str) -> anyhow::Result<Consistency> {
    Ok(match raw.to_ascii_lowercase().as_str() {
        "any" => Consistency::Any,
        "one" => Consistency::One,
        "two" => Consistency::Two,
        "three" => Consistency::Three,
        "quorum" => Consistency::Quorum,
        "all" => Consistency::All,
        "local_quorum" => Consistency::LocalQuorum,
        "each_quorum" => Consistency::EachQuorum,
        "local_one" => Consistency::LocalOne,
        other => anyhow::bail!("unknown consistency {other:?}"),
    })
}

/// Run the workload and write the history file.
async fn run(args: RunArgs) -> anyhow::Result<()> {
    anyhow::ensure!(args.clients > 0, "--clients must be > 0");
    anyhow::ensure!(args.keys > 0, "--keys must be > 0");
    anyhow::ensure!(args.write_pct <= 100, "--write-pct must be <= 100");

    let nodes = parse_nodes(&args.nodes)?;
    anyhow::ensure!(!nodes.is_empty(), "--nodes must not be empty");
    let consistency = parse_consistency(&args.consistency)?;

    let duration: Duration = args.duration.into();
    // Use a random seed when the user provides zero.
    let seed = if args.seed == 0 {
        rand::thread_rng().gen()
    } else {
        args.seed
    };

    let mut builder = Cluster::builder().contact_points(nodes.iter().copied());
    if let Some(delay) = args.speculative_delay {
        builder = builder.speculative_execution_policy(Arc::new(
            ConstantSpeculativeExecutionPolicy {
                delay: delay.into(),
                max_executions: 2,
            },
        ));
    }
    let cluster = builder.build().await.context("cluster connect")?;
    let session = cluster.session();

    let read_query = format!("SELECT payload FROM {} WHERE id = ?", args.table);
    let write_query = format!("INSERT INTO {} (id, payload) VALUES (?, ?)", args.table);

    let start = time::Instant::now();
    let deadline = start + duration;

    let mut tasks = Vec::with_capacity(args.clients);
    for client_id in 0..args.clients {
        let session = session.clone();
        let read_query = read_query.clone();
        let write_query = write_query.clone();
        let keys = args.keys as i32;
        let write_pct = args.write_pct;
        // Mix the base seed with the client id for deterministic per-client RNG.
        let seed = seed ^ (client_id as u64).wrapping_mul(0x9e3779b97f4a7c15);
        tasks.push(tokio::spawn(async move {
            run_client(
                client_id,
                session,
                read_query,
                write_query,
                keys,
                write_pct,
                consistency,
                seed,
                start,
                deadline,
            )
            .await
        }));
    }

    let mut all_ops = Vec::new();
    for task in tasks {
        let mut ops = task.await.context("client task panicked")??;
        all_ops.append(&mut ops);
    }

    // Sort ops for deterministic history ordering.
    all_ops.sort_by_key(|op| (op.call_us, op.client));
    summarize(&all_ops);

    let meta = HistoryMeta {
        nodes: nodes.iter().map(|node| node.to_string()).collect(),
        table: args.table.clone(),
        clients: args.clients,
        keys: args.keys,
        write_pct: args.write_pct,
        duration_ms: duration.as_millis() as u64,
        seed,
        consistency: args.consistency.clone(),
    };
    let history = History {
        meta,
        ops: all_ops,
    };
    write_history(&args.out, &history).context("write history")?;
    eprintln!("wrote history: {}", args.out.display());

    cluster.shutdown().await;
    Ok(())
}

/// Run one client loop until the deadline, returning its op history.
#[allow(clippy::too_many_arguments)]
async fn run_client(
    client_id: usize,
    session: Session,
    read_query: String,
    write_query: String,
    keys: i32,
    write_pct: u8,
    consistency: Consistency,
    seed: u64,
    start: time::Instant,
    deadline: time::Instant,
) -> anyhow::Result<Vec<OpRecord>> {
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut ops = Vec::new();
    let mut seq = 0u64;

    while time::Instant::now() < deadline {
        seq += 1;
        let key = rng.gen_range(0..keys);
        let do_write = rng.gen_range(0..100u32) < u32::from(write_pct);

        let (kind, statement) = if do_write {
            let payload = format!("c{client_id}:{seq}");
            (
                OpKind::Write,
                Statement::new(write_query.clone())
                    .with_values(vec![CqlValue::Int(key), CqlValue::Text(payload)])
                    .with_consistency(consistency),
            )
        } else {
            (
                OpKind::Read,
                Statement::new(read_query.clone())
                    .with_values(vec![CqlValue::Int(key)])
                    .with_consistency(consistency)
                    .idempotent(),
            )
        };

        let call_us = start.elapsed().as_micros() as u64;
        let result = match session.execute(&statement).await {
            Ok(rows) if kind == OpKind::Read && rows.is_empty() => OpResult::Empty,
            Ok(_) => OpResult::Ok,
            Err(error) => OpResult::Err {
                error: error.to_string(),
            },
        };
        let return_us = start.elapsed().as_micros() as u64;

        ops.push(OpRecord {
            client: client_id,
            op: kind,
            key,
            call_us,
            return_us,
            result,
        });
    }
    Ok(ops)
}

/// Print a latency/error summary to stderr.
fn summarize(ops: &[OpRecord]) {
    if ops.is_empty() {
        eprintln!("no operations executed");
        return;
    }
    let mut latencies: Vec<u64> = ops.iter().map(|op| op.return_us - op.call_us).collect();
    latencies.sort_unstable();
    let errors = ops
        .iter()
        .filter(|op| matches!(op.result, OpResult::Err { .. }))
        .count();
    let percentile = |fraction: f64| {
        let index = ((latencies.len() - 1) as f64 * fraction) as usize;
        latencies[index]
    };
    eprintln!(
        "ops={} errors={} p50={}us p99={}us max={}us",
        ops.len(),
        errors,
        percentile(0.50),
        percentile(0.99),
        latencies[latencies.len() - 1],
    );
}

fn write_history(path: &Path, history: &History) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create {}", parent.display()))?;
    }
    let encoded = serde_json::to_vec_pretty(history)?;
    std::fs::write(path, encoded).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
