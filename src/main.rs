//! 行锁模拟器命令行入口
//!
//! ```bash
//! # 默认配置（可重复读，10 个事务）
//! rs-locktable
//!
//! # 读已提交，偏向新事务，使用公平读写锁表
//! rs-locktable --isolation read-committed --favor-younger --variant optimized
//!
//! # 不同负载下的对比运行
//! rs-locktable --load-test --json
//! ```

use clap::Parser;
use rs_locktable::simulation::{load_test, Simulation};
use rs_locktable::{IsolationLevel, SimulationConfig, TableVariant};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 负载测试使用的并发事务数
const LOAD_TEST_LOADS: [usize; 3] = [100, 500, 1000];

#[derive(Parser, Debug)]
#[command(name = "rs-locktable")]
#[command(about = "Row-level locking simulator with wound-wait deadlock avoidance")]
#[command(version)]
struct Args {
    /// JSON config file; command line flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of rows in the table
    #[arg(long)]
    tuples: Option<usize>,

    /// Number of concurrent transactions
    #[arg(long)]
    tasks: Option<usize>,

    /// read-uncommitted | read-committed | repeatable-read | serializable
    #[arg(long)]
    isolation: Option<IsolationLevel>,

    /// Let the younger transaction win conflicts
    #[arg(long)]
    favor_younger: bool,

    /// standard | optimized | instrumented
    #[arg(long)]
    variant: Option<TableVariant>,

    /// Per-attempt lock timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Artificial latency of each update in milliseconds
    #[arg(long)]
    write_cost_ms: Option<u64>,

    /// Print reports as JSON
    #[arg(long)]
    json: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Compare several loads under read-committed with the instrumented table
    #[arg(long)]
    load_test: bool,
}

impl Args {
    fn simulation_config(&self) -> Result<SimulationConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => SimulationConfig::from_json_file(path)?,
            None => SimulationConfig::default(),
        };
        if let Some(tuples) = self.tuples {
            config.num_tuples = tuples;
        }
        if let Some(tasks) = self.tasks {
            config.num_tasks = tasks;
        }
        if let Some(level) = self.isolation {
            config.isolation_level = level;
        }
        if self.favor_younger {
            config.favor_older = false;
        }
        if let Some(variant) = self.variant {
            config.variant = variant;
        }
        if let Some(ms) = self.timeout_ms {
            config.lock_timeout_ms = ms;
        }
        if let Some(ms) = self.write_cost_ms {
            config.write_cost_ms = ms;
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .init();

    let config = args.simulation_config()?;
    tracing::info!("rs-locktable {}", env!("CARGO_PKG_VERSION"));

    let reports = if args.load_test {
        load_test(&LOAD_TEST_LOADS, &config)?
    } else {
        vec![Simulation::new(config)?.run()?]
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for report in &reports {
            println!("{}\n", report);
        }
    }

    if reports.iter().any(|r| !r.is_consistent()) {
        tracing::error!("isolation violations detected");
    }
    Ok(())
}
