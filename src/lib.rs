use crate::{
    config::HostConfig,
    heap::Heap,
    probe::Capabilities,
    registry::Implementation,
    suite::{run_suite, SuiteOptions},
};
use clap::Parser;
use std::process::ExitCode;
use tokio::{runtime, task::LocalSet};
use tracing_subscriber::EnvFilter;

pub mod config;
pub mod error;
pub mod harness;
pub mod heap;
pub mod probe;
pub mod registry;
pub mod suite;

pub use error::{Error, Result};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Conformance checks for weak reference and finalization implementations"
)]
pub struct Args {
    /// Implementation to check; every available one when omitted.
    #[arg(short, long, value_enum)]
    pub implementation: Option<Implementation>,
    /// Milliseconds to wait for a collection before giving up.
    #[arg(short, long, default_value_t = 50)]
    pub timeout_ms: u64,
    /// Collections an unreachable registered object survives before it is reclaimed.
    #[arg(short, long, value_parser = clap::value_parser!(u32).range(1..))]
    pub survivor_passes: Option<u32>,
    /// Keep collecting once per task turn instead of collecting once.
    #[arg(short, long)]
    pub aggressive: bool,
    /// Cap on collections per observation in aggressive mode.
    #[arg(long, requires = "aggressive")]
    pub max_passes: Option<u32>,
    /// Behave as a host that does not expose a manual GC trigger.
    #[arg(long)]
    pub hide_gc: bool,
}

impl Args {
    /// Whether any flag changes the host configuration read from the environment.
    fn overrides_host(&self) -> bool {
        self.survivor_passes.is_some() || self.hide_gc
    }

    fn host_config(&self) -> Result<HostConfig> {
        let mut config = HostConfig::from_env()?;
        if let Some(passes) = self.survivor_passes {
            config = config.with_survivor_passes(passes);
        }
        if self.hide_gc {
            config.expose_gc = false;
        }
        Ok(config)
    }
}

pub fn run_cli() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(2)
        }
    }
}

fn run(args: &Args) -> Result<bool> {
    let config = args.host_config()?;
    let caps = if args.overrides_host() {
        Capabilities::probe(&config)
    } else {
        *Capabilities::detect()
    };
    let heap = Heap::new(config);

    let Some(gc) = heap.gc_trigger() else {
        println!("skipped: host does not expose a manual GC trigger");
        return Ok(true);
    };
    let implementations = match args.implementation {
        Some(implementation) => vec![caps.require(implementation)?],
        None => caps.available().collect(),
    };
    if implementations.is_empty() {
        return Err(Error::ImplementationNotAvailable);
    }

    let options = SuiteOptions {
        timeout_ms: args.timeout_ms,
        aggressive: args.aggressive,
        max_passes: args.max_passes,
    };
    let runtime = runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .map_err(|e| Error::Runtime(e.to_string()))?;

    let outcomes = runtime.block_on(LocalSet::new().run_until(async {
        let mut outcomes = Vec::new();
        for implementation in implementations {
            outcomes.extend(run_suite(&heap, gc.clone(), implementation, &options).await?);
        }
        Ok::<_, Error>(outcomes)
    }))?;

    for outcome in &outcomes {
        let status = if outcome.passed { "PASS" } else { "FAIL" };
        println!("{status} {:<6} {}", outcome.implementation, outcome.name);
    }
    let stats = heap.stats();
    println!(
        "{} collections, {} finalized, {} resurrections ({} survivor passes)",
        stats.collections,
        stats.finalized,
        stats.resurrections,
        heap.config().survivor_passes
    );

    Ok(outcomes.iter().all(|o| o.passed))
}
