//! shardcheck CLI
//!
//! Runs the built-in sharding stage 1 claims (or a claims file) on the
//! in-process reference backend and prints one line per claim.
//!
//! # Usage
//!
//! ```bash
//! # Built-in suite on the default job (200 samples × 1000 features, 2 epochs)
//! shardcheck
//!
//! # Smaller job, runs in parallel, JSON report
//! shardcheck --input-size 64 --parallel --json
//!
//! # Simulate hardware without bf16 support: bf16 claims are skipped
//! shardcheck --no-bf16
//!
//! # Custom claims
//! shardcheck --claims claims.json
//! ```
//!
//! Exit status is 0 when no claim fails, 1 when any claim fails, and 2 on
//! usage or setup errors.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use shardcheck::distributed::PartitionPolicy;
use shardcheck::harness::ClaimFile;
use shardcheck::{
    DeviceCapabilities, EquivalenceHarness, HarnessOptions, ModelSnapshot, ReferenceBackend,
    RunSpec, stage1_suite,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Partition {
    Greedy,
    RoundRobin,
}

impl From<Partition> for PartitionPolicy {
    fn from(p: Partition) -> Self {
        match p {
            Partition::Greedy => PartitionPolicy::Greedy,
            Partition::RoundRobin => PartitionPolicy::RoundRobin,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "shardcheck", version)]
#[command(about = "Check that sharding stage 1 reproduces data-parallel losses exactly")]
struct Cli {
    /// JSON claims file; the built-in stage 1 suite when omitted
    #[arg(long)]
    claims: Option<PathBuf>,

    /// Seed of every run's data generator
    #[arg(long)]
    data_seed: Option<u64>,

    /// Seed of the generated model snapshot
    #[arg(long)]
    model_seed: Option<u64>,

    #[arg(long)]
    epochs: Option<usize>,

    /// Samples per epoch
    #[arg(long)]
    samples: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    /// Sample width and hidden size of the model
    #[arg(long)]
    input_size: Option<usize>,

    #[arg(long)]
    lr: Option<f64>,

    #[arg(long)]
    weight_decay: Option<f64>,

    /// Global gradient norm clip
    #[arg(long, conflicts_with = "no_clip")]
    max_grad_norm: Option<f64>,

    /// Disable gradient clipping
    #[arg(long)]
    no_clip: bool,

    /// Run configurations concurrently
    #[arg(long)]
    parallel: bool,

    /// Pretend bf16 is unsupported; bf16 claims are skipped
    #[arg(long)]
    no_bf16: bool,

    /// Largest world size the backend may launch
    #[arg(long)]
    max_world_size: Option<usize>,

    /// Parameter-to-owner assignment for sharded runs
    #[arg(long, value_enum, default_value = "greedy")]
    partition: Partition,

    /// Load the starting model from a JSON snapshot
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Write the starting model to a JSON snapshot
    #[arg(long)]
    save_snapshot: Option<PathBuf>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn run_spec(&self, base: Option<RunSpec>) -> RunSpec {
        let mut run = base.unwrap_or_default();
        if let Some(v) = self.data_seed {
            run.data_seed = v;
        }
        if let Some(v) = self.model_seed {
            run.model_seed = v;
        }
        if let Some(v) = self.epochs {
            run.epochs = v;
        }
        if let Some(v) = self.samples {
            run.num_samples = v;
        }
        if let Some(v) = self.batch_size {
            run.batch_size = v;
        }
        if let Some(v) = self.input_size {
            run.input_size = v;
        }
        if let Some(v) = self.lr {
            run.training.learning_rate = v;
        }
        if let Some(v) = self.weight_decay {
            run.training.weight_decay = v;
        }
        if self.no_clip {
            run.training.max_grad_norm = None;
        } else if let Some(v) = self.max_grad_norm {
            run.training.max_grad_norm = Some(v);
        }
        run
    }
}

fn run(cli: &Cli) -> Result<bool> {
    let (base, claims) = match &cli.claims {
        Some(path) => {
            let file = ClaimFile::load_json(path)
                .with_context(|| format!("reading claims from {}", path.display()))?;
            (file.run, Some(file.claims))
        }
        None => (None, None),
    };
    let run = cli.run_spec(base);
    run.validate().context("invalid run settings")?;

    let claims = match claims {
        Some(claims) => claims,
        None => stage1_suite(&run)?,
    };

    let snapshot = match &cli.snapshot {
        Some(path) => ModelSnapshot::load_json(path)
            .with_context(|| format!("loading snapshot {}", path.display()))?,
        None => run.init_snapshot()?,
    };
    if let Some(path) = &cli.save_snapshot {
        snapshot
            .save_json(path)
            .with_context(|| format!("writing snapshot {}", path.display()))?;
        info!(path = %path.display(), "saved snapshot");
    }

    let backend = ReferenceBackend::new(DeviceCapabilities {
        bf16: !cli.no_bf16,
        max_world_size: cli.max_world_size.unwrap_or(usize::MAX),
    })
    .with_partition_policy(cli.partition.into());

    let options = HarnessOptions {
        parallel: cli.parallel,
    };
    let harness = EquivalenceHarness::new(backend, run).with_options(options);
    let report = harness.run(&snapshot, &claims)?;

    if cli.json {
        println!("{}", report.to_json()?);
    } else {
        println!("{report}");
    }
    Ok(report.success())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(2)
        }
    }
}
