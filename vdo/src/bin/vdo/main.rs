// vim: tw=80
use std::{
    path::PathBuf,
    process::exit,
    sync::Arc,
    time::Instant,
};

use clap::{crate_version, Parser};
use divbuf::{DivBuf, DivBufShared};
use futures::{StreamExt, TryStreamExt, stream};
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vdo_core::{Result, Vdo, VdoConfig, BLOCK_SIZE};

fn iovec(data: Vec<u8>) -> DivBuf {
    DivBufShared::from(data).try_const()
        .expect("A fresh DivBufShared has no mutable references")
}

/// Generates block contents with a chosen mix of duplicate and
/// compressible data
struct Workload {
    rng: XorShiftRng,
    dedupe: f64,
    compressible: f64,
    /// Every distinct block generated so far
    history: Vec<Arc<Vec<u8>>>,
}

impl Workload {
    fn next_block(&mut self) -> Arc<Vec<u8>> {
        if !self.history.is_empty() && self.rng.gen_bool(self.dedupe) {
            let i = self.rng.gen_range(0..self.history.len());
            return self.history[i].clone();
        }
        let mut data = vec![0u8; BLOCK_SIZE];
        if self.rng.gen_bool(self.compressible) {
            // Random bytes at the front, zeros after
            self.rng.fill(&mut data[..BLOCK_SIZE / 8]);
        } else {
            self.rng.fill(&mut data[..]);
        }
        let data = Arc::new(data);
        self.history.push(data.clone());
        data
    }
}

#[derive(Parser, Clone, Debug)]
/// Run a synthetic write workload against a VDO on RAM, and print its
/// statistics
struct Bench {
    /// YAML configuration file.  Defaults are used if absent.
    #[clap(short, long)]
    config:       Option<PathBuf>,
    /// Number of blocks to write
    #[clap(short, long, default_value_t = 65536)]
    blocks:       u64,
    /// Fraction of writes which repeat earlier data
    #[clap(short, long, default_value_t = 0.5)]
    dedupe:       f64,
    /// Fraction of new blocks which compress well
    #[clap(long, default_value_t = 0.5)]
    compressible: f64,
    /// Requests in flight at once
    #[clap(short = 'j', long, default_value_t = 32)]
    jobs:         usize,
    /// Random seed
    #[clap(long, default_value_t = 0)]
    seed:         u64,
    /// Skip reading every block back to check its contents
    #[clap(long)]
    no_verify:    bool,
}

impl Bench {
    fn config(&self) -> Result<VdoConfig> {
        match &self.config {
            Some(path) => {
                VdoConfig::from_yaml(&std::fs::read_to_string(path)?)
            }
            None => Ok(VdoConfig::default())
        }
    }

    async fn main(self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.dedupe) ||
            !(0.0..=1.0).contains(&self.compressible)
        {
            eprintln!("Error: ratios must be between 0 and 1");
            exit(2);
        }
        let config = self.config()?;
        let blocks = self.blocks.min(config.logical_blocks);
        let (vdo, _device) = Vdo::create_in_memory(config)?;
        let mut workload = Workload {
            rng: XorShiftRng::seed_from_u64(self.seed),
            dedupe: self.dedupe,
            compressible: self.compressible,
            history: Vec::new(),
        };
        let contents = (0..blocks)
            .map(|_| workload.next_block())
            .collect::<Vec<_>>();

        let start = Instant::now();
        stream::iter(contents.iter().enumerate())
            .map(|(lbn, data)| {
                let vdo = &vdo;
                async move {
                    vdo.write(lbn as u64, iovec(data.to_vec())).await
                }
            }).buffer_unordered(self.jobs.max(1))
            .try_collect::<Vec<_>>()
            .await?;
        vdo.flush().await?;
        let elapsed = start.elapsed();
        vdo.drain().await;
        info!(blocks, distinct = workload.history.len(),
              ?elapsed, "Workload finished");

        if !self.no_verify {
            let mut bad = 0u64;
            for (lbn, data) in contents.iter().enumerate() {
                let dbs = vdo.read(lbn as u64).await?;
                let db = dbs.try_const()
                    .expect("Read buffers are never shared mutably");
                if db[..] != data[..] {
                    eprintln!("LBN {lbn} has the wrong contents");
                    bad += 1;
                }
            }
            if bad > 0 {
                eprintln!("Error: {bad} blocks failed verification");
                exit(1);
            }
        }

        let secs = elapsed.as_secs_f64();
        let mbs = (blocks * BLOCK_SIZE as u64) as f64 / secs / 1048576.0;
        println!("# {blocks} blocks in {secs:.3}s ({mbs:.1} MiB/s)");
        let stats = serde_yaml_ng::to_string(&vdo.statistics())
            .expect("Statistics are always representable as YAML");
        print!("{stats}");
        vdo.shutdown().await;
        Ok(())
    }
}

#[derive(Parser, Clone, Debug)]
/// Print the default configuration, as YAML
struct Config {}

impl Config {
    fn main(self) -> Result<()> {
        print!("{}", VdoConfig::default().to_yaml()?);
        Ok(())
    }
}

#[derive(Parser, Clone, Debug)]
enum SubCommand {
    Bench(Bench),
    Config(Config),
}

#[derive(Parser, Clone, Debug)]
#[clap(version = crate_version!())]
struct Cli {
    #[clap(subcommand)]
    cmd: SubCommand,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let cli: Cli = Cli::parse();
    match cli.cmd {
        SubCommand::Bench(bench) => bench.main().await,
        SubCommand::Config(config) => config.main(),
    }
}

// LCOV_EXCL_STOP
