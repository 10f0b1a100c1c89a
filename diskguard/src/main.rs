use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand, ValueEnum};
use rand::Rng;
use tracing::instrument;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "diskguard",
    version,
    about = "Inspect and exercise on-disk block caches under a disk limiter",
    long_about = "`diskguard` opens the working-set and sync block caches stored below a cache \
directory, together with the disk limiter that bounds them, and runs one operation on them.

EXAMPLE:
    # Show cache and limiter status as JSON
    diskguard --cache-dir ~/.cache/blocks status

    # Fill the working-set cache with 1000 random 64KiB blocks
    diskguard --cache-dir /tmp/blocks simulate --blocks 1000 --block-size 64KiB"
)]
struct Args {
    /// Directory holding the block caches
    #[arg(long, value_name = "PATH", global = true, help_heading = "Cache")]
    cache_dir: Option<std::path::PathBuf>,

    // Limiter settings
    /// Overall byte limit of the journal and the working-set cache, e.g. "200GiB"
    #[arg(long, value_name = "SIZE", default_value = "200GiB", global = true, help_heading = "Limiter")]
    byte_limit: bytesize::ByteSize,

    /// Fraction of the byte limit the working-set cache may use
    #[arg(long, value_name = "FRAC", default_value = "0.1", global = true, help_heading = "Limiter")]
    disk_cache_frac: f64,

    /// Fraction of free disk space the sync cache may use
    #[arg(long, value_name = "FRAC", default_value = "1.0", global = true, help_heading = "Limiter")]
    sync_cache_frac: f64,

    /// Principal that journal and quota usage is charged to
    #[arg(long, value_name = "ID", default_value = "", global = true, help_heading = "Limiter")]
    charged_to: String,

    // Cache settings
    /// Pause between batches when clearing a folder
    ///
    /// This option accepts a human readable duration, e.g. "200ms", "1s", "5min" etc.
    #[arg(long, value_name = "DELAY", default_value = "1s", value_parser = humantime::parse_duration, global = true, help_heading = "Cache")]
    clear_backoff: std::time::Duration,

    /// Blocks removed per batch when clearing a folder
    #[arg(long, value_name = "N", default_value = "100", global = true, help_heading = "Cache")]
    clear_batch: usize,

    // Progress & output
    /// Verbose level: -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true, help_heading = "Progress & output")]
    verbose: u8,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", global = true, help_heading = "Progress & output")]
    quiet: bool,

    // Advanced settings
    /// Number of worker threads, 0 means number of cores
    #[arg(long, default_value = "0", value_name = "N", global = true, help_heading = "Advanced settings")]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(long, default_value = "0", value_name = "N", global = true, help_heading = "Advanced settings")]
    max_blocking_threads: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Print limiter and cache status as JSON
    Status,
    /// Remove every block of a folder from one cache
    Clear {
        /// Folder id in hex
        #[arg(long, value_name = "TLF")]
        tlf: common::TlfId,
        #[arg(long, value_enum, default_value_t = Tier::WorkingSet)]
        cache: Tier,
    },
    /// Remove blocks of a folder that do not carry a tag
    DeleteUnmarked {
        /// Folder id in hex
        #[arg(long, value_name = "TLF")]
        tlf: common::TlfId,
        /// Blocks marked with this tag are kept
        #[arg(long)]
        tag: String,
        #[arg(long, value_enum, default_value_t = Tier::Sync)]
        cache: Tier,
    },
    /// Put random blocks into a cache and report the resulting status
    Simulate {
        /// Number of blocks to put
        #[arg(long, value_name = "N", default_value = "100")]
        blocks: usize,
        /// Size of each block, e.g. "64KiB"
        #[arg(long, value_name = "SIZE", default_value = "64KiB")]
        block_size: bytesize::ByteSize,
        /// Number of folders the blocks are spread over
        #[arg(long, value_name = "N", default_value = "4")]
        folders: usize,
        /// Mark the first folder as the home folder of the sync cache
        #[arg(long)]
        home: bool,
        #[arg(long, value_enum, default_value_t = Tier::WorkingSet)]
        cache: Tier,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Any,
    WorkingSet,
    Sync,
}

impl From<Tier> for blockcache::CacheType {
    fn from(tier: Tier) -> Self {
        match tier {
            Tier::Any => blockcache::CacheType::Any,
            Tier::WorkingSet => blockcache::CacheType::WorkingSet,
            Tier::Sync => blockcache::CacheType::Sync,
        }
    }
}

#[derive(serde::Serialize)]
struct Report {
    limiter: throttle::DiskLimiterStatus,
    caches: std::collections::BTreeMap<&'static str, blockcache::DiskBlockCacheStatus>,
}

async fn report(
    limiter: &throttle::DiskLimiter,
    caches: &blockcache::TwoTierCache,
    charged_to: &common::UserOrTeamId,
) -> Result<String> {
    let report = Report {
        limiter: limiter
            .get_status(&common::RequestContext::new(), charged_to)
            .await,
        caches: caches.status().await,
    };
    serde_json::to_string_pretty(&report).context("cannot serialize status")
}

async fn simulate(
    ctx: &common::RequestContext,
    caches: &blockcache::TwoTierCache,
    blocks: usize,
    block_size: u64,
    folders: usize,
    home: bool,
    cache_type: blockcache::CacheType,
) -> Result<()> {
    if folders == 0 {
        return Err(anyhow!("--folders must be at least 1"));
    }
    let tlfs: Vec<common::TlfId> = (0..folders)
        .map(|_| common::TlfId::random(common::TlfType::Private))
        .collect();
    if home {
        caches
            .add_home_tlf(&tlfs[0])
            .await
            .context("cannot set the home folder")?;
    }
    let size = usize::try_from(block_size).context("block size does not fit in memory")?;
    let mut buf = vec![0u8; size];
    let mut full = 0usize;
    for i in 0..blocks {
        rand::thread_rng().fill(&mut buf[..]);
        let block_id = common::BlockId::random();
        let tlf_id = &tlfs[i % tlfs.len()];
        match caches
            .put(
                ctx,
                tlf_id,
                &block_id,
                &buf,
                common::ServerHalf::random(),
                cache_type,
            )
            .await
        {
            Ok(()) => {}
            Err(error) if error.is_cache_full() => full += 1,
            Err(error) => return Err(error).with_context(|| format!("put of block {i} failed")),
        }
    }
    if full > 0 {
        tracing::warn!("{} of {} blocks did not fit", full, blocks);
    }
    caches.wait_for_deletes().await;
    Ok(())
}

#[instrument(skip(args))]
async fn async_main(args: Args) -> Result<String> {
    let cache_dir = args
        .cache_dir
        .clone()
        .ok_or_else(|| anyhow!("--cache-dir is required"))?;
    std::fs::create_dir_all(&cache_dir)
        .with_context(|| format!("cannot create {}", cache_dir.display()))?;
    let limiter_config = common::LimiterConfig {
        byte_limit: i64::try_from(args.byte_limit.as_u64()).unwrap_or(i64::MAX),
        disk_cache_frac: args.disk_cache_frac,
        sync_cache_frac: args.sync_cache_frac,
        ..Default::default()
    };
    limiter_config.validate().map_err(|error| anyhow!(error))?;
    let cache_config = common::CacheConfig {
        clear_backoff: args.clear_backoff,
        blocks_to_evict_on_clear: args.clear_batch,
        ..Default::default()
    };
    let limiter = std::sync::Arc::new(
        throttle::DiskLimiter::new(
            &limiter_config,
            std::sync::Arc::new(throttle::StatvfsProbe::new(&cache_dir)),
            std::sync::Arc::new(throttle::NoQuota),
        )
        .context("cannot set up the disk limiter")?,
    );
    let caches = blockcache::TwoTierCache::open(
        &cache_dir,
        &cache_config,
        limiter.clone(),
        std::sync::Arc::new(common::clock::SystemClock),
    )
    .with_context(|| format!("cannot open block caches in {}", cache_dir.display()))?;
    caches
        .wait_until_started(blockcache::CacheType::WorkingSet)
        .await
        .context("working-set cache failed to start")?;
    if caches.is_sync_cache_enabled() {
        caches
            .wait_until_started(blockcache::CacheType::Sync)
            .await
            .context("sync cache failed to start")?;
    }
    let ctx = common::RequestContext::new();
    let charged_to = common::UserOrTeamId::new(args.charged_to.clone());
    let result = match args.command {
        Command::Status => Ok(()),
        Command::Clear { tlf, cache } => caches
            .clear_all_tlf_blocks(&ctx, &tlf, cache.into())
            .await
            .with_context(|| format!("cannot clear folder {tlf}")),
        Command::DeleteUnmarked { tlf, tag, cache } => caches
            .delete_unmarked(&ctx, &tlf, &tag, cache.into())
            .await
            .with_context(|| format!("cannot delete unmarked blocks of folder {tlf}")),
        Command::Simulate {
            blocks,
            block_size,
            folders,
            home,
            cache,
        } => {
            simulate(
                &ctx,
                &caches,
                blocks,
                block_size.as_u64(),
                folders,
                home,
                cache.into(),
            )
            .await
        }
    };
    let status = report(&limiter, &caches, &charged_to).await;
    caches.shutdown().await;
    result?;
    status
}

fn main() -> Result<()> {
    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    match common::run(output, runtime, func) {
        Some(status) => {
            println!("{status}");
            Ok(())
        }
        None => std::process::exit(1),
    }
}
