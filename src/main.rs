use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing::info;

use parallax::control::StopToken;
use parallax::database::{shared, FileDatabase, SharedDatabase};
use parallax::matching::MatchingOptions;
use parallax::pairing::{
    ExhaustiveMatcher, ExhaustiveOptions, FeaturePairsImporter, FeaturePairsOptions,
    ImagePairsMatcher, ImagePairsOptions, SequentialMatcher, SequentialOptions, SpatialMatcher,
    SpatialOptions, TransitiveMatcher, TransitiveOptions,
};

/// Feature matching stage of the reconstruction pipeline.
#[derive(Parser, Debug)]
#[command(name = "parallax", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Path to the database file.
    #[arg(long)]
    database: PathBuf,

    /// Matcher worker threads; -1 uses all hardware threads.
    #[arg(long, default_value_t = -1)]
    num_threads: i32,

    /// Match on the GPU (requires a registered GPU backend).
    #[arg(long)]
    use_gpu: bool,

    /// Comma-separated GPU device indices; -1 means all devices.
    #[arg(long, default_value = "-1")]
    gpu_index: String,

    /// Nearest to second-nearest distance ratio limit.
    #[arg(long, default_value_t = 0.8)]
    max_ratio: f32,

    /// Maximum descriptor distance for an accepted match.
    #[arg(long, default_value_t = 512.0)]
    max_distance: f32,

    /// Only keep mutual nearest neighbor matches.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    cross_check: bool,

    /// Upper bound on matches per image pair.
    #[arg(long, default_value_t = 32768)]
    max_num_matches: usize,

    /// Match sets smaller than this are stored empty.
    #[arg(long, default_value_t = 15)]
    min_num_matches: usize,
}

impl CommonArgs {
    fn matching_options(&self) -> MatchingOptions {
        MatchingOptions {
            num_threads: self.num_threads,
            use_gpu: self.use_gpu,
            gpu_index: self.gpu_index.clone(),
            max_ratio: self.max_ratio,
            max_distance: self.max_distance,
            cross_check: self.cross_check,
            max_num_matches: self.max_num_matches,
            min_num_matches: self.min_num_matches,
        }
    }

    fn open_database(&self) -> Result<SharedDatabase> {
        Ok(shared(FileDatabase::open(&self.database)?))
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Match every image against every other image.
    Exhaustive {
        #[command(flatten)]
        common: CommonArgs,

        /// Images per matching block.
        #[arg(long, default_value_t = 50)]
        block_size: usize,
    },

    /// Match images against their successors in name order.
    Sequential {
        #[command(flatten)]
        common: CommonArgs,

        /// Number of following images to match against.
        #[arg(long, default_value_t = 10)]
        overlap: usize,

        /// Also match at exponentially growing strides.
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        quadratic_overlap: bool,
    },

    /// Match images against their spatial nearest neighbors.
    Spatial {
        #[command(flatten)]
        common: CommonArgs,

        #[arg(long, default_value_t = 50)]
        max_num_neighbors: usize,

        /// Maximum neighbor distance in meters.
        #[arg(long, default_value_t = 100.0)]
        max_distance: f64,

        /// Interpret priors as latitude, longitude, altitude.
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        is_gps: bool,

        /// Ignore the altitude component.
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        ignore_z: bool,
    },

    /// Match pairs reachable by two hops in the current match graph.
    Transitive {
        #[command(flatten)]
        common: CommonArgs,

        #[arg(long, default_value_t = 1000)]
        batch_size: usize,

        #[arg(long, default_value_t = 3)]
        num_iterations: usize,
    },

    /// Match image pairs listed in a text file.
    ImagePairs {
        #[command(flatten)]
        common: CommonArgs,

        /// File with one `name1 name2` pair per line.
        #[arg(long)]
        match_list: PathBuf,

        #[arg(long, default_value_t = 1225)]
        block_size: usize,
    },

    /// Import precomputed feature matches.
    Import {
        #[command(flatten)]
        common: CommonArgs,

        /// File with pair headers followed by `idx1 idx2` match lines.
        #[arg(long)]
        match_list: PathBuf,
    },
}

fn register_sigint(stop: &StopToken) -> Result<()> {
    signal_hook::flag::register(signal_hook::consts::SIGINT, stop.flag())?;
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Exhaustive { common, block_size } => {
            let mut matcher = ExhaustiveMatcher::new(
                ExhaustiveOptions { block_size },
                common.matching_options(),
                common.open_database()?,
            )?;
            register_sigint(&matcher.stop_token())?;
            matcher.run()?;
        }
        Command::Sequential {
            common,
            overlap,
            quadratic_overlap,
        } => {
            let mut matcher = SequentialMatcher::new(
                SequentialOptions {
                    overlap,
                    quadratic_overlap,
                },
                common.matching_options(),
                common.open_database()?,
            )?;
            register_sigint(&matcher.stop_token())?;
            matcher.run()?;
        }
        Command::Spatial {
            common,
            max_num_neighbors,
            max_distance,
            is_gps,
            ignore_z,
        } => {
            let mut matcher = SpatialMatcher::new(
                SpatialOptions {
                    max_num_neighbors,
                    max_distance,
                    is_gps,
                    ignore_z,
                },
                common.matching_options(),
                common.open_database()?,
            )?;
            register_sigint(&matcher.stop_token())?;
            matcher.run()?;
        }
        Command::Transitive {
            common,
            batch_size,
            num_iterations,
        } => {
            let mut matcher = TransitiveMatcher::new(
                TransitiveOptions {
                    batch_size,
                    num_iterations,
                },
                common.matching_options(),
                common.open_database()?,
            )?;
            register_sigint(&matcher.stop_token())?;
            matcher.run()?;
        }
        Command::ImagePairs {
            common,
            match_list,
            block_size,
        } => {
            let mut matcher = ImagePairsMatcher::new(
                ImagePairsOptions {
                    block_size,
                    match_list_path: match_list,
                },
                common.matching_options(),
                common.open_database()?,
            )?;
            register_sigint(&matcher.stop_token())?;
            matcher.run()?;
        }
        Command::Import { common, match_list } => {
            let mut importer = FeaturePairsImporter::new(
                FeaturePairsOptions {
                    match_list_path: match_list,
                },
                common.open_database()?,
            );
            register_sigint(&importer.stop_token())?;
            importer.run()?;
        }
    }

    info!("Done");
    Ok(())
}
