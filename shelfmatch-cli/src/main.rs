//! ShelfMatch CLI - index product photos and search them by image
//!
//! # Commands
//!
//! ```bash
//! # Build the local index from a directory of product photos
//! shelfmatch index --images data/products --out data/index
//!
//! # Search the local index, eBay, or both, printing JSON
//! shelfmatch search mug.jpg --mode combined --top-k 10
//!
//! # Show what the served index holds
//! shelfmatch inspect --index data/index
//!
//! # Embed an image and show vector stats
//! shelfmatch embed mug.jpg
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use shelfmatch_lib::{
    build::{IndexBuilder, RebuildLock},
    embed::{normalize, ClipEmbedder, ImageEmbedder},
    provider::{EbayConfig, EbayEnvironment, EbayProvider},
    query::{HttpFetcher, QueryImage},
    search::{MatchEngine, SearchConfig},
    snapshot::{CatalogSnapshot, IndexHandle},
    store::VectorStore,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "shelfmatch")]
#[command(about = "Visual product matching over a local catalog and online marketplaces")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the local index from a directory of images
    Index {
        /// Directory of product images (jpg, jpeg, png)
        #[arg(long, default_value = "data/products")]
        images: PathBuf,

        /// Index output directory
        #[arg(long, default_value = "data/index")]
        out: PathBuf,
    },

    /// Search by image: a file path, http(s) URL or data URI
    Search {
        /// Query image reference
        image: String,

        /// Number of results to return [default: 10]
        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        /// Which sources to search
        #[arg(short, long, value_enum, default_value = "local")]
        mode: Mode,

        /// Index directory
        #[arg(long, default_value = "data/index")]
        index: PathBuf,

        /// Provider for online mode
        #[arg(long, default_value = "ebay")]
        provider: String,

        /// Public base URL for thumbnail links, e.g. http://localhost:8000
        #[arg(long)]
        base_url: Option<String>,

        #[command(flatten)]
        ebay: EbayArgs,
    },

    /// Show the generation, size and first records of an index
    Inspect {
        /// Index directory
        #[arg(long, default_value = "data/index")]
        index: PathBuf,

        /// Number of records to list
        #[arg(short, long, default_value = "5")]
        limit: usize,
    },

    /// Embed an image and show vector info
    Embed {
        /// Image reference: file path, http(s) URL or data URI
        image: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Local,
    Online,
    Combined,
}

#[derive(clap::Args)]
struct EbayArgs {
    /// eBay application client id
    #[arg(long, env = "EBAY_CLIENT_ID", hide_env_values = true)]
    ebay_client_id: Option<String>,

    /// eBay application client secret
    #[arg(long, env = "EBAY_CLIENT_SECRET", hide_env_values = true)]
    ebay_client_secret: Option<String>,

    /// eBay environment: sandbox or production
    #[arg(long, env = "EBAY_ENV", default_value = "sandbox")]
    ebay_env: String,
}

impl EbayArgs {
    fn into_config(self) -> Result<EbayConfig> {
        Ok(EbayConfig {
            client_id: self.ebay_client_id,
            client_secret: self.ebay_client_secret,
            environment: self.ebay_env.parse::<EbayEnvironment>()?,
            ..EbayConfig::default()
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Index { images, out } => {
            eprintln!("Loading CLIP model (first run downloads the weights)...");
            let mut embedder = ClipEmbedder::new()?;

            // fails fast if another rebuild holds the index directory
            let builder = IndexBuilder::new(&images);
            let (_, report) =
                builder.build_and_persist(&mut embedder, &out, &RebuildLock::new(), |done, total| {
                    if done % 50 == 0 || done == total {
                        eprintln!("  embedded {done}/{total}");
                    }
                })?;

            println!(
                "Indexed {} images from '{}' into '{}' (generation {})",
                report.indexed,
                images.display(),
                out.display(),
                report.generation.as_deref().unwrap_or("-")
            );
            for (path, reason) in &report.skipped {
                println!("  skipped {}: {reason}", path.display());
            }
        }

        Commands::Search {
            image,
            top_k,
            mode,
            index,
            provider,
            base_url,
            ebay,
        } => {
            let config = SearchConfig {
                public_base_url: base_url,
                ..SearchConfig::default()
            };
            let handle = Arc::new(IndexHandle::new());
            if let Err(err) = handle.load_from(&index) {
                warn!(index = %index.display(), error = %err, "local index not loaded");
            }

            let fetcher = HttpFetcher::new(config.fetch_timeout)?;
            let query = QueryImage::from_reference(&image, &fetcher).await?;

            let engine = MatchEngine::new(ClipEmbedder::new()?, handle)?
                .with_config(config)
                .with_provider(Arc::new(EbayProvider::new(ebay.into_config()?)?));

            let top_k = top_k.unwrap_or(engine.config().default_top_k);
            let response = match mode {
                Mode::Local => engine.search_local(&query, top_k).await?,
                Mode::Online => engine.search_online(&query, top_k, &provider).await?,
                Mode::Combined => engine.search_combined(&query, top_k, true).await?,
            };
            info!(results = response.results.len(), "search finished");
            println!("{}", serde_json::to_string_pretty(&response)?);
        }

        Commands::Inspect { index, limit } => {
            let snapshot = CatalogSnapshot::load(&index)?;
            println!("Index: {}", index.display());
            println!("  Generation: {}", snapshot.generation().unwrap_or("-"));
            println!("  Products: {}", snapshot.len());
            match snapshot.store().dimension() {
                Some(dim) => println!("  Dimensions: {dim}"),
                None => println!("  Dimensions: - (empty)"),
            }

            for record in snapshot.catalog().iter().take(limit) {
                println!("\n#{} {}", record.id, record.name);
                println!("  image: {}", record.image_ref);
                println!("  thumb: {}", record.thumb_ref);
                println!("  category: {}", record.category);
            }
        }

        Commands::Embed { image } => {
            let fetcher = HttpFetcher::new(SearchConfig::default().fetch_timeout)?;
            let query = QueryImage::from_reference(&image, &fetcher).await?;

            eprintln!("Loading CLIP model (first run downloads the weights)...");
            let mut embedder = ClipEmbedder::new()?;
            let raw = embedder.embed(&query.image())?;
            if raw.is_empty() {
                bail!("model returned an empty embedding");
            }
            let raw_norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
            let vector = normalize(raw)?;
            let values = vector.as_slice();

            println!("Embedding stats ({}):", embedder.model_name());
            println!("  Dimensions: {}", values.len());
            println!("  Raw norm: {raw_norm:.4}");
            println!("  First 5 values: {:?}", &values[..values.len().min(5)]);
            println!("  Min: {:.4}", values.iter().copied().fold(f32::INFINITY, f32::min));
            println!("  Max: {:.4}", values.iter().copied().fold(f32::NEG_INFINITY, f32::max));
        }
    }

    Ok(())
}
