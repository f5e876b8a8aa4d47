//! Provenance CLI
//!
//! Embed, extract, inspect and verify manifests against a local filesystem store

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use manifest_survival::{
    AssetRef, CachePolicy, CarrierFormat, Config, ContentHash, Provenance, RecoveredPayload,
    VerificationStatus,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "provenance")]
#[command(about = "Keep provenance manifests attached to images")]
struct Args {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory used as the filesystem store tier
    #[arg(short, long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the content hash of a manifest file
    Hash { manifest: PathBuf },

    /// Store a manifest and embed it into an image
    Sign {
        #[arg(short, long)]
        manifest: PathBuf,
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// Carrier format (jpeg, png, webp); detected when omitted
        #[arg(short, long)]
        format: Option<String>,
    },

    /// Embed a manifest without storing it
    Embed {
        #[arg(short, long)]
        manifest: PathBuf,
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(short, long)]
        format: Option<String>,
    },

    /// Run every extraction method and report what was found
    Extract {
        asset: PathBuf,
        /// Write recovered manifest bytes here
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Verify images, or a Link header value when an image was stripped
    Verify {
        assets: Vec<PathBuf>,
        /// Only valid with at most one asset
        #[arg(short, long)]
        link: Option<String>,
        /// Assets verified at once
        #[arg(long, default_value_t = 4)]
        concurrency: usize,
        /// Print cache statistics after verifying
        #[arg(long)]
        stats: bool,
    },

    /// Summarize the manifest an image carries
    Inspect {
        asset: PathBuf,
        /// Also resolve and verify the manifest remotely
        #[arg(long)]
        remote: bool,
        /// Include the full manifest
        #[arg(long)]
        detail: bool,
    },

    /// Cache inspection
    Cache {
        #[command(subcommand)]
        action: CacheCommand,
    },

    /// Show the Cache-Control values the configuration produces
    Policy,
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
    /// Counters, layer occupancy and circuit state
    Stats,
}

fn parse_format(explicit: Option<&str>, path: &Path, bytes: &[u8]) -> anyhow::Result<CarrierFormat> {
    if let Some(name) = explicit {
        return CarrierFormat::from_extension(name)
            .with_context(|| format!("Unknown format '{}'. Valid options: jpeg, png, webp", name));
    }
    CarrierFormat::detect(bytes)
        .or_else(|| {
            path.extension()
                .and_then(|e| e.to_str())
                .and_then(CarrierFormat::from_extension)
        })
        .with_context(|| format!("Cannot detect carrier format of {:?}", path))
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(store) = &args.store {
        config.store.fs_root = Some(store.clone());
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    let provenance = Provenance::builder().config(config).build()?;

    match args.command {
        Command::Hash { manifest } => {
            let bytes = std::fs::read(&manifest)
                .with_context(|| format!("Failed to read {:?}", manifest))?;
            println!("{}", ContentHash::of(&bytes));
        }

        Command::Sign {
            manifest,
            input,
            output,
            format,
        } => {
            let manifest_bytes = std::fs::read(&manifest)?;
            let carrier = std::fs::read(&input)?;
            let format = parse_format(format.as_deref(), &input, &carrier)?;

            let mut signed = provenance
                .sign_bytes(&carrier, &manifest_bytes, format)
                .await?;
            std::fs::write(&output, &signed.embedded.bytes)?;
            if let Some(purge) = signed.purge.take() {
                let event = purge.await?;
                info!(
                    "Purge of {} finished after {} attempt(s) (ok: {})",
                    event.target_url, event.attempts, event.succeeded
                );
            }

            println!("Link: {}", signed.link_header());
            println!("{}", serde_json::to_string_pretty(&signed.embedded.result)?);
        }

        Command::Embed {
            manifest,
            input,
            output,
            format,
        } => {
            let manifest_bytes = std::fs::read(&manifest)?;
            let carrier = std::fs::read(&input)?;
            let format = parse_format(format.as_deref(), &input, &carrier)?;

            let embedded = provenance.embed(&carrier, &manifest_bytes, format);
            std::fs::write(&output, &embedded.bytes)?;
            println!("{}", serde_json::to_string_pretty(&embedded.result)?);
        }

        Command::Extract { asset, out } => {
            let bytes = std::fs::read(&asset)?;
            let result = provenance.extract(&bytes);

            println!("confidence: {}", result.confidence());
            if let Some(method) = result.method() {
                println!("method: {}", method);
            }
            match result.payload() {
                Some(RecoveredPayload::Manifest { hash, bytes }) => {
                    println!("manifest: {} ({} bytes)", hash, bytes.len());
                    if let Some(out) = &out {
                        std::fs::write(out, bytes)?;
                    }
                }
                Some(RecoveredPayload::Reference(reference)) => {
                    println!("reference: {}", reference);
                }
                Some(RecoveredPayload::Fragment {
                    claimed_hash,
                    bytes,
                    complete,
                }) => {
                    println!(
                        "fragment: claims {} ({} bytes, complete: {})",
                        claimed_hash,
                        bytes.len(),
                        complete
                    );
                }
                None => {}
            }
            for line in result.diagnostics() {
                println!("  {}", line);
            }
        }

        Command::Verify {
            assets,
            link,
            concurrency,
            stats,
        } => {
            if assets.len() > 1 {
                if link.is_some() {
                    bail!("--link applies to a single asset");
                }
                let mut refs = Vec::with_capacity(assets.len());
                for path in &assets {
                    let bytes = std::fs::read(path)
                        .with_context(|| format!("Failed to read {:?}", path))?;
                    refs.push(AssetRef::from_bytes(bytes));
                }
                let reports = provenance.verify_many(refs, concurrency).await;
                let verified = reports
                    .iter()
                    .filter(|r| r.status == VerificationStatus::Verified)
                    .count();
                let rows: Vec<_> = assets
                    .iter()
                    .zip(&reports)
                    .map(|(path, report)| json!({ "asset": path, "report": report }))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
                info!("{}/{} assets verified", verified, reports.len());
            } else {
                let asset_ref = match (assets.into_iter().next(), link) {
                    (Some(path), link) => {
                        let bytes = std::fs::read(&path)?;
                        let asset_ref = AssetRef::from_bytes(bytes);
                        match link {
                            Some(link) => asset_ref.with_link(link),
                            None => asset_ref,
                        }
                    }
                    (None, Some(link)) => AssetRef::from_link(link),
                    (None, None) => bail!("Provide an asset path, --link, or both"),
                };
                let report = provenance.verify(&asset_ref).await;
                println!("{}", serde_json::to_string_pretty(&report)?);
            }

            if stats {
                println!("{}", serde_json::to_string_pretty(&provenance.cache_stats().await?)?);
            }
        }

        Command::Inspect {
            asset,
            remote,
            detail,
        } => {
            let bytes = std::fs::read(&asset)
                .with_context(|| format!("Failed to read {:?}", asset))?;
            let inspection = provenance.inspect(&bytes, remote).await;
            let mut out = serde_json::to_value(&inspection)?;
            if let (true, Some(manifest)) = (detail, &inspection.manifest) {
                out["manifest"] = serde_json::to_value(manifest)?;
            }
            println!("{}", serde_json::to_string_pretty(&out)?);
        }

        Command::Cache {
            action: CacheCommand::Stats,
        } => {
            let stats = provenance.cache_stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }

        Command::Policy => {
            let cache = &provenance.config().cache;
            println!("manifest:     {}", CachePolicy::manifest(&cache.manifest).header_value());
            println!(
                "verification: {}",
                CachePolicy::verification(&cache.verification).header_value()
            );
            println!("negative:     {}", CachePolicy::negative().header_value());
        }
    }

    Ok(())
}
