use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{debug, info};

use pdf_notary::config::Settings;
use pdf_notary::logging;
use pdf_notary::{PemTrustRoot, VerificationEngine, VerificationReport};

#[derive(Parser)]
#[command(name = "pdf-notary")]
#[command(about = "Verify PDF signatures against a private root CA")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify every signature of one or more PDFs
    Verify {
        /// PEM file with the root certificate signers must chain to
        #[arg(short, long)]
        root: PathBuf,

        /// PDFs to verify
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

#[derive(Serialize)]
struct FileReport {
    file: PathBuf,
    #[serde(flatten)]
    outcome: Outcome,
}

#[derive(Serialize)]
#[serde(rename_all = "snake_case")]
enum Outcome {
    Report(VerificationReport),
    Error(String),
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("loading configuration")?;
    logging::init_tracing(
        &settings.logging.filter,
        cli.log_json || settings.logging.json,
    );
    debug!(max_bytes = settings.pdf.max_bytes, "configuration loaded");

    match cli.command {
        Commands::Verify { root, files } => {
            let all_trusted = verify(&settings, &root, files)?;
            if !all_trusted {
                std::process::exit(1);
            }
        }
    }
    Ok(())
}

/// Prints one JSON report per file. Returns whether every signature of
/// every file is valid and trusted.
fn verify(settings: &Settings, root: &Path, files: Vec<PathBuf>) -> Result<bool> {
    let root_pem = std::fs::read_to_string(root)
        .with_context(|| format!("reading root certificate {}", root.display()))?;
    let engine = VerificationEngine::new(Arc::new(PemTrustRoot(root_pem)));

    let mut all_trusted = true;
    for file in files {
        let pdf_bytes =
            std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
        let outcome = if pdf_bytes.len() > settings.pdf.max_bytes {
            Outcome::Error(format!(
                "file of {} bytes exceeds the limit of {} bytes",
                pdf_bytes.len(),
                settings.pdf.max_bytes
            ))
        } else {
            match engine.verify_pdf(&pdf_bytes) {
                Ok(report) => Outcome::Report(report),
                Err(e) => Outcome::Error(e.to_string()),
            }
        };

        let trusted = matches!(&outcome, Outcome::Report(report) if report.all_trusted());
        info!(file = %file.display(), trusted, "verified");
        all_trusted &= trusted;

        println!("{}", serde_json::to_string_pretty(&FileReport { file, outcome })?);
    }
    Ok(all_trusted)
}
