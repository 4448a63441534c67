//! # testbrain CLI (`tb`)
//!
//! Runs one in-memory knowledge-base session per invocation: load
//! documents, build, then generate test cases or a script.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `tb chunks <file>` | Normalize and chunk one file, print chunk offsets |
//! | `tb elements <page.html>` | Print the page's element map as JSON |
//! | `tb generate --docs <dir> --query <q>` | Build, then generate grounded test cases |
//! | `tb script --docs <dir> --page <html> --query <q>` | Build, generate, then synthesize a script |
//!
//! ## Examples
//!
//! ```bash
//! tb chunks docs/product_specs.md
//! tb elements checkout.html
//! tb generate --docs ./docs --query "discount code" --max-cases 5 --json
//! tb script --docs ./docs --page checkout.html --query "discount code" --out test_discount.py
//! ```
//!
//! Logs go to stderr; results go to stdout.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use testbrain::config::{self, Config};
use testbrain::elements::element_map_from_html;
use testbrain::error::PipelineError;
use testbrain::generator::GenerationOutcome;
use testbrain::loader::{load_directory, load_file};
use testbrain::normalize::{decode_text, normalize};
use testbrain::session::Session;
use testbrain_core::chunk::chunk_text;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// testbrain: documentation-grounded test cases and automation scripts.
#[derive(Parser)]
#[command(name = "tb", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/tb.toml")]
    config: PathBuf,

    /// Log level when `RUST_LOG` is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Normalize and chunk a single file (dry run of the build phase).
    Chunks {
        file: PathBuf,

        /// Format tag overriding extension detection (md, txt, json, pdf, html).
        #[arg(long)]
        format: Option<String>,
    },

    /// Print the element map extracted from page markup.
    Elements { page: PathBuf },

    /// Build a knowledge base and generate grounded test cases.
    Generate {
        /// Directory of documentation to ingest.
        #[arg(long)]
        docs: PathBuf,

        /// Target page markup, indexed alongside the docs.
        #[arg(long)]
        page: Option<PathBuf>,

        #[arg(long)]
        query: String,

        #[arg(long, default_value_t = 10)]
        max_cases: usize,

        /// Print the full outcome as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Build, generate test cases, and synthesize a script for one of them.
    Script {
        #[arg(long)]
        docs: PathBuf,

        #[arg(long)]
        page: PathBuf,

        #[arg(long)]
        query: String,

        /// Test case id to script. Defaults to the first generated case.
        #[arg(long = "case")]
        case_id: Option<String>,

        #[arg(long, default_value_t = 10)]
        max_cases: usize,

        /// Write the script here instead of stdout.
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

fn init_logging(level: &str) -> Result<()> {
    let level: tracing::Level = level.parse().context("Invalid log level")?;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string())),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Chunks { file, format } => run_chunks(&cfg, &file, format.as_deref()),
        Commands::Elements { page } => {
            let html = std::fs::read(&page)
                .with_context(|| format!("Failed to read {}", page.display()))?;
            let map = element_map_from_html(&decode_text(&html))?;
            println!("{}", serde_json::to_string_pretty(&map)?);
            Ok(())
        }
        Commands::Generate {
            docs,
            page,
            query,
            max_cases,
            json,
        } => {
            let session = prepare_session(&cfg, &docs, page.as_deref()).await?;
            let outcome = session.generate(&query, max_cases).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                print_outcome(&outcome);
            }
            Ok(())
        }
        Commands::Script {
            docs,
            page,
            query,
            case_id,
            max_cases,
            out,
        } => {
            let session = prepare_session(&cfg, &docs, Some(&page)).await?;
            let outcome = session.generate(&query, max_cases).await?;
            let case_id = match case_id {
                Some(id) => id,
                None => match outcome.cases.first() {
                    Some(case) => case.id.clone(),
                    None => bail!("No grounded test cases were generated for '{}'", query),
                },
            };

            let script = match session.generate_script(&case_id).await {
                Ok(script) => script,
                Err(PipelineError::SelectorMismatch {
                    selectors, script, ..
                }) => {
                    eprintln!("--- rejected script ---\n{}\n---", script.text);
                    bail!(
                        "Script for {} still references unknown selectors after {} attempts: {}",
                        case_id,
                        script.attempts,
                        selectors.join(", ")
                    );
                }
                Err(e) => return Err(e.into()),
            };

            match out {
                Some(path) => {
                    std::fs::write(&path, &script.text)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    eprintln!(
                        "Wrote {} script for {} to {} ({} selectors, {} attempt(s))",
                        script.framework,
                        case_id,
                        path.display(),
                        script.selectors_used.len(),
                        script.attempts
                    );
                }
                None => println!("{}", script.text),
            }
            Ok(())
        }
    }
}

fn run_chunks(cfg: &Config, file: &Path, format: Option<&str>) -> Result<()> {
    let doc = load_file(file, format)?;
    let normalized = normalize(&doc.content, doc.format)?;
    let chunks = chunk_text(
        &doc.id,
        &normalized.text,
        cfg.chunking.chunk_size,
        cfg.chunking.chunk_overlap,
    )?;

    println!(
        "{} ({}, {} chars)",
        doc.name,
        doc.format,
        normalized.text.chars().count()
    );
    for page in &normalized.pages {
        println!("  page {:>3}  {:>7}..{:<7}", page.page, page.start, page.end);
    }
    let mut count = 0usize;
    for chunk in chunks {
        count += 1;
        println!(
            "  #{:<4} {:>7}..{:<7} overlap={:<4} {}",
            chunk.ordinal,
            chunk.start,
            chunk.end,
            chunk.overlap,
            &chunk.hash[..12.min(chunk.hash.len())]
        );
    }
    if count == 0 {
        eprintln!("warning: {} produced no text", doc.name);
    }
    Ok(())
}

async fn prepare_session(cfg: &Config, docs: &Path, page: Option<&Path>) -> Result<Session> {
    let session = Session::from_config(cfg)?;

    for doc in load_directory(docs, &cfg.loader)? {
        session.add_document(doc).await;
    }
    if let Some(page) = page {
        let html =
            std::fs::read(page).with_context(|| format!("Failed to read {}", page.display()))?;
        let name = page
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| page.display().to_string());
        session.upload_page(&name, html).await?;
    }

    let report = session.build(None).await?;
    for w in &report.warnings {
        match &w.chunk {
            Some(chunk) => eprintln!("warning: {} [{}]: {}", w.document, chunk, w.message),
            None => eprintln!("warning: {}: {}", w.document, w.message),
        }
    }
    eprintln!(
        "Knowledge base generation {}: {} documents, {} chunks",
        report.generation,
        report.documents.len(),
        report.chunk_count
    );
    if !report.success {
        bail!("Knowledge base is empty; nothing to generate from");
    }
    Ok(session)
}

fn print_outcome(outcome: &GenerationOutcome) {
    for case in &outcome.cases {
        println!("{} [{:?}] {}: {}", case.id, case.category, case.feature, case.title);
        if !case.preconditions.is_empty() {
            println!("  Preconditions: {}", case.preconditions);
        }
        for (i, step) in case.steps.iter().enumerate() {
            if step.expected.is_empty() {
                println!("  {}. {}", i + 1, step.action);
            } else {
                println!("  {}. {} -> {}", i + 1, step.action, step.expected);
            }
        }
        println!("  Expected: {}", case.expected_result);
        println!("  Grounded in: {}", case.grounded_in.join(", "));
        println!();
    }
    for v in &outcome.violations {
        eprintln!("dropped: {}", v);
    }
    eprintln!(
        "{} test case(s), {} dropped, {} evidence chunk(s)",
        outcome.cases.len(),
        outcome.violations.len(),
        outcome.evidence.len()
    );
}
