use anyhow::{Context, Result, bail};
use clap::Parser;
use ehr_core::generation::{DEFAULT_GEMINI_BASE_URL, DEFAULT_GEMINI_MODEL};
use ehr_core::{DocumentExtractor, GeminiClient};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Run one document extraction and print the structured result as JSON
#[derive(Parser)]
#[command(name = "scan_document")]
struct Cli {
    /// diagnosis, prescription, lab-report or surgery
    kind: String,
    file: PathBuf,
    /// Overrides the type guessed from the file extension
    #[arg(long)]
    mime_type: Option<String>,
    #[arg(long, default_value = DEFAULT_GEMINI_MODEL)]
    model: String,
}

fn guess_mime_type(path: &Path) -> Option<&'static str> {
    let extension = path.extension()?.to_str()?.to_lowercase();
    match extension.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "pdf" => Some("application/pdf"),
        "doc" => Some("application/msword"),
        "docx" => {
            Some("application/vnd.openxmlformats-officedocument.wordprocessingml.document")
        }
        _ => None,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let cli = Cli::parse();

    let api_key = std::env::var("GEMINI_API_KEY")
        .context("Please set the GEMINI_API_KEY environment variable")?;
    let base_url =
        std::env::var("GEMINI_BASE_URL").unwrap_or_else(|_| DEFAULT_GEMINI_BASE_URL.to_string());

    let mime_type = match cli.mime_type.as_deref().or_else(|| guess_mime_type(&cli.file)) {
        Some(mime_type) => mime_type.to_string(),
        None => bail!(
            "Cannot tell the type of {}; pass --mime-type",
            cli.file.display()
        ),
    };

    let payload = tokio::fs::read(&cli.file)
        .await
        .with_context(|| format!("Failed to read {}", cli.file.display()))?;

    println!("Scanning {} ({}, {} bytes)", cli.file.display(), mime_type, payload.len());

    let client = GeminiClient::new(api_key, cli.model).with_base_url(base_url);
    let extractor = DocumentExtractor::new(Arc::new(client));
    let result = extractor.extract(payload, &mime_type, &cli.kind).await?;

    if result.is_empty() {
        println!("No data found in document");
    }
    println!("{}", serde_json::to_string_pretty(&result)?);

    Ok(())
}
