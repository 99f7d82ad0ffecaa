//! `brisa`: fetch electronic invoices by access key.

use std::path::PathBuf;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tokio_util::sync::CancellationToken;

use brisa::{manual_channel, AccessKey, RetrievalContext, Retriever};
use brisa_cli::config::{resolve, FetchFlags};
use brisa_cli::{exit_code_for, prompt};

#[derive(Parser)]
#[command(
    name = "brisa",
    about = "Retrieve Brazilian electronic invoices (NF-e / NFC-e) by access key",
    version
)]
struct Cli {
    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Retrieve an invoice from the portal and print it as JSON.
    Fetch {
        /// 44-digit access key; spaces, dots and dashes are ignored.
        key: String,

        /// Captcha mode (manual, ocr, service).
        #[arg(long)]
        captcha: Option<String>,

        /// Directory of `<char>.png` OCR templates.
        #[arg(long)]
        templates: Option<PathBuf>,

        /// Maximum form submissions.
        #[arg(long)]
        retries: Option<u32>,

        /// Per-request timeout in seconds.
        #[arg(long)]
        timeout: Option<u64>,

        #[arg(long)]
        user_agent: Option<String>,

        /// Portal base URL.
        #[arg(long)]
        base_url: Option<String>,

        /// JSON file describing the portal's paths, fields and markers.
        #[arg(long)]
        portal_config: Option<PathBuf>,

        /// Third-party solver endpoint (key is read from BRISA_SOLVER_KEY).
        #[arg(long)]
        solver_url: Option<String>,

        /// Also write the raw response body here.
        #[arg(long)]
        raw_out: Option<PathBuf>,

        /// Log response bodies at debug level.
        #[arg(long)]
        debug: bool,
    },

    /// Parse a saved portal response (HTML or NF-e XML) and print it as JSON.
    Parse {
        file: PathBuf,
    },

    /// Validate and decode an access key.
    Key {
        key: String,
    },

    /// Generate shell completion scripts.
    ///
    /// Examples:
    ///   brisa completions bash > ~/.local/share/bash-completion/completions/brisa
    ///   brisa completions zsh > ~/.zfunc/_brisa
    Completions {
        /// Shell type (bash, zsh, fish, powershell, elvish).
        shell: Shell,
    },
}

fn init_logging(level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn invoice_json(invoice: &brisa::Invoice) -> anyhow::Result<String> {
    let mut value = serde_json::to_value(invoice)?;
    if let Some(fields) = value.as_object_mut() {
        fields.remove("raw");
    }
    Ok(serde_json::to_string_pretty(&value)?)
}

async fn fetch(key: String, flags: FetchFlags, raw_out: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = resolve(&flags)?;
    let retriever = Retriever::new(resolved.options, resolved.portal, resolved.solver)?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling retrieval");
            on_interrupt.cancel();
        }
    });

    let (sink, handle) = manual_channel();
    let prompt = tokio::spawn(prompt::answer_challenges(handle));

    let ctx = RetrievalContext::new().with_cancel(cancel).with_manual(sink);
    let result = retriever.retrieve(&key, ctx).await;
    prompt.abort();
    let retrieval = result?;

    if let Some(path) = raw_out {
        std::fs::write(&path, retrieval.invoice.raw().html())
            .with_context(|| format!("writing raw response to {}", path.display()))?;
    }
    println!("{}", invoice_json(&retrieval.invoice)?);
    tracing::info!(submissions = retrieval.submissions, "done");
    Ok(())
}

fn parse_file(file: PathBuf) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
    let invoice = brisa::parse(&raw)?;
    println!("{}", invoice_json(&invoice)?);
    Ok(())
}

fn describe_key(key: &str) -> anyhow::Result<()> {
    let key = AccessKey::parse(key)?;
    let info = serde_json::json!({
        "key": key.as_str(),
        "formatted": key.formatted(),
        "state_code": key.state_code(),
        "year_month": key.year_month(),
        "issuer_cnpj": key.issuer_cnpj(),
        "model": key.model(),
        "series": key.series(),
        "number": key.number(),
        "emission_type": key.emission_type(),
        "numeric_code": key.numeric_code(),
        "check_digit": key.check_digit(),
        "check_digit_valid": key.check_digit_matches(),
    });
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.json_logs);

    let result = match cli.command {
        Commands::Fetch {
            key,
            captcha,
            templates,
            retries,
            timeout,
            user_agent,
            base_url,
            portal_config,
            solver_url,
            raw_out,
            debug,
        } => {
            let flags = FetchFlags {
                captcha,
                templates,
                retries,
                timeout_secs: timeout,
                user_agent,
                base_url,
                portal_config,
                solver_url,
                debug,
            };
            fetch(key, flags, raw_out).await
        }

        Commands::Parse { file } => parse_file(file),

        Commands::Key { key } => describe_key(&key),

        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "brisa", &mut std::io::stdout());
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(exit_code_for(&e));
    }
    Ok(())
}
