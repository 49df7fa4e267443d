use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use console::style;
use dialoguer::{Input, Password};
use tracing_subscriber::{EnvFilter, fmt};

use authbroker::auth::Auth;
use authbroker::callback::PromptFn;
use authbroker::config::Config;
use authbroker::export::{ExportBundle, export_accounts, import_bundle};
use authbroker::manager::AuthManager;
use authbroker::providers::{LoginOptions, PROVIDER_KEYS};

/// `authbroker`: local credential broker for AI-CLI proxies.
#[derive(Parser, Debug)]
#[command(name = "authbroker")]
#[command(version)]
#[command(about = "Acquire, store, and refresh upstream provider credentials.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Log in to a provider (or import its peer CLI's credentials)
    Login {
        /// Provider key (claude, codex, gemini, antigravity, kiro, qwen, minimax, zhipu, vertex)
        provider: String,
        /// Print the URL instead of opening a browser
        #[arg(long)]
        no_browser: bool,
        /// Import from the provider's peer CLI store instead of logging in
        #[arg(long)]
        import: bool,
        /// Provider hints as KEY=VALUE (api_key, auth_method, project_id, region, label, ...)
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,
    },
    /// List stored credentials
    List,
    /// Show credential status (expiry, refresh schedule)
    Status,
    /// Refresh one credential, or all refreshable ones
    Refresh {
        /// Credential id (see `list`)
        id: Option<String>,
        /// Refresh every credential that has a refresh path
        #[arg(long)]
        all: bool,
    },
    /// Remove a stored credential
    Remove {
        /// Credential id (see `list`)
        id: String,
    },
    /// Delete expired credentials that cannot be refreshed
    Cleanup,
    /// Export credentials as a JSON bundle (tokens redacted by default)
    Export {
        /// Include token material instead of redacting it
        #[arg(long)]
        include_tokens: bool,
        /// Write to a file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Import a previously exported JSON bundle
    ImportBundle {
        /// Bundle file path
        file: PathBuf,
        /// Overwrite records whose ids already exist
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;
    let manager = AuthManager::new(config);

    match cli.command {
        Commands::Login {
            provider,
            no_browser,
            import,
            set,
        } => login(&manager, &provider, no_browser, import, &set).await,
        Commands::List => list(&manager),
        Commands::Status => status(&manager),
        Commands::Refresh { id, all } => refresh(&manager, id.as_deref(), all).await,
        Commands::Remove { id } => {
            manager.remove(&id)?;
            println!("removed {id}");
            Ok(())
        }
        Commands::Cleanup => cleanup(&manager),
        Commands::Export {
            include_tokens,
            output,
        } => export(&manager, include_tokens, output.as_deref()),
        Commands::ImportBundle { file, force } => import_from_file(&manager, &file, force),
    }
}

// ── Command handlers ────────────────────────────────────────────────

async fn login(
    manager: &AuthManager,
    provider: &str,
    no_browser: bool,
    import: bool,
    set: &[String],
) -> Result<()> {
    if !PROVIDER_KEYS.contains(&provider) {
        bail!(
            "unknown provider `{provider}` (expected one of: {})",
            PROVIDER_KEYS.join(", ")
        );
    }

    if import {
        let Some((auth, path)) = manager.import(provider).await? else {
            bail!("no {provider} peer-CLI credentials found on this machine");
        };
        print_import_result(&auth, &path);
        return Ok(());
    }

    let opts = LoginOptions {
        no_browser,
        metadata: parse_hints(set)?,
        prompt: Some(terminal_prompt()),
    };
    let (auth, path) = manager.login(provider, &opts).await?;

    println!();
    println!("  {} authentication successful", style("\u{2713}").green());
    println!("  account: {}", auth.label);
    if let Ok(Some(project_id)) = auth.meta_str("project_id") {
        println!("  project: {project_id}");
    }
    println!("  saved:   {}", path.display());
    Ok(())
}

fn print_import_result(auth: &Auth, path: &std::path::Path) {
    println!();
    println!("  {} imported {}", style("\u{2713}").green(), auth.id);
    if auth.is_expired() {
        println!(
            "  {} imported token is already expired; it will be refreshed on first use",
            style("warning:").yellow()
        );
    }
    println!("  saved: {}", path.display());
}

fn list(manager: &AuthManager) -> Result<()> {
    let auths = manager.list()?;
    if auths.is_empty() {
        println!("no stored credentials (run `authbroker login <provider>`)");
        return Ok(());
    }
    for auth in auths {
        println!("{:<36} {:<12} {}", auth.id, auth.provider, auth.label);
    }
    Ok(())
}

fn status(manager: &AuthManager) -> Result<()> {
    let auths = manager.list()?;
    if auths.is_empty() {
        println!("no stored credentials");
        return Ok(());
    }
    for auth in auths {
        let expiry = match auth.token_expires_at() {
            Some(at) if auth.is_expired() => style(format!("expired {at}")).red().to_string(),
            Some(at) => at.to_rfc3339(),
            None if auth.is_expired() => style("expired (unparseable expiry)").red().to_string(),
            None => "no expiry".to_string(),
        };
        let refresh = match auth.next_refresh_after {
            Some(at) => format!("refresh after {}", at.to_rfc3339()),
            None => "no refresh".to_string(),
        };
        println!(
            "{:<36} {:<10} {:<10} {expiry} ({refresh})",
            auth.id,
            auth.provider,
            auth.status.to_string(),
        );
    }
    Ok(())
}

async fn refresh(manager: &AuthManager, id: Option<&str>, all: bool) -> Result<()> {
    let targets: Vec<Auth> = if all {
        manager
            .list()?
            .into_iter()
            .filter(|auth| {
                auth.refresh_token().is_some() && manager.refresh_lead(&auth.provider).is_some()
            })
            .collect()
    } else {
        let id = id.context("pass a credential id or --all")?;
        vec![manager.load(id)?]
    };
    if targets.is_empty() {
        println!("nothing to refresh");
        return Ok(());
    }

    let mut failures = 0usize;
    for auth in targets {
        match manager.refresh(&auth).await {
            Ok(updated) => println!("{} refreshed {}", style("\u{2713}").green(), updated.id),
            Err(err) => {
                failures += 1;
                eprintln!("{} {}: {err}", style("\u{2717}").red(), auth.id);
            }
        }
    }
    if failures > 0 {
        bail!("{failures} refresh(es) failed");
    }
    Ok(())
}

fn cleanup(manager: &AuthManager) -> Result<()> {
    let removed = manager.cleanup()?;
    if removed.is_empty() {
        println!("nothing to clean up");
    } else {
        for id in removed {
            println!("removed {id}");
        }
    }
    Ok(())
}

fn export(manager: &AuthManager, include_tokens: bool, output: Option<&std::path::Path>) -> Result<()> {
    let auths = manager.list()?;
    let bundle = export_accounts(&auths, include_tokens);
    let mut body = serde_json::to_string_pretty(&bundle)?;
    body.push('\n');

    match output {
        Some(path) => {
            std::fs::write(path, body)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!(
                "exported {} account(s) to {}{}",
                bundle.accounts.len(),
                path.display(),
                if include_tokens { " (tokens included)" } else { "" },
            );
        }
        None => print!("{body}"),
    }
    Ok(())
}

fn import_from_file(manager: &AuthManager, file: &std::path::Path, force: bool) -> Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let bundle: ExportBundle =
        serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", file.display()))?;

    let report = import_bundle(manager, &bundle, force)?;
    println!(
        "imported {}, skipped {} existing, skipped {} redacted",
        report.imported, report.skipped_existing, report.skipped_redacted
    );
    if report.skipped_redacted > 0 {
        println!(
            "  {} redacted bundles cannot be imported; re-export with --include-tokens",
            style("note:").yellow()
        );
    }
    Ok(())
}

// ── Prompt wiring ───────────────────────────────────────────────────

/// Interactive prompt backed by dialoguer. Questions that mention keys
/// or secrets get hidden input.
fn terminal_prompt() -> PromptFn {
    Arc::new(|question: &str| {
        let lower = question.to_lowercase();
        let answer = if lower.contains("key") || lower.contains("secret") {
            Password::new()
                .with_prompt(question)
                .allow_empty_password(true)
                .interact()
        } else {
            Input::<String>::new()
                .with_prompt(question)
                .allow_empty(true)
                .interact_text()
        };
        answer.map_err(std::io::Error::other)
    })
}

/// Parse `KEY=VALUE` hint arguments.
fn parse_hints(set: &[String]) -> Result<BTreeMap<String, String>> {
    let mut hints = BTreeMap::new();
    for entry in set {
        let Some((key, value)) = entry.split_once('=') else {
            bail!("--set expects KEY=VALUE, got `{entry}`");
        };
        hints.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(hints)
}

// ── Tests ───────────────────────────────────────────────────────────
