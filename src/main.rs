//! sshdeck - Main entry point.
//!
//! Usage: sshdeck <COMMAND> [ARGS]
//!
//! Commands:
//!   vault status                 Show whether a master password is set
//!   vault init                   Set the master password
//!   vault passwd                 Change the master password
//!   vault list                   List stored credentials
//!   vault search <query>         Search credentials
//!   vault add <user@host[:port]> [--name N] [--tag T]... [--id ID] [--no-secret]
//!   vault show <id> [--reveal]   Show one credential
//!   vault rm <id>                Delete a credential
//!   diag <id> [--json]           Run diagnostics against a stored host
//!   ls <id> [path]               List a remote directory
//!   shell <id>                   Open an interactive shell
//!
//! Options:
//!   --version, -v    Show version
//!
//! Passwords are read from SSHDECK_MASTER_PASSWORD (and
//! SSHDECK_NEW_MASTER_PASSWORD for init/passwd) or from stdin.

use std::env;
use std::io::{self, Write};
use std::process::ExitCode;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{error, info};
use zeroize::{Zeroize, Zeroizing};

use sshdeck::config::Config;
use sshdeck::diagnostics::DiagnosticCollector;
use sshdeck::remote::FilesystemManager;
use sshdeck::session::{SessionEvent, SessionRegistry};
use sshdeck::transport::{Endpoint, SshTransport};
use sshdeck::vault::record::parse_target;
use sshdeck::vault::{CredentialDraft, Vault};
use sshdeck::{Error, Result, logging};

const VERSION: &str = env!("CARGO_PKG_VERSION");

const MASTER_PASSWORD_VAR: &str = "SSHDECK_MASTER_PASSWORD";
const NEW_MASTER_PASSWORD_VAR: &str = "SSHDECK_NEW_MASTER_PASSWORD";
const SECRET_VAR: &str = "SSHDECK_SECRET";

const USAGE: &str = "\
Usage: sshdeck <COMMAND> [ARGS]

Commands:
  vault status|init|passwd|list
  vault search <query>
  vault add <user@host[:port]> [--name N] [--tag T]... [--id ID] [--no-secret]
  vault show <id> [--reveal]
  vault rm <id>
  diag <id> [--json]
  ls <id> [path]
  shell <id>

Options:
  --version, -v    Show version
  --help, -h       Show this help";

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();

    if args.iter().any(|a| a == "--version" || a == "-v") {
        println!("sshdeck v{}", VERSION);
        return ExitCode::SUCCESS;
    }

    if args.is_empty() || args.iter().any(|a| a == "--help" || a == "-h") {
        println!("{}", USAGE);
        return ExitCode::SUCCESS;
    }

    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("Warning: could not load config ({}), using defaults", e);
        Config::default()
    });

    if let Err(e) = logging::init(&config.log_config) {
        eprintln!("Warning: logging disabled ({})", e);
    }

    match run(&config, &args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Command failed: {}", e);
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: &Config, args: &[String]) -> Result<()> {
    let (command, rest) = args
        .split_first()
        .ok_or_else(|| Error::Usage(USAGE.to_string()))?;
    info!("Running command: {}", command);

    match command.as_str() {
        "vault" => vault_command(config, rest).await,
        "diag" => diag_command(config, rest).await,
        "ls" => ls_command(config, rest).await,
        "shell" => shell_command(config, rest).await,
        other => Err(Error::Usage(format!("Unknown command: {}\n\n{}", other, USAGE))),
    }
}

// ============================================================================
// Vault commands
// ============================================================================

async fn vault_command(config: &Config, args: &[String]) -> Result<()> {
    let vault = Vault::open(&config.vault_path, config.kdf)?;
    let sub = args.first().map(String::as_str).unwrap_or("status");

    match sub {
        "status" => {
            let status = vault.status().await;
            println!("Vault: {}", vault.path().display());
            println!(
                "Master password: {}",
                if status.has_verifier { "set" } else { "not set" }
            );
            println!("Credentials: {}", status.credential_count);
            Ok(())
        }
        "init" => {
            let new = read_secret(NEW_MASTER_PASSWORD_VAR, "New master password")?;
            vault.set_master_password(&new, None).await?;
            println!("Master password set.");
            Ok(())
        }
        "passwd" => {
            let old = read_secret(MASTER_PASSWORD_VAR, "Current master password")?;
            let new = read_secret(NEW_MASTER_PASSWORD_VAR, "New master password")?;
            vault.set_master_password(&new, Some(old.as_str())).await?;
            println!("Master password changed.");
            Ok(())
        }
        "list" => {
            let password = read_secret(MASTER_PASSWORD_VAR, "Master password")?;
            for summary in vault.list_credentials(&password).await? {
                print_summary(&summary);
            }
            Ok(())
        }
        "search" => {
            let query = required(args.get(1), "search query")?;
            let password = read_secret(MASTER_PASSWORD_VAR, "Master password")?;
            for summary in vault.search_credentials(query, &password).await? {
                print_summary(&summary);
            }
            Ok(())
        }
        "add" => {
            let target = required(args.get(1), "user@host[:port]")?;
            let (username, host, port) = parse_target(target)
                .ok_or_else(|| Error::Usage(format!("Invalid target: {}", target)))?;

            let mut draft = CredentialDraft::new(host, port, username);
            let mut with_secret = true;
            let mut flags = args[2..].iter();
            while let Some(flag) = flags.next() {
                match flag.as_str() {
                    "--name" => draft = draft.with_display_name(required(flags.next(), "name")?),
                    "--tag" => draft = draft.with_tag(required(flags.next(), "tag")?),
                    "--id" => draft = draft.with_id(required(flags.next(), "id")?),
                    "--no-secret" => with_secret = false,
                    other => return Err(Error::Usage(format!("Unknown flag: {}", other))),
                }
            }

            let password = read_secret(MASTER_PASSWORD_VAR, "Master password")?;
            if !vault.verify_master_password(&password).await {
                return Err(sshdeck::VaultError::Authentication.into());
            }
            if with_secret {
                let secret = read_secret(SECRET_VAR, "Login password")?;
                draft.secret = Some(secret);
            }

            let id = vault.save_credential(draft, &password).await?;
            println!("{}", id);
            Ok(())
        }
        "show" => {
            let id = required(args.get(1), "credential id")?;
            let reveal = args.iter().any(|a| a == "--reveal");
            let password = read_secret(MASTER_PASSWORD_VAR, "Master password")?;
            let credential = vault.get_credential(id, &password).await?;

            print_summary(&credential.summary);
            match credential.secret {
                Some(ref secret) if reveal => println!("  secret: {}", secret.as_str()),
                Some(_) => println!("  secret: (stored, use --reveal)"),
                None => println!("  secret: (none)"),
            }
            Ok(())
        }
        "rm" => {
            let id = required(args.get(1), "credential id")?;
            let password = read_secret(MASTER_PASSWORD_VAR, "Master password")?;
            if vault.delete_credential(id, &password).await? {
                println!("Deleted {}", id);
            } else {
                println!("No credential {}", id);
            }
            Ok(())
        }
        other => Err(Error::Usage(format!("Unknown vault command: {}", other))),
    }
}

fn print_summary(summary: &sshdeck::vault::CredentialSummary) {
    let tags: Vec<&str> = summary.tags.iter().map(String::as_str).collect();
    println!(
        "{}  {:<24} {}{}",
        summary.id,
        summary.display(),
        summary.connection_string(),
        if tags.is_empty() {
            String::new()
        } else {
            format!("  [{}]", tags.join(", "))
        }
    );
}

// ============================================================================
// Remote commands
// ============================================================================

/// Loads a stored credential and marks it as used.
async fn resolve_endpoint(config: &Config, id: &str) -> Result<Endpoint> {
    let vault = Vault::open(&config.vault_path, config.kdf)?;
    let password = read_secret(MASTER_PASSWORD_VAR, "Master password")?;
    let credential = vault.get_credential(id, &password).await?;
    vault.touch_credential(id, &password).await?;
    Ok(credential.endpoint())
}

async fn diag_command(config: &Config, args: &[String]) -> Result<()> {
    let id = required(args.first(), "credential id")?;
    let json = args.iter().any(|a| a == "--json");
    let endpoint = resolve_endpoint(config, id).await?;

    let transport = Arc::new(SshTransport::new(config.connect_timeout()));
    let (registry, _events) = SessionRegistry::new(transport.clone());
    let collector =
        DiagnosticCollector::new(transport, registry).with_timeout(config.probe_timeout());

    let report = collector.collect_for_endpoint(&endpoint).await;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Diagnostics for {}", endpoint.display_string());
        for name in collector.probe_names() {
            if let Some(outcome) = report.get(name) {
                println!("  {:<8} {}", name, outcome);
            }
        }
    }
    Ok(())
}

async fn ls_command(config: &Config, args: &[String]) -> Result<()> {
    let id = required(args.first(), "credential id")?;
    let path = args.get(1).map(String::as_str);
    let endpoint = resolve_endpoint(config, id).await?;

    let transport = Arc::new(SshTransport::new(config.connect_timeout()));
    let manager = FilesystemManager::new(transport)
        .with_default_path(config.default_remote_path.clone())
        .with_download_dir(config.download_dir.clone());

    let result = manager.open_channel(&endpoint, path).await;
    manager.close_all().await;
    let listing = result?;

    println!("{}:", listing.path);
    for entry in &listing.entries {
        println!(
            "{} {:>12} {}{}",
            entry.mode_string(),
            entry.size,
            entry.name,
            if entry.is_directory() { "/" } else { "" }
        );
    }
    Ok(())
}

async fn shell_command(config: &Config, args: &[String]) -> Result<()> {
    let id = required(args.first(), "credential id")?;
    let endpoint = resolve_endpoint(config, id).await?;

    let transport = Arc::new(SshTransport::new(config.connect_timeout()));
    let (registry, mut events) = SessionRegistry::new(transport);
    let session = registry.create_session(&endpoint).await?;

    let input = registry.clone();
    tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = [0u8; 1024];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) | Err(_) => {
                    input.close_session(session).await;
                    break;
                }
                Ok(n) => {
                    if !input.send_input(session, &buf[..n]).await {
                        break;
                    }
                }
            }
        }
    });

    let mut stdout = tokio::io::stdout();
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Data { bytes, .. } => {
                stdout.write_all(&bytes).await?;
                stdout.flush().await?;
            }
            SessionEvent::Closed { .. } => break,
        }
    }
    Ok(())
}

// ============================================================================
// Input helpers
// ============================================================================

fn required<'a>(value: Option<&'a String>, what: &str) -> Result<&'a str> {
    value
        .map(String::as_str)
        .ok_or_else(|| Error::Usage(format!("Missing {}\n\n{}", what, USAGE)))
}

/// Reads a secret from `var`, or one line of stdin.
fn read_secret(var: &str, prompt: &str) -> Result<Zeroizing<String>> {
    if let Ok(value) = env::var(var) {
        if !value.is_empty() {
            return Ok(Zeroizing::new(value));
        }
    }

    eprint!("{}: ", prompt);
    io::stderr().flush()?;

    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    let value = Zeroizing::new(line.trim_end_matches(['\r', '\n']).to_string());
    line.zeroize();
    Ok(value)
}
