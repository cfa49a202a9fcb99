//! MCP Aggregator - one endpoint multiplexing many MCP servers

use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use magg::auth::{self, Authenticator};
use magg::cli::{AuthCommands, Cli, Commands};
use magg::config::{ConfigStore, ServerConfig};
use magg::server::{Aggregator, RunOutcome};
use magg::settings::Settings;
use magg::{setup_tracing, Result};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let settings = match Settings::load() {
        Ok(mut settings) => {
            if cli.config_dir.is_some() {
                settings.config_dir = cli.config_dir.clone();
            }
            settings
        }
        Err(e) => {
            error!("Invalid settings: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(cli, settings).await {
        Ok(RunOutcome::Completed) => ExitCode::SUCCESS,
        Ok(RunOutcome::Interrupted) => ExitCode::from(130),
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, settings: Settings) -> Result<RunOutcome> {
    match cli.command {
        Commands::Serve {
            http,
            stdio,
            hybrid,
            port,
            host,
        } => {
            let mode = Commands::serve_mode(http, stdio, hybrid);
            let aggregator = Aggregator::new(settings).await?;
            aggregator.run(mode, &host, port).await
        }
        Commands::Auth { command } => {
            auth_command(command, &settings)?;
            Ok(RunOutcome::Completed)
        }
        Commands::Status => {
            let store = open_store(&settings);
            let catalog = store.load().await?;
            let enabled = catalog.servers.values().filter(|s| s.enabled).count();
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "config_path": store.path().display().to_string(),
                    "read_only": store.is_read_only(),
                    "servers": catalog.servers.len(),
                    "enabled": enabled,
                    "auth": Authenticator::from_settings(&settings)?.is_some(),
                }))?
            );
            Ok(RunOutcome::Completed)
        }
        Commands::ListServers => {
            let store = open_store(&settings);
            let catalog = store.load().await?;
            for (name, server) in &catalog.servers {
                let transport = server.command.as_deref().or(server.uri.as_deref());
                println!(
                    "{name}\tprefix={}\tenabled={}\t{}",
                    server.effective_prefix(name),
                    server.enabled,
                    transport.unwrap_or("-"),
                );
            }
            Ok(RunOutcome::Completed)
        }
        Commands::AddServer {
            name,
            command,
            uri,
            prefix,
            notes,
            disabled,
        } => {
            let store = open_store(&settings);
            store.load().await?;

            let config = ServerConfig {
                command,
                uri,
                prefix,
                notes,
                enabled: !disabled,
                ..ServerConfig::default()
            };
            config.validate(&name, &settings.prefix_sep)?;

            store
                .mutate(|catalog| {
                    if catalog.servers.contains_key(&name) {
                        return Err(magg::Error::Validation(format!(
                            "server {name:?} already exists"
                        )));
                    }
                    catalog.servers.insert(name.clone(), config.clone());
                    Ok(())
                })
                .await?;
            println!("added {name}");
            Ok(RunOutcome::Completed)
        }
        Commands::RemoveServer { name } => {
            let store = open_store(&settings);
            store.load().await?;
            store
                .mutate(|catalog| {
                    if catalog.servers.shift_remove(&name).is_none() {
                        return Err(magg::Error::NotFound(format!("server {name:?}")));
                    }
                    Ok(())
                })
                .await?;
            println!("removed {name}");
            Ok(RunOutcome::Completed)
        }
    }
}

fn auth_command(command: AuthCommands, settings: &Settings) -> Result<()> {
    match command {
        AuthCommands::Init => {
            let path = settings.private_key_path();
            if path.exists() {
                return Err(magg::Error::Validation(format!(
                    "{} already exists",
                    path.display()
                )));
            }
            auth::generate_keypair(&path)?;
            println!("wrote {}", path.display());
            Ok(())
        }
        AuthCommands::Token { sub, ttl, scopes } => {
            let auth = require_auth(settings)?;
            let scopes = if scopes.is_empty() { None } else { Some(scopes) };
            println!("{}", auth.issue(&sub, ttl, scopes)?);
            Ok(())
        }
        AuthCommands::Status => {
            match Authenticator::from_settings(settings)? {
                Some(_) => println!("auth: enabled ({})", settings.private_key_path().display()),
                None => println!("auth: disabled (no private key)"),
            }
            Ok(())
        }
        AuthCommands::PublicKey => {
            let auth = require_auth(settings)?;
            print!("{}", auth.public_key_pem());
            Ok(())
        }
        AuthCommands::PrivateKey => {
            println!("{}", settings.private_key_path().display());
            Ok(())
        }
    }
}

fn require_auth(settings: &Settings) -> Result<Authenticator> {
    Authenticator::from_settings(settings)?.ok_or_else(|| {
        magg::Error::Auth(format!(
            "no private key at {}; run `magg auth init` first",
            settings.private_key_path().display()
        ))
    })
}

fn open_store(settings: &Settings) -> ConfigStore {
    ConfigStore::new(
        settings.config_path(),
        &settings.prefix_sep,
        settings.read_only,
    )
}
