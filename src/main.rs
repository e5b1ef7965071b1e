use anyhow::{Context, Result};
use clap::Parser;
use std::process::ExitCode;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use genrouter::app::{AppConfig, AppState};
use genrouter::generation::{
    GenerationCategory, GenerationInput, GenerationOutcome, GenerationRequest,
};
use genrouter::models::Message;
use genrouter::platform::AppPaths;
use genrouter::routing::ErrorClassifier;
use genrouter::storage::{BalanceStore, QuotaStore, TierInfo};

mod cli;

use cli::{Cli, Commands, ConfigAction};

fn init_logging(cli: &Cli, paths: &AppPaths) -> Result<Option<WorkerGuard>> {
    let default_directive = if cli.debug { "genrouter=debug" } else { "genrouter=info" };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))?;

    let (file_layer, guard) = if cli.no_log_file {
        (None, None)
    } else {
        let appender = tracing_appender::rolling::daily(paths.logs_dir(), "genrouter.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let paths = AppPaths::new()?;
    paths.ensure_dirs_exist().context("Failed to create application directories")?;
    let _guard = init_logging(&cli, &paths)?;

    info!("Starting genrouter {}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load(&paths, cli.config.as_deref())
        .context("Failed to load configuration")?;

    match cli.command {
        Commands::Resolve { model } => {
            let route = config.to_resolver()?.resolve(&model);
            println!("{} -> {}/{}", model, route.provider, route.model);
            if let Some(fallback) = route.fallback_model {
                println!("  same-provider fallback: {}", fallback);
            }
        }

        Commands::Classify { message } => {
            let kind = ErrorClassifier::new()?.classify(&message);
            println!("{}: {}", kind, kind.remediation());
        }

        Commands::Models => {
            let resolver = config.to_resolver()?;
            let pricing = config.to_pricing_table()?;
            for route in resolver.routes() {
                let ready = if config.has_api_key(route.provider) { "" } else { "  (no API key)" };
                println!(
                    "{:<20} {:<10} {:<28} {:>5} tokens{}",
                    route.id,
                    route.provider,
                    route.model,
                    pricing.cost_for(&route.id),
                    ready
                );
            }
            let default = resolver.default_target();
            println!(
                "unlisted ids -> {}/{} ({} tokens)",
                default.provider,
                default.model,
                pricing.default_cost()
            );
        }

        Commands::Config { action } => match action {
            ConfigAction::Init { force } => {
                let path = cli.config.clone().unwrap_or_else(|| paths.config_file());
                if path.exists() && !force {
                    anyhow::bail!("{} already exists; pass --force to overwrite", path.display());
                }
                AppConfig::default().save(&path).await?;
                println!("Wrote default configuration to {}", path.display());
            }
            ConfigAction::Show => print!("{}", config.redacted().to_toml()?),
        },

        Commands::Generate { user, category, model, system, json, prompt } => {
            let state = AppState::new(config, paths, cli.ephemeral)
                .await
                .context("Failed to initialize")?;

            let input = match system {
                Some(system) => GenerationInput::Conversation(vec![
                    Message::system(system),
                    Message::user(prompt),
                ]),
                None => GenerationInput::Prompt(prompt),
            };
            let request = GenerationRequest::new(user, category, model, input);
            let outcome = state.service().generate(&request).await;

            if json {
                println!("{}", serde_json::to_string_pretty(&outcome.view())?);
            } else {
                match &outcome {
                    GenerationOutcome::Success(payload) => println!("{}", payload.content),
                    GenerationOutcome::Failure(failure) => {
                        eprintln!("{}", failure.message);
                        if cli.debug {
                            for attempt in &failure.attempts {
                                eprintln!(
                                    "  {}/{} [{}]: {}",
                                    attempt.provider, attempt.model, attempt.kind, attempt.error
                                );
                            }
                        }
                    }
                }
            }

            if !outcome.is_success() {
                return Ok(ExitCode::FAILURE);
            }
        }

        Commands::Quota { user, category } => {
            let state = AppState::new(config, paths, cli.ephemeral).await?;
            let quota = state.store().quota();
            let categories = match category {
                Some(category) => vec![category],
                None => GenerationCategory::ALL.to_vec(),
            };
            for category in categories {
                let status = quota.check_limit(&user, category, None).await?;
                println!("{:<6} {}", category, status.message);
            }
        }

        Commands::Account { user, tier, free, paid } => {
            let state = AppState::new(config, paths, cli.ephemeral).await?;
            let store = state.store();
            let current = store.balance().get_tier(&user).await?.unwrap_or_default();

            let info = if tier.is_some() || free.is_some() || paid.is_some() {
                store
                    .upsert_account(
                        &user,
                        tier.unwrap_or(current.tier),
                        free.unwrap_or(current.free_tokens),
                        paid.unwrap_or(current.paid_tokens),
                    )
                    .await?
            } else {
                current
            };
            print_account(&user, &info);

            for entry in store.recent_debits(&user, 10).await? {
                println!(
                    "  {}  -{:<6} {} via {} ({} left)",
                    entry.created_at.format("%Y-%m-%d %H:%M"),
                    entry.amount,
                    entry.model_id,
                    entry.provider,
                    entry.balance_after
                );
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn print_account(user: &str, info: &TierInfo) {
    println!(
        "{}: {} tier, {} tokens ({} free, {} paid)",
        user, info.tier, info.token_balance, info.free_tokens, info.paid_tokens
    );
}
