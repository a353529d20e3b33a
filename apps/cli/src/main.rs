mod console;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use console::ConsoleEventBus;
use futures::StreamExt;
use ndis_application::{
    AppConfig, AssistantServices, ChatError, ProfileUpdate, Redirect, SubmissionOutcome,
};
use ndis_conversation::ConversationId;
use ndis_engine::EngineRegistry;
use ndis_models::ModelState;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ndis-assist", version, about = "NDIS parent assistant")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List known models and their local state
    Models,
    /// Download a model artifact
    Download {
        /// Model id as shown by `models`
        id: String,
    },
    /// Register a model from a direct download link
    AddModel {
        url: String,
    },
    /// Delete a downloaded model artifact
    DeleteModel {
        id: String,
    },
    /// Show the stored child profile, or edit it with `profile set`
    Profile {
        #[command(subcommand)]
        action: Option<ProfileAction>,
    },
    /// List saved conversations
    Conversations,
    /// Load a model, answer one message, then unload. Ctrl-C stops the answer.
    Chat {
        /// Downloaded model to load
        #[arg(long)]
        model: String,
        /// Continue this conversation instead of starting a new one
        #[arg(long)]
        conversation: Option<u64>,
        text: String,
    },
    /// Interactive chat. Lines starting with `/` are commands (`/help`).
    Session {
        /// Model to load before the first prompt
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        conversation: Option<u64>,
    },
}

#[derive(Subcommand)]
enum ProfileAction {
    /// Update profile fields; omitted fields keep their value
    Set(ProfileArgs),
}

#[derive(Args)]
struct ProfileArgs {
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    age: Option<u32>,
    #[arg(long)]
    gender: Option<String>,
    #[arg(long)]
    background: Option<String>,
    #[arg(long)]
    assessment: Option<String>,
    #[arg(long)]
    plan: Option<String>,
    #[arg(long)]
    other: Option<String>,
}

impl From<ProfileArgs> for ProfileUpdate {
    fn from(args: ProfileArgs) -> Self {
        Self {
            name: args.name,
            age: args.age,
            gender: args.gender,
            general_background: args.background,
            functional_assessment: args.assessment,
            ndis_plan: args.plan,
            other_information: args.other,
        }
    }
}

const SESSION_HELP: &str = "\
/load <model>   load a downloaded model
/unload         unload the current model
/new            start a new conversation
/help           show this help
/quit           leave the session";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,ndis=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env();
    let needs_engine = matches!(cli.command, Command::Chat { .. } | Command::Session { .. });
    let registry = engine_registry(needs_engine)?;
    if needs_engine && registry.is_empty() {
        bail!("no inference engine is compiled into this build; rebuild with `--features llama`");
    }
    let services = AssistantServices::open(config, Arc::new(ConsoleEventBus::new()), registry)
        .context("failed to open assistant data")?;

    match cli.command {
        Command::Models => list_models(&services),
        Command::Download { id } => download(&services, &id).await?,
        Command::AddModel { url } => {
            let model = services.add_custom_model(&url)?;
            println!("Added {} ({})", model.id, model.source.download_url());
        }
        Command::DeleteModel { id } => {
            services.catalog.delete_model(&id)?;
            println!("Deleted {id}");
        }
        Command::Profile { action: None } => show_profile(&services),
        Command::Profile {
            action: Some(ProfileAction::Set(args)),
        } => {
            services.profile.update(args.into())?;
            show_profile(&services);
        }
        Command::Conversations => list_conversations(&services),
        Command::Chat {
            model,
            conversation,
            text,
        } => {
            load(&services, &model).await?;
            let result = submit(&services, conversation.map(ConversationId), &text).await;
            services.engine.unload_model().await?;
            result?;
        }
        Command::Session {
            model,
            conversation,
        } => session(&services, model, conversation.map(ConversationId)).await?,
    }

    Ok(())
}

#[cfg(feature = "llama")]
fn engine_registry(needs_engine: bool) -> anyhow::Result<EngineRegistry> {
    let mut registry = EngineRegistry::new();
    if needs_engine {
        registry.register(Arc::new(ndis_engine::llama::LlamaLoader::new()?));
    }
    Ok(registry)
}

#[cfg(not(feature = "llama"))]
fn engine_registry(_needs_engine: bool) -> anyhow::Result<EngineRegistry> {
    Ok(EngineRegistry::new())
}

fn list_models(services: &AssistantServices) {
    for model in services.catalog.list_models() {
        let state = match model.state() {
            ModelState::Downloading => {
                format!("{} {:.0}%", model.state(), model.download_percent() * 100.0)
            }
            other => other.to_string(),
        };
        let origin = if model.custom { " [custom]" } else { "" };
        println!("{:<28} {:<16} {}{}", model.id, state, model.display_name, origin);
    }
}

async fn download(services: &AssistantServices, id: &str) -> anyhow::Result<()> {
    let mut handle = services.downloader.start_download(id)?;
    let mut stdout = std::io::stdout();
    while let Some(percent) = handle.progress.next().await {
        print!("\r{id}: {:>5.1}%", percent * 100.0);
        stdout.flush()?;
    }
    println!();

    let path = handle.wait().await?;
    println!("Saved to {}", path.display());
    Ok(())
}

async fn load(services: &AssistantServices, id: &str) -> anyhow::Result<()> {
    eprintln!("Loading {id}...");
    services
        .engine
        .load_model(id)
        .await
        .with_context(|| format!("failed to load {id}"))
}

/// Submit one message, streaming the reply. Ctrl-C stops generation and
/// keeps whatever was produced.
async fn submit(
    services: &AssistantServices,
    conversation: Option<ConversationId>,
    text: &str,
) -> anyhow::Result<ConversationId> {
    let profile = services.profile.profile();
    let submission = services.chat.submit(conversation, text, &profile);
    tokio::pin!(submission);

    let result = tokio::select! {
        result = &mut submission => result,
        _ = tokio::signal::ctrl_c() => {
            if services.chat.stop() {
                tracing::info!("Stopping generation");
            }
            submission.await
        }
    };

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(ChatError::Validation(e)) => {
            let hint = match e.redirect() {
                Some(Redirect::Profile) => " (fill it in with `profile set`)",
                Some(Redirect::Model) => " (download one with `download`, then load it)",
                None => "",
            };
            bail!("{e}{hint}");
        }
        Err(e) => return Err(e.into()),
    };

    match &outcome {
        SubmissionOutcome::Completed { .. } => {}
        SubmissionOutcome::Cancelled { .. } => eprintln!("[stopped]"),
        SubmissionOutcome::Failed { error, .. } => eprintln!("[failed] {error}"),
    }
    Ok(outcome.conversation_id())
}

async fn session(
    services: &AssistantServices,
    model: Option<String>,
    mut conversation: Option<ConversationId>,
) -> anyhow::Result<()> {
    if let Some(id) = model {
        load(services, &id).await?;
    }
    println!("{SESSION_HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();

        match line.split_once(' ').unwrap_or((line, "")) {
            ("", _) => {}
            ("/quit", _) => break,
            ("/help", _) => println!("{SESSION_HELP}"),
            ("/new", _) => conversation = None,
            ("/load", id) if !id.trim().is_empty() => {
                if let Err(e) = load(services, id.trim()).await {
                    eprintln!("{e:#}");
                }
            }
            ("/unload", _) => match services.engine.unload_model().await {
                Ok(()) => eprintln!("Unloaded"),
                Err(e) => eprintln!("{e}"),
            },
            (command, _) if command.starts_with('/') => eprintln!("Unknown command, try /help"),
            _ => match submit(services, conversation, line).await {
                Ok(id) => conversation = Some(id),
                Err(e) => eprintln!("{e:#}"),
            },
        }
    }

    if services.engine.loaded_model().is_some() {
        services.engine.unload_model().await?;
    }
    Ok(())
}

fn show_profile(services: &AssistantServices) {
    let profile = services.profile.profile();
    let missing = profile.missing_fields();
    if missing.is_empty() {
        println!("Profile complete for {} (age {})", profile.name, profile.age);
    } else {
        println!("Profile incomplete, missing: {}", missing.join(", "));
    }
}

fn list_conversations(services: &AssistantServices) {
    let conversations = services.conversations.list_conversations();
    if conversations.is_empty() {
        println!("No conversations yet");
        return;
    }
    for conversation in conversations {
        println!(
            "#{:<4} {:>3} messages  {}",
            conversation.id().0,
            conversation.messages().len(),
            conversation.title().unwrap_or("(untitled)")
        );
    }
}
