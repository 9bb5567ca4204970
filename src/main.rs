use clap::{Parser, Subcommand};
use log::{error, info};
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use notesync::config::{Config, config_path};
use notesync::engine::{SyncEngine, SyncResult, SyncSettings};
use notesync::error::SyncError;
use notesync::integrations::todoist::TodoistClient;
use notesync::logging::init_logging;
use notesync::storage::{self, VaultStore};
use notesync::sync_state::StateStore;

type Engine = SyncEngine<TodoistClient, VaultStore>;

#[derive(Debug, Parser)]
#[command(
    name = "notesync",
    version,
    about = "Sync tagged markdown checklist items with Todoist"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a reconciliation pass
    Sync {
        /// Keep running, one pass every `sync_interval_minutes`
        #[arg(long)]
        watch: bool,
    },
    /// Create a Todoist task from one line of a note
    CreateLine {
        /// Note path relative to the vault
        file: String,
        /// 1-based line number
        line: usize,
    },
    /// Check the configured API token
    Verify,
    /// List Todoist projects
    Projects,
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigCommands {
    Show,
    Set { key: String, value: String },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let mut config = Config::load();

    if let Err(err) = init_logging(
        &config.logging.level,
        &config.logging.log_dir,
        config.logging.to_stderr,
    ) {
        eprintln!("notesync: logging disabled: {err}");
    }

    match run(cli.command, &mut config) {
        Ok(code) => code,
        Err(err) => {
            error!("event=command module=main status=error error={err}");
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: Commands, config: &mut Config) -> Result<ExitCode, SyncError> {
    match command {
        Commands::Sync { watch } => sync(config, watch),
        Commands::CreateLine { file, line } => create_line(config, &file, line),
        Commands::Verify => {
            if build_engine(config)?.verify_credential()? {
                println!("Todoist token is valid");
                Ok(ExitCode::SUCCESS)
            } else {
                println!("Todoist rejected the token");
                Ok(ExitCode::FAILURE)
            }
        }
        Commands::Projects => {
            for project in build_engine(config)?.list_projects()? {
                let inbox = if project.is_inbox { " (inbox)" } else { "" };
                println!("{}\t{}{inbox}", project.id, project.name);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Config { command } => match command {
            ConfigCommands::Show => {
                let mut shown = config.clone();
                if !shown.todoist.api_token.is_empty() {
                    shown.todoist.api_token = "********".to_string();
                }
                let text = toml::to_string_pretty(&shown)
                    .map_err(|e| SyncError::Config(format!("Failed to render config: {e}")))?;
                println!("# {}", config_path().display());
                print!("{text}");
                Ok(ExitCode::SUCCESS)
            }
            ConfigCommands::Set { key, value } => {
                config.set(&key, &value)?;
                config.save_to_path(&config_path())?;
                info!("event=config_set module=main status=ok key={key}");
                println!("Set {key}");
                Ok(ExitCode::SUCCESS)
            }
        },
    }
}

fn build_engine(config: &Config) -> Result<Engine, SyncError> {
    let token = config.todoist.resolved_token();
    let gateway = if token.is_empty() {
        None
    } else {
        Some(TodoistClient::new(&token, &config.todoist.base_url)?)
    };
    SyncEngine::new(
        gateway,
        VaultStore::new(&config.vault.path),
        SyncSettings::from_config(&config.todoist),
    )
}

fn sync(config: &Config, watch: bool) -> Result<ExitCode, SyncError> {
    let engine = build_engine(config)?;
    let state_store = StateStore::new(config.state_path());
    let interval = config.todoist.sync_interval_minutes;
    if watch && interval == 0 {
        println!("sync_interval_minutes is 0; running a single pass");
    }

    loop {
        let mut state = state_store.load()?;
        let result = engine.perform_sync(&mut state);
        state_store.save(&state)?;
        print_result(&result);

        if !watch || interval == 0 {
            return Ok(if result.errors.is_empty() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            });
        }
        thread::sleep(Duration::from_secs(interval * 60));
    }
}

fn print_result(result: &SyncResult) {
    println!("{}", result.summary());
    for message in &result.errors {
        println!("  error: {message}");
    }
    for conflict in &result.pending_conflicts {
        println!(
            "  conflict {} at {}:{}",
            conflict.remote_id,
            conflict.file_path,
            conflict.line_index + 1
        );
        println!(
            "    local:  [{}] {}",
            if conflict.local_completed { "x" } else { " " },
            conflict.local_text
        );
        println!(
            "    remote: [{}] {}",
            if conflict.remote_completed { "x" } else { " " },
            conflict.remote_text
        );
    }
}

fn create_line(config: &Config, file: &str, line: usize) -> Result<ExitCode, SyncError> {
    let engine = build_engine(config)?;
    let line_index = line
        .checked_sub(1)
        .ok_or_else(|| SyncError::Config("Line numbers start at 1".to_string()))?;
    let raw_line = storage::read_line(engine.store(), file, line_index)?.ok_or_else(|| {
        SyncError::Config(format!("{file} has no line {line}"))
    })?;

    let state_store = StateStore::new(config.state_path());
    let mut state = state_store.load()?;
    let outcome = engine.create_from_line(&mut state, file, line_index, &raw_line);
    if outcome.success {
        state_store.save(&state)?;
        println!("{}", outcome.message);
        Ok(ExitCode::SUCCESS)
    } else {
        println!("{}", outcome.message);
        Ok(ExitCode::FAILURE)
    }
}
