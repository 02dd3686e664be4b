// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast::{self, error::RecvError};

use nativedl::config::{get_config_dir, load_config, save_config, DownloaderConfig};
use nativedl::download::{
    DownloadError, DownloadManager, DownloadState, DownloadTask, JsonFileStore, QueueLock,
    TaskDescriptor, TaskEvent, TaskStatus, TaskStore, TaskView,
};
use nativedl::error::{explain, format_simple_error};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit codes following sysexits.h conventions
mod exit_codes {
    /// Success - operation completed successfully
    pub const SUCCESS: i32 = 0;
    /// General error - unspecified error
    pub const ERROR: i32 = 1;
    /// Data error - unknown id, duplicate id or malformed descriptor
    pub const DATA_ERR: i32 = 65;
    /// Internal software error - transport could not be set up
    pub const SOFTWARE: i32 = 70;
    /// I/O error - registry or filesystem operation failed
    pub const IO_ERR: i32 = 74;
    /// Temporary failure - not enough free space right now
    pub const TEMP_FAIL: i32 = 75;
}

use exit_codes::*;

#[derive(Parser)]
#[command(name = "nativedl")]
#[command(version = VERSION)]
#[command(about = "Single-flight download queue. One file at a time, in order, across restarts.")]
#[command(long_about = "nativedl - single-flight download queue\n\n\
    Register a download:  nativedl add ep-1 https://example.com/ep1.mp3 --size 48000000 --dir ~/Podcasts\n\
    Run the queue:        nativedl start\n\
    See what is pending:  nativedl list\n\
    Drop a download:      nativedl cancel ep-1")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose logging (-v for info, -vv for debug)
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a new download (it starts waiting)
    ///
    /// Example:
    ///   nativedl add ep-1 https://example.com/ep1.mp3 --size 48000000 --dir ~/Podcasts
    Add {
        /// Unique task id
        id: String,
        /// Source URL
        url: String,
        /// Declared size in bytes, checked against free space before starting
        #[arg(short, long)]
        size: u64,
        /// Destination directory (a file:// prefix is accepted)
        #[arg(short, long)]
        dir: String,
        /// File name (defaults to the last URL path segment)
        #[arg(short, long)]
        name: Option<String>,
        /// Name shown in completion messages
        #[arg(long)]
        display_name: Option<String>,
        /// Request header as "Name: value" (repeatable)
        #[arg(short = 'H', long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,
    },

    /// List registered downloads in queue order
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show one registered download
    Get {
        id: String,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Run the queue in the foreground until nothing is left to do
    ///
    /// With ids, those tasks are requested in the given order. Without ids,
    /// the earliest pending task is promoted. Ctrl+C stops cleanly; the active
    /// download goes back to waiting.
    Start {
        ids: Vec<String>,
    },

    /// Cancel downloads and drop them from the queue
    Cancel {
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Same as cancel
    Stop {
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Delete partial files left behind by interrupted downloads
    Clean,

    /// Configuration management
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Set a configuration value
    ///
    /// Example:
    ///   nativedl config set download_root ~/Downloads
    Set { key: String, value: String },
}

fn parse_header(raw: &str) -> std::result::Result<(String, String), String> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected \"Name: value\", got '{}'", raw))?;
    let name = name.trim();
    if name.is_empty() {
        return Err("header name must not be empty".to_string());
    }
    Ok((name.to_string(), value.trim().to_string()))
}

fn file_name_from_url(url: &str) -> Result<String> {
    let parsed = url::Url::parse(url).with_context(|| format!("Invalid URL: {}", url))?;
    match parsed.path_segments().and_then(|s| s.last()).filter(|s| !s.is_empty()) {
        Some(name) => Ok(name.to_string()),
        None => bail!("Cannot derive a file name from {}; pass --name", url),
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        _ => tracing::Level::DEBUG,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn colored_status(status: TaskStatus) -> colored::ColoredString {
    let text = status.as_str();
    match status {
        TaskStatus::Waiting => text.dimmed(),
        TaskStatus::Queued => text.yellow(),
        TaskStatus::Downloading => text.cyan().bold(),
        TaskStatus::Paused => text.magenta(),
        TaskStatus::Completed => text.green(),
        TaskStatus::Failed => text.red().bold(),
        TaskStatus::Cancelled => text.red(),
    }
}

fn print_view(view: &TaskView) {
    println!("{}", view.id.bold());
    println!("  status:   {}", colored_status(view.status));
    println!("  progress: {}%", view.percent());
    println!("  file:     {}", view.absolute_path.display());
}

fn print_table(views: &[TaskView]) {
    if views.is_empty() {
        println!("{}", "No downloads registered.".dimmed());
        return;
    }
    let width = views.iter().map(|v| v.id.len()).max().unwrap_or(2).max(2);
    println!("{:<width$}  {:<11}  {:>4}  {}", "ID".bold(), "STATUS".bold(), "PCT".bold(), "PATH".bold());
    for view in views {
        println!(
            "{:<width$}  {:<11}  {:>3}%  {}",
            view.id,
            colored_status(view.status),
            view.percent(),
            view.absolute_path.display()
        );
    }
}

fn progress_bar(id: &str) -> ProgressBar {
    let pb = ProgressBar::new(100);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{bar:40.cyan/blue}] {pos:>3}% | {msg}")
        .map(|s| s.progress_chars("█▓░"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb.set_message(id.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Nothing downloading, paused or queued.
fn is_idle(manager: &DownloadManager) -> bool {
    let (_, queued, downloading, paused) = manager.stats();
    queued + downloading + paused == 0
}

/// Terminal rendering of queue events.
#[derive(Default)]
struct Renderer {
    bar: Option<(String, ProgressBar)>,
    completed: usize,
    failed: usize,
}

impl Renderer {
    fn take_bar(&mut self, id: &str) -> Option<ProgressBar> {
        if self.bar.as_ref().is_some_and(|(current, _)| current == id) {
            self.bar.take().map(|(_, pb)| pb)
        } else {
            None
        }
    }

    fn render(&mut self, event: TaskEvent) {
        match event {
            TaskEvent::ChangeStatus { id, status: TaskStatus::Downloading } => {
                // A resumed task keeps its bar.
                if self.bar.as_ref().is_some_and(|(current, _)| current == &id) {
                    return;
                }
                if let Some((_, old)) = self.bar.take() {
                    old.finish_and_clear();
                }
                self.bar = Some((id.clone(), progress_bar(&id)));
            }
            TaskEvent::ChangeStatus { id, status: TaskStatus::Cancelled } => {
                if let Some(pb) = self.take_bar(&id) {
                    pb.abandon_with_message("cancelled");
                }
            }
            TaskEvent::Progress { id, progress } => {
                if let Some((current, pb)) = &self.bar {
                    if current == &id {
                        pb.set_position((progress * 100.0).round() as u64);
                    }
                }
            }
            TaskEvent::Complete { id, display_name, file_url, .. } => {
                if let Some(pb) = self.take_bar(&id) {
                    pb.finish_and_clear();
                }
                self.completed += 1;
                println!("{} {} {}", "[✓]".green(), display_name, file_url.dimmed());
            }
            TaskEvent::Failed { id, message, .. } => {
                if let Some(pb) = self.take_bar(&id) {
                    pb.abandon();
                }
                self.failed += 1;
                eprintln!("{} {}: {}", "[✗]".red(), id, message);
            }
            TaskEvent::ChangeStatus { .. } => {}
        }
    }

    fn interrupt(&mut self) {
        if let Some((_, pb)) = self.bar.take() {
            pb.abandon_with_message("interrupted");
        }
    }

    fn summary(&self) {
        let summary = format!("{} completed, {} failed", self.completed, self.failed);
        if self.failed == 0 {
            println!("{} {}", "[OK]".green(), summary);
        } else {
            println!("{} {}", "[!]".yellow(), summary);
        }
    }
}

/// Render events until the queue is idle or the user interrupts.
async fn run_foreground(manager: &DownloadManager, mut rx: broadcast::Receiver<TaskEvent>) -> Result<()> {
    let mut renderer = Renderer::default();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    while !is_idle(manager) {
        let event = tokio::select! {
            event = rx.recv() => event,
            _ = &mut ctrl_c => {
                renderer.interrupt();
                manager.shutdown();
                println!("{} Stopped. The active download will restart from the beginning next time.", "[!]".yellow());
                return Ok(());
            }
        };

        match event {
            Ok(event) => renderer.render(event),
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        }
    }

    // The queue goes idle before its last events are read.
    while let Ok(event) = rx.try_recv() {
        renderer.render(event);
    }

    manager.shutdown();
    renderer.summary();
    Ok(())
}

/// Read the saved registry without opening a queue.
///
/// Opening would need the queue lock, and `list`/`get` must keep working
/// while `nativedl start` runs.
fn read_registry(config: &DownloaderConfig) -> Result<DownloadState> {
    JsonFileStore::in_dir(config.state_dir()?).load()
}

fn clean_partials(config: &DownloaderConfig) -> Result<()> {
    let state_dir = config.state_dir()?;
    // A running queue owns its part files; refuse rather than delete them.
    let _owner = QueueLock::acquire(&state_dir).map_err(DownloadError::Store)?;
    let store = JsonFileStore::in_dir(&state_dir);
    let mut state = store.load()?;
    let removed = state.remove_partial_files();
    store.save(&state)?;
    println!("{} Removed {} partial file(s)", "[OK]".green(), removed);
    Ok(())
}

fn handle_config(command: Option<ConfigCommands>) -> Result<()> {
    match command.unwrap_or(ConfigCommands::Show) {
        ConfigCommands::Show => {
            let config = load_config()?;
            println!("{}", "nativedl configuration".bold());
            println!("  config dir: {}", get_config_dir()?.display());
            println!("  state dir:  {}", config.state_dir()?.display());
            println!();
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        ConfigCommands::Set { key, value } => {
            let mut config = load_config()?;
            config.set(&key, &value)?;
            save_config(&config)?;
            println!("{} {} = {}", "[OK]".green(), key, value);
        }
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config()?;

    match cli.command {
        Commands::Config { command } => handle_config(command),
        Commands::Clean => clean_partials(&config),
        Commands::Add { id, url, size, dir, name, display_name, headers } => {
            let file_name = match name {
                Some(name) => name,
                None => file_name_from_url(&url)?,
            };
            let mut descriptor = TaskDescriptor::new(id, url, size, dir, file_name);
            for (header, value) in headers {
                descriptor = descriptor.header(header, value);
            }
            if let Some(display_name) = display_name {
                descriptor = descriptor.display_name(display_name);
            }

            let manager = DownloadManager::new(&config)?;
            let view = manager.add(descriptor)?;
            println!("{} Added {} -> {}", "[OK]".green(), view.id.bold(), view.absolute_path.display());
            Ok(())
        }
        Commands::List { json } => {
            let views: Vec<TaskView> = read_registry(&config)?
                .ordered_tasks()
                .into_iter()
                .map(DownloadTask::view)
                .collect();
            if json {
                println!("{}", serde_json::to_string_pretty(&views)?);
            } else {
                print_table(&views);
            }
            Ok(())
        }
        Commands::Get { id, json } => {
            let view = read_registry(&config)?
                .get_task(&id)
                .map(DownloadTask::view)
                .ok_or(DownloadError::NotFound(id))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&view)?);
            } else {
                print_view(&view);
            }
            Ok(())
        }
        Commands::Cancel { ids } | Commands::Stop { ids } => {
            let manager = DownloadManager::new(&config)?;
            for id in ids {
                manager.cancel(&id)?;
                println!("{} Cancelled {}", "[OK]".green(), id);
            }
            Ok(())
        }
        Commands::Start { ids } => {
            let manager = DownloadManager::new(&config)?;
            let rx = manager.subscribe();
            if ids.is_empty() {
                manager.queue().advance();
            }
            for id in &ids {
                match manager.start(id) {
                    Ok(view) => tracing::info!(task = %id, status = %view.status, "start requested"),
                    // Rejected at admission; reported, the rest still run.
                    Err(err @ DownloadError::InsufficientSpace { .. }) => eprintln!("{}", explain(&err)),
                    Err(err) => return Err(err.into()),
                }
            }
            if is_idle(&manager) {
                println!("{}", "Nothing to download.".dimmed());
                return Ok(());
            }
            run_foreground(&manager, rx).await
        }
    }
}

fn report(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<DownloadError>() {
        Some(download) => {
            eprintln!("{}", explain(download));
            match download {
                DownloadError::DuplicateId(_)
                | DownloadError::NotFound(_)
                | DownloadError::InvalidDescriptor(_) => DATA_ERR,
                DownloadError::InsufficientSpace { .. } => TEMP_FAIL,
                DownloadError::TransportFailure(_) => SOFTWARE,
                DownloadError::Store(_) => IO_ERR,
            }
        }
        None => {
            eprintln!("{}", format_simple_error(&format!("{:#}", err)));
            ERROR
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let code = match run(cli).await {
        Ok(()) => SUCCESS,
        Err(err) => report(&err),
    };
    std::process::exit(code);
}
