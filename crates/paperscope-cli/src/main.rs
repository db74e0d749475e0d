use std::io::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use paperscope_core::{
    PackageConfig, ProgressReporter, QueryResult, Service, SignalAction, SignalHandler, Workspace,
    FORCE_STOP_WINDOW,
};

/// paperscope: scan PDF collections and search them by text
#[derive(Parser)]
#[command(name = "paperscope", version, about, long_about = None)]
struct Cli {
    /// Package manifest path or directory
    #[arg(short = 'p', long, default_value = ".", global = true)]
    package: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan all sources and update the indexes
    Scan,
    /// Search indexed pages by free text
    Query(QueryArgs),
    /// Delete the entire workspace
    Purge,
    /// Interactive prompt
    Start,
    /// Clear the screen
    Clear,
    /// Bare arguments are treated as a query
    #[command(external_subcommand)]
    Terms(Vec<String>),
}

#[derive(clap::Args)]
struct QueryArgs {
    /// Search terms
    #[arg(required = true)]
    terms: Vec<String>,

    /// Maximum number of page hits
    #[arg(long)]
    limit: Option<usize>,
}

struct App {
    service: Arc<Service>,
    signals: Arc<SignalHandler>,
    repl: Arc<AtomicBool>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("paperscope_core=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let (config, package_dir) =
        PackageConfig::load(&cli.package).context("failed to load package manifest")?;

    if let Commands::Purge = cli.command {
        Workspace::new(&package_dir).purge()?;
        println!("Workspace removed.");
        return Ok(0);
    }
    if let Commands::Clear = cli.command {
        clear_screen();
        return Ok(0);
    }

    let service = Arc::new(Service::from_package(&config, &package_dir)?);
    let signals = Arc::new(SignalHandler::new());
    let app = App {
        service: service.clone(),
        signals: signals.clone(),
        repl: Arc::new(AtomicBool::new(false)),
    };
    spawn_signal_task(service, signals, app.repl.clone());

    match cli.command {
        Commands::Scan => run_scan(&app).await,
        Commands::Query(args) => run_query(&app, &args.terms.join(" "), args.limit).await,
        Commands::Terms(terms) => run_query(&app, &terms.join(" "), None).await,
        Commands::Start => run_repl(&app).await,
        Commands::Purge | Commands::Clear => unreachable!("handled above"),
    }
}

/// Map interrupts onto the escalation ladder. Second interrupt within the
/// window freezes the store and exits non-zero.
fn spawn_signal_task(service: Arc<Service>, signals: Arc<SignalHandler>, repl: Arc<AtomicBool>) {
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            match signals.on_interrupt() {
                SignalAction::InterruptedScan => {
                    eprintln!("\nInterrupting...");
                }
                SignalAction::Warn if repl.load(Ordering::SeqCst) => {
                    eprintln!("\n(press ctrl-c again to exit)");
                }
                SignalAction::Warn => {
                    eprintln!(
                        "\nCannot interrupt this command (press ctrl-c again within {}s to force stop)",
                        FORCE_STOP_WINDOW.as_secs()
                    );
                }
                SignalAction::ForceStop => {
                    eprintln!("\nForce stopping... the database may be left inconsistent");
                    service.freeze_database();
                    let code = if repl.load(Ordering::SeqCst) { 130 } else { 1 };
                    std::process::exit(code);
                }
            }
        }
    });
}

async fn run_scan(app: &App) -> Result<i32> {
    let workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .min(8);

    let job = Arc::new(
        app.service
            .scan_job(workers, Arc::new(CliReporter::default())),
    );
    app.signals.watch(job.clone());
    let result = job.start().await;
    app.signals.stop_watch();

    match result? {
        true => {
            println!("Scan complete.");
            Ok(0)
        }
        false => {
            println!("Scan interrupted.");
            Ok(130)
        }
    }
}

async fn run_query(app: &App, text: &str, limit: Option<usize>) -> Result<i32> {
    if text.trim().is_empty() {
        println!("Text not provided.");
        return Ok(1);
    }
    let result = app.service.query(text, limit).await?;
    show_results(&result);
    Ok(0)
}

async fn run_repl(app: &App) -> Result<i32> {
    app.repl.store(true, Ordering::SeqCst);
    println!("paperscope interactive mode. Type a query, or scan / purge / clear / exit.");

    loop {
        app.signals.reset();
        print!("> ");
        std::io::stdout().flush().ok();

        let line = tokio::task::spawn_blocking(|| {
            let mut buffer = String::new();
            std::io::stdin().read_line(&mut buffer).map(|read| (read, buffer))
        })
        .await
        .context("stdin task failed")??;

        if line.0 == 0 {
            // EOF
            return Ok(0);
        }
        let input = line.1.trim();
        if input.is_empty() {
            continue;
        }

        let mut words = input.split_whitespace();
        let command = words.next().unwrap_or_default().to_lowercase();
        let rest: Vec<&str> = words.collect();

        match command.as_str() {
            "exit" | "quit" => return Ok(0),
            "clear" => clear_screen(),
            "start" => println!("Already in interactive mode."),
            "purge" => {
                app.service.workspace().purge()?;
                println!("Workspace removed.");
            }
            "scan" => {
                let code = run_scan(app).await?;
                if code == 130 {
                    println!("Complete interrupted.");
                }
            }
            "query" => {
                run_query(app, &rest.join(" "), None).await?;
            }
            _ => {
                // Anything else is a query.
                run_query(app, input, None).await?;
            }
        }
    }
}

fn clear_screen() {
    print!("\x1b[2J\x1b[H");
    std::io::stdout().flush().ok();
}

fn show_results(result: &QueryResult) {
    if result.items.is_empty() {
        println!("No results.");
        return;
    }
    println!("Keywords: {}", result.keywords.join(", "));

    for (rank, item) in result.items.iter().enumerate() {
        println!();
        println!("#{}", rank + 1);
        for file in &item.pdf_files {
            println!("  {} (page {})", file.pdf_path.display(), file.page_index + 1);
        }
        for segment in &item.segments {
            if let Some(slice) = item.content.get(segment.start..segment.end) {
                println!("  | {}", excerpt(slice));
            }
        }
        for annotation in &item.annotations {
            println!(
                "  [annotation {}] {}",
                annotation.index,
                excerpt(&annotation.content)
            );
        }
    }
}

/// One display line: newlines collapsed, truncated on a char boundary.
fn excerpt(text: &str) -> String {
    const MAX: usize = 160;
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.len() <= MAX {
        return flat;
    }
    let mut cut = MAX;
    while !flat.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &flat[..cut])
}

/// Scan progress rendering: file counter lines plus a per-PDF page bar.
#[derive(Default)]
struct CliReporter {
    total: AtomicU64,
    done: AtomicU64,
    page_bar: Mutex<Option<ProgressBar>>,
}

impl CliReporter {
    fn bar(&self, total: usize, message: &str) -> ProgressBar {
        let mut guard = self.page_bar.lock().expect("progress bar lock poisoned");
        if guard.is_none() {
            let bar = ProgressBar::new(total as u64);
            bar.set_style(
                ProgressStyle::with_template("  {msg} [{bar:30.cyan/blue}] {pos}/{len}")
                    .expect("valid template")
                    .progress_chars("=> "),
            );
            bar.set_message(message.to_string());
            *guard = Some(bar);
        }
        guard.as_ref().expect("just set").clone()
    }

    fn finish_bar(&self) {
        let mut guard = self.page_bar.lock().expect("progress bar lock poisoned");
        if let Some(bar) = guard.take() {
            bar.finish_and_clear();
        }
    }
}

impl ProgressReporter for CliReporter {
    fn on_start_scan(&self, count: u64) {
        self.total.store(count, Ordering::SeqCst);
        println!("Scanning {count} files...");
    }

    fn on_start_handle_file(&self, path: &std::path::Path) {
        let done = self.done.load(Ordering::SeqCst);
        let total = self.total.load(Ordering::SeqCst);
        println!("[{}/{}] {}", done + 1, total, path.display());
    }

    fn on_complete_handle_file(&self, _path: &std::path::Path) {
        self.done.fetch_add(1, Ordering::SeqCst);
        self.finish_bar();
    }

    fn on_complete_handle_pdf_page(&self, index: usize, total: usize) {
        let bar = self.bar(total, "splitting");
        bar.set_position(index as u64 + 1);
        if index + 1 == total {
            self.finish_bar();
        }
    }

    fn on_complete_index_pdf_page(&self, index: usize, total: usize) {
        let bar = self.bar(total, "indexing");
        bar.set_position(index as u64 + 1);
        if index + 1 == total {
            self.finish_bar();
        }
    }
}
