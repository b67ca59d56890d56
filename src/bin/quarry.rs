//! quarry: run entity queries from the terminal
//!
//! # Usage
//!
//! ```bash
//! # Run a query against a fixture
//! quarry --fixture demos/fixture.json "user.findMany({ where: { active: true } })"
//!
//! # Resolve only, don't touch the data source
//! quarry "user.count({ where: { role: 'admin' } })" --dry-run
//!
//! # Against a database
//! QUARRY_DATABASE_URL=sqlite://demo.db quarry "post.findMany({ take: 5 })"
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use quarry::config::QuarryConfigBuilder;
use quarry::highlight::highlight;
use quarry::lexer::Lexer;
use quarry::prelude::*;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "quarry")]
#[command(version)]
#[command(about = "Type an entity query, get a table", long_about = None)]
#[command(after_help = "EXAMPLES:
    quarry 'user.findMany({ where: { active: true }, take: 10 })'
    quarry 'user.count()' --dry-run
    quarry explain 'post.findFirst({ orderBy: { createdAt: \"desc\" } })'")]
struct Cli {
    /// The query to execute
    query: Option<String>,

    /// Configuration file (default: ./quarry.toml, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Schema description (TOML)
    #[arg(long, global = true)]
    schema: Option<PathBuf>,

    /// JSON fixture for the in-memory store
    #[arg(long, global = true)]
    fixture: Option<PathBuf>,

    /// Database connection URL (postgres:// or sqlite:)
    #[arg(long, env = "QUARRY_DATABASE_URL", global = true)]
    database_url: Option<String>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table", global = true)]
    format: OutputFormat,

    /// Resolve the query and show the call, without dispatching it
    #[arg(short, long)]
    dry_run: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Show tokens, lint diagnostics and the resolved call for a query
    Explain {
        /// The query to explain
        query: String,
    },
    /// Print the token stream as JSON
    Tokens {
        /// The query to tokenize
        query: String,
    },
    /// List the entities and operations that can be queried
    Entities,
    /// Interactive REPL mode
    Repl,
    /// Serve the HTTP API
    Serve {
        /// Address to bind (overrides bind_address)
        #[arg(short, long)]
        bind: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(&cli).await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "quarry=debug" } else { "quarry=info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<QuarryConfig> {
    let mut builder = QuarryConfigBuilder::from_config(
        QuarryConfig::load(cli.config.as_deref()).context("loading configuration")?,
    );
    if let Some(path) = &cli.schema {
        builder = builder.schema(path);
    }
    if let Some(path) = &cli.fixture {
        builder = builder.fixture(path);
    }
    if let Some(url) = &cli.database_url {
        builder = builder.database(url);
    }
    Ok(builder.build())
}

async fn run(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;

    match &cli.command {
        Some(Commands::Explain { query }) => explain_query(query, &config).await,
        Some(Commands::Tokens { query }) => {
            let tokens: Vec<Token<'_>> = Lexer::new(query).collect();
            println!("{}", serde_json::to_string_pretty(&tokens)?);
            Ok(())
        }
        Some(Commands::Entities) => {
            let engine = Engine::open(&config).await?;
            show_entities(&engine);
            Ok(())
        }
        Some(Commands::Repl) => {
            let engine = Engine::open(&config).await?;
            run_repl(&engine, cli.format).await;
            Ok(())
        }
        Some(Commands::Serve { bind }) => {
            let config = match bind {
                Some(addr) => QuarryConfigBuilder::from_config(config).bind(addr).build(),
                None => config,
            };
            quarry::server::serve(&config).await?;
            Ok(())
        }
        None => match &cli.query {
            Some(query) => execute_query(query, cli, &config).await,
            None => {
                println!("{}", "quarry: type an entity query, get a table".cyan().bold());
                println!();
                println!("Usage: quarry <QUERY> [OPTIONS]");
                println!();
                println!("Try: quarry --help");
                Ok(())
            }
        },
    }
}

async fn execute_query(query: &str, cli: &Cli, config: &QuarryConfig) -> Result<()> {
    let engine = Engine::open(config).await?;
    if cli.verbose {
        println!("{} {}", "Input:".dimmed(), highlight(query, Some(engine.registry().as_ref())));
    }

    if cli.dry_run {
        let call = engine.resolve(query)?;
        println!("{}", "Resolved call:".green().bold());
        println!("  {}", call.to_string().white());
        return Ok(());
    }

    // Ctrl+C cancels the running query instead of killing the process.
    let token = CancellationToken::new();
    let watcher = {
        let token = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                token.cancel();
            }
        })
    };
    let result = engine.run_with(query, &token).await;
    watcher.abort();

    format_output(&result?, cli.format);
    Ok(())
}

fn format_output(set: &ResultSet, format: OutputFormat) {
    if set.is_empty() {
        println!("{}", "(no results)".dimmed());
        return;
    }

    match format {
        OutputFormat::Json => println!("{}", render_json(set)),
        OutputFormat::Table => {
            let table = TableModel::from_result_set(set, CellStyle::Compact);
            let widths = table.widths();

            println!("{}", table.header_line(&widths).white().bold());
            println!("{}", table.separator_line(&widths).dimmed());
            for line in table.row_lines(&widths) {
                println!("{}", line);
            }

            println!();
            println!("{} row(s) returned", set.len().to_string().cyan());
        }
    }
}

async fn explain_query(query: &str, config: &QuarryConfig) -> Result<()> {
    println!("{}", "quarry query explanation".cyan().bold());
    println!();

    // Without a data source there is no registry; lex without entity names.
    let engine = match Engine::open(config).await {
        Ok(engine) => Some(engine),
        Err(e) => {
            println!("{} {}", "No data source:".yellow(), e);
            None
        }
    };
    let registry = engine.as_ref().map(|e| e.registry().as_ref());

    println!("{} {}", "Query:".dimmed(), highlight(query, registry));
    println!();

    let lexer = match registry {
        Some(registry) => Lexer::with_registry(query, registry),
        None => Lexer::new(query),
    };
    let tokens: Vec<Token<'_>> = lexer.collect();

    println!("{}", "Tokens:".green().bold());
    for token in &tokens {
        println!(
            "  {:>4}..{:<4} {:16} {}",
            token.span.start,
            token.span.end,
            token.kind.style_name().cyan(),
            token.text.white()
        );
    }

    let diagnostics: Vec<_> = tokens.iter().filter_map(Token::diagnostic).collect();
    if !diagnostics.is_empty() {
        println!();
        println!("{}", "Diagnostics:".yellow().bold());
        for diagnostic in &diagnostics {
            println!("  {}", diagnostic.to_string().yellow());
        }
    }

    if let Some(engine) = &engine {
        println!();
        match engine.resolve(query) {
            Ok(call) => {
                println!("{}", "Resolved call:".green().bold());
                println!("  {} {}", "Entity:".dimmed(), call.entity().white());
                println!("  {} {}", "Operation:".dimmed(), call.operation().to_string().cyan());
                println!(
                    "  {} {}",
                    "Arguments:".dimmed(),
                    serde_json::to_string_pretty(call.arguments())?.white()
                );
            }
            Err(e) => {
                eprintln!("{} {}", "Resolve error:".red().bold(), e);
                if let Some(position) = e.position() {
                    eprintln!("  {}", caret_line(query, position).red());
                }
            }
        }
    }
    Ok(())
}

/// Query text with a caret under the byte at `position`.
fn caret_line(query: &str, position: usize) -> String {
    let prefix = query.get(..position).unwrap_or(query);
    let line_start = prefix.rfind('\n').map_or(0, |i| i + 1);
    let line_end = query[line_start..]
        .find('\n')
        .map_or(query.len(), |i| line_start + i);
    let column = prefix[line_start..].chars().count();
    format!("{}\n  {}^", &query[line_start..line_end], " ".repeat(column))
}

fn show_entities(engine: &Engine) {
    println!("{}", "Entities".cyan().bold());
    println!("{}", "─".repeat(60).dimmed());
    for entity in engine.registry().entities() {
        println!(
            "{} {} {}",
            entity.accessor().yellow().bold(),
            format!("({})", entity.name()).dimmed(),
            format!("→ {}", entity.table()).dimmed()
        );
        let operations: Vec<&str> = entity.operations().iter().map(|op| op.name()).collect();
        println!("  {}", operations.join(" ").white());
        if !entity.fields().is_empty() {
            println!("  {} {}", "fields:".dimmed(), entity.fields().join(", "));
        }
    }
}

async fn run_repl(engine: &Engine, format: OutputFormat) {
    use rustyline::DefaultEditor;
    use rustyline::error::ReadlineError;

    println!("{}", "quarry REPL (interactive mode)".cyan().bold());
    println!("{}", "Type a query to run it. Commands:".dimmed());
    println!("  {}     - Exit the REPL", ".exit".yellow());
    println!("  {} - List entities", ".entities".yellow());
    println!("  {}    - Clear screen", ".clear".yellow());
    println!();

    let mut rl = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("{} {}", "Failed to initialize REPL:".red(), e);
            return;
        }
    };

    let history_path = dirs::home_dir()
        .map(|p| p.join(".quarry_history"))
        .unwrap_or_default();
    let _ = rl.load_history(&history_path);

    let session = Session::new(std::sync::Arc::new(engine.clone()));

    loop {
        let prompt = "quarry> ".cyan().bold().to_string();
        match rl.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                let _ = rl.add_history_entry(line);

                match line {
                    ".exit" | ".quit" | "exit" | "quit" => {
                        println!("{}", "Goodbye!".green());
                        break;
                    }
                    ".entities" => {
                        show_entities(engine);
                        continue;
                    }
                    ".clear" | "clear" => {
                        print!("\x1B[2J\x1B[1;1H");
                        continue;
                    }
                    _ => {}
                }

                match session.submit(line).await {
                    Ok(set) => format_output(&set, format),
                    Err(e) => {
                        eprintln!("{} {}", "✗".red(), e.to_string().red());
                        if let Some(position) = e.position() {
                            eprintln!("  {}", caret_line(line, position).red());
                        }
                    }
                }
                session.acknowledge();
                println!();
            }
            Err(ReadlineError::Interrupted) => {
                println!("{}", "^C".dimmed());
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("{}", "Goodbye!".green());
                break;
            }
            Err(err) => {
                eprintln!("{} {:?}", "Error:".red(), err);
                break;
            }
        }
    }

    let _ = rl.save_history(&history_path);
}
