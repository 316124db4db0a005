use crate::app_error::AppError;
use crate::config::{self, DEFAULT_CONFIG_PATH, Settings};
use crate::engine::{CancelToken, Engine, EngineOptions};
use crate::error::HubError;
use crate::export::{self, RunExport};
use crate::ledger::{Filter, Ledger};
use crate::model::{ParamMode, Run, RunStatus};
use crate::output;
use crate::params;
use crate::registry::Registry;
use crate::signals;
use crate::version;
use clap::builder::styling::{AnsiColor, Effects, Styles};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{Generator, generate};
use serde::Serialize;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const DEFAULT_CONFIG_TEMPLATE: &str = r#"version: 1

script_directory: "./python_scripts"   # or set SCRIPTS_DIR
# recursive: false                     # descend into subdirectories
# extensions: ["py", "sh"]
# interpreters:
#   py: python3
#   sh: sh

execution_timeout: "5m"     # wall-clock limit per run, "0s" disables
max_concurrent_runs: 4
admission: queue            # queue | reject
# queue_timeout: "30s"
max_output_bytes: 10485760  # per stream
ledger_storage_path: ".scripthub/runs.jsonl"

working_dir: inherit        # inherit | script | <path>
json_style: flags           # flags (--key value) | payload (--json <payload>)
kill_grace: "2s"

# env:
#   API_BASE: "https://example.com"
"#;

#[derive(Debug, Parser)]
#[command(
    name = "scripthub",
    version = version::VALUE,
    about = "Run local scripts and keep a history of every run",
    styles = clap_styles()
)]
struct Cli {
    #[arg(long = "no-color", global = true)]
    no_color: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Init(InitArgs),
    Scripts(ScriptsArgs),
    Run(RunArgs),
    History(HistoryArgs),
    Show(ShowArgs),
    Delete(DeleteArgs),
    Compact(ConfigArgs),
    Validate(ValidateArgs),
    Version,
    Completion(CompletionArgs),
}

#[derive(Debug, Args)]
struct ConfigArgs {
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    force: bool,
}

#[derive(Debug, Args)]
struct ScriptsArgs {
    #[command(flatten)]
    config: ConfigArgs,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct RunArgs {
    script: String,

    /// Raw parameters, interpreted according to --mode.
    params: Option<String>,

    #[arg(long = "params-file", conflicts_with = "params")]
    params_file: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = Mode::Positional)]
    mode: Mode,

    #[arg(long)]
    timeout: Option<String>,

    #[command(flatten)]
    config: ConfigArgs,

    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct HistoryArgs {
    #[arg(long, default_value_t = 20)]
    limit: usize,
    #[arg(long, default_value_t = 0)]
    offset: usize,
    #[arg(long)]
    status: Option<String>,
    #[arg(long)]
    script: Option<String>,
    #[command(flatten)]
    config: ConfigArgs,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct ShowArgs {
    id: String,
    #[command(flatten)]
    config: ConfigArgs,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct DeleteArgs {
    id: String,
    #[command(flatten)]
    config: ConfigArgs,
}

#[derive(Debug, Args)]
struct ValidateArgs {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct CompletionArgs {
    #[arg(value_enum)]
    shell: Shell,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Positional,
    Kv,
    Json,
}

impl From<Mode> for ParamMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Positional => ParamMode::Positional,
            Mode::Kv => ParamMode::KeyValue,
            Mode::Json => ParamMode::Json,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Shell {
    Bash,
    Zsh,
    Fish,
    Powershell,
}

fn clap_styles() -> Styles {
    Styles::plain()
        .header(AnsiColor::White.on_default() | Effects::BOLD)
        .error(AnsiColor::Red.on_default() | Effects::BOLD)
        .usage(AnsiColor::Cyan.on_default())
        .literal(AnsiColor::Cyan.on_default())
        .placeholder(AnsiColor::Cyan.on_default())
        .valid(AnsiColor::Cyan.on_default())
        .invalid(AnsiColor::Cyan.on_default())
        .context(AnsiColor::White.on_default())
        .context_value(AnsiColor::Cyan.on_default())
}

pub fn run_cli() -> Result<(), AppError> {
    let cli = Cli::parse();
    output::configure(cli.no_color);

    match cli.command {
        Commands::Init(args) => run_init(args),
        Commands::Scripts(args) => run_scripts(args),
        Commands::Run(args) => run_run(args),
        Commands::History(args) => run_history(args),
        Commands::Show(args) => run_show(args),
        Commands::Delete(args) => run_delete(args),
        Commands::Compact(args) => run_compact(args),
        Commands::Validate(args) => run_validate(args),
        Commands::Version => {
            println!("{}", version::VALUE);
            Ok(())
        }
        Commands::Completion(args) => run_completion(args),
    }
}

fn load_settings(args: &ConfigArgs) -> Result<Settings, AppError> {
    let path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let mut cfg = config::load_or_default(&path, args.config.is_some())?;
    cfg.apply_env_overrides(|key| std::env::var(key).ok())?;
    Ok(cfg.resolve()?)
}

fn run_init(args: InitArgs) -> Result<(), AppError> {
    let config_path = args
        .config
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    if config_path.exists() && !args.force {
        return Err(AppError::usage(format!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        )));
    }

    fs::write(&config_path, DEFAULT_CONFIG_TEMPLATE)
        .map_err(|e| AppError::internal(format!("write {}: {e}", config_path.display())))?;

    println!(
        "created {}",
        output::accent(&config_path.display().to_string())
    );
    Ok(())
}

fn run_scripts(args: ScriptsArgs) -> Result<(), AppError> {
    let settings = load_settings(&args.config)?;
    let scripts = Registry::from_settings(&settings).list_scripts()?;

    if args.json {
        return write_json(&scripts, "scripts");
    }

    output::print_scripts(io::stdout().lock(), &scripts)
        .map_err(|e| AppError::internal(format!("print scripts: {e}")))
}

fn run_run(args: RunArgs) -> Result<(), AppError> {
    let settings = load_settings(&args.config)?;

    let raw = match &args.params_file {
        Some(path) => read_params_file(path)?,
        None => args.params.clone().unwrap_or_default(),
    };

    // everything that can be rejected is checked before anything is spawned
    let script = Registry::from_settings(&settings).find(&args.script)?;
    let params = params::translate(&raw, args.mode.into())?;
    let timeout = match &args.timeout {
        Some(text) => config::parse_duration(text)
            .map_err(|_| AppError::usage("--timeout must be a valid duration"))?,
        None => settings.execution_timeout,
    };

    let ledger = Arc::new(Ledger::new(&settings.ledger_storage_path));
    let engine = Engine::new(EngineOptions::from(&settings), ledger);

    let cancel = CancelToken::new();
    let interrupt = signals::cancel_on_interrupt(cancel.clone());
    let result = engine.execute_with_cancel(&script, &params, timeout, cancel);
    let interrupted = interrupt.interrupted();
    drop(interrupt);

    let (run, storage_err) = match result {
        Ok(run) => (run, None),
        Err(HubError::Unpersisted { run, message }) => (*run, Some(message)),
        Err(err) => return Err(err.into()),
    };

    report_run(&run, args.json)?;

    if let Some(message) = storage_err {
        return Err(AppError::internal(format!(
            "run {} finished but could not be saved to history yet (held for retry): {message}",
            run.id
        )));
    }

    if interrupted && run.status == RunStatus::Cancelled {
        return Err(AppError::run_failed(format!("run {} interrupted", run.id)));
    }

    if run.status != RunStatus::Succeeded {
        return Err(AppError::run_failed(format!(
            "run {} {}",
            run.id,
            export::status_label(&run).to_lowercase()
        )));
    }

    Ok(())
}

fn read_params_file(path: &Path) -> Result<String, AppError> {
    if path == Path::new("-") {
        let mut text = String::new();
        io::stdin()
            .read_to_string(&mut text)
            .map_err(|e| AppError::usage(format!("read parameters from stdin: {e}")))?;
        return Ok(text);
    }

    fs::read_to_string(path)
        .map_err(|e| AppError::usage(format!("read parameters file {}: {e}", path.display())))
}

fn report_run(run: &Run, as_json: bool) -> Result<(), AppError> {
    let exported = export::export(run);

    if as_json {
        return write_json(&exported, "run");
    }

    output::print_run(io::stdout().lock(), &exported)
        .map_err(|e| AppError::internal(format!("print run: {e}")))?;

    let verdict = match run.status {
        RunStatus::Succeeded => output::success("ok"),
        RunStatus::Failed => output::failure("x"),
        RunStatus::TimedOut | RunStatus::Cancelled => output::warning("!"),
    };
    eprintln!(
        "{verdict} run \"{}\" {} in {}",
        run.script_name,
        exported.status_label.to_lowercase(),
        output::number(&output::format_duration_ms(run.duration_ms)),
    );
    Ok(())
}

fn run_history(args: HistoryArgs) -> Result<(), AppError> {
    let status = match &args.status {
        Some(text) => Some(RunStatus::parse(text).ok_or_else(|| {
            AppError::usage("--status must be succeeded, failed, timedout, or cancelled")
        })?),
        None => None,
    };

    let settings = load_settings(&args.config)?;
    let ledger = Ledger::new(&settings.ledger_storage_path);
    let runs = ledger.list(
        Some(args.limit),
        args.offset,
        &Filter {
            status,
            script: args.script.clone(),
        },
    )?;

    if args.json {
        let exported: Vec<RunExport> = runs.iter().map(export::export).collect();
        return write_json(&exported, "history");
    }

    output::print_history(io::stdout().lock(), &runs)
        .map_err(|e| AppError::internal(format!("print history: {e}")))
}

fn run_show(args: ShowArgs) -> Result<(), AppError> {
    let settings = load_settings(&args.config)?;
    let run = Ledger::new(&settings.ledger_storage_path).get(&args.id)?;
    let exported = export::export(&run);

    if args.json {
        return write_json(&exported, "run");
    }

    output::print_run(io::stdout().lock(), &exported)
        .map_err(|e| AppError::internal(format!("print run: {e}")))
}

fn run_delete(args: DeleteArgs) -> Result<(), AppError> {
    let settings = load_settings(&args.config)?;
    Ledger::new(&settings.ledger_storage_path).delete(&args.id)?;
    println!("deleted {}", output::muted(&args.id));
    Ok(())
}

fn run_compact(args: ConfigArgs) -> Result<(), AppError> {
    let settings = load_settings(&args)?;
    let kept = Ledger::new(&settings.ledger_storage_path).compact()?;
    println!(
        "compacted {} ({} runs kept)",
        output::accent(&settings.ledger_storage_path.display().to_string()),
        output::number(&kept.to_string())
    );
    Ok(())
}

fn run_validate(args: ValidateArgs) -> Result<(), AppError> {
    #[derive(Serialize)]
    struct Issue<'a> {
        field: &'a str,
        message: &'a str,
    }

    #[derive(Serialize)]
    struct ValidateOutput<'a> {
        valid: bool,
        config: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        issues: Option<Vec<Issue<'a>>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<&'a str>,
    }

    let config_path = args
        .config
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config_path_text = config_path.display().to_string();

    let cfg = match config::parse(&config_path) {
        Ok(cfg) => cfg,
        Err(err) => {
            if args.json {
                write_json(
                    &ValidateOutput {
                        valid: false,
                        config: &config_path_text,
                        issues: None,
                        error: Some(&err),
                    },
                    "validate",
                )?;
            }
            return Err(AppError::usage(err));
        }
    };

    match config::validate(&cfg) {
        Ok(()) => {
            if args.json {
                write_json(
                    &ValidateOutput {
                        valid: true,
                        config: &config_path_text,
                        issues: None,
                        error: None,
                    },
                    "validate",
                )?;
            } else {
                println!("valid {}", output::accent(&config_path_text));
            }
            Ok(())
        }
        Err(err) => {
            if args.json {
                let issues: Vec<Issue<'_>> = err
                    .issues
                    .iter()
                    .map(|issue| Issue {
                        field: &issue.field,
                        message: &issue.message,
                    })
                    .collect();
                write_json(
                    &ValidateOutput {
                        valid: false,
                        config: &config_path_text,
                        issues: Some(issues),
                        error: Some(&err.to_string()),
                    },
                    "validate",
                )?;
            }
            Err(AppError::usage(err.to_string()))
        }
    }
}

fn write_json<T: Serialize + ?Sized>(value: &T, what: &str) -> Result<(), AppError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, value)
        .map_err(|e| AppError::internal(format!("encode {what} json: {e}")))?;
    writeln!(stdout).map_err(|e| AppError::internal(format!("write output: {e}")))
}

fn run_completion(args: CompletionArgs) -> Result<(), AppError> {
    let mut cmd = Cli::command();
    let mut stdout = io::stdout().lock();

    match args.shell {
        Shell::Bash => generate_completion(clap_complete::shells::Bash, &mut cmd, &mut stdout),
        Shell::Zsh => generate_completion(clap_complete::shells::Zsh, &mut cmd, &mut stdout),
        Shell::Fish => generate_completion(clap_complete::shells::Fish, &mut cmd, &mut stdout),
        Shell::Powershell => {
            generate_completion(clap_complete::shells::PowerShell, &mut cmd, &mut stdout)
        }
    }
    .map_err(|e| AppError::internal(format!("generate completion: {e}")))
}

fn generate_completion<G: Generator>(
    generator: G,
    cmd: &mut clap::Command,
    writer: &mut impl Write,
) -> Result<(), io::Error> {
    generate(generator, cmd, "scripthub", writer);
    writer.flush()
}
