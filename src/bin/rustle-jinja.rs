use clap::{Parser, Subcommand, ValueEnum};
use rustle_jinja::types::output::render_findings;
use rustle_jinja::{
    check_whitespace, parse_annotated, reformat, Environment, Finding, OutputFormat,
    TemplateEngine, TemplateError,
};
use std::collections::HashMap;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "rustle-jinja")]
#[command(about = "Lint and reformat Jinja2 templates without losing their layout")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// YAML file with environment settings (delimiters, trimming)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Remove the first newline after a block tag
    #[arg(long, global = true)]
    trim_blocks: bool,

    /// Strip whitespace before a block tag at the start of a line
    #[arg(long, global = true)]
    lstrip_blocks: bool,

    /// Keep the final newline of a template
    #[arg(long, global = true)]
    keep_trailing_newline: bool,

    /// Enable verbose output
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Report templates whose spacing could be improved
    Check {
        /// Template files (or stdin if -)
        #[arg(value_name = "FILES", required = true)]
        files: Vec<String>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        output: OutputFormatCli,
    },
    /// Parse, annotate and dump templates again
    Fmt {
        /// Template files (or stdin if -)
        #[arg(value_name = "FILES", required = true)]
        files: Vec<String>,

        /// Write the result back to each file
        #[arg(long)]
        write: bool,

        /// Only report files that would change
        #[arg(long, conflicts_with = "write")]
        check: bool,

        /// Render before and after to confirm the output is unchanged
        #[arg(long)]
        verify: bool,

        /// Variables used by --verify (key=value,...)
        #[arg(short, long, value_name = "VARS")]
        extra_vars: Option<String>,
    },
    /// Print the token table of a template as JSON
    Tokens {
        /// Template file (or stdin if -)
        #[arg(value_name = "FILE")]
        file: String,
    },
}

#[derive(Clone, ValueEnum)]
enum OutputFormatCli {
    Text,
    Json,
    Yaml,
}

impl From<OutputFormatCli> for OutputFormat {
    fn from(cli_format: OutputFormatCli) -> Self {
        match cli_format {
            OutputFormatCli::Text => OutputFormat::Text,
            OutputFormatCli::Json => OutputFormat::Json,
            OutputFormatCli::Yaml => OutputFormat::Yaml,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let env = load_environment(&cli)?;

    let clean = match cli.command {
        Command::Check { files, output } => handle_check(&files, output.into()).await?,
        Command::Fmt {
            files,
            write,
            check,
            verify,
            extra_vars,
        } => {
            let vars = parse_extra_vars(&extra_vars);
            let options = FmtOptions {
                write,
                check,
                verify,
            };
            handle_fmt(&env, &files, &options, &vars).await?
        }
        Command::Tokens { file } => {
            let source = read_source(&file).await?;
            let (_, tokens) = parse_annotated(&source, &env, Some(&file))?;
            let table: Vec<_> = tokens.iter().collect();
            println!("{}", serde_json::to_string_pretty(&table)?);
            true
        }
    };

    if !clean {
        std::process::exit(2);
    }
    Ok(())
}

fn load_environment(cli: &Cli) -> Result<Environment, TemplateError> {
    let mut env = match &cli.config {
        Some(path) => Environment::from_yaml_file(path)?,
        None => Environment::new(),
    };
    if cli.trim_blocks {
        env = env.with_trim_blocks(true);
    }
    if cli.lstrip_blocks {
        env = env.with_lstrip_blocks(true);
    }
    if cli.keep_trailing_newline {
        env = env.with_keep_trailing_newline(true);
    }
    debug!(?env, "environment loaded");
    Ok(env)
}

fn parse_extra_vars(extra_vars_str: &Option<String>) -> HashMap<String, serde_json::Value> {
    let mut vars = HashMap::new();

    if let Some(vars_str) = extra_vars_str {
        for pair in vars_str.split(',') {
            if let Some((key, value)) = pair.split_once('=') {
                // Try to parse as JSON first, fall back to string
                let parsed_value = serde_json::from_str(value)
                    .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
                vars.insert(key.trim().to_string(), parsed_value);
            }
        }
    }

    vars
}

async fn read_source(path: &str) -> Result<String, TemplateError> {
    if path == "-" {
        let mut content = String::new();
        io::stdin().read_to_string(&mut content)?;
        return Ok(content);
    }
    Ok(tokio::fs::read_to_string(Path::new(path)).await?)
}

async fn handle_check(
    files: &[String],
    format: OutputFormat,
) -> Result<bool, Box<dyn std::error::Error>> {
    let mut findings = Vec::new();
    for file in files {
        let text = read_source(file).await?;
        if let Some(finding) = Finding::from_report(file, &text, check_whitespace(&text)) {
            findings.push(finding);
        }
    }
    print!("{}", render_findings(&findings, format)?);
    info!(files = files.len(), findings = findings.len(), "spacing check completed");
    Ok(findings.is_empty())
}

struct FmtOptions {
    write: bool,
    check: bool,
    verify: bool,
}

async fn handle_fmt(
    env: &Environment,
    files: &[String],
    options: &FmtOptions,
    vars: &HashMap<String, serde_json::Value>,
) -> Result<bool, Box<dyn std::error::Error>> {
    let engine = if options.verify {
        Some(TemplateEngine::new(env)?)
    } else {
        None
    };
    let mut clean = true;

    for file in files {
        let source = read_source(file).await?;
        let formatted = reformat(&source, env)?;

        if let Some(engine) = &engine {
            if !engine.renders_equivalent(&source, &formatted, vars)? {
                error!("{file}: reformatted template renders differently");
                clean = false;
                continue;
            }
        }

        let changed = formatted != source;
        if options.check {
            if changed {
                println!("{file}: would reformat");
                clean = false;
            }
        } else if options.write && file != "-" {
            if changed {
                tokio::fs::write(file, &formatted).await?;
                info!("{file}: reformatted");
            }
        } else {
            print!("{formatted}");
        }
    }

    Ok(clean)
}
