use clap::{CommandFactory, Parser, Subcommand};
use rpassword::read_password;
use std::io::{self, Write};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vaultplate::aggregate::Aggregator;
use vaultplate::backend::{self, Backend, BackendKind, Outcome};
use vaultplate::manifest::{self, Manifest, PATH_ANNOTATION};
use vaultplate::template::{self, Target};
use vaultplate::writer::{self, Rotation, RotationPolicy};
use vaultplate::{Error, Result, config};
use zeroize::Zeroizing;

#[derive(Parser)]
#[command(
    name = "vaultplate",
    version,
    about = "Render secret store values into Kubernetes manifests"
)]
struct Cli {
    /// Config file (YAML or JSON) with backend selection and credentials
    #[arg(short = 'c', long, global = true)]
    config_path: Option<PathBuf>,

    /// Override the configured backend
    #[arg(long, global = true, value_enum)]
    backend: Option<BackendKind>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a secret value (prompted for when omitted)
    Store {
        path: String,
        secret: String,
        value: Option<String>,
        /// Do not echo the prompted value
        #[arg(short, long)]
        noecho: bool,
    },
    /// Disable VERSION of a secret and write VALUE as a new version
    Rotate {
        path: String,
        secret: String,
        value: String,
        version: String,
        /// Create the new version even if disabling the old one fails
        #[arg(long)]
        best_effort: bool,
    },
    /// Print one secret value
    Get {
        path: String,
        secret: String,
        #[arg(long, default_value = "")]
        version: String,
    },
    /// Emit one Secret manifest per historical version of SECRET
    History {
        /// Manifest file, directory, or `-` for stdin
        manifests: String,
        secret: String,
        /// Store path; defaults to the template's path annotation
        #[arg(long)]
        path: Option<String>,
    },
    /// Emit one Secret manifest per secret in each annotated store path
    Render {
        /// Manifest file, directory, or `-` for stdin
        manifests: String,
        /// Resolve every secret at the first enabled version containing this string
        #[arg(long, default_value = "")]
        version: String,
    },
    /// Print shell completions
    Completions { shell: clap_complete::Shell },
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn connect(cli: &Cli) -> Result<Box<dyn Backend>> {
    let config = config::load(cli.config_path.as_deref(), cli.backend)?;
    let mut backend = backend::build(&config)?;
    backend.login()?;
    info!(backend = %backend.kind(), "logged in");
    Ok(backend)
}

fn report_unsupported<T>(backend: &dyn Backend, outcome: Outcome<T>) -> Option<T> {
    match outcome {
        Outcome::Supported(value) => Some(value),
        Outcome::Unsupported(operation) => {
            warn!("{operation} is not supported by the {} backend", backend.kind());
            None
        }
    }
}

fn read_value(prompt: &str, noecho: bool) -> Result<Zeroizing<String>> {
    if noecho {
        eprint!("{prompt} (noecho):");
        return Ok(Zeroizing::new(read_password()?));
    }
    eprint!("{prompt}: ");
    let mut buf = Zeroizing::new(String::new());
    io::stdin().read_line(&mut buf)?;
    let trimmed = buf.trim_end_matches(['\n', '\r']).len();
    buf.truncate(trimmed);
    Ok(buf)
}

fn load_manifests(source: &str) -> Result<Vec<Manifest>> {
    let manifests = manifest::load(source)?;
    if manifests.is_empty() {
        return Err(Error::manifest("no manifests"));
    }
    Ok(manifests)
}

fn store(cli: &Cli, path: &str, secret: &str, value: Option<&str>, noecho: bool) -> Result<()> {
    let mut backend = connect(cli)?;
    let value = match value {
        Some(value) => Zeroizing::new(value.to_string()),
        None => read_value(&format!("{path}.{secret}"), noecho)?,
    };
    let outcome = backend.set_individual_secret(path, secret, "", &value)?;
    if report_unsupported(&*backend, outcome).is_some() {
        info!(path, secret, "stored secret");
    }
    Ok(())
}

fn rotate(
    cli: &Cli,
    path: &str,
    secret: &str,
    value: &str,
    version: &str,
    best_effort: bool,
) -> Result<()> {
    let mut backend = connect(cli)?;
    let policy = if best_effort {
        RotationPolicy::BestEffort
    } else {
        RotationPolicy::Strict
    };
    let outcome = writer::rotate(&mut *backend, path, secret, version, value, policy)?;
    match report_unsupported(&*backend, outcome) {
        Some(Rotation::CreatedWithoutDisable { version, error }) => {
            eprintln!("warning: version {version} is still enabled: {error}");
        }
        Some(rotation) => info!(?rotation, "rotation complete"),
        None => {}
    }
    Ok(())
}

fn get(cli: &Cli, path: &str, secret: &str, version: &str) -> Result<()> {
    let backend = connect(cli)?;
    let outcome = backend.get_individual_secret(path, secret, version, None)?;
    if let Some(value) = report_unsupported(&*backend, outcome) {
        let value = Zeroizing::new(value);
        println!("{}", value.as_str());
    }
    Ok(())
}

fn history(cli: &Cli, source: &str, secret: &str, path: Option<&str>) -> Result<()> {
    let manifests = load_manifests(source)?;
    let template = manifest::find_secret_template(&manifests, secret)
        .ok_or_else(|| Error::manifest("no Secret manifest found"))?;
    let path = path
        .or_else(|| template.annotation(PATH_ANNOTATION))
        .ok_or_else(|| {
            Error::manifest(format!("Secret manifest has no `{PATH_ANNOTATION}` annotation"))
        })?
        .to_string();

    let backend = connect(cli)?;
    let outcome = Aggregator::new(&*backend).history(&path, secret)?;
    if let Some(entries) = report_unsupported(&*backend, outcome) {
        let mut out = io::stdout().lock();
        template::render(template, Target::Secret(secret), &entries, &mut out)?;
        out.flush()?;
    }
    Ok(())
}

fn render(cli: &Cli, source: &str, version: &str) -> Result<()> {
    let manifests = load_manifests(source)?;
    let templates: Vec<(&Manifest, String)> = manifests
        .iter()
        .filter(|m| m.is_secret())
        .filter_map(|m| m.annotation(PATH_ANNOTATION).map(|p| (m, p.to_string())))
        .collect();
    if templates.is_empty() {
        return Err(Error::manifest(format!(
            "no Secret manifest carries the `{PATH_ANNOTATION}` annotation"
        )));
    }

    let backend = connect(cli)?;
    let aggregator = Aggregator::new(&*backend);
    let mut out = io::stdout().lock();
    for (template, path) in templates {
        let outcome = aggregator.at_version(&path, version)?;
        if let Some(entries) = report_unsupported(&*backend, outcome) {
            template::render(template, Target::PerEntry, &entries, &mut out)?;
        }
    }
    out.flush()?;
    Ok(())
}

fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Command::Store {
            path,
            secret,
            value,
            noecho,
        } => store(cli, path, secret, value.as_deref(), *noecho),
        Command::Rotate {
            path,
            secret,
            value,
            version,
            best_effort,
        } => rotate(cli, path, secret, value, version, *best_effort),
        Command::Get {
            path,
            secret,
            version,
        } => get(cli, path, secret, version),
        Command::History {
            manifests,
            secret,
            path,
        } => history(cli, manifests, secret, path.as_deref()),
        Command::Render { manifests, version } => render(cli, manifests, version),
        Command::Completions { shell } => {
            clap_complete::generate(*shell, &mut Cli::command(), "vaultplate", &mut io::stdout());
            Ok(())
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    if let Err(e) = run(&cli) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
