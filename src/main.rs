use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use iruka_qa::config::{LoggingConfig, ServiceConfig};
use iruka_qa::pipeline::Pipeline;
use iruka_qa::release::{
    Action, Actor, Attestations, Decision, NewVersion, Permission, ReleaseStore, Transition,
};
use iruka_qa::summary::RunStatus;

#[derive(Parser)]
#[command(
    name = "iruka-qa",
    about = "Automated QA runs and release gating for game builds",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (defaults to IRUKA_QA_CONFIG, then /etc/iruka-qa/iruka-qa.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP service
    Serve {
        /// Bind address (overrides server.bind)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run the QA pipeline once and print the summary
    Run {
        /// Build to test
        #[arg(long)]
        game_url: String,
    },

    /// Check a callback signature against a body
    VerifySignature {
        /// Shared secret
        #[arg(long, env = "IRUKA_CALLBACK_SECRET")]
        secret: String,

        /// File holding the raw request body
        #[arg(long)]
        body_file: PathBuf,

        /// Hex signature from the x-iruka-signature header
        #[arg(long)]
        signature: String,
    },

    /// Host one build for the test driver: commands go out on stdout as JSON
    /// lines, frame messages come in on stdin, and the bridge dump is written
    /// to the run directory. Exits 1 when a wait on the frame expired.
    Harness {
        /// Build to load into the frame
        #[arg(long, env = "GAME_URL")]
        game_url: String,

        /// Run directory receiving bridge-artifacts.json
        #[arg(long, env = "RUN_DIR")]
        run_dir: PathBuf,

        /// Per-wait timeout (overrides bridge.wait_timeout_ms)
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Operate the version lifecycle against the local database
    Version {
        #[command(subcommand)]
        action: VersionAction,
    },
}

#[derive(Subcommand)]
enum VersionAction {
    /// Register a new version in draft
    Create {
        #[arg(long)]
        game_id: String,
        #[arg(long)]
        label: String,
        #[arg(long)]
        game_url: String,
    },

    /// Show a version and its latest QC report
    Show { id: String },

    /// Submit to QC (draft or qc_failed -> uploaded)
    Submit {
        id: String,
        /// Confirm device, audio, gameplay and content checks were done
        #[arg(long)]
        attest: bool,
    },

    /// Start QC processing (uploaded -> qc_processing)
    StartQc { id: String },

    /// Record a QC decision
    Decide {
        id: String,
        /// pass or fail
        #[arg(long)]
        decision: Decision,
        /// Evidence reference, e.g. a run id
        #[arg(long)]
        evidence: Option<String>,
    },

    /// qc_passed -> approved
    Approve { id: String },

    /// approved -> published
    Publish { id: String },

    /// published -> archived
    Archive { id: String },

    /// archived -> published
    Republish { id: String },

    /// Print the audit trail
    History { id: String },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Local operators act with every permission.
fn operator() -> Actor {
    let id = std::env::var("USER").unwrap_or_else(|_| "cli".to_string());
    Actor::new(
        format!("cli:{id}"),
        vec![Permission::Approve, Permission::Publish, Permission::Archive],
    )
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_transition(t: &Transition) {
    if t.changed {
        println!("{}: {} -> {}", t.version.id, t.from, t.version.status);
    } else {
        println!("{}: already {}", t.version.id, t.version.status);
    }
}

fn version_command(config: &ServiceConfig, action: VersionAction) -> Result<()> {
    let pool = iruka_qa::storage::open_pool(&config.server.db_path)?;
    let store = ReleaseStore::new(pool);
    let actor = operator();

    let apply = |id: &str, action: Action, evidence: Option<&str>| -> Result<()> {
        let t = store.apply(id, action, &actor, evidence, None)?;
        print_transition(&t);
        Ok(())
    };

    match action {
        VersionAction::Create {
            game_id,
            label,
            game_url,
        } => {
            iruka_qa::pipeline::validate_game_url(
                Some(game_url.as_str()),
                &config.submission.allowed_domains,
            )?;
            let v = store.create(&NewVersion {
                game_id,
                label,
                game_url,
            })?;
            print_json(&v)?;
        }
        VersionAction::Show { id } => {
            let v = store.get(&id)?;
            let report = store.latest_report(&id)?;
            print_json(&serde_json::json!({ "version": v, "latestReport": report }))?;
        }
        VersionAction::Submit { id, attest } => {
            if attest {
                store.set_attestations(&id, Attestations::all())?;
            }
            apply(&id, Action::SubmitToQc, None)?;
        }
        VersionAction::StartQc { id } => apply(&id, Action::StartQc, None)?,
        VersionAction::Decide {
            id,
            decision,
            evidence,
        } => apply(&id, Action::RecordDecision(decision), evidence.as_deref())?,
        VersionAction::Approve { id } => apply(&id, Action::Approve, None)?,
        VersionAction::Publish { id } => apply(&id, Action::Publish, None)?,
        VersionAction::Archive { id } => apply(&id, Action::Archive, None)?,
        VersionAction::Republish { id } => apply(&id, Action::Republish, None)?,
        VersionAction::History { id } => {
            for entry in store.history(&id)? {
                println!(
                    "{}  {} -> {}  by {}{}",
                    entry.created_at,
                    entry.from_status,
                    entry.to_status,
                    entry.actor,
                    entry
                        .evidence_ref
                        .map(|e| format!("  ({e})"))
                        .unwrap_or_default()
                );
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::VerifySignature {
        secret,
        body_file,
        signature,
    } = &cli.command
    {
        let body = std::fs::read(body_file)
            .with_context(|| format!("failed to read {}", body_file.display()))?;
        if iruka_qa::callback::verify(secret.as_bytes(), &body, signature) {
            println!("valid");
            return Ok(());
        }
        println!("invalid");
        std::process::exit(1);
    }

    let config = ServiceConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            let mut config = config;
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            tracing::info!(bind = %config.server.bind, "Starting iruka-qa service");
            iruka_qa::serve(config).await?;
        }
        Commands::Run { game_url } => {
            let pool = iruka_qa::storage::open_pool(&config.server.db_path)?;
            let pipeline = Pipeline::from_config(&config, Some(pool))?;
            let response = pipeline
                .submit(Some(game_url.as_str()), serde_json::json!({ "source": "cli" }))
                .await??;
            print_json(&response)?;
            let code = match response.status {
                RunStatus::Pass => 0,
                RunStatus::Fail => 1,
                RunStatus::InfraError => 2,
            };
            std::process::exit(code);
        }
        Commands::Harness {
            game_url,
            run_dir,
            timeout_ms,
        } => {
            let mut bridge = config.bridge.clone();
            if let Some(ms) = timeout_ms {
                bridge.wait_timeout_ms = ms;
            }
            std::fs::create_dir_all(&run_dir)
                .with_context(|| format!("failed to create {}", run_dir.display()))?;
            let outcome = iruka_qa::bridge::harness::run_session(
                tokio::io::stdin(),
                tokio::io::stdout(),
                &bridge,
                &game_url,
                &run_dir,
            )
            .await?;
            // stdin is read on a blocking thread that may never see EOF.
            std::process::exit(if outcome.timed_out.is_some() { 1 } else { 0 });
        }
        Commands::Version { action } => version_command(&config, action)?,
        Commands::VerifySignature { .. } => unreachable!("handled before config load"),
    }

    Ok(())
}
