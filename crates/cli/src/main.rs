mod config;
mod error;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand};
use policy::{
    ClientHints, ClientIdentity, ConsentDecision, EndpointRef, EndpointRegistry, Visibility,
};
use runtime::{AuthRequest, Context, Gateway, RejectReason, Token, TokenCodec, Verdict};
use storage::{AuditEvent, Grant, Store};
use tracing_subscriber::EnvFilter;

use config::Config;
use error::{Error, Result};

#[derive(Parser)]
#[command(name = "gatehouse")]
#[command(about = "Consent and token authorization for local services", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the config file (default: ./gatehouse.toml if present)
    #[arg(short, long, global = true, env = "GATEHOUSE_CONFIG")]
    config: Option<PathBuf>,

    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List stored grants
    Grants {
        /// Only show grants for this client
        #[arg(long)]
        client: Option<String>,
    },
    /// Revoke a client's grants
    Revoke {
        /// Client identity (name, or name:pid for process-scoped identities)
        client: String,
        /// Only revoke this endpoint (/<plugin>/<path>)
        #[arg(short, long)]
        endpoint: Option<String>,
    },
    /// Store a decision for a client without prompting
    Grant {
        #[arg(long)]
        client: String,
        /// Endpoint (/<plugin>/<path>)
        #[arg(long)]
        endpoint: String,
        /// always, once or deny
        #[arg(long, value_parser = parse_decision)]
        decision: ConsentDecision,
    },
    /// Show the audit log
    Audit {
        /// Only show events for this client
        #[arg(long)]
        client: Option<String>,
        /// Show only the last N events
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// List registered endpoints
    Endpoints,
    /// Replace the token key; every issued token stops working
    ResetSecret,
    /// Authorize one request, prompting for consent if needed
    Authorize {
        /// Endpoint (/<plugin>/<path>)
        endpoint: String,
        /// Client id
        #[arg(long, conflicts_with = "process")]
        client: Option<String>,
        /// Client process name
        #[arg(long, requires = "pid")]
        process: Option<String>,
        /// Client process id
        #[arg(long)]
        pid: Option<u32>,
        /// Token from an earlier authorization
        #[arg(long)]
        token: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = Config::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::Grants { client } => cmd_grants(&config, client.as_deref()),
        Commands::Revoke { client, endpoint } => cmd_revoke(&config, &client, endpoint.as_deref()),
        Commands::Grant {
            client,
            endpoint,
            decision,
        } => cmd_grant(&config, &client, &endpoint, decision),
        Commands::Audit { client, limit } => cmd_audit(&config, client.as_deref(), limit),
        Commands::Endpoints => cmd_endpoints(&config),
        Commands::ResetSecret => cmd_reset_secret(&config),
        Commands::Authorize {
            endpoint,
            client,
            process,
            pid,
            token,
        } => {
            let hints = ClientHints {
                client_id: client,
                process_name: process,
                pid,
            };
            cmd_authorize(&config, hints, &endpoint, token).await
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_decision(s: &str) -> std::result::Result<ConsentDecision, String> {
    match s.parse::<ConsentDecision>().map_err(|e| e.to_string())? {
        // A session grant is bound to one daemon run; this process is not it.
        ConsentDecision::AllowSession => {
            Err("session grants can only be made from a consent prompt".to_string())
        }
        decision => Ok(decision),
    }
}

fn cmd_grants(config: &Config, client: Option<&str>) -> Result<()> {
    let permissions = open_store(config)?.permissions();
    let grants = match client {
        Some(client) => permissions.list_client(&ClientIdentity::from_key(client))?,
        None => permissions.list()?,
    };

    if grants.is_empty() {
        println!("No grants found.");
        return Ok(());
    }

    println!(
        "{:<24}  {:<28}  {:<18}  {:>4}  LAST USED",
        "CLIENT", "ENDPOINT", "DECISION", "REV"
    );
    println!("{}", "-".repeat(96));

    for grant in grants {
        print_grant(&grant);
    }
    Ok(())
}

fn print_grant(grant: &Grant) {
    let decision = if grant.consumed {
        format!("{} (used)", grant.decision)
    } else {
        grant.decision.to_string()
    };
    let last_used = grant
        .last_used_at
        .map(|at| local_time(at, "%Y-%m-%d %H:%M"))
        .unwrap_or_else(|| "never".to_string());
    println!(
        "{:<24}  {:<28}  {:<18}  {:>4}  {last_used}",
        grant.client.key(),
        grant.endpoint.to_string(),
        decision,
        grant.revision
    );
}

fn cmd_revoke(config: &Config, client: &str, endpoint: Option<&str>) -> Result<()> {
    let permissions = open_store(config)?.permissions();
    let client = ClientIdentity::from_key(client);

    let revoked = match endpoint {
        Some(endpoint) => {
            let endpoint = parse_endpoint(endpoint)?;
            usize::from(permissions.revoke_endpoint(&client, &endpoint)?.is_some())
        }
        None => permissions.revoke(&client)?.len(),
    };

    if revoked == 0 {
        println!("No grants to revoke for {client}.");
    } else {
        println!("Revoked {revoked} grant(s) for {client}.");
    }
    Ok(())
}

fn cmd_grant(
    config: &Config,
    client: &str,
    endpoint: &str,
    decision: ConsentDecision,
) -> Result<()> {
    let endpoint = parse_endpoint(endpoint)?;
    match load_registry(config)?.classify(&endpoint) {
        Some(Visibility::Protected) => {}
        Some(Visibility::Public) => {
            return Err(Error::Usage(format!(
                "{endpoint} is public and needs no grant"
            )));
        }
        None => return Err(Error::UnknownEndpoint(endpoint.to_string())),
    }

    let store = create_store(config)?;
    let client = ClientIdentity::from_key(client);
    // parse_decision refuses session grants, so the epoch is never read.
    let grant = store
        .permissions()
        .put(Grant::new(&client, &endpoint, decision, 0))?;
    println!(
        "Stored {} for {client} on {endpoint} (revision {}).",
        grant.decision, grant.revision
    );
    Ok(())
}

fn cmd_audit(config: &Config, client: Option<&str>, limit: usize) -> Result<()> {
    let audit = open_store(config)?.audit();
    let events = match client {
        Some(client) => {
            let mut events = audit.events_for_client(&ClientIdentity::from_key(client))?;
            let skip = events.len().saturating_sub(limit);
            events.drain(..skip);
            events
        }
        None => audit.recent(limit)?,
    };

    if events.is_empty() {
        println!("No audit events found.");
        return Ok(());
    }

    for event in events {
        print_event(&event);
    }
    Ok(())
}

fn print_event(event: &AuditEvent) {
    let time = local_time(event.timestamp, "%Y-%m-%d %H:%M:%S");
    let mut line = format!(
        "[{time}] {:<12} {} {}",
        event.action.as_str(),
        event.client,
        event.endpoint
    );
    if let Some(decision) = event.decision {
        line.push_str(&format!(" {decision}"));
    }
    if let Some(detail) = &event.detail {
        line.push_str(&format!(" {detail}"));
    }
    println!("{line}");
}

fn cmd_endpoints(config: &Config) -> Result<()> {
    let registry = load_registry(config)?;

    println!("{:<32}  {:<7}  {:<10}  PERMISSIONS", "ENDPOINT", "METHOD", "ACCESS");
    println!("{}", "-".repeat(80));

    for (endpoint, visibility) in registry.endpoints() {
        let (method, permissions) = registry
            .describe(&endpoint)
            .map(|spec| (spec.method.as_str(), spec.permissions.join(", ")))
            .unwrap_or(("", String::new()));
        let access = match visibility {
            Visibility::Public => "public",
            Visibility::Protected => "protected",
        };
        println!(
            "{:<32}  {:<7}  {:<10}  {permissions}",
            endpoint.to_string(),
            method,
            access
        );
    }
    Ok(())
}

fn cmd_reset_secret(config: &Config) -> Result<()> {
    let path = config.secret_path();
    TokenCodec::reset(&path)?;
    println!("Token key replaced at {}.", path.display());
    println!("All previously issued tokens are now invalid.");
    Ok(())
}

async fn cmd_authorize(
    config: &Config,
    hints: ClientHints,
    endpoint: &str,
    token: Option<String>,
) -> Result<()> {
    let endpoint = parse_endpoint(endpoint)?;
    let store = create_store(config)?;
    let codec = TokenCodec::load_or_create(config.secret_path())?;
    let ctx = Context::builder(store, codec)
        .settings(config.settings())
        .registry(load_registry(config)?)
        .build();
    let gateway = Gateway::new(ctx);

    let mut request = AuthRequest::new(hints, endpoint);
    if let Some(token) = token {
        request = request.with_token(Token::new(token));
    }

    let verdict = tokio::select! {
        verdict = gateway.authorize(request) => verdict?,
        _ = tokio::signal::ctrl_c() => {
            gateway.shutdown().await;
            return Err(Error::Rejected(RejectReason::Cancelled));
        }
    };

    match verdict {
        Verdict::Allow { decision, token } => {
            match decision {
                Some(decision) => println!("allowed ({decision})"),
                None => println!("allowed (public)"),
            }
            if let Some(token) = token {
                println!("token: {token}");
            }
            Ok(())
        }
        Verdict::Reject { reason, token } => {
            if let Some(invalid) = token {
                eprintln!("presented token was not accepted: {invalid}");
            }
            Err(Error::Rejected(reason))
        }
    }
}

fn parse_endpoint(path: &str) -> Result<EndpointRef> {
    EndpointRef::parse(path).ok_or_else(|| Error::InvalidEndpoint(path.to_string()))
}

fn load_registry(config: &Config) -> Result<EndpointRegistry> {
    let mut registry = EndpointRegistry::with_builtins();
    if let Some(dir) = &config.plugins_dir {
        let loaded = registry.load_dir(dir)?;
        tracing::debug!(dir = %dir.display(), plugins = loaded, "loaded plugin manifests");
    }
    Ok(registry)
}

/// Open an existing database.
fn open_store(config: &Config) -> Result<Store> {
    let path = config.db_path();
    if !path.exists() {
        return Err(Error::DatabaseNotFound { path });
    }
    Ok(Store::open(&path)?)
}

/// Open the database, creating it and the data directory if needed.
fn create_store(config: &Config) -> Result<Store> {
    let path = config.db_path();
    ensure_parent(&path)?;
    Ok(Store::open(&path)?)
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn local_time(at: DateTime<Utc>, format: &str) -> String {
    at.with_timezone(&Local).format(format).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn decision_parser_refuses_session() {
        assert_eq!(parse_decision("always"), Ok(ConsentDecision::AllowAlways));
        assert_eq!(parse_decision("once"), Ok(ConsentDecision::AllowOnce));
        assert_eq!(parse_decision("deny"), Ok(ConsentDecision::Deny));
        assert!(parse_decision("session").is_err());
        assert!(parse_decision("maybe").is_err());
    }

    #[test]
    fn parses_authorize_flags() {
        let cli = Cli::try_parse_from([
            "gatehouse",
            "authorize",
            "/demo/execute",
            "--process",
            "app-a",
            "--pid",
            "42",
        ])
        .unwrap();
        let Commands::Authorize { process, pid, .. } = cli.command else {
            panic!("expected authorize");
        };
        assert_eq!(process.as_deref(), Some("app-a"));
        assert_eq!(pid, Some(42));

        assert!(
            Cli::try_parse_from(["gatehouse", "authorize", "/demo/execute", "--process", "x"])
                .is_err()
        );
    }

    #[test]
    fn grant_then_revoke_through_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            data_dir: Some(dir.path().join("data")),
            ..Default::default()
        };

        assert!(matches!(
            cmd_grants(&config, None),
            Err(Error::DatabaseNotFound { .. })
        ));

        cmd_grant(&config, "app-a", "/demo/execute", ConsentDecision::AllowAlways).unwrap();
        let store = open_store(&config).unwrap();
        let grant = store
            .permissions()
            .get(&ClientIdentity::named("app-a"), &EndpointRef::new("demo", "/execute"))
            .unwrap()
            .unwrap();
        assert_eq!(grant.decision, ConsentDecision::AllowAlways);

        cmd_revoke(&config, "app-a", None).unwrap();
        let grant = store.permissions().list().unwrap().remove(0);
        assert_eq!(grant.decision, ConsentDecision::Deny);
    }

    #[test]
    fn grant_rejects_public_and_unknown_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            data_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        assert!(matches!(
            cmd_grant(&config, "app-a", "/demo/ping", ConsentDecision::AllowAlways),
            Err(Error::Usage(_))
        ));
        assert!(matches!(
            cmd_grant(&config, "app-a", "/demo/nope", ConsentDecision::AllowAlways),
            Err(Error::UnknownEndpoint(_))
        ));
        assert!(matches!(
            cmd_grant(&config, "app-a", "nope", ConsentDecision::AllowAlways),
            Err(Error::InvalidEndpoint(_))
        ));
    }
}
