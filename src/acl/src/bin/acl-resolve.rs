//! acl-resolve - resolve a token against a state fixture and print decisions
//!
//! ```text
//! acl-resolve --state state.json --token s3cr3t \
//!     --check node:web-1:write --check key:app/:list
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use cretoai_acl::{
    Access, AclResolver, AclResolverConfig, AuthorityState, InMemoryAuthority, Resource,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Checks printed when none are requested
const DEFAULT_CHECKS: &[&str] = &[
    "acl::read",
    "acl::write",
    "operator::read",
    "node::read",
    "service::read",
    "key::write",
];

/// Resolve an ACL token and print its decisions
#[derive(Parser)]
#[command(name = "acl-resolve")]
#[command(about = "Resolve an ACL token against a state fixture and print its decisions")]
#[command(version)]
struct Cli {
    /// Resolver configuration (TOML)
    #[arg(short, long, env = "ACL_RESOLVE_CONFIG")]
    config: Option<PathBuf>,

    /// Authority state fixture (JSON)
    #[arg(short, long, env = "ACL_RESOLVE_STATE")]
    state: PathBuf,

    /// Token secret to resolve; empty resolves the anonymous token
    #[arg(short, long, env = "ACL_TOKEN", default_value = "")]
    token: String,

    /// Datacenter when no configuration file is given
    #[arg(long, default_value = "dc1")]
    datacenter: String,

    /// Check to print, as resource:segment:access (repeatable)
    #[arg(short = 'k', long = "check")]
    checks: Vec<String>,

    /// Print resolver metrics after resolving
    #[arg(long)]
    metrics: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_check(raw: &str) -> Result<(Resource, String, Access)> {
    let mut parts = raw.splitn(3, ':');
    let (Some(resource), Some(segment), Some(access)) = (parts.next(), parts.next(), parts.next())
    else {
        anyhow::bail!("check {:?} is not of the form resource:segment:access", raw);
    };

    let resource: Resource = serde_json::from_value(resource.into())
        .with_context(|| format!("unknown resource {:?}", resource))?;
    let access: Access = serde_json::from_value(access.into())
        .with_context(|| format!("unknown access level {:?}", access))?;

    Ok((resource, segment.to_string(), access))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{},cretoai_acl={}", log_level, log_level).into()),
        )
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    let config = match &cli.config {
        Some(path) => {
            let config = AclResolverConfig::from_file(path)?;
            info!("Loaded configuration from {:?}", path);
            config
        }
        None => AclResolverConfig::new(cli.datacenter.clone()),
    };

    let state = AuthorityState::from_file(&cli.state)?;
    let authority = Arc::new(InMemoryAuthority::from_state(config.datacenter.clone(), state));
    let resolver = AclResolver::new(config, authority).context("Failed to build resolver")?;

    let checks = if cli.checks.is_empty() {
        DEFAULT_CHECKS.iter().map(|check| check.to_string()).collect()
    } else {
        cli.checks.clone()
    };
    let checks = checks
        .iter()
        .map(|raw| parse_check(raw))
        .collect::<Result<Vec<_>>>()?;

    let resolved = resolver
        .resolve_token_with_identity(&cli.token)
        .await
        .context("Failed to resolve token")?;

    let Some(resolved) = resolved else {
        println!("ACLs disabled: every operation is allowed");
        return Ok(());
    };

    println!("accessor: {}", resolved.accessor_id());
    for (resource, segment, access) in &checks {
        let decision = resolved.authorizer.enforce(*resource, segment, *access);
        let label = if segment.is_empty() {
            format!("{}:{}", resource, access)
        } else {
            format!("{}:{}:{}", resource, segment, access)
        };
        println!("  {:<32} {}", label, decision);
    }

    if cli.metrics {
        print!("{}", resolver.metrics().render());
    }

    resolver.close();
    Ok(())
}
