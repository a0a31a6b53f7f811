pub mod audit;
pub mod classify;
pub mod config;
pub mod enforce;
pub mod error;
pub mod guest;
pub mod kernel;
pub mod leases;
pub mod lock;
pub mod policy;
pub mod reconcile;
pub mod stale;
pub mod topology;

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use config::Settings;
use error::{Error, Result};
use kernel::memory::MemoryKernel;
use policy::{DryRunControlPlane, HttpControlPlane};
use reconcile::Session;

/// Household bandwidth-lane and DNS-posture enforcement.
///
/// Without flags, runs a single reconciliation pass and exits.
#[derive(Debug, Parser)]
#[command(name = "lanekeeper", version)]
struct Cli {
    /// Run forever: scheduled passes plus lease-change wakeups.
    #[arg(long)]
    daemon: bool,

    /// Dry run against an in-memory kernel. Fetches desired state but
    /// changes nothing: no tc, no iptables, no notifications.
    #[arg(long)]
    test: bool,

    /// Print current kernel and session state as JSON.
    #[arg(long)]
    status: bool,

    /// Remove every rule, chain, and cached state this tool manages.
    #[arg(long)]
    reset: bool,

    /// Rebuild the lane hierarchy even when it looks healthy.
    #[arg(long)]
    force: bool,

    /// Steer one leased device onto the guest lane immediately.
    #[arg(long, value_name = "IP")]
    apply_guest: Option<Ipv4Addr>,

    /// Register this router with the control plane and store the returned
    /// household id in the settings document.
    #[arg(long, value_name = "EMAIL")]
    setup: Option<String>,

    /// Settings document path.
    #[arg(long, value_name = "PATH", default_value = "/etc/lanekeeper/config.json")]
    config: PathBuf,
}

pub fn run() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!("PANIC in lanekeeper: {info}");
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_filter = if cli.test {
        "lanekeeper=debug"
    } else {
        "lanekeeper=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    match execute(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}: {e}", e.kind());
            ExitCode::FAILURE
        }
    }
}

fn execute(cli: &Cli) -> Result<()> {
    if let Some(email) = &cli.setup {
        return setup_household(&cli.config, email);
    }

    let settings = Settings::load(&cli.config)?;

    if cli.test {
        return dry_run(settings, cli.force);
    }

    let session = Session::new(settings)?;
    if cli.status {
        let report = session.status_report()?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    if cli.reset {
        return session.reset();
    }
    if let Some(ip) = cli.apply_guest {
        session.apply_guest_override(ip)?;
        tracing::info!("{ip} steered to the guest lane");
        return Ok(());
    }
    if cli.daemon {
        return session.run_daemon(cli.force);
    }

    session.run_pass(cli.force).map(|_| ())
}

/// Full pass against a blank in-memory kernel. Exercises settings, lease
/// and registry parsing, the control-plane fetch, and classification, then
/// prints what the kernel would look like.
fn dry_run(mut settings: Settings, force: bool) -> Result<()> {
    let tmp = std::env::temp_dir();
    settings.lock_file = tmp.join("lanekeeper-dryrun.lock");
    settings.state_file = tmp.join("lanekeeper-dryrun-state.json");
    // A leftover state file would suppress guest reporting in the output.
    let _ = std::fs::remove_file(&settings.state_file);

    let plane = DryRunControlPlane::new(HttpControlPlane::new(
        &settings.server_url,
        &settings.household_id,
    )?);
    let session = Session::with_parts(settings, Arc::new(MemoryKernel::new()), Arc::new(plane));

    session.run_pass(force)?;
    let report = session.status_report()?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// One-shot provisioning: register the router's WAN MAC with the control
/// plane and write the returned household id back into the settings
/// document.
fn setup_household(config_path: &Path, email: &str) -> Result<()> {
    let raw = std::fs::read_to_string(config_path).map_err(|e| {
        Error::ConfigurationMissing(format!(
            "settings document {} not readable: {e}",
            config_path.display()
        ))
    })?;
    let mut doc: serde_json::Value = serde_json::from_str(&raw).map_err(|e| {
        Error::ConfigurationMissing(format!(
            "settings document {} is not valid JSON: {e}",
            config_path.display()
        ))
    })?;

    let server_url = doc
        .get("server_url")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| Error::ConfigurationMissing("server_url must be set before setup".into()))?
        .to_string();
    let wan_ifname = doc
        .get("wan_ifname")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::ConfigurationMissing("wan_ifname must be set before setup".into()))?
        .to_string();

    let mac_path = format!("/sys/class/net/{wan_ifname}/address");
    let router_mac = std::fs::read_to_string(&mac_path)
        .map(|s| leases::normalize_mac(s.trim()))
        .map_err(|e| Error::Io(format!("cannot read {mac_path}: {e}")))?;

    let household_id = HttpControlPlane::register(&server_url, email, &router_mac)?;
    doc["household_id"] = serde_json::Value::String(household_id.clone());
    std::fs::write(config_path, serde_json::to_string_pretty(&doc)?)?;

    tracing::info!("registered household {household_id}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parses_guest_override_ip() {
        let cli = Cli::parse_from(["lanekeeper", "--apply-guest", "192.168.1.50", "--force"]);
        assert_eq!(cli.apply_guest, Some(Ipv4Addr::new(192, 168, 1, 50)));
        assert!(cli.force);
        assert!(!cli.daemon);
    }

    #[test]
    fn test_cli_default_is_single_pass() {
        let cli = Cli::parse_from(["lanekeeper"]);
        assert!(!cli.daemon && !cli.test && !cli.status && !cli.reset && !cli.force);
        assert_eq!(cli.config, PathBuf::from("/etc/lanekeeper/config.json"));
    }
}
