//! stord CLI
//!
//! Entry point for the `stord` storage service. `stord rpc` serves the
//! JSON-lines protocol on stdin/stdout; the remaining subcommands run a
//! single operation for administration and debugging.

use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use stord::config::DEFAULT_CONFIG_PATH;
use stord::{logging, Caller, EffectiveConfig, ServiceConfig, StorageService};
use stord_core::disk::StatvfsFreeSpace;
use stord_core::quota::KernelQuota;
use stord_core::rpc::RpcHandler;
use stord_core::selinux::{CommandLabeler, NoopLabeler};
use stord_protocol::flags::{
    FLAG_FORCE, FLAG_FREE_CACHE_NOOP, FLAG_FREE_CACHE_V2, FLAG_FREE_CACHE_V2_DEFY_QUOTA,
    FLAG_USE_QUOTA,
};
use stord_protocol::ops::{FixupAppDataRequest, FreeCacheRequest, GetUserSizeRequest};
use tracing::{error, warn};

#[derive(Parser)]
#[command(name = "stord")]
#[command(about = "Per-app storage management service", version)]
struct Cli {
    /// Path to config file (default: /etc/stord/stord.toml if present)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Override the primary data root
    #[arg(long, global = true)]
    data_root: Option<PathBuf>,

    /// Permit the reserved test volume
    #[arg(long, global = true)]
    debuggable: bool,

    /// Skip SELinux relabeling
    #[arg(long, global = true)]
    no_selinux: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve JSON-lines requests on stdin, responses on stdout
    Rpc,

    /// Evict cache until the target amount of space is free
    FreeCache {
        /// Volume UUID (default: internal storage)
        #[arg(long)]
        uuid: Option<String>,

        /// Bytes that must be free when done
        #[arg(long)]
        target: i64,

        /// Bytes of cache each app may keep regardless of quota
        #[arg(long, default_value_t = 0)]
        reserved: i64,

        /// Keep evicting past quota once every app is under it
        #[arg(long)]
        defy_quota: bool,

        /// Plan the run without deleting anything
        #[arg(long)]
        noop: bool,
    },

    /// Converge cache ownership left over from older layouts
    Fixup {
        #[arg(long)]
        uuid: Option<String>,

        /// Visit subtrees that already look correct
        #[arg(long)]
        force: bool,
    },

    /// Report storage used by a user and its apps
    UserSize {
        #[arg(long)]
        uuid: Option<String>,

        #[arg(long, default_value_t = 0)]
        user: u32,

        /// App ids to account (comma-separated)
        #[arg(long, value_delimiter = ',')]
        app_ids: Vec<u32>,

        /// Use filesystem quotas where available
        #[arg(long)]
        quota: bool,
    },

    /// Report a user's external storage breakdown
    ExternalSize {
        #[arg(long)]
        uuid: Option<String>,

        #[arg(long, default_value_t = 0)]
        user: u32,

        #[arg(long, value_delimiter = ',')]
        app_ids: Vec<u32>,

        #[arg(long)]
        quota: bool,
    },

    /// Report whether a volume has quota accounting
    QuotaSupported {
        #[arg(long)]
        uuid: Option<String>,
    },

    /// Print service state
    Dump,

    /// Print the effective configuration and where it came from
    Config,
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = logging::init() {
        eprintln!("Error initializing logging: {}", e);
    }

    let effective = match load_config(&cli) {
        Ok(effective) => effective,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            process::exit(1);
        }
    };

    let config = match effective.service_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            process::exit(1);
        }
    };

    let service = build_service(config, cli.no_selinux);
    let caller = Caller::new(nix::unistd::geteuid().as_raw());

    match cli.command {
        Commands::Rpc => {
            let handler = RpcHandler::new(Arc::new(service));
            if let Err(e) = handler.run() {
                error!(error = %e, "rpc session failed");
                process::exit(1);
            }
        }
        Commands::FreeCache {
            uuid,
            target,
            reserved,
            defy_quota,
            noop,
        } => {
            let mut flags = FLAG_FREE_CACHE_V2;
            if defy_quota {
                flags |= FLAG_FREE_CACHE_V2_DEFY_QUOTA;
            }
            if noop {
                flags |= FLAG_FREE_CACHE_NOOP;
            }
            let request = FreeCacheRequest {
                volume_uuid: uuid,
                target_free_bytes: target,
                cache_reserved_bytes: reserved,
                flags,
            };
            exit_with(service.free_cache(caller, &request));
        }
        Commands::Fixup { uuid, force } => {
            let request = FixupAppDataRequest {
                volume_uuid: uuid,
                flags: if force { FLAG_FORCE } else { 0 },
            };
            exit_with(service.fixup_app_data(caller, &request));
        }
        Commands::UserSize {
            uuid,
            user,
            app_ids,
            quota,
        } => {
            let request = size_request(uuid, user, app_ids, quota);
            exit_with(service.get_user_size(&request));
        }
        Commands::ExternalSize {
            uuid,
            user,
            app_ids,
            quota,
        } => {
            let request = size_request(uuid, user, app_ids, quota);
            exit_with(service.get_external_size(&request));
        }
        Commands::QuotaSupported { uuid } => {
            exit_with(service.is_quota_supported(uuid.as_deref()));
        }
        Commands::Dump => {
            print!("{}", service.dump());
        }
        Commands::Config => print_json(&effective),
    }
}

/// Defaults, then the config file, then command-line flags.
fn load_config(cli: &Cli) -> Result<EffectiveConfig, stord::ConfigError> {
    let default_path = Path::new(DEFAULT_CONFIG_PATH);
    let file = match &cli.config {
        Some(path) => Some(path.as_path()),
        None if default_path.exists() => Some(default_path),
        None => None,
    };

    let mut overrides = serde_json::Map::new();
    if let Some(root) = &cli.data_root {
        overrides.insert(
            "data_root".to_string(),
            serde_json::Value::String(root.to_string_lossy().to_string()),
        );
    }
    if cli.debuggable {
        overrides.insert("debuggable".to_string(), serde_json::Value::Bool(true));
    }
    let overrides = if overrides.is_empty() {
        None
    } else {
        Some(serde_json::Value::Object(overrides))
    };

    EffectiveConfig::build(file, overrides)
}

fn build_service(config: ServiceConfig, no_selinux: bool) -> StorageService {
    let builder = StorageService::builder(config)
        .quota(KernelQuota)
        .free_space(StatvfsFreeSpace);
    let service = if no_selinux {
        builder.labeler(NoopLabeler).build()
    } else {
        builder.labeler(CommandLabeler::default()).build()
    };
    if let Err(e) = service.invalidate_mounts(Caller::system()) {
        warn!(error = %e, "failed to read mount table; quota accounting disabled");
    }
    service
}

fn size_request(uuid: Option<String>, user: u32, app_ids: Vec<u32>, quota: bool) -> GetUserSizeRequest {
    GetUserSizeRequest {
        volume_uuid: uuid,
        user_id: user,
        flags: if quota { FLAG_USE_QUOTA } else { 0 },
        app_ids,
    }
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("Error serializing output: {}", e);
            process::exit(1);
        }
    }
}

fn exit_with<T: Serialize>(result: stord_core::StorageResult<T>) {
    match result {
        Ok(value) => print_json(&value),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}
