// src/config.rs
use clap::Parser;
use std::env;
use std::path::PathBuf;

pub const DEFAULT_DEBIT_PERIOD_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct Config {
    pub environment: String,
    pub rpc_listen: String,
    pub http_listen: String,
    pub redis_url: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub default_tenant: String,
    pub debit_period_secs: u64,
}

/// Command line overrides for the env-based configuration.
#[derive(Debug, Parser)]
#[command(name = "apolo-rating-engine", about = "Real-time rating and balance engine")]
pub struct CliArgs {
    /// Folder with the tariff CSV files to load at startup
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// JSON-RPC TCP listen address
    #[arg(long)]
    pub rpc_listen: Option<String>,

    /// Admin HTTP listen address
    #[arg(long)]
    pub http_listen: Option<String>,

    /// Redis URL for the rating/accounting backend (in-memory when absent)
    #[arg(long)]
    pub redis_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        dotenv::dotenv().ok();

        Ok(Config {
            environment: env::var("ENVIRONMENT")
                .unwrap_or_else(|_| "production".to_string()),
            rpc_listen: env::var("RPC_LISTEN")
                .unwrap_or_else(|_| "127.0.0.1:2012".to_string()),
            http_listen: env::var("HTTP_LISTEN")
                .unwrap_or_else(|_| "127.0.0.1:2080".to_string()),
            redis_url: env::var("REDIS_URL").ok(),
            data_dir: env::var("DATA_DIR").ok().map(PathBuf::from),
            default_tenant: env::var("DEFAULT_TENANT")
                .unwrap_or_else(|_| "cgrates.org".to_string()),
            debit_period_secs: env::var("DEBIT_PERIOD_SECS")
                .unwrap_or_else(|_| DEFAULT_DEBIT_PERIOD_SECS.to_string())
                .parse()?,
        })
    }

    pub fn merge_args(mut self, args: CliArgs) -> Self {
        if let Some(dir) = args.data_dir {
            self.data_dir = Some(dir);
        }
        if let Some(addr) = args.rpc_listen {
            self.rpc_listen = addr;
        }
        if let Some(addr) = args.http_listen {
            self.http_listen = addr;
        }
        if let Some(url) = args.redis_url {
            self.redis_url = Some(url);
        }
        self
    }
}
