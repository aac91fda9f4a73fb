use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(version, about = "skywatch cloud monitoring agent")]
pub struct Args {
    /// Base directory: configuration, local data, the agent status file
    #[clap(long, env = "SKYWATCH_BASE_DIR", default_value = ".")]
    pub base_dir: PathBuf,

    /// Log/debug directory; defaults to `<base-dir>/logs`
    #[clap(long, env = "SKYWATCH_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Extra `key=value` pairs layered over agent.properties
    #[clap(short = 'D', long = "define", value_name = "KEY=VALUE")]
    pub defines: Vec<String>,

    /// Skip TLS peer verification towards cloud tunnels with self-issued
    /// certificates
    #[clap(long, env = "SKYWATCH_INSECURE_TLS", default_value_t = false)]
    pub insecure_tls: bool,

    /// Keep quiet and only log errors
    #[clap(short, long, conflicts_with = "verbose", default_value_t = false)]
    pub quiet: bool,

    #[clap(
        short = 'v',
        long,
        conflicts_with = "quiet",
        action = clap::ArgAction::Count,
        help = "Output details about requests and responses; repeat for more"
    )]
    pub verbose: u8,
}

impl Args {
    pub fn log_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| self.base_dir.join("logs"))
    }

    /// The `-D` overrides as parsed pairs; malformed entries are dropped.
    pub fn define_pairs(&self) -> Vec<(String, String)> {
        self.defines
            .iter()
            .filter_map(|entry| {
                entry
                    .split_once('=')
                    .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            })
            .collect()
    }
}
