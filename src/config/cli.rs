use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the artifact-cache binary.
#[derive(Debug, Parser)]
#[command(
    name = "artifact-cache",
    version,
    about = "Inspect and drive the incremental artifact cache"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "ARTIFACT_CACHE_CONFIG_FILE",
        value_name = "PATH",
        value_hint = ValueHint::FilePath,
        global = true
    )]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: GlobalOverrides,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Look up a cached artifact.
    Get(GetArgs),
    /// Store an artifact read from a file.
    Put(PutArgs),
    /// Revalidate one or more tags.
    Revalidate(RevalidateArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct GlobalOverrides {
    /// Override the durable store base URL.
    #[arg(long = "store-url", value_name = "URL", global = true)]
    pub store_url: Option<String>,

    /// Override the durable store bearer token.
    #[arg(long = "store-token", value_name = "TOKEN", global = true)]
    pub store_token: Option<String>,

    /// Override the key namespace (e.g. a build id).
    #[arg(long = "store-namespace", value_name = "NAME", global = true)]
    pub store_namespace: Option<String>,

    /// Override the store request timeout.
    #[arg(long = "store-timeout-ms", value_name = "MILLIS", global = true)]
    pub store_timeout_ms: Option<u64>,

    /// Override the CDN purge endpoint.
    #[arg(long = "purge-url", value_name = "URL", global = true)]
    pub purge_url: Option<String>,

    /// Override the CDN purge bearer token.
    #[arg(long = "purge-token", value_name = "TOKEN", global = true)]
    pub purge_token: Option<String>,

    /// Override the per-request memo budget in bytes (0 disables it).
    #[arg(long = "memory-budget-bytes", value_name = "BYTES", global = true)]
    pub memory_budget_bytes: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Clone)]
pub struct GetArgs {
    /// Cache key of the artifact.
    pub key: String,

    /// Explicit tag the lookup depends on (repeatable).
    #[arg(long = "tag", value_name = "TAG")]
    pub tags: Vec<String>,

    /// Implicit tag the lookup depends on (repeatable).
    #[arg(long = "soft-tag", value_name = "TAG")]
    pub soft_tags: Vec<String>,

    /// Return tag-invalidated entries marked stale instead of a miss.
    #[arg(long = "allow-stale", action = clap::ArgAction::SetTrue)]
    pub allow_stale: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PutKind {
    Route,
    Page,
    Fetch,
}

#[derive(Debug, Args, Clone)]
pub struct PutArgs {
    /// Cache key of the artifact.
    pub key: String,

    /// Payload shape of the artifact.
    #[arg(long, value_enum)]
    pub kind: PutKind,

    /// File holding the body (HTML for pages).
    #[arg(long, value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub file: PathBuf,

    /// Freshness window in seconds; omitted means tag invalidation only.
    #[arg(long, value_name = "SECONDS")]
    pub revalidate: Option<u32>,

    /// Explicit tag (repeatable).
    #[arg(long = "tag", value_name = "TAG")]
    pub tags: Vec<String>,

    /// Response status for route and fetch artifacts.
    #[arg(long, default_value_t = 200)]
    pub status: u16,

    /// Content type recorded in the artifact headers.
    #[arg(long = "content-type", value_name = "TYPE")]
    pub content_type: Option<String>,

    /// Source URL of a fetch artifact; defaults to the key.
    #[arg(long, value_name = "URL")]
    pub url: Option<String>,

    /// Treat the write as an on-demand revalidation and purge its default tag.
    #[arg(long = "on-demand", action = clap::ArgAction::SetTrue)]
    pub on_demand: bool,
}

#[derive(Debug, Args, Clone)]
pub struct RevalidateArgs {
    /// Tags to revalidate.
    #[arg(required = true, value_name = "TAG")]
    pub tags: Vec<String>,
}
