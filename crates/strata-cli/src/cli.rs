use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "Strata CLI: inspect and invalidate a two-tier cache")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to a strata.toml config file
    #[arg(short, long, global = true, env = "STRATA_CONFIG")]
    pub config: Option<String>,

    /// Output format
    #[arg(short, long, global = true)]
    pub format: Option<OutputFormat>,

    /// Emit cache logs at the configured level instead of warnings only
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Json,
    Table,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check that the shared tier is reachable
    Ping,
    /// Read a cached value
    Get(GetArgs),
    /// Write a JSON value
    Set(SetArgs),
    /// Delete one or more keys
    Del(DelArgs),
    /// Delete every key matching a glob (`*`, `?`)
    Invalidate(InvalidateArgs),
    /// Remove every key under the configured prefix
    Clear,
    /// Show store statistics
    Stats,
}

#[derive(clap::Args)]
pub struct GetArgs {
    /// Cache key (e.g. org:42:plan)
    pub key: String,
    /// Print the full entry including tags, etag and write time
    #[arg(long)]
    pub entry: bool,
}

#[derive(clap::Args)]
pub struct SetArgs {
    /// Cache key
    pub key: String,
    /// Value as JSON (e.g. '{"tier":"pro"}')
    pub value: String,
    /// Time to live in milliseconds (defaults to store.default_ttl_ms)
    #[arg(long)]
    pub ttl_ms: Option<u64>,
    /// Tags attached to the entry
    #[arg(long = "tag")]
    pub tags: Vec<String>,
}

#[derive(clap::Args)]
pub struct DelArgs {
    /// Keys to delete
    #[arg(required = true)]
    pub keys: Vec<String>,
}

#[derive(clap::Args)]
pub struct InvalidateArgs {
    /// Key glob (e.g. org:42:*)
    pub pattern: String,
    /// Only list matching keys, do not delete
    #[arg(long)]
    pub dry_run: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_set_with_ttl_and_tags() {
        let cli = Cli::try_parse_from([
            "strata", "set", "org:42:plan", r#"{"tier":"pro"}"#, "--ttl-ms", "5000", "--tag", "org:42",
        ])
        .unwrap();
        match cli.command {
            Commands::Set(args) => {
                assert_eq!(args.key, "org:42:plan");
                assert_eq!(args.ttl_ms, Some(5000));
                assert_eq!(args.tags, vec!["org:42"]);
            }
            _ => panic!("expected set"),
        }
    }

    #[test]
    fn test_del_requires_keys() {
        assert!(Cli::try_parse_from(["strata", "del"]).is_err());
    }
}
