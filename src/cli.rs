use clap::{Parser, ValueEnum};

/// Connectivity probing and offline write queue for the fortune app backend
#[derive(Parser, Debug)]
#[command(
    about,
    long_about = None,
    version = concat!("v", env!("CARGO_PKG_VERSION")),
    disable_version_flag = true
)]
pub struct Cli {
    /// Optional config file. Defaults to '~/.fortune-sync.cfg'.
    #[arg(long, default_value = "~/.fortune-sync.cfg")]
    pub config: String,

    /// Backend REST base url. Overrides api_url from the config file.
    #[arg(long)]
    pub api_url: Option<String>,

    /// Backend api key; uses api_key from the config file by default.
    #[arg(long)]
    pub key: Option<String>,

    /// Offline database file. Defaults to '~/.fortune-sync/offline.db'.
    #[arg(long)]
    pub database: Option<String>,

    /// Run one health probe against the backend, then exits.
    #[arg(long)]
    pub probe: bool,

    /// Prints connection state and offline queue statistics, then exits.
    #[arg(long)]
    pub status: bool,

    /// Queue a write of the given kind (create_wish, save_fortune, update_profile, share_fortune, react_to_fortune). Requires --payload.
    #[arg(long, value_name = "KIND", requires = "payload")]
    pub enqueue: Option<String>,

    /// JSON payload for --enqueue.
    #[arg(long, value_name = "JSON")]
    pub payload: Option<String>,

    /// Probe the backend and replay queued writes if it is reachable, then exits.
    #[arg(long)]
    pub sync: bool,

    /// Keep probing in the background and replay queued writes whenever connectivity returns.
    #[arg(long)]
    pub watch: bool,

    /// Prints queued writes as a JSON array of {type, data, timestamp}, then exits.
    #[arg(long)]
    pub export_queue: bool,

    /// Appends writes from a JSON array of {type, data, timestamp} to the queue, then exits.
    #[arg(long, value_name = "FILE")]
    pub import_queue: Option<String>,

    /// Format output. Defaults to "text".
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub output: OutputFormat,

    /// Turns on debug messages.
    #[arg(long)]
    pub verbose: bool,

    /// Print version information and exit
    #[arg(long)]
    pub version: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

impl Cli {
    pub fn json_output(&self) -> bool {
        self.output == OutputFormat::Json
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["fortune-sync"]).unwrap();
        assert_eq!(cli.config, "~/.fortune-sync.cfg");
        assert_eq!(cli.output, OutputFormat::Text);
        assert!(!cli.probe && !cli.status && !cli.sync && !cli.watch);
    }

    #[test]
    fn test_enqueue_requires_payload() {
        assert!(Cli::try_parse_from(["fortune-sync", "--enqueue", "create_wish"]).is_err());

        let cli = Cli::try_parse_from([
            "fortune-sync",
            "--enqueue",
            "create_wish",
            "--payload",
            r#"{"text":"a"}"#,
        ])
        .unwrap();
        assert_eq!(cli.enqueue.as_deref(), Some("create_wish"));
        assert_eq!(cli.payload.as_deref(), Some(r#"{"text":"a"}"#));
    }

    #[test]
    fn test_output_format() {
        let cli = Cli::try_parse_from(["fortune-sync", "--status", "--output", "json"]).unwrap();
        assert!(cli.json_output());
        assert!(Cli::try_parse_from(["fortune-sync", "--output", "xml"]).is_err());
    }
}
