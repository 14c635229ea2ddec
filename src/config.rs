//! Command-line configuration for the server and the `ask` client
//!
//! Secrets can be given through the environment instead of flags.
use anyhow::anyhow;
use chatcierge::openai::DEFAULT_BASE_URL;
use chatcierge::settings::{CompletionSettings, SearchSettings, StreamSettings};
use chatcierge::wire::Framing;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Parser)]
#[command(version, about, long_about = None)]
pub struct Config {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run the recommendation server.
    Serve(ServeArgs),
    /// Ask a running server for recommendations and print them as they stream in.
    Ask(AskArgs),
}

#[derive(Clone, Args)]
pub struct ServeArgs {
    /// The port on which the server will listen.
    #[arg(short = 'p', long, default_value_t = 3000)]
    pub port: u16,

    /// The port on which the metrics server will listen.
    #[arg(long, default_value_t = 9090)]
    pub metrics_port: u16,

    /// Whether to enable the metrics endpoint.
    #[arg(short = 'm', long, default_value_t = true)]
    pub metrics: bool,

    /// The prefix to use for metrics.
    #[arg(long, default_value = "chatcierge")]
    pub metrics_prefix: String,

    #[arg(long, env = "OPENAI_API_KEY")]
    pub openai_key: String,

    #[arg(long, env = "OPENAI_ORGANIZATION")]
    pub openai_organization: Option<String>,

    #[arg(long, default_value = DEFAULT_BASE_URL)]
    pub openai_base_url: Url,

    #[arg(long, env = "SUPABASE_URL")]
    pub supabase_url: Option<Url>,

    #[arg(long, env = "SUPABASE_KEY")]
    pub supabase_key: Option<String>,

    /// A JSON hotel catalog to search instead of Supabase.
    #[arg(short = 'f', long)]
    pub catalog: Option<PathBuf>,

    /// Whether we should continue watching the catalog file for changes.
    #[arg(short = 'w', long, default_value_t = true)]
    pub watch: bool,

    /// How recommendation fragments are separated on the wire.
    #[arg(long, value_enum, default_value_t = Framing::NdJson)]
    pub framing: Framing,

    /// Maximum wait (in seconds) for the next upstream record. 0 waits forever.
    #[arg(long, default_value_t = 30)]
    pub read_timeout_secs: u64,

    #[arg(long, default_value = "text-davinci-003")]
    pub completion_model: String,

    #[arg(long, default_value_t = 2500)]
    pub max_tokens: u32,

    #[arg(long, default_value_t = 0.7)]
    pub temperature: f32,

    #[arg(long, default_value_t = 0.0)]
    pub frequency_penalty: f32,

    #[arg(long, default_value_t = 0.0)]
    pub presence_penalty: f32,

    /// Minimum similarity for a hotel to match a question.
    #[arg(long, default_value_t = 0.75)]
    pub similarity_threshold: f32,

    /// Maximum number of hotels recommended per question.
    #[arg(long, default_value_t = 5)]
    pub match_count: usize,

    /// Maximum number of idle HTTP connections to keep alive per upstream host.
    #[arg(long, default_value_t = 100)]
    pub pool_max_idle_per_host: usize,

    /// How long (in seconds) to keep idle HTTP connections alive.
    #[arg(long, default_value_t = 90)]
    pub pool_idle_timeout_secs: u64,
}

impl std::fmt::Debug for ServeArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServeArgs")
            .field("port", &self.port)
            .field("metrics", &self.metrics)
            .field("metrics_port", &self.metrics_port)
            .field("openai_base_url", &self.openai_base_url.as_str())
            .field("supabase_url", &self.supabase_url.as_ref().map(Url::as_str))
            .field("catalog", &self.catalog)
            .field("watch", &self.watch)
            .field("framing", &self.framing)
            .field("read_timeout_secs", &self.read_timeout_secs)
            .field("completion_model", &self.completion_model)
            .field("match_count", &self.match_count)
            .finish_non_exhaustive()
    }
}

impl ServeArgs {
    pub fn completion_settings(&self) -> CompletionSettings {
        CompletionSettings::builder()
            .model(self.completion_model.as_str())
            .max_tokens(self.max_tokens)
            .temperature(self.temperature)
            .frequency_penalty(self.frequency_penalty)
            .presence_penalty(self.presence_penalty)
            .build()
    }

    pub fn search_settings(&self) -> SearchSettings {
        SearchSettings::builder()
            .similarity_threshold(self.similarity_threshold)
            .match_count(self.match_count)
            .build()
    }

    pub fn stream_settings(&self) -> StreamSettings {
        StreamSettings {
            framing: self.framing,
            read_timeout: (self.read_timeout_secs > 0)
                .then(|| Duration::from_secs(self.read_timeout_secs)),
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct AskArgs {
    /// The question to ask.
    pub question: String,

    /// Base URL of the recommendation server.
    #[arg(long, default_value = "http://localhost:3000/")]
    pub server: Url,

    /// Framing assumed when the server does not announce one.
    #[arg(long, value_enum, default_value_t = Framing::NdJson)]
    pub framing: Framing,

    /// Recommend these hotels instead of letting the server pick. Repeatable.
    #[arg(long = "hotel")]
    pub hotels: Vec<String>,
}

impl Config {
    pub fn validate(self) -> Result<Self, anyhow::Error> {
        if let Command::Serve(args) = &self.command {
            match &args.catalog {
                Some(catalog) if !catalog.exists() => {
                    return Err(anyhow!(
                        "Catalog file '{}' does not exist",
                        catalog.display()
                    ));
                }
                Some(_) => {}
                None if args.supabase_url.is_none() || args.supabase_key.is_none() => {
                    return Err(anyhow!(
                        "Either --catalog or both --supabase-url and --supabase-key are required"
                    ));
                }
                None => {}
            }
            if args.match_count == 0 {
                return Err(anyhow!("--match-count must be at least 1"));
            }
        }
        Ok(self)
    }
}
