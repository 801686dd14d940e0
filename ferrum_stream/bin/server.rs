use async_trait::async_trait;
use chrono::Local;
use clap::Parser;
use ferrum_stream::api::datum::{Datum, Message};
use ferrum_stream::api::map::Mapper;
use ferrum_stream::api::reduce::Reducer;
use ferrum_stream::config::server_config::ServerConfig;
use ferrum_stream::framework::errors::Result;
use ferrum_stream::framework::server::Server;
use tracing::info;
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// XML server configuration, defaults are used when omitted.
    #[arg(short, long)]
    config: Option<String>,

    #[arg(short, long)]
    verbose: bool,
}

/// Forwards every datum unchanged.
pub struct ExampleMapper;

/// Sums the integer payloads of each key tuple.
pub struct ExampleReducer;

#[async_trait]
impl Mapper for ExampleMapper {
    async fn map(&self, datum: Datum) -> anyhow::Result<Vec<Message>> {
        Ok(vec![Message::new(datum.value).keys(datum.keys)])
    }
}

impl Reducer for ExampleReducer {
    type State = i64;

    fn create(&self, _keys: &[String]) -> anyhow::Result<i64> {
        Ok(0)
    }

    fn accumulate(&self, state: &mut i64, datum: &Datum) -> anyhow::Result<()> {
        let text = std::str::from_utf8(&datum.value)?;
        *state += text.trim().parse::<i64>()?;
        Ok(())
    }

    fn finalize(&self, keys: &[String], state: i64) -> anyhow::Result<Vec<Message>> {
        Ok(vec![Message::new(state.to_string()).keys(keys.to_vec())])
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    // add logging
    tracing_subscriber::fmt()
        .with_max_level(if args.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .with_span_events(FmtSpan::CLOSE)
        .init();

    let config = match &args.config {
        Some(path) => ServerConfig::from_xml_file(path)?,
        None => ServerConfig::default(),
    };

    let now = Local::now();
    info!("Time: {}", now.format("%Y-%m-%d %H:%M:%S"));
    info!("Starting on: {}", config.address());

    Server::new(ExampleMapper, ExampleReducer)
        .with_config(config)
        .start()
        .await
}
