use async_trait::async_trait;
use ferrum_stream::api::datum::{Datum, Message};
use ferrum_stream::api::map::Mapper;
use ferrum_stream::api::reduce::Reducer;
use ferrum_stream::config::server_config::ServerConfig;
use ferrum_stream::framework::server::Server;
use ferrum_stream::proto;
use ferrum_stream::proto::user_defined_function_client::UserDefinedFunctionClient;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::info;

struct Uppercase;

#[async_trait]
impl Mapper for Uppercase {
    async fn map(&self, datum: Datum) -> anyhow::Result<Vec<Message>> {
        let text = String::from_utf8(datum.value.to_vec())?;
        Ok(vec![Message::new(text.to_uppercase()).keys(datum.keys)])
    }
}

struct SumReducer;

impl Reducer for SumReducer {
    type State = i64;

    fn create(&self, _keys: &[String]) -> anyhow::Result<i64> {
        Ok(0)
    }

    fn accumulate(&self, state: &mut i64, datum: &Datum) -> anyhow::Result<()> {
        *state += std::str::from_utf8(&datum.value)?.parse::<i64>()?;
        Ok(())
    }

    fn finalize(&self, keys: &[String], state: i64) -> anyhow::Result<Vec<Message>> {
        Ok(vec![Message::new(state.to_string()).keys(keys.to_vec())])
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    // start an in-process server on a free port
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let config = ServerConfig {
        hostname: addr.ip().to_string(),
        port: addr.port(),
        reduce_workers: 2,
        ..ServerConfig::default()
    };
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(
        Server::new(Uppercase, SumReducer)
            .with_config(config)
            .start_with_listener(listener, async move {
                let _ = shutdown_rx.await;
            }),
    );

    let mut client = UserDefinedFunctionClient::connect(format!("http://{}", addr)).await?;

    // a redelivery of "m3" is ignored by the reducer
    let input: Vec<proto::Datum> = [
        ("apples", "3", "m1", 1),
        ("pears", "10", "m2", 1),
        ("apples", "4", "m3", 1),
        ("apples", "4", "m3", 2),
        ("pears", "5", "m4", 1),
    ]
    .into_iter()
    .map(|(key, value, id, num_delivered)| {
        proto::Datum::from(
            Datum::new(vec![key.to_string()], value.to_string()).delivery(id, num_delivered),
        )
    })
    .collect();

    let mut results = client
        .reduce_fn(tokio_stream::iter(input))
        .await?
        .into_inner();
    while let Some(batch) = results.message().await? {
        for element in batch.elements {
            info!(
                "{} => {}",
                element.keys.join(", "),
                String::from_utf8_lossy(&element.value)
            );
        }
    }

    let mapped = client
        .map_fn(proto::Datum::from(Datum::new(
            vec!["greeting".to_string()],
            "hello",
        )))
        .await?
        .into_inner();
    for element in mapped.elements {
        info!("map => {}", String::from_utf8_lossy(&element.value));
    }

    let _ = shutdown_tx.send(());
    server.await??;
    Ok(())
}
