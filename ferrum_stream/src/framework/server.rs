use std::future::Future;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tracing::info;

use crate::api::map::Mapper;
use crate::api::reduce::Reducer;
use crate::config::server_config::ServerConfig;
use crate::core::readiness::Readiness;
use crate::core::service::UdfService;
use crate::framework::errors::Result;
use crate::proto::user_defined_function_server::UserDefinedFunctionServer;

/// gRPC server exposing a mapper and a reducer.
pub struct Server<M, R> {
    config: ServerConfig,
    mapper: Arc<M>,
    reducer: Arc<R>,
    readiness: Readiness,
}

impl<M: Mapper, R: Reducer> Server<M, R> {
    pub fn new(mapper: M, reducer: R) -> Self {
        Server {
            config: ServerConfig::default(),
            mapper: Arc::new(mapper),
            reducer: Arc::new(reducer),
            readiness: Readiness::new(),
        }
    }

    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Handle on the flag reported by `IsReady`.
    pub fn readiness(&self) -> Readiness {
        self.readiness.clone()
    }

    /// Serves on an already bound listener until `shutdown` resolves.
    pub async fn start_with_listener<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.config.validate()?;
        let addr = listener.local_addr()?;

        let service = UdfService::new(
            self.mapper.clone(),
            self.reducer.clone(),
            self.readiness.clone(),
            &self.config,
        );
        let service = UserDefinedFunctionServer::new(service)
            .max_encoding_message_size(self.config.max_message_size)
            .max_decoding_message_size(self.config.max_message_size);

        self.readiness.mark_ready();
        info!("Listening on: {}", addr);

        tonic::transport::Server::builder()
            .add_service(service)
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
            .await?;

        info!("Server on {} shut down", addr);
        Ok(())
    }

    /// Binds the configured address and serves until `shutdown` resolves.
    pub async fn start_with_shutdown<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let listener = TcpListener::bind(self.config.address()).await?;
        self.start_with_listener(listener, shutdown).await
    }

    /// Serves until SIGINT or SIGTERM.
    pub async fn start(self) -> Result<()> {
        self.start_with_shutdown(shutdown_signal()).await
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
