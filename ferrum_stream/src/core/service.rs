use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tonic::{Request, Response, Status, Streaming};
use tracing::{info_span, Instrument};

use crate::api::datum::Datum;
use crate::api::map::Mapper;
use crate::api::reduce::Reducer;
use crate::config::server_config::{ReduceConfig, ServerConfig};
use crate::core::driver::ReduceDriver;
use crate::core::emitter::OutputEmitter;
use crate::core::mapper::MapExecutor;
use crate::core::readiness::Readiness;
use crate::framework::errors::FerrumStreamError;
use crate::proto::user_defined_function_server::UserDefinedFunction;
use crate::proto::{self, ReadyResponse, ResponseBatch};

/// Binds the user hooks to the three RPCs.
pub struct UdfService<M, R> {
    map_executor: MapExecutor<M>,
    reducer: Arc<R>,
    readiness: Readiness,
    reduce_config: ReduceConfig,
    response_buffer: usize,
}

impl<M: Mapper, R: Reducer> UdfService<M, R> {
    pub fn new(
        mapper: Arc<M>,
        reducer: Arc<R>,
        readiness: Readiness,
        config: &ServerConfig,
    ) -> Self {
        UdfService {
            map_executor: MapExecutor::new(mapper),
            reducer,
            readiness,
            reduce_config: config.reduce(),
            response_buffer: config.response_buffer.max(1),
        }
    }
}

#[tonic::async_trait]
impl<M: Mapper, R: Reducer> UserDefinedFunction for UdfService<M, R> {
    async fn map_fn(
        &self,
        request: Request<proto::Datum>,
    ) -> Result<Response<ResponseBatch>, Status> {
        let datum = Datum::try_from(request.into_inner())?;
        let messages = self.map_executor.apply(datum).await?;

        Ok(Response::new(ResponseBatch {
            elements: messages.into_iter().map(Into::into).collect(),
        }))
    }

    type ReduceFnStream = ReceiverStream<Result<ResponseBatch, Status>>;

    /// One stream is one invocation: everything sent before the caller closes its side is
    /// reduced and emitted, or nothing is.
    async fn reduce_fn(
        &self,
        request: Request<Streaming<proto::Datum>>,
    ) -> Result<Response<Self::ReduceFnStream>, Status> {
        let (response_tx, response_rx) = mpsc::channel(self.response_buffer);
        let emitter = OutputEmitter::new(response_tx, self.reduce_config.batch_size);
        let mut driver = ReduceDriver::new(self.reducer.clone(), &self.reduce_config);
        let span = info_span!("reduce", invocation = %driver.id());

        let input = request.into_inner().map(|item| match item {
            Ok(datum) => Datum::try_from(datum),
            Err(status) => Err(FerrumStreamError::StreamAbort(status.to_string())),
        });

        tokio::spawn(
            async move {
                match driver.run(input, &emitter).await {
                    Ok(_) => {}
                    // nobody is listening anymore
                    Err(err) if err.is_abort() => {}
                    Err(err) => emitter.fail(err).await,
                }
            }
            .instrument(span),
        );

        Ok(Response::new(ReceiverStream::new(response_rx)))
    }

    async fn is_ready(&self, _: Request<()>) -> Result<Response<ReadyResponse>, Status> {
        Ok(Response::new(ReadyResponse {
            ready: self.readiness.is_ready(),
        }))
    }
}
