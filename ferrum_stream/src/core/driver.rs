use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::api::datum::Datum;
use crate::api::reduce::Reducer;
use crate::config::server_config::ReduceConfig;
use crate::core::callback::panic_message;
use crate::core::dedup::{Admission, Deduplicator};
use crate::core::emitter::OutputEmitter;
use crate::core::registry::{PartitionResult, Registry};
use crate::core::router::{KeyRouter, PartitionKey};
use crate::framework::errors::{FerrumStreamError, Result};

/// Lifecycle of one reduce invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    Receiving,
    Finalizing,
    Emitting,
    Done,
    /// Aborted by the caller; nothing was emitted.
    Cancelled,
    /// Aborted by a failing hook or an internal error; nothing was emitted.
    Failed,
}

impl InvocationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InvocationState::Done | InvocationState::Cancelled | InvocationState::Failed
        )
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InvocationSummary {
    pub partitions: usize,
    pub admitted: u64,
    pub duplicates: u64,
    pub untracked: u64,
    pub watermark_regressions: u64,
    pub batches: usize,
    pub messages: usize,
}

struct ShardCommand {
    key: PartitionKey,
    ordinal: usize,
    datum: Datum,
}

/// A worker owning every partition routed to it, so each partition is applied in order.
struct Shard<S> {
    tx: Option<mpsc::Sender<ShardCommand>>,
    handle: JoinHandle<Result<Registry<S>>>,
}

async fn run_shard<R: Reducer>(
    reducer: Arc<R>,
    mut rx: mpsc::Receiver<ShardCommand>,
    errors: mpsc::Sender<FerrumStreamError>,
) -> Result<Registry<R::State>> {
    let mut registry = Registry::new();
    while let Some(command) = rx.recv().await {
        if let Err(err) = registry.accumulate(
            reducer.as_ref(),
            &command.key,
            command.ordinal,
            &command.datum,
        ) {
            // capacity is one slot per shard, this never fills up
            let _ = errors.try_send(err.clone());
            return Err(err);
        }
    }
    Ok(registry)
}

fn join_error(err: JoinError) -> FerrumStreamError {
    if err.is_panic() {
        FerrumStreamError::CallbackFailure(panic_message(err.into_panic().as_ref()))
    } else {
        FerrumStreamError::StreamAbort("reduce worker was cancelled".to_string())
    }
}

/// Drives one reduce invocation through `Receiving → Finalizing → Emitting → Done`.
///
/// Input completion (the caller closing its stream) is the only trigger for finalization.
/// Any failure or cancellation discards all partition state without emitting anything.
pub struct ReduceDriver<R: Reducer> {
    id: Uuid,
    reducer: Arc<R>,
    state: InvocationState,
    router: KeyRouter,
    dedup: Deduplicator,
    shards: Vec<Shard<R::State>>,
    errors_rx: mpsc::Receiver<FerrumStreamError>,
    watermark: DateTime<Utc>,
    summary: InvocationSummary,
}

impl<R: Reducer> ReduceDriver<R> {
    /// Spawns the shard workers, so it must be called from within a tokio runtime.
    pub fn new(reducer: Arc<R>, config: &ReduceConfig) -> Self {
        let workers = config.workers.max(1);
        let (errors_tx, errors_rx) = mpsc::channel(workers);

        let shards = (0..workers)
            .map(|_| {
                let (tx, rx) = mpsc::channel(config.shard_buffer.max(1));
                let handle = tokio::spawn(run_shard(reducer.clone(), rx, errors_tx.clone()));
                Shard {
                    tx: Some(tx),
                    handle,
                }
            })
            .collect();

        ReduceDriver {
            id: Uuid::new_v4(),
            reducer,
            state: InvocationState::Receiving,
            router: KeyRouter::new(workers),
            dedup: Deduplicator::new(),
            shards,
            errors_rx,
            watermark: DateTime::<Utc>::default(),
            summary: InvocationSummary::default(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> InvocationState {
        self.state
    }

    pub fn summary(&self) -> &InvocationSummary {
        &self.summary
    }

    /// Partitions routed so far and not yet released.
    pub fn live_partitions(&self) -> usize {
        self.router.live_partitions()
    }

    /// Gates a datum on its delivery id, routes it and hands it to the owning shard.
    pub async fn ingest(&mut self, datum: Datum) -> Result<Admission> {
        if self.state != InvocationState::Receiving {
            return Err(FerrumStreamError::InvocationClosed(format!(
                "datum for [{}] arrived while {:?}",
                datum.keys.join(", "),
                self.state
            )));
        }

        if self.dedup.admit(&datum) == Admission::Duplicate {
            self.summary.duplicates += 1;
            return Ok(Admission::Duplicate);
        }
        self.observe_watermark(datum.watermark);

        let route = self.router.route(&datum.keys);
        if route.is_new {
            debug!("new partition {} on shard {}", route.key, route.shard);
        }

        let sender = self.shards[route.shard].tx.clone().ok_or_else(|| {
            FerrumStreamError::InternalError(format!("shard {} is closed", route.shard))
        })?;
        let command = ShardCommand {
            key: route.key,
            ordinal: route.ordinal,
            datum,
        };
        if sender.send(command).await.is_err() {
            // the shard only stops early when a hook failed
            let err = self.errors_rx.try_recv().unwrap_or_else(|_| {
                FerrumStreamError::InternalError(format!("shard {} stopped", route.shard))
            });
            return Err(self.abort(err));
        }

        self.summary.admitted += 1;
        Ok(Admission::First)
    }

    /// Closes the shards, waits for all in-flight accumulation and finalizes every partition.
    pub async fn finalize(&mut self) -> Result<Vec<PartitionResult>> {
        self.transition(InvocationState::Receiving, InvocationState::Finalizing)?;

        for shard in self.shards.iter_mut() {
            shard.tx.take();
        }
        let shards = std::mem::take(&mut self.shards);
        let mut registries = Vec::with_capacity(shards.len());
        let mut failure = None;
        for shard in shards {
            if failure.is_some() {
                shard.handle.abort();
                continue;
            }
            match shard.handle.await {
                Ok(Ok(registry)) => registries.push(registry),
                Ok(Err(err)) => failure = Some(err),
                Err(err) => failure = Some(join_error(err)),
            }
        }
        if let Some(err) = failure {
            return Err(self.abort(err));
        }

        let registry = Registry::merge(registries);
        self.summary.partitions = registry.len();
        self.summary.untracked = self.dedup.untracked();

        let results = registry.finalize_all(self.reducer.as_ref());
        self.router.clear();
        self.dedup.clear();
        results.map_err(|err| self.abort(err))
    }

    /// Hands finalized results to the emitter, one batch per partition.
    pub async fn emit(
        &mut self,
        results: Vec<PartitionResult>,
        emitter: &OutputEmitter,
    ) -> Result<InvocationSummary> {
        self.transition(InvocationState::Finalizing, InvocationState::Emitting)?;

        let stats = match emitter.emit(results).await {
            Ok(stats) => stats,
            Err(err) => return Err(self.abort(err)),
        };
        self.summary.batches = stats.batches;
        self.summary.messages = stats.messages;
        self.state = InvocationState::Done;

        info!("reduce invocation {} done: {:?}", self.id, self.summary);
        Ok(self.summary.clone())
    }

    /// Caller-initiated abort. Releases all partition state and emits nothing.
    pub fn cancel(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        warn!(
            "reduce invocation {} cancelled while {:?} with {} live partitions",
            self.id,
            self.state,
            self.live_partitions()
        );
        self.release();
        self.state = InvocationState::Cancelled;
    }

    /// Consumes `input` until it ends, then finalizes and emits.
    ///
    /// Returns early, with nothing emitted, when the input fails, a shard reports a failing
    /// hook, or the receiving side of the response stream goes away.
    pub async fn run<S>(
        &mut self,
        mut input: S,
        emitter: &OutputEmitter,
    ) -> Result<InvocationSummary>
    where
        S: Stream<Item = Result<Datum>> + Unpin,
    {
        loop {
            tokio::select! {
                biased;
                Some(err) = self.errors_rx.recv() => return Err(self.abort(err)),
                _ = emitter.closed() => {
                    return Err(self.abort(FerrumStreamError::StreamAbort(
                        "response stream closed by caller".to_string(),
                    )));
                }
                next = input.next() => match next {
                    Some(Ok(datum)) => {
                        self.ingest(datum).await.map_err(|err| self.abort(err))?;
                    }
                    Some(Err(err)) => return Err(self.abort(err)),
                    None => break,
                },
            }
        }

        let results = self.finalize().await?;
        self.emit(results, emitter).await
    }

    fn transition(&mut self, from: InvocationState, to: InvocationState) -> Result<()> {
        if self.state != from {
            return Err(FerrumStreamError::InvocationClosed(format!(
                "cannot move to {:?} while {:?}",
                to, self.state
            )));
        }
        self.state = to;
        Ok(())
    }

    fn observe_watermark(&mut self, watermark: DateTime<Utc>) {
        if watermark < self.watermark {
            self.summary.watermark_regressions += 1;
            warn!(
                "watermark regressed from {} to {} in invocation {}, keeping {}",
                self.watermark, watermark, self.id, self.watermark
            );
        } else {
            self.watermark = watermark;
        }
    }

    /// Moves to a terminal state matching `err` and hands the error back.
    fn abort(&mut self, err: FerrumStreamError) -> FerrumStreamError {
        if err.is_abort() {
            self.cancel();
        } else if !self.state.is_terminal() {
            error!("reduce invocation {} failed: {}", self.id, err);
            self.release();
            self.state = InvocationState::Failed;
        }
        err
    }

    fn release(&mut self) {
        for shard in self.shards.drain(..) {
            shard.handle.abort();
        }
        self.router.clear();
        self.dedup.clear();
    }
}

impl<R: Reducer> Drop for ReduceDriver<R> {
    fn drop(&mut self) {
        for shard in &self.shards {
            shard.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::datum::Message;
    use anyhow::bail;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio_stream::wrappers::ReceiverStream;
    use tokio_test::{assert_err, assert_ok};

    /// Sums integer payloads, fails on "bad" and on a "poison" key at finalize.
    struct Sum;

    impl Reducer for Sum {
        type State = i64;

        fn create(&self, _keys: &[String]) -> anyhow::Result<i64> {
            Ok(0)
        }

        fn accumulate(&self, state: &mut i64, datum: &Datum) -> anyhow::Result<()> {
            *state += std::str::from_utf8(&datum.value)?.parse::<i64>()?;
            Ok(())
        }

        fn finalize(&self, keys: &[String], state: i64) -> anyhow::Result<Vec<Message>> {
            if keys.iter().any(|k| k == "poison") {
                bail!("poisoned partition");
            }
            Ok(vec![Message::new(state.to_string()).keys(keys.to_vec())])
        }
    }

    /// Order-sensitive reducer.
    struct Concat;

    impl Reducer for Concat {
        type State = String;

        fn create(&self, _keys: &[String]) -> anyhow::Result<String> {
            Ok(String::new())
        }

        fn accumulate(&self, state: &mut String, datum: &Datum) -> anyhow::Result<()> {
            state.push_str(std::str::from_utf8(&datum.value)?);
            Ok(())
        }

        fn finalize(&self, keys: &[String], state: String) -> anyhow::Result<Vec<Message>> {
            Ok(vec![Message::new(state).keys(keys.to_vec())])
        }
    }

    fn config(workers: usize) -> ReduceConfig {
        ReduceConfig {
            workers,
            shard_buffer: 4,
            batch_size: 100,
        }
    }

    fn datum(key: &str, value: &str) -> Datum {
        Datum::new(vec![key.to_string()], value.to_string())
    }

    async fn run_to_completion<R: Reducer>(
        reducer: R,
        workers: usize,
        input: Vec<Datum>,
    ) -> (Result<InvocationSummary>, HashMap<Vec<String>, String>) {
        let (tx, mut rx) = mpsc::channel(16);
        let emitter = OutputEmitter::new(tx, 100);
        let mut driver = ReduceDriver::new(Arc::new(reducer), &config(workers));

        let outcome = driver
            .run(tokio_stream::iter(input.into_iter().map(Ok)), &emitter)
            .await;
        drop(emitter);

        let mut results = HashMap::new();
        while let Some(batch) = rx.recv().await {
            for element in batch.unwrap().elements {
                results.insert(element.keys, String::from_utf8(element.value).unwrap());
            }
        }
        (outcome, results)
    }

    fn expected(pairs: &[(&str, &str)]) -> HashMap<Vec<String>, String> {
        pairs
            .iter()
            .map(|(k, v)| (vec![k.to_string()], v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn single_partition_sum() {
        let (outcome, results) = run_to_completion(
            Sum,
            1,
            vec![datum("k", "1"), datum("k", "2"), datum("k", "3")],
        )
        .await;

        let summary = outcome.unwrap();
        assert_eq!(results, expected(&[("k", "6")]));
        assert_eq!(summary.partitions, 1);
        assert_eq!(summary.admitted, 3);
        assert_eq!(summary.batches, 1);
        assert_eq!(summary.messages, 1);
    }

    #[tokio::test]
    async fn interleaved_partitions_across_workers() {
        let (outcome, results) = run_to_completion(
            Sum,
            4,
            vec![
                datum("k1", "1"),
                datum("k2", "10"),
                datum("k1", "2"),
                datum("k2", "20"),
            ],
        )
        .await;

        assert_ok!(outcome);
        assert_eq!(results, expected(&[("k1", "3"), ("k2", "30")]));
    }

    #[tokio::test]
    async fn redelivery_is_applied_once() {
        let (outcome, results) = run_to_completion(
            Sum,
            2,
            vec![
                datum("k", "5").delivery("m1", 1),
                datum("k", "5").delivery("m1", 2),
            ],
        )
        .await;

        let summary = outcome.unwrap();
        assert_eq!(results, expected(&[("k", "5")]));
        assert_eq!(summary.duplicates, 1);
        assert_eq!(summary.admitted, 1);
    }

    #[tokio::test]
    async fn partition_results_ignore_interleaving() {
        let a = ["a1", "a2", "a3"].map(|v| datum("a", v));
        let b = ["b1", "b2"].map(|v| datum("b", v));

        let grouped: Vec<Datum> = a.iter().chain(b.iter()).cloned().collect();
        let interleaved = vec![
            b[0].clone(),
            a[0].clone(),
            a[1].clone(),
            b[1].clone(),
            a[2].clone(),
        ];

        let (_, first) = run_to_completion(Concat, 3, grouped).await;
        let (_, second) = run_to_completion(Concat, 3, interleaved).await;
        assert_eq!(first, second);
        assert_eq!(first, expected(&[("a", "a1a2a3"), ("b", "b1b2")]));
    }

    #[tokio::test]
    async fn watermark_regression_is_tolerated() {
        let t10 = Utc.timestamp_opt(10, 0).unwrap();
        let t5 = Utc.timestamp_opt(5, 0).unwrap();
        let (outcome, results) = run_to_completion(
            Sum,
            1,
            vec![datum("k", "1").watermark(t10), datum("k", "2").watermark(t5)],
        )
        .await;

        let summary = outcome.unwrap();
        assert_eq!(summary.watermark_regressions, 1);
        assert_eq!(results, expected(&[("k", "3")]));
    }

    #[tokio::test]
    async fn cancel_releases_all_partitions() {
        let (tx, mut rx) = mpsc::channel(4);
        let emitter = OutputEmitter::new(tx, 10);
        let mut driver = ReduceDriver::new(Arc::new(Sum), &config(2));

        for key in ["a", "b", "c"] {
            assert_ok!(driver.ingest(datum(key, "1")).await);
        }
        assert_eq!(driver.live_partitions(), 3);

        driver.cancel();
        assert_eq!(driver.state(), InvocationState::Cancelled);
        assert_eq!(driver.live_partitions(), 0);

        let late = driver.ingest(datum("a", "1")).await;
        assert!(matches!(late, Err(FerrumStreamError::InvocationClosed(_))));
        assert_err!(driver.finalize().await);

        drop(emitter);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn aborted_input_emits_nothing() {
        let (tx, mut rx) = mpsc::channel(4);
        let emitter = OutputEmitter::new(tx, 10);
        let mut driver = ReduceDriver::new(Arc::new(Sum), &config(1));

        let input = tokio_stream::iter(vec![
            Ok(datum("k", "1")),
            Ok(datum("k", "2")),
            Err(FerrumStreamError::StreamAbort("client went away".to_string())),
            Ok(datum("k", "3")),
        ]);
        let outcome = driver.run(input, &emitter).await;
        assert!(outcome.unwrap_err().is_abort());

        drop(emitter);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn accumulate_failure_aborts_while_input_is_open() {
        let (tx, mut rx) = mpsc::channel(4);
        let emitter = OutputEmitter::new(tx, 10);
        let mut driver = ReduceDriver::new(Arc::new(Sum), &config(1));

        let (input_tx, input_rx) = mpsc::channel(4);
        input_tx.send(Ok(datum("k", "1"))).await.unwrap();
        input_tx.send(Ok(datum("k", "bad"))).await.unwrap();

        let outcome = tokio::time::timeout(
            Duration::from_secs(2),
            driver.run(ReceiverStream::new(input_rx), &emitter),
        )
        .await
        .expect("driver should stop on a failing hook");

        assert!(matches!(outcome, Err(FerrumStreamError::CallbackFailure(_))));
        drop(input_tx);
        drop(emitter);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn finalize_failure_fails_the_invocation() {
        let (tx, mut rx) = mpsc::channel(4);
        let emitter = OutputEmitter::new(tx, 10);
        let mut driver = ReduceDriver::new(Arc::new(Sum), &config(2));

        assert_ok!(driver.ingest(datum("k", "1")).await);
        assert_ok!(driver.ingest(datum("poison", "1")).await);

        let outcome = driver.finalize().await;
        assert!(matches!(outcome, Err(FerrumStreamError::CallbackFailure(_))));
        assert_eq!(driver.state(), InvocationState::Failed);
        assert_eq!(driver.live_partitions(), 0);
        assert_err!(driver.emit(vec![], &emitter).await);

        drop(emitter);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn steps_follow_the_state_machine() {
        let (tx, mut rx) = mpsc::channel(4);
        let emitter = OutputEmitter::new(tx, 10);
        let mut driver = ReduceDriver::new(Arc::new(Sum), &config(1));

        assert_eq!(driver.state(), InvocationState::Receiving);
        assert_err!(driver.emit(vec![], &emitter).await);
        assert_eq!(driver.state(), InvocationState::Receiving);

        assert_ok!(driver.ingest(datum("k", "4")).await);
        let results = driver.finalize().await.unwrap();
        assert_eq!(driver.state(), InvocationState::Finalizing);
        assert_eq!(results.len(), 1);

        let late = driver.ingest(datum("k", "1")).await;
        assert!(matches!(late, Err(FerrumStreamError::InvocationClosed(_))));

        let summary = driver.emit(results, &emitter).await.unwrap();
        assert_eq!(driver.state(), InvocationState::Done);
        assert_eq!(summary.messages, 1);

        driver.cancel();
        assert_eq!(driver.state(), InvocationState::Done);

        let batch = rx.recv().await.unwrap().unwrap();
        assert_eq!(batch.elements[0].value, b"4".to_vec());
    }

    #[tokio::test]
    async fn closed_response_stream_cancels_the_invocation() {
        let (tx, rx) = mpsc::channel(4);
        let emitter = OutputEmitter::new(tx, 10);
        let mut driver = ReduceDriver::new(Arc::new(Sum), &config(2));

        let (input_tx, input_rx) = mpsc::channel(4);
        input_tx.send(Ok(datum("k", "1"))).await.unwrap();
        drop(rx);

        let outcome = tokio::time::timeout(
            Duration::from_secs(2),
            driver.run(ReceiverStream::new(input_rx), &emitter),
        )
        .await
        .expect("driver should stop once the response stream is gone");

        assert!(outcome.unwrap_err().is_abort());
        assert_eq!(driver.state(), InvocationState::Cancelled);
        assert_eq!(driver.live_partitions(), 0);
        drop(input_tx);
    }

    #[tokio::test]
    async fn duplicates_do_not_open_partitions() {
        let mut driver = ReduceDriver::new(Arc::new(Sum), &config(2));

        let first = driver.ingest(datum("a", "1").delivery("m1", 1)).await;
        assert_eq!(first.unwrap(), Admission::First);
        let redelivered = driver.ingest(datum("b", "1").delivery("m1", 2)).await;
        assert_eq!(redelivered.unwrap(), Admission::Duplicate);
        assert_eq!(driver.live_partitions(), 1);

        let results = driver.finalize().await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].key.keys(), &["a".to_string()]);
    }

    #[tokio::test]
    async fn empty_input_emits_nothing() {
        let (outcome, results) = run_to_completion(Sum, 2, vec![]).await;
        let summary = outcome.unwrap();
        assert_eq!(summary.partitions, 0);
        assert!(results.is_empty());
    }
}
