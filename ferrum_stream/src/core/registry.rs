use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::api::datum::{Datum, Message};
use crate::api::reduce::Reducer;
use crate::core::callback::invoke;
use crate::core::router::PartitionKey;
use crate::framework::errors::Result;

/// Per-partition state carried across datums until the invocation finalizes.
#[derive(Debug)]
pub struct AccumulationContext<S> {
    pub key: PartitionKey,
    pub state: S,
    pub created_at: DateTime<Utc>,
    /// Highest watermark applied to this partition.
    pub watermark: DateTime<Utc>,
    pub ordinal: usize,
    pub applied: u64,
}

/// Finalized output of one partition.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionResult {
    pub key: PartitionKey,
    pub messages: Vec<Message>,
}

/// Arena of accumulation contexts owned by one invocation (or one shard of it).
#[derive(Debug)]
pub struct Registry<S> {
    contexts: Vec<AccumulationContext<S>>,
    index: HashMap<PartitionKey, usize>,
}

impl<S> Default for Registry<S> {
    fn default() -> Self {
        Registry {
            contexts: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<S> Registry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn get(&self, key: &PartitionKey) -> Option<&AccumulationContext<S>> {
        self.index.get(key).map(|idx| &self.contexts[*idx])
    }

    /// Returns the context of `key`, creating it through the user `create` hook on first use.
    pub fn get_or_create<R>(
        &mut self,
        reducer: &R,
        key: &PartitionKey,
        ordinal: usize,
    ) -> Result<&mut AccumulationContext<S>>
    where
        R: Reducer<State = S>,
    {
        let idx = match self.index.get(key) {
            Some(idx) => *idx,
            None => {
                let state = invoke("create", || reducer.create(key.keys()))?;
                let idx = self.contexts.len();
                self.contexts.push(AccumulationContext {
                    key: key.clone(),
                    state,
                    created_at: Utc::now(),
                    watermark: DateTime::<Utc>::default(),
                    ordinal,
                    applied: 0,
                });
                self.index.insert(key.clone(), idx);
                idx
            }
        };
        Ok(&mut self.contexts[idx])
    }

    /// Applies `datum` to the context of `key` with the user `accumulate` hook.
    pub fn accumulate<R>(
        &mut self,
        reducer: &R,
        key: &PartitionKey,
        ordinal: usize,
        datum: &Datum,
    ) -> Result<()>
    where
        R: Reducer<State = S>,
    {
        let context = self.get_or_create(reducer, key, ordinal)?;
        invoke("accumulate", || reducer.accumulate(&mut context.state, datum))?;
        if datum.watermark > context.watermark {
            context.watermark = datum.watermark;
        }
        context.applied += 1;
        Ok(())
    }

    /// Combines shard registries once every shard has quiesced.
    pub fn merge(registries: impl IntoIterator<Item = Registry<S>>) -> Self {
        let mut merged = Registry::new();
        for registry in registries {
            for context in registry.contexts {
                merged.index.insert(context.key.clone(), merged.contexts.len());
                merged.contexts.push(context);
            }
        }
        merged
    }

    /// Finalizes every context in first-seen order. One-shot: the registry is consumed and
    /// the first failing hook aborts the whole batch.
    pub fn finalize_all<R>(self, reducer: &R) -> Result<Vec<PartitionResult>>
    where
        R: Reducer<State = S>,
    {
        let mut contexts = self.contexts;
        contexts.sort_by_key(|context| context.ordinal);

        let mut results = Vec::with_capacity(contexts.len());
        for context in contexts {
            let AccumulationContext { key, state, .. } = context;
            let messages = invoke("finalize", || reducer.finalize(key.keys(), state))?;
            results.push(PartitionResult { key, messages });
        }
        Ok(results)
    }
}
