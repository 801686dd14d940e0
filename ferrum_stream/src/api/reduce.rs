use crate::api::datum::{Datum, Message};

/// Reducer is the user-defined keyed accumulation behind the Reduce RPC.
///
/// The engine keeps one `State` per distinct key tuple of an invocation and never looks
/// inside it. For a key tuple the hooks are called as `create` once, `accumulate` once per
/// non-duplicate datum in receipt order, and `finalize` once when the caller closes the
/// stream. Any error or panic aborts the whole invocation.
///
/// The hooks are synchronous and are expected to be bounded; they run on the worker that
/// owns the key tuple.
///
/// ```
/// use ferrum_stream::api::datum::{Datum, Message};
/// use ferrum_stream::api::reduce::Reducer;
///
/// struct Counter;
///
/// impl Reducer for Counter {
///     type State = u64;
///
///     fn create(&self, _keys: &[String]) -> anyhow::Result<u64> {
///         Ok(0)
///     }
///
///     fn accumulate(&self, state: &mut u64, _datum: &Datum) -> anyhow::Result<()> {
///         *state += 1;
///         Ok(())
///     }
///
///     fn finalize(&self, keys: &[String], state: u64) -> anyhow::Result<Vec<Message>> {
///         Ok(vec![Message::new(state.to_string()).keys(keys.to_vec())])
///     }
/// }
/// ```
pub trait Reducer: Send + Sync + 'static {
    type State: Send + 'static;

    /// Must be deterministic given `keys`.
    fn create(&self, keys: &[String]) -> anyhow::Result<Self::State>;

    fn accumulate(&self, state: &mut Self::State, datum: &Datum) -> anyhow::Result<()>;

    /// The keys and tags of the returned messages are sent to the caller unchanged.
    fn finalize(&self, keys: &[String], state: Self::State) -> anyhow::Result<Vec<Message>>;
}
