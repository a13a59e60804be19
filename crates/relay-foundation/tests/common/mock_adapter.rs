//! Mock adapter family for `relay-foundation` integration tests.
//!
//! [`MockFactory`] implements [`relay_kernel::AdapterFactory`] for the
//! `mock` family and builds [`MockAdapter`]s that replay scripted streams.
//! Every load, generate and shutdown call is recorded so tests can assert on
//! how the registry and orchestrator drove the backend.
//!
//! # Design goals
//!
//! | Goal | Mechanism |
//! |------|-----------|
//! | Deterministic | Scripts queued per model at build time, FIFO |
//! | Observable | `load_count()`, `generate_count()`, `last_request()`, … |
//! | Fault injection | `fail_load()`, [`Script::fail_on_open`], [`Script::fail_after`] |
//! | Slow backends | `load_delay()`, `token_delay()`, `shutdown_delay()`, [`Script::hang_after`] |
//! | Thread-safe | Internal state protected by `Arc<Mutex<…>>` |
//!
//! # Example
//!
//! ```rust,ignore
//! let factory = MockFactory::builder()
//!     .script("m1", Script::reply(["Hello", " world"]))
//!     .build();
//! let registry = ModelRegistry::new(RegistryConfig::default())
//!     .with_factory(factory.shared());
//! registry.register(mock_model("m1", 1024)).unwrap();
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;

use relay_kernel::{
    AdapterChunk, AdapterError, AdapterFactory, CapabilitySet, ChunkStream, FinishReason,
    GenerationRequest, ModelAdapter, ModelDescriptor, ModelFamily, ModelId, RetrievalError,
    RetrievedPassage, Retriever,
};

/// Family name served by [`MockFactory`].
pub const MOCK_FAMILY: &str = "mock";

/// Descriptor for a mock model with text generation and streaming.
pub fn mock_model(id: &str, memory_mb: u64) -> ModelDescriptor {
    ModelDescriptor::new(id, ModelFamily::Other(MOCK_FAMILY.to_string()))
        .with_memory_mb(memory_mb)
        .with_capability("streaming")
        .with_context_window(4096)
}

// ─────────────────────────────────────────────────────────────────────────────
// Scripts
// ─────────────────────────────────────────────────────────────────────────────

/// What one `generate()` call does.
#[derive(Debug, Clone)]
pub enum Script {
    /// Emit the tokens, then finish with the given reason.
    Reply {
        tokens: Vec<String>,
        finish: FinishReason,
    },
    /// `generate()` itself returns the error.
    FailOnOpen(AdapterError),
    /// Emit the tokens, then yield the error.
    FailAfter {
        tokens: Vec<String>,
        error: AdapterError,
    },
    /// Emit the tokens, then never produce another item.
    HangAfter { tokens: Vec<String> },
}

impl Script {
    pub fn reply<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Reply {
            tokens: tokens.into_iter().map(Into::into).collect(),
            finish: FinishReason::Stop,
        }
    }

    pub fn fail_on_open(error: AdapterError) -> Self {
        Self::FailOnOpen(error)
    }

    pub fn fail_after<I, S>(tokens: I, error: AdapterError) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::FailAfter {
            tokens: tokens.into_iter().map(Into::into).collect(),
            error,
        }
    }

    pub fn hang_after<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::HangAfter {
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }

    fn default_reply() -> Self {
        Self::reply(["mock ", "reply"])
    }
}

type Item = Result<AdapterChunk, AdapterError>;

fn text_items(tokens: Vec<String>) -> VecDeque<Item> {
    tokens
        .into_iter()
        .enumerate()
        .map(|(i, t)| Ok(AdapterChunk::text(i as u64, t)))
        .collect()
}

/// Replay `items` with an optional delay before each one. When `hang` is set
/// the stream stays pending after the last item instead of ending.
fn replay(items: VecDeque<Item>, delay: Option<Duration>, hang: bool) -> ChunkStream {
    Box::pin(stream::unfold(items, move |mut items| async move {
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match items.pop_front() {
            Some(item) => Some((item, items)),
            None => {
                if hang {
                    futures::future::pending::<()>().await;
                }
                None
            }
        }
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// Internal mutable state
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct MockState {
    loads: HashMap<ModelId, usize>,
    generates: HashMap<ModelId, usize>,
    shutdowns: HashMap<ModelId, usize>,
    requests: HashMap<ModelId, Vec<GenerationRequest>>,
    scripts: HashMap<ModelId, VecDeque<Script>>,
    failing_loads: HashMap<ModelId, String>,
    non_streaming: HashSet<ModelId>,
}

struct MockConfig {
    load_delay: Option<Duration>,
    token_delay: Option<Duration>,
    shutdown_delay: Option<Duration>,
}

// ─────────────────────────────────────────────────────────────────────────────
// MockFactory
// ─────────────────────────────────────────────────────────────────────────────

/// Factory for the `mock` family. Clones share recorded state.
#[derive(Clone)]
pub struct MockFactory {
    state: Arc<Mutex<MockState>>,
    config: Arc<MockConfig>,
}

impl MockFactory {
    pub fn builder() -> MockFactoryBuilder {
        MockFactoryBuilder::default()
    }

    /// Arc'd factory ready for `ModelRegistry::register_factory`.
    pub fn shared(&self) -> Arc<dyn AdapterFactory> {
        Arc::new(self.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("mock state mutex poisoned")
    }

    /// Queue another script for `model` after the ones already queued.
    pub fn push_script(&self, model: &str, script: Script) {
        self.lock()
            .scripts
            .entry(ModelId::new(model))
            .or_default()
            .push_back(script);
    }

    // ── Observation helpers ──────────────────────────────────────────────────

    pub fn load_count(&self, model: &str) -> usize {
        self.lock().loads.get(&ModelId::new(model)).copied().unwrap_or(0)
    }

    pub fn total_loads(&self) -> usize {
        self.lock().loads.values().sum()
    }

    pub fn generate_count(&self, model: &str) -> usize {
        self.lock()
            .generates
            .get(&ModelId::new(model))
            .copied()
            .unwrap_or(0)
    }

    pub fn shutdown_count(&self, model: &str) -> usize {
        self.lock()
            .shutdowns
            .get(&ModelId::new(model))
            .copied()
            .unwrap_or(0)
    }

    /// Most recent request an adapter of `model` received.
    pub fn last_request(&self, model: &str) -> Option<GenerationRequest> {
        self.lock()
            .requests
            .get(&ModelId::new(model))
            .and_then(|r| r.last().cloned())
    }
}

#[async_trait]
impl AdapterFactory for MockFactory {
    fn family(&self) -> ModelFamily {
        ModelFamily::Other(MOCK_FAMILY.to_string())
    }

    async fn load(
        &self,
        descriptor: &ModelDescriptor,
    ) -> Result<Arc<dyn ModelAdapter>, AdapterError> {
        let failure = {
            let mut state = self.lock();
            *state.loads.entry(descriptor.id.clone()).or_default() += 1;
            state.failing_loads.get(&descriptor.id).cloned()
        };
        if let Some(delay) = self.config.load_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = failure {
            return Err(AdapterError::fatal(reason));
        }
        let streaming = !self.lock().non_streaming.contains(&descriptor.id);
        Ok(Arc::new(MockAdapter {
            model_id: descriptor.id.clone(),
            capabilities: descriptor.capabilities.clone(),
            streaming,
            factory: self.clone(),
        }))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MockAdapter
// ─────────────────────────────────────────────────────────────────────────────

pub struct MockAdapter {
    model_id: ModelId,
    capabilities: CapabilitySet,
    streaming: bool,
    factory: MockFactory,
}

#[async_trait]
impl ModelAdapter for MockAdapter {
    fn name(&self) -> &str {
        MOCK_FAMILY
    }

    async fn generate(&self, request: GenerationRequest) -> Result<ChunkStream, AdapterError> {
        let script = {
            let mut state = self.factory.lock();
            *state.generates.entry(self.model_id.clone()).or_default() += 1;
            state
                .requests
                .entry(self.model_id.clone())
                .or_default()
                .push(request);
            state
                .scripts
                .get_mut(&self.model_id)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(Script::default_reply)
        };
        let delay = self.factory.config.token_delay;

        match script {
            Script::Reply { tokens, finish } => {
                let tokens = if self.streaming {
                    tokens
                } else {
                    vec![tokens.concat()]
                };
                let mut items = text_items(tokens);
                items.push_back(Ok(AdapterChunk::finish(items.len() as u64, finish)));
                Ok(replay(items, delay, false))
            }
            Script::FailOnOpen(error) => Err(error),
            Script::FailAfter { tokens, error } => {
                let mut items = text_items(tokens);
                items.push_back(Err(error));
                Ok(replay(items, delay, false))
            }
            Script::HangAfter { tokens } => Ok(replay(text_items(tokens), delay, true)),
        }
    }

    fn supports_streaming(&self) -> bool {
        self.streaming
    }

    fn describe_capabilities(&self) -> CapabilitySet {
        self.capabilities.clone()
    }

    async fn shutdown(&self) {
        if let Some(delay) = self.factory.config.shutdown_delay {
            tokio::time::sleep(delay).await;
        }
        *self
            .factory
            .lock()
            .shutdowns
            .entry(self.model_id.clone())
            .or_default() += 1;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockFactoryBuilder {
    state: MockState,
    load_delay: Option<Duration>,
    token_delay: Option<Duration>,
    shutdown_delay: Option<Duration>,
}

impl MockFactoryBuilder {
    /// Queue a script for the next `generate()` on `model`.
    pub fn script(mut self, model: &str, script: Script) -> Self {
        self.state
            .scripts
            .entry(ModelId::new(model))
            .or_default()
            .push_back(script);
        self
    }

    /// Loads of `model` fail with a fatal adapter error.
    pub fn fail_load(mut self, model: &str, reason: &str) -> Self {
        self.state
            .failing_loads
            .insert(ModelId::new(model), reason.to_string());
        self
    }

    /// Adapters for `model` buffer their whole reply into one chunk.
    pub fn non_streaming(mut self, model: &str) -> Self {
        self.state.non_streaming.insert(ModelId::new(model));
        self
    }

    pub fn load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = Some(delay);
        self
    }

    pub fn token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = Some(delay);
        self
    }

    /// Adapter shutdown sleeps this long before it is counted.
    pub fn shutdown_delay(mut self, delay: Duration) -> Self {
        self.shutdown_delay = Some(delay);
        self
    }

    pub fn build(self) -> MockFactory {
        MockFactory {
            state: Arc::new(Mutex::new(self.state)),
            config: Arc::new(MockConfig {
                load_delay: self.load_delay,
                token_delay: self.token_delay,
                shutdown_delay: self.shutdown_delay,
            }),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Retrievers
// ─────────────────────────────────────────────────────────────────────────────

/// Retriever returning fixed passages, or always failing.
pub struct StaticRetriever {
    result: Result<Vec<RetrievedPassage>, RetrievalError>,
    calls: Mutex<Vec<(String, usize)>>,
}

impl StaticRetriever {
    pub fn with_passages(passages: Vec<RetrievedPassage>) -> Self {
        Self {
            result: Ok(passages),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn unavailable(reason: &str) -> Self {
        Self {
            result: Err(RetrievalError::Unavailable(reason.to_string())),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// `(query, k)` of every lookup, in call order.
    pub fn calls(&self) -> Vec<(String, usize)> {
        self.calls.lock().expect("retriever mutex poisoned").clone()
    }
}

#[async_trait]
impl Retriever for StaticRetriever {
    async fn lookup(&self, query: &str, k: usize) -> Result<Vec<RetrievedPassage>, RetrievalError> {
        self.calls
            .lock()
            .expect("retriever mutex poisoned")
            .push((query.to_string(), k));
        self.result
            .clone()
            .map(|passages| passages.into_iter().take(k).collect())
    }
}
