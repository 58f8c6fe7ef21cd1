//! Kernel broker - the control-plane glue
//!
//! [`KernelBroker`] owns the bus, the filter chain, the exchange correlator,
//! the context store, and the agent surface, and runs the router task that
//! every message passes through:
//!
//! 1. filter chain dispatch (interception, transformation, suppression),
//! 2. exchange correlator observation (consuming exchange traffic),
//! 3. forwarding survivors to the opposite side of the bus.
//!
//! Two front-end message kinds on the shell channel are consumed by the
//! broker itself instead of being proxied: `context_setup_request` (select
//! an analysis subject, rebuild the policy context, load the dataframe into
//! the kernel) and `llm_request` (run the agent loop against the query).
//! Handlers are spawned onto their own tasks so the router keeps routing
//! while they wait on exchanges of their own.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::agent::{
    classify_output, AgentLoop, AgentReply, ContextStore, DecisionPolicy, Termination,
    ThoughtObserver,
};
use crate::backend::BackendSession;
use crate::bus::{BusEnvelope, BusMessage, Channel, KernelBus, Origin};
use crate::config::Config;
use crate::error::{MuxError, Result};
use crate::exchange::ExchangeCorrelator;
use crate::filter::{FilterAction, FilterChain, MessageFilter};
use crate::tools::{
    DatasetInfoTool, DatasetStore, GenerateCodeTool, RepairCodeTool, RunCodeTool, ToolContext,
    ToolRegistry,
};

/// The broker: router plus control-plane message handling.
pub struct KernelBroker {
    config: Config,
    bus: KernelBus,
    filters: Arc<FilterChain>,
    correlator: Arc<ExchangeCorrelator>,
    context: ContextStore,
    dataset: DatasetStore,
    tools: Arc<ToolRegistry>,
    policy: Arc<dyn DecisionPolicy>,
    backend: tokio::sync::Mutex<Option<BackendSession>>,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

/// The two front-end control kinds consumed by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlKind {
    ContextSetup,
    LlmRequest,
}

impl ControlKind {
    fn msg_type(&self) -> &'static str {
        match self {
            ControlKind::ContextSetup => "context_setup_request",
            ControlKind::LlmRequest => "llm_request",
        }
    }
}

/// Filter entry intercepting one control kind and handing it to the broker.
struct ControlFilter {
    broker: Weak<KernelBroker>,
    kind: ControlKind,
}

#[async_trait]
impl MessageFilter for ControlFilter {
    async fn on_message(&self, envelope: &BusEnvelope) -> FilterAction {
        // Only front-end requests are control-plane traffic; a backend
        // message of the same kind is someone else's business.
        if envelope.origin != Origin::Frontend {
            return FilterAction::Pass(envelope.message.clone());
        }
        let Some(broker) = self.broker.upgrade() else {
            return FilterAction::Pass(envelope.message.clone());
        };
        let message = envelope.message.clone();
        // Handlers run on their own task so the router never blocks on the
        // exchanges they open.
        match self.kind {
            ControlKind::ContextSetup => {
                tokio::spawn(async move { broker.handle_context_setup(message).await });
            }
            ControlKind::LlmRequest => {
                tokio::spawn(async move { broker.handle_llm_request(message).await });
            }
        }
        FilterAction::Suppress
    }
}

impl KernelBroker {
    /// Creates a broker with a fresh bus and the default tool set.
    pub fn new(config: Config, policy: Arc<dyn DecisionPolicy>) -> Arc<Self> {
        Self::with_bus(config, policy, KernelBus::new())
    }

    /// Creates a broker over an existing bus (shared with transports).
    pub fn with_bus(config: Config, policy: Arc<dyn DecisionPolicy>, bus: KernelBus) -> Arc<Self> {
        let correlator = Arc::new(ExchangeCorrelator::new(bus.clone()));
        let dataset = DatasetStore::new(&config.data_service.base_url);

        let mut tools = ToolRegistry::new();
        tools.register(Box::new(DatasetInfoTool));
        tools.register(Box::new(GenerateCodeTool));
        tools.register(Box::new(RunCodeTool));
        tools.register(Box::new(RepairCodeTool));

        let (shutdown_tx, _) = watch::channel(false);
        let broker = Arc::new(Self {
            config,
            bus,
            filters: Arc::new(FilterChain::new()),
            correlator,
            context: ContextStore::new(),
            dataset,
            tools: Arc::new(tools),
            policy,
            backend: tokio::sync::Mutex::new(None),
            running: AtomicBool::new(false),
            shutdown_tx,
        });
        broker.install_control_filters();
        broker
    }

    fn install_control_filters(self: &Arc<Self>) {
        for kind in [ControlKind::ContextSetup, ControlKind::LlmRequest] {
            self.filters.register(
                Channel::Shell,
                kind.msg_type(),
                Arc::new(ControlFilter {
                    broker: Arc::downgrade(self),
                    kind,
                }),
            );
        }
    }

    /// Returns true while the router loop is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Runs the router until [`KernelBroker::stop`] is called or the inbound
    /// queue closes.
    ///
    /// # Errors
    /// Returns an error if the broker is already running.
    pub async fn run(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(MuxError::Config("broker already running".to_string()));
        }
        info!("broker started");

        // Subscribe fresh and consume any stale stop signal from a previous run.
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let _ = *shutdown_rx.borrow_and_update();

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("received shutdown signal");
                        break;
                    }
                }
                envelope = self.bus.consume_inbound() => {
                    match envelope {
                        Some(envelope) => self.route(envelope).await,
                        None => {
                            info!("inbound queue closed");
                            break;
                        }
                    }
                }
            }

            if !self.running.load(Ordering::SeqCst) {
                break;
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!("broker stopped");
        Ok(())
    }

    /// Signals the router loop to stop.
    pub fn stop(&self) {
        info!("stopping broker");
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);
    }

    /// Routes one envelope: filters, then correlator, then forwarding.
    async fn route(&self, envelope: BusEnvelope) {
        let channel = envelope.channel;
        let origin = envelope.origin;
        let span = info_span!(
            "route",
            channel = %channel,
            msg_type = %envelope.message.msg_type,
        );
        async {
            let message = match self.filters.dispatch(envelope).await {
                FilterAction::Suppress => return,
                FilterAction::Pass(message) => message,
            };

            let observed = BusEnvelope::new(channel, origin, message);
            let message = match self.correlator.observe(&observed) {
                FilterAction::Suppress => return,
                FilterAction::Pass(message) => message,
            };

            let forward = BusEnvelope::new(channel, origin, message);
            let result = match origin {
                Origin::Frontend => self.bus.send_to_backend(forward).await,
                Origin::Backend => self.bus.send_to_frontend(forward).await,
            };
            if let Err(e) = result {
                error!(error = %e, "failed to forward message");
            }
        }
        .instrument(span)
        .await;
    }

    /// Emits an event to the front-end, optionally correlated to a request.
    async fn send_event(
        &self,
        channel: Channel,
        msg_type: &str,
        content: Value,
        parent: Option<&str>,
    ) {
        let mut message = BusMessage::new(msg_type, content);
        if let Some(parent) = parent {
            message = message.with_parent(parent);
        }
        if let Err(e) = self
            .bus
            .send_to_frontend(BusEnvelope::from_backend(channel, message))
            .await
        {
            warn!(error = %e, msg_type, "failed to emit event");
        }
    }

    /// Handles a `context_setup_request` from the front-end.
    ///
    /// Always finishes with an idle status event carrying the originating
    /// request's id as its parent, whether or not setup succeeded.
    async fn handle_context_setup(self: Arc<Self>, message: BusMessage) {
        let request_id = message.msg_id.clone();
        let span = info_span!("context_setup", request_id = %request_id);
        async {
            let context_kind = message
                .content
                .get("context")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let context_info = message
                .content
                .get("context_info")
                .cloned()
                .unwrap_or_else(|| json!({}));
            info!(context = %context_kind, "context setup requested");

            match context_kind.as_str() {
                "dataset" => {
                    if let Err(e) = self.setup_dataset_context(&context_info).await {
                        error!(error = %e, "context setup failed");
                        self.send_event(
                            Channel::IoPub,
                            "stream",
                            json!({
                                "name": "stderr",
                                "text": format!("Context setup failed: {}\n", e),
                            }),
                            Some(&request_id),
                        )
                        .await;
                    } else {
                        self.send_preview(&request_id).await;
                    }
                }
                "" => debug!("context setup without a context kind"),
                other => warn!(context = other, "unknown context kind"),
            }

            self.send_event(
                Channel::IoPub,
                "status",
                json!({"execution_state": "idle"}),
                Some(&request_id),
            )
            .await;
        }
        .instrument(span)
        .await;
    }

    /// Selects the dataset, rebuilds the policy context from scratch, and
    /// loads the dataframe into the kernel.
    async fn setup_dataset_context(&self, context_info: &Value) -> Result<()> {
        let dataset_id = match context_info.get("id") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                return Err(MuxError::Dataset(
                    "context_info carries no dataset id".to_string(),
                ))
            }
        };

        self.dataset.set_dataset(&dataset_id).await?;

        // Replace-all: the previous subject's context must not leak into the
        // new one.
        self.context.clear_all();
        if let Some(prompt) = self.dataset.context_prompt() {
            self.context.add(&prompt);
        }

        let data_url = self.dataset.download_url(None).await?;
        let code = format!(
            "import pandas as pd\nimport numpy as np\nimport scipy\ndf = pd.read_csv({:?})\nprint(\"done\")",
            data_url
        );
        let outcome = self.correlator.execute(&code).await?;
        if !outcome.is_ok() {
            return Err(MuxError::Dataset(format!(
                "failed to load dataframe: {}",
                outcome.stderr_text()
            )));
        }
        Ok(())
    }

    /// Emits a tabular preview of the loaded dataframe. Failures only log;
    /// the preview is decoration, not part of the setup contract.
    async fn send_preview(&self, request_id: &str) {
        let outcome = match self
            .correlator
            .execute("print(df.head(30).to_json(orient=\"split\"))")
            .await
        {
            Ok(outcome) if outcome.is_ok() => outcome,
            Ok(outcome) => {
                warn!(stderr = %outcome.stderr_text(), "dataset preview failed in kernel");
                return;
            }
            Err(e) => {
                warn!(error = %e, "dataset preview exchange failed");
                return;
            }
        };

        let raw = outcome.stdout_text();
        let split: Value = match serde_json::from_str(raw.trim()) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "dataset preview output was not valid JSON");
                return;
            }
        };
        let headers = split.get("columns").cloned().unwrap_or_else(|| json!([]));
        let data = split
            .get("data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut rows = vec![headers.clone()];
        rows.extend(data);

        let name = self
            .dataset
            .current()
            .map(|meta| meta.name)
            .unwrap_or_else(|| "Temp dataset (not saved)".to_string());
        self.send_event(
            Channel::IoPub,
            "dataset",
            json!({"name": name, "headers": headers, "csv": rows}),
            Some(request_id),
        )
        .await;
    }

    /// Handles an `llm_request` from the front-end: runs the agent loop and
    /// routes its terminal output as either a structured action or plain
    /// text.
    async fn handle_llm_request(self: Arc<Self>, message: BusMessage) {
        let request_id = message.msg_id.clone();
        let Some(request) = message
            .content
            .get("request")
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            debug!("llm_request without request text ignored");
            return;
        };

        let span = info_span!("llm_request", request_id = %request_id);
        async {
            // Thought events are best-effort: dropped, not awaited, when the
            // front-end queue is full.
            let bus = self.bus.clone();
            let parent = request_id.clone();
            let observer: ThoughtObserver = Arc::new(move |thought, tool, input| {
                let event = BusMessage::new(
                    "llm_thought",
                    json!({"thought": thought, "tool": tool, "input": input}),
                )
                .with_parent(&parent);
                if let Err(e) = bus.try_send_to_frontend(BusEnvelope::from_backend(Channel::IoPub, event))
                {
                    debug!(error = %e, "thought event dropped");
                }
            });

            let ctx = ToolContext::new()
                .with_correlator(Arc::clone(&self.correlator))
                .with_policy(Arc::clone(&self.policy))
                .with_dataset(self.dataset.clone());

            let agent = AgentLoop::new(
                Arc::clone(&self.policy),
                Arc::clone(&self.tools),
                self.context.clone(),
            )
            .with_config(&self.config.agent)
            .with_observer(observer);

            match agent.run(&request, &ctx).await {
                Ok(Termination::Answer(text)) => match classify_output(&text) {
                    AgentReply::CodeCell { language, content } => {
                        self.send_event(
                            Channel::IoPub,
                            "code_cell",
                            json!({"language": language, "code": content}),
                            Some(&request_id),
                        )
                        .await;
                    }
                    AgentReply::Text(text) => {
                        self.send_event(
                            Channel::IoPub,
                            "llm_response",
                            json!({"name": "response_text", "text": text}),
                            Some(&request_id),
                        )
                        .await;
                    }
                },
                Ok(Termination::IterationCap(cap)) => {
                    warn!(cap, "agent loop hit its iteration cap");
                    self.send_event(
                        Channel::Shell,
                        "llm_reply",
                        json!({"status": "aborted", "reason": "iteration_cap", "iterations": cap}),
                        Some(&request_id),
                    )
                    .await;
                }
                Err(e) => {
                    error!(error = %e, "agent loop failed");
                    self.send_event(
                        Channel::IoPub,
                        "stream",
                        json!({"name": "stderr", "text": format!("LLM Error:\n{}\n", e)}),
                        Some(&request_id),
                    )
                    .await;
                    self.send_event(
                        Channel::Shell,
                        "llm_reply",
                        json!({"status": "error", "error": e.to_string()}),
                        Some(&request_id),
                    )
                    .await;
                }
            }
        }
        .instrument(span)
        .await;
    }

    /// Provisions a kernel session, replacing (and destroying) any session
    /// already held.
    ///
    /// # Errors
    /// Provisioning and destruction failures surface as
    /// [`MuxError::Backend`]; nothing is retried, and a failed replacement
    /// leaves no session attached rather than a stale one.
    pub async fn provision_backend(&self) -> Result<String> {
        let mut slot = self.backend.lock().await;
        let session = match slot.take() {
            Some(existing) => existing.replace(&self.config.backend).await?,
            None => BackendSession::provision(&self.config.backend).await?,
        };
        let kernel_id = session.kernel_id().to_string();
        *slot = Some(session);
        Ok(kernel_id)
    }

    /// Destroys the held kernel session, if any.
    pub async fn destroy_backend(&self) -> Result<()> {
        let session = self.backend.lock().await.take();
        match session {
            Some(session) => session.destroy().await,
            None => Ok(()),
        }
    }

    /// The id of the currently attached kernel, if one is provisioned.
    pub async fn backend_kernel_id(&self) -> Option<String> {
        self.backend
            .lock()
            .await
            .as_ref()
            .map(|s| s.kernel_id().to_string())
    }

    /// The shared bus.
    pub fn bus(&self) -> &KernelBus {
        &self.bus
    }

    /// The filter chain (for registering additional interceptors).
    pub fn filters(&self) -> &Arc<FilterChain> {
        &self.filters
    }

    /// The exchange correlator.
    pub fn correlator(&self) -> &Arc<ExchangeCorrelator> {
        &self.correlator
    }

    /// The policy context store.
    pub fn context(&self) -> &ContextStore {
        &self.context
    }

    /// The dataset store.
    pub fn dataset(&self) -> &DatasetStore {
        &self.dataset
    }

    /// The broker configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }
}
