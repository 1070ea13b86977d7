//! Isolated evaluation of player transform functions
//!
//! Transform code extracted from a player bundle is untrusted. It is handed to
//! a [`CodeEvaluator`] as data and compiled through the `Function`
//! constructor inside an embedded V8 isolate that runs on its own thread, with
//! a mocked browser environment and a watchdog per call.

use crate::error::StreamError;
use async_trait::async_trait;
use deno_core::{v8, FastString, JsRuntime, RuntimeOptions};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Kind of transform being evaluated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransformKind {
    /// Throttling parameter (`n`) transform
    #[serde(rename = "n-sig")]
    NSig,
    /// Signature cipher transform
    #[serde(rename = "cipher")]
    Cipher,
}

impl TransformKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransformKind::NSig => "n-sig",
            TransformKind::Cipher => "cipher",
        }
    }
}

impl std::fmt::Display for TransformKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request sent to a code evaluation service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalRequest {
    pub kind: TransformKind,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arg_name: Option<String>,
    pub inputs: Vec<String>,
}

/// Response from a code evaluation service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvalResponse {
    pub results: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<(usize, String)>,
}

/// Boundary where untrusted code is executed.
///
/// Implementations return `Err` only when the batch as a whole could not run
/// (the code failed to compile, the service is gone). Per-input failures are
/// reported through [`EvalResponse::errors`].
#[async_trait]
pub trait CodeEvaluator: Send + Sync {
    async fn evaluate(&self, request: EvalRequest) -> Result<EvalResponse, StreamError>;
}

/// Sandbox configuration
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Wall-clock budget for one transform call
    pub call_timeout: Duration,
    /// Largest transform source accepted
    pub max_code_len: usize,
    /// Extra budget on top of the per-call budget for a whole batch
    pub batch_overhead: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(2),
            max_code_len: 512 * 1024,
            batch_overhead: Duration::from_secs(5),
        }
    }
}

/// Outcome of one batch evaluation
#[derive(Debug)]
pub struct EvalOutcome {
    /// One output per input, in input order
    pub outputs: Vec<String>,
    /// `SandboxEval` errors for inputs that fell back to their original value
    pub errors: Vec<StreamError>,
    /// Set when the whole batch fell back (compile failure, timeout)
    pub batch_error: Option<StreamError>,
}

impl EvalOutcome {
    fn identity(inputs: &[String], error: StreamError) -> Self {
        Self {
            outputs: inputs.to_vec(),
            errors: Vec::new(),
            batch_error: Some(error),
        }
    }

    /// Check whether output `index` is a real transform result
    pub fn is_transformed(&self, index: usize) -> bool {
        self.batch_error.is_none()
            && !self
                .errors
                .iter()
                .any(|e| matches!(e, StreamError::SandboxEval { index: i, .. } if *i == index))
    }
}

/// Contract-enforcing front of a [`CodeEvaluator`]
pub struct CodeSandbox {
    evaluator: Arc<dyn CodeEvaluator>,
    config: SandboxConfig,
    calls: AtomicU64,
}

impl CodeSandbox {
    /// Create a sandbox over an arbitrary evaluator
    pub fn new(evaluator: Arc<dyn CodeEvaluator>) -> Self {
        Self::with_config(evaluator, SandboxConfig::default())
    }

    pub fn with_config(evaluator: Arc<dyn CodeEvaluator>, config: SandboxConfig) -> Self {
        Self {
            evaluator,
            config,
            calls: AtomicU64::new(0),
        }
    }

    /// Create a sandbox backed by the embedded V8 evaluator
    pub fn embedded(config: SandboxConfig) -> Result<Self, StreamError> {
        let evaluator = DenoEvaluator::spawn(config.call_timeout)?;
        Ok(Self::with_config(Arc::new(evaluator), config))
    }

    /// Number of batches routed to the evaluator
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Evaluate `code` against every input.
    ///
    /// Never fails: any input that could not be transformed comes back
    /// unchanged with an error recorded next to it.
    pub async fn evaluate(
        &self,
        kind: TransformKind,
        code: &str,
        arg_name: Option<&str>,
        inputs: &[String],
    ) -> EvalOutcome {
        if inputs.is_empty() {
            return EvalOutcome {
                outputs: Vec::new(),
                errors: Vec::new(),
                batch_error: None,
            };
        }

        if let Err(e) = validate_source(code, arg_name, self.config.max_code_len) {
            warn!("Rejected {} transform before evaluation: {}", kind, e);
            return EvalOutcome::identity(inputs, e);
        }

        self.calls.fetch_add(1, Ordering::SeqCst);
        let request = EvalRequest {
            kind,
            code: code.to_string(),
            arg_name: arg_name.map(str::to_string),
            inputs: inputs.to_vec(),
        };

        let budget = self.config.batch_overhead + self.config.call_timeout * inputs.len() as u32;
        let response = match tokio::time::timeout(budget, self.evaluator.evaluate(request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!("{} batch of {} fell back to original values: {}", kind, inputs.len(), e);
                return EvalOutcome::identity(inputs, e);
            }
            Err(_) => {
                warn!("{} batch of {} timed out after {:?}", kind, inputs.len(), budget);
                return EvalOutcome::identity(
                    inputs,
                    StreamError::TimeoutError(format!("{} batch exceeded {:?}", kind, budget)),
                );
            }
        };

        let mut outputs = Vec::with_capacity(inputs.len());
        let mut errors = Vec::new();
        let failed: HashMap<usize, String> = response.errors.into_iter().collect();

        for (index, input) in inputs.iter().enumerate() {
            if let Some(message) = failed.get(&index) {
                outputs.push(input.clone());
                errors.push(StreamError::SandboxEval {
                    index,
                    message: message.clone(),
                });
                continue;
            }
            match response.results.get(index) {
                Some(result) => outputs.push(result.clone()),
                None => {
                    outputs.push(input.clone());
                    errors.push(StreamError::SandboxEval {
                        index,
                        message: "evaluator returned no result".to_string(),
                    });
                }
            }
        }

        debug!(
            "{} batch: {} inputs, {} fell back",
            kind,
            inputs.len(),
            errors.len()
        );

        EvalOutcome {
            outputs,
            errors,
            batch_error: None,
        }
    }
}

const FORBIDDEN_TOKENS: &[&str] = &[
    "import(",
    "require(",
    "fetch(",
    "XMLHttpRequest",
    "WebSocket",
    "Deno.",
];

/// Reject transform sources that are obviously not a pure string transform
pub fn validate_source(
    code: &str,
    arg_name: Option<&str>,
    max_len: usize,
) -> Result<(), StreamError> {
    if code.trim().is_empty() {
        return Err(StreamError::SandboxCompile("empty transform source".to_string()));
    }
    if code.len() > max_len {
        return Err(StreamError::SandboxCompile(format!(
            "transform source is {} bytes, limit is {}",
            code.len(),
            max_len
        )));
    }
    if let Some(token) = FORBIDDEN_TOKENS.iter().find(|t| code.contains(*t)) {
        return Err(StreamError::SandboxCompile(format!(
            "transform source references host API `{}`",
            token
        )));
    }
    if let Some(arg) = arg_name {
        let valid = !arg.is_empty()
            && arg
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$');
        if !valid {
            return Err(StreamError::SandboxCompile(format!(
                "invalid argument name `{}`",
                arg
            )));
        }
    }
    Ok(())
}

/// Browser globals the transform code may look up
const ENV_PRELUDE: &str = r#"
(function () {
    var g = globalThis;
    function memoryStorage() {
        var data = new Map();
        return {
            getItem: function (k) { k = String(k); return data.has(k) ? data.get(k) : null; },
            setItem: function (k, v) { data.set(String(k), String(v)); },
            removeItem: function (k) { data.delete(String(k)); },
            clear: function () { data.clear(); },
            key: function (i) { var keys = Array.from(data.keys()); return i < keys.length ? keys[i] : null; },
            get length() { return data.size; }
        };
    }
    function unavailable(name) {
        return function () { throw new Error(name + " is not available"); };
    }
    g.window = g;
    g.self = g;
    g.location = {
        href: "https://www.youtube.com/watch",
        origin: "https://www.youtube.com",
        protocol: "https:",
        host: "www.youtube.com",
        hostname: "www.youtube.com",
        pathname: "/watch",
        search: "",
        hash: ""
    };
    g.navigator = {
        userAgent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/135.0.0.0 Safari/537.36",
        language: "en-US",
        languages: ["en-US", "en"],
        platform: "Win32",
        onLine: true,
        cookieEnabled: false
    };
    g.localStorage = memoryStorage();
    g.sessionStorage = memoryStorage();
    g.document = {
        cookie: "",
        referrer: "",
        createElement: function () { return {}; },
        getElementById: function () { return null; },
        querySelector: function () { return null; }
    };
    g.fetch = unavailable("fetch");
    g.XMLHttpRequest = unavailable("XMLHttpRequest");
    g.WebSocket = unavailable("WebSocket");
    try { delete g.Deno; } catch (_) {}

    // Compiled transforms live in this closure, out of reach of each other
    var fns = [];
    Object.defineProperty(g, "__ytstream", {
        value: Object.freeze({
            define: function (slot, fn) {
                if (typeof fn !== "function") {
                    throw new TypeError("transform is not callable");
                }
                fns[slot] = fn;
            },
            call: function (slot, input) {
                var out = fns[slot](input);
                if (typeof out !== "string") {
                    throw new TypeError("transform returned " + typeof out);
                }
                return out;
            }
        }),
        writable: false,
        configurable: false
    });

    // Transforms share one realm, so the builtins they use are locked
    [Object, Function, Array, String, Number, Boolean, RegExp, Math, JSON, Date, Map, Set]
        .forEach(function (builtin) {
            Object.freeze(builtin);
            if (builtin.prototype) {
                Object.freeze(builtin.prototype);
            }
        });
    ["Object", "Function", "Array", "String", "Number", "Boolean", "RegExp", "Math",
     "JSON", "Date", "Map", "Set", "parseInt", "parseFloat", "isNaN",
     "decodeURIComponent", "encodeURIComponent"]
        .forEach(function (name) {
            Object.defineProperty(g, name, { writable: false, configurable: false });
        });
})();
"#;

struct Job {
    request: EvalRequest,
    reply: oneshot::Sender<Result<EvalResponse, StreamError>>,
}

/// [`CodeEvaluator`] backed by an embedded V8 isolate
pub struct DenoEvaluator {
    jobs: mpsc::Sender<Job>,
    compilations: Arc<AtomicUsize>,
}

impl DenoEvaluator {
    /// Start the isolate thread
    pub fn spawn(call_timeout: Duration) -> Result<Self, StreamError> {
        let (jobs, rx) = mpsc::channel::<Job>();
        let compilations = Arc::new(AtomicUsize::new(0));
        let counter = compilations.clone();

        std::thread::Builder::new()
            .name("ytstream-sandbox".into())
            .spawn(move || worker_loop(rx, call_timeout, counter))?;

        Ok(Self { jobs, compilations })
    }

    /// Number of distinct transforms compiled so far
    pub fn compilations(&self) -> usize {
        self.compilations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CodeEvaluator for DenoEvaluator {
    async fn evaluate(&self, request: EvalRequest) -> Result<EvalResponse, StreamError> {
        let (reply, rx) = oneshot::channel();
        self.jobs
            .send(Job { request, reply })
            .map_err(|_| StreamError::Generic("sandbox thread has stopped".to_string()))?;
        rx.await
            .map_err(|_| StreamError::Generic("sandbox thread dropped the request".to_string()))?
    }
}

fn worker_loop(rx: mpsc::Receiver<Job>, call_timeout: Duration, compilations: Arc<AtomicUsize>) {
    let mut worker = match SandboxWorker::new(call_timeout, compilations) {
        Ok(worker) => worker,
        Err(e) => {
            warn!("Sandbox isolate failed to start: {}", e);
            for job in rx {
                let _ = job
                    .reply
                    .send(Err(StreamError::SandboxCompile(format!("isolate unavailable: {}", e))));
            }
            return;
        }
    };

    for job in rx {
        let result = worker.run(&job.request);
        let _ = job.reply.send(result);
    }
    debug!("Sandbox thread exiting");
}

struct SandboxWorker {
    runtime: JsRuntime,
    slots: HashMap<u64, usize>,
    call_timeout: Duration,
    compilations: Arc<AtomicUsize>,
}

impl SandboxWorker {
    fn new(call_timeout: Duration, compilations: Arc<AtomicUsize>) -> Result<Self, String> {
        let mut runtime = JsRuntime::new(RuntimeOptions::default());
        runtime
            .execute_script("<sandbox-env>", FastString::from(ENV_PRELUDE.to_string()))
            .map_err(|e| format!("environment setup failed: {}", e))?;
        Ok(Self {
            runtime,
            slots: HashMap::new(),
            call_timeout,
            compilations,
        })
    }

    fn run(&mut self, request: &EvalRequest) -> Result<EvalResponse, StreamError> {
        let slot = self.compile(request)?;

        let mut response = EvalResponse {
            results: Vec::with_capacity(request.inputs.len()),
            errors: Vec::new(),
        };
        for (index, input) in request.inputs.iter().enumerate() {
            match self.call(slot, input) {
                Ok(output) => response.results.push(output),
                Err(message) => {
                    response.results.push(input.clone());
                    response.errors.push((index, message));
                }
            }
        }
        Ok(response)
    }

    fn compile(&mut self, request: &EvalRequest) -> Result<usize, StreamError> {
        let mut hasher = DefaultHasher::new();
        request.kind.hash(&mut hasher);
        request.arg_name.hash(&mut hasher);
        request.code.hash(&mut hasher);
        let key = hasher.finish();

        if let Some(slot) = self.slots.get(&key) {
            return Ok(*slot);
        }

        let slot = self.slots.len();
        let code = serde_json::to_string(&request.code)?;
        let builder = match &request.arg_name {
            Some(arg) => format!("new Function({}, {})", serde_json::to_string(arg)?, code),
            None => format!("(new Function(\"return (\" + {} + \");\"))()", code),
        };
        let script = format!("globalThis.__ytstream.define({slot}, {builder});\n\"ok\";");

        self.run_guarded("<compile>", script)
            .map_err(|e| StreamError::SandboxCompile(format!("{} transform: {}", request.kind, e)))?;

        self.slots.insert(key, slot);
        self.compilations.fetch_add(1, Ordering::SeqCst);
        debug!("Compiled {} transform into slot {}", request.kind, slot);
        Ok(slot)
    }

    fn call(&mut self, slot: usize, input: &str) -> Result<String, String> {
        let arg = serde_json::to_string(input).map_err(|e| e.to_string())?;
        let script = format!("globalThis.__ytstream.call({slot}, {arg})");
        self.run_guarded("<call>", script)
    }

    /// Run a script with a watchdog that terminates it after `call_timeout`
    fn run_guarded(&mut self, name: &'static str, script: String) -> Result<String, String> {
        let handle = self.runtime.v8_isolate().thread_safe_handle();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let timeout = self.call_timeout;

        let watchdog = std::thread::spawn(move || match done_rx.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => handle.terminate_execution(),
            _ => false,
        });

        let result = self.runtime.execute_script(name, FastString::from(script));
        let _ = done_tx.send(());
        let timed_out = watchdog.join().unwrap_or(false);

        if timed_out {
            self.runtime.v8_isolate().cancel_terminate_execution();
            return Err(format!("execution exceeded {:?}", timeout));
        }

        let value = result.map_err(|e| e.to_string())?;
        let scope = &mut self.runtime.handle_scope();
        let local = v8::Local::new(scope, value);
        Ok(local.to_rust_string_lossy(scope))
    }
}
