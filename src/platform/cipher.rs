//! Signature and throttling-parameter resolution
//!
//! The player bundle carries two transform functions: the signature cipher
//! (applied to the `s` value of ciphered streams) and the `n` transform
//! (applied to the throttling parameter). Both are located with regexes,
//! extracted as self-contained source and run through the [`CodeSandbox`].

use crate::error::StreamError;
use crate::platform::client::VideoClient;
use crate::platform::formats::{ResolvedFormat, StreamDescriptor};
use crate::platform::sandbox::{CodeSandbox, TransformKind};
use crate::utils::cache::{new_async_cache_with_capacity, AsyncCache};
use crate::utils::url::{bundle_fingerprint, set_query_param};
use async_trait::async_trait;
use regex::Regex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Where player bundles come from
#[async_trait]
pub trait BundleSource: Send + Sync {
    async fn fetch_bundle(&self, url: &str) -> Result<String, StreamError>;
}

/// Fetches player bundles over HTTP, keeping recent ones in memory
pub struct HttpBundleSource {
    client: VideoClient,
    cache: AsyncCache<String, Arc<String>>,
}

impl HttpBundleSource {
    pub fn new(client: VideoClient) -> Self {
        Self {
            client,
            cache: new_async_cache_with_capacity(Duration::from_secs(3600), 8),
        }
    }
}

#[async_trait]
impl BundleSource for HttpBundleSource {
    async fn fetch_bundle(&self, url: &str) -> Result<String, StreamError> {
        let client = &self.client;
        let content = self
            .cache
            .try_get_with(url.to_string(), async move {
                debug!("Fetching player bundle {}", url);
                client.get_text(url).await.map(Arc::new)
            })
            .await
            .map_err(|e| StreamError::Generic(format!("player bundle fetch failed: {}", e)))?;
        Ok(content.as_str().to_string())
    }
}

/// Reference to one player bundle version
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BundleRef {
    pub url: String,
    pub fingerprint: String,
}

impl BundleRef {
    /// Fingerprint from the `/s/player/<hash>/` path, or a hash of the URL
    pub fn new(url: &str) -> Self {
        let fingerprint = bundle_fingerprint(url).unwrap_or_else(|| {
            let mut hasher = DefaultHasher::new();
            url.hash(&mut hasher);
            format!("url-{:016x}", hasher.finish())
        });
        Self {
            url: url.to_string(),
            fingerprint,
        }
    }
}

/// Self-contained transform source extracted from a bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformFunction {
    pub kind: TransformKind,
    pub code: String,
    pub arg_name: Option<String>,
    pub fingerprint: String,
}

/// Everything extracted from one bundle version
#[derive(Debug, Clone)]
pub struct TransformSet {
    pub fingerprint: String,
    pub cipher: Result<TransformFunction, String>,
    pub n_sig: Result<TransformFunction, String>,
    pub signature_timestamp: Option<u32>,
}

impl TransformSet {
    /// Run every extractor over `js`
    pub fn extract(js: &str, fingerprint: &str) -> Self {
        let cipher = extract_cipher(js, fingerprint).map_err(|e| e.to_string());
        let n_sig = extract_n_sig(js, fingerprint).map_err(|e| e.to_string());
        if let Err(reason) = &cipher {
            warn!("Cipher transform not found in bundle {}: {}", fingerprint, reason);
        }
        if let Err(reason) = &n_sig {
            warn!("n-sig transform not found in bundle {}: {}", fingerprint, reason);
        }
        Self {
            fingerprint: fingerprint.to_string(),
            cipher,
            n_sig,
            signature_timestamp: extract_signature_timestamp(js),
        }
    }

    fn get(&self, kind: TransformKind) -> Result<&TransformFunction, StreamError> {
        let slot = match kind {
            TransformKind::Cipher => &self.cipher,
            TransformKind::NSig => &self.n_sig,
        };
        slot.as_ref()
            .map_err(|reason| StreamError::TransformExtraction {
                fingerprint: self.fingerprint.clone(),
                reason: format!("{}: {}", kind, reason),
            })
    }
}

/// A descriptor that could not be resolved
#[derive(Debug)]
pub struct DescriptorError {
    pub itag: u32,
    pub error: StreamError,
}

/// Result of resolving a set of descriptors
#[derive(Debug, Default)]
pub struct SignatureResolution {
    pub formats: Vec<ResolvedFormat>,
    pub errors: Vec<DescriptorError>,
}

impl SignatureResolution {
    /// True when every failure is a missing transform
    pub fn only_extraction_errors(&self) -> bool {
        self.errors
            .iter()
            .all(|e| matches!(e.error, StreamError::TransformExtraction { .. }))
    }
}

/// Resolves scrambled descriptors into fetchable formats
pub struct SignatureResolver {
    bundles: Arc<dyn BundleSource>,
    sandbox: Arc<CodeSandbox>,
    transforms: AsyncCache<String, Arc<TransformSet>>,
    extractions: AtomicU64,
}

impl SignatureResolver {
    pub fn new(bundles: Arc<dyn BundleSource>, sandbox: Arc<CodeSandbox>) -> Self {
        Self::with_capacity(bundles, sandbox, 16)
    }

    /// `capacity` bounds the number of bundle versions kept
    pub fn with_capacity(
        bundles: Arc<dyn BundleSource>,
        sandbox: Arc<CodeSandbox>,
        capacity: u64,
    ) -> Self {
        Self {
            bundles,
            sandbox,
            transforms: new_async_cache_with_capacity(Duration::from_secs(24 * 3600), capacity),
            extractions: AtomicU64::new(0),
        }
    }

    /// Number of bundles fetched and parsed so far
    pub fn extraction_count(&self) -> u64 {
        self.extractions.load(Ordering::SeqCst)
    }

    /// Transforms for a bundle, extracted once per fingerprint
    pub async fn transforms(&self, bundle: &BundleRef) -> Result<Arc<TransformSet>, StreamError> {
        let bundles = self.bundles.clone();
        let extractions = &self.extractions;
        self.transforms
            .try_get_with(bundle.fingerprint.clone(), async move {
                let js = bundles.fetch_bundle(&bundle.url).await?;
                extractions.fetch_add(1, Ordering::SeqCst);
                info!(
                    "Extracting transforms from bundle {} ({} bytes)",
                    bundle.fingerprint,
                    js.len()
                );
                Ok::<_, StreamError>(Arc::new(TransformSet::extract(&js, &bundle.fingerprint)))
            })
            .await
            .map_err(|e| StreamError::TransformExtraction {
                fingerprint: bundle.fingerprint.clone(),
                reason: e.to_string(),
            })
    }

    /// Signature timestamp advertised by the bundle, if any
    pub async fn signature_timestamp(&self, bundle: &BundleRef) -> Result<Option<u32>, StreamError> {
        Ok(self.transforms(bundle).await?.signature_timestamp)
    }

    /// Resolve descriptors for `persona`.
    ///
    /// Plain descriptors pass through without touching the bundle. All
    /// distinct `n` values go to the sandbox in one batch, cipher values in
    /// another.
    pub async fn resolve(
        &self,
        bundle: Option<&BundleRef>,
        descriptors: &[StreamDescriptor],
        persona: &str,
    ) -> SignatureResolution {
        let mut resolution = SignatureResolution::default();
        let mut pending: Vec<Pending> = Vec::new();

        for descriptor in descriptors {
            if descriptor.is_scrambled() {
                if let Some(url) = descriptor.base_url() {
                    pending.push(Pending {
                        descriptor,
                        url: url.to_string(),
                    });
                }
            } else if let Some(url) = &descriptor.url {
                resolution
                    .formats
                    .push(ResolvedFormat::from_descriptor(descriptor, url.clone(), persona));
            }
        }

        if pending.is_empty() {
            return resolution;
        }

        let set = match bundle {
            Some(bundle) => self.transforms(bundle).await,
            None => Err(StreamError::TransformExtraction {
                fingerprint: "none".to_string(),
                reason: "no player bundle available".to_string(),
            }),
        };
        let set = match set {
            Ok(set) => set,
            Err(e) => {
                for p in pending {
                    resolution.errors.push(DescriptorError {
                        itag: p.descriptor.itag,
                        error: clone_extraction_error(&e),
                    });
                }
                return resolution;
            }
        };

        let pending = self
            .apply_kind(&set, TransformKind::Cipher, pending, &mut resolution)
            .await;
        let pending = self
            .apply_kind(&set, TransformKind::NSig, pending, &mut resolution)
            .await;

        for p in pending {
            resolution
                .formats
                .push(ResolvedFormat::from_descriptor(p.descriptor, p.url, persona));
        }

        debug!(
            "Resolved {} formats for {} ({} excluded)",
            resolution.formats.len(),
            persona,
            resolution.errors.len()
        );
        resolution
    }

    async fn apply_kind<'a>(
        &self,
        set: &TransformSet,
        kind: TransformKind,
        pending: Vec<Pending<'a>>,
        resolution: &mut SignatureResolution,
    ) -> Vec<Pending<'a>> {
        let (needing, mut done): (Vec<Pending<'a>>, Vec<Pending<'a>>) = pending
            .into_iter()
            .partition(|p| input_for(p.descriptor, kind).is_some());

        if needing.is_empty() {
            return done;
        }

        let transform = match set.get(kind) {
            Ok(transform) => transform,
            Err(e) => {
                for p in needing {
                    resolution.errors.push(DescriptorError {
                        itag: p.descriptor.itag,
                        error: clone_extraction_error(&e),
                    });
                }
                return done;
            }
        };

        let mut inputs: Vec<String> = Vec::new();
        for p in &needing {
            if let Some(value) = input_for(p.descriptor, kind) {
                if !inputs.contains(&value) {
                    inputs.push(value);
                }
            }
        }

        let outcome = self
            .sandbox
            .evaluate(kind, &transform.code, transform.arg_name.as_deref(), &inputs)
            .await;

        let mut solved: HashMap<&str, &str> = HashMap::new();
        for (index, input) in inputs.iter().enumerate() {
            let output = &outcome.outputs[index];
            if outcome.is_transformed(index) && !output.starts_with("enhanced_except_") {
                solved.insert(input.as_str(), output.as_str());
            }
        }
        let failure_reason = |index: usize| -> String {
            if let Some(e) = &outcome.batch_error {
                return e.to_string();
            }
            outcome
                .errors
                .iter()
                .find(|e| matches!(e, StreamError::SandboxEval { index: i, .. } if *i == index))
                .map(|e| e.to_string())
                .unwrap_or_else(|| "transform returned an exception marker".to_string())
        };

        for mut p in needing {
            let Some(input) = input_for(p.descriptor, kind) else {
                continue;
            };
            let Some(output) = solved.get(input.as_str()) else {
                let index = inputs.iter().position(|i| *i == input).unwrap_or_default();
                resolution.errors.push(DescriptorError {
                    itag: p.descriptor.itag,
                    error: StreamError::SandboxEval {
                        index,
                        message: failure_reason(index),
                    },
                });
                continue;
            };

            let param = match kind {
                TransformKind::Cipher => p
                    .descriptor
                    .signature_cipher
                    .as_ref()
                    .map(|c| c.sp.as_str())
                    .unwrap_or("signature"),
                TransformKind::NSig => "n",
            };
            match set_query_param(&p.url, param, output) {
                Ok(url) => {
                    p.url = url;
                    done.push(p);
                }
                Err(e) => resolution.errors.push(DescriptorError {
                    itag: p.descriptor.itag,
                    error: e,
                }),
            }
        }

        done
    }
}

struct Pending<'a> {
    descriptor: &'a StreamDescriptor,
    url: String,
}

fn input_for(descriptor: &StreamDescriptor, kind: TransformKind) -> Option<String> {
    match kind {
        TransformKind::Cipher => descriptor.signature_cipher.as_ref().map(|c| c.s.clone()),
        TransformKind::NSig => descriptor.n_param(),
    }
}

fn clone_extraction_error(e: &StreamError) -> StreamError {
    match e {
        StreamError::TransformExtraction { fingerprint, reason } => {
            StreamError::TransformExtraction {
                fingerprint: fingerprint.clone(),
                reason: reason.clone(),
            }
        }
        other => StreamError::TransformExtraction {
            fingerprint: "unknown".to_string(),
            reason: other.to_string(),
        },
    }
}

fn extraction_error(fingerprint: &str, reason: &str) -> StreamError {
    StreamError::TransformExtraction {
        fingerprint: fingerprint.to_string(),
        reason: reason.to_string(),
    }
}

/// Locate the signature cipher function and its helper object
pub fn extract_cipher(js: &str, fingerprint: &str) -> Result<TransformFunction, StreamError> {
    let fn_regex =
        Regex::new(r#"function\s*[a-zA-Z0-9$]*\s*\(\s*([a-zA-Z0-9$]+)\s*\)\s*\{([\s\S]*?)\}"#)?;

    let (param, body) = fn_regex
        .captures_iter(js)
        .filter_map(|c| Some((c.get(1)?.as_str(), c.get(2)?.as_str())))
        .find(|(param, body)| {
            body.contains(&format!("{}={}.split(\"\")", param, param))
                && body.contains(&format!("return {}.join(\"\")", param))
        })
        .ok_or_else(|| extraction_error(fingerprint, "cipher function not found"))?;

    let obj_name_regex = Regex::new(&format!(
        r#"([a-zA-Z0-9$]+)\.[a-zA-Z0-9$]+\({}(?:,\s*\d+)?\)"#,
        regex::escape(param)
    ))?;

    let mut code = String::new();
    if let Some(obj_name) = obj_name_regex.captures(body).and_then(|c| c.get(1)) {
        let obj_name = obj_name.as_str();
        let obj_start = Regex::new(&format!(
            r#"(?:var|let|const)\s+{}\s*=\s*\{{"#,
            regex::escape(obj_name)
        ))?;
        let open = obj_start
            .find(js)
            .map(|m| m.end() - 1)
            .ok_or_else(|| extraction_error(fingerprint, "cipher helper object not found"))?;
        let close = matching_brace(js, open)
            .ok_or_else(|| extraction_error(fingerprint, "cipher helper object is unbalanced"))?;
        code.push_str(&format!("var {}={};", obj_name, &js[open..=close]));
    }
    code.push_str(body);

    debug!("Extracted cipher transform ({} bytes) from {}", code.len(), fingerprint);
    Ok(TransformFunction {
        kind: TransformKind::Cipher,
        code,
        arg_name: Some(param.to_string()),
        fingerprint: fingerprint.to_string(),
    })
}

/// Locate the throttling (`n`) transform
pub fn extract_n_sig(js: &str, fingerprint: &str) -> Result<TransformFunction, StreamError> {
    let name = match find_n_function_name(js)? {
        Some(name) => name,
        None => {
            return extract_n_sig_by_marker(js, fingerprint)?
                .ok_or_else(|| extraction_error(fingerprint, "n-sig function not found"))
        }
    };

    let def_regex = Regex::new(&format!(
        r#"(?:function\s+{name}|[{{;,]\s*{name}\s*=\s*function|(?:var|let|const)\s+{name}\s*=\s*function)\s*\(\s*([a-zA-Z0-9$]+)\s*\)\s*\{{"#,
        name = regex::escape(&name)
    ))?;
    let captures = def_regex.captures(js).ok_or_else(|| {
        extraction_error(fingerprint, &format!("n-sig function {} has no definition", name))
    })?;
    let param = captures.get(1).map(|m| m.as_str()).unwrap_or("a");
    let open = captures.get(0).map(|m| m.end() - 1).unwrap_or_default();
    let close = matching_brace(js, open)
        .ok_or_else(|| extraction_error(fingerprint, "n-sig function body is unbalanced"))?;

    build_n_transform(js, param, &js[open + 1..close], fingerprint)
}

/// Name of the n function from its call site, following one array indirection
fn find_n_function_name(js: &str) -> Result<Option<String>, StreamError> {
    let call_regex =
        Regex::new(r#"\.get\("n"\)\)&&\(b=([a-zA-Z0-9$]+)(?:\[(\d+)\])?\([a-zA-Z0-9]\)"#)?;
    let Some(captures) = call_regex.captures(js) else {
        return Ok(None);
    };
    let name = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
    let Some(index) = captures.get(2).and_then(|m| m.as_str().parse::<usize>().ok()) else {
        return Ok(Some(name.to_string()));
    };

    let array_regex = Regex::new(&format!(
        r#"var\s+{}\s*=\s*\[([^\]]+)\]"#,
        regex::escape(name)
    ))?;
    Ok(array_regex
        .captures(js)
        .and_then(|c| c.get(1))
        .and_then(|list| list.as_str().split(',').nth(index))
        .map(|entry| entry.trim().to_string()))
}

/// Fall back to the function enclosing the `enhanced_except_` marker
fn extract_n_sig_by_marker(
    js: &str,
    fingerprint: &str,
) -> Result<Option<TransformFunction>, StreamError> {
    let Some(marker) = js.find("enhanced_except_") else {
        return Ok(None);
    };
    let head_regex = Regex::new(
        r#"(?:[a-zA-Z0-9$]+\s*=\s*function|function\s+[a-zA-Z0-9$]+)\s*\(\s*([a-zA-Z0-9$]+)\s*\)\s*\{"#,
    )?;

    let mut enclosing = None;
    for captures in head_regex.captures_iter(&js[..marker]) {
        let (Some(whole), Some(param)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        let open = whole.end() - 1;
        if let Some(close) = matching_brace(js, open) {
            if close > marker {
                enclosing = Some((param.as_str(), open, close));
            }
        }
    }

    match enclosing {
        Some((param, open, close)) => {
            build_n_transform(js, param, &js[open + 1..close], fingerprint).map(Some)
        }
        None => Ok(None),
    }
}

fn build_n_transform(
    js: &str,
    param: &str,
    body: &str,
    fingerprint: &str,
) -> Result<TransformFunction, StreamError> {
    // Early returns guarded on globals that only exist inside the full bundle
    let guard = Regex::new(
        r#";\s*if\s*\(\s*typeof\s+[a-zA-Z0-9_$]+\s*===?\s*(?:"undefined"|'undefined'|[a-zA-Z0-9_$]+\[\d+\])\s*\)\s*return\s+[a-zA-Z0-9_$]+;"#,
    )?;
    let body = guard.replace_all(body, ";");

    let mut code = String::new();
    if let Some((name, declaration)) = global_string_table(js)? {
        if body.contains(&name) {
            code.push_str(&declaration);
            code.push(';');
        }
    }
    code.push_str(&body);

    debug!("Extracted n-sig transform ({} bytes) from {}", code.len(), fingerprint);
    Ok(TransformFunction {
        kind: TransformKind::NSig,
        code,
        arg_name: Some(param.to_string()),
        fingerprint: fingerprint.to_string(),
    })
}

/// Bundle-wide `var X="...".split(";")` lookup table the transforms index into
fn global_string_table(js: &str) -> Result<Option<(String, String)>, StreamError> {
    let regex = Regex::new(
        r#"var\s+([a-zA-Z0-9_$]+)\s*=\s*("(?:[^"\\]|\\.)*"|'(?:[^'\\]|\\.)*')\.split\(("[^"]*"|'[^']*')\)"#,
    )?;
    Ok(regex.captures(js).and_then(|c| {
        let name = c.get(1)?.as_str().to_string();
        let declaration = c.get(0)?.as_str().to_string();
        Some((name, declaration))
    }))
}

/// `signatureTimestamp` (a.k.a. `sts`) embedded in the bundle
pub fn extract_signature_timestamp(js: &str) -> Option<u32> {
    let regex = Regex::new(r#"(?:signatureTimestamp|sts)\s*:\s*(\d{5})"#).ok()?;
    regex
        .captures(js)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Index of the `}` closing the `{` at `open`, skipping string literals
fn matching_brace(src: &str, open: usize) -> Option<usize> {
    let bytes = src.as_bytes();
    if bytes.get(open) != Some(&b'{') {
        return None;
    }
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    let mut i = open;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == b'\\' {
                    i += 1;
                } else if b == q {
                    quote = None;
                }
            }
            None => match b {
                b'"' | b'\'' | b'`' => quote = Some(b),
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(i);
                    }
                }
                _ => {}
            },
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::formats::SignatureCipher;
    use crate::platform::sandbox::{CodeEvaluator, EvalRequest, EvalResponse, SandboxConfig};
    use std::sync::Mutex;

    const PLAYER_JS: &str = r#"var Tb="alpha;beta;gamma".split(";");
var XY={ab:function(a,b){a.splice(0,b)},cd:function(a){a.reverse()},
ef:function(a,b){var c=a[0];a[0]=a[b%a.length];a[b%a.length]=c}};
var Sx=function(a){a=a.split("");XY.cd(a,1);XY.ef(a,2);XY.ab(a,1);return a.join("")};
var Nn=[Qx];
Qx=function(a){var b=a.split(""),c=b.length;if(typeof Zz==="undefined")return a;b.reverse();if(b.length>99){return "enhanced_except_"+Tb[0]}return b.join("")+"_"+c};
g.load=function(){var a=this.url,b;(b=a.get("n"))&&(b=Nn[0](b),a.set("n",b))};
var cfg={signatureTimestamp:20073,other:1};"#;

    struct FakeBundles {
        js: String,
        fetches: AtomicU64,
    }

    impl FakeBundles {
        fn new(js: &str) -> Arc<Self> {
            Arc::new(Self {
                js: js.to_string(),
                fetches: AtomicU64::new(0),
            })
        }
    }

    #[async_trait]
    impl BundleSource for FakeBundles {
        async fn fetch_bundle(&self, _url: &str) -> Result<String, StreamError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.js.clone())
        }
    }

    /// Uppercases inputs and records every batch
    struct RecordingEvaluator {
        batches: Mutex<Vec<EvalRequest>>,
    }

    #[async_trait]
    impl CodeEvaluator for RecordingEvaluator {
        async fn evaluate(&self, request: EvalRequest) -> Result<EvalResponse, StreamError> {
            let results = request
                .inputs
                .iter()
                .map(|i| {
                    if i == "poison" {
                        "enhanced_except_AbCd".to_string()
                    } else {
                        i.to_uppercase()
                    }
                })
                .collect();
            self.batches.lock().unwrap().push(request);
            Ok(EvalResponse {
                results,
                errors: Vec::new(),
            })
        }
    }

    fn recording() -> (Arc<RecordingEvaluator>, Arc<CodeSandbox>) {
        let evaluator = Arc::new(RecordingEvaluator {
            batches: Mutex::new(Vec::new()),
        });
        let sandbox = Arc::new(CodeSandbox::new(evaluator.clone()));
        (evaluator, sandbox)
    }

    fn plain(itag: u32, url: &str) -> StreamDescriptor {
        StreamDescriptor {
            itag,
            mime_type: "video/mp4".to_string(),
            bitrate: 1000,
            width: None,
            height: None,
            fps: None,
            quality_label: None,
            url: Some(url.to_string()),
            signature_cipher: None,
            content_length: None,
            video_codec: None,
            audio_codec: None,
            audio_sample_rate: None,
            audio_channels: None,
            drm: false,
        }
    }

    fn ciphered(itag: u32, s: &str, url: &str) -> StreamDescriptor {
        let mut d = plain(itag, url);
        d.url = None;
        d.signature_cipher = Some(SignatureCipher {
            s: s.to_string(),
            sp: "sig".to_string(),
            url: url.to_string(),
        });
        d
    }

    fn bundle() -> BundleRef {
        BundleRef::new("https://www.youtube.com/s/player/3bb1f723/player_ias.vflset/en_US/base.js")
    }

    #[test]
    fn test_extract_cipher_includes_helper_object() {
        let transform = extract_cipher(PLAYER_JS, "fp").unwrap();
        assert_eq!(transform.arg_name.as_deref(), Some("a"));
        assert!(transform.code.starts_with("var XY={ab:function(a,b){a.splice(0,b)}"));
        assert!(transform.code.ends_with("return a.join(\"\")"));
    }

    #[test]
    fn test_extract_n_sig_follows_array_and_strips_guard() {
        let transform = extract_n_sig(PLAYER_JS, "fp").unwrap();
        assert_eq!(transform.kind, TransformKind::NSig);
        assert!(!transform.code.contains("typeof Zz"));
        assert!(transform.code.starts_with("var Tb=\"alpha;beta;gamma\".split(\";\");"));
        assert!(transform.code.ends_with("return b.join(\"\")+\"_\"+c"));
    }

    #[test]
    fn test_extract_n_sig_by_marker_without_call_site() {
        let js = r#"var q=1;Mk=function(z){var y=z.split("");try{y.reverse()}catch(e){return "enhanced_except_"+z}return y.join("")};"#;
        let transform = extract_n_sig(js, "fp").unwrap();
        assert_eq!(transform.arg_name.as_deref(), Some("z"));
        assert!(transform.code.contains("enhanced_except_"));
    }

    #[test]
    fn test_extraction_failures() {
        assert!(matches!(
            extract_cipher("var x=1;", "fp"),
            Err(StreamError::TransformExtraction { .. })
        ));
        assert!(matches!(
            extract_n_sig("var x=1;", "fp"),
            Err(StreamError::TransformExtraction { .. })
        ));
    }

    #[test]
    fn test_signature_timestamp() {
        assert_eq!(extract_signature_timestamp(PLAYER_JS), Some(20073));
        assert_eq!(extract_signature_timestamp("sts:19876,"), Some(19876));
        assert_eq!(extract_signature_timestamp("nothing"), None);
    }

    #[test]
    fn test_matching_brace_skips_strings() {
        let src = r#"{a:"}",b:{c:'{'}}tail"#;
        assert_eq!(matching_brace(src, 0), Some(src.len() - 5));
        assert_eq!(matching_brace("{unterminated", 0), None);
    }

    #[test]
    fn test_bundle_ref_fingerprint() {
        assert_eq!(bundle().fingerprint, "3bb1f723");
        let other = BundleRef::new("https://cdn.example/player.js");
        assert!(other.fingerprint.starts_with("url-"));
        assert_eq!(other, BundleRef::new("https://cdn.example/player.js"));
    }

    #[tokio::test]
    async fn test_plain_descriptors_skip_bundle_and_sandbox() {
        let bundles = FakeBundles::new(PLAYER_JS);
        let (evaluator, sandbox) = recording();
        let resolver = SignatureResolver::new(bundles.clone(), sandbox.clone());

        let descriptors = vec![
            plain(18, "https://cdn.example/v?itag=18"),
            plain(140, "https://cdn.example/v?itag=140"),
        ];
        let resolution = resolver.resolve(Some(&bundle()), &descriptors, "android_vr").await;

        assert_eq!(resolution.formats.len(), 2);
        assert_eq!(resolution.formats[0].url, "https://cdn.example/v?itag=18");
        assert!(resolution.errors.is_empty());
        assert_eq!(sandbox.call_count(), 0);
        assert_eq!(bundles.fetches.load(Ordering::SeqCst), 0);
        assert!(evaluator.batches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_one_batch_per_kind() {
        let bundles = FakeBundles::new(PLAYER_JS);
        let (evaluator, sandbox) = recording();
        let resolver = SignatureResolver::new(bundles.clone(), sandbox.clone());

        let descriptors = vec![
            plain(18, "https://cdn.example/v?itag=18&n=aaa"),
            plain(22, "https://cdn.example/v?itag=22&n=aaa"),
            plain(137, "https://cdn.example/v?itag=137&n=bbb"),
            ciphered(140, "sig1", "https://cdn.example/v?itag=140&n=ccc"),
            ciphered(251, "sig2", "https://cdn.example/v?itag=251"),
        ];
        let resolution = resolver.resolve(Some(&bundle()), &descriptors, "web").await;

        assert!(resolution.errors.is_empty());
        assert_eq!(resolution.formats.len(), 5);
        assert_eq!(sandbox.call_count(), 2);

        let batches = evaluator.batches.lock().unwrap();
        assert_eq!(batches[0].kind, TransformKind::Cipher);
        assert_eq!(batches[0].inputs, vec!["sig1".to_string(), "sig2".to_string()]);
        assert_eq!(batches[1].kind, TransformKind::NSig);
        assert_eq!(
            batches[1].inputs,
            vec!["aaa".to_string(), "bbb".to_string(), "ccc".to_string()]
        );

        let by_itag = |itag: u32| {
            resolution
                .formats
                .iter()
                .find(|f| f.itag == itag)
                .map(|f| f.url.clone())
                .unwrap()
        };
        assert_eq!(by_itag(22), "https://cdn.example/v?itag=22&n=AAA");
        assert_eq!(by_itag(140), "https://cdn.example/v?itag=140&n=CCC&sig=SIG1");
        assert_eq!(by_itag(251), "https://cdn.example/v?itag=251&sig=SIG2");
    }

    #[tokio::test]
    async fn test_transforms_cached_per_fingerprint() {
        let bundles = FakeBundles::new(PLAYER_JS);
        let (_, sandbox) = recording();
        let resolver = SignatureResolver::new(bundles.clone(), sandbox);

        let descriptors = vec![plain(18, "https://cdn.example/v?itag=18&n=aaa")];
        resolver.resolve(Some(&bundle()), &descriptors, "web").await;
        resolver.resolve(Some(&bundle()), &descriptors, "mweb").await;

        assert_eq!(bundles.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(resolver.extraction_count(), 1);
        assert_eq!(resolver.signature_timestamp(&bundle()).await.unwrap(), Some(20073));
    }

    #[tokio::test]
    async fn test_missing_transform_excludes_only_dependent_descriptors() {
        // Cipher function present, n function absent
        let js = r#"var XY={cd:function(a){a.reverse()}};
var Sx=function(a){a=a.split("");XY.cd(a);return a.join("")};"#;
        let (_, sandbox) = recording();
        let resolver = SignatureResolver::new(FakeBundles::new(js), sandbox);

        let descriptors = vec![
            plain(18, "https://cdn.example/v?itag=18"),
            plain(22, "https://cdn.example/v?itag=22&n=aaa"),
            ciphered(140, "sig1", "https://cdn.example/v?itag=140"),
        ];
        let resolution = resolver.resolve(Some(&bundle()), &descriptors, "web").await;

        let itags: Vec<u32> = resolution.formats.iter().map(|f| f.itag).collect();
        assert_eq!(itags, vec![18, 140]);
        assert_eq!(resolution.errors.len(), 1);
        assert_eq!(resolution.errors[0].itag, 22);
        assert!(resolution.only_extraction_errors());
    }

    #[tokio::test]
    async fn test_exception_marker_output_is_a_failure() {
        let (_, sandbox) = recording();
        let resolver = SignatureResolver::new(FakeBundles::new(PLAYER_JS), sandbox);

        let descriptors = vec![
            plain(18, "https://cdn.example/v?itag=18&n=poison"),
            plain(22, "https://cdn.example/v?itag=22&n=fine"),
        ];
        let resolution = resolver.resolve(Some(&bundle()), &descriptors, "web").await;

        assert_eq!(resolution.formats.len(), 1);
        assert_eq!(resolution.formats[0].itag, 22);
        assert!(matches!(
            resolution.errors[0].error,
            StreamError::SandboxEval { .. }
        ));
    }

    #[tokio::test]
    async fn test_no_bundle_marks_scrambled_descriptors() {
        let (_, sandbox) = recording();
        let resolver = SignatureResolver::new(FakeBundles::new(PLAYER_JS), sandbox);
        let descriptors = vec![ciphered(140, "sig1", "https://cdn.example/v?itag=140")];

        let resolution = resolver.resolve(None, &descriptors, "web").await;
        assert!(resolution.formats.is_empty());
        assert!(resolution.only_extraction_errors());
    }

    #[tokio::test]
    async fn test_extracted_transforms_run_in_embedded_sandbox() {
        let sandbox = Arc::new(CodeSandbox::embedded(SandboxConfig::default()).unwrap());
        let resolver = SignatureResolver::new(FakeBundles::new(PLAYER_JS), sandbox);

        let descriptors = vec![ciphered(18, "abcdef", "https://cdn.example/v?itag=18&n=abc")];
        let resolution = resolver.resolve(Some(&bundle()), &descriptors, "web").await;

        assert!(resolution.errors.is_empty(), "{:?}", resolution.errors);
        assert_eq!(
            resolution.formats[0].url,
            "https://cdn.example/v?itag=18&n=cba_3&sig=efcba"
        );
    }
}
