//! Built-in benchmark functions
//!
//! A benchmark measures the backend's peak throughput in workload units per
//! second. The calibrator selects one by name from a closed registry; there
//! is no dynamic loading. A benchmark that cannot produce a measurement
//! returns the failure reason; the calibrator degrades to a default
//! throughput and keeps the reason visible instead of aborting boot.

use std::env;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};

pub type BenchmarkFuture = Pin<Box<dyn Future<Output = Result<f64, String>> + Send>>;
pub type BenchmarkFn = fn(reqwest::Client, String) -> BenchmarkFuture;

/// Resolve a benchmark by registry name.
pub fn lookup(name: &str) -> Option<BenchmarkFn> {
    match name {
        "openai" => Some(|client, url| Box::pin(openai(client, url))),
        "tgi" => Some(|client, url| Box::pin(tgi(client, url))),
        "comfyui" => Some(|client, url| Box::pin(comfyui(client, url))),
        _ => None,
    }
}

const WORD_LIST: &[&str] = &["test", "benchmark", "performance", "throughput", "workload"];

const SYSTEM_PROMPT: &str = "You are a helpful AI assistant. Answer the \
following question based on your knowledge of African equines and their \
distinctive black-and-white striped coats.";

fn clock_nanos() -> usize {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as usize)
        .unwrap_or(0)
}

fn random_prompt(words: usize) -> String {
    // Pseudo-random enough to defeat trivial response caching
    let mut seed = clock_nanos();
    let mut out = Vec::with_capacity(words);
    for i in 0..words {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(i);
        out.push(WORD_LIST[seed % WORD_LIST.len()]);
    }
    out.join(" ")
}

/// Benchmark an OpenAI-compatible completions API (vLLM, Ollama, TGI,
/// llama.cpp). Workload is `max_tokens` per request.
async fn openai(client: reqwest::Client, base_url: String) -> Result<f64, String> {
    let model = env::var("MODEL_NAME").unwrap_or_else(|_| "model".to_string());
    let url = format!("{base_url}/v1/completions");
    tracing::info!(url = %url, "Benchmarking OpenAI-compatible API");

    let warmup = json!({
        "model": model,
        "prompt": format!("{SYSTEM_PROMPT}\n\n{}", random_prompt(50)),
        "max_tokens": 100,
        "temperature": 0.7,
    });
    if !warmup_ok(&client, &url, &warmup).await {
        return Err("benchmark warmup against the completions API failed".to_string());
    }

    let make_payload = move || {
        json!({
            "model": model,
            "prompt": format!("{SYSTEM_PROMPT}\n\n{}", random_prompt(250)),
            "max_tokens": 500,
            "temperature": 0.7,
        })
    };
    concurrent_runs(&client, &url, make_payload, 500.0, 8, 10).await
}

/// Benchmark the Text Generation Inference `/generate` endpoint. Workload is
/// `max_new_tokens` per request.
async fn tgi(client: reqwest::Client, base_url: String) -> Result<f64, String> {
    let url = format!("{base_url}/generate");
    tracing::info!(url = %url, "Benchmarking TGI API");

    let warmup = json!({
        "inputs": format!("{SYSTEM_PROMPT}\n\n{}", random_prompt(50)),
        "parameters": { "max_new_tokens": 100, "temperature": 0.7 },
    });
    if !warmup_ok(&client, &url, &warmup).await {
        return Err("benchmark warmup against the generate API failed".to_string());
    }

    let make_payload = || {
        json!({
            "inputs": format!("{SYSTEM_PROMPT}\n\n{}", random_prompt(250)),
            "parameters": { "max_new_tokens": 256, "temperature": 0.7 },
        })
    };
    concurrent_runs(&client, &url, make_payload, 256.0, 8, 10).await
}

/// Benchmark a ComfyUI image-generation worker via `/generate/sync`. Image
/// generation is slow and serial, so runs are sequential with a fixed
/// workload of 100.0 units per request.
async fn comfyui(client: reqwest::Client, base_url: String) -> Result<f64, String> {
    const WORKLOAD: f64 = 100.0;
    const RUNS: u32 = 3;

    let url = format!("{base_url}/generate/sync");
    tracing::info!(url = %url, "Benchmarking ComfyUI API");

    let workflow = load_comfyui_workflow();
    let make_payload = || {
        let request_id = format!("benchmark-{}", clock_nanos());
        match &workflow {
            Some(w) => json!({ "input": { "request_id": request_id, "workflow_json": w } }),
            None => json!({
                "input": {
                    "request_id": request_id,
                    "modifier": "Text2Image",
                    "modifications": {
                        "prompt": "a beautiful landscape with mountains and lakes",
                        "width": env_u32("BENCHMARK_TEST_WIDTH", 512),
                        "height": env_u32("BENCHMARK_TEST_HEIGHT", 512),
                        "steps": env_u32("BENCHMARK_TEST_STEPS", 20),
                    }
                }
            }),
        }
    };

    if !warmup_ok(&client, &url, &make_payload()).await {
        return Err("benchmark warmup against the image API failed".to_string());
    }

    let mut max_throughput: f64 = 0.0;
    for run in 1..=RUNS {
        let start = Instant::now();
        let sent = client
            .post(&url)
            .json(&make_payload())
            .timeout(Duration::from_secs(600))
            .send()
            .await;
        match sent {
            Ok(response) if response.status().is_success() => {
                if response.bytes().await.is_err() {
                    tracing::warn!(run, "Benchmark run failed reading body");
                    continue;
                }
                let elapsed = start.elapsed().as_secs_f64();
                let throughput = WORKLOAD / elapsed;
                max_throughput = max_throughput.max(throughput);
                tracing::info!(run, runs = RUNS, elapsed, throughput, "Benchmark run complete");
            }
            Ok(response) => {
                tracing::warn!(run, status = %response.status(), "Benchmark run failed");
            }
            Err(err) => {
                tracing::warn!(run, error = %err, "Benchmark run failed");
            }
        }
    }

    if max_throughput > 0.0 {
        Ok(max_throughput)
    } else {
        Err("no benchmark run produced a successful response".to_string())
    }
}

fn load_comfyui_workflow() -> Option<Value> {
    let path = env::var("COMFYUI_BENCHMARK_FILE").ok()?;
    if !Path::new(&path).exists() {
        return None;
    }
    match std::fs::read_to_string(&path) {
        Ok(text) => match serde_json::from_str(&text) {
            Ok(workflow) => {
                tracing::info!(path = %path, "Loaded benchmark workflow");
                Some(workflow)
            }
            Err(err) => {
                tracing::warn!(path = %path, error = %err, "Invalid benchmark workflow file");
                None
            }
        },
        Err(err) => {
            tracing::warn!(path = %path, error = %err, "Failed reading benchmark workflow file");
            None
        }
    }
}

async fn warmup_ok(client: &reqwest::Client, url: &str, payload: &Value) -> bool {
    tracing::info!("Warming up backend before benchmark");
    match client.post(url).json(payload).send().await {
        Ok(response) if response.status().is_success() => response.bytes().await.is_ok(),
        Ok(response) => {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::error!(%status, body = %&body[..body.len().min(500)], "Warmup failed");
            false
        }
        Err(err) => {
            tracing::error!(error = %err, "Warmup failed");
            false
        }
    }
}

/// Run `runs` rounds of `concurrency` parallel requests and return the best
/// observed workload-per-second across rounds.
async fn concurrent_runs<F>(
    client: &reqwest::Client,
    url: &str,
    make_payload: F,
    workload: f64,
    runs: u32,
    concurrency: usize,
) -> Result<f64, String>
where
    F: Fn() -> Value,
{
    let mut max_throughput: f64 = 0.0;

    for run in 1..=runs {
        let start = Instant::now();
        let mut tasks = Vec::with_capacity(concurrency);
        for _ in 0..concurrency {
            let client = client.clone();
            let url = url.to_string();
            let payload = make_payload();
            tasks.push(tokio::spawn(async move {
                match client.post(&url).json(&payload).send().await {
                    Ok(response) if response.status().is_success() => {
                        response.bytes().await.is_ok()
                    }
                    Ok(response) => {
                        tracing::warn!(status = %response.status(), "Benchmark request failed");
                        false
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "Benchmark request failed");
                        false
                    }
                }
            }));
        }

        let mut successful = 0usize;
        for task in tasks {
            if matches!(task.await, Ok(true)) {
                successful += 1;
            }
        }

        if successful == 0 {
            tracing::error!(run, "Benchmark run failed: no successful responses");
            continue;
        }

        let elapsed = start.elapsed().as_secs_f64();
        let throughput = successful as f64 * workload / elapsed;
        max_throughput = max_throughput.max(throughput);
        tracing::info!(
            run,
            runs,
            successful,
            concurrency,
            elapsed,
            throughput,
            "Benchmark run complete"
        );
    }

    if max_throughput > 0.0 {
        Ok(max_throughput)
    } else {
        Err("no benchmark run produced a successful response".to_string())
    }
}

fn env_u32(name: &str, default: u32) -> u32 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
