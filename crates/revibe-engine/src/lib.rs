use std::collections::VecDeque;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{imageops, DynamicImage, Rgb, RgbImage};
use indexmap::IndexMap;
use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use revibe_contracts::analysis::{DesignAnalysis, Recommendation, RoomAnalysis};
use revibe_contracts::error::RevibeError;
use revibe_contracts::events::{EventPayload, EventWriter};
use revibe_contracts::products::{
    parse_price, safe_file_stem, CompositeLayout, Placement, ProductResult,
};
use revibe_contracts::requests::{DesignOutcome, DesignRequest};
use revibe_contracts::sessions::{ArtifactKind, Session};

pub mod prompts;

const OPENAI_DEFAULT_BASE: &str = "https://api.openai.com/v1";
const SERPAPI_DEFAULT_BASE: &str = "https://serpapi.com";

const PRODUCTS_PER_ROW: u32 = 3;
const RESULTS_PER_TYPE: usize = 3;
const RAW_RESULTS_PER_QUERY: usize = 10;
const MAX_QUERY_VARIATIONS: usize = 3;
const EDIT_CANVAS_EDGE: u32 = 1024;

const VISION_TIMEOUT: Duration = Duration::from_secs(60);
const EDIT_TIMEOUT: Duration = Duration::from_secs(120);
const SEARCH_TIMEOUT: Duration = Duration::from_secs(30);
const THUMBNAIL_TIMEOUT: Duration = Duration::from_secs(10);

/// Speed/quality tradeoff for one pipeline run. Fast mode trades model
/// quality, image resolution and search breadth for latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineMode {
    Standard,
    Fast,
}

impl PipelineMode {
    pub fn from_fast_flag(fast: bool) -> Self {
        if fast {
            PipelineMode::Fast
        } else {
            PipelineMode::Standard
        }
    }

    pub fn vision_model(self) -> &'static str {
        match self {
            PipelineMode::Standard => "gpt-4o",
            PipelineMode::Fast => "gpt-4o-mini",
        }
    }

    pub fn vision_max_tokens(self) -> u32 {
        match self {
            PipelineMode::Standard => 3072,
            PipelineMode::Fast => 2048,
        }
    }

    pub fn vision_temperature(self) -> f64 {
        match self {
            PipelineMode::Standard => 0.7,
            PipelineMode::Fast => 0.0,
        }
    }

    /// Long-edge cap applied to the base room image in the composite.
    pub fn base_max_edge(self) -> u32 {
        match self {
            PipelineMode::Standard => 1024,
            PipelineMode::Fast => 768,
        }
    }

    /// Square cell size for product thumbnails in the composite grid.
    pub fn thumbnail_cell(self) -> u32 {
        match self {
            PipelineMode::Standard => 200,
            PipelineMode::Fast => 150,
        }
    }

    /// Fast mode downscales the finished composite once more.
    pub fn composite_max_edge(self) -> Option<u32> {
        match self {
            PipelineMode::Standard => None,
            PipelineMode::Fast => Some(1024),
        }
    }

    pub fn input_fidelity(self) -> &'static str {
        match self {
            PipelineMode::Standard => "high",
            PipelineMode::Fast => "low",
        }
    }

    /// How many recommended product types are searched at most.
    pub fn max_product_types(self) -> usize {
        match self {
            PipelineMode::Standard => 12,
            PipelineMode::Fast => 3,
        }
    }

    pub fn worker_cap(self) -> usize {
        match self {
            PipelineMode::Standard => 8,
            PipelineMode::Fast => 4,
        }
    }

    pub fn is_fast(self) -> bool {
        self == PipelineMode::Fast
    }
}

/// Early-exit point for the fan-out: 70% of the theoretical maximum
/// (`types × 3` alternatives), never below 3.
pub fn early_exit_threshold(type_count: usize) -> usize {
    let target = (type_count as f64 * RESULTS_PER_TYPE as f64 * 0.7).round() as usize;
    target.max(3)
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn api_base_from_env(key: &str, default: &str) -> String {
    non_empty_env(key)
        .map(|value| value.trim_end_matches('/').to_string())
        .unwrap_or_else(|| default.to_string())
}

pub fn openai_api_key() -> Result<String> {
    non_empty_env("OPENAI_API_KEY").ok_or_else(|| RevibeError::MissingApiKey("OPENAI_API_KEY").into())
}

pub fn serpapi_key() -> Result<String> {
    non_empty_env("SERPAPI_KEY").ok_or_else(|| RevibeError::MissingApiKey("SERPAPI_KEY").into())
}

fn clip_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn http_json_or_error(stage: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{stage} response body read failed"))?;
    if !status.is_success() {
        bail!("{stage} request failed ({code}): {}", clip_text(&body, 512));
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{stage} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn mime_for_image(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => "image/jpeg",
    }
}

fn short_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..4])
}

// ---------------------------------------------------------------------------
// Vision analyzer
// ---------------------------------------------------------------------------

/// One-shot room analysis against the hosted vision model. No retry; any
/// non-2xx response or unparseable reply fails the call.
pub struct VisionAnalyzer {
    api_base: String,
    api_key: String,
    http: HttpClient,
    mode: PipelineMode,
}

impl VisionAnalyzer {
    pub fn new(mode: PipelineMode) -> Result<Self> {
        Ok(Self {
            api_base: api_base_from_env("OPENAI_API_BASE", OPENAI_DEFAULT_BASE),
            api_key: openai_api_key()?,
            http: HttpClient::builder()
                .timeout(VISION_TIMEOUT)
                .build()
                .context("failed building vision HTTP client")?,
            mode,
        })
    }

    pub fn analyze(
        &self,
        image_path: &Path,
        design_style: &str,
        custom_instructions: &str,
        design_type: &str,
    ) -> Result<DesignAnalysis> {
        let content =
            self.request_analysis_text(image_path, design_style, custom_instructions, design_type)?;
        let analysis = DesignAnalysis::from_response_text(&content).map_err(anyhow::Error::from)?;
        Ok(analysis)
    }

    fn request_analysis_text(
        &self,
        image_path: &Path,
        design_style: &str,
        custom_instructions: &str,
        design_type: &str,
    ) -> Result<String> {
        let (encoded, mime) = encode_image_for_vision(image_path, self.mode)?;
        let prompt = prompts::analysis_prompt(design_style, custom_instructions, design_type);
        let payload = json!({
            "model": self.mode.vision_model(),
            "messages": [
                {
                    "role": "user",
                    "content": [
                        {"type": "text", "text": prompt},
                        {
                            "type": "image_url",
                            "image_url": {"url": format!("data:{mime};base64,{encoded}")}
                        }
                    ]
                }
            ],
            "max_tokens": self.mode.vision_max_tokens(),
            "temperature": self.mode.vision_temperature(),
        });

        let endpoint = format!("{}/chat/completions", self.api_base);
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .with_context(|| format!("vision request failed ({endpoint})"))?;
        let parsed = http_json_or_error("vision", response)?;
        let content = parsed
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .and_then(|row| row.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| anyhow::anyhow!("vision response carried no message content"))?;
        Ok(content.to_string())
    }
}

/// Base64 payload for the vision call. Fast mode recompresses: flatten any
/// alpha onto white, cap the long edge at 1024, re-encode JPEG quality 85.
/// Normal mode submits the original bytes untouched.
pub fn encode_image_for_vision(path: &Path, mode: PipelineMode) -> Result<(String, &'static str)> {
    if !mode.is_fast() {
        let bytes =
            fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
        return Ok((BASE64.encode(bytes), mime_for_image(path)));
    }

    let image = image::open(path).with_context(|| format!("failed opening {}", path.display()))?;
    let flattened = flatten_onto_white(&image);
    let resized = if flattened.width().max(flattened.height()) > 1024 {
        DynamicImage::ImageRgb8(flattened)
            .resize(1024, 1024, FilterType::Lanczos3)
            .to_rgb8()
    } else {
        flattened
    };
    let mut bytes = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut bytes, 85);
    encoder
        .encode_image(&DynamicImage::ImageRgb8(resized))
        .with_context(|| format!("failed JPEG-encoding {}", path.display()))?;
    Ok((BASE64.encode(bytes), "image/jpeg"))
}

fn flatten_onto_white(image: &DynamicImage) -> RgbImage {
    let rgba = image.to_rgba8();
    let mut flattened = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = u16::from(pixel[3]);
        let blend = |channel: u8| -> u8 {
            (((u16::from(channel) * alpha) + (255 * (255 - alpha))) / 255) as u8
        };
        flattened.put_pixel(x, y, Rgb([blend(pixel[0]), blend(pixel[1]), blend(pixel[2])]));
    }
    flattened
}

// ---------------------------------------------------------------------------
// Product search
// ---------------------------------------------------------------------------

/// Seam between the fan-out and the hosted shopping API, so the fan-out can
/// be exercised without a network.
pub trait ProductSource: Send + Sync {
    fn search(&self, query: &str, max_results: usize) -> Result<Vec<ProductResult>>;
    fn fetch_image(&self, url: &str) -> Result<Vec<u8>>;
}

/// Google Shopping via SerpAPI.
pub struct SerpApiShopping {
    api_base: String,
    api_key: String,
    http: HttpClient,
}

impl SerpApiShopping {
    pub fn new() -> Result<Self> {
        Ok(Self {
            api_base: api_base_from_env("SERPAPI_API_BASE", SERPAPI_DEFAULT_BASE),
            api_key: serpapi_key()?,
            http: HttpClient::builder()
                .timeout(SEARCH_TIMEOUT)
                .build()
                .context("failed building shopping HTTP client")?,
        })
    }
}

impl ProductSource for SerpApiShopping {
    fn search(&self, query: &str, max_results: usize) -> Result<Vec<ProductResult>> {
        let endpoint = format!("{}/search", self.api_base);
        let limit = max_results.to_string();
        let response = self
            .http
            .get(&endpoint)
            .query(&[
                ("api_key", self.api_key.as_str()),
                ("engine", "google_shopping"),
                ("q", query),
                ("num", limit.as_str()),
                ("gl", "us"),
                ("hl", "en"),
            ])
            .send()
            .with_context(|| format!("product search request failed ({endpoint})"))?;
        let payload = http_json_or_error("product search", response)?;
        let Some(rows) = payload.get("shopping_results").and_then(Value::as_array) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .iter()
            .take(max_results)
            .filter_map(parse_shopping_row)
            .collect())
    }

    fn fetch_image(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(url)
            .timeout(THUMBNAIL_TIMEOUT)
            .send()
            .with_context(|| format!("thumbnail download failed ({url})"))?;
        if !response.status().is_success() {
            bail!("thumbnail download failed ({})", response.status().as_u16());
        }
        let bytes = response
            .bytes()
            .context("failed reading thumbnail bytes")?
            .to_vec();
        Ok(bytes)
    }
}

/// Rows missing a title or product link are skipped entirely.
fn parse_shopping_row(row: &Value) -> Option<ProductResult> {
    let obj = row.as_object()?;
    let name = obj
        .get("title")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())?;
    let url = obj
        .get("product_link")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())?;
    let price = obj
        .get("extracted_price")
        .and_then(Value::as_f64)
        .or_else(|| {
            obj.get("price")
                .and_then(Value::as_str)
                .and_then(parse_price)
        });
    Some(ProductResult {
        name: name.to_string(),
        url: url.to_string(),
        price,
        rating: obj.get("rating").and_then(Value::as_f64),
        reviews: obj.get("reviews").and_then(Value::as_u64),
        retailer: obj
            .get("source")
            .and_then(Value::as_str)
            .unwrap_or("Unknown")
            .to_string(),
        thumbnail: obj
            .get("thumbnail")
            .and_then(Value::as_str)
            .map(str::to_string),
        image_path: None,
        product_type: String::new(),
        area: String::new(),
    })
}

const PRODUCT_TERM_HINTS: &[(&str, &str)] = &[
    ("throw pillows", "decorative cushions"),
    ("floor lamp", "lighting fixture"),
    ("wall art", "wall hanging decor"),
    ("ceramic vases", "pottery decorative"),
    ("area rug", "decorative carpet"),
    ("curtains", "window treatments"),
    ("candles", "decorative candles"),
    ("plants", "indoor plants"),
    ("throw blanket", "textile decorative"),
];

/// Up to three search query variations for one recommended product type:
/// style + colors + a category hint, then the room mood, then keyword
/// tokens pulled from the recommendation description.
pub fn product_queries(
    recommendation: &Recommendation,
    style: &str,
    colors: &[String],
    room: Option<&RoomAnalysis>,
) -> Vec<String> {
    let product_type = recommendation.product_type.trim();
    if product_type.is_empty() {
        return Vec::new();
    }
    let mut queries: Vec<String> = Vec::new();

    let hint = PRODUCT_TERM_HINTS
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(product_type))
        .map(|(_, hint)| *hint)
        .unwrap_or("");
    let color_terms = colors
        .iter()
        .take(2)
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(" ");
    push_query(
        &mut queries,
        format!("{style} {product_type} {color_terms} {hint}"),
    );

    if let Some(room) = room {
        let detail = room
            .style_details
            .first()
            .map(String::as_str)
            .unwrap_or_default();
        push_query(
            &mut queries,
            format!("{} {product_type} {detail}", room.mood),
        );
    }

    let keywords = description_keywords(&recommendation.description).join(" ");
    push_query(&mut queries, format!("{product_type} {keywords}"));

    queries
}

fn push_query(queries: &mut Vec<String>, raw: String) {
    if queries.len() >= MAX_QUERY_VARIATIONS {
        return;
    }
    let normalized = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.is_empty() || queries.contains(&normalized) {
        return;
    }
    queries.push(normalized);
}

/// Material/texture words worth carrying into a shopping query. Short or
/// generic words only add noise.
fn description_keywords(description: &str) -> Vec<String> {
    const SKIP: &[&str] = &[
        "inches", "style", "pattern", "finish", "design", "quality", "between", "around",
        "matching", "existing", "natural",
    ];
    let mut keywords = Vec::new();
    for word in description.split(|ch: char| !ch.is_alphanumeric()) {
        let lowered = word.to_ascii_lowercase();
        if lowered.len() < 5 || !lowered.chars().all(|ch| ch.is_alphabetic()) {
            continue;
        }
        if SKIP.contains(&lowered.as_str()) || keywords.contains(&lowered) {
            continue;
        }
        keywords.push(lowered);
        if keywords.len() == 3 {
            break;
        }
    }
    keywords
}

/// What the fan-out produced, and whether it stopped early.
#[derive(Debug)]
pub struct FanOutReport {
    pub products: Vec<ProductResult>,
    pub threshold: usize,
    pub early_exit: bool,
}

/// Parallel per-type product search with a bounded worker pool and an
/// early-exit threshold.
///
/// Workers pull product types from a shared queue, search up to three query
/// variations, keep up to three image-bearing results per type, download
/// thumbnails into the session `products/` directory and report the batch
/// over a channel. The coordinator drains the channel and trips a shared
/// stop flag once the accumulated count reaches `threshold`; workers check
/// the flag cooperatively between units of work, so an in-flight HTTP call
/// is abandoned rather than cancelled and late batches are discarded.
///
/// A failed search or download never aborts the batch; only an empty final
/// list is an error. Completion order is nondeterministic across runs.
pub fn search_products_parallel(
    source: &dyn ProductSource,
    recommendations: &[Recommendation],
    design_style: &str,
    color_palette: &[String],
    room_analysis: Option<&RoomAnalysis>,
    threshold: usize,
    mode: PipelineMode,
    session: &Session,
    events: &EventWriter,
) -> Result<FanOutReport> {
    if recommendations.is_empty() {
        return Err(RevibeError::NoRecommendations.into());
    }

    let worker_count = recommendations.len().min(mode.worker_cap()).max(1);
    println!("   dispatching {worker_count} search workers for {} product types", recommendations.len());

    let queue = Mutex::new(recommendations.iter().cloned().collect::<VecDeque<_>>());
    let stop = AtomicBool::new(false);
    let (tx, rx) = mpsc::channel::<(String, Vec<ProductResult>)>();

    let mut accumulated: Vec<ProductResult> = Vec::new();
    let mut early_exit = false;

    thread::scope(|scope| {
        for _ in 0..worker_count {
            let tx = tx.clone();
            let queue = &queue;
            let stop = &stop;
            scope.spawn(move || loop {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                let Some(recommendation) = queue.lock().ok().and_then(|mut q| q.pop_front())
                else {
                    break;
                };
                let type_name = recommendation.product_type.clone();
                let batch = match search_one_type(
                    source,
                    &recommendation,
                    design_style,
                    color_palette,
                    room_analysis,
                    session,
                    stop,
                ) {
                    Ok(products) => products,
                    Err(err) => {
                        let mut payload = EventPayload::new();
                        payload.insert("product_type".to_string(), json!(type_name));
                        payload.insert(
                            "error".to_string(),
                            json!(clip_text(&format!("{err:#}"), 300)),
                        );
                        let _ = events.emit("search_type_failed", payload);
                        Vec::new()
                    }
                };
                if tx.send((type_name, batch)).is_err() {
                    break;
                }
            });
        }
        drop(tx);

        while let Ok((type_name, batch)) = rx.recv() {
            if batch.is_empty() {
                println!("   no products found for: {type_name}");
                continue;
            }
            println!("   found {} products for: {type_name}", batch.len());
            accumulated.extend(batch);
            if accumulated.len() >= threshold {
                println!("   early exit at {} of {threshold} products", accumulated.len());
                early_exit = true;
                stop.store(true, Ordering::Relaxed);
                break;
            }
        }
        // Remaining workers unwind via the stop flag or the empty queue;
        // anything they send after this point has nowhere to go.
        drop(rx);
    });

    if accumulated.is_empty() {
        return Err(RevibeError::NoProductsFound.into());
    }
    Ok(FanOutReport {
        products: accumulated,
        threshold,
        early_exit,
    })
}

fn search_one_type(
    source: &dyn ProductSource,
    recommendation: &Recommendation,
    design_style: &str,
    color_palette: &[String],
    room_analysis: Option<&RoomAnalysis>,
    session: &Session,
    stop: &AtomicBool,
) -> Result<Vec<ProductResult>> {
    let product_type = recommendation.product_type.trim();
    println!("   searching shopping results for: {product_type}");

    let queries = product_queries(recommendation, design_style, color_palette, room_analysis);
    let mut picked: Vec<ProductResult> = Vec::new();

    for query in queries {
        if picked.len() >= RESULTS_PER_TYPE || stop.load(Ordering::Relaxed) {
            break;
        }
        let results = match source.search(&query, RAW_RESULTS_PER_QUERY) {
            Ok(results) => results,
            Err(err) => {
                println!("   search failed for '{query}': {err:#}");
                continue;
            }
        };
        for mut product in results {
            if picked.len() >= RESULTS_PER_TYPE || stop.load(Ordering::Relaxed) {
                break;
            }
            let Some(thumbnail) = product.thumbnail.clone() else {
                continue;
            };
            if picked.iter().any(|existing| existing.url == product.url) {
                continue;
            }
            match source.fetch_image(&thumbnail) {
                Ok(bytes) => {
                    let file_name = format!(
                        "{}_{}.jpg",
                        safe_file_stem(product_type),
                        short_hash(&thumbnail)
                    );
                    let path = session.save_bytes(ArtifactKind::Products, &file_name, &bytes)?;
                    product.image_path = Some(path);
                    product.product_type = product_type.to_string();
                    product.area = recommendation.area.clone();
                    picked.push(product);
                }
                Err(err) => {
                    println!("   dropping {} (thumbnail failed: {err:#})", product.name);
                }
            }
        }
    }
    Ok(picked)
}

// ---------------------------------------------------------------------------
// Composite layout
// ---------------------------------------------------------------------------

/// Deterministic side-by-side composite: base room on the left, product
/// thumbnails in a 3-per-row grid on the right, grouped by product type in
/// first-seen order. Pure function of its inputs; identical inputs and
/// ordering produce byte-identical output.
pub fn build_composite(
    base_image_path: &Path,
    products: &[ProductResult],
    out_dir: &Path,
    mode: PipelineMode,
) -> Result<CompositeLayout> {
    let base = image::open(base_image_path)
        .with_context(|| format!("failed opening {}", base_image_path.display()))?;
    let max_edge = mode.base_max_edge();
    let base = if base.width().max(base.height()) > max_edge {
        base.resize(max_edge, max_edge, FilterType::Lanczos3)
    } else {
        base
    };
    let base = base.to_rgb8();
    let (base_width, base_height) = base.dimensions();

    let cell = mode.thumbnail_cell();
    let slot_count = products.len() as u32;
    let rows = (slot_count + PRODUCTS_PER_ROW - 1) / PRODUCTS_PER_ROW;
    let grid_width = cell * PRODUCTS_PER_ROW;
    let grid_height = cell * rows;
    let canvas_width = base_width + grid_width;
    let canvas_height = base_height.max(grid_height);

    let mut canvas = RgbImage::from_pixel(canvas_width, canvas_height, Rgb([255, 255, 255]));
    let base_y = (canvas_height - base_height) / 2;
    imageops::replace(&mut canvas, &base, 0, i64::from(base_y));

    let mut groups: IndexMap<&str, Vec<&ProductResult>> = IndexMap::new();
    for product in products {
        groups
            .entry(product.product_type.as_str())
            .or_default()
            .push(product);
    }

    let mut placements = Vec::new();
    let mut slot: u32 = 0;
    for group in groups.values() {
        for product in group {
            let index = slot as usize;
            let col = slot % PRODUCTS_PER_ROW;
            let row = slot / PRODUCTS_PER_ROW;
            slot += 1;

            // A product that cannot be read still consumes its grid slot.
            let Some(path) = product.image_path.as_ref() else {
                println!("   skipping {} (no local image)", product.name);
                continue;
            };
            let thumb = match image::open(path) {
                Ok(thumb) => thumb,
                Err(err) => {
                    println!("   skipping {} ({err})", product.name);
                    continue;
                }
            };
            let thumb = thumb.resize(cell, cell, FilterType::Lanczos3).to_rgb8();
            let (thumb_width, thumb_height) = thumb.dimensions();
            let x = base_width + col * cell + (cell - thumb_width) / 2;
            let y = row * cell + (cell - thumb_height) / 2;
            imageops::replace(&mut canvas, &thumb, i64::from(x), i64::from(y));
            placements.push(Placement {
                index,
                name: product.name.clone(),
                product_type: product.product_type.clone(),
                x,
                y,
                width: thumb_width,
                height: thumb_height,
            });
        }
    }

    let mut finished = DynamicImage::ImageRgb8(canvas);
    if let Some(max) = mode.composite_max_edge() {
        if finished.width().max(finished.height()) > max {
            finished = finished.resize(max, max, FilterType::Lanczos3);
        }
    }

    fs::create_dir_all(out_dir)
        .with_context(|| format!("failed creating {}", out_dir.display()))?;
    let image_path = out_dir.join("composite_layout.png");
    finished
        .save(&image_path)
        .with_context(|| format!("failed to save {}", image_path.display()))?;
    Ok(CompositeLayout {
        width: finished.width(),
        height: finished.height(),
        image_path,
        placements,
    })
}

// ---------------------------------------------------------------------------
// Image edit invoker
// ---------------------------------------------------------------------------

/// One-shot call to the hosted image-edit endpoint. No retry; a non-2xx
/// response or a reply without image data is terminal.
pub struct ImageEditor {
    api_base: String,
    api_key: String,
    http: HttpClient,
    mode: PipelineMode,
}

impl ImageEditor {
    pub fn new(mode: PipelineMode) -> Result<Self> {
        Ok(Self {
            api_base: api_base_from_env("OPENAI_API_BASE", OPENAI_DEFAULT_BASE),
            api_key: openai_api_key()?,
            http: HttpClient::builder()
                .timeout(EDIT_TIMEOUT)
                .build()
                .context("failed building image edit HTTP client")?,
            mode,
        })
    }

    /// Letterbox the composite to the 1024×1024 the edit endpoint requires,
    /// then ask the model to move the products into the room.
    pub fn overlay_products(&self, composite_path: &Path, out_dir: &Path) -> Result<PathBuf> {
        let prepared = prepare_square_canvas(composite_path, out_dir, "prepared_composite.png")?;
        self.edit(
            &prepared,
            prompts::overlay_prompt(),
            &out_dir.join("real_products_overlay_design.png"),
        )
    }

    pub fn edit(&self, image_path: &Path, prompt: &str, out_path: &Path) -> Result<PathBuf> {
        let bytes = fs::read(image_path)
            .with_context(|| format!("failed reading {}", image_path.display()))?;
        let file_name = image_path
            .file_name()
            .and_then(|value| value.to_str())
            .unwrap_or("image.png")
            .to_string();
        let part = MultipartPart::bytes(bytes)
            .file_name(file_name)
            .mime_str("image/png")
            .context("invalid mime for edit image part")?;
        let form = MultipartForm::new()
            .text("model", "gpt-image-1")
            .text("prompt", prompt.to_string())
            .text("n", "1")
            .text("size", "1024x1024")
            .text("input_fidelity", self.mode.input_fidelity())
            .part("image", part);

        let endpoint = format!("{}/images/edits", self.api_base);
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .with_context(|| format!("image edit request failed ({endpoint})"))?;
        let payload = http_json_or_error("image edit", response)?;
        save_edit_response_image(&self.http, &payload, out_path)?;
        Ok(out_path.to_path_buf())
    }
}

/// Fit an image onto a white square canvas, aspect preserved and centered.
pub fn prepare_square_canvas(image_path: &Path, out_dir: &Path, name: &str) -> Result<PathBuf> {
    let image = image::open(image_path)
        .with_context(|| format!("failed opening {}", image_path.display()))?;
    let fitted = image
        .resize(EDIT_CANVAS_EDGE, EDIT_CANVAS_EDGE, FilterType::Lanczos3)
        .to_rgb8();
    let mut canvas = RgbImage::from_pixel(EDIT_CANVAS_EDGE, EDIT_CANVAS_EDGE, Rgb([255, 255, 255]));
    let x = (EDIT_CANVAS_EDGE - fitted.width()) / 2;
    let y = (EDIT_CANVAS_EDGE - fitted.height()) / 2;
    imageops::replace(&mut canvas, &fitted, i64::from(x), i64::from(y));

    fs::create_dir_all(out_dir)
        .with_context(|| format!("failed creating {}", out_dir.display()))?;
    let path = out_dir.join(name);
    canvas
        .save(&path)
        .with_context(|| format!("failed to save {}", path.display()))?;
    Ok(path)
}

/// Persist `data[0]` of an image-edit response: a remote `url` is
/// downloaded, an inline `b64_json` is decoded; both land at `out_path`.
pub fn save_edit_response_image(
    http: &HttpClient,
    payload: &Value,
    out_path: &Path,
) -> Result<()> {
    let item = payload
        .get("data")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
        .and_then(Value::as_object)
        .ok_or_else(|| anyhow::anyhow!("image edit response carried no data entries"))?;

    if let Some(url) = item.get("url").and_then(Value::as_str) {
        let response = http
            .get(url)
            .send()
            .with_context(|| format!("failed downloading edited image ({url})"))?;
        if !response.status().is_success() {
            bail!(
                "edited image download failed ({})",
                response.status().as_u16()
            );
        }
        let bytes = response
            .bytes()
            .context("failed reading edited image bytes")?;
        fs::write(out_path, &bytes)
            .with_context(|| format!("failed to write {}", out_path.display()))?;
        return Ok(());
    }

    if let Some(b64) = item.get("b64_json").and_then(Value::as_str) {
        let bytes = BASE64
            .decode(b64.as_bytes())
            .context("edited image base64 decode failed")?;
        fs::write(out_path, bytes)
            .with_context(|| format!("failed to write {}", out_path.display()))?;
        return Ok(());
    }

    bail!("image edit response data entry had neither url nor b64_json")
}

// ---------------------------------------------------------------------------
// Pipelines
// ---------------------------------------------------------------------------

/// Whether an error is the vision model replying with unparseable text, as
/// opposed to any other failure.
pub fn is_parse_failure(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<RevibeError>(),
        Some(RevibeError::AnalysisParse(_))
    )
}

/// The standard pathway degrades an unparseable analysis to a synthetic
/// placeholder; every other error still propagates. The real-products
/// pathway deliberately does not use this.
pub fn analysis_or_placeholder(
    result: Result<DesignAnalysis>,
    design_style: &str,
) -> Result<DesignAnalysis> {
    match result {
        Ok(analysis) => Ok(analysis),
        Err(err) if is_parse_failure(&err) => {
            println!("   analysis unparseable, substituting placeholder: {err:#}");
            Ok(DesignAnalysis::placeholder(design_style))
        }
        Err(err) => Err(err),
    }
}

/// Full real-products run: analyze, shop in parallel, composite, overlay.
pub struct RealProductsPipeline {
    analyzer: VisionAnalyzer,
    editor: ImageEditor,
    source: Box<dyn ProductSource>,
    mode: PipelineMode,
}

impl RealProductsPipeline {
    pub fn new(mode: PipelineMode) -> Result<Self> {
        Self::with_source(mode, Box::new(SerpApiShopping::new()?))
    }

    pub fn with_source(mode: PipelineMode, source: Box<dyn ProductSource>) -> Result<Self> {
        Ok(Self {
            analyzer: VisionAnalyzer::new(mode)?,
            editor: ImageEditor::new(mode)?,
            source,
            mode,
        })
    }

    pub fn generate(&self, request: &DesignRequest) -> Result<DesignOutcome> {
        let session = Session::create(&request.output_dir, request.session_id.clone())?;
        println!("session: {}", session.id());
        let events = EventWriter::new(
            session.dir(ArtifactKind::Debug).join("events.jsonl"),
            session.id(),
        );
        let mut payload = EventPayload::new();
        payload.insert("pathway".to_string(), json!("real_products"));
        payload.insert("fast_mode".to_string(), json!(self.mode.is_fast()));
        events.emit("pipeline_started", payload)?;

        match self.run_stages(request, &session, &events) {
            Ok(outcome) => {
                let mut payload = EventPayload::new();
                payload.insert("products_used".to_string(), json!(outcome.products_used));
                payload.insert(
                    "final_design".to_string(),
                    json!(outcome.final_design.to_string_lossy()),
                );
                let _ = events.emit("design_completed", payload);
                Ok(outcome)
            }
            Err(err) => {
                let mut payload = EventPayload::new();
                payload.insert(
                    "error".to_string(),
                    json!(clip_text(&format!("{err:#}"), 500)),
                );
                let _ = events.emit("pipeline_failed", payload);
                Err(err)
            }
        }
    }

    fn run_stages(
        &self,
        request: &DesignRequest,
        session: &Session,
        events: &EventWriter,
    ) -> Result<DesignOutcome> {
        println!("step 1: analyzing room image");
        let analysis = self.analyzer.analyze(
            &request.image_path,
            &request.design_style,
            &request.custom_instructions,
            &request.design_type,
        )?;
        session.save_text(
            ArtifactKind::Analysis,
            "analysis_results.json",
            &serde_json::to_string_pretty(&analysis)?,
        )?;
        let mut payload = EventPayload::new();
        payload.insert(
            "recommendations".to_string(),
            json!(analysis.recommendations.len()),
        );
        events.emit("analysis_completed", payload)?;

        let mut recommendations: Vec<Recommendation> = analysis
            .recommendations
            .iter()
            .filter(|rec| !rec.product_type.trim().is_empty())
            .cloned()
            .collect();
        if recommendations.is_empty() {
            return Err(RevibeError::NoRecommendations.into());
        }
        recommendations.truncate(self.mode.max_product_types());
        let threshold = early_exit_threshold(recommendations.len());

        println!(
            "step 2: searching products ({} types, early exit at {threshold})",
            recommendations.len()
        );
        let report = search_products_parallel(
            self.source.as_ref(),
            &recommendations,
            &request.design_style,
            analysis.primary_colors(),
            analysis.room_analysis.as_ref(),
            threshold,
            self.mode,
            session,
            events,
        )?;
        let mut payload = EventPayload::new();
        payload.insert("product_count".to_string(), json!(report.products.len()));
        payload.insert("early_exit".to_string(), json!(report.early_exit));
        events.emit("search_completed", payload)?;

        println!("step 3: building composite layout");
        let composite = build_composite(
            &request.image_path,
            &report.products,
            &session.dir(ArtifactKind::Composites),
            self.mode,
        )?;
        session.save_text(
            ArtifactKind::Debug,
            "composite_placements.json",
            &serde_json::to_string_pretty(&composite.placements)?,
        )?;
        let mut payload = EventPayload::new();
        payload.insert("width".to_string(), json!(composite.width));
        payload.insert("height".to_string(), json!(composite.height));
        payload.insert("placements".to_string(), json!(composite.placements.len()));
        events.emit("composite_created", payload)?;

        println!("step 4: overlaying products with the image edit model");
        let final_design = self
            .editor
            .overlay_products(&composite.image_path, &session.dir(ArtifactKind::FinalDesigns))?;
        session.create_latest_symlink()?;

        Ok(DesignOutcome {
            session_id: session.id().to_string(),
            session_path: session.path().to_path_buf(),
            original_image: request.image_path.clone(),
            final_design,
            products_used: report.products.len(),
            products: report.products,
            design_style: request.design_style.clone(),
            analysis,
        })
    }
}

/// Standard pathway: analyze, then restyle the room with AI-imagined
/// products. No shopping, no composite.
pub struct StandardPipeline {
    analyzer: VisionAnalyzer,
    editor: ImageEditor,
    mode: PipelineMode,
}

impl StandardPipeline {
    pub fn new(mode: PipelineMode) -> Result<Self> {
        Ok(Self {
            analyzer: VisionAnalyzer::new(mode)?,
            editor: ImageEditor::new(mode)?,
            mode,
        })
    }

    pub fn generate(&self, request: &DesignRequest) -> Result<DesignOutcome> {
        let session = Session::create(&request.output_dir, request.session_id.clone())?;
        println!("session: {}", session.id());
        let events = EventWriter::new(
            session.dir(ArtifactKind::Debug).join("events.jsonl"),
            session.id(),
        );
        let mut payload = EventPayload::new();
        payload.insert("pathway".to_string(), json!("standard"));
        payload.insert("fast_mode".to_string(), json!(self.mode.is_fast()));
        events.emit("pipeline_started", payload)?;

        match self.run_stages(request, &session, &events) {
            Ok(outcome) => {
                let mut payload = EventPayload::new();
                payload.insert(
                    "final_design".to_string(),
                    json!(outcome.final_design.to_string_lossy()),
                );
                let _ = events.emit("design_completed", payload);
                Ok(outcome)
            }
            Err(err) => {
                let mut payload = EventPayload::new();
                payload.insert(
                    "error".to_string(),
                    json!(clip_text(&format!("{err:#}"), 500)),
                );
                let _ = events.emit("pipeline_failed", payload);
                Err(err)
            }
        }
    }

    fn run_stages(
        &self,
        request: &DesignRequest,
        session: &Session,
        events: &EventWriter,
    ) -> Result<DesignOutcome> {
        println!("step 1: analyzing room image");
        let analysis = analysis_or_placeholder(
            self.analyzer.analyze(
                &request.image_path,
                &request.design_style,
                &request.custom_instructions,
                &request.design_type,
            ),
            &request.design_style,
        )?;
        session.save_text(
            ArtifactKind::Analysis,
            "analysis_results.json",
            &serde_json::to_string_pretty(&analysis)?,
        )?;
        let mut payload = EventPayload::new();
        payload.insert(
            "recommendations".to_string(),
            json!(analysis.recommendations.len()),
        );
        events.emit("analysis_completed", payload)?;

        println!("step 2: restyling the room with the image edit model");
        let prompt = prompts::standard_prompt(&analysis, &request.design_style);
        let final_dir = session.dir(ArtifactKind::FinalDesigns);
        let prepared = prepare_square_canvas(&request.image_path, &final_dir, "prepared_room.png")?;
        let final_design = self
            .editor
            .edit(&prepared, &prompt, &final_dir.join("standard_design.png"))?;
        session.create_latest_symlink()?;

        Ok(DesignOutcome {
            session_id: session.id().to_string(),
            session_path: session.path().to_path_buf(),
            original_image: request.image_path.clone(),
            final_design,
            products: Vec::new(),
            products_used: 0,
            design_style: request.design_style.clone(),
            analysis,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration;

    use anyhow::Result;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use image::{Rgb, RgbImage};
    use reqwest::blocking::Client as HttpClient;
    use serde_json::json;

    use revibe_contracts::analysis::{Recommendation, RoomAnalysis};
    use revibe_contracts::error::RevibeError;
    use revibe_contracts::events::EventWriter;
    use revibe_contracts::products::ProductResult;
    use revibe_contracts::sessions::Session;

    use super::{
        analysis_or_placeholder, build_composite, early_exit_threshold, encode_image_for_vision,
        prepare_square_canvas, product_queries, save_edit_response_image,
        search_products_parallel, PipelineMode, ProductSource,
    };

    fn write_test_image(path: &Path, width: u32, height: u32, color: [u8; 3]) -> Result<()> {
        RgbImage::from_pixel(width, height, Rgb(color)).save(path)?;
        Ok(())
    }

    fn recommendation(product_type: &str) -> Recommendation {
        Recommendation {
            area: "Decor".to_string(),
            product_type: product_type.to_string(),
            description: format!("{product_type} in woven rattan with brass accents"),
            ..Recommendation::default()
        }
    }

    /// Stub product source: each known type resolves to a fixed number of
    /// distinct image-bearing products, with a per-type delay so batches
    /// complete out of order.
    struct StubSource {
        types: Vec<(String, usize, Duration)>,
        failing: Option<String>,
        search_calls: AtomicUsize,
        fetched: Mutex<Vec<String>>,
    }

    impl StubSource {
        fn new(types: &[(&str, usize, u64)]) -> Self {
            Self {
                types: types
                    .iter()
                    .map(|(name, count, delay_ms)| {
                        (name.to_string(), *count, Duration::from_millis(*delay_ms))
                    })
                    .collect(),
                failing: None,
                search_calls: AtomicUsize::new(0),
                fetched: Mutex::new(Vec::new()),
            }
        }

        fn with_failing(mut self, name: &str) -> Self {
            self.failing = Some(name.to_string());
            self
        }
    }

    impl ProductSource for StubSource {
        fn search(&self, query: &str, _max_results: usize) -> Result<Vec<ProductResult>> {
            self.search_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(failing) = &self.failing {
                if query.contains(failing.as_str()) {
                    anyhow::bail!("simulated search outage");
                }
            }
            for (name, count, delay) in &self.types {
                if !query.contains(name.as_str()) {
                    continue;
                }
                thread::sleep(*delay);
                return Ok((0..*count)
                    .map(|idx| ProductResult {
                        name: format!("{name} option {idx}"),
                        url: format!("https://shop.example/{name}/{idx}"),
                        price: Some(10.0 + idx as f64),
                        rating: Some(4.0),
                        reviews: Some(25),
                        retailer: "Example Home".to_string(),
                        thumbnail: Some(format!("https://img.example/{name}/{idx}.jpg")),
                        image_path: None,
                        product_type: String::new(),
                        area: String::new(),
                    })
                    .collect());
            }
            Ok(Vec::new())
        }

        fn fetch_image(&self, url: &str) -> Result<Vec<u8>> {
            if let Ok(mut fetched) = self.fetched.lock() {
                fetched.push(url.to_string());
            }
            Ok(vec![0xFF, 0xD8, 0xFF, 0xE0])
        }
    }

    #[test]
    fn threshold_is_seventy_percent_of_max_floor_three() {
        assert_eq!(early_exit_threshold(0), 3);
        assert_eq!(early_exit_threshold(1), 3);
        assert_eq!(early_exit_threshold(2), 4);
        assert_eq!(early_exit_threshold(4), 8);
        assert_eq!(early_exit_threshold(12), 25);
    }

    #[test]
    fn fan_out_stops_at_the_threshold() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let session = Session::create(temp.path(), Some("fanout-1".to_string()))?;
        let events = EventWriter::new(temp.path().join("events.jsonl"), session.id());
        let source = StubSource::new(&[
            ("type-a", 2, 5),
            ("type-b", 2, 20),
            ("type-c", 2, 40),
            ("type-d", 2, 60),
        ]);
        let recommendations: Vec<_> = ["type-a", "type-b", "type-c", "type-d"]
            .iter()
            .map(|name| recommendation(name))
            .collect();

        let report = search_products_parallel(
            &source,
            &recommendations,
            "modern",
            &[],
            None,
            4,
            PipelineMode::Fast,
            &session,
            &events,
        )?;
        assert!(report.early_exit);
        assert_eq!(report.products.len(), 4);
        for product in &report.products {
            let path = product.image_path.as_ref().expect("downloaded image");
            assert!(path.exists());
        }
        let fetched = source.fetched.lock().map_err(|_| anyhow::anyhow!("lock"))?;
        assert!(fetched.len() >= 4);
        Ok(())
    }

    #[test]
    fn fan_out_reaching_threshold_exactly_counts_as_early_exit() -> Result<()> {
        // 4 types × 2 image-bearing results each, threshold 8: the run must
        // stop accumulating the moment the total reaches 8.
        let temp = tempfile::tempdir()?;
        let session = Session::create(temp.path(), Some("fanout-2".to_string()))?;
        let events = EventWriter::new(temp.path().join("events.jsonl"), session.id());
        let source = StubSource::new(&[
            ("type-a", 2, 5),
            ("type-b", 2, 10),
            ("type-c", 2, 15),
            ("type-d", 2, 20),
        ]);
        let recommendations: Vec<_> = ["type-a", "type-b", "type-c", "type-d"]
            .iter()
            .map(|name| recommendation(name))
            .collect();
        assert_eq!(early_exit_threshold(recommendations.len()), 8);

        let report = search_products_parallel(
            &source,
            &recommendations,
            "modern",
            &[],
            None,
            8,
            PipelineMode::Fast,
            &session,
            &events,
        )?;
        assert_eq!(report.products.len(), 8);
        assert!(report.early_exit);
        Ok(())
    }

    #[test]
    fn fan_out_isolates_per_type_failures() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let session = Session::create(temp.path(), Some("fanout-3".to_string()))?;
        let events = EventWriter::new(temp.path().join("events.jsonl"), session.id());
        let source =
            StubSource::new(&[("type-a", 2, 5), ("type-b", 2, 5)]).with_failing("type-b");
        let recommendations = vec![recommendation("type-a"), recommendation("type-b")];

        let report = search_products_parallel(
            &source,
            &recommendations,
            "modern",
            &[],
            None,
            50,
            PipelineMode::Fast,
            &session,
            &events,
        )?;
        assert!(!report.early_exit);
        assert_eq!(report.products.len(), 2);
        assert!(report
            .products
            .iter()
            .all(|product| product.product_type == "type-a"));
        // The failing type was queried, not skipped.
        assert!(source.search_calls.load(Ordering::SeqCst) >= 3);
        Ok(())
    }

    #[test]
    fn fan_out_with_no_results_anywhere_is_an_error() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let session = Session::create(temp.path(), Some("fanout-4".to_string()))?;
        let events = EventWriter::new(temp.path().join("events.jsonl"), session.id());
        let source = StubSource::new(&[]);
        let recommendations = vec![recommendation("type-a"), recommendation("type-b")];

        let err = search_products_parallel(
            &source,
            &recommendations,
            "modern",
            &[],
            None,
            3,
            PipelineMode::Fast,
            &session,
            &events,
        )
        .expect_err("empty fan-out must fail");
        assert!(matches!(
            err.downcast_ref::<RevibeError>(),
            Some(RevibeError::NoProductsFound)
        ));
        Ok(())
    }

    #[test]
    fn queries_cap_at_three_and_lead_with_style() {
        let rec = Recommendation {
            area: "Seating Area".to_string(),
            product_type: "throw pillows".to_string(),
            description: "18x18 terracotta linen texture with velvet trim".to_string(),
            ..Recommendation::default()
        };
        let room = RoomAnalysis {
            room_type: "living room".to_string(),
            mood: "cozy".to_string(),
            style_details: vec!["layered textiles".to_string()],
        };
        let colors = vec!["terracotta".to_string(), "teal".to_string(), "cream".to_string()];

        let queries = product_queries(&rec, "bohemian", &colors, Some(&room));
        assert_eq!(queries.len(), 3);
        assert_eq!(
            queries[0],
            "bohemian throw pillows terracotta teal decorative cushions"
        );
        assert!(queries[1].starts_with("cozy throw pillows"));
        assert!(queries[2].contains("linen"));
    }

    #[test]
    fn queries_for_blank_type_are_empty() {
        let rec = Recommendation::default();
        assert!(product_queries(&rec, "modern", &[], None).is_empty());
    }

    #[test]
    fn composite_geometry_matches_the_grid_formulas() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let base_path = temp.path().join("room.png");
        write_test_image(&base_path, 600, 400, [120, 120, 120])?;

        let mut products = Vec::new();
        for idx in 0..5 {
            let thumb_path = temp.path().join(format!("thumb-{idx}.png"));
            write_test_image(&thumb_path, 100, 50, [200, 30, 30])?;
            products.push(ProductResult {
                name: format!("product {idx}"),
                product_type: if idx < 3 { "lamp" } else { "rug" }.to_string(),
                image_path: Some(thumb_path),
                ..ProductResult::default()
            });
        }

        let layout = build_composite(
            &base_path,
            &products,
            temp.path(),
            PipelineMode::Standard,
        )?;
        // width = base + 3 × 200, height = max(400, 2 rows × 200)
        assert_eq!(layout.width, 600 + 3 * 200);
        assert_eq!(layout.height, 400);
        assert_eq!(layout.placements.len(), 5);

        // 100×50 thumbnails fit a 200 cell at 200×100, centered vertically.
        let first = &layout.placements[0];
        assert_eq!((first.width, first.height), (200, 100));
        assert_eq!((first.x, first.y), (600, 50));
        // Fourth product starts the second row.
        let fourth = &layout.placements[3];
        assert_eq!(fourth.index, 3);
        assert_eq!((fourth.x, fourth.y), (600, 200 + 50));

        let saved = image::open(&layout.image_path)?;
        assert_eq!((saved.width(), saved.height()), (layout.width, layout.height));
        Ok(())
    }

    #[test]
    fn composite_preserves_thumbnail_aspect_ratios() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let base_path = temp.path().join("room.png");
        write_test_image(&base_path, 300, 300, [0, 0, 0])?;

        let tall = temp.path().join("tall.png");
        write_test_image(&tall, 50, 100, [10, 200, 10])?;
        let products = vec![ProductResult {
            name: "tall vase".to_string(),
            product_type: "vase".to_string(),
            image_path: Some(tall),
            ..ProductResult::default()
        }];

        let layout = build_composite(&base_path, &products, temp.path(), PipelineMode::Standard)?;
        let placement = &layout.placements[0];
        assert_eq!((placement.width, placement.height), (100, 200));
        assert_eq!(placement.x, 300 + 50);
        Ok(())
    }

    #[test]
    fn composite_is_byte_identical_across_runs() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let base_path = temp.path().join("room.png");
        write_test_image(&base_path, 400, 250, [90, 110, 130])?;
        let thumb = temp.path().join("thumb.png");
        write_test_image(&thumb, 80, 80, [240, 200, 40])?;
        let products = vec![ProductResult {
            name: "candle".to_string(),
            product_type: "candles".to_string(),
            image_path: Some(thumb),
            ..ProductResult::default()
        }];

        let first_dir = temp.path().join("first");
        let second_dir = temp.path().join("second");
        let first = build_composite(&base_path, &products, &first_dir, PipelineMode::Fast)?;
        let second = build_composite(&base_path, &products, &second_dir, PipelineMode::Fast)?;
        assert_eq!(
            std::fs::read(&first.image_path)?,
            std::fs::read(&second.image_path)?
        );
        Ok(())
    }

    #[test]
    fn fast_mode_downscales_the_finished_composite() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let base_path = temp.path().join("room.png");
        write_test_image(&base_path, 900, 300, [10, 10, 10])?;
        let mut products = Vec::new();
        for idx in 0..3 {
            let thumb = temp.path().join(format!("t{idx}.png"));
            write_test_image(&thumb, 60, 60, [50, 50, 200])?;
            products.push(ProductResult {
                name: format!("p{idx}"),
                product_type: "plants".to_string(),
                image_path: Some(thumb),
                ..ProductResult::default()
            });
        }

        let layout = build_composite(&base_path, &products, temp.path(), PipelineMode::Fast)?;
        // Base 900×300 → 768×256; canvas 768+450 × max(256, 150) = 1218×256,
        // then the whole canvas is capped at 1024 on the long edge.
        assert_eq!(layout.width, 1024);
        assert!(layout.height < 256);
        Ok(())
    }

    #[test]
    fn unreadable_product_consumes_its_grid_slot() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let base_path = temp.path().join("room.png");
        write_test_image(&base_path, 300, 300, [0, 0, 0])?;
        let good = temp.path().join("good.png");
        write_test_image(&good, 100, 100, [1, 2, 3])?;

        let products = vec![
            ProductResult {
                name: "missing".to_string(),
                product_type: "rug".to_string(),
                image_path: None,
                ..ProductResult::default()
            },
            ProductResult {
                name: "present".to_string(),
                product_type: "rug".to_string(),
                image_path: Some(good),
                ..ProductResult::default()
            },
        ];

        let layout = build_composite(&base_path, &products, temp.path(), PipelineMode::Standard)?;
        assert_eq!(layout.placements.len(), 1);
        let placement = &layout.placements[0];
        assert_eq!(placement.index, 1);
        // Second cell of the first row.
        assert_eq!(placement.x, 300 + 200);
        Ok(())
    }

    #[test]
    fn square_canvas_letterboxes_to_1024() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let source = temp.path().join("wide.png");
        write_test_image(&source, 400, 200, [77, 77, 77])?;

        let prepared = prepare_square_canvas(&source, temp.path(), "prepared.png")?;
        let saved = image::open(&prepared)?;
        assert_eq!((saved.width(), saved.height()), (1024, 1024));
        Ok(())
    }

    #[test]
    fn b64_payload_is_persisted_without_any_download() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let source = temp.path().join("pixel.png");
        write_test_image(&source, 2, 2, [5, 6, 7])?;
        let encoded = BASE64.encode(std::fs::read(&source)?);

        let payload = json!({"data": [{"b64_json": encoded}]});
        let out_path = temp.path().join("decoded.png");
        save_edit_response_image(&HttpClient::new(), &payload, &out_path)?;

        let decoded = image::open(&out_path)?;
        assert_eq!((decoded.width(), decoded.height()), (2, 2));
        Ok(())
    }

    #[test]
    fn edit_response_without_data_is_terminal() {
        let temp = tempfile::tempdir().expect("tempdir");
        let out_path = temp.path().join("never.png");
        let missing = save_edit_response_image(&HttpClient::new(), &json!({}), &out_path);
        assert!(missing.is_err());
        let empty_entry = save_edit_response_image(
            &HttpClient::new(),
            &json!({"data": [{}]}),
            &out_path,
        );
        assert!(empty_entry.is_err());
        assert!(!out_path.exists());
    }

    #[test]
    fn fast_vision_encoding_recompresses_to_jpeg() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let source = temp.path().join("big.png");
        write_test_image(&source, 2000, 1000, [33, 66, 99])?;

        let (encoded, mime) = encode_image_for_vision(&source, PipelineMode::Fast)?;
        assert_eq!(mime, "image/jpeg");
        let bytes = BASE64.decode(encoded.as_bytes())?;
        let decoded = image::load_from_memory(&bytes)?;
        assert_eq!((decoded.width(), decoded.height()), (1024, 512));
        Ok(())
    }

    #[test]
    fn normal_vision_encoding_sends_original_bytes() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let source = temp.path().join("room.jpg");
        std::fs::write(&source, b"raw-jpeg-bytes")?;

        let (encoded, mime) = encode_image_for_vision(&source, PipelineMode::Standard)?;
        assert_eq!(mime, "image/jpeg");
        assert_eq!(BASE64.decode(encoded.as_bytes())?, b"raw-jpeg-bytes");
        Ok(())
    }

    #[test]
    fn placeholder_substitution_applies_to_parse_failures_only() {
        let parse_failure: anyhow::Error =
            RevibeError::AnalysisParse("not json".to_string()).into();
        let analysis = analysis_or_placeholder(Err(parse_failure), "bohemian")
            .expect("placeholder expected");
        assert_eq!(analysis.style(), "bohemian");

        let other: anyhow::Error = anyhow::anyhow!("network down");
        assert!(analysis_or_placeholder(Err(other), "bohemian").is_err());
    }
}
