use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use indexmap::IndexMap;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde::Serialize;
use serde_json::{json, Map, Value};
use stylist_contracts::advice::{AdviceResponse, AnalysisResult, AnalysisTask, KEYWORD_MARKER};
use stylist_contracts::config::{AppConfig, MerchantConfig, ModelConfig};
use stylist_contracts::events::{EventPayload, EventWriter};
use stylist_contracts::products::{
    normalize_rating_share, AggregatedSuggestions, ProductRecord,
};

pub const DEFAULT_FALLBACK_KEYWORD: &str = "clothing";
pub const NO_RESULTS_ERROR: &str = "no keyword produced results";

const GOODS_QUERY_METHOD: &str = "jd.union.open.goods.query";
const JPEG_QUALITY: u8 = 85;

const FASHION_ANALYSIS_PROMPT: &str = "\
Look at this photo and identify every visible clothing item (tops, \
trousers, skirts, outerwear, shoes, accessories). For each item describe \
its colour, cut, fabric, and style as precisely as you can. Answer as a \
structured list; do not speculate about items that are not visible.";

const COMPREHENSIVE_ANALYSIS_PROMPT: &str = "\
Look at this photo and describe the full outfit for a stylist: every \
visible clothing item with colour, cut, fabric, and style, plus the \
overall silhouette, how well the pieces work together, the apparent \
occasion, and the body-type considerations the outfit suggests. Answer \
as a structured list; do not speculate about items that are not visible.";

fn vision_prompt(task: AnalysisTask) -> &'static str {
    match task {
        AnalysisTask::FashionAnalysis => FASHION_ANALYSIS_PROMPT,
        AnalysisTask::ComprehensiveAnalysis => COMPREHENSIVE_ANALYSIS_PROMPT,
    }
}

fn build_advice_prompt(query: &str) -> String {
    format!(
        "User question: {query}\n\n\
         You are a professional fashion consultant. Give detailed, practical \
         advice covering:\n\
         1. A direct answer to the question\n\
         2. Concrete outfit combinations\n\
         3. Colour pairings that work\n\
         4. Occasions the look suits\n\
         5. Things to avoid\n\n\
         Finish with one line that starts with \"{KEYWORD_MARKER}:\" followed \
         by 5-8 comma-separated terms for finding matching garments online."
    )
}

fn build_recommendation_prompt(image_analysis: &str) -> String {
    format!(
        "You are a professional fashion consultant. Based on the following \
         photo analysis, provide a complete styling plan:\n\n\
         Photo analysis: {image_analysis}\n\n\
         Cover:\n\
         1. Style summary of the pictured outfit\n\
         2. How to improve or complete the current look\n\
         3. Two or three alternative outfits to consider\n\
         4. Accessories worth adding\n\
         5. Suitable occasions and caveats\n\n\
         Finish with one line that starts with \"{KEYWORD_MARKER}:\" followed \
         by 5-8 comma-separated terms for finding matching garments online."
    )
}

// ---------------------------------------------------------------------------
// Model client
// ---------------------------------------------------------------------------

/// One installed model as reported by the serving endpoint's tag listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelListing {
    pub name: String,
    pub size_bytes: u64,
}

/// Blocking client for an Ollama-style model-serving endpoint.
///
/// Read-only after construction, so one instance is safely shared across
/// operation invocations without locking.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    model: String,
    base_url: String,
    api_key: Option<String>,
    options: Map<String, Value>,
    http: HttpClient,
}

impl OllamaClient {
    pub fn new(config: &ModelConfig) -> Self {
        let mut options = Map::new();
        if let Some(temperature) = config.temperature {
            options.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(top_p) = config.top_p {
            options.insert("top_p".to_string(), json!(top_p));
        }
        if let Some(num_predict) = config.num_predict {
            options.insert("num_predict".to_string(), json!(num_predict));
        }
        Self {
            model: config.model.trim().to_string(),
            base_url: config.base_url.trim().trim_end_matches('/').to_string(),
            api_key: config
                .api_key
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string),
            options,
            http: HttpClient::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Send a prompt (optionally with base64-encoded JPEG images) and
    /// return the raw completion text.
    pub fn generate(&self, prompt: &str, images: &[String]) -> Result<String> {
        let endpoint = format!("{}/api/generate", self.base_url);
        let mut payload = map_object(json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": self.options,
        }));
        if !images.is_empty() {
            payload.insert("images".to_string(), json!(images));
        }

        let mut request = self.http.post(&endpoint).json(&Value::Object(payload));
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }
        let response = request
            .send()
            .with_context(|| format!("model request failed ({endpoint})"))?;
        let parsed = response_json_or_error("model endpoint", response)?;
        let reply = parsed
            .get("response")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("model endpoint reply missing 'response' field"))?;
        Ok(reply.to_string())
    }

    /// Advisory listing of installed models (`GET /api/tags`). Used by the
    /// doctor command only; correctness never depends on it.
    pub fn list_models(&self) -> Result<Vec<ModelListing>> {
        let endpoint = format!("{}/api/tags", self.base_url);
        let response = self
            .http
            .get(&endpoint)
            .send()
            .with_context(|| format!("model endpoint unreachable ({endpoint})"))?;
        let parsed = response_json_or_error("model endpoint", response)?;
        let listings = parsed
            .get("models")
            .and_then(Value::as_array)
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| {
                        let name = row
                            .get("name")
                            .and_then(Value::as_str)
                            .map(str::trim)
                            .filter(|value| !value.is_empty())?;
                        Some(ModelListing {
                            name: name.to_string(),
                            size_bytes: row.get("size").and_then(Value::as_u64).unwrap_or(0),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(listings)
    }
}

/// Read an image from disk, force RGB, re-encode as JPEG in memory, and
/// base64-encode the bytes for the model payload.
pub fn encode_image_jpeg_base64(path: &Path) -> Result<String> {
    let decoded =
        image::open(path).with_context(|| format!("failed reading image {}", path.display()))?;
    let rgb = decoded.to_rgb8();
    let mut bytes: Vec<u8> = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut bytes, JPEG_QUALITY);
    encoder
        .encode_image(&DynamicImage::ImageRgb8(rgb))
        .with_context(|| format!("failed encoding image {}", path.display()))?;
    Ok(BASE64.encode(&bytes))
}

// ---------------------------------------------------------------------------
// Product search client
// ---------------------------------------------------------------------------

/// Seam between the aggregator and the merchant API, so orchestration is
/// testable against in-memory fakes.
pub trait ProductSearch {
    fn search(
        &self,
        keyword: &str,
        page_size: u32,
        min_price: Option<f64>,
        max_price: Option<f64>,
    ) -> Result<Vec<ProductRecord>>;
}

#[derive(Serialize)]
struct GoodsQuery<'a> {
    keyword: &'a str,
    #[serde(rename = "pageIndex")]
    page_index: u32,
    #[serde(rename = "pageSize")]
    page_size: u32,
    #[serde(rename = "isCoupon")]
    is_coupon: u8,
    #[serde(rename = "sortName")]
    sort_name: &'a str,
    sort: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pricefrom: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    priceto: Option<f64>,
}

#[derive(Serialize)]
struct GoodsQueryEnvelope<'a> {
    #[serde(rename = "goodsReqDTO")]
    goods_req: GoodsQuery<'a>,
}

/// Signed client for the JD union goods-query API.
#[derive(Debug, Clone)]
pub struct JdUnionClient {
    app_key: String,
    app_secret: String,
    base_url: String,
    http: HttpClient,
}

impl JdUnionClient {
    pub fn new(config: &MerchantConfig) -> Self {
        Self {
            app_key: config.app_key.trim().to_string(),
            app_secret: config.app_secret.trim().to_string(),
            base_url: config.base_url.trim().trim_end_matches('/').to_string(),
            http: HttpClient::new(),
        }
    }

    fn business_payload(
        keyword: &str,
        page_size: u32,
        min_price: Option<f64>,
        max_price: Option<f64>,
    ) -> Result<String> {
        let envelope = GoodsQueryEnvelope {
            goods_req: GoodsQuery {
                keyword,
                page_index: 1,
                page_size,
                is_coupon: 0,
                sort_name: "inOrderCount30Days",
                sort: "desc",
                pricefrom: min_price,
                priceto: max_price,
            },
        };
        serde_json::to_string(&envelope).context("failed encoding goods query payload")
    }

    fn public_params(&self, payload: String, timestamp: String) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        params.insert("method".to_string(), GOODS_QUERY_METHOD.to_string());
        params.insert("app_key".to_string(), self.app_key.clone());
        params.insert("timestamp".to_string(), timestamp);
        params.insert("format".to_string(), "json".to_string());
        params.insert("v".to_string(), "1.0".to_string());
        params.insert("sign_method".to_string(), "md5".to_string());
        params.insert("360buy_param_json".to_string(), payload);
        params
    }
}

impl ProductSearch for JdUnionClient {
    fn search(
        &self,
        keyword: &str,
        page_size: u32,
        min_price: Option<f64>,
        max_price: Option<f64>,
    ) -> Result<Vec<ProductRecord>> {
        let payload = Self::business_payload(keyword, page_size, min_price, max_price)?;
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let mut params = self.public_params(payload, timestamp);
        let sign = sign_params(&params, &self.app_secret);
        params.insert("sign".to_string(), sign);

        let response = self
            .http
            .get(&self.base_url)
            .query(&params)
            .send()
            .with_context(|| format!("merchant request failed ({})", self.base_url))?;
        let envelope = response_json_or_error("merchant API", response)?;
        goods_from_envelope(&envelope)
    }
}

/// Merchant request signature: concatenate all params sorted by name
/// (name then value, no separator), wrap the string with the shared
/// secret on both ends, MD5, uppercase hex. The remote service rejects
/// any request whose signature does not recompute identically.
pub fn sign_params(params: &BTreeMap<String, String>, secret: &str) -> String {
    let mut concatenated = String::with_capacity(
        2 * secret.len()
            + params
                .iter()
                .map(|(name, value)| name.len() + value.len())
                .sum::<usize>(),
    );
    concatenated.push_str(secret);
    for (name, value) in params {
        concatenated.push_str(name);
        concatenated.push_str(value);
    }
    concatenated.push_str(secret);
    hex::encode_upper(md5::compute(concatenated.as_bytes()).0)
}

/// Unwrap the nested goods-query reply. `error_response` signals a remote
/// error; otherwise `queryResult` holds a JSON-encoded string that must be
/// parsed again to reach the listing array. Listings without a usable name
/// are dropped here, the single validation point for product data.
pub fn goods_from_envelope(envelope: &Value) -> Result<Vec<ProductRecord>> {
    if let Some(error) = envelope.get("error_response") {
        let detail = error
            .get("zh_desc")
            .or_else(|| error.get("en_desc"))
            .and_then(Value::as_str)
            .unwrap_or("unknown remote error");
        bail!("merchant API error: {detail}");
    }

    // The remote envelope key has historically shipped with both spellings.
    let reply = envelope
        .get("jd_union_open_goods_query_responce")
        .or_else(|| envelope.get("jd_union_open_goods_query_response"))
        .ok_or_else(|| anyhow!("merchant reply missing goods query envelope"))?;
    let query_result = match reply.get("queryResult") {
        Some(Value::String(raw)) => serde_json::from_str::<Value>(raw)
            .context("merchant queryResult is not valid JSON")?,
        Some(other) => other.clone(),
        None => bail!("merchant reply missing queryResult"),
    };

    let listings = query_result
        .get("data")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    Ok(listings.iter().filter_map(record_from_listing).collect())
}

fn record_from_listing(listing: &Value) -> Option<ProductRecord> {
    let name = listing
        .get("skuName")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())?
        .to_string();
    let price_info = listing.get("priceInfo");
    let price = price_info
        .and_then(|info| info.get("price"))
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
        .max(0.0);
    let coupon_price = price_info
        .and_then(|info| info.get("lowestCouponPrice"))
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
        .max(0.0);
    let rating_share = normalize_rating_share(
        listing
            .get("goodCommentsShare")
            .and_then(Value::as_f64)
            .unwrap_or(0.0),
    );
    let image_url = listing
        .get("imageInfo")
        .and_then(|info| info.get("imageList"))
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
        .and_then(|row| row.get("url"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let shop_name = listing
        .get("shopInfo")
        .and_then(|info| info.get("shopName"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let detail_url = listing
        .get("materialUrl")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let sku_url = match listing.get("skuId") {
        Some(Value::Number(id)) => format!("https://item.jd.com/{id}.html"),
        Some(Value::String(id)) if !id.trim().is_empty() => {
            format!("https://item.jd.com/{}.html", id.trim())
        }
        _ => String::new(),
    };
    let sales = listing
        .get("inOrderCount30Days")
        .and_then(Value::as_u64)
        .unwrap_or(0);

    Some(ProductRecord {
        name,
        price,
        coupon_price,
        rating_share,
        image_url,
        shop_name,
        detail_url,
        sku_url,
        sales,
    })
}

// ---------------------------------------------------------------------------
// Multi-keyword aggregation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AggregateOptions {
    pub fallback_keyword: String,
    pub target_count: usize,
    pub page_size: u32,
    /// Raw-result count at which remaining plan keywords are skipped, to
    /// bound latency.
    pub search_budget: usize,
}

impl Default for AggregateOptions {
    fn default() -> Self {
        Self {
            fallback_keyword: DEFAULT_FALLBACK_KEYWORD.to_string(),
            target_count: 6,
            page_size: 5,
            search_budget: 10,
        }
    }
}

/// Turn candidate keywords into up to `target_count` deduplicated product
/// suggestions, tolerating failure of any individual keyword search.
///
/// The plan is `keywords + [fallback]` (just the fallback when `keywords`
/// is empty). A keyword whose search fails or returns nothing is recorded
/// as unsuccessful and the next one is tried; there is no per-keyword
/// retry. Iteration stops once the raw accumulator reaches the budget.
/// Deduplication is by exact `name`, first occurrence wins, insertion
/// order preserved. When no keyword produces anything the outcome carries
/// [`NO_RESULTS_ERROR`] as a reported (non-fatal) error.
pub fn aggregate_products(
    search: &dyn ProductSearch,
    keywords: &[String],
    opts: &AggregateOptions,
) -> AggregatedSuggestions {
    let mut plan: Vec<String> = keywords.to_vec();
    plan.push(opts.fallback_keyword.clone());

    let mut raw: Vec<ProductRecord> = Vec::new();
    let mut successful_keywords: Vec<String> = Vec::new();
    for keyword in &plan {
        if raw.len() >= opts.search_budget {
            break;
        }
        match search.search(keyword, opts.page_size, None, None) {
            Ok(goods) if !goods.is_empty() => {
                raw.extend(goods);
                successful_keywords.push(keyword.clone());
            }
            Ok(_) | Err(_) => continue,
        }
    }

    if raw.is_empty() {
        return AggregatedSuggestions {
            goods: Vec::new(),
            successful_keywords,
            total: 0,
            error: Some(NO_RESULTS_ERROR.to_string()),
        };
    }

    let mut unique: IndexMap<String, ProductRecord> = IndexMap::new();
    for record in raw {
        unique.entry(record.name.clone()).or_insert(record);
    }
    let goods: Vec<ProductRecord> = unique.into_values().take(opts.target_count).collect();

    AggregatedSuggestions {
        total: goods.len(),
        goods,
        successful_keywords,
        error: None,
    }
}

// ---------------------------------------------------------------------------
// Orchestration
// ---------------------------------------------------------------------------

/// Reply to a free-text fashion question. `recommendations` is attached
/// only when the reply yielded keywords and product search is configured.
#[derive(Debug, Clone, Serialize)]
pub struct QueryAnswer {
    pub analysis: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendations: Option<AggregatedSuggestions>,
}

/// Full image pipeline result: analysis, styling advice, the search
/// terms pulled from the advice, and the aggregated product picks.
#[derive(Debug, Clone, Serialize)]
pub struct OutfitReport {
    pub image_analysis: String,
    pub recommendations: String,
    pub search_terms: Vec<String>,
    pub product_suggestions: AggregatedSuggestions,
}

/// Sequences vision analysis, advice generation, keyword extraction, and
/// product aggregation. Holds only the client handles it was given at
/// construction; all three public operations are stateless across calls.
pub struct StylistEngine {
    text: Option<OllamaClient>,
    vision: Option<OllamaClient>,
    search: Option<Box<dyn ProductSearch>>,
    events: Option<EventWriter>,
    aggregate_opts: AggregateOptions,
}

impl StylistEngine {
    pub fn new(
        text: Option<OllamaClient>,
        vision: Option<OllamaClient>,
        search: Option<Box<dyn ProductSearch>>,
        events: Option<EventWriter>,
    ) -> Self {
        Self {
            text,
            vision,
            search,
            events,
            aggregate_opts: AggregateOptions::default(),
        }
    }

    /// Build clients from configuration. Missing sections leave the
    /// corresponding component unavailable; operations that need it
    /// report that instead of failing construction.
    pub fn from_config(config: &AppConfig, events: Option<EventWriter>) -> Self {
        let text = config.models.text.as_ref().map(OllamaClient::new);
        let vision = config.models.vision.as_ref().map(OllamaClient::new);
        let search: Option<Box<dyn ProductSearch>> = match &config.merchant {
            Some(merchant) if merchant.is_usable() => {
                Some(Box::new(JdUnionClient::new(merchant)))
            }
            _ => None,
        };
        Self::new(text, vision, search, events)
    }

    /// Describe the clothing in one photo. The path is checked before any
    /// network traffic happens.
    pub fn analyze_image(&self, image_path: &Path, task: AnalysisTask) -> Result<AnalysisResult> {
        if !image_path.exists() {
            bail!("image {} not found", image_path.display());
        }
        let Some(vision) = &self.vision else {
            bail!("vision model unavailable; add [models.vision] to the config");
        };

        self.emit(
            "vision_analysis_started",
            map_object(json!({
                "image": image_path.display().to_string(),
                "task": task,
            })),
        )?;
        let encoded = encode_image_jpeg_base64(image_path)?;
        let raw_text = vision.generate(vision_prompt(task), &[encoded])?;
        self.emit(
            "vision_analysis_finished",
            map_object(json!({ "chars": raw_text.chars().count() })),
        )?;

        Ok(AnalysisResult { raw_text, task })
    }

    /// Answer a free-text fashion question, attaching product suggestions
    /// when the advice yielded keywords and search is configured.
    pub fn answer_query(&self, query: &str) -> Result<QueryAnswer> {
        let Some(text) = &self.text else {
            bail!("text model unavailable; add [models.text] to the config");
        };

        self.emit(
            "advice_query_started",
            map_object(json!({ "chars": query.chars().count() })),
        )?;
        let reply = text.generate(&build_advice_prompt(query), &[])?;
        let advice = AdviceResponse::from_model_reply(reply);
        self.emit(
            "advice_generated",
            map_object(json!({ "keywords": advice.keywords })),
        )?;

        let mut recommendations = None;
        if !advice.keywords.is_empty() {
            if let Some(search) = self.search.as_deref() {
                recommendations = Some(self.run_aggregation(search, &advice.keywords)?);
            }
        }

        Ok(QueryAnswer {
            analysis: advice.full_text,
            recommendations,
        })
    }

    /// Full pipeline: image analysis, styling advice built on it, keyword
    /// extraction, product aggregation. Any stage failure short-circuits
    /// and earlier partial results are discarded.
    pub fn analyze_and_recommend(&self, image_path: &Path) -> Result<OutfitReport> {
        let Some(text) = &self.text else {
            bail!("text model unavailable; add [models.text] to the config");
        };
        if self.vision.is_none() {
            bail!("vision model unavailable; add [models.vision] to the config");
        }
        let Some(search) = self.search.as_deref() else {
            bail!("product search unavailable; configure [merchant] credentials");
        };

        let analysis = self.analyze_image(image_path, AnalysisTask::ComprehensiveAnalysis)?;
        let reply = text.generate(&build_recommendation_prompt(&analysis.raw_text), &[])?;
        let advice = AdviceResponse::from_model_reply(reply);
        self.emit(
            "advice_generated",
            map_object(json!({ "keywords": advice.keywords })),
        )?;

        let product_suggestions = self.run_aggregation(search, &advice.keywords)?;
        self.emit(
            "pipeline_finished",
            map_object(json!({ "total": product_suggestions.total })),
        )?;

        Ok(OutfitReport {
            image_analysis: analysis.raw_text,
            recommendations: advice.full_text,
            search_terms: advice.keywords,
            product_suggestions,
        })
    }

    fn run_aggregation(
        &self,
        search: &dyn ProductSearch,
        keywords: &[String],
    ) -> Result<AggregatedSuggestions> {
        self.emit(
            "keyword_plan",
            map_object(json!({
                "keywords": keywords,
                "fallback": self.aggregate_opts.fallback_keyword,
            })),
        )?;
        let suggestions = aggregate_products(search, keywords, &self.aggregate_opts);
        self.emit(
            "aggregation_finished",
            map_object(json!({
                "total": suggestions.total,
                "successful_keywords": suggestions.successful_keywords,
                "error": suggestions.error,
            })),
        )?;
        Ok(suggestions)
    }

    fn emit(&self, event_type: &str, payload: EventPayload) -> Result<()> {
        if let Some(events) = &self.events {
            events.emit(event_type, payload)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn response_json_or_error(source: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{source} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{source} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{source} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Mutex;

    use anyhow::{bail, Result};
    use base64::Engine as _;
    use image::{DynamicImage, RgbaImage};
    use serde_json::{json, Value};
    use stylist_contracts::advice::KEYWORD_MARKER;
    use stylist_contracts::config::{MerchantConfig, ModelConfig};
    use stylist_contracts::products::ProductRecord;

    use super::{
        aggregate_products, build_advice_prompt, build_recommendation_prompt,
        encode_image_jpeg_base64, goods_from_envelope, sign_params, vision_prompt,
        AggregateOptions, AnalysisTask, JdUnionClient, OllamaClient, ProductSearch,
        StylistEngine, BASE64, NO_RESULTS_ERROR,
    };

    fn record(name: &str) -> ProductRecord {
        ProductRecord {
            name: name.to_string(),
            price: 129.0,
            coupon_price: 99.0,
            rating_share: 0.96,
            image_url: format!("https://img.example.com/{name}.jpg"),
            shop_name: "Example Shop".to_string(),
            detail_url: format!("https://u.example.com/{name}"),
            sku_url: format!("https://item.jd.com/{name}.html"),
            sales: 42,
        }
    }

    fn records(names: &[&str]) -> Vec<ProductRecord> {
        names.iter().map(|name| record(name)).collect()
    }

    struct FakeSearch {
        responses: HashMap<String, Result<Vec<ProductRecord>, String>>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeSearch {
        fn new(responses: Vec<(&str, Result<Vec<ProductRecord>, String>)>) -> Self {
            Self {
                responses: responses
                    .into_iter()
                    .map(|(keyword, outcome)| (keyword.to_string(), outcome))
                    .collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ProductSearch for FakeSearch {
        fn search(
            &self,
            keyword: &str,
            _page_size: u32,
            _min_price: Option<f64>,
            _max_price: Option<f64>,
        ) -> Result<Vec<ProductRecord>> {
            self.calls.lock().unwrap().push(keyword.to_string());
            match self.responses.get(keyword) {
                Some(Ok(goods)) => Ok(goods.clone()),
                Some(Err(message)) => bail!("{message}"),
                None => Ok(Vec::new()),
            }
        }
    }

    fn keywords(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn aggregation_dedups_by_name_and_caps_output() {
        let search = FakeSearch::new(vec![
            (
                "red dress",
                Ok(records(&["a", "b", "c", "d", "e", "f", "g", "h"])),
            ),
            ("silk scarf", Ok(records(&["a", "b", "i"]))),
        ]);
        let result = aggregate_products(
            &search,
            &keywords(&["red dress", "silk scarf"]),
            &AggregateOptions::default(),
        );

        // 8 raw results are under the budget of 10, so the second keyword
        // is still attempted; afterwards the budget stops the fallback.
        assert_eq!(search.calls(), vec!["red dress", "silk scarf"]);
        assert_eq!(result.total, 6);
        assert_eq!(result.goods.len(), 6);
        let names: Vec<&str> = result.goods.iter().map(|item| item.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c", "d", "e", "f"]);
        assert_eq!(result.successful_keywords, keywords(&["red dress", "silk scarf"]));
        assert!(result.error.is_none());
    }

    #[test]
    fn first_seen_record_wins_on_duplicate_names() {
        let mut cheap = record("a");
        cheap.price = 10.0;
        let search = FakeSearch::new(vec![
            ("kw1", Ok(vec![record("a"), record("b")])),
            ("kw2", Ok(vec![cheap])),
        ]);
        let result = aggregate_products(
            &search,
            &keywords(&["kw1", "kw2"]),
            &AggregateOptions::default(),
        );
        assert_eq!(result.goods[0].price, 129.0);
        assert_eq!(result.total, 2);
        // kw2 returned results before dedup, so it still counts as successful.
        assert_eq!(result.successful_keywords, keywords(&["kw1", "kw2"]));
    }

    #[test]
    fn failed_keyword_is_skipped_not_fatal() {
        let search = FakeSearch::new(vec![
            ("kw1", Err("connection refused".to_string())),
            ("kw2", Ok(records(&["a"]))),
        ]);
        let result = aggregate_products(
            &search,
            &keywords(&["kw1", "kw2"]),
            &AggregateOptions::default(),
        );
        assert_eq!(result.successful_keywords, keywords(&["kw2"]));
        assert_eq!(result.total, 1);
        assert!(result.error.is_none());
    }

    #[test]
    fn budget_skips_remaining_plan_keywords() {
        let search = FakeSearch::new(vec![
            (
                "kw1",
                Ok(records(&["a", "b", "c", "d", "e", "f", "g", "h", "i", "j"])),
            ),
            ("kw2", Ok(records(&["k"]))),
        ]);
        let result = aggregate_products(
            &search,
            &keywords(&["kw1", "kw2"]),
            &AggregateOptions::default(),
        );
        assert_eq!(search.calls(), vec!["kw1"]);
        assert_eq!(result.total, 6);
    }

    #[test]
    fn empty_keywords_fall_back_to_generic_term() {
        let search = FakeSearch::new(vec![("clothing", Ok(records(&["a", "b"])))]);
        let result = aggregate_products(&search, &[], &AggregateOptions::default());
        assert_eq!(search.calls(), vec!["clothing"]);
        assert_eq!(result.successful_keywords, keywords(&["clothing"]));
        assert_eq!(result.total, 2);
    }

    #[test]
    fn all_failures_report_no_results_outcome() {
        let search = FakeSearch::new(vec![
            ("kw1", Err("timeout".to_string())),
            ("kw2", Err("timeout".to_string())),
            ("clothing", Err("timeout".to_string())),
        ]);
        let result = aggregate_products(
            &search,
            &keywords(&["kw1", "kw2"]),
            &AggregateOptions::default(),
        );
        assert_eq!(search.calls(), vec!["kw1", "kw2", "clothing"]);
        assert!(result.goods.is_empty());
        assert_eq!(result.total, 0);
        assert!(result.successful_keywords.is_empty());
        assert_eq!(result.error.as_deref(), Some(NO_RESULTS_ERROR));
    }

    #[test]
    fn zero_result_keyword_is_unsuccessful() {
        let search = FakeSearch::new(vec![
            ("kw1", Ok(Vec::new())),
            ("kw2", Ok(records(&["a"]))),
        ]);
        let result = aggregate_products(
            &search,
            &keywords(&["kw1", "kw2"]),
            &AggregateOptions::default(),
        );
        assert_eq!(result.successful_keywords, keywords(&["kw2"]));
    }

    #[test]
    fn aggregation_total_always_matches_goods() {
        let search = FakeSearch::new(vec![("kw1", Ok(records(&["a", "b", "a", "b", "c"])))]);
        let result =
            aggregate_products(&search, &keywords(&["kw1"]), &AggregateOptions::default());
        assert_eq!(result.total, result.goods.len());
        let mut names: Vec<&str> = result.goods.iter().map(|item| item.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), result.goods.len());
    }

    fn merchant_config(app_key: &str, app_secret: &str) -> MerchantConfig {
        MerchantConfig {
            enabled: true,
            app_key: app_key.to_string(),
            app_secret: app_secret.to_string(),
            base_url: "https://api.jd.com/routerjson".to_string(),
        }
    }

    #[test]
    fn sign_matches_known_vector() {
        let mut params = std::collections::BTreeMap::new();
        params.insert("b".to_string(), "2".to_string());
        params.insert("a".to_string(), "1".to_string());
        assert_eq!(sign_params(&params, "s"), "5EE29085AF57D942F21F1C5BA3C2A90A");
    }

    #[test]
    fn signed_goods_query_matches_known_vector() -> Result<()> {
        let client = JdUnionClient::new(&merchant_config("test-key", "test-secret"));
        let payload = JdUnionClient::business_payload("silk scarf", 5, None, None)?;
        let params =
            client.public_params(payload, "2026-01-02 03:04:05".to_string());
        assert_eq!(
            sign_params(&params, "test-secret"),
            "E89C116821AC98FFA876F1A8EBA431D8"
        );
        Ok(())
    }

    #[test]
    fn sign_is_independent_of_insertion_order() {
        let mut forward = std::collections::BTreeMap::new();
        forward.insert("method".to_string(), "query".to_string());
        forward.insert("app_key".to_string(), "k".to_string());
        let mut reverse = std::collections::BTreeMap::new();
        reverse.insert("app_key".to_string(), "k".to_string());
        reverse.insert("method".to_string(), "query".to_string());
        assert_eq!(sign_params(&forward, "s"), sign_params(&reverse, "s"));
    }

    #[test]
    fn business_payload_includes_optional_price_bounds() -> Result<()> {
        let payload = JdUnionClient::business_payload("dress", 5, Some(100.0), Some(300.0))?;
        assert!(payload.contains("\"pricefrom\":100.0"));
        assert!(payload.contains("\"priceto\":300.0"));

        let payload = JdUnionClient::business_payload("dress", 5, None, None)?;
        assert!(!payload.contains("pricefrom"));
        assert!(!payload.contains("priceto"));
        Ok(())
    }

    fn sample_listing(name: &str) -> Value {
        json!({
            "skuName": name,
            "skuId": 123456u64,
            "priceInfo": { "price": 199.0, "lowestCouponPrice": 159.0 },
            "goodCommentsShare": 97.0,
            "imageInfo": { "imageList": [ { "url": "https://img.example.com/main.jpg" } ] },
            "shopInfo": { "shopName": "Example Shop" },
            "materialUrl": "u.jd.com/abc",
            "inOrderCount30Days": 321u64,
        })
    }

    fn envelope_with(listings: Vec<Value>) -> Value {
        let inner = json!({ "data": listings }).to_string();
        json!({
            "jd_union_open_goods_query_responce": { "queryResult": inner }
        })
    }

    #[test]
    fn envelope_parsing_reaches_nested_listings() -> Result<()> {
        let goods = goods_from_envelope(&envelope_with(vec![sample_listing("Linen Shirt")]))?;
        assert_eq!(goods.len(), 1);
        let item = &goods[0];
        assert_eq!(item.name, "Linen Shirt");
        assert_eq!(item.price, 199.0);
        assert_eq!(item.coupon_price, 159.0);
        assert_eq!(item.rating_share, 0.97);
        assert_eq!(item.image_url, "https://img.example.com/main.jpg");
        assert_eq!(item.shop_name, "Example Shop");
        assert_eq!(item.detail_url, "u.jd.com/abc");
        assert_eq!(item.sku_url, "https://item.jd.com/123456.html");
        assert_eq!(item.sales, 321);
        Ok(())
    }

    #[test]
    fn envelope_accepts_both_reply_key_spellings() -> Result<()> {
        let inner = json!({ "data": [sample_listing("Coat")] }).to_string();
        let envelope = json!({
            "jd_union_open_goods_query_response": { "queryResult": inner }
        });
        let goods = goods_from_envelope(&envelope)?;
        assert_eq!(goods[0].name, "Coat");
        Ok(())
    }

    #[test]
    fn envelope_error_response_is_reported() {
        let envelope = json!({
            "error_response": { "zh_desc": "无效签名", "code": "19" }
        });
        let err = goods_from_envelope(&envelope).err().map(|err| err.to_string());
        assert_eq!(err.as_deref(), Some("merchant API error: 无效签名"));
    }

    #[test]
    fn listings_without_a_name_are_dropped() -> Result<()> {
        let mut nameless = sample_listing("");
        nameless["skuName"] = json!("   ");
        let goods =
            goods_from_envelope(&envelope_with(vec![nameless, sample_listing("Kept")]))?;
        assert_eq!(goods.len(), 1);
        assert_eq!(goods[0].name, "Kept");
        Ok(())
    }

    #[test]
    fn malformed_query_result_is_an_error() {
        let envelope = json!({
            "jd_union_open_goods_query_responce": { "queryResult": "not json" }
        });
        assert!(goods_from_envelope(&envelope).is_err());
    }

    #[test]
    fn encode_image_forces_rgb_jpeg() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("swatch.png");
        let rgba = RgbaImage::from_pixel(4, 4, image::Rgba([200, 40, 40, 128]));
        DynamicImage::ImageRgba8(rgba).save(&path)?;

        let encoded = encode_image_jpeg_base64(&path)?;
        let bytes = BASE64.decode(encoded.as_bytes())?;
        assert_eq!(&bytes[..2], &[0xFF, 0xD8], "expected JPEG magic");
        Ok(())
    }

    #[test]
    fn encode_image_missing_file_is_an_error() {
        assert!(encode_image_jpeg_base64(Path::new("/nonexistent/photo.png")).is_err());
    }

    fn model_config(model: &str) -> ModelConfig {
        ModelConfig {
            model: model.to_string(),
            base_url: "http://127.0.0.1:1".to_string(),
            api_key: None,
            temperature: Some(0.7),
            top_p: None,
            num_predict: None,
        }
    }

    #[test]
    fn analyze_image_requires_an_existing_path() {
        let engine = StylistEngine::new(
            Some(OllamaClient::new(&model_config("qwen2.5:latest"))),
            Some(OllamaClient::new(&model_config("minicpm-v:8b-2.6"))),
            None,
            None,
        );
        let err = engine
            .analyze_image(
                Path::new("/nonexistent/outfit.jpg"),
                AnalysisTask::FashionAnalysis,
            )
            .err()
            .map(|err| err.to_string())
            .unwrap_or_default();
        assert!(err.contains("not found"), "unexpected error: {err}");
    }

    #[test]
    fn analyze_image_without_vision_client_is_reported() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("outfit.png");
        std::fs::write(&path, b"placeholder")?;
        let engine = StylistEngine::new(None, None, None, None);
        let err = engine
            .analyze_image(&path, AnalysisTask::FashionAnalysis)
            .err()
            .map(|err| err.to_string())
            .unwrap_or_default();
        assert!(
            err.contains("vision model unavailable"),
            "unexpected error: {err}"
        );
        Ok(())
    }

    #[test]
    fn answer_query_without_text_client_is_reported() {
        let engine = StylistEngine::new(None, None, None, None);
        let err = engine
            .answer_query("what should I wear to a wedding?")
            .err()
            .map(|err| err.to_string())
            .unwrap_or_default();
        assert!(
            err.contains("text model unavailable"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn analyze_and_recommend_requires_all_components() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("outfit.png");
        std::fs::write(&path, b"placeholder")?;

        let engine = StylistEngine::new(
            Some(OllamaClient::new(&model_config("qwen2.5:latest"))),
            Some(OllamaClient::new(&model_config("minicpm-v:8b-2.6"))),
            None,
            None,
        );
        let err = engine
            .analyze_and_recommend(&path)
            .err()
            .map(|err| err.to_string())
            .unwrap_or_default();
        assert!(
            err.contains("product search unavailable"),
            "unexpected error: {err}"
        );
        Ok(())
    }

    #[test]
    fn prompts_carry_the_keyword_marker() {
        assert!(build_advice_prompt("wedding outfit").contains(KEYWORD_MARKER));
        assert!(build_recommendation_prompt("navy blazer, chinos").contains(KEYWORD_MARKER));
        assert!(!vision_prompt(AnalysisTask::FashionAnalysis).contains(KEYWORD_MARKER));
        assert!(!vision_prompt(AnalysisTask::ComprehensiveAnalysis).contains(KEYWORD_MARKER));
    }
}
