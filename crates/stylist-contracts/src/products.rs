use serde::{Deserialize, Serialize};

/// One merchant listing, validated once at the API boundary and not
/// mutated afterwards. Deduplication identity is exact `name` equality.
///
/// `rating_share` is always a 0..1 fraction: the merchant API reports the
/// positive-review share sometimes as a fraction and sometimes as a 0..100
/// percentage, so [`normalize_rating_share`] canonicalizes it while the
/// payload is decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub name: String,
    pub price: f64,
    pub coupon_price: f64,
    pub rating_share: f64,
    pub image_url: String,
    pub shop_name: String,
    pub detail_url: String,
    pub sku_url: String,
    pub sales: u64,
}

/// Outcome of one multi-keyword aggregation pass. Transient; never
/// persisted. `total` always equals `goods.len()`, and `goods` never
/// holds two records with the same `name`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedSuggestions {
    pub goods: Vec<ProductRecord>,
    pub successful_keywords: Vec<String>,
    pub total: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AggregatedSuggestions {
    pub fn is_empty(&self) -> bool {
        self.goods.is_empty()
    }
}

/// Canonicalize a raw positive-review share to a 0..1 fraction.
/// Values above 1.0 are treated as percentages; anything non-finite or
/// negative collapses to 0.0.
pub fn normalize_rating_share(raw: f64) -> f64 {
    if !raw.is_finite() || raw <= 0.0 {
        return 0.0;
    }
    let fraction = if raw > 1.0 { raw / 100.0 } else { raw };
    fraction.clamp(0.0, 1.0)
}
