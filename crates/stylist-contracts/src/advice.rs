use serde::Serialize;

/// Heading literal the advice prompts instruct the model to emit in front
/// of its comma-separated shopping terms. Extraction keys off this exact
/// string.
pub const KEYWORD_MARKER: &str = "Shopping keywords";

/// Accepted term separators. Local models answer with ASCII commas, CJK
/// full-width commas, or the enumeration comma depending on the language
/// they drift into, so all three count as delimiters.
const KEYWORD_DELIMITERS: &[char] = &[',', '，', '、'];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisTask {
    FashionAnalysis,
    ComprehensiveAnalysis,
}

/// Raw vision-model output for one image, consumed once by the engine.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisResult {
    pub raw_text: String,
    pub task: AnalysisTask,
}

/// A text-model reply split into its prose and the shopping terms it
/// declared. `keywords` is empty when the reply carried no usable
/// keyword section; callers fall back to a generic search term.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdviceResponse {
    pub full_text: String,
    pub keywords: Vec<String>,
}

impl AdviceResponse {
    pub fn from_model_reply(reply: String) -> Self {
        let keywords = extract_keywords(&reply);
        Self {
            full_text: reply,
            keywords,
        }
    }
}

/// Pull the shopping terms out of a model reply.
///
/// Finds [`KEYWORD_MARKER`], takes the remainder of that line, strips an
/// optional `:`/`：` label separator (tolerating markdown bold around the
/// heading), splits on the accepted delimiters, and trims each piece.
/// Any malformed or absent section degrades to an empty list; this
/// function never fails.
pub fn extract_keywords(text: &str) -> Vec<String> {
    let Some(index) = text.find(KEYWORD_MARKER) else {
        return Vec::new();
    };
    let tail = &text[index + KEYWORD_MARKER.len()..];
    let line = tail.lines().next().unwrap_or("");
    let line = line.trim_start_matches(|ch: char| ch == '*' || ch.is_whitespace());
    let line = line
        .strip_prefix(':')
        .or_else(|| line.strip_prefix('：'))
        .unwrap_or(line);

    line.split(KEYWORD_DELIMITERS)
        .map(|piece| piece.trim_matches(|ch: char| ch == '*' || ch.is_whitespace()))
        .filter(|piece| !piece.is_empty())
        .map(str::to_string)
        .collect()
}
