use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_MERCHANT_URL: &str = "https://api.jd.com/routerjson";

/// Process configuration, loaded once at startup from a TOML file.
///
/// The file itself is required; individual sections are not. A missing
/// `[models.vision]` or unusable `[merchant]` section leaves that
/// component unavailable without preventing the rest from running.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub merchant: Option<MerchantConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelsConfig {
    #[serde(default)]
    pub text: Option<ModelConfig>,
    #[serde(default)]
    pub vision: Option<ModelConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub model: String,
    #[serde(default = "default_ollama_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub num_predict: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MerchantConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub app_key: String,
    #[serde(default)]
    pub app_secret: String,
    #[serde(default = "default_merchant_url")]
    pub base_url: String,
}

impl MerchantConfig {
    /// Product search needs both credentials and the enabled flag; anything
    /// less leaves the integration off.
    pub fn is_usable(&self) -> bool {
        self.enabled && !self.app_key.trim().is_empty() && !self.app_secret.trim().is_empty()
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("config file {} not found", path.display()))?;
        let config: AppConfig = toml::from_str(&raw)
            .with_context(|| format!("config file {} is not valid TOML", path.display()))?;
        Ok(config)
    }
}

fn default_ollama_url() -> String {
    DEFAULT_OLLAMA_URL.to_string()
}

fn default_merchant_url() -> String {
    DEFAULT_MERCHANT_URL.to_string()
}

fn default_enabled() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use super::AppConfig;

    #[test]
    fn missing_file_is_an_error() {
        let err = AppConfig::load(Path::new("/nonexistent/stylist.toml"))
            .err()
            .map(|err| err.to_string())
            .unwrap_or_default();
        assert!(err.contains("not found"), "unexpected error: {err}");
    }

    #[test]
    fn loads_full_config() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("stylist.toml");
        fs::write(
            &path,
            r#"
[models.text]
model = "qwen2.5:latest"
temperature = 0.7

[models.vision]
model = "minicpm-v:8b-2.6-q4_K_M"
base_url = "http://10.0.0.5:11434"

[merchant]
app_key = "key"
app_secret = "secret"
"#,
        )?;
        let config = AppConfig::load(&path)?;
        let text = config.models.text.as_ref().unwrap();
        assert_eq!(text.model, "qwen2.5:latest");
        assert_eq!(text.base_url, "http://localhost:11434");
        assert_eq!(text.temperature, Some(0.7));
        let vision = config.models.vision.as_ref().unwrap();
        assert_eq!(vision.base_url, "http://10.0.0.5:11434");
        let merchant = config.merchant.as_ref().unwrap();
        assert!(merchant.is_usable());
        assert_eq!(merchant.base_url, "https://api.jd.com/routerjson");
        Ok(())
    }

    #[test]
    fn partial_config_leaves_components_unconfigured() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("stylist.toml");
        fs::write(&path, "[models.text]\nmodel = \"qwen2.5:latest\"\n")?;
        let config = AppConfig::load(&path)?;
        assert!(config.models.text.is_some());
        assert!(config.models.vision.is_none());
        assert!(config.merchant.is_none());
        Ok(())
    }

    #[test]
    fn merchant_without_credentials_is_not_usable() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("stylist.toml");
        fs::write(&path, "[merchant]\napp_key = \"key\"\n")?;
        let config = AppConfig::load(&path)?;
        assert!(!config.merchant.unwrap().is_usable());

        fs::write(
            &path,
            "[merchant]\nenabled = false\napp_key = \"key\"\napp_secret = \"secret\"\n",
        )?;
        let config = AppConfig::load(&path)?;
        assert!(!config.merchant.unwrap().is_usable());
        Ok(())
    }

    #[test]
    fn invalid_toml_is_an_error() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("stylist.toml");
        fs::write(&path, "[models.text\nmodel=")?;
        assert!(AppConfig::load(&path).is_err());
        Ok(())
    }
}
