use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ProviderError, Result};
use crate::types::{Advertiser, Variables};

/// What the copywriter is told about a match.
#[derive(Debug, Clone, Serialize)]
pub struct ScriptRequest {
    pub rule_id: String,
    pub advertiser_id: String,
    pub advertiser_name: String,
    pub business_type: String,
    pub voice_type: Option<String>,
    pub variables: Variables,
}

impl ScriptRequest {
    pub fn new(rule_id: &str, advertiser: &Advertiser, variables: Variables) -> Self {
        Self {
            rule_id: rule_id.to_string(),
            advertiser_id: advertiser.id.clone(),
            advertiser_name: advertiser.name.clone(),
            business_type: advertiser.business_type.clone(),
            voice_type: advertiser.voice_type.clone(),
            variables,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GeneratedScript {
    pub text: String,
    #[serde(default, alias = "voiceStyle")]
    pub voice_style: Option<String>,
}

#[async_trait]
pub trait ScriptGenerator: Send + Sync {
    async fn generate_script(&self, request: &ScriptRequest) -> std::result::Result<GeneratedScript, ProviderError>;
}

/// POSTs the request as JSON and expects `{"text": ..., "voice_style": ...}` back.
pub struct HttpScriptGenerator {
    client: reqwest::Client,
    url: String,
}

impl HttpScriptGenerator {
    pub fn new(url: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl ScriptGenerator for HttpScriptGenerator {
    async fn generate_script(&self, request: &ScriptRequest) -> std::result::Result<GeneratedScript, ProviderError> {
        let resp = self.client.post(&self.url).json(request).send().await?;
        if !resp.status().is_success() {
            return Err(ProviderError::Request(format!("script API returned {}", resp.status())));
        }
        let script: GeneratedScript = resp.json().await?;
        if script.text.trim().is_empty() {
            return Err(ProviderError::InvalidResponse("empty script text".to_string()));
        }
        debug!(rule_id = %request.rule_id, chars = script.text.len(), "Script generated");
        Ok(script)
    }
}

/// Offline copywriter: picks a line from the captured weather and time.
pub struct TemplateScriptGenerator;

#[async_trait]
impl ScriptGenerator for TemplateScriptGenerator {
    async fn generate_script(&self, request: &ScriptRequest) -> std::result::Result<GeneratedScript, ProviderError> {
        let name = &request.advertiser_name;
        let temperature = request.variables.get("temperature_c").and_then(|v| v.as_f64());
        let condition = request
            .variables
            .get("condition")
            .and_then(|v| v.as_str())
            .map(str::to_lowercase);

        let text = match (temperature, condition.as_deref()) {
            (_, Some(c)) if c.contains("rain") || c.contains("shower") || c.contains("storm") => {
                format!("Caught in the rain? Step inside {name} and stay dry while you treat yourself.")
            }
            (Some(t), _) if t >= 32.0 => {
                format!("It's {t:.0} degrees out there. Cool down at {name}, just steps away!")
            }
            _ => fallback_script(request),
        };

        Ok(GeneratedScript { text, voice_style: request.voice_type.clone() })
    }
}

/// Deterministic copy used when the generator fails. Same request, same text.
pub fn fallback_script(request: &ScriptRequest) -> String {
    let name = &request.advertiser_name;
    match request.variables.get("temperature_c").and_then(|v| v.as_f64()) {
        Some(t) => format!("It's {t:.0} degrees right now. Drop by {name} today!"),
        None => format!("Drop by {name} today!"),
    }
}
