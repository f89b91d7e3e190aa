use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::auth::Credentials;
use crate::image::{GeneratedImage, Prediction};

pub const DEFAULT_LOCATION: &str = "us-central1";
pub const PROJECT_ENV_VAR: &str = "GOOGLE_CLOUD_PROJECT";
pub const LOCATION_ENV_VAR: &str = "VERTEX_AI_LOCATION";
const DEFAULT_TIMEOUT_SECS: u64 = 180;
pub const MIN_IMAGE_COUNT: u32 = 1;
pub const MAX_IMAGE_COUNT: u32 = 4;

/// Supported Imagen models, in the order `list_models` reports them
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ImageModel {
    #[default]
    ImageGeneration006,
    ImageGeneration005,
    ImageGeneration002,
    Imagen3Generate001,
    Imagen3Generate002,
    /// Lower latency, lower fidelity
    Imagen3FastGenerate001,
}

impl ImageModel {
    pub const ALL: [ImageModel; 6] = [
        ImageModel::ImageGeneration006,
        ImageModel::ImageGeneration005,
        ImageModel::ImageGeneration002,
        ImageModel::Imagen3Generate001,
        ImageModel::Imagen3Generate002,
        ImageModel::Imagen3FastGenerate001,
    ];

    pub fn api_model_name(&self) -> &'static str {
        match self {
            ImageModel::ImageGeneration006 => "imagegeneration@006",
            ImageModel::ImageGeneration005 => "imagegeneration@005",
            ImageModel::ImageGeneration002 => "imagegeneration@002",
            ImageModel::Imagen3Generate001 => "imagen-3.0-generate-001",
            ImageModel::Imagen3Generate002 => "imagen-3.0-generate-002",
            ImageModel::Imagen3FastGenerate001 => "imagen-3.0-fast-generate-001",
        }
    }
}

impl fmt::Display for ImageModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.api_model_name())
    }
}

impl FromStr for ImageModel {
    type Err = ImagenError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_lowercase();
        ImageModel::ALL
            .into_iter()
            .find(|m| m.api_model_name() == wanted)
            .ok_or_else(|| ImagenError::Validation(format!("Unsupported model: {}", s)))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AspectRatio {
    #[default]
    Square, // 1:1
    Portrait, // 3:4
    Standard, // 4:3
    Wide,     // 16:9
    Tall,     // 9:16
}

impl AspectRatio {
    pub const ALL: [AspectRatio; 5] = [
        AspectRatio::Square,
        AspectRatio::Portrait,
        AspectRatio::Standard,
        AspectRatio::Wide,
        AspectRatio::Tall,
    ];

    pub fn api_value(&self) -> &'static str {
        match self {
            AspectRatio::Square => "1:1",
            AspectRatio::Portrait => "3:4",
            AspectRatio::Standard => "4:3",
            AspectRatio::Wide => "16:9",
            AspectRatio::Tall => "9:16",
        }
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.api_value())
    }
}

impl FromStr for AspectRatio {
    type Err = ImagenError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "1:1" | "square" => Ok(AspectRatio::Square),
            "3:4" | "portrait" => Ok(AspectRatio::Portrait),
            "4:3" | "standard" => Ok(AspectRatio::Standard),
            "16:9" | "wide" => Ok(AspectRatio::Wide),
            "9:16" | "tall" => Ok(AspectRatio::Tall),
            _ => Err(ImagenError::Validation(format!(
                "Invalid aspect ratio: {}. Use 1:1, 3:4, 4:3, 16:9, or 9:16",
                s
            ))),
        }
    }
}

/// Safety filter threshold applied by the service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SafetySetting {
    BlockLowAndAbove,
    #[default]
    BlockMediumAndAbove,
    BlockOnlyHigh,
    BlockNone,
}

impl SafetySetting {
    pub fn api_value(&self) -> &'static str {
        match self {
            SafetySetting::BlockLowAndAbove => "block_low_and_above",
            SafetySetting::BlockMediumAndAbove => "block_medium_and_above",
            SafetySetting::BlockOnlyHigh => "block_only_high",
            SafetySetting::BlockNone => "block_none",
        }
    }
}

impl fmt::Display for SafetySetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.api_value())
    }
}

impl FromStr for SafetySetting {
    type Err = ImagenError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "block_low_and_above" | "low" => Ok(SafetySetting::BlockLowAndAbove),
            "block_medium_and_above" | "medium" => Ok(SafetySetting::BlockMediumAndAbove),
            "block_only_high" | "high" => Ok(SafetySetting::BlockOnlyHigh),
            "block_none" | "none" => Ok(SafetySetting::BlockNone),
            _ => Err(ImagenError::Validation(format!(
                "Invalid safety setting: {}. Use block_low_and_above, block_medium_and_above, block_only_high, or block_none",
                s
            ))),
        }
    }
}

#[derive(Debug, Error)]
pub enum ImagenError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Vertex AI API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("No images generated: {0}")]
    NoImages(String),

    #[error("Invalid response from Vertex AI: {0}")]
    InvalidResponse(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ImagenError {
    /// True for missing, invalid, or rejected credentials
    pub fn is_auth_error(&self) -> bool {
        matches!(self, ImagenError::Authentication(_))
    }
}

pub type Result<T> = std::result::Result<T, ImagenError>;

#[derive(Debug, Clone)]
pub struct ImagenClientConfig {
    pub project_id: String,
    pub location: String,
    pub timeout_secs: u64,
    /// Overrides `https://{location}-aiplatform.googleapis.com/v1`
    pub endpoint: Option<String>,
}

impl ImagenClientConfig {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            location: DEFAULT_LOCATION.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            endpoint: None,
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Read `GOOGLE_CLOUD_PROJECT` and, optionally, `VERTEX_AI_LOCATION`.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with_project(None)
    }

    /// Like [`from_env`](Self::from_env), but a non-empty `project` takes
    /// precedence over `GOOGLE_CLOUD_PROJECT`.
    pub fn from_env_with_project(project: Option<String>) -> Result<Self> {
        let project = project
            .filter(|p| !p.trim().is_empty())
            .or_else(|| std::env::var(PROJECT_ENV_VAR).ok());
        Self::from_vars(project, std::env::var(LOCATION_ENV_VAR).ok())
    }

    fn from_vars(project: Option<String>, location: Option<String>) -> Result<Self> {
        let project = project
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| {
                ImagenError::Config(format!("{} environment variable is not set", PROJECT_ENV_VAR))
            })?;

        let mut config = Self::new(project);
        if let Some(location) = location.filter(|l| !l.trim().is_empty()) {
            config.location = location;
        }
        Ok(config)
    }

    pub fn base_url(&self) -> String {
        match &self.endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => format!("https://{}-aiplatform.googleapis.com/v1", self.location),
        }
    }
}

/// Parameters for a single generation call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRequest {
    pub prompt: String,
    pub model: ImageModel,
    pub aspect_ratio: AspectRatio,
    pub count: u32,
    pub negative_prompt: Option<String>,
    /// Fixed seed for reproducible output
    pub seed: Option<u32>,
    pub safety_setting: SafetySetting,
    pub enhance_prompt: bool,
    pub add_watermark: bool,
}

impl ImageRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: ImageModel::default(),
            aspect_ratio: AspectRatio::default(),
            count: 1,
            negative_prompt: None,
            seed: None,
            safety_setting: SafetySetting::default(),
            enhance_prompt: true,
            add_watermark: false,
        }
    }

    pub fn with_model(mut self, model: ImageModel) -> Self {
        self.model = model;
        self
    }

    pub fn with_aspect_ratio(mut self, ratio: AspectRatio) -> Self {
        self.aspect_ratio = ratio;
        self
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    pub fn with_negative_prompt(mut self, negative_prompt: impl Into<String>) -> Self {
        self.negative_prompt = Some(negative_prompt.into());
        self
    }

    pub fn with_seed(mut self, seed: u32) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_safety_setting(mut self, safety: SafetySetting) -> Self {
        self.safety_setting = safety;
        self
    }

    pub fn with_enhance_prompt(mut self, enhance: bool) -> Self {
        self.enhance_prompt = enhance;
        self
    }

    pub fn with_watermark(mut self, add_watermark: bool) -> Self {
        self.add_watermark = add_watermark;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.prompt.trim().is_empty() {
            return Err(ImagenError::Validation("Prompt is required".to_string()));
        }
        if !(MIN_IMAGE_COUNT..=MAX_IMAGE_COUNT).contains(&self.count) {
            return Err(ImagenError::Validation(format!(
                "Image count must be between {} and {}, got {}",
                MIN_IMAGE_COUNT, MAX_IMAGE_COUNT, self.count
            )));
        }
        Ok(())
    }

    fn to_payload(&self) -> PredictRequest<'_> {
        PredictRequest {
            instances: [Instance {
                prompt: &self.prompt,
            }],
            parameters: Parameters {
                sample_count: self.count,
                aspect_ratio: self.aspect_ratio.api_value(),
                add_watermark: self.add_watermark,
                enhance_prompt: self.enhance_prompt,
                safety_setting: self.safety_setting.api_value(),
                negative_prompt: self
                    .negative_prompt
                    .as_deref()
                    .filter(|n| !n.trim().is_empty()),
                seed: self.seed,
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct PredictRequest<'a> {
    instances: [Instance<'a>; 1],
    parameters: Parameters<'a>,
}

#[derive(Debug, Serialize)]
struct Instance<'a> {
    prompt: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Parameters<'a> {
    sample_count: u32,
    aspect_ratio: &'static str,
    add_watermark: bool,
    enhance_prompt: bool,
    safety_setting: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    negative_prompt: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    #[serde(default)]
    predictions: Vec<Prediction>,
}

/// Result of a generation call: a single image when one was requested
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Generated {
    One(GeneratedImage),
    Many(Vec<GeneratedImage>),
}

impl Generated {
    pub fn len(&self) -> usize {
        match self {
            Generated::One(_) => 1,
            Generated::Many(images) => images.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn first(&self) -> Option<&GeneratedImage> {
        match self {
            Generated::One(image) => Some(image),
            Generated::Many(images) => images.first(),
        }
    }

    pub fn into_images(self) -> Vec<GeneratedImage> {
        match self {
            Generated::One(image) => vec![image],
            Generated::Many(images) => images,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImagenClient {
    client: Client,
    config: ImagenClientConfig,
    credentials: Option<Credentials>,
}

impl ImagenClient {
    pub fn new(project_id: impl Into<String>) -> Result<Self> {
        Self::with_config(ImagenClientConfig::new(project_id))
    }

    pub fn with_location(project_id: impl Into<String>, location: impl Into<String>) -> Result<Self> {
        Self::with_config(ImagenClientConfig::new(project_id).with_location(location))
    }

    pub fn with_config(config: ImagenClientConfig) -> Result<Self> {
        if config.project_id.trim().is_empty() {
            return Err(ImagenError::Config("Project ID is required".to_string()));
        }

        let client = Client::builder()
            .use_rustls_tls()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(ImagenError::Network)?;

        Ok(Self {
            client,
            config,
            credentials: None,
        })
    }

    pub fn config(&self) -> &ImagenClientConfig {
        &self.config
    }

    /// Authenticate with a service account key file.
    pub async fn setup_credentials<P: AsRef<Path>>(&mut self, key_path: P) -> Result<()> {
        let credentials = Credentials::from_key_file(key_path).await.inspect_err(|e| {
            warn!("{}", e);
        })?;
        self.credentials = Some(credentials);
        Ok(())
    }

    /// Authenticate with the key file named by `GOOGLE_APPLICATION_CREDENTIALS`.
    pub async fn setup_credentials_from_env(&mut self) -> Result<()> {
        let credentials = Credentials::from_env().await.inspect_err(|e| {
            warn!("{}", e);
        })?;
        self.credentials = Some(credentials);
        Ok(())
    }

    /// Authenticate with an already issued OAuth bearer token.
    pub fn set_access_token(&mut self, token: impl Into<String>) -> Result<()> {
        self.credentials = Some(Credentials::from_access_token(token)?);
        Ok(())
    }

    pub fn is_authenticated(&self) -> bool {
        self.credentials.is_some()
    }

    pub fn list_models(&self) -> Vec<&'static str> {
        ImageModel::ALL.iter().map(|m| m.api_model_name()).collect()
    }

    fn predict_url(&self, model: ImageModel) -> String {
        format!(
            "{}/projects/{}/locations/{}/publishers/google/models/{}:predict",
            self.config.base_url(),
            self.config.project_id,
            self.config.location,
            model.api_model_name()
        )
    }

    /// Generate one image from a prompt with default parameters
    pub async fn generate_image(&self, prompt: &str) -> Result<GeneratedImage> {
        self.generate(&ImageRequest::new(prompt))
            .await?
            .into_images()
            .into_iter()
            .next()
            .ok_or_else(|| ImagenError::NoImages("empty response".to_string()))
    }

    pub async fn generate(&self, request: &ImageRequest) -> Result<Generated> {
        request.validate()?;

        let credentials = self.credentials.as_ref().ok_or_else(|| {
            ImagenError::Authentication(
                "Credentials are not configured. Call setup_credentials() first".to_string(),
            )
        })?;
        let token = credentials.access_token().await?;

        let url = self.predict_url(request.model);
        debug!(
            "Sending image generation request to Vertex AI (model: {}, count: {}, aspect: {})",
            request.model, request.count, request.aspect_ratio
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&request.to_payload())
            .send()
            .await?;

        let status = response.status();
        debug!("Received response with status: {}", status);

        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            let error_text = response.text().await.unwrap_or_default();
            return Err(ImagenError::Authentication(format!(
                "HTTP {}: {}",
                status.as_u16(),
                error_text
            )));
        }

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(ImagenError::Api {
                status: status.as_u16(),
                message: error_text,
            });
        }

        let body = response.bytes().await?;
        let parsed: PredictResponse = serde_json::from_slice(&body)?;

        let mut images = Vec::with_capacity(parsed.predictions.len());
        let mut filtered_reason = None;
        for (i, prediction) in parsed.predictions.iter().enumerate() {
            if prediction.bytes_base64_encoded.is_none() {
                let Some(reason) = &prediction.rai_filtered_reason else {
                    return Err(ImagenError::InvalidResponse(format!(
                        "prediction {} has neither image bytes nor a filter reason",
                        i
                    )));
                };
                warn!("Prediction filtered by safety policy: {}", reason);
                filtered_reason = Some(reason.clone());
                continue;
            }
            images.push(GeneratedImage::from_prediction(prediction, &request.prompt)?);
        }

        if images.is_empty() {
            return Err(ImagenError::NoImages(
                filtered_reason.unwrap_or_else(|| "response contained no predictions".to_string()),
            ));
        }

        info!("Generated {} image(s)", images.len());

        if request.count == 1 {
            Ok(Generated::One(images.swap_remove(0)))
        } else {
            Ok(Generated::Many(images))
        }
    }
}
