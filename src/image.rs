use base64::Engine;
use serde::Deserialize;
use std::fmt;
use std::io::Write;
use std::path::Path;
use tokio::fs;

use crate::imagen_api::{ImagenError, Result};

const DEFAULT_MIME_TYPE: &str = "image/png";

/// One entry of the `predictions` array returned by `:predict`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Prediction {
    #[serde(default)]
    pub bytes_base64_encoded: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    /// Enhanced prompt, present when prompt enhancement ran
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub rai_filtered_reason: Option<String>,
}

/// Generated image data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    pub data: Vec<u8>,
    pub mime_type: String,
    /// Prompt as submitted
    pub prompt: String,
    /// Prompt as rewritten by the service, when enhancement ran
    pub enhanced_prompt: Option<String>,
}

impl GeneratedImage {
    pub(crate) fn from_prediction(prediction: &Prediction, prompt: &str) -> Result<Self> {
        let encoded = prediction.bytes_base64_encoded.as_deref().ok_or_else(|| {
            ImagenError::InvalidResponse("prediction carries no image bytes".to_string())
        })?;
        let data = base64::engine::general_purpose::STANDARD.decode(encoded)?;

        Ok(Self {
            data,
            mime_type: prediction
                .mime_type
                .clone()
                .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string()),
            prompt: prompt.to_string(),
            enhanced_prompt: prediction.prompt.clone().filter(|p| p != prompt),
        })
    }

    /// Image size in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Get the appropriate file extension for this image
    pub fn extension(&self) -> &'static str {
        match self.mime_type.as_str() {
            "image/png" => "png",
            "image/jpeg" | "image/jpg" => "jpg",
            "image/webp" => "webp",
            "image/gif" => "gif",
            _ => "png",
        }
    }

    /// Enhanced prompt if the service rewrote it, otherwise the original
    pub fn effective_prompt(&self) -> &str {
        self.enhanced_prompt.as_deref().unwrap_or(&self.prompt)
    }

    /// Write the image bytes to `path`, creating parent directories as needed.
    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            fs::create_dir_all(parent).await?;
        }

        fs::write(path, &self.data).await?;
        Ok(())
    }

    /// Display the image inline in terminals that speak the iTerm2 image protocol
    /// (iTerm2, WezTerm, Konsole). Other terminals ignore the sequence.
    pub fn show(&self) -> Result<()> {
        let stdout = std::io::stdout();
        let mut handle = stdout.lock();
        self.write_inline(&mut handle)?;
        handle.flush()?;
        Ok(())
    }

    pub fn write_inline<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(&self.data);
        write!(
            writer,
            "\x1b]1337;File=inline=1;size={};preserveAspectRatio=1:{}\x07",
            self.size(),
            encoded
        )?;
        writeln!(writer)
    }
}

impl fmt::Display for GeneratedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short: String = self.prompt.chars().take(30).collect();
        write!(
            f,
            "GeneratedImage(prompt='{}...', size={} bytes)",
            short,
            group_thousands(self.size())
        )
    }
}

/// `1234567` -> `"1,234,567"`
fn group_thousands(n: usize) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_image(data: Vec<u8>) -> GeneratedImage {
        GeneratedImage {
            data,
            mime_type: "image/png".to_string(),
            prompt: "A beautiful sunset over the ocean with waves".to_string(),
            enhanced_prompt: None,
        }
    }

    #[test]
    fn test_generated_image_extension() {
        let mut image = sample_image(vec![]);
        assert_eq!(image.extension(), "png");

        image.mime_type = "image/jpeg".to_string();
        assert_eq!(image.extension(), "jpg");

        image.mime_type = "image/webp".to_string();
        assert_eq!(image.extension(), "webp");

        image.mime_type = "image/unknown".to_string();
        assert_eq!(image.extension(), "png");
    }

    #[test]
    fn test_size_matches_buffer() {
        let image = sample_image(vec![7u8; 1234]);
        assert_eq!(image.size(), 1234);
        assert_eq!(image.size(), image.data.len());
    }

    #[test]
    fn test_from_prediction() {
        let prediction: Prediction = serde_json::from_str(
            r#"{"bytesBase64Encoded": "iVBORw0KGgo=", "mimeType": "image/png", "prompt": "A vivid sunset"}"#,
        )
        .unwrap();

        let image = GeneratedImage::from_prediction(&prediction, "sunset").unwrap();
        assert_eq!(image.data, b"\x89PNG\r\n\x1a\n".to_vec());
        assert_eq!(image.size(), 8);
        assert_eq!(image.enhanced_prompt.as_deref(), Some("A vivid sunset"));
        assert_eq!(image.effective_prompt(), "A vivid sunset");
    }

    #[test]
    fn test_from_prediction_unchanged_prompt_and_default_mime() {
        let prediction: Prediction =
            serde_json::from_str(r#"{"bytesBase64Encoded": "AAEC", "prompt": "sunset"}"#).unwrap();

        let image = GeneratedImage::from_prediction(&prediction, "sunset").unwrap();
        assert_eq!(image.mime_type, "image/png");
        assert!(image.enhanced_prompt.is_none());
        assert_eq!(image.effective_prompt(), "sunset");
    }

    #[test]
    fn test_from_prediction_bad_base64() {
        let prediction: Prediction =
            serde_json::from_str(r#"{"bytesBase64Encoded": "***"}"#).unwrap();
        let err = GeneratedImage::from_prediction(&prediction, "x").unwrap_err();
        assert!(matches!(err, ImagenError::Base64(_)));
    }

    #[tokio::test]
    async fn test_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/dir/out.png");
        let image = sample_image((0..=255u8).collect());

        image.save(&path).await.unwrap();

        let written = std::fs::read(&path).unwrap();
        assert_eq!(written, image.data);
    }

    #[test]
    fn test_write_inline() {
        let image = sample_image(vec![0, 1, 2]);
        let mut out = Vec::new();
        image.write_inline(&mut out).unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("\x1b]1337;File=inline=1;size=3;"));
        assert!(text.contains(":AAEC\x07"));
    }

    #[test]
    fn test_display() {
        let image = sample_image(vec![0; 42]);
        assert_eq!(
            image.to_string(),
            "GeneratedImage(prompt='A beautiful sunset over the oc...', size=42 bytes)"
        );
    }

    #[test]
    fn test_display_groups_size_digits() {
        let image = sample_image(vec![0; 1_234_567]);
        assert_eq!(
            image.to_string(),
            "GeneratedImage(prompt='A beautiful sunset over the oc...', size=1,234,567 bytes)"
        );
        assert_eq!(group_thousands(0), "0");
        assert_eq!(group_thousands(999), "999");
        assert_eq!(group_thousands(1000), "1,000");
    }
}
