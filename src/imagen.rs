use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::Semaphore;
use tracing::{Level, debug};
use tracing_subscriber::FmtSubscriber;

use vertex_imagen::imagen_api::PROJECT_ENV_VAR;
use vertex_imagen::{
    AspectRatio, GeneratedImage, ImageModel, ImageRequest, ImagenClient, ImagenClientConfig,
    SafetySetting,
};

#[derive(Parser, Debug)]
#[command(name = "imagen")]
#[command(version)]
#[command(about = "Generate images using Vertex AI Imagen")]
#[command(after_help = "EXAMPLES:
    imagen \"A sunset over mountains\"
    imagen -a 16:9 -c 2 \"A futuristic cityscape\"
    imagen -m imagen-3.0-fast-generate-001 --seed 42 \"A cat playing with a ball\"
    imagen --yaml prompts.yaml
    imagen --yaml prompts.yaml --name memory-safety
    imagen --list-models

ENVIRONMENT:
    GOOGLE_CLOUD_PROJECT            Google Cloud project ID
    VERTEX_AI_LOCATION              Vertex AI region (default: us-central1)
    GOOGLE_APPLICATION_CREDENTIALS  Service account key file")]
struct Args {
    /// Text prompt for image generation (positional argument)
    #[arg(value_name = "PROMPT")]
    prompt: Option<String>,

    /// YAML file containing prompts
    #[arg(short = 'y', long)]
    yaml: Option<PathBuf>,

    /// Generate only specific prompt by name from YAML
    #[arg(short = 'n', long)]
    name: Option<String>,

    /// Output file path (for single prompt) or directory (for YAML batch)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Imagen model identifier
    #[arg(short = 'm', long, default_value = "imagegeneration@006")]
    model: String,

    /// Aspect ratio: 1:1, 3:4, 4:3, 16:9, 9:16
    #[arg(short = 'a', long, default_value = "1:1")]
    aspect: String,

    /// Number of images to generate (1-4)
    #[arg(short = 'c', long, default_value = "1")]
    count: u32,

    /// Content to keep out of the image
    #[arg(long)]
    negative: Option<String>,

    /// Seed for reproducible output
    #[arg(long)]
    seed: Option<u32>,

    /// Safety filter: block_low_and_above, block_medium_and_above, block_only_high, block_none
    #[arg(long, default_value = "block_medium_and_above")]
    safety: String,

    /// Disable automatic prompt enhancement
    #[arg(long)]
    no_enhance: bool,

    /// Google Cloud project ID (overrides GOOGLE_CLOUD_PROJECT)
    #[arg(short = 'p', long)]
    project: Option<String>,

    /// Vertex AI region (overrides VERTEX_AI_LOCATION)
    #[arg(short = 'l', long)]
    location: Option<String>,

    /// Service account key file (overrides GOOGLE_APPLICATION_CREDENTIALS)
    #[arg(long)]
    credentials: Option<PathBuf>,

    /// Print supported models and exit
    #[arg(long)]
    list_models: bool,

    /// Display generated images inline (iTerm2-compatible terminals)
    #[arg(long)]
    show: bool,

    /// API timeout in seconds
    #[arg(short, long, default_value = "180")]
    timeout: u64,

    /// Number of parallel jobs for YAML batch mode
    #[arg(short = 'j', long, default_value = "2")]
    jobs: usize,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (no progress output)
    #[arg(short, long)]
    quiet: bool,
}

/// YAML file structure for batch prompts
#[derive(Debug, Deserialize)]
struct PromptsFile {
    prompts: Vec<PromptEntry>,
}

#[derive(Debug, Deserialize)]
struct PromptEntry {
    name: String,
    prompt: String,
    output: Option<String>,
    model: Option<String>,
    aspect: Option<String>,
    count: Option<u32>,
    negative: Option<String>,
    seed: Option<u32>,
}

/// Request settings shared by every prompt unless overridden
#[derive(Debug, Clone)]
struct RequestDefaults {
    model: ImageModel,
    aspect: AspectRatio,
    count: u32,
    negative: Option<String>,
    seed: Option<u32>,
    safety: SafetySetting,
    enhance: bool,
}

impl RequestDefaults {
    fn from_args(args: &Args) -> Result<Self> {
        Ok(Self {
            model: ImageModel::from_str(&args.model)?,
            aspect: AspectRatio::from_str(&args.aspect)?,
            count: args.count,
            negative: args.negative.clone(),
            seed: args.seed,
            safety: SafetySetting::from_str(&args.safety)?,
            enhance: !args.no_enhance,
        })
    }

    fn request(&self, prompt: &str) -> ImageRequest {
        let mut request = ImageRequest::new(prompt)
            .with_model(self.model)
            .with_aspect_ratio(self.aspect)
            .with_count(self.count)
            .with_safety_setting(self.safety)
            .with_enhance_prompt(self.enhance);
        request.negative_prompt = self.negative.clone();
        request.seed = self.seed;
        request
    }

    fn request_for_entry(&self, entry: &PromptEntry) -> Result<ImageRequest> {
        let mut request = self.request(&entry.prompt);
        if let Some(model) = &entry.model {
            request.model = ImageModel::from_str(model)?;
        }
        if let Some(aspect) = &entry.aspect {
            request.aspect_ratio = AspectRatio::from_str(aspect)?;
        }
        if let Some(count) = entry.count {
            request.count = count;
        }
        if entry.negative.is_some() {
            request.negative_prompt = entry.negative.clone();
        }
        if entry.seed.is_some() {
            request.seed = entry.seed;
        }
        request.validate()?;
        Ok(request)
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).ok();
}

fn resolve_config(args: &Args) -> Result<ImagenClientConfig> {
    let mut config = ImagenClientConfig::from_env_with_project(args.project.clone())
        .with_context(|| format!("Set {} or pass --project", PROJECT_ENV_VAR))?;

    if let Some(location) = args.location.as_ref().filter(|l| !l.trim().is_empty()) {
        config.location = location.clone();
    }

    Ok(config.with_timeout_secs(args.timeout))
}

async fn build_client(args: &Args) -> Result<ImagenClient> {
    let config = resolve_config(args)?;
    debug!(
        "Project: {}, location: {}",
        config.project_id, config.location
    );

    let mut client = ImagenClient::with_config(config).context("Failed to create Imagen client")?;

    match &args.credentials {
        Some(path) => client.setup_credentials(path).await?,
        None => client.setup_credentials_from_env().await?,
    }

    Ok(client)
}

fn spinner_style(template: &str) -> Result<ProgressStyle> {
    ProgressStyle::default_spinner()
        .template(template)
        .context("Invalid progress template")
}

/// Convert a string to a URL-friendly slug
fn slugify(s: &str) -> String {
    let slug: String = s
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");

    if slug.is_empty() {
        "image".to_string()
    } else {
        slug
    }
}

/// Generate output filename: slug(name)-hash(name+prompt).ext
fn generate_output_filename(name: &str, prompt: &str, extension: &str) -> String {
    let slug = slugify(name);
    let hash_input = format!("{}{}", name, prompt);
    let hash = blake3::hash(hash_input.as_bytes());
    let hash_prefix = &hash.to_hex()[..6];
    format!("{}-{}.{}", slug, hash_prefix, extension)
}

/// Path for image `index` of `total`; numbered only when there is more than one.
/// A missing extension is taken from the image.
fn image_output_path(base: &Path, index: usize, total: usize, image: &GeneratedImage) -> PathBuf {
    let extension = base
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or(image.extension())
        .to_string();

    if total <= 1 {
        return base.with_extension(extension);
    }

    let stem = base
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("image");
    base.with_file_name(format!("{}-{}.{}", stem, index + 1, extension))
}

async fn save_all(images: &[GeneratedImage], base: &Path, show: bool) -> Result<Vec<PathBuf>> {
    let mut saved = Vec::with_capacity(images.len());
    for (i, image) in images.iter().enumerate() {
        let path = image_output_path(base, i, images.len(), image);
        image
            .save(&path)
            .await
            .with_context(|| format!("Failed to write image file {:?}", path))?;
        debug!("Saved {}", image);
        if show {
            image.show()?;
        }
        saved.push(path);
    }
    Ok(saved)
}

async fn generate_single(
    client: &ImagenClient,
    request: ImageRequest,
    output_path: PathBuf,
    show: bool,
    quiet: bool,
) -> Result<()> {
    let pb = if !quiet {
        let pb = ProgressBar::new_spinner();
        pb.set_style(spinner_style("{spinner:.green} {msg}")?);
        pb.set_message("Generating image...");
        pb.enable_steady_tick(Duration::from_millis(100));
        Some(pb)
    } else {
        None
    };

    let generated = client
        .generate(&request)
        .await
        .context("Image generation failed");

    let images = match generated {
        Ok(g) => g.into_images(),
        Err(e) => {
            if let Some(pb) = pb {
                pb.finish_with_message("Image generation failed!");
            }
            return Err(e);
        }
    };

    if let Some(pb) = pb {
        pb.finish_with_message(format!("Generated {} image(s)", images.len()));
    }

    let saved = save_all(&images, &output_path, show).await?;

    if !quiet {
        for (path, image) in saved.iter().zip(&images) {
            println!("Saved {:?} ({} bytes)", path, image.size());
            if let Some(enhanced) = &image.enhanced_prompt {
                println!("  Enhanced prompt: {}", enhanced);
            }
        }
    }

    Ok(())
}

/// Result of a single image generation task
struct GenResult {
    name: String,
    success: bool,
    error: Option<String>,
}

impl GenResult {
    fn failed(name: &str, error: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            success: false,
            error: Some(error.to_string()),
        }
    }
}

struct YamlGenOptions {
    yaml_path: PathBuf,
    name_filter: Option<String>,
    output_dir: PathBuf,
    defaults: RequestDefaults,
    jobs: usize,
    quiet: bool,
}

async fn run_entry(
    client: &ImagenClient,
    opts: &YamlGenOptions,
    entry: &PromptEntry,
) -> Result<String> {
    let request = opts.defaults.request_for_entry(entry)?;
    let images = client.generate(&request).await?.into_images();

    let filename = entry.output.clone().unwrap_or_else(|| {
        let extension = images.first().map(|i| i.extension()).unwrap_or("png");
        generate_output_filename(&entry.name, &entry.prompt, extension)
    });
    let output_path = opts.output_dir.join(&filename);

    save_all(&images, &output_path, false).await?;
    Ok(filename)
}

async fn generate_from_yaml(client: ImagenClient, opts: YamlGenOptions) -> Result<()> {
    let yaml_content = fs::read_to_string(&opts.yaml_path)
        .await
        .context("Failed to read YAML file")?;

    let prompts_file: PromptsFile =
        serde_yaml::from_str(&yaml_content).context("Failed to parse YAML file")?;

    let prompts: Vec<PromptEntry> = if let Some(ref name) = opts.name_filter {
        prompts_file
            .prompts
            .into_iter()
            .filter(|p| &p.name == name)
            .collect()
    } else {
        prompts_file.prompts
    };

    if prompts.is_empty() {
        if let Some(name) = opts.name_filter {
            anyhow::bail!("No prompt found with name: {}", name);
        } else {
            anyhow::bail!("No prompts found in YAML file");
        }
    }

    if !opts.output_dir.exists() {
        fs::create_dir_all(&opts.output_dir)
            .await
            .context("Failed to create output directory")?;
    }

    let total = prompts.len();
    let jobs = opts.jobs.max(1);

    if !opts.quiet {
        println!(
            "Generating {} prompts with {} parallel jobs...\n",
            total, jobs
        );
    }

    let style = spinner_style("{spinner:.green} [{pos}] {msg}")?;
    let semaphore = Arc::new(Semaphore::new(jobs));
    let client = Arc::new(client);
    let opts = Arc::new(opts);
    let multi_progress = Arc::new(MultiProgress::new());

    let mut handles = Vec::new();

    for (i, entry) in prompts.into_iter().enumerate() {
        let sem = Arc::clone(&semaphore);
        let client = Arc::clone(&client);
        let opts = Arc::clone(&opts);
        let mp = Arc::clone(&multi_progress);
        let style = style.clone();

        let handle = tokio::spawn(async move {
            let Ok(_permit) = sem.acquire().await else {
                return GenResult::failed(&entry.name, "job queue closed");
            };

            let pb = if !opts.quiet {
                let pb = mp.add(ProgressBar::new_spinner());
                pb.set_style(style);
                pb.set_position((i + 1) as u64);
                pb.set_message(format!("Generating {}...", entry.name));
                pb.enable_steady_tick(Duration::from_millis(100));
                Some(pb)
            } else {
                None
            };

            match run_entry(&client, &opts, &entry).await {
                Ok(filename) => {
                    if let Some(pb) = pb {
                        pb.finish_with_message(format!("{} -> {}", entry.name, filename));
                    }
                    GenResult {
                        name: entry.name.clone(),
                        success: true,
                        error: None,
                    }
                }
                Err(e) => {
                    if let Some(pb) = pb {
                        pb.finish_with_message(format!("{} failed!", entry.name));
                    }
                    GenResult::failed(&entry.name, format!("{:#}", e))
                }
            }
        });

        handles.push(handle);
    }

    let results: Vec<GenResult> = futures::future::join_all(handles)
        .await
        .into_iter()
        .filter_map(|r| r.ok())
        .collect();

    let success_count = results.iter().filter(|r| r.success).count();
    let errors: Vec<_> = results
        .iter()
        .filter(|r| !r.success)
        .map(|r| (r.name.clone(), r.error.clone().unwrap_or_default()))
        .collect();

    if !opts.quiet {
        println!("\n--- Summary ---");
        println!(
            "Total: {}, Success: {}, Failed: {}",
            total,
            success_count,
            errors.len()
        );
        if !errors.is_empty() {
            println!("\nFailed prompts:");
            for (name, error) in &errors {
                println!("  - {}: {}", name, error);
            }
        }
    }

    if success_count == 0 && !errors.is_empty() {
        anyhow::bail!("All image generations failed");
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    init_logging(args.verbose);

    if args.list_models {
        for model in ImageModel::ALL {
            println!("{}", model);
        }
        return Ok(());
    }

    if args.prompt.is_none() && args.yaml.is_none() {
        anyhow::bail!(
            "Either a prompt or --yaml file must be provided\n\nUsage:\n  imagen \"your prompt here\"\n  imagen --yaml prompts.yaml"
        );
    }

    if args.prompt.is_some() && args.yaml.is_some() {
        anyhow::bail!("Cannot use both prompt and --yaml at the same time");
    }

    if args.name.is_some() && args.yaml.is_none() {
        anyhow::bail!("--name can only be used with --yaml");
    }

    let defaults = RequestDefaults::from_args(&args)?;

    if let Some(yaml_path) = &args.yaml {
        if !yaml_path.exists() {
            anyhow::bail!("YAML file does not exist: {:?}", yaml_path);
        }

        let client = build_client(&args).await?;
        let output_dir = args
            .output
            .clone()
            .unwrap_or_else(|| PathBuf::from("./output"));
        debug!("Output directory: {:?}", output_dir);

        generate_from_yaml(
            client,
            YamlGenOptions {
                yaml_path: yaml_path.clone(),
                name_filter: args.name.clone(),
                output_dir,
                defaults,
                jobs: args.jobs,
                quiet: args.quiet,
            },
        )
        .await?;
    } else if let Some(prompt) = &args.prompt {
        let request = defaults.request(prompt);
        request.validate()?;

        let client = build_client(&args).await?;
        let output_path = args
            .output
            .clone()
            .unwrap_or_else(|| PathBuf::from(generate_output_filename("image", prompt, "png")));
        debug!("Output path: {:?}", output_path);

        generate_single(&client, request, output_path, args.show, args.quiet).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(mime_type: &str) -> GeneratedImage {
        GeneratedImage {
            data: vec![1, 2, 3],
            mime_type: mime_type.to_string(),
            prompt: "p".to_string(),
            enhanced_prompt: None,
        }
    }

    fn defaults() -> RequestDefaults {
        let args = Args::parse_from(["imagen", "--seed", "7", "a prompt"]);
        RequestDefaults::from_args(&args).unwrap()
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r#"
prompts:
  - name: test-image
    prompt: A beautiful sunset
    output: sunset.png
  - name: another
    prompt: A mountain landscape
  - name: with-config
    prompt: High res image
    model: imagen-3.0-generate-002
    aspect: 16:9
    count: 3
    seed: 99
"#;
        let parsed: PromptsFile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(parsed.prompts.len(), 3);
        assert_eq!(parsed.prompts[0].name, "test-image");
        assert_eq!(parsed.prompts[0].output, Some("sunset.png".to_string()));
        assert_eq!(parsed.prompts[1].output, None);
        assert_eq!(
            parsed.prompts[2].model,
            Some("imagen-3.0-generate-002".to_string())
        );
        assert_eq!(parsed.prompts[2].aspect, Some("16:9".to_string()));
        assert_eq!(parsed.prompts[2].count, Some(3));
        assert_eq!(parsed.prompts[2].seed, Some(99));
    }

    #[test]
    fn test_defaults_from_args() {
        let defaults = defaults();
        assert_eq!(defaults.model, ImageModel::ImageGeneration006);
        assert_eq!(defaults.aspect, AspectRatio::Square);
        assert_eq!(defaults.count, 1);
        assert_eq!(defaults.seed, Some(7));
        assert!(defaults.enhance);

        let args = Args::parse_from(["imagen", "-a", "2:1", "x"]);
        assert!(RequestDefaults::from_args(&args).is_err());

        let args = Args::parse_from(["imagen", "-m", "unknown-model", "x"]);
        assert!(RequestDefaults::from_args(&args).is_err());
    }

    #[test]
    fn test_request_for_entry_overrides() {
        let entry = PromptEntry {
            name: "n".to_string(),
            prompt: "A lighthouse".to_string(),
            output: None,
            model: Some("imagen-3.0-fast-generate-001".to_string()),
            aspect: Some("tall".to_string()),
            count: Some(2),
            negative: Some("fog".to_string()),
            seed: None,
        };
        let request = defaults().request_for_entry(&entry).unwrap();
        assert_eq!(request.model, ImageModel::Imagen3FastGenerate001);
        assert_eq!(request.aspect_ratio, AspectRatio::Tall);
        assert_eq!(request.count, 2);
        assert_eq!(request.negative_prompt.as_deref(), Some("fog"));
        assert_eq!(request.seed, Some(7));
    }

    #[test]
    fn test_request_for_entry_rejects_bad_count() {
        let entry = PromptEntry {
            name: "n".to_string(),
            prompt: "x".to_string(),
            output: None,
            model: None,
            aspect: None,
            count: Some(9),
            negative: None,
            seed: None,
        };
        assert!(defaults().request_for_entry(&entry).is_err());
    }

    #[test]
    fn test_image_output_path() {
        let base = PathBuf::from("out/cat");
        assert_eq!(
            image_output_path(&base, 0, 1, &image("image/jpeg")),
            PathBuf::from("out/cat.jpg")
        );
        assert_eq!(
            image_output_path(&PathBuf::from("out/cat.png"), 1, 3, &image("image/jpeg")),
            PathBuf::from("out/cat-2.png")
        );
        assert_eq!(
            image_output_path(&base, 0, 2, &image("image/png")),
            PathBuf::from("out/cat-1.png")
        );
    }

    #[tokio::test]
    async fn test_save_all_numbers_files() {
        let dir = tempfile::tempdir().unwrap();
        let images = vec![image("image/png"), image("image/png")];
        let saved = save_all(&images, &dir.path().join("batch.png"), false)
            .await
            .unwrap();
        assert_eq!(saved.len(), 2);
        assert!(saved[0].ends_with("batch-1.png"));
        assert_eq!(std::fs::read(&saved[1]).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_resolve_config_flags_override() {
        let args = Args::parse_from([
            "imagen",
            "--project",
            "flag-project",
            "--location",
            "europe-west4",
            "--timeout",
            "60",
            "x",
        ]);
        let config = resolve_config(&args).unwrap();
        assert_eq!(config.project_id, "flag-project");
        assert_eq!(config.location, "europe-west4");
        assert_eq!(config.timeout_secs, 60);
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Hello World"), "hello-world");
        assert_eq!(slugify("test--multiple---dashes"), "test-multiple-dashes");
        assert_eq!(slugify("  spaces  "), "spaces");
        assert_eq!(slugify("👻"), "image");
    }

    #[test]
    fn test_generate_output_filename() {
        let filename = generate_output_filename("Test Name", "A prompt", "png");
        assert!(filename.starts_with("test-name-"));
        assert!(filename.ends_with(".png"));

        let filename2 = generate_output_filename("Test Name", "A prompt", "png");
        assert_eq!(filename, filename2);

        let filename3 = generate_output_filename("Test Name", "Different prompt", "png");
        assert_ne!(filename, filename3);
    }
}
