//! Spoken announcements for every classification result.
//!
//! The app plays `error.<ext>` when it cannot decide, otherwise
//! `Fresh<Product>.<ext>` or `Rotten<Product>.<ext>`.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{AnnounceError, ConfigError};
use crate::labels::{Freshness, PRODUCTS};

pub const ERROR_PHRASE: &str = "Unable to determine product quality with confidence. \
                                Please try again with better lighting and positioning.";

/// One clip to synthesize.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Announcement {
    /// File name without extension.
    pub stem: String,
    pub text: String,
}

/// The error clip followed by a fresh and a rotten clip per product.
pub fn catalog(products: &[&str]) -> Vec<Announcement> {
    let mut clips = vec![Announcement {
        stem: "error".to_string(),
        text: ERROR_PHRASE.to_string(),
    }];
    for product in products {
        for freshness in [Freshness::Fresh, Freshness::Rotten] {
            clips.push(Announcement {
                stem: format!("{}{product}", freshness.as_str()),
                text: phrase(freshness, product),
            });
        }
    }
    clips
}

/// The default catalog for all known products.
pub fn default_catalog() -> Vec<Announcement> {
    catalog(&PRODUCTS)
}

fn phrase(freshness: Freshness, product: &str) -> String {
    match freshness {
        Freshness::Fresh => format!("This {product} is fresh and of excellent quality"),
        Freshness::Rotten => format!("This {product} is rotten. Please choose another one"),
    }
}

/// Something that can turn text into an audio file.
pub trait SpeechSynthesizer {
    fn synthesize(&self, text: &str, rate: u32, output: &Path) -> Result<(), AnnounceError>;
}

/// Announcement generation settings.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct AnnounceConfig {
    pub out_dir: PathBuf,
    /// Speaking rate in words per minute.
    pub rate: u32,
    pub extension: String,
    /// Synthesizer executable.
    pub program: String,
    /// Arguments; `{text}`, `{output}` and `{rate}` are substituted.
    pub args: Vec<String>,
    /// Encoder run on the synthesizer's WAV output; empty to keep it as is.
    pub encoder_program: String,
    /// Encoder arguments; `{input}` and `{output}` are substituted.
    pub encoder_args: Vec<String>,
}

impl Default for AnnounceConfig {
    fn default() -> Self {
        AnnounceConfig {
            out_dir: PathBuf::from("app/src/main/assets/audio"),
            rate: 150,
            extension: "mp3".to_string(),
            program: "espeak-ng".to_string(),
            args: strings(&["-s", "{rate}", "-w", "{output}", "{text}"]),
            encoder_program: "lame".to_string(),
            encoder_args: strings(&["--quiet", "{input}", "{output}"]),
        }
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(ToString::to_string).collect()
}

impl AnnounceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rate == 0 {
            return Err(ConfigError::Validation("announce.rate must be > 0".into()));
        }
        if self.extension.is_empty() {
            return Err(ConfigError::Validation(
                "announce.extension must not be empty".into(),
            ));
        }
        if self.program.is_empty() {
            return Err(ConfigError::Validation(
                "announce.program must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Runs an external text-to-speech program once per clip, optionally
/// followed by an encoder that turns its WAV output into the final file.
#[derive(Debug, Clone)]
pub struct CommandSynthesizer {
    program: String,
    args: Vec<String>,
    encoder: Option<(String, Vec<String>)>,
}

impl CommandSynthesizer {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        CommandSynthesizer {
            program: program.into(),
            args,
            encoder: None,
        }
    }

    pub fn with_encoder(mut self, program: impl Into<String>, args: Vec<String>) -> Self {
        self.encoder = Some((program.into(), args));
        self
    }

    pub fn from_config(config: &AnnounceConfig) -> Self {
        let synth = Self::new(config.program.clone(), config.args.clone());
        if config.encoder_program.is_empty() {
            synth
        } else {
            synth.with_encoder(config.encoder_program.clone(), config.encoder_args.clone())
        }
    }

    /// Synthesizer arguments with placeholders filled in.
    pub fn render_args(&self, text: &str, rate: u32, output: &Path) -> Vec<String> {
        let output = output.display().to_string();
        let rate = rate.to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{text}", text)
                    .replace("{output}", &output)
                    .replace("{rate}", &rate)
            })
            .collect()
    }

    /// Encoder arguments with placeholders filled in, if an encoder is set.
    pub fn render_encoder_args(&self, input: &Path, output: &Path) -> Option<Vec<String>> {
        let (_, args) = self.encoder.as_ref()?;
        let input = input.display().to_string();
        let output = output.display().to_string();
        Some(
            args.iter()
                .map(|arg| arg.replace("{input}", &input).replace("{output}", &output))
                .collect(),
        )
    }

    /// Where the synthesizer writes before encoding.
    fn intermediate_path(output: &Path) -> PathBuf {
        let mut name = output.file_stem().unwrap_or_default().to_os_string();
        name.push(".tts.wav");
        output.with_file_name(name)
    }
}

fn run(program: &str, args: &[String], output: &Path) -> Result<(), AnnounceError> {
    let result = Command::new(program)
        .args(args)
        .output()
        .map_err(|source| AnnounceError::Spawn {
            program: program.to_string(),
            source,
        })?;

    if !result.status.success() {
        return Err(AnnounceError::Synthesis {
            path: output.to_path_buf(),
            message: format!(
                "{program} exited with {}: {}",
                result.status,
                String::from_utf8_lossy(&result.stderr).trim()
            ),
        });
    }
    if !output.exists() {
        return Err(AnnounceError::Synthesis {
            path: output.to_path_buf(),
            message: format!("{program} produced no file"),
        });
    }
    Ok(())
}

impl SpeechSynthesizer for CommandSynthesizer {
    fn synthesize(&self, text: &str, rate: u32, output: &Path) -> Result<(), AnnounceError> {
        let Some((encoder, _)) = &self.encoder else {
            return run(&self.program, &self.render_args(text, rate, output), output);
        };

        let wav = Self::intermediate_path(output);
        let result = run(&self.program, &self.render_args(text, rate, &wav), &wav).and_then(|()| {
            let args = self.render_encoder_args(&wav, output).unwrap_or_default();
            run(encoder, &args, output)
        });
        let _ = fs::remove_file(&wav);
        result
    }
}

/// Clips written and clips that failed.
#[derive(Debug, Default)]
pub struct AnnounceReport {
    pub written: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

impl AnnounceReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Synthesize every clip in `clips` into `config.out_dir`.
///
/// A failing clip is logged and recorded; the remaining clips still run. A
/// `manifest.json` listing each written file and its text is written last.
pub fn generate(
    clips: &[Announcement],
    synth: &dyn SpeechSynthesizer,
    config: &AnnounceConfig,
) -> Result<AnnounceReport, AnnounceError> {
    fs::create_dir_all(&config.out_dir).map_err(|source| AnnounceError::CreateDir {
        path: config.out_dir.clone(),
        source,
    })?;

    let mut report = AnnounceReport::default();
    let mut manifest = Vec::new();
    for clip in clips {
        let path = config
            .out_dir
            .join(format!("{}.{}", clip.stem, config.extension));
        match synth.synthesize(&clip.text, config.rate, &path) {
            Ok(()) => {
                tracing::info!("Generated {}", path.display());
                manifest.push(serde_json::json!({
                    "file": path.file_name().map(|n| n.to_string_lossy().into_owned()),
                    "text": clip.text,
                }));
                report.written.push(path);
            }
            Err(e) => {
                tracing::error!("Failed to generate {}: {e}", path.display());
                report.failed.push((path, e.to_string()));
            }
        }
    }

    let manifest_path = config.out_dir.join("manifest.json");
    let json = serde_json::to_string_pretty(&manifest).map_err(|e| AnnounceError::Manifest {
        path: manifest_path.clone(),
        message: e.to_string(),
    })?;
    fs::write(&manifest_path, json).map_err(|e| AnnounceError::Manifest {
        path: manifest_path,
        message: e.to_string(),
    })?;

    Ok(report)
}
