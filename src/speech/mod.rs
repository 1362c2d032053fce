//! Speech-to-text for spoken enrollment names
//!
//! Transcription is delegated to an external program: the recorded clip is
//! written as a WAV file, the program is run with `{wav}` in its arguments
//! replaced by that path, and whatever it prints on stdout is the
//! transcript.

use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::audio::recorder::AudioClip;
use crate::validation::validate_label;

/// Spoken lead-ins removed before the name itself, longest first
const LEAD_INS: &[&str] = &["my name is", "this is", "i am", "i'm", "it's"];

const WAV_PLACEHOLDER: &str = "{wav}";

/// Result of one transcription attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transcription {
    Text(String),
    /// Service ran but produced nothing usable
    Ambiguous,
    /// Service could not be reached or failed
    Unavailable(String),
}

/// Blocking speech-to-text capability
pub trait Transcriber: Send + Sync {
    fn transcribe(&self, clip: &AudioClip) -> Transcription;
}

/// Runs an external speech-to-text command per clip
pub struct CommandTranscriber {
    program: String,
    args: Vec<String>,
    scratch_dir: PathBuf,
    counter: AtomicU64,
}

impl CommandTranscriber {
    pub fn new(program: String, args: Vec<String>, scratch_dir: PathBuf) -> Self {
        log::info!("Speech transcriber: {} {}", program, args.join(" "));
        Self {
            program,
            args,
            scratch_dir,
            counter: AtomicU64::new(0),
        }
    }

    fn scratch_path(&self) -> PathBuf {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        self.scratch_dir
            .join(format!("utterance_{}_{}.wav", std::process::id(), n))
    }

    fn run(&self, wav: &std::path::Path) -> Transcription {
        let wav_arg = wav.to_string_lossy();
        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| a.replace(WAV_PLACEHOLDER, &wav_arg))
            .collect();

        let output = match Command::new(&self.program).args(&args).output() {
            Ok(output) => output,
            Err(e) => {
                return Transcription::Unavailable(format!(
                    "failed to run '{}': {}",
                    self.program, e
                ))
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Transcription::Unavailable(format!(
                "'{}' exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            ));
        }

        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if text.is_empty() {
            Transcription::Ambiguous
        } else {
            Transcription::Text(text)
        }
    }
}

impl Transcriber for CommandTranscriber {
    fn transcribe(&self, clip: &AudioClip) -> Transcription {
        if let Err(e) = fs::create_dir_all(&self.scratch_dir) {
            return Transcription::Unavailable(format!("scratch directory: {}", e));
        }

        let wav = self.scratch_path();
        if let Err(e) = clip.write_wav(&wav) {
            return Transcription::Unavailable(format!("{:#}", e));
        }

        let result = self.run(&wav);
        let _ = fs::remove_file(&wav);

        log::debug!("Transcription: {:?}", result);
        result
    }
}

/// Turn a transcript into a gallery label
///
/// "My name is Mary Ann." becomes `mary_ann`. Returns `None` when nothing
/// valid is left.
pub fn normalize_label(text: &str) -> Option<String> {
    let lowered = text.to_lowercase();
    let cleaned: String = lowered
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '\'' || c == '-' || c == '_' {
                c
            } else {
                ' '
            }
        })
        .collect();

    let mut words: Vec<&str> = cleaned.split_whitespace().collect();
    for lead_in in LEAD_INS {
        let lead: Vec<&str> = lead_in.split_whitespace().collect();
        if words.len() > lead.len() && words[..lead.len()] == lead[..] {
            words.drain(..lead.len());
            break;
        }
    }

    let label = words
        .iter()
        .map(|w| w.replace('\'', ""))
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join("_");

    validate_label(&label).ok()
}
