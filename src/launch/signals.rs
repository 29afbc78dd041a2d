//! Per-line classification of server output

use crate::errors::Result;
use regex::{Regex, RegexBuilder};

/// Default success line printed by the server once the API is up
pub const DEFAULT_SUCCESS_PATTERN: &str = r"Starting Kobold API on port (\d+)";

/// Lowercase substrings marking memory exhaustion or fatal backend errors
pub const DEFAULT_OOM_KEYWORDS: &[&str] = &[
    "cuda out of memory",
    "outofmemory",
    "out of vram",
    "cublasstatusallocfailed",
    "ggml_cuda_host_malloc: failed to allocate",
    "ggml-cuda backend: failed to allocate",
    "failed to allocate memory on gpu",
    "vram allocation failed",
    "llama_new_context_with_model: failed to load model",
    "unable to initialize backend",
    "failed to load model",
    "model load failed",
    "segmentation fault",
    "aborted",
    "illegal instruction",
    "clblast error",
    "opencl error",
    "rocm error",
    "hip error",
    "cl_out_of_resources",
];

/// What one line says about the attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineSignal {
    Success,
    /// Success text for a different port; ignored
    ForeignPort(u16),
    Failure { keyword: String },
    Nothing,
}

/// Compiled success pattern plus failure keywords
#[derive(Debug, Clone)]
pub struct SignalMatcher {
    success: Regex,
    oom_keywords: Vec<String>,
    target_port: u16,
}

impl SignalMatcher {
    /// The pattern is matched case-insensitively; keywords are lowercased
    pub fn new(success_pattern: &str, oom_keywords: &[String], target_port: u16) -> Result<Self> {
        let success = RegexBuilder::new(success_pattern).case_insensitive(true).build()?;
        Ok(Self {
            success,
            oom_keywords: oom_keywords
                .iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
            target_port,
        })
    }

    pub fn with_defaults(target_port: u16) -> Result<Self> {
        let keywords: Vec<String> = DEFAULT_OOM_KEYWORDS.iter().map(|k| k.to_string()).collect();
        Self::new(DEFAULT_SUCCESS_PATTERN, &keywords, target_port)
    }

    pub fn target_port(&self) -> u16 {
        self.target_port
    }

    /// Success is tested first, then the failure keywords
    pub fn classify(&self, line: &str) -> LineSignal {
        if let Some(caps) = self.success.captures(line) {
            match caps.get(1).map(|m| m.as_str().parse::<u16>()) {
                None => return LineSignal::Success,
                Some(Ok(port)) if port == self.target_port => return LineSignal::Success,
                Some(Ok(port)) => return LineSignal::ForeignPort(port),
                // Captured something that is not a port: not our server
                Some(Err(_)) => {}
            }
        }

        let lower = line.to_lowercase();
        self.oom_keywords
            .iter()
            .find(|k| lower.contains(k.as_str()))
            .map(|k| LineSignal::Failure { keyword: k.clone() })
            .unwrap_or(LineSignal::Nothing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_requires_target_port() {
        let m = SignalMatcher::with_defaults(5001).unwrap();
        assert_eq!(m.classify("Starting Kobold API on port 5001 at http://localhost"), LineSignal::Success);
        assert_eq!(m.classify("starting kobold api on PORT 5001"), LineSignal::Success);
        assert_eq!(m.classify("Starting Kobold API on port 5000"), LineSignal::ForeignPort(5000));
    }

    #[test]
    fn test_pattern_without_capture() {
        let m = SignalMatcher::new("server ready", &[], 5000).unwrap();
        assert_eq!(m.classify("Server READY"), LineSignal::Success);
    }

    #[test]
    fn test_failure_keywords() {
        let m = SignalMatcher::with_defaults(5000).unwrap();
        assert_eq!(
            m.classify("ggml_cuda: CUDA out of memory while allocating"),
            LineSignal::Failure {
                keyword: "cuda out of memory".to_string()
            }
        );
        assert_eq!(m.classify("Loading layer 12/48"), LineSignal::Nothing);
    }

    #[test]
    fn test_custom_keywords_are_normalised() {
        let m = SignalMatcher::new("ready", &["  Boom ".to_string(), String::new()], 5000).unwrap();
        assert!(matches!(m.classify("BOOM happened"), LineSignal::Failure { .. }));
        assert_eq!(m.classify(""), LineSignal::Nothing);
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(SignalMatcher::new("(unclosed", &[], 5000).is_err());
    }
}
