//! Typed server launch arguments
//!
//! Arguments are layered builtin → global → model-specific → session, each
//! layer only overriding the fields it sets.

use crate::errors::{Result, TuneError};
use crate::models::ModelProfile;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Value that may be left to the server or disabled outright
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tunable<T> {
    Auto,
    Off,
    Value(T),
}

impl<T: fmt::Display> fmt::Display for Tunable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tunable::Auto => f.write_str("auto"),
            Tunable::Off => f.write_str("off"),
            Tunable::Value(v) => write!(f, "{}", v),
        }
    }
}

impl<T: FromStr> FromStr for Tunable<T> {
    type Err = TuneError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(Tunable::Auto),
            "off" => Ok(Tunable::Off),
            other => other
                .parse::<T>()
                .map(Tunable::Value)
                .map_err(|_| TuneError::ConfigError(format!("expected 'auto', 'off' or a value, got '{}'", s))),
        }
    }
}

impl<T: Serialize> Serialize for Tunable<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Tunable::Auto => serializer.serialize_str("auto"),
            Tunable::Off => serializer.serialize_str("off"),
            Tunable::Value(v) => v.serialize(serializer),
        }
    }
}

impl<'de, T: DeserializeOwned + FromStr> Deserialize<'de> for Tunable<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr<T> {
            Text(String),
            Value(T),
        }

        match Repr::<T>::deserialize(deserializer)? {
            Repr::Text(text) => text.parse().map_err(serde::de::Error::custom),
            Repr::Value(v) => Ok(Tunable::Value(v)),
        }
    }
}

/// Launch arguments understood by the server
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threads: Option<Tunable<u32>>,
    /// BLAS threads
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nblas: Option<Tunable<u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contextsize: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub promptlimit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub defaultgenamt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpulayers: Option<Tunable<u32>>,
    /// Quantised K/V cache mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantkv: Option<Tunable<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blasbatchsize: Option<Tunable<u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flashattention: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usecublas: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usehipblas: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nommap: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lowvram: Option<bool>,
    /// Flags passed through untouched
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extra: Vec<String>,
}

/// Port the server listens on unless configured otherwise
pub const DEFAULT_PORT: u16 = 5000;

/// Flags never carried over from a remembered argv
const PLACEMENT_FLAGS: &[&str] = &["--model", "--overridetensors"];

impl LaunchArgs {
    /// Builtin defaults, the bottom layer of every merge
    pub fn builtin() -> Self {
        Self {
            port: Some(DEFAULT_PORT),
            threads: Some(Tunable::Auto),
            nblas: Some(Tunable::Auto),
            contextsize: Some(16384),
            promptlimit: Some(16000),
            defaultgenamt: Some(2048),
            gpulayers: Some(Tunable::Auto),
            quantkv: Some(Tunable::Auto),
            blasbatchsize: Some(Tunable::Auto),
            flashattention: Some(true),
            usecublas: Some(true),
            usehipblas: Some(false),
            nommap: Some(false),
            lowvram: Some(false),
            extra: Vec::new(),
        }
    }

    /// Overlay every field `other` sets
    pub fn merge(&self, other: &LaunchArgs) -> LaunchArgs {
        let mut extra = self.extra.clone();
        for flag in &other.extra {
            if !extra.contains(flag) {
                extra.push(flag.clone());
            }
        }

        LaunchArgs {
            port: other.port.or(self.port),
            threads: other.threads.or(self.threads),
            nblas: other.nblas.or(self.nblas),
            contextsize: other.contextsize.or(self.contextsize),
            promptlimit: other.promptlimit.or(self.promptlimit),
            defaultgenamt: other.defaultgenamt.or(self.defaultgenamt),
            gpulayers: other.gpulayers.or(self.gpulayers),
            quantkv: other.quantkv.or(self.quantkv),
            blasbatchsize: other.blasbatchsize.or(self.blasbatchsize),
            flashattention: other.flashattention.or(self.flashattention),
            usecublas: other.usecublas.or(self.usecublas),
            usehipblas: other.usehipblas.or(self.usehipblas),
            nommap: other.nommap.or(self.nommap),
            lowvram: other.lowvram.or(self.lowvram),
            extra,
        }
    }

    /// Merge a stack of layers, lowest priority first
    pub fn layered<'a>(layers: impl IntoIterator<Item = &'a LaunchArgs>) -> LaunchArgs {
        layers
            .into_iter()
            .fold(LaunchArgs::default(), |acc, layer| acc.merge(layer))
    }

    /// Rebuild typed args from a remembered server argv
    ///
    /// Model path and tensor overrides are dropped; unknown flags land in
    /// `extra` together with their value.
    pub fn from_argv(argv: &[String]) -> Result<LaunchArgs> {
        let mut args = LaunchArgs::default();
        let mut iter = argv.iter().peekable();

        while let Some(flag) = iter.next() {
            match flag.as_str() {
                f if PLACEMENT_FLAGS.contains(&f) => {
                    let _ = iter.next_if(|next| !next.starts_with("--"));
                }
                "--port" => args.port = Some(parse_value(flag, &next_value(&mut iter, flag)?)?),
                "--threads" => args.threads = Some(next_value(&mut iter, flag)?.parse()?),
                "--nblas" => args.nblas = Some(next_value(&mut iter, flag)?.parse()?),
                "--contextsize" => args.contextsize = Some(parse_value(flag, &next_value(&mut iter, flag)?)?),
                "--promptlimit" => args.promptlimit = Some(parse_value(flag, &next_value(&mut iter, flag)?)?),
                "--defaultgenamt" => args.defaultgenamt = Some(parse_value(flag, &next_value(&mut iter, flag)?)?),
                "--gpulayers" => args.gpulayers = Some(next_value(&mut iter, flag)?.parse()?),
                "--nogpulayers" => args.gpulayers = Some(Tunable::Off),
                "--quantkv" => args.quantkv = Some(next_value(&mut iter, flag)?.parse()?),
                "--blasbatchsize" => args.blasbatchsize = Some(next_value(&mut iter, flag)?.parse()?),
                "--flashattention" => args.flashattention = Some(true),
                "--usecublas" => args.usecublas = Some(true),
                "--usehipblas" => args.usehipblas = Some(true),
                "--nommap" => args.nommap = Some(true),
                "--lowvram" => args.lowvram = Some(true),
                other => {
                    args.extra.push(other.to_string());
                    while let Some(value) = iter.next_if(|next| !next.starts_with("--")) {
                        args.extra.push(value.clone());
                    }
                }
            }
        }

        Ok(args)
    }

    /// Render to server argv (without `--model`) for a profile
    ///
    /// `gpu_layers_override` and `tensor_overrides` come from the offload
    /// policy when a tuning level is in play.
    pub fn to_argv(
        &self,
        profile: &ModelProfile,
        gpu_layers_override: Option<u32>,
        tensor_overrides: Option<&str>,
    ) -> Vec<String> {
        let mut argv: Vec<String> = Vec::new();
        let mut push = |flag: &str, value: Option<String>| {
            argv.push(flag.to_string());
            if let Some(v) = value {
                argv.push(v);
            }
        };

        if let Some(port) = self.port {
            push("--port", Some(port.to_string()));
        }

        match self.threads {
            Some(Tunable::Auto) => push("--threads", Some(auto_threads().to_string())),
            Some(Tunable::Value(n)) => push("--threads", Some(n.to_string())),
            Some(Tunable::Off) | None => {}
        }

        if let Some(Tunable::Value(n)) = self.nblas {
            push("--nblas", Some(n.to_string()));
        }

        if let Some(v) = self.contextsize {
            push("--contextsize", Some(v.to_string()));
        }
        if let Some(v) = self.promptlimit {
            push("--promptlimit", Some(v.to_string()));
        }
        if let Some(v) = self.defaultgenamt {
            push("--defaultgenamt", Some(v.to_string()));
        }

        let gpulayers = match gpu_layers_override {
            Some(n) => Some(Tunable::Value(n)),
            None => self.gpulayers,
        };
        match gpulayers {
            Some(Tunable::Off) | Some(Tunable::Value(0)) => push("--nogpulayers", None),
            Some(Tunable::Value(n)) => push("--gpulayers", Some(n.to_string())),
            Some(Tunable::Auto) | None => {}
        }

        if let Some(selector) = tensor_overrides {
            push("--overridetensors", Some(format!("{}=CPU", selector)));
        }

        match self.quantkv.unwrap_or(Tunable::Auto) {
            Tunable::Auto if wants_quantized_kv(profile) => push("--quantkv", Some("1".to_string())),
            Tunable::Value(v) => push("--quantkv", Some(v.to_string())),
            _ => {}
        }

        match self.blasbatchsize.unwrap_or(Tunable::Auto) {
            Tunable::Auto => push("--blasbatchsize", Some(auto_blas_batch(profile).to_string())),
            Tunable::Value(v) => push("--blasbatchsize", Some(v.to_string())),
            Tunable::Off => {}
        }

        for (flag, on) in [
            ("--usecublas", self.usecublas),
            ("--usehipblas", self.usehipblas),
            ("--flashattention", self.flashattention),
            ("--nommap", self.nommap),
            ("--lowvram", self.lowvram),
        ] {
            if on == Some(true) {
                push(flag, None);
            }
        }

        argv.extend(self.extra.iter().cloned());
        argv
    }
}

fn next_value<'a, I>(iter: &mut std::iter::Peekable<I>, flag: &str) -> Result<String>
where
    I: Iterator<Item = &'a String>,
{
    iter.next_if(|next| !next.starts_with("--"))
        .cloned()
        .ok_or_else(|| TuneError::ConfigError(format!("flag '{}' is missing its value", flag)))
}

fn parse_value<T: FromStr>(flag: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| TuneError::ConfigError(format!("invalid value '{}' for {}", value, flag)))
}

/// Physical cores minus one, at least one
pub fn auto_threads() -> usize {
    num_cpus::get_physical().saturating_sub(1).max(1)
}

const QUANTIZED_KV_MARKERS: &[&str] = &["Q5", "Q6", "Q8", "F16", "BF16", "K_M", "K_L", "K_XL", "XL"];

fn wants_quantized_kv(profile: &ModelProfile) -> bool {
    let quant = profile.quant_upper();
    QUANTIZED_KV_MARKERS.iter().any(|m| quant.contains(m)) || profile.size_b.unwrap_or(0.0) >= 30.0
}

fn auto_blas_batch(profile: &ModelProfile) -> u32 {
    if profile.is_moe {
        128
    } else if profile.size_b.unwrap_or(0.0) > 20.0 {
        256
    } else {
        512
    }
}
