//! Device dialects and model-string based profile selection.
//!
//! A [`Profile`] describes everything the codec needs to talk to one family
//! of amplifiers: command strings keyed by action name, the volume encoding
//! and the source map. The [`ProfileRegistry`] owns a set of profiles plus an
//! ordered model pattern table; the built-in registry is created once per
//! process and shared read-only.

use crate::error::{Result, RotelError};
use crate::types::VolumeValue;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, OnceLock};

/// Default TCP port of the Rotel IP control interface
pub const DEFAULT_PORT: u16 = 9590;

/// Key of the built-in fallback profile
pub const DEFAULT_PROFILE_KEY: &str = "rotel_ascii_v1";

/// Action names every profile has to define
pub const REQUIRED_COMMANDS: &[&str] = &[
    "power_on",
    "power_off",
    "mute_on",
    "mute_off",
    "push_on",
    "model_query",
];

/// Device dialect descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Identifying key (e.g. "rotel_ascii_v1")
    pub key: String,

    /// Human-readable name
    #[serde(default)]
    pub name: String,

    /// Port the device listens on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Terminator appended to action commands
    #[serde(default = "default_terminator")]
    pub terminator: char,

    /// Volume encoding rule
    pub volume: VolumeEncoding,

    /// Wire commands keyed by action name (`power_on`, `mute_query`, ...)
    pub commands: BTreeMap<String, String>,

    /// Logical source names and their wire tokens, in display order
    pub sources: Vec<SourceToken>,

    /// Keys and prefixes used by the device in status lines
    #[serde(default)]
    pub status: StatusKeys,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_terminator() -> char {
    '!'
}

/// Volume range and wire format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeEncoding {
    /// Lowest accepted value (inclusive)
    pub min: VolumeValue,

    /// Highest accepted value (inclusive)
    pub max: VolumeValue,

    /// Text placed before the number in a set command (e.g. "vol_")
    pub prefix: String,

    /// Zero-padded width of the number
    #[serde(default = "default_width")]
    pub width: usize,
}

fn default_width() -> usize {
    2
}

impl VolumeEncoding {
    /// Whether `value` lies inside the range
    pub fn contains(&self, value: u32) -> bool {
        value >= u32::from(self.min) && value <= u32::from(self.max)
    }

    /// Render the set command body for `value`, without terminator
    pub fn format(&self, value: VolumeValue) -> String {
        format!("{}{:0width$}", self.prefix, value, width = self.width)
    }

    /// Inverse of [`format`](Self::format): extract the number from a command body
    ///
    /// Returns `None` if the body does not carry the prefix or the remainder is not numeric.
    pub fn parse(&self, body: &str) -> Option<u32> {
        let digits = body.strip_prefix(self.prefix.as_str())?;
        parse_number(digits)
    }
}

/// Parse an all-digit string, saturating at `u32::MAX` on overflow
pub(crate) fn parse_number(digits: &str) -> Option<u32> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(digits.parse().unwrap_or(u32::MAX))
}

/// A selectable input and the command that selects it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceToken {
    /// Logical name shown to the host
    pub name: String,

    /// Wire command including terminator (e.g. "cd!")
    pub token: String,
}

/// Keys the device uses when reporting state
///
/// Each list holds the `key=value` keys and compact prefixes (`pwr_on`,
/// `vol42`) accepted for that field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusKeys {
    pub power: Vec<String>,
    pub volume: Vec<String>,
    pub mute: Vec<String>,
    pub source: Vec<String>,
    pub model: Vec<String>,
    pub version: Vec<String>,
}

impl Default for StatusKeys {
    fn default() -> Self {
        fn keys(list: &[&str]) -> Vec<String> {
            list.iter().map(|s| s.to_string()).collect()
        }

        Self {
            power: keys(&["power", "pwr"]),
            volume: keys(&["volume", "vol"]),
            mute: keys(&["mute"]),
            source: keys(&["source", "src"]),
            model: keys(&["model"]),
            version: keys(&["version"]),
        }
    }
}

impl Profile {
    /// Wire command for an action name
    pub fn command(&self, action: &str) -> Option<&str> {
        self.commands.get(action).map(String::as_str)
    }

    /// Wire token for a logical source name (case-insensitive)
    pub fn source_token(&self, name: &str) -> Option<&str> {
        self.sources
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name))
            .map(|s| s.token.as_str())
    }

    /// Logical source name for a wire token or reported value
    ///
    /// Accepts the token with or without its terminator.
    pub fn source_name(&self, token: &str) -> Option<&str> {
        self.sources
            .iter()
            .find(|s| {
                let bare = s.token.trim_end_matches(self.terminator);
                bare.eq_ignore_ascii_case(token) || s.token.eq_ignore_ascii_case(token)
            })
            .map(|s| s.name.as_str())
    }

    /// Selectable source names in display order
    pub fn source_names(&self) -> impl Iterator<Item = &str> {
        self.sources.iter().map(|s| s.name.as_str())
    }

    /// Map a raw volume onto 0.0..=1.0
    pub fn volume_level(&self, raw: VolumeValue) -> f32 {
        let span = f32::from(self.volume.max.saturating_sub(self.volume.min).max(1));
        let offset = f32::from(raw.saturating_sub(self.volume.min));
        (offset / span).clamp(0.0, 1.0)
    }

    /// Map a 0.0..=1.0 level onto the raw scale, clamping out-of-range levels
    pub fn volume_from_level(&self, level: f32) -> VolumeValue {
        let span = f32::from(self.volume.max.saturating_sub(self.volume.min));
        let raw = (level.clamp(0.0, 1.0) * span).round() as VolumeValue;
        self.volume.min.saturating_add(raw).min(self.volume.max)
    }

    /// Check the profile's invariants
    ///
    /// The volume range must be ordered, wire tokens unique within their
    /// namespace, and no token may contain line-ending characters.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(RotelError::InvalidConfig(format!("profile {}: {}", self.key, msg)));

        if self.key.is_empty() {
            return invalid("empty key".to_string());
        }
        if self.volume.min > self.volume.max {
            return invalid(format!("volume range {}..={} is empty", self.volume.min, self.volume.max));
        }
        for action in REQUIRED_COMMANDS {
            if !self.commands.contains_key(*action) {
                return invalid(format!("missing command {action}"));
            }
        }

        let mut seen = HashSet::new();
        for (action, token) in &self.commands {
            check_token(token).or_else(|e| invalid(format!("command {action}: {e}")))?;
            if !seen.insert(token.as_str()) {
                return invalid(format!("duplicate command token {token}"));
            }
        }

        let mut names = HashSet::new();
        let mut tokens = HashSet::new();
        for source in &self.sources {
            check_token(&source.token).or_else(|e| invalid(format!("source {}: {e}", source.name)))?;
            if !names.insert(source.name.to_ascii_lowercase()) {
                return invalid(format!("duplicate source name {}", source.name));
            }
            if !tokens.insert(source.token.to_ascii_lowercase()) {
                return invalid(format!("duplicate source token {}", source.token));
            }
        }

        Ok(())
    }
}

fn check_token(token: &str) -> std::result::Result<(), String> {
    if token.is_empty() {
        return Err("empty token".to_string());
    }
    if !token.is_ascii() || token.contains(['\r', '\n']) {
        return Err(format!("token {token:?} is not a single-line ASCII command"));
    }
    Ok(())
}

/// Predicate applied to a normalized model string
#[derive(Debug, Clone)]
pub enum ModelMatcher {
    /// Matches if the model contains any of the needles
    Contains(Vec<String>),

    /// Matches the whole model string
    Exact(String),

    /// Arbitrary predicate
    Predicate(fn(&str) -> bool),
}

impl ModelMatcher {
    /// Build a `Contains` matcher
    pub fn contains<I, S>(needles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        ModelMatcher::Contains(needles.into_iter().map(|s| normalize_model(s.as_ref())).collect())
    }

    /// Test a model string
    pub fn matches(&self, model: &str) -> bool {
        let model = normalize_model(model);
        match self {
            ModelMatcher::Contains(needles) => needles.iter().any(|n| model.contains(n.as_str())),
            ModelMatcher::Exact(expected) => model == normalize_model(expected),
            ModelMatcher::Predicate(f) => f(&model),
        }
    }
}

/// Lowercase and drop separators so "RA-1572" and "ra1572" compare equal
pub fn normalize_model(model: &str) -> String {
    model
        .chars()
        .filter(|c| !matches!(c, '-' | '_' | ' '))
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// One row of the model pattern table
#[derive(Debug, Clone)]
pub struct ModelPattern {
    pub matcher: ModelMatcher,
    pub profile_key: String,
}

/// Set of profiles plus the ordered model pattern table
#[derive(Debug, Clone)]
pub struct ProfileRegistry {
    profiles: BTreeMap<String, Arc<Profile>>,
    patterns: Vec<ModelPattern>,
    default: Arc<Profile>,
}

impl ProfileRegistry {
    /// The process-wide built-in registry
    pub fn builtin() -> &'static ProfileRegistry {
        static BUILTIN: OnceLock<ProfileRegistry> = OnceLock::new();
        BUILTIN.get_or_init(builtin_registry)
    }

    /// Start building a registry around its fallback profile
    pub fn builder(default: Profile) -> RegistryBuilder {
        RegistryBuilder {
            default_key: default.key.clone(),
            profiles: vec![default],
            patterns: Vec::new(),
        }
    }

    /// Select the profile for a model string
    ///
    /// Patterns are tried in declaration order and the first match wins.
    /// Empty or unrecognized models fall back to the default profile.
    pub fn resolve(&self, model: &str) -> Arc<Profile> {
        if model.trim().is_empty() {
            return self.default.clone();
        }

        for pattern in &self.patterns {
            if pattern.matcher.matches(model) {
                if let Some(profile) = self.profiles.get(&pattern.profile_key) {
                    tracing::debug!(model, profile = %profile.key, "Model matched profile");
                    return profile.clone();
                }
            }
        }

        tracing::debug!(model, profile = %self.default.key, "No model pattern matched, using default profile");
        self.default.clone()
    }

    /// Look up a profile by key
    pub fn get(&self, key: &str) -> Result<Arc<Profile>> {
        self.profiles
            .get(key)
            .cloned()
            .ok_or_else(|| RotelError::UnknownProfile(key.to_string()))
    }

    /// The fallback profile
    pub fn default_profile(&self) -> Arc<Profile> {
        self.default.clone()
    }

    /// Registered profile keys
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }
}

/// Builder for custom registries
pub struct RegistryBuilder {
    default_key: String,
    profiles: Vec<Profile>,
    patterns: Vec<ModelPattern>,
}

impl RegistryBuilder {
    /// Register an additional profile
    pub fn profile(mut self, profile: Profile) -> Self {
        self.profiles.push(profile);
        self
    }

    /// Append a model pattern; patterns are evaluated in the order added
    pub fn pattern(mut self, matcher: ModelMatcher, profile_key: impl Into<String>) -> Self {
        self.patterns.push(ModelPattern {
            matcher,
            profile_key: profile_key.into(),
        });
        self
    }

    /// Validate every profile and pattern and build the registry
    pub fn build(self) -> Result<ProfileRegistry> {
        let mut profiles = BTreeMap::new();
        for profile in self.profiles {
            profile.validate()?;
            let key = profile.key.clone();
            if profiles.insert(key.clone(), Arc::new(profile)).is_some() {
                return Err(RotelError::InvalidConfig(format!("duplicate profile key {key}")));
            }
        }

        for pattern in &self.patterns {
            if !profiles.contains_key(&pattern.profile_key) {
                return Err(RotelError::UnknownProfile(pattern.profile_key.clone()));
            }
        }

        let default = profiles
            .get(&self.default_key)
            .cloned()
            .ok_or_else(|| RotelError::UnknownProfile(self.default_key.clone()))?;

        Ok(ProfileRegistry {
            profiles,
            patterns: self.patterns,
            default,
        })
    }
}

/// Rotel ASCII v1 dialect (A12/A14 family, RA-1572/RA-1592)
pub fn rotel_ascii_v1() -> Profile {
    let commands = [
        ("power_on", "power_on!"),
        ("power_off", "power_off!"),
        ("power_query", "power?"),
        ("volume_query", "volume?"),
        ("mute_on", "mute_on!"),
        ("mute_off", "mute_off!"),
        ("mute_query", "mute?"),
        ("source_query", "source?"),
        ("push_on", "rs232_update_on!"),
        ("push_off", "rs232_update_off!"),
        ("model_query", "model?"),
        ("version_query", "version?"),
    ];
    let sources = [
        "cd", "phono", "tuner", "aux1", "aux2", "pcusb", "coax1", "coax2", "opt1", "opt2", "bluetooth",
    ];

    Profile {
        key: DEFAULT_PROFILE_KEY.to_string(),
        name: "Rotel ASCII v1 (A12/A14 family)".to_string(),
        port: DEFAULT_PORT,
        terminator: '!',
        volume: VolumeEncoding {
            min: 0,
            max: 96,
            prefix: "vol_".to_string(),
            width: 2,
        },
        commands: commands
            .iter()
            .map(|(action, cmd)| (action.to_string(), cmd.to_string()))
            .collect(),
        sources: sources
            .iter()
            .map(|name| SourceToken {
                name: name.to_string(),
                token: format!("{name}!"),
            })
            .collect(),
        status: StatusKeys::default(),
    }
}

fn builtin_registry() -> ProfileRegistry {
    let v1 = Arc::new(rotel_ascii_v1());
    let mut profiles = BTreeMap::new();
    profiles.insert(v1.key.clone(), v1.clone());

    ProfileRegistry {
        profiles,
        patterns: vec![
            ModelPattern {
                matcher: ModelMatcher::contains(["a12", "a14"]),
                profile_key: DEFAULT_PROFILE_KEY.to_string(),
            },
            ModelPattern {
                matcher: ModelMatcher::contains(["ra1572", "ra1592"]),
                profile_key: DEFAULT_PROFILE_KEY.to_string(),
            },
        ],
        default: v1,
    }
}
