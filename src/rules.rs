//! Rule Set - Declarative Derivation Contracts

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Classified kind of a source asset.
///
/// Classification sniffs content magic bytes first and only falls back to the
/// declared extension (see [`crate::assets::classify`]).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Jpeg,
    Png,
    Gif,
    Webp,
    Svg,
    Unknown,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Jpeg => "jpeg",
            SourceKind::Png => "png",
            SourceKind::Gif => "gif",
            SourceKind::Webp => "webp",
            SourceKind::Svg => "svg",
            SourceKind::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Webp,
    Jpg,
    Png,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Webp => "webp",
            OutputFormat::Jpg => "jpg",
            OutputFormat::Png => "png",
        }
    }
}

/// One (transform parameters, output format, suffix) triple.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DerivationRule {
    /// Target width in pixels; height follows the source aspect ratio.
    pub width: u32,
    pub format: OutputFormat,
    /// Name suffix for the derived artifact. Defaults to the width.
    #[serde(default)]
    pub suffix: Option<String>,
    /// Encoder quality hint, where the output format supports one.
    #[serde(default)]
    pub quality: Option<u8>,
}

impl DerivationRule {
    pub fn new(width: u32, format: OutputFormat) -> Self {
        Self {
            width,
            format,
            suffix: None,
            quality: None,
        }
    }

    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = Some(quality);
        self
    }

    /// Effective suffix used in the output identity.
    pub fn suffix(&self) -> String {
        self.suffix
            .clone()
            .unwrap_or_else(|| self.width.to_string())
    }
}

/// Rule set - maps source kinds to the ordered rules that apply to them
pub struct RuleSet {
    rules: HashMap<SourceKind, Vec<DerivationRule>>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self {
            rules: HashMap::new(),
        }
    }

    /// The rule table the original responsive-image build used: four widths,
    /// a webp sibling for every raster source, and a same-format sibling
    /// (jpeg at quality 80, png lossless).
    pub fn responsive_defaults() -> Self {
        const WIDTHS: [u32; 4] = [320, 768, 1024, 1920];

        let mut set = Self::new();
        for width in WIDTHS {
            set.register(SourceKind::Jpeg, DerivationRule::new(width, OutputFormat::Webp));
            set.register(
                SourceKind::Jpeg,
                DerivationRule::new(width, OutputFormat::Jpg).with_quality(80),
            );
            set.register(SourceKind::Png, DerivationRule::new(width, OutputFormat::Webp));
            set.register(SourceKind::Png, DerivationRule::new(width, OutputFormat::Png));
        }
        set
    }

    /// Load a rule set from a JSON file mapping kind -> rule list.
    pub fn load_from_file(path: &Path) -> Result<Self, std::io::Error> {
        let content = fs::read_to_string(path)?;
        let rules: HashMap<SourceKind, Vec<DerivationRule>> = serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(Self { rules })
    }

    pub fn register(&mut self, kind: SourceKind, rule: DerivationRule) {
        self.rules.entry(kind).or_default().push(rule);
    }

    /// Ordered rules for a source kind; `None` when the kind is unregistered.
    pub fn rules_for(&self, kind: SourceKind) -> Option<&[DerivationRule]> {
        self.rules.get(&kind).map(|r| r.as_slice())
    }

    pub fn kinds(&self) -> Vec<SourceKind> {
        self.rules.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn to_table(&self) -> &HashMap<SourceKind, Vec<DerivationRule>> {
        &self.rules
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::responsive_defaults()
    }
}
