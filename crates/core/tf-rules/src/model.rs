//! Versioned rule configuration: parsing, validation and export.

use crate::field::is_valid_field_path;
use crate::pattern::validate_pattern;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::OnceLock;
use tf_error::ConfigError;
use tracing::warn;

/// Common CloudTrail top-level fields, used for an advisory check only.
/// An unknown field is logged, not rejected, since custom events are valid.
const KNOWN_TOP_LEVEL_FIELDS: &[&str] = &[
    "additionalEventData",
    "awsRegion",
    "errorCode",
    "errorMessage",
    "eventCategory",
    "eventID",
    "eventName",
    "eventSource",
    "eventTime",
    "eventType",
    "eventVersion",
    "managementEvent",
    "readOnly",
    "recipientAccountId",
    "requestID",
    "requestParameters",
    "resources",
    "responseElements",
    "serviceEventDetails",
    "sourceIPAddress",
    "userAgent",
    "userIdentity",
];

fn semver_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^v?(\d+)\.(\d+)\.(\d+)(-[a-zA-Z0-9.]+)?(\+[a-zA-Z0-9.]+)?$")
            .expect("static semver pattern")
    })
}

/// Check a version string against `v?MAJOR.MINOR.PATCH(-pre)?(+build)?`.
pub fn is_valid_semver(version: &str) -> bool {
    semver_pattern().is_match(version)
}

/// One field check inside a rule: the record field to inspect and the
/// pattern its string value must match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Match {
    /// Dotted path into the record, e.g. `userIdentity.arn`
    pub field_name: String,

    /// Regex the field's string value must match
    pub regex: String,
}

/// A named conjunction of matches. A record is dropped by this rule only
/// when every match holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Rule name, unique within a configuration
    pub name: String,

    /// Field checks, all of which must match
    pub matches: Vec<Match>,
}

/// Optional descriptive metadata carried alongside the rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
}

/// A versioned rule configuration.
///
/// The wire shape is identical in YAML and JSON; field order here defines
/// the canonical JSON key order (`version`, `meta`, `rules`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Semantic version of the configuration, mandatory
    #[serde(default)]
    pub version: String,

    /// Optional metadata block
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<ConfigMeta>,

    /// Filter rules, evaluated in declared order
    #[serde(default)]
    pub rules: Vec<Rule>,
}

/// Export formats understood by [`RuleConfig::export`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Yaml,
}

impl std::str::FromStr for ExportFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "yaml" | "yml" => Ok(Self::Yaml),
            other => Err(ConfigError::Parse(format!(
                "unsupported export format: {other}"
            ))),
        }
    }
}

/// A single configuration validation failure, located by its path into the
/// configuration document and the rule it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Path into the configuration, e.g. `rules[2].matches[0].regex`
    pub field: String,

    /// Name of the rule the error belongs to (empty for document-level errors)
    pub rule: String,

    /// Human-readable description of the violation
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "validation error in {} (rule: {}): {}",
            self.field, self.rule, self.message
        )
    }
}

/// All validation failures found in one pass. Validation does not stop at
/// the first problem so an operator can fix a configuration in one round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl ValidationErrors {
    fn push(&mut self, field: String, rule: &str, message: String) {
        self.0.push(ValidationError {
            field,
            rule: rule.to_string(),
            message,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<String> = self.0.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", messages.join("; "))
    }
}

impl std::error::Error for ValidationErrors {}

impl From<ValidationErrors> for ConfigError {
    fn from(errors: ValidationErrors) -> Self {
        ConfigError::Validation(errors.to_string())
    }
}

impl RuleConfig {
    /// Parse a configuration from YAML or JSON text.
    ///
    /// YAML is a superset of the JSON we accept, so a single parser covers
    /// both wire formats. The result is not yet validated; call
    /// [`RuleConfig::validate`] before compiling.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let cfg: RuleConfig = serde_yaml::from_str(raw)
            .map_err(|e| ConfigError::Parse(format!("failed to unmarshal configuration: {e}")))?;

        if cfg.version.is_empty() {
            return Err(ConfigError::Version(
                "configuration version is required".to_string(),
            ));
        }

        Ok(cfg)
    }

    /// Parse and fully validate a configuration in one step.
    pub fn load(raw: &str) -> Result<Self, ConfigError> {
        let cfg = Self::parse(raw)?;
        cfg.validate().map_err(ConfigError::from)?;
        Ok(cfg)
    }

    /// Validate the configuration, collecting every violation.
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::default();

        if !is_valid_semver(&self.version) {
            errors.push(
                "version".to_string(),
                "",
                format!("invalid semantic version: {}", self.version),
            );
        }

        if self.rules.is_empty() {
            errors.push(
                "rules".to_string(),
                "",
                "configuration must contain at least one rule".to_string(),
            );
        }

        self.validate_rules(&mut errors);
        self.check_duplicate_rule_names(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_rules(&self, errors: &mut ValidationErrors) {
        for (i, rule) in self.rules.iter().enumerate() {
            if rule.name.is_empty() {
                errors.push(
                    format!("rules[{i}].name"),
                    &rule.name,
                    "rule name cannot be empty".to_string(),
                );
            }

            if rule.matches.is_empty() {
                errors.push(
                    format!("rules[{i}].matches"),
                    &rule.name,
                    "rule must have at least one match".to_string(),
                );
            }

            for (j, m) in rule.matches.iter().enumerate() {
                if m.field_name.is_empty() {
                    errors.push(
                        format!("rules[{i}].matches[{j}].field_name"),
                        &rule.name,
                        "field name cannot be empty".to_string(),
                    );
                } else if !is_valid_field_path(&m.field_name) {
                    errors.push(
                        format!("rules[{i}].matches[{j}].field_name"),
                        &rule.name,
                        format!("invalid field path syntax: {}", m.field_name),
                    );
                } else {
                    self.warn_unknown_field(&m.field_name, &rule.name);
                }

                if m.regex.is_empty() {
                    errors.push(
                        format!("rules[{i}].matches[{j}].regex"),
                        &rule.name,
                        "regex pattern cannot be empty".to_string(),
                    );
                } else if let Err(e) = validate_pattern(&m.regex) {
                    errors.push(
                        format!("rules[{i}].matches[{j}].regex"),
                        &rule.name,
                        e.to_string(),
                    );
                }
            }
        }
    }

    fn check_duplicate_rule_names(&self, errors: &mut ValidationErrors) {
        let mut seen: HashMap<&str, usize> = HashMap::new();

        for (i, rule) in self.rules.iter().enumerate() {
            if let Some(prev) = seen.get(rule.name.as_str()) {
                errors.push(
                    format!("rules[{i}].name"),
                    &rule.name,
                    format!("duplicate rule name (also at index {prev})"),
                );
                return;
            }
            seen.insert(&rule.name, i);
        }
    }

    fn warn_unknown_field(&self, field: &str, rule: &str) {
        let top = field.split('.').next().unwrap_or(field);
        if !KNOWN_TOP_LEVEL_FIELDS.contains(&top) {
            warn!(
                field = field,
                rule = rule,
                "unknown CloudTrail field path (may be valid for custom events)"
            );
        }
    }

    /// Serialize the configuration in the requested format.
    ///
    /// JSON output uses the canonical key order (`version`, `meta`, `rules`,
    /// then `name`/`matches` per rule and `field_name`/`regex` per match),
    /// which falls out of struct field order.
    pub fn export(&self, format: ExportFormat) -> Result<String, ConfigError> {
        match format {
            ExportFormat::Yaml => serde_yaml::to_string(self)
                .map_err(|e| ConfigError::Parse(format!("yaml export failed: {e}"))),
            ExportFormat::Json => serde_json::to_string_pretty(self)
                .map_err(|e| ConfigError::Parse(format!("json export failed: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_YAML: &str = r#"
version: "1.0.0"
meta:
  description: drop noisy kms traffic
  tags: [kms, noise]
rules:
  - name: check_kms
    matches:
      - field_name: eventName
        regex: ".*crypt"
      - field_name: eventSource
        regex: "kms.*"
"#;

    #[test]
    fn test_parse_valid_yaml() {
        let cfg = RuleConfig::parse(VALID_YAML).unwrap();
        assert_eq!(cfg.version, "1.0.0");
        assert_eq!(cfg.rules.len(), 1);
        assert_eq!(cfg.rules[0].name, "check_kms");
        assert_eq!(cfg.rules[0].matches.len(), 2);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_parse_json_input() {
        let json = r#"{
            "version": "2.1.0",
            "rules": [
                {"name": "r1", "matches": [{"field_name": "eventName", "regex": "^Test"}]}
            ]
        }"#;
        let cfg = RuleConfig::parse(json).unwrap();
        assert_eq!(cfg.version, "2.1.0");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_missing_version_rejected() {
        let yaml = r#"
rules:
  - name: r1
    matches:
      - field_name: eventName
        regex: ".*"
"#;
        assert!(matches!(
            RuleConfig::parse(yaml),
            Err(ConfigError::Version(_))
        ));
    }

    #[test]
    fn test_semver_accepted_forms() {
        assert!(is_valid_semver("1.2.3"));
        assert!(is_valid_semver("v1.2.3"));
        assert!(is_valid_semver("1.2.3-alpha.1"));
        assert!(is_valid_semver("1.2.3+build"));
        assert!(is_valid_semver("1.2.3-alpha.1+build.5"));
    }

    #[test]
    fn test_semver_rejected_forms() {
        assert!(!is_valid_semver("1.2"));
        assert!(!is_valid_semver("1.2.a"));
        assert!(!is_valid_semver(""));
        assert!(!is_valid_semver("version-one"));
    }

    #[test]
    fn test_duplicate_rule_names_report_prior_index() {
        let yaml = r#"
version: "1.0.0"
rules:
  - name: check_kms
    matches: [{field_name: eventName, regex: ".*"}]
  - name: other
    matches: [{field_name: eventName, regex: ".*"}]
  - name: check_kms
    matches: [{field_name: eventName, regex: ".*"}]
"#;
        let cfg = RuleConfig::parse(yaml).unwrap();
        let errors = cfg.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors.0[0].field, "rules[2].name");
        assert_eq!(errors.0[0].rule, "check_kms");
        assert!(errors.0[0].message.contains("index 0"));
    }

    #[test]
    fn test_multiple_errors_collected() {
        let yaml = r#"
version: "not-semver"
rules:
  - name: ""
    matches:
      - field_name: "bad..path"
        regex: "[unclosed"
  - name: r2
    matches: []
"#;
        let cfg = RuleConfig::parse(yaml).unwrap();
        let errors = cfg.validate().unwrap_err();

        let fields: Vec<&str> = errors.0.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"version"));
        assert!(fields.contains(&"rules[0].name"));
        assert!(fields.contains(&"rules[0].matches[0].field_name"));
        assert!(fields.contains(&"rules[0].matches[0].regex"));
        assert!(fields.contains(&"rules[1].matches"));
    }

    #[test]
    fn test_redos_pattern_rejected() {
        let yaml = r#"
version: "1.0.0"
rules:
  - name: evil
    matches:
      - field_name: eventName
        regex: "(.*)+"
"#;
        let cfg = RuleConfig::parse(yaml).unwrap();
        let errors = cfg.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors.0[0].message.contains("dangerous"));
    }

    #[test]
    fn test_export_json_canonical_order() {
        let cfg = RuleConfig::parse(VALID_YAML).unwrap();
        let json = cfg.export(ExportFormat::Json).unwrap();

        let version_pos = json.find("\"version\"").unwrap();
        let meta_pos = json.find("\"meta\"").unwrap();
        let rules_pos = json.find("\"rules\"").unwrap();
        assert!(version_pos < meta_pos && meta_pos < rules_pos);

        let name_pos = json.find("\"name\"").unwrap();
        let matches_pos = json.find("\"matches\"").unwrap();
        assert!(name_pos < matches_pos);

        let field_pos = json.find("\"field_name\"").unwrap();
        let regex_pos = json.find("\"regex\"").unwrap();
        assert!(field_pos < regex_pos);
    }

    #[test]
    fn test_export_json_exact_key_order() {
        // Struct declaration order defines the canonical key order; this
        // pins the full serialized form so a field reorder cannot slip
        // through without a test failure.
        let cfg = RuleConfig {
            version: "1.0.0".to_string(),
            meta: Some(ConfigMeta {
                description: Some("kms noise".to_string()),
                ..ConfigMeta::default()
            }),
            rules: vec![Rule {
                name: "r1".to_string(),
                matches: vec![Match {
                    field_name: "eventName".to_string(),
                    regex: "^A".to_string(),
                }],
            }],
        };

        let json = serde_json::to_string(&cfg).unwrap();
        assert_eq!(
            json,
            r#"{"version":"1.0.0","meta":{"description":"kms noise"},"rules":[{"name":"r1","matches":[{"field_name":"eventName","regex":"^A"}]}]}"#
        );

        // Without meta the remaining keys keep their relative order
        let cfg = RuleConfig { meta: None, ..cfg };
        let json = serde_json::to_string(&cfg).unwrap();
        assert_eq!(
            json,
            r#"{"version":"1.0.0","rules":[{"name":"r1","matches":[{"field_name":"eventName","regex":"^A"}]}]}"#
        );
    }

    #[test]
    fn test_export_round_trip() {
        let cfg = RuleConfig::parse(VALID_YAML).unwrap();

        let yaml = cfg.export(ExportFormat::Yaml).unwrap();
        let from_yaml = RuleConfig::parse(&yaml).unwrap();
        assert_eq!(cfg, from_yaml);

        let json = cfg.export(ExportFormat::Json).unwrap();
        let from_json = RuleConfig::parse(&json).unwrap();
        assert_eq!(cfg, from_json);
    }

    #[test]
    fn test_export_format_from_str() {
        assert_eq!("json".parse::<ExportFormat>().unwrap(), ExportFormat::Json);
        assert_eq!("yaml".parse::<ExportFormat>().unwrap(), ExportFormat::Yaml);
        assert_eq!("YML".parse::<ExportFormat>().unwrap(), ExportFormat::Yaml);
        assert!("toml".parse::<ExportFormat>().is_err());
    }
}
