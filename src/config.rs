use anyhow::{Context, Result};
use indexmap::IndexMap;
use reqwest::header::{HeaderName, HeaderValue};
use serde::{Deserialize, Deserializer, Serialize};
use std::env;
use std::path::Path;

/// Per-upload settings handed to the engine with every file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Bytes per request; 0 sends the whole file at once
    #[serde(deserialize_with = "deserialize_size")]
    pub chunk_size: u64,
    /// Encode requests as multipart/form-data when the transport allows it
    pub multipart: bool,
    /// Fields sent with every request
    pub multipart_fixed_fields: IndexMap<String, String>,
    /// Extra fields merged after the fixed ones, overriding on key clash
    pub multipart_params_extra: IndexMap<String, String>,
    /// Form field that carries the file bytes
    pub file_field_name: String,
    /// Headers attached to every request
    pub headers: IndexMap<String, String>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: 0,
            multipart: true,
            multipart_fixed_fields: IndexMap::new(),
            multipart_params_extra: IndexMap::new(),
            file_field_name: "file".to_string(),
            headers: IndexMap::new(),
        }
    }
}

impl UploadConfig {
    /// Load configuration from environment variables and .env file
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is present but malformed
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok(); // Load .env file if it exists
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from any key lookup (environment, test maps)
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(size) = lookup("UPLOAD_CHUNK_SIZE") {
            config.chunk_size =
                parse_size(&size).context("UPLOAD_CHUNK_SIZE is not a valid size")?;
        }

        if let Some(multipart) = lookup("UPLOAD_MULTIPART") {
            config.multipart = parse_bool(&multipart)
                .with_context(|| format!("UPLOAD_MULTIPART '{}' is not a boolean", multipart))?;
        }

        if let Some(field) = lookup("UPLOAD_FILE_FIELD") {
            config.file_field_name = field;
        }

        if let Some(headers) = lookup("UPLOAD_HEADERS") {
            config.headers = parse_pairs(&headers);
        }

        if let Some(params) = lookup("UPLOAD_PARAMS") {
            config.multipart_fixed_fields = parse_pairs(&params);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that everything in the configuration can be put on the wire
    pub fn validate(&self) -> Result<()> {
        Self::validate_field_name(&self.file_field_name)?;
        for name in self
            .multipart_fixed_fields
            .keys()
            .chain(self.multipart_params_extra.keys())
        {
            Self::validate_field_name(name)?;
        }
        Self::validate_headers(&self.headers)
    }

    fn validate_field_name(name: &str) -> Result<()> {
        if name.is_empty() {
            anyhow::bail!("Form field name cannot be empty");
        }

        if name.contains(['"', '\r', '\n']) {
            anyhow::bail!(
                "Form field name '{}' contains quotes or line breaks (not allowed)",
                name.escape_debug()
            );
        }

        Ok(())
    }

    fn validate_headers(headers: &IndexMap<String, String>) -> Result<()> {
        for (name, value) in headers {
            HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("Header name '{}' is not valid", name))?;
            HeaderValue::from_str(value)
                .with_context(|| format!("Header '{}' has an invalid value", name))?;
        }
        Ok(())
    }
}

/// Parse "key1=value1,key2=value2" into an ordered map
///
/// Pairs without a key or a value are dropped. Values may contain '='.
pub fn parse_pairs(pairs: &str) -> IndexMap<String, String> {
    pairs
        .split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let key = key.trim();
            let value = value.trim();

            if key.is_empty() || value.is_empty() {
                None
            } else {
                Some((key.to_string(), value.to_string()))
            }
        })
        .collect()
}

/// Parse a human size such as "512", "256K", "4MB" or "1GiB" into bytes
pub fn parse_size(input: &str) -> Result<u64> {
    let s = input.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);

    if digits.is_empty() {
        anyhow::bail!("Size '{}' must start with a number", input);
    }

    let value: u64 = digits
        .parse()
        .with_context(|| format!("Size '{}' is out of range", input))?;

    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => 1024,
        "m" | "mb" | "mib" => 1024 * 1024,
        "g" | "gb" | "gib" => 1024 * 1024 * 1024,
        other => anyhow::bail!("Unknown size unit '{}' in '{}'", other, input),
    };

    value
        .checked_mul(multiplier)
        .with_context(|| format!("Size '{}' is out of range", input))
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SizeValue {
    Bytes(u64),
    Text(String),
}

fn deserialize_size<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match SizeValue::deserialize(deserializer)? {
        SizeValue::Bytes(n) => Ok(n),
        SizeValue::Text(s) => parse_size(&s).map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = UploadConfig::default();
        assert_eq!(config.chunk_size, 0);
        assert!(config.multipart);
        assert_eq!(config.file_field_name, "file");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("256K").unwrap(), 256 * 1024);
        assert_eq!(parse_size("4MB").unwrap(), 4 * 1024 * 1024);
        assert_eq!(parse_size(" 1 GiB ").unwrap(), 1024 * 1024 * 1024);

        assert!(parse_size("").is_err());
        assert!(parse_size("MB").is_err());
        assert!(parse_size("12XB").is_err());
        assert!(parse_size("99999999999999999999G").is_err());
    }

    #[test]
    fn test_parse_pairs() {
        let pairs = parse_pairs("token=abc==,album=Summer 2024,invalid,empty=");

        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs.get("token"), Some(&"abc==".to_string()));
        assert_eq!(pairs.get("album"), Some(&"Summer 2024".to_string()));
        assert!(parse_pairs("").is_empty());
    }

    #[test]
    fn test_from_lookup() {
        let config = UploadConfig::from_lookup(lookup_from(&[
            ("UPLOAD_CHUNK_SIZE", "1MB"),
            ("UPLOAD_MULTIPART", "no"),
            ("UPLOAD_FILE_FIELD", "upload"),
            ("UPLOAD_HEADERS", "Authorization=Bearer t0ken"),
            ("UPLOAD_PARAMS", "album=trip"),
        ]))
        .unwrap();

        assert_eq!(config.chunk_size, 1024 * 1024);
        assert!(!config.multipart);
        assert_eq!(config.file_field_name, "upload");
        assert_eq!(
            config.headers.get("Authorization"),
            Some(&"Bearer t0ken".to_string())
        );
        assert_eq!(
            config.multipart_fixed_fields.get("album"),
            Some(&"trip".to_string())
        );
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        assert!(UploadConfig::from_lookup(lookup_from(&[("UPLOAD_CHUNK_SIZE", "lots")])).is_err());
        assert!(UploadConfig::from_lookup(lookup_from(&[("UPLOAD_MULTIPART", "maybe")])).is_err());
        assert!(UploadConfig::from_lookup(lookup_from(&[("UPLOAD_FILE_FIELD", "")])).is_err());
    }

    #[test]
    fn test_validation() {
        let mut config = UploadConfig::default();
        config.file_field_name = "fi\"le".to_string();
        assert!(config.validate().is_err());

        let mut config = UploadConfig::default();
        config
            .headers
            .insert("Bad Header".to_string(), "x".to_string());
        assert!(config.validate().is_err());

        let mut config = UploadConfig::default();
        config
            .headers
            .insert("X-Token".to_string(), "line\nbreak".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "chunk_size: 2MB\nmultipart: true\nfile_field_name: blob\n\
             multipart_fixed_fields:\n  album: trip\n  owner: me\n\
             headers:\n  X-Api-Key: secret"
        )
        .unwrap();

        let config = UploadConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(config.chunk_size, 2 * 1024 * 1024);
        assert_eq!(config.file_field_name, "blob");
        let keys: Vec<_> = config.multipart_fixed_fields.keys().collect();
        assert_eq!(keys, vec!["album", "owner"]);
        assert_eq!(config.headers.get("X-Api-Key"), Some(&"secret".to_string()));
    }

    #[test]
    fn test_yaml_numeric_chunk_size() {
        let config: UploadConfig = serde_yaml::from_str("chunk_size: 4096").unwrap();
        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.file_field_name, "file");
    }
}
