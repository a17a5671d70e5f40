use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::error::VaultError;

pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 500 * 1024 * 1024;
pub const DEFAULT_STORAGE_LIMIT_BYTES: u64 = 5 * 1024 * 1024 * 1024;
pub const DEFAULT_PUBLIC_URL_PREFIX: &str = "/data/converted";
pub const DEFAULT_ORPHAN_GRACE_SECS: u64 = 3600;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub data_root: Option<String>,
    #[serde(default)]
    pub converter: Option<ConverterEntry>,
    #[serde(default)]
    pub max_upload_bytes: Option<u64>,
    #[serde(default)]
    pub storage_limit_bytes: Option<u64>,
    #[serde(default)]
    pub public_url_prefix: Option<String>,
    #[serde(default)]
    pub orphan_grace_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ConverterEntry {
    Shorthand(String),
    Detailed(ConverterEntryObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ConverterEntryObject {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// External converter invocation: `program [args..] <input> -o <output> --overwrite`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConverterCommand {
    pub program: PathBuf,
    pub leading_args: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub data_root: Utf8PathBuf,
    pub converter: Option<ConverterCommand>,
    pub max_upload_bytes: u64,
    pub storage_limit_bytes: u64,
    pub public_url_prefix: String,
    pub orphan_grace_secs: u64,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, VaultError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from("pcvault.json"),
        };

        if path.is_none() && !config_path.exists() {
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| VaultError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| VaultError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, VaultError> {
        let data_root = match config.data_root {
            Some(root) => Utf8PathBuf::from(root),
            None => default_data_root()?,
        };

        let converter = config.converter.map(|entry| match entry {
            ConverterEntry::Shorthand(program) => ConverterCommand {
                program: PathBuf::from(program),
                leading_args: Vec::new(),
            },
            ConverterEntry::Detailed(obj) => ConverterCommand {
                program: PathBuf::from(obj.program),
                leading_args: obj.args,
            },
        });

        let max_upload_bytes = config.max_upload_bytes.unwrap_or(DEFAULT_MAX_UPLOAD_BYTES);
        if max_upload_bytes == 0 {
            return Err(VaultError::ConfigParse(
                "max_upload_bytes must be positive".to_string(),
            ));
        }

        Ok(ResolvedConfig {
            data_root,
            converter,
            max_upload_bytes,
            storage_limit_bytes: config
                .storage_limit_bytes
                .unwrap_or(DEFAULT_STORAGE_LIMIT_BYTES),
            public_url_prefix: config
                .public_url_prefix
                .unwrap_or_else(|| DEFAULT_PUBLIC_URL_PREFIX.to_string()),
            orphan_grace_secs: config
                .orphan_grace_secs
                .unwrap_or(DEFAULT_ORPHAN_GRACE_SECS),
        })
    }
}

fn default_data_root() -> Result<Utf8PathBuf, VaultError> {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(dirs.data_dir().join("pointcloud-vault")).ok()
        })
        .ok_or_else(|| VaultError::Filesystem("unable to resolve data directory".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shorthand_converter_has_no_leading_args() {
        let config = Config {
            data_root: Some("/srv/vault".to_string()),
            converter: Some(ConverterEntry::Shorthand("/opt/PotreeConverter".to_string())),
            ..Config::default()
        };

        let resolved = ConfigLoader::resolve_config(config).unwrap();
        let converter = resolved.converter.unwrap();
        assert_eq!(converter.program, PathBuf::from("/opt/PotreeConverter"));
        assert!(converter.leading_args.is_empty());
        assert_eq!(resolved.max_upload_bytes, DEFAULT_MAX_UPLOAD_BYTES);
        assert_eq!(resolved.public_url_prefix, DEFAULT_PUBLIC_URL_PREFIX);
    }
}
