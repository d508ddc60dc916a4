//! The secrets vault (`prod.vault.yaml`): a list of named secrets holding
//! either key/value fields or an embedded file.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use super::write_document;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vault {
    #[serde(default)]
    pub secrets: Vec<SecretEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<SecretFields>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<SecretFile>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretFile {
    pub name: String,
    pub content: String,
}

impl Vault {
    /// Read the vault, or start empty when the file is absent.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read vault: {}", path.display()))?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse vault: {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize vault")?;
        write_document(path, &content)
    }

    pub fn get(&self, name: &str) -> Option<&SecretEntry> {
        self.secrets.iter().find(|s| s.name == name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn password(&self, name: &str) -> Option<&str> {
        self.get(name)?
            .fields
            .as_ref()?
            .password
            .as_deref()
            .filter(|p| !p.is_empty())
    }

    fn entry_mut(&mut self, name: &str) -> &mut SecretEntry {
        if let Some(index) = self.secrets.iter().position(|s| s.name == name) {
            return &mut self.secrets[index];
        }
        self.secrets.push(SecretEntry {
            name: name.to_string(),
            fields: None,
            file: None,
        });
        let last = self.secrets.len() - 1;
        &mut self.secrets[last]
    }

    /// Insert or replace the password of `name`, keeping any username.
    pub fn set_password(&mut self, name: &str, password: impl Into<String>) {
        let entry = self.entry_mut(name);
        entry.fields.get_or_insert_with(SecretFields::default).password = Some(password.into());
    }

    pub fn set_credentials(
        &mut self,
        name: &str,
        username: impl Into<String>,
        password: impl Into<String>,
    ) {
        let entry = self.entry_mut(name);
        entry.fields = Some(SecretFields {
            username: Some(username.into()),
            password: Some(password.into()),
        });
    }

    pub fn set_file(&mut self, name: &str, file_name: impl Into<String>, content: impl Into<String>) {
        let entry = self.entry_mut(name);
        entry.file = Some(SecretFile {
            name: file_name.into(),
            content: content.into(),
        });
    }
}
