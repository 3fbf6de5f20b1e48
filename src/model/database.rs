use crate::model::Id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single upstream OPTIMADE implementation registered with the gateway.
///
/// `base_url` is the unversioned base, i.e. without a trailing `/v{major}`;
/// the upstream client appends the version path itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Database {
    pub id: Id,
    pub name: String,
    pub base_url: String,
    pub api_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<Provider>,
    pub created_at: DateTime<Utc>,
}

/// Provider metadata carried along with a database descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    pub name: String,
    pub prefix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Input model for registering a database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDatabase {
    pub id: Id,
    pub name: String,
    pub base_url: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<Provider>,
}

fn default_api_version() -> String {
    crate::model::API_VERSION.to_string()
}

impl NewDatabase {
    /// Convert to a full `Database` with server-generated fields.
    pub fn into_database(self) -> Database {
        Database {
            id: self.id,
            name: self.name,
            base_url: self.base_url.trim_end_matches('/').to_string(),
            api_version: self.api_version,
            description: self.description,
            homepage: self.homepage,
            provider: self.provider,
            created_at: Utc::now(),
        }
    }

    /// `base_url` must be an absolute URL without a trailing version path.
    pub fn validate(&self) -> Result<(), String> {
        let parsed = url::Url::parse(&self.base_url)
            .map_err(|e| format!("base_url {:?} is not an absolute URL: {e}", self.base_url))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(format!(
                "base_url {:?} must use http or https",
                self.base_url
            ));
        }
        let trimmed = self.base_url.trim_end_matches('/');
        if let Some(last) = trimmed.rsplit('/').next() {
            if last.len() > 1
                && last.starts_with('v')
                && last[1..].chars().all(|c| c.is_ascii_digit() || c == '.')
            {
                return Err(format!(
                    "base_url {:?} must not include a version path segment ({last:?})",
                    self.base_url
                ));
            }
        }
        Ok(())
    }
}

/// A database reference as accepted when creating gateways: either a full
/// descriptor, or a bare `{id}` pointing at an already-registered database.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum DatabaseRef {
    Descriptor(NewDatabase),
    Registered { id: Id },
}

impl DatabaseRef {
    pub fn id(&self) -> &Id {
        match self {
            DatabaseRef::Descriptor(new) => &new.id,
            DatabaseRef::Registered { id } => id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(base_url: &str) -> NewDatabase {
        NewDatabase {
            id: "example".to_string(),
            name: "Example DB".to_string(),
            base_url: base_url.to_string(),
            api_version: default_api_version(),
            description: None,
            homepage: None,
            provider: None,
        }
    }

    #[test]
    fn database_ref_parses_bare_id() {
        let db_ref: DatabaseRef = serde_json::from_str(r#"{"id": "mp"}"#).unwrap();
        assert_eq!(db_ref, DatabaseRef::Registered { id: "mp".into() });
    }

    #[test]
    fn database_ref_parses_full_descriptor() {
        let db_ref: DatabaseRef = serde_json::from_str(
            r#"{"id": "mp", "name": "Example", "base_url": "https://example.org/optimade"}"#,
        )
        .unwrap();
        match db_ref {
            DatabaseRef::Descriptor(new) => {
                assert_eq!(new.id, "mp");
                assert_eq!(new.base_url, "https://example.org/optimade");
            }
            other => panic!("expected descriptor, got {other:?}"),
        }
    }

    #[test]
    fn validate_rejects_versioned_base_url() {
        assert!(descriptor("https://example.org/optimade/v1").validate().is_err());
        assert!(descriptor("https://example.org/optimade/v1.1/").validate().is_err());
        assert!(descriptor("https://example.org/optimade").validate().is_ok());
    }

    #[test]
    fn validate_rejects_relative_url() {
        assert!(descriptor("example.org/optimade").validate().is_err());
    }

    #[test]
    fn into_database_strips_trailing_slash() {
        let db = descriptor("https://example.org/optimade/").into_database();
        assert_eq!(db.base_url, "https://example.org/optimade");
    }
}
