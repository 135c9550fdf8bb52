use crate::error::{SwitchboardError, SwitchboardResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of the tenant that owns a piece of work.
///
/// Threaded explicitly through every call; there is no ambient
/// "current tenant".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    /// Create a tenant id, rejecting empty ids and ids containing the
    /// stream-name separator `:`.
    pub fn new(id: impl Into<String>) -> SwitchboardResult<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(SwitchboardError::Config("tenant id must not be empty".into()));
        }
        if id.contains(':') {
            return Err(SwitchboardError::Config(format!(
                "tenant id '{id}' must not contain ':'"
            )));
        }
        Ok(Self(id))
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Prefix a logical name with this tenant: `{tenant}:{name}`.
    pub fn scoped(&self, name: &str) -> String {
        format!("{}:{}", self.0, name)
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TenantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TenantId {
    type Error = SwitchboardError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        TenantId::new(value)
    }
}

impl From<TenantId> for String {
    fn from(id: TenantId) -> Self {
        id.0
    }
}

impl TryFrom<&str> for TenantId {
    type Error = SwitchboardError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        TenantId::new(value)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_id_rejects_empty_and_separator() {
        assert!(TenantId::new("").is_err());
        assert!(TenantId::new("   ").is_err());
        assert!(TenantId::new("acme:eu").is_err());
        assert!(TenantId::new("acme").is_ok());
    }

    #[test]
    fn test_scoped_name() {
        let t = TenantId::new("t1").unwrap();
        assert_eq!(t.scoped("handoffs"), "t1:handoffs");
    }

    #[test]
    fn test_serializes_as_plain_string() {
        let t = TenantId::new("t1").unwrap();
        assert_eq!(serde_json::to_string(&t).unwrap(), "\"t1\"");
        let back: TenantId = serde_json::from_str("\"t1\"").unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn test_deserialize_validates() {
        assert!(serde_json::from_str::<TenantId>("\"\"").is_err());
        assert!(serde_json::from_str::<TenantId>("\"acme:eu\"").is_err());
        let err = serde_json::from_str::<TenantId>("\"a:b\"").unwrap_err();
        assert!(err.to_string().contains("must not contain ':'"));
    }
}
