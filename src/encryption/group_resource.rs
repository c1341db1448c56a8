//! # Group Resource
//!
//! Identifies a protected resource type by API group and plural resource name.

use std::fmt;

use serde::{Deserialize, Serialize};

/// An API group plus plural resource name, e.g. `secrets` or `routes.route.openshift.io`.
///
/// The core API group is the empty string.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, schemars::JsonSchema,
)]
pub struct GroupResource {
    /// API group, empty for the core group
    #[serde(default)]
    pub group: String,
    /// Plural resource name
    pub resource: String,
}

impl GroupResource {
    pub fn new(group: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            resource: resource.into(),
        }
    }

    /// A resource of the core (`""`) API group
    pub fn core(resource: impl Into<String>) -> Self {
        Self::new("", resource)
    }

    /// Parse the `resource.group` form used by `EncryptionConfiguration`.
    ///
    /// Everything before the first dot is the resource; a string without a dot
    /// names a core resource.
    pub fn parse(value: &str) -> Self {
        match value.split_once('.') {
            Some((resource, group)) => Self::new(group, resource),
            None => Self::core(value),
        }
    }

    /// Group as written into object names, where the core group is spelled `core`
    pub fn group_or_core(&self) -> &str {
        if self.group.is_empty() {
            "core"
        } else {
            &self.group
        }
    }
}

impl fmt::Display for GroupResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.resource)
        } else {
            write!(f, "{}.{}", self.resource, self.group)
        }
    }
}

/// The resource types encrypted when a policy does not list any
pub fn default_group_resources() -> Vec<GroupResource> {
    vec![GroupResource::core("secrets"), GroupResource::core("configmaps")]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_parse_agree() {
        let core = GroupResource::core("secrets");
        assert_eq!(core.to_string(), "secrets");
        assert_eq!(GroupResource::parse("secrets"), core);

        let routes = GroupResource::new("route.openshift.io", "routes");
        assert_eq!(routes.to_string(), "routes.route.openshift.io");
        assert_eq!(GroupResource::parse("routes.route.openshift.io"), routes);
    }

    #[test]
    fn test_group_or_core() {
        assert_eq!(GroupResource::core("configmaps").group_or_core(), "core");
        assert_eq!(
            GroupResource::new("oauth.openshift.io", "oauthaccesstokens").group_or_core(),
            "oauth.openshift.io"
        );
    }
}
