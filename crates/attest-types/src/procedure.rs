//! Procedure descriptions shared out of band by Requester and Provider.

use crate::{Credential, TypesError, DEFAULT_ID_FORMAT};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// An output attribute of a procedure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDescription {
    pub name: String,
    /// Identity format passed to the node when requesting attestation.
    #[serde(rename = "type", default = "default_id_format")]
    pub id_format: String,
}

fn default_id_format() -> String {
    DEFAULT_ID_FORMAT.to_string()
}

impl AttributeDescription {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id_format: default_id_format(),
        }
    }
}

/// Static description of a procedure: what it needs and what it yields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcedureDescription {
    pub procedure_name: String,
    /// Names of the credentials the Requester must prove, in order.
    #[serde(default)]
    pub requirements: Vec<String>,
    /// Output attributes, in declaration order.
    #[serde(default)]
    pub attributes: Vec<AttributeDescription>,
}

impl ProcedureDescription {
    /// Checks the naming invariants of a description.
    ///
    /// # Errors
    ///
    /// Returns `TypesError` if the name is empty or if two attributes or two
    /// requirements share a name.
    pub fn validate(&self) -> Result<(), TypesError> {
        if self.procedure_name.trim().is_empty() {
            return Err(TypesError::EmptyProcedureName);
        }

        let mut seen = HashSet::new();
        for attribute in &self.attributes {
            if !seen.insert(attribute.name.as_str()) {
                return Err(TypesError::DuplicateAttribute {
                    procedure: self.procedure_name.clone(),
                    name: attribute.name.clone(),
                });
            }
        }

        let mut seen = HashSet::new();
        for requirement in &self.requirements {
            if !seen.insert(requirement.as_str()) {
                return Err(TypesError::DuplicateRequirement {
                    procedure: self.procedure_name.clone(),
                    name: requirement.clone(),
                });
            }
        }

        Ok(())
    }

    pub fn requires_verification(&self) -> bool {
        !self.requirements.is_empty()
    }

    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.attributes.iter().map(|a| a.name.as_str())
    }

    /// Returns the requirements not covered by `credentials`.
    ///
    /// The credential set matches only if this is empty *and* the counts are
    /// equal, which makes the match one-to-one by name.
    pub fn missing_credentials<'a>(&'a self, credentials: &[Credential]) -> Vec<&'a str> {
        self.requirements
            .iter()
            .filter(|name| !credentials.iter().any(|c| &c.attribute_name == *name))
            .map(String::as_str)
            .collect()
    }
}

/// How the Requester reaches a Provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEndpoint {
    /// Base URL of the Provider's HTTP transport.
    pub http_address: String,
    /// The Provider's primary peer id on the attestation node.
    #[serde(rename = "mid_b64")]
    pub peer: String,
}

/// A procedure as the Requester sees it: the description plus its Provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientProcedure {
    #[serde(rename = "server")]
    pub provider: ProviderEndpoint,
    pub desc: ProcedureDescription,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn description(requirements: &[&str], attributes: &[&str]) -> ProcedureDescription {
        ProcedureDescription {
            procedure_name: "p1".to_string(),
            requirements: requirements.iter().map(|s| s.to_string()).collect(),
            attributes: attributes
                .iter()
                .map(|s| AttributeDescription::new(*s))
                .collect(),
        }
    }

    fn credential(name: &str) -> Credential {
        Credential {
            attribute_name: name.to_string(),
            attribute_hash: "hash".to_string(),
            attribute_value: "value".to_string(),
        }
    }

    #[test]
    fn rejects_duplicate_attribute_names() {
        let desc = description(&[], &["att1", "att1"]);
        assert_eq!(
            desc.validate(),
            Err(TypesError::DuplicateAttribute {
                procedure: "p1".to_string(),
                name: "att1".to_string()
            })
        );
    }

    #[test]
    fn rejects_duplicate_requirements() {
        let desc = description(&["att0", "att0"], &["att1"]);
        assert!(matches!(
            desc.validate(),
            Err(TypesError::DuplicateRequirement { .. })
        ));
    }

    #[test]
    fn rejects_empty_name() {
        let mut desc = description(&[], &["att0"]);
        desc.procedure_name = "  ".to_string();
        assert_eq!(desc.validate(), Err(TypesError::EmptyProcedureName));
    }

    #[test]
    fn missing_credentials_by_name() {
        let desc = description(&["att0", "bsn"], &["att1"]);
        assert_eq!(desc.missing_credentials(&[credential("att0")]), vec!["bsn"]);
        assert!(desc
            .missing_credentials(&[credential("bsn"), credential("att0")])
            .is_empty());
    }

    #[test]
    fn attribute_type_defaults_to_id_metadata() {
        let json = serde_json::json!({
            "procedure_name": "p0",
            "attributes": [{ "name": "att0" }]
        });
        let desc: ProcedureDescription = serde_json::from_value(json).unwrap();
        assert_eq!(desc.attributes[0].id_format, "id_metadata");
        assert!(!desc.requires_verification());
    }
}
