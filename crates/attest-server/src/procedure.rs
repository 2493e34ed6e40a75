//! Procedures offered by the Provider and the resolvers that compute their
//! output attributes.

use crate::config::{ProcedureEntry, ResolverConfig};
use async_trait::async_trait;
use attest_types::{Attribute, Credential, ProcedureDescription, TypesError};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ResolveError {
    #[error("credential {0} was not supplied")]
    MissingCredential(String),

    #[error("no value known for {credential} = {key}")]
    UnknownKey { credential: String, key: String },

    #[error("resolver failed: {0}")]
    Failed(String),
}

/// Computes a procedure's output attributes from verified credentials.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, credentials: &[Credential]) -> Result<Vec<Attribute>, ResolveError>;
}

/// Returns the same values for every holder.
#[derive(Debug, Clone)]
pub struct StaticResolver {
    values: Vec<Attribute>,
}

impl StaticResolver {
    pub fn new(values: Vec<Attribute>) -> Self {
        Self { values }
    }

    /// Orders `values` by the procedure's declared attributes. Names with no
    /// declared attribute are dropped; a declared attribute without a value
    /// is an error.
    fn for_description(
        desc: &ProcedureDescription,
        values: &BTreeMap<String, String>,
    ) -> Result<Self, RegistryError> {
        let values = desc
            .attribute_names()
            .map(|name| {
                values
                    .get(name)
                    .map(|value| Attribute::new(name, value))
                    .ok_or_else(|| RegistryError::MissingValue {
                        procedure: desc.procedure_name.clone(),
                        attribute: name.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(values))
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, _credentials: &[Credential]) -> Result<Vec<Attribute>, ResolveError> {
        Ok(self.values.clone())
    }
}

/// Maps the value of one credential through a table to one attribute.
#[derive(Debug, Clone)]
pub struct LookupResolver {
    credential: String,
    attribute: String,
    table: HashMap<String, String>,
}

impl LookupResolver {
    pub fn new(
        credential: impl Into<String>,
        attribute: impl Into<String>,
        table: HashMap<String, String>,
    ) -> Self {
        Self {
            credential: credential.into(),
            attribute: attribute.into(),
            table,
        }
    }
}

#[async_trait]
impl Resolver for LookupResolver {
    async fn resolve(&self, credentials: &[Credential]) -> Result<Vec<Attribute>, ResolveError> {
        let key = credentials
            .iter()
            .find(|c| c.attribute_name == self.credential)
            .map(|c| c.attribute_value.as_str())
            .ok_or_else(|| ResolveError::MissingCredential(self.credential.clone()))?;
        let value = self.table.get(key).ok_or_else(|| ResolveError::UnknownKey {
            credential: self.credential.clone(),
            key: key.to_string(),
        })?;
        Ok(vec![Attribute::new(self.attribute.clone(), value.clone())])
    }
}

/// A procedure description together with its resolver.
#[derive(Clone)]
pub struct ProcedureConfig {
    pub desc: ProcedureDescription,
    pub resolver: Arc<dyn Resolver>,
}

impl ProcedureConfig {
    pub fn new(desc: ProcedureDescription, resolver: Arc<dyn Resolver>) -> Self {
        Self { desc, resolver }
    }
}

impl std::fmt::Debug for ProcedureConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcedureConfig")
            .field("desc", &self.desc)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Invalid(#[from] TypesError),

    #[error("procedure {0} is registered twice")]
    Duplicate(String),

    #[error("procedure {procedure}: lookup output {attribute} is not a declared attribute")]
    UndeclaredAttribute { procedure: String, attribute: String },

    #[error("procedure {procedure}: no value configured for attribute {attribute}")]
    MissingValue { procedure: String, attribute: String },

    #[error("procedure {procedure}: lookup credential {credential} is not a requirement")]
    UndeclaredCredential { procedure: String, credential: String },
}

/// Procedures by id. Read-only once the server runs.
#[derive(Debug, Clone, Default)]
pub struct ProcedureRegistry {
    procedures: HashMap<String, ProcedureConfig>,
}

impl ProcedureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the registry from `[[procedures]]` config entries.
    pub fn from_config(entries: &[ProcedureEntry]) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for entry in entries {
            let resolver: Arc<dyn Resolver> = match &entry.resolver {
                ResolverConfig::Static { values } => {
                    Arc::new(StaticResolver::for_description(&entry.desc, values)?)
                }
                ResolverConfig::Lookup {
                    credential,
                    attribute,
                    table,
                } => {
                    let procedure = &entry.desc.procedure_name;
                    if !entry.desc.requirements.contains(credential) {
                        return Err(RegistryError::UndeclaredCredential {
                            procedure: procedure.clone(),
                            credential: credential.clone(),
                        });
                    }
                    if !entry.desc.attribute_names().any(|name| name == attribute) {
                        return Err(RegistryError::UndeclaredAttribute {
                            procedure: procedure.clone(),
                            attribute: attribute.clone(),
                        });
                    }
                    // A lookup yields exactly one attribute.
                    if let Some(other) = entry.desc.attribute_names().find(|name| name != attribute) {
                        return Err(RegistryError::MissingValue {
                            procedure: procedure.clone(),
                            attribute: other.to_string(),
                        });
                    }
                    Arc::new(LookupResolver::new(
                        credential.clone(),
                        attribute.clone(),
                        table.clone(),
                    ))
                }
            };
            registry.insert(ProcedureConfig::new(entry.desc.clone(), resolver))?;
        }
        Ok(registry)
    }

    /// Adds a procedure under its name after validating its description.
    pub fn insert(&mut self, procedure: ProcedureConfig) -> Result<(), RegistryError> {
        procedure.desc.validate()?;
        let id = procedure.desc.procedure_name.clone();
        if self.procedures.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        self.procedures.insert(id, procedure);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&ProcedureConfig> {
        self.procedures.get(id)
    }

    /// Registered procedure ids, sorted.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.procedures.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.procedures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procedures.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProcedureEntry, ResolverConfig};
    use attest_types::AttributeDescription;

    fn credential(name: &str, value: &str) -> Credential {
        Credential {
            attribute_name: name.to_string(),
            attribute_hash: "hash".to_string(),
            attribute_value: value.to_string(),
        }
    }

    fn kvk_resolver() -> LookupResolver {
        LookupResolver::new(
            "bsn",
            "kvknr",
            HashMap::from([
                ("bsn1".to_string(), "kvk1".to_string()),
                ("bsn2".to_string(), "kvk2".to_string()),
            ]),
        )
    }

    #[tokio::test]
    async fn lookup_maps_credential_value() {
        let attributes = kvk_resolver()
            .resolve(&[credential("bsn", "bsn2")])
            .await
            .unwrap();
        assert_eq!(attributes, vec![Attribute::new("kvknr", "kvk2")]);
    }

    #[tokio::test]
    async fn lookup_fails_on_unknown_key_or_missing_credential() {
        let resolver = kvk_resolver();
        assert_eq!(
            resolver.resolve(&[credential("bsn", "bsn9")]).await,
            Err(ResolveError::UnknownKey {
                credential: "bsn".to_string(),
                key: "bsn9".to_string()
            })
        );
        assert_eq!(
            resolver.resolve(&[]).await,
            Err(ResolveError::MissingCredential("bsn".to_string()))
        );
    }

    #[tokio::test]
    async fn static_values_follow_declared_order() {
        let desc = ProcedureDescription {
            procedure_name: "p0".to_string(),
            requirements: vec![],
            attributes: vec![AttributeDescription::new("b"), AttributeDescription::new("a")],
        };
        let values = BTreeMap::from([
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
            ("zz".to_string(), "3".to_string()),
        ]);
        let resolved = StaticResolver::for_description(&desc, &values)
            .unwrap()
            .resolve(&[])
            .await
            .unwrap();
        assert_eq!(resolved, vec![Attribute::new("b", "2"), Attribute::new("a", "1")]);
    }

    #[test]
    fn registry_rejects_invalid_and_duplicate_procedures() {
        let desc = ProcedureDescription {
            procedure_name: "p0".to_string(),
            requirements: vec![],
            attributes: vec![AttributeDescription::new("att0")],
        };
        let resolver: Arc<dyn Resolver> = Arc::new(StaticResolver::new(vec![]));

        let mut registry = ProcedureRegistry::new();
        registry
            .insert(ProcedureConfig::new(desc.clone(), resolver.clone()))
            .unwrap();
        assert!(matches!(
            registry.insert(ProcedureConfig::new(desc.clone(), resolver.clone())),
            Err(RegistryError::Duplicate(id)) if id == "p0"
        ));

        let mut broken = desc;
        broken.procedure_name = "p1".to_string();
        broken.attributes.push(AttributeDescription::new("att0"));
        assert!(matches!(
            registry.insert(ProcedureConfig::new(broken, resolver)),
            Err(RegistryError::Invalid(_))
        ));
        assert_eq!(registry.ids(), vec!["p0"]);
    }

    fn entry(requirements: &[&str], attributes: &[&str], resolver: ResolverConfig) -> ProcedureEntry {
        ProcedureEntry {
            desc: ProcedureDescription {
                procedure_name: "p_kvknr".to_string(),
                requirements: requirements.iter().map(|s| s.to_string()).collect(),
                attributes: attributes.iter().map(|s| AttributeDescription::new(*s)).collect(),
            },
            resolver,
        }
    }

    fn lookup(credential: &str) -> ResolverConfig {
        ResolverConfig::Lookup {
            credential: credential.to_string(),
            attribute: "kvknr".to_string(),
            table: HashMap::new(),
        }
    }

    #[test]
    fn config_without_value_for_declared_attribute_is_rejected() {
        let values = BTreeMap::from([("a".to_string(), "1".to_string())]);
        let err = ProcedureRegistry::from_config(&[entry(
            &[],
            &["a", "b"],
            ResolverConfig::Static { values },
        )])
        .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::MissingValue { ref attribute, .. } if attribute == "b"
        ));

        let err = ProcedureRegistry::from_config(&[entry(&["bsn"], &["kvknr", "extra"], lookup("bsn"))])
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::MissingValue { ref attribute, .. } if attribute == "extra"
        ));
    }

    #[test]
    fn lookup_credential_must_be_a_requirement() {
        let err = ProcedureRegistry::from_config(&[entry(&["bsn"], &["kvknr"], lookup("email"))])
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::UndeclaredCredential { ref credential, .. } if credential == "email"
        ));

        let registry =
            ProcedureRegistry::from_config(&[entry(&["bsn"], &["kvknr"], lookup("bsn"))]).unwrap();
        assert_eq!(registry.ids(), vec!["p_kvknr"]);
    }
}
