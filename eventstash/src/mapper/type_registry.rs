//! Explicit mapping from stored type names to payload constructors.
//!
//! Stored records only carry a type name. The registry is the single place
//! where that name is turned back into a Rust value: every accepted name is
//! registered up front, optionally with aliases for names that were renamed
//! since the events were written.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

use crate::errors::{StoreError, StoreResult};
use crate::types::{EventId, EventType};

/// Type-erased constructor building a payload from its structured form.
type ConstructorFn<E> = Arc<dyn Fn(Value) -> Result<E, serde_json::Error> + Send + Sync>;

/// Type-erased fallback for names without a registered constructor.
type FallbackFn<E> = Arc<dyn Fn(&EventType, Value) -> E + Send + Sync>;

/// What to do when a stored type name has no constructor.
pub enum UnknownTypePolicy<E> {
    /// Fail with [`StoreError::UnknownEventType`].
    Fail,
    /// Build a placeholder payload instead.
    Fallback(FallbackFn<E>),
}

impl<E> Clone for UnknownTypePolicy<E> {
    fn clone(&self) -> Self {
        match self {
            Self::Fail => Self::Fail,
            Self::Fallback(fallback) => Self::Fallback(Arc::clone(fallback)),
        }
    }
}

impl<E> std::fmt::Debug for UnknownTypePolicy<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fail => f.write_str("Fail"),
            Self::Fallback(_) => f.write_str("Fallback(<function>)"),
        }
    }
}

/// Registry of payload constructors keyed by stored type name.
pub struct TypeRegistry<E> {
    constructors: HashMap<String, ConstructorFn<E>>,
    aliases: HashMap<String, String>,
    unknown: UnknownTypePolicy<E>,
}

impl<E> Clone for TypeRegistry<E> {
    fn clone(&self) -> Self {
        Self {
            constructors: self.constructors.clone(),
            aliases: self.aliases.clone(),
            unknown: self.unknown.clone(),
        }
    }
}

impl<E: 'static> std::fmt::Debug for TypeRegistry<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("types", &self.registered_types())
            .field("aliases", &self.aliases)
            .field("unknown", &self.unknown)
            .finish()
    }
}

impl<E: 'static> Default for TypeRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: 'static> TypeRegistry<E> {
    /// Creates an empty registry that fails on unknown names.
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
            aliases: HashMap::new(),
            unknown: UnknownTypePolicy::Fail,
        }
    }

    /// Registers `P` as the payload stored under `type_name`.
    ///
    /// Registering the same name twice replaces the earlier constructor.
    #[must_use]
    pub fn register<P>(self, type_name: impl Into<String>) -> Self
    where
        P: DeserializeOwned + Into<E> + 'static,
    {
        self.register_with(type_name, |value| {
            serde_json::from_value::<P>(value).map(Into::into)
        })
    }

    /// Registers a custom constructor for `type_name`.
    #[must_use]
    pub fn register_with<F>(mut self, type_name: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(Value) -> Result<E, serde_json::Error> + Send + Sync + 'static,
    {
        let type_name = type_name.into();
        if self
            .constructors
            .insert(type_name.clone(), Arc::new(constructor))
            .is_some()
        {
            warn!(type_name = %type_name, "[type_registry.register] constructor replaced");
        }
        self
    }

    /// Resolves records stored as `old_name` with the constructor of `new_name`.
    #[must_use]
    pub fn alias(mut self, old_name: impl Into<String>, new_name: impl Into<String>) -> Self {
        self.aliases.insert(old_name.into(), new_name.into());
        self
    }

    /// Sets the policy for names without a constructor.
    #[must_use]
    pub fn with_unknown_type_policy(mut self, policy: UnknownTypePolicy<E>) -> Self {
        self.unknown = policy;
        self
    }

    /// Builds placeholder payloads for unknown names with `fallback`.
    #[must_use]
    pub fn with_fallback<F>(self, fallback: F) -> Self
    where
        F: Fn(&EventType, Value) -> E + Send + Sync + 'static,
    {
        self.with_unknown_type_policy(UnknownTypePolicy::Fallback(Arc::new(fallback)))
    }

    /// Returns the canonical name `type_name` resolves to, following aliases.
    pub fn resolve<'a>(&'a self, type_name: &'a str) -> Option<&'a str> {
        let canonical = self.aliases.get(type_name).map_or(type_name, String::as_str);
        self.constructors
            .contains_key(canonical)
            .then_some(canonical)
    }

    /// Returns whether `type_name` (or an alias of it) can be constructed.
    pub fn is_registered(&self, type_name: &str) -> bool {
        self.resolve(type_name).is_some()
    }

    /// Returns every registered name, sorted.
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.constructors.keys().cloned().collect();
        types.sort();
        types
    }

    /// Builds the payload of event `event_id` stored under `event_type`.
    pub fn construct(&self, event_id: EventId, event_type: &EventType, data: Value) -> StoreResult<E> {
        let constructor = self
            .resolve(event_type.as_ref())
            .and_then(|canonical| self.constructors.get(canonical));
        match constructor {
            Some(constructor) => {
                constructor(data).map_err(|error| StoreError::DecodingFailed {
                    event_id,
                    event_type: event_type.to_string(),
                    detail: error.to_string(),
                })
            }
            None => match &self.unknown {
                UnknownTypePolicy::Fail => Err(StoreError::UnknownEventType(event_type.clone())),
                UnknownTypePolicy::Fallback(fallback) => {
                    warn!(
                        event_id = %event_id,
                        event_type = %event_type,
                        "[type_registry.construct] unknown event type, using fallback"
                    );
                    Ok(fallback(event_type, data))
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Deserialize)]
    struct Opened {
        owner: String,
    }

    #[derive(Debug, Clone, PartialEq, Deserialize)]
    struct Closed;

    #[derive(Debug, Clone, PartialEq)]
    enum Account {
        Opened(Opened),
        Closed(Closed),
        Unknown(String),
    }

    impl From<Opened> for Account {
        fn from(event: Opened) -> Self {
            Self::Opened(event)
        }
    }

    impl From<Closed> for Account {
        fn from(event: Closed) -> Self {
            Self::Closed(event)
        }
    }

    fn event_type(name: &str) -> EventType {
        EventType::try_new(name).unwrap()
    }

    fn registry() -> TypeRegistry<Account> {
        TypeRegistry::new()
            .register::<Opened>("AccountOpened")
            .register::<Closed>("AccountClosed")
            .alias("account.opened.v1", "AccountOpened")
    }

    #[test]
    fn constructs_registered_payloads() {
        let payload = registry()
            .construct(
                EventId::generate(),
                &event_type("AccountOpened"),
                json!({"owner": "ada"}),
            )
            .unwrap();
        assert_eq!(
            payload,
            Account::Opened(Opened {
                owner: "ada".to_string()
            })
        );
    }

    #[test]
    fn aliases_resolve_to_current_names() {
        let registry = registry();
        assert_eq!(registry.resolve("account.opened.v1"), Some("AccountOpened"));
        assert!(registry.is_registered("AccountClosed"));
        assert!(!registry.is_registered("AccountFrozen"));
    }

    #[test]
    fn unknown_names_fail_by_default() {
        let result = registry().construct(
            EventId::generate(),
            &event_type("AccountFrozen"),
            json!({}),
        );
        assert!(matches!(result, Err(StoreError::UnknownEventType(name)) if name.as_ref() == "AccountFrozen"));
    }

    #[test]
    fn fallback_builds_placeholders() {
        let registry = registry().with_fallback(|name, _| Account::Unknown(name.to_string()));
        let payload = registry
            .construct(EventId::generate(), &event_type("AccountFrozen"), json!({}))
            .unwrap();
        assert_eq!(payload, Account::Unknown("AccountFrozen".to_string()));
    }

    #[test]
    fn malformed_payloads_are_decoding_failures() {
        let result = registry().construct(
            EventId::generate(),
            &event_type("AccountOpened"),
            json!({"owner": 42}),
        );
        assert!(matches!(result, Err(StoreError::DecodingFailed { .. })));
    }

    #[test]
    fn registered_types_are_sorted() {
        assert_eq!(
            registry().registered_types(),
            vec!["AccountClosed".to_string(), "AccountOpened".to_string()]
        );
    }
}
