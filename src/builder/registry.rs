//! Entity registry keyed by qualified names such as `babyseg.nn.GroupNet`.

use crate::builder::Args;
use crate::error::BuildError;
use log::debug;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Constructor or function body shared between clones of an entity.
pub type Factory<T> = Arc<dyn Fn(Args) -> Result<T, BuildError> + Send + Sync>;

/// What a registered name resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    /// Constructible type; `build` instantiates it by default
    Type,
    /// Plain callable; `build` never calls it
    Function,
    /// Non-callable attribute
    Value,
}

enum Body<T> {
    Type(Factory<T>),
    Function(Factory<T>),
    Value(Value),
}

/// A resolved, registered entity.
pub struct Entity<T> {
    name: String,
    body: Body<T>,
}

impl<T> Clone for Entity<T> {
    fn clone(&self) -> Self {
        let body = match &self.body {
            Body::Type(f) => Body::Type(Arc::clone(f)),
            Body::Function(f) => Body::Function(Arc::clone(f)),
            Body::Value(v) => Body::Value(v.clone()),
        };
        Entity {
            name: self.name.clone(),
            body,
        }
    }
}

impl<T> fmt::Debug for Entity<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .finish()
    }
}

impl<T> Entity<T> {
    pub fn new_type<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(Args) -> Result<T, BuildError> + Send + Sync + 'static,
    {
        Entity {
            name: name.into(),
            body: Body::Type(Arc::new(factory)),
        }
    }

    pub fn new_function<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(Args) -> Result<T, BuildError> + Send + Sync + 'static,
    {
        Entity {
            name: name.into(),
            body: Body::Function(Arc::new(factory)),
        }
    }

    pub fn new_value(name: impl Into<String>, value: Value) -> Self {
        Entity {
            name: name.into(),
            body: Body::Value(value),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> EntityKind {
        match self.body {
            Body::Type(_) => EntityKind::Type,
            Body::Function(_) => EntityKind::Function,
            Body::Value(_) => EntityKind::Value,
        }
    }

    pub fn is_type(&self) -> bool {
        self.kind() == EntityKind::Type
    }

    pub fn is_callable(&self) -> bool {
        self.kind() != EntityKind::Value
    }

    /// Invoke the entity with fully merged arguments.
    pub fn call(&self, args: Args) -> Result<T, BuildError> {
        match &self.body {
            Body::Type(f) | Body::Function(f) => f(args),
            Body::Value(_) => Err(BuildError::NotCallable(self.name.clone())),
        }
    }
}

/// Split a qualified name into module and entity at the last separator.
pub fn split_name(name: &str) -> Result<(&str, &str), BuildError> {
    match name.rsplit_once('.') {
        Some((module, entity)) if !module.is_empty() => Ok((module, entity)),
        _ => Err(BuildError::InvalidName(name.to_string())),
    }
}

/// Explicit name-to-entity table populated at startup.
pub struct Registry<T> {
    entities: BTreeMap<String, Entity<T>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Registry {
            entities: BTreeMap::new(),
        }
    }
}

impl<T> fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.entities.keys()).finish()
    }
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entity, rejecting malformed or duplicate names.
    pub fn insert(&mut self, entity: Entity<T>) -> Result<(), BuildError> {
        split_name(entity.name())?;
        if self.entities.contains_key(entity.name()) {
            return Err(BuildError::Duplicate(entity.name().to_string()));
        }
        debug!("registered {:?} \"{}\"", entity.kind(), entity.name());
        self.entities.insert(entity.name().to_string(), entity);
        Ok(())
    }

    pub fn register_type<F>(&mut self, name: &str, factory: F) -> Result<(), BuildError>
    where
        F: Fn(Args) -> Result<T, BuildError> + Send + Sync + 'static,
    {
        self.insert(Entity::new_type(name, factory))
    }

    pub fn register_function<F>(&mut self, name: &str, factory: F) -> Result<(), BuildError>
    where
        F: Fn(Args) -> Result<T, BuildError> + Send + Sync + 'static,
    {
        self.insert(Entity::new_function(name, factory))
    }

    pub fn register_value(&mut self, name: &str, value: Value) -> Result<(), BuildError> {
        self.insert(Entity::new_value(name, value))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entities.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }

    /// Resolve a qualified name, distinguishing unknown modules from unknown entities.
    pub fn resolve(&self, name: &str) -> Result<Entity<T>, BuildError> {
        let (module, entity) = split_name(name)?;
        debug!("parsed module \"{}\", entity \"{}\"", module, entity);

        if let Some(found) = self.entities.get(name) {
            return Ok(found.clone());
        }

        let module_known = self
            .entities
            .keys()
            .filter_map(|k| k.rsplit_once('.'))
            .any(|(m, _)| m == module);
        if module_known {
            Err(BuildError::UnknownEntity {
                module: module.to_string(),
                entity: entity.to_string(),
            })
        } else {
            Err(BuildError::UnknownModule {
                module: module.to_string(),
                entity: entity.to_string(),
            })
        }
    }
}
