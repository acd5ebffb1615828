//! Object construction from declarative specifications.
//!
//! A specification is a qualified name (`"babyseg.nn.Adam"`) or a mapping
//! with `name`, optional `args` and optional `kwargs`. `Registry::build`
//! resolves the name and returns a `Built` value:
//!
//! - `Instance` when the entity is a type and instantiation was requested
//! - `Bound` when arguments are present but nothing was constructed
//! - `Unbound` when there is nothing to bind
//!
//! Arguments passed to `build` append to the spec's `args` and override the
//! spec's `kwargs`.

pub mod registry;

pub use registry::{split_name, Entity, EntityKind, Factory, Registry};

use crate::error::BuildError;
use log::debug;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};

/// Positional and keyword arguments for an entity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    pub positional: Vec<Value>,
    pub keyword: Map<String, Value>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_positional(positional: Vec<Value>) -> Self {
        Args {
            positional,
            keyword: Map::new(),
        }
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    pub fn kwarg(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.keyword.insert(key.to_string(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keyword.is_empty()
    }

    /// Append positional arguments and override same-named keywords.
    pub fn extend(&mut self, other: Args) {
        self.positional.extend(other.positional);
        self.keyword.extend(other.keyword);
    }

    /// Read a parameter passed either at `index` or as keyword `name`.
    pub fn param<T: DeserializeOwned>(
        &self,
        entity: &str,
        index: Option<usize>,
        name: &str,
    ) -> Result<Option<T>, BuildError> {
        let positional = index.and_then(|i| self.positional.get(i));
        let keyword = self.keyword.get(name);
        let value = match (positional, keyword) {
            (Some(_), Some(_)) => {
                return Err(BuildError::InvalidArguments {
                    entity: entity.to_string(),
                    reason: format!("multiple values for \"{}\"", name),
                })
            }
            (Some(v), None) | (None, Some(v)) => v,
            (None, None) => return Ok(None),
        };

        serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|e| BuildError::InvalidArguments {
                entity: entity.to_string(),
                reason: format!("\"{}\": {}", name, e),
            })
    }

    /// Fail on positional overflow or keywords outside `allowed`.
    pub fn check(&self, entity: &str, max_positional: usize, allowed: &[&str]) -> Result<(), BuildError> {
        if self.positional.len() > max_positional {
            return Err(BuildError::InvalidArguments {
                entity: entity.to_string(),
                reason: format!(
                    "takes {} positional arguments but {} were given",
                    max_positional,
                    self.positional.len()
                ),
            });
        }
        if let Some(key) = self.keyword.keys().find(|k| !allowed.contains(&k.as_str())) {
            return Err(BuildError::InvalidArguments {
                entity: entity.to_string(),
                reason: format!("unexpected keyword \"{}\"", key),
            });
        }
        Ok(())
    }
}

/// Parsed mapping form of a specification.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EntitySpec {
    pub name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl EntitySpec {
    /// Accept a bare name string or a `{name, args, kwargs}` mapping.
    pub fn from_value(value: &Value) -> Result<Self, BuildError> {
        match value {
            Value::String(name) => Ok(EntitySpec {
                name: name.clone(),
                args: Vec::new(),
                kwargs: Map::new(),
            }),
            Value::Object(_) => serde_json::from_value(value.clone())
                .map_err(|e| BuildError::InvalidSpec(format!("{}: {}", value, e))),
            other => Err(BuildError::InvalidSpec(format!(
                "{} is neither a name nor a mapping",
                other
            ))),
        }
    }
}

/// Input to `build`: a specification or an entity supplied directly.
pub enum Target<T> {
    Spec(Value),
    Entity(Entity<T>),
}

impl<T> From<Value> for Target<T> {
    fn from(value: Value) -> Self {
        Target::Spec(value)
    }
}

impl<T> From<&Value> for Target<T> {
    fn from(value: &Value) -> Self {
        Target::Spec(value.clone())
    }
}

impl<T> From<&str> for Target<T> {
    fn from(name: &str) -> Self {
        Target::Spec(Value::String(name.to_string()))
    }
}

impl<T> From<Entity<T>> for Target<T> {
    fn from(entity: Entity<T>) -> Self {
        Target::Entity(entity)
    }
}

/// Entity with arguments bound for a later call.
pub struct BoundFactory<T> {
    entity: Entity<T>,
    args: Args,
}

impl<T> Clone for BoundFactory<T> {
    fn clone(&self) -> Self {
        BoundFactory {
            entity: self.entity.clone(),
            args: self.args.clone(),
        }
    }
}

impl<T> std::fmt::Debug for BoundFactory<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundFactory")
            .field("entity", &self.entity.name())
            .field("args", &self.args)
            .finish()
    }
}

impl<T> BoundFactory<T> {
    pub fn entity(&self) -> &Entity<T> {
        &self.entity
    }

    pub fn args(&self) -> &Args {
        &self.args
    }

    /// Call with the bound arguments followed by `extra`.
    pub fn call(&self, extra: Args) -> Result<T, BuildError> {
        let mut args = self.args.clone();
        args.extend(extra);
        self.entity.call(args)
    }
}

/// Result of `build`.
#[derive(Debug)]
pub enum Built<T> {
    Instance(T),
    Bound(BoundFactory<T>),
    Unbound(Entity<T>),
}

impl<T> Built<T> {
    pub fn instance(self) -> Option<T> {
        match self {
            Built::Instance(value) => Some(value),
            _ => None,
        }
    }

    /// Call a bound or unbound entity; instances are not callable.
    pub fn call(&self, extra: Args) -> Result<T, BuildError> {
        match self {
            Built::Instance(_) => Err(BuildError::NotCallable("constructed instance".to_string())),
            Built::Bound(bound) => bound.call(extra),
            Built::Unbound(entity) => entity.call(extra),
        }
    }
}

impl<T> Registry<T> {
    /// Build an instance, bound factory, or raw entity from `target`.
    pub fn build(
        &self,
        target: impl Into<Target<T>>,
        extra: Args,
        instantiate: bool,
    ) -> Result<Built<T>, BuildError> {
        let (entity, mut args) = match target.into() {
            Target::Spec(value) => {
                let spec = EntitySpec::from_value(&value)?;
                let entity = self.resolve(&spec.name)?;
                if !entity.is_callable() {
                    return Err(BuildError::NotCallable(spec.name));
                }
                let args = Args {
                    positional: spec.args,
                    keyword: spec.kwargs,
                };
                (entity, args)
            }
            Target::Entity(entity) => (entity, Args::new()),
        };

        debug!("received configuration arguments {:?}", args);
        debug!("received function arguments {:?}", extra);
        args.extend(extra);

        if entity.is_type() && instantiate {
            debug!("constructing \"{}\" with merged arguments {:?}", entity.name(), args);
            return entity.call(args).map(Built::Instance);
        }

        if args.is_empty() {
            Ok(Built::Unbound(entity))
        } else {
            Ok(Built::Bound(BoundFactory { entity, args }))
        }
    }

    /// Build and, when nothing was constructed, call the result without further arguments.
    pub fn construct(&self, target: impl Into<Target<T>>, extra: Args) -> Result<T, BuildError> {
        match self.build(target, extra, true)? {
            Built::Instance(value) => Ok(value),
            other => other.call(Args::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> Registry<Value> {
        let mut r = Registry::new();
        r.register_function("tools.collect", |args: Args| {
            Ok(json!({"args": args.positional, "kwargs": args.keyword}))
        })
        .unwrap();
        r.register_type("shapes.Point", |args: Args| {
            args.check("shapes.Point", 2, &["x", "y"])?;
            let x: f64 = args.param("shapes.Point", Some(0), "x")?.unwrap_or(0.0);
            let y: f64 = args.param("shapes.Point", Some(1), "y")?.unwrap_or(0.0);
            Ok(json!({"x": x, "y": y}))
        })
        .unwrap();
        r.register_value("shapes.ORIGIN", json!([0, 0])).unwrap();
        r
    }

    #[test]
    fn test_bound_args_append() {
        let r = registry();
        let spec = json!({"name": "tools.collect", "args": [1, 2]});
        let built = r.build(&spec, Args::new(), true).unwrap();
        assert!(matches!(built, Built::Bound(_)));

        let out = built.call(Args::new().arg(3)).unwrap();
        assert_eq!(out["args"], json!([1, 2, 3]));
    }

    #[test]
    fn test_extra_kwargs_override_spec() {
        let r = registry();
        let spec = json!({"name": "tools.collect", "kwargs": {"lr": 2, "eps": 1}});
        let built = r.build(spec, Args::new().kwarg("eps", 5), true).unwrap();
        let out = built.call(Args::new()).unwrap();
        assert_eq!(out["kwargs"], json!({"lr": 2, "eps": 5}));
    }

    #[test]
    fn test_function_without_args_is_unbound() {
        let r = registry();
        let built = r.build("tools.collect", Args::new(), true).unwrap();
        match built {
            Built::Unbound(entity) => assert_eq!(entity.name(), "tools.collect"),
            other => panic!("expected unbound entity, got {:?}", other),
        }
    }

    #[test]
    fn test_type_is_instantiated() {
        let r = registry();
        let built = r
            .build("shapes.Point", Args::new().arg(1.0).kwarg("y", 2.0), true)
            .unwrap();
        assert_eq!(built.instance().unwrap(), json!({"x": 1.0, "y": 2.0}));
    }

    #[test]
    fn test_type_not_instantiated_on_request() {
        let r = registry();
        let built = r.build("shapes.Point", Args::new(), false).unwrap();
        match built {
            Built::Unbound(entity) => assert!(entity.is_type()),
            other => panic!("expected unbound type, got {:?}", other),
        }
    }

    #[test]
    fn test_bound_type_accepts_call_time_args() {
        let r = registry();
        let built = r.build("shapes.Point", Args::new().arg(4.0), false).unwrap();
        let point = built.call(Args::new().arg(5.0)).unwrap();
        assert_eq!(point, json!({"x": 4.0, "y": 5.0}));
    }

    #[test]
    fn test_direct_entity_target() {
        let entity: Entity<Value> = Entity::new_function("local.answer", |_| Ok(json!(42)));
        let r: Registry<Value> = Registry::new();
        let built = r.build(entity, Args::new(), true).unwrap();
        assert_eq!(built.call(Args::new()).unwrap(), json!(42));
    }

    #[test]
    fn test_errors() {
        let r = registry();
        assert!(matches!(
            r.build("Point", Args::new(), true),
            Err(BuildError::InvalidName(_))
        ));
        assert!(matches!(
            r.build("shapes.Square", Args::new(), true),
            Err(BuildError::UnknownEntity { .. })
        ));
        assert!(matches!(
            r.build("shapes.ORIGIN", Args::new(), true),
            Err(BuildError::NotCallable(_))
        ));
        assert!(matches!(
            r.build(json!(3), Args::new(), true),
            Err(BuildError::InvalidSpec(_))
        ));
        assert!(matches!(
            r.build(json!({"args": [1]}), Args::new(), true),
            Err(BuildError::InvalidSpec(_))
        ));
    }

    #[test]
    fn test_param_conflict() {
        let args = Args::new().arg(1).kwarg("x", 2);
        let result: Result<Option<i64>, _> = args.param("e.E", Some(0), "x");
        assert!(matches!(result, Err(BuildError::InvalidArguments { .. })));
    }

    #[test]
    fn test_construct_calls_function() {
        let r = registry();
        let spec = json!({"name": "tools.collect", "args": ["a"]});
        let out = r.construct(&spec, Args::new()).unwrap();
        assert_eq!(out["args"], json!(["a"]));
    }
}
