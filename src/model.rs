//! Declarative object models
//!
//! A [`ModelDefinition`] says which contract owns a kind of object, how to
//! read each of its properties, which events announce that an object was
//! created or changed, and which contract methods mutate it. Definitions are
//! compiled once at startup into a [`CompiledModel`], which carries the
//! parsed hook patterns and the generated write methods.

use crate::cache::CachedObject;
use crate::error::{SyncError, SyncResult};
use crate::hooks::{as_object_id, HookPattern, ObjectId};
use crate::ledger::{Ledger, LedgerError};
use alloy_primitives::U256;
use futures::future::try_join_all;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::ops::Range;

/// Declared type of a property.
///
/// Only `integer` is coerced; every other type passes through unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum PropertyType {
    Integer,
    Other(String),
}

impl From<String> for PropertyType {
    fn from(s: String) -> Self {
        if s.eq_ignore_ascii_case("integer") {
            PropertyType::Integer
        } else {
            PropertyType::Other(s)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyDef {
    #[serde(rename = "type")]
    pub kind: PropertyType,
    /// Read method on the primary contract, called with the object key.
    /// Not needed for the primary key property.
    #[serde(default)]
    pub getter: Option<String>,
    /// Write method on the primary contract, called with `(key, value)`.
    #[serde(default)]
    pub setter: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDef {
    #[serde(default)]
    pub indicates_creation: bool,
    #[serde(default)]
    pub indicates_update: bool,
    /// Event argument carrying the affected object's key.
    #[serde(default)]
    pub index_field: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MethodDef {
    pub method: String,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EnumeratorDef {
    pub method: String,
    #[serde(default)]
    pub parameters: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDefinition {
    pub name: String,
    pub primary_key: String,
    pub primary_contract: String,
    pub properties: BTreeMap<String, PropertyDef>,
    /// contract name -> event name -> event definition
    #[serde(default)]
    pub events: BTreeMap<String, BTreeMap<String, EventDef>>,
    #[serde(default)]
    pub actions: BTreeMap<String, MethodDef>,
    #[serde(default)]
    pub constructor: Option<MethodDef>,
    #[serde(default)]
    pub enumerators: BTreeMap<String, EnumeratorDef>,
    #[serde(default)]
    pub default_enumerator: Option<String>,
}

/// A validated model with parsed hooks and generated methods.
#[derive(Debug, Clone)]
pub struct CompiledModel {
    pub definition: ModelDefinition,
    /// Hooks whose events announce a new object (always parametric)
    pub creation_hooks: Vec<HookPattern>,
    /// Hooks whose events announce a change to an existing object
    pub update_hooks: Vec<HookPattern>,
    pub methods: ObjectMethods,
}

impl CompiledModel {
    pub fn compile(definition: ModelDefinition) -> SyncResult<Self> {
        let invalid = |reason: String| SyncError::InvalidModel {
            model: definition.name.clone(),
            reason,
        };

        if definition.name.is_empty() {
            return Err(invalid("model name is empty".to_string()));
        }

        let mut creation_hooks = Vec::new();
        let mut update_hooks = Vec::new();
        for (contract, events) in &definition.events {
            for (event, def) in events {
                let raw = match &def.index_field {
                    Some(field) => format!("{}.{}:{}", contract, event, field),
                    None => format!("{}.{}", contract, event),
                };
                let pattern: HookPattern = raw.parse()?;
                if def.indicates_creation {
                    if pattern.index_field.is_none() {
                        return Err(invalid(format!(
                            "creation event {} has no indexField",
                            pattern.fqn()
                        )));
                    }
                    creation_hooks.push(pattern.clone());
                }
                if def.indicates_update {
                    update_hooks.push(pattern);
                }
            }
        }

        for (name, property) in &definition.properties {
            if *name != definition.primary_key && property.getter.is_none() {
                return Err(invalid(format!("property {} has no getter", name)));
            }
        }

        if let Some(default) = &definition.default_enumerator {
            if !definition.enumerators.contains_key(default) {
                return Err(invalid(format!("default enumerator {} is not declared", default)));
            }
        }

        let methods = generate_object_methods(&definition);
        Ok(Self {
            definition,
            creation_hooks,
            update_hooks,
            methods,
        })
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }
}

/// Coerce a raw getter result according to the property's declared type.
pub fn coerce_property(kind: &PropertyType, raw: Value) -> Value {
    match kind {
        PropertyType::Integer => coerce_integer(raw),
        PropertyType::Other(_) => raw,
    }
}

/// Numeric coercion for `integer` properties.
///
/// Strings are parsed as decimal or `0x` hex; values wider than 64 bits
/// stay as decimal strings so nothing is lost. Unparseable input becomes
/// `null`.
pub fn coerce_integer(raw: Value) -> Value {
    match raw {
        Value::Number(_) | Value::Null => raw,
        Value::Bool(b) => Value::from(u64::from(b)),
        Value::String(s) => {
            let s = s.trim();
            if let Some(negative) = s.strip_prefix('-') {
                return negative
                    .parse::<u64>()
                    .ok()
                    .and_then(|n| i64::try_from(n).ok())
                    .map_or(Value::Null, |n| Value::from(-n));
            }
            match s.parse::<U256>() {
                Ok(n) => {
                    let limbs = n.as_limbs();
                    if limbs[1..].iter().all(|limb| *limb == 0) {
                        Value::from(limbs[0])
                    } else {
                        Value::String(n.to_string())
                    }
                }
                Err(_) => Value::Null,
            }
        }
        Value::Array(_) | Value::Object(_) => Value::Null,
    }
}

async fn read_property<L>(
    ledger: &L,
    definition: &ModelDefinition,
    name: &str,
    property: &PropertyDef,
    key: ObjectId,
) -> SyncResult<(String, Value)>
where
    L: Ledger + ?Sized,
{
    if name == definition.primary_key {
        return Ok((name.to_string(), Value::from(key)));
    }
    let getter = property.getter.as_deref().ok_or_else(|| SyncError::InvalidModel {
        model: definition.name.clone(),
        reason: format!("property {} has no getter", name),
    })?;
    let raw = ledger
        .call_read(&definition.primary_contract, getter, &[Value::from(key)])
        .await
        .map_err(|e| {
            SyncError::unavailable(
                format!("{}.{}({})", definition.primary_contract, getter, key),
                e,
            )
        })?;
    Ok((name.to_string(), coerce_property(&property.kind, raw)))
}

/// Read every declared property of object `key` from the ledger.
///
/// Getter calls run concurrently. Any failure fails the whole refresh so a
/// partially read object never reaches the cache. The primary key field is
/// always present and equal to `key`.
pub async fn refresh_object<L>(ledger: &L, model: &CompiledModel, key: ObjectId) -> SyncResult<CachedObject>
where
    L: Ledger + ?Sized,
{
    let definition = &model.definition;
    let reads = definition
        .properties
        .iter()
        .map(|(name, property)| read_property(ledger, definition, name, property, key));

    let mut object: CachedObject = try_join_all(reads).await?.into_iter().collect();
    object
        .entry(definition.primary_key.clone())
        .or_insert_with(|| Value::from(key));
    Ok(object)
}

/// Ask the model's default enumerator how many objects exist.
pub async fn count_objects<L>(ledger: &L, model: &CompiledModel) -> SyncResult<u64>
where
    L: Ledger + ?Sized,
{
    let definition = &model.definition;
    let name = definition
        .default_enumerator
        .as_deref()
        .ok_or_else(|| SyncError::UnknownMethod {
            model: definition.name.clone(),
            kind: "enumerator",
            name: "<default>".to_string(),
        })?;
    let enumerator = definition
        .enumerators
        .get(name)
        .ok_or_else(|| SyncError::UnknownMethod {
            model: definition.name.clone(),
            kind: "enumerator",
            name: name.to_string(),
        })?;

    let operation = format!("{}.{}", definition.primary_contract, enumerator.method);
    let raw = ledger
        .call_read(&definition.primary_contract, &enumerator.method, &enumerator.parameters)
        .await
        .map_err(|e| SyncError::unavailable(operation.clone(), e))?;
    as_object_id(&raw).ok_or_else(|| {
        SyncError::unavailable(
            operation,
            LedgerError::Decode(format!("object count is not numeric: {}", raw)),
        )
    })
}

/// Keys to backfill for `[offset, offset + limit)`, clipped to `count`.
pub fn enumeration_range(count: u64, limit: u64, offset: u64) -> Range<ObjectId> {
    let end = offset.saturating_add(limit).min(count);
    offset.min(end)..end
}

/// Which declared entry point a generated method comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodKind {
    Setter { property: String },
    Action { name: String },
    Constructor,
}

/// One generated write method of a model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMethod {
    pub kind: MethodKind,
    pub contract: String,
    pub method: String,
    pub title: String,
}

/// A write request against a model.
#[derive(Debug, Clone, PartialEq)]
pub enum MethodCall {
    /// Call the setter of `property` with `(key, value)`.
    Set {
        key: ObjectId,
        property: String,
        value: Value,
    },
    /// Call action `name` with `(key, args...)`.
    Action {
        key: ObjectId,
        name: String,
        args: Vec<Value>,
    },
    /// Call the constructor with `args`.
    Construct { args: Vec<Value> },
}

/// Write methods generated for one model.
#[derive(Debug, Clone, Default)]
pub struct ObjectMethods {
    model: String,
    methods: Vec<ObjectMethod>,
}

impl ObjectMethods {
    pub fn setter(&self, property: &str) -> Option<&ObjectMethod> {
        self.find(|kind| matches!(kind, MethodKind::Setter { property: p } if p == property))
    }

    pub fn action(&self, name: &str) -> Option<&ObjectMethod> {
        self.find(|kind| matches!(kind, MethodKind::Action { name: n } if n == name))
    }

    pub fn constructor(&self) -> Option<&ObjectMethod> {
        self.find(|kind| *kind == MethodKind::Constructor)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ObjectMethod> {
        self.methods.iter()
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    fn find(&self, pred: impl Fn(&MethodKind) -> bool) -> Option<&ObjectMethod> {
        self.methods.iter().find(|m| pred(&m.kind))
    }

    /// Resolve a call to its method and the contract arguments.
    pub fn prepare(&self, call: MethodCall) -> SyncResult<(&ObjectMethod, Vec<Value>)> {
        let unknown = |kind: &'static str, name: String| SyncError::UnknownMethod {
            model: self.model.clone(),
            kind,
            name,
        };
        match call {
            MethodCall::Set {
                key,
                property,
                value,
            } => {
                let method = self
                    .setter(&property)
                    .ok_or_else(|| unknown("setter", property.clone()))?;
                Ok((method, vec![Value::from(key), value]))
            }
            MethodCall::Action { key, name, args } => {
                let method = self.action(&name).ok_or_else(|| unknown("action", name.clone()))?;
                let mut call_args = Vec::with_capacity(args.len() + 1);
                call_args.push(Value::from(key));
                call_args.extend(args);
                Ok((method, call_args))
            }
            MethodCall::Construct { args } => {
                let method = self
                    .constructor()
                    .ok_or_else(|| unknown("constructor", "constructor".to_string()))?;
                Ok((method, args))
            }
        }
    }
}

/// Build one write method per declared setter, action, and constructor.
pub fn generate_object_methods(definition: &ModelDefinition) -> ObjectMethods {
    let contract = &definition.primary_contract;
    let mut methods = Vec::new();

    for (property, def) in &definition.properties {
        if let Some(setter) = &def.setter {
            methods.push(ObjectMethod {
                kind: MethodKind::Setter {
                    property: property.clone(),
                },
                contract: contract.clone(),
                method: setter.clone(),
                title: format!("Set {} {}", definition.name, property),
            });
        }
    }

    for (name, def) in &definition.actions {
        methods.push(ObjectMethod {
            kind: MethodKind::Action { name: name.clone() },
            contract: contract.clone(),
            method: def.method.clone(),
            title: if def.title.is_empty() {
                format!("{} {}", name, definition.name)
            } else {
                def.title.clone()
            },
        });
    }

    if let Some(def) = &definition.constructor {
        methods.push(ObjectMethod {
            kind: MethodKind::Constructor,
            contract: contract.clone(),
            method: def.method.clone(),
            title: if def.title.is_empty() {
                format!("Create {}", definition.name)
            } else {
                def.title.clone()
            },
        });
    }

    ObjectMethods {
        model: definition.name.clone(),
        methods,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{widget_definition, MockLedger};
    use serde_json::json;

    #[test]
    fn test_definition_from_json() {
        let def = widget_definition();
        assert_eq!(def.primary_key, "id");
        assert_eq!(def.properties["id"].kind, PropertyType::Integer);
        assert_eq!(def.properties["owner"].kind, PropertyType::Other("address".into()));
        assert!(def.events["Factory"]["Created"].indicates_creation);
        assert_eq!(def.default_enumerator.as_deref(), Some("all"));
    }

    #[test]
    fn test_compile_derives_hooks() {
        let model = CompiledModel::compile(widget_definition()).unwrap();
        assert_eq!(model.name(), "Widget");
        assert_eq!(
            model.creation_hooks,
            vec![HookPattern::new("Factory", "Created", Some("id"))]
        );
        assert_eq!(
            model.update_hooks,
            vec![
                HookPattern::new("Registry", "Touched", None),
                HookPattern::new("Registry", "Updated", Some("id")),
            ]
        );
    }

    #[test]
    fn test_compile_rejects_unindexed_creation_event() {
        let mut def = widget_definition();
        def.events
            .get_mut("Factory")
            .unwrap()
            .get_mut("Created")
            .unwrap()
            .index_field = None;
        let err = CompiledModel::compile(def).unwrap_err();
        assert!(matches!(err, SyncError::InvalidModel { ref model, .. } if model == "Widget"));
    }

    #[test]
    fn test_compile_rejects_malformed_contract_name() {
        let mut def = widget_definition();
        def.events.insert(
            "Bad.Name".to_string(),
            BTreeMap::from([("Moved".to_string(), EventDef {
                indicates_update: true,
                ..EventDef::default()
            })]),
        );
        assert!(matches!(
            CompiledModel::compile(def),
            Err(SyncError::MalformedHook(_))
        ));
    }

    #[test]
    fn test_compile_rejects_missing_getter_and_enumerator() {
        let mut def = widget_definition();
        def.properties.get_mut("owner").unwrap().getter = None;
        assert!(CompiledModel::compile(def).is_err());

        let mut def = widget_definition();
        def.default_enumerator = Some("missing".to_string());
        assert!(CompiledModel::compile(def).is_err());
    }

    #[test]
    fn test_coerce_integer() {
        assert_eq!(coerce_integer(json!("42")), json!(42));
        assert_eq!(coerce_integer(json!("0x10")), json!(16));
        assert_eq!(coerce_integer(json!("-5")), json!(-5));
        assert_eq!(coerce_integer(json!(7)), json!(7));
        assert_eq!(coerce_integer(json!(true)), json!(1));
        assert_eq!(coerce_integer(json!("not a number")), Value::Null);
        assert_eq!(
            coerce_integer(json!("340282366920938463463374607431768211456")),
            json!("340282366920938463463374607431768211456")
        );
    }

    #[test]
    fn test_other_types_pass_through() {
        let kind = PropertyType::Other("string".to_string());
        assert_eq!(coerce_property(&kind, json!("0x10")), json!("0x10"));
    }

    #[tokio::test]
    async fn test_refresh_reads_every_property() {
        let ledger = MockLedger::new(&["Factory", "Registry"]);
        ledger.set_read("Factory", "ownerOf", &[json!(7)], json!("0xaa"));
        ledger.set_read("Factory", "levelOf", &[json!(7)], json!("0x03"));
        let model = CompiledModel::compile(widget_definition()).unwrap();

        let object = refresh_object(&ledger, &model, 7).await.unwrap();
        assert_eq!(object["id"], json!(7));
        assert_eq!(object["owner"], json!("0xaa"));
        assert_eq!(object["level"], json!(3));
        assert_eq!(ledger.read_calls(), 2);
    }

    #[tokio::test]
    async fn test_refresh_fails_whole_object() {
        let ledger = MockLedger::new(&["Factory"]);
        ledger.set_read("Factory", "ownerOf", &[json!(7)], json!("0xaa"));
        let model = CompiledModel::compile(widget_definition()).unwrap();

        let err = refresh_object(&ledger, &model, 7).await.unwrap_err();
        assert!(matches!(err, SyncError::SourceUnavailable { .. }));
        assert!(err.to_string().contains("levelOf"));
    }

    #[tokio::test]
    async fn test_count_objects() {
        let ledger = MockLedger::new(&["Factory"]);
        ledger.set_read("Factory", "totalSupply", &[], json!("12"));
        let model = CompiledModel::compile(widget_definition()).unwrap();
        assert_eq!(count_objects(&ledger, &model).await.unwrap(), 12);

        let mut def = widget_definition();
        def.default_enumerator = None;
        let model = CompiledModel::compile(def).unwrap();
        assert!(matches!(
            count_objects(&ledger, &model).await,
            Err(SyncError::UnknownMethod { kind: "enumerator", .. })
        ));
    }

    #[test]
    fn test_enumeration_range() {
        assert_eq!(enumeration_range(10, 5, 0), 0..5);
        assert_eq!(enumeration_range(10, 5, 8), 8..10);
        assert_eq!(enumeration_range(10, 5, 12).count(), 0);
        assert_eq!(enumeration_range(3, u64::MAX, 1), 1..3);
    }

    #[test]
    fn test_generated_methods() {
        let methods = generate_object_methods(&widget_definition());
        assert_eq!(methods.len(), 3);

        let setter = methods.setter("owner").unwrap();
        assert_eq!(setter.method, "setOwner");
        assert_eq!(setter.contract, "Factory");
        assert_eq!(methods.action("burn").unwrap().title, "Burn widget");
        assert_eq!(methods.constructor().unwrap().method, "mint");
        assert!(methods.setter("level").is_none());
    }

    #[test]
    fn test_prepare_builds_call_args() {
        let methods = generate_object_methods(&widget_definition());

        let (method, args) = methods
            .prepare(MethodCall::Set {
                key: 4,
                property: "owner".into(),
                value: json!("0xbb"),
            })
            .unwrap();
        assert_eq!(method.method, "setOwner");
        assert_eq!(args, vec![json!(4), json!("0xbb")]);

        let (_, args) = methods
            .prepare(MethodCall::Action {
                key: 4,
                name: "burn".into(),
                args: vec![json!(true)],
            })
            .unwrap();
        assert_eq!(args, vec![json!(4), json!(true)]);

        let (method, args) = methods
            .prepare(MethodCall::Construct { args: vec![json!("blue")] })
            .unwrap();
        assert_eq!(method.kind, MethodKind::Constructor);
        assert_eq!(args, vec![json!("blue")]);

        let err = methods
            .prepare(MethodCall::Action {
                key: 4,
                name: "explode".into(),
                args: Vec::new(),
            })
            .unwrap_err();
        assert!(matches!(err, SyncError::UnknownMethod { kind: "action", .. }));
    }
}
