//! Declarative interface descriptions
//!
//! An [`Interface`] declares the methods, properties and signals an
//! exported object offers under one interface name. Members carry an
//! implementation id and, optionally, a different declared wire name; only
//! the declared name is visible on the bus. Disabled members behave as if
//! they were never declared.

use crate::error::{fault, Error, Result};
use dbus_wire::{
    validate_error_name, validate_interface_name, validate_member_name, Signature, Type, Value,
};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// A handler failure that maps to an ERROR reply
#[derive(Debug, Clone)]
pub struct CallError {
    pub name: String,
    pub message: String,
}

impl CallError {
    /// A typed error with a reverse-DNS name; falls back to
    /// `org.freedesktop.DBus.Error.Failed` if the name is malformed.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        let name = name.into();
        let name = if validate_error_name(&name).is_ok() {
            name
        } else {
            fault::FAILED.to_string()
        };
        Self {
            name,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(fault::FAILED, message)
    }

    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::new(fault::INVALID_ARGS, message)
    }
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

/// What a method handler returns
pub type MethodResult = std::result::Result<Vec<Value>, CallError>;

/// Boxed async method handler
pub type MethodHandler =
    Arc<dyn Fn(Vec<Value>) -> Pin<Box<dyn Future<Output = MethodResult> + Send>> + Send + Sync>;

/// Property read accessor
pub type PropertyGetter =
    Arc<dyn Fn() -> std::result::Result<Value, CallError> + Send + Sync>;

/// Property write accessor
pub type PropertySetter =
    Arc<dyn Fn(Value) -> std::result::Result<(), CallError> + Send + Sync>;

/// Property access mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    pub fn readable(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    pub fn writable(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::ReadWrite => "readwrite",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "read" => Some(Self::Read),
            "write" => Some(Self::Write),
            "readwrite" => Some(Self::ReadWrite),
            _ => None,
        }
    }
}

/// `org.freedesktop.DBus.Property.EmitsChangedSignal` modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmitsChanged {
    /// Changes emit `PropertiesChanged` with the new value
    #[default]
    True,
    /// Changes emit with the property in the invalidated list only
    Invalidates,
    /// The value never changes once exported
    Const,
    /// Changes never emit
    False,
}

impl EmitsChanged {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::True => "true",
            Self::Invalidates => "invalidates",
            Self::Const => "const",
            Self::False => "false",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "true" => Some(Self::True),
            "invalidates" => Some(Self::Invalidates),
            "const" => Some(Self::Const),
            "false" => Some(Self::False),
            _ => None,
        }
    }
}

/// A declared method
pub struct Method {
    id: String,
    name: String,
    pub in_sig: Signature,
    pub out_sig: Signature,
    pub handler: MethodHandler,
    pub disabled: bool,
}

impl Method {
    /// Declare a method. `id` is the implementation identifier and the
    /// default wire name; rename with [`Method::named`].
    pub fn new<F, Fut>(id: &str, in_sig: &str, out_sig: &str, handler: F) -> Result<Self>
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MethodResult> + Send + 'static,
    {
        validate_member_name(id)?;
        Ok(Self {
            id: id.to_string(),
            name: id.to_string(),
            in_sig: Signature::parse(in_sig)?,
            out_sig: Signature::parse(out_sig)?,
            handler: Arc::new(move |args| Box::pin(handler(args))),
            disabled: false,
        })
    }

    /// Declare a different wire name for this method
    pub fn named(mut self, name: &str) -> Result<Self> {
        validate_member_name(name)?;
        self.name = name.to_string();
        Ok(self)
    }

    pub fn disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    /// The name visible on the wire and in introspection
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("in_sig", &self.in_sig.to_string())
            .field("out_sig", &self.out_sig.to_string())
            .field("disabled", &self.disabled)
            .finish()
    }
}

/// A declared property
pub struct Property {
    id: String,
    name: String,
    pub ty: Type,
    pub access: Access,
    pub getter: Option<PropertyGetter>,
    pub setter: Option<PropertySetter>,
    pub emits_changed: EmitsChanged,
    pub disabled: bool,
}

impl Property {
    pub fn new(id: &str, signature: &str, access: Access) -> Result<Self> {
        validate_member_name(id)?;
        Ok(Self {
            id: id.to_string(),
            name: id.to_string(),
            ty: Signature::parse_single(signature)?,
            access,
            getter: None,
            setter: None,
            emits_changed: EmitsChanged::default(),
            disabled: false,
        })
    }

    /// Shorthand for a read-only property backed by `getter`
    pub fn read<F>(id: &str, signature: &str, getter: F) -> Result<Self>
    where
        F: Fn() -> std::result::Result<Value, CallError> + Send + Sync + 'static,
    {
        Ok(Self::new(id, signature, Access::Read)?.with_getter(getter))
    }

    pub fn with_getter<F>(mut self, getter: F) -> Self
    where
        F: Fn() -> std::result::Result<Value, CallError> + Send + Sync + 'static,
    {
        self.getter = Some(Arc::new(getter));
        self
    }

    pub fn with_setter<F>(mut self, setter: F) -> Self
    where
        F: Fn(Value) -> std::result::Result<(), CallError> + Send + Sync + 'static,
    {
        self.setter = Some(Arc::new(setter));
        self
    }

    pub fn named(mut self, name: &str) -> Result<Self> {
        validate_member_name(name)?;
        self.name = name.to_string();
        Ok(self)
    }

    pub fn disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    pub fn emits_changed(mut self, mode: EmitsChanged) -> Self {
        self.emits_changed = mode;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl std::fmt::Debug for Property {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Property")
            .field("name", &self.name)
            .field("type", &self.ty.to_string())
            .field("access", &self.access)
            .field("disabled", &self.disabled)
            .finish()
    }
}

/// A declared signal
#[derive(Debug, Clone)]
pub struct SignalSpec {
    id: String,
    name: String,
    pub sig: Signature,
    pub disabled: bool,
}

impl SignalSpec {
    pub fn new(id: &str, signature: &str) -> Result<Self> {
        validate_member_name(id)?;
        Ok(Self {
            id: id.to_string(),
            name: id.to_string(),
            sig: Signature::parse(signature)?,
            disabled: false,
        })
    }

    pub fn named(mut self, name: &str) -> Result<Self> {
        validate_member_name(name)?;
        self.name = name.to_string();
        Ok(self)
    }

    pub fn disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

/// A named group of methods, properties and signals
pub struct Interface {
    name: String,
    methods: Vec<Method>,
    properties: Vec<Property>,
    signals: Vec<SignalSpec>,
}

impl Interface {
    pub fn builder(name: &str) -> Result<InterfaceBuilder> {
        validate_interface_name(name)?;
        Ok(InterfaceBuilder {
            interface: Interface {
                name: name.to_string(),
                methods: Vec::new(),
                properties: Vec::new(),
                signals: Vec::new(),
            },
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enabled methods, in declaration order
    pub fn methods(&self) -> impl Iterator<Item = &Method> {
        self.methods.iter().filter(|m| !m.disabled)
    }

    /// Enabled properties, in declaration order
    pub fn properties(&self) -> impl Iterator<Item = &Property> {
        self.properties.iter().filter(|p| !p.disabled)
    }

    /// Enabled signals, in declaration order
    pub fn signals(&self) -> impl Iterator<Item = &SignalSpec> {
        self.signals.iter().filter(|s| !s.disabled)
    }

    /// Look up an enabled method by wire name
    pub fn method(&self, name: &str) -> Option<&Method> {
        self.methods().find(|m| m.name == name)
    }

    /// Look up an enabled property by wire name
    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties().find(|p| p.name == name)
    }

    /// Look up an enabled signal by implementation id or wire name
    pub fn signal(&self, id_or_name: &str) -> Option<&SignalSpec> {
        self.signals()
            .find(|s| s.id == id_or_name)
            .or_else(|| self.signals().find(|s| s.name == id_or_name))
    }
}

impl std::fmt::Debug for Interface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interface")
            .field("name", &self.name)
            .field("methods", &self.methods)
            .field("properties", &self.properties)
            .field("signals", &self.signals)
            .finish()
    }
}

/// Fluent builder for [`Interface`]
pub struct InterfaceBuilder {
    interface: Interface,
}

impl InterfaceBuilder {
    pub fn method(mut self, method: Method) -> Self {
        self.interface.methods.push(method);
        self
    }

    pub fn property(mut self, property: Property) -> Self {
        self.interface.properties.push(property);
        self
    }

    pub fn signal(mut self, signal: SignalSpec) -> Self {
        self.interface.signals.push(signal);
        self
    }

    /// Finish, rejecting duplicate declared names within a member kind
    pub fn build(self) -> Result<Interface> {
        let iface = self.interface;
        let dup = |kind: &str, name: &str| {
            Error::Declaration(format!(
                "duplicate {} {:?} on interface {}",
                kind, name, iface.name
            ))
        };
        let mut seen = std::collections::HashSet::new();
        for m in &iface.methods {
            if !seen.insert(m.name.clone()) {
                return Err(dup("method", &m.name));
            }
        }
        seen.clear();
        for p in &iface.properties {
            if !seen.insert(p.name.clone()) {
                return Err(dup("property", &p.name));
            }
        }
        seen.clear();
        for s in &iface.signals {
            if !seen.insert(s.name.clone()) {
                return Err(dup("signal", &s.name));
            }
        }
        Ok(iface)
    }
}
