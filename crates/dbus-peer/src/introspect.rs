//! Introspection XML: generation for exported objects, parsing for proxies
//!
//! Only the subset of the D-Bus introspection DTD that the object model
//! uses is understood: `node`, `interface`, `method`, `arg`, `property`,
//! `signal` and `annotation`.

use crate::error::{Error, Result};
use crate::interface::{Access, EmitsChanged, Interface};
use dbus_wire::{Signature, Type};
use std::io::Cursor;
use xml::reader::{EventReader, XmlEvent};

/// Annotation that controls `PropertiesChanged` emission
pub const EMITS_CHANGED_ANNOTATION: &str = "org.freedesktop.DBus.Property.EmitsChangedSignal";

const DOCTYPE: &str = "<!DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\"\n \"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">\n";

const INTROSPECTABLE_XML: &str = "  <interface name=\"org.freedesktop.DBus.Introspectable\">\n    <method name=\"Introspect\">\n      <arg type=\"s\" direction=\"out\"/>\n    </method>\n  </interface>\n";

const PEER_XML: &str = "  <interface name=\"org.freedesktop.DBus.Peer\">\n    <method name=\"Ping\"/>\n    <method name=\"GetMachineId\">\n      <arg type=\"s\" direction=\"out\"/>\n    </method>\n  </interface>\n";

const PROPERTIES_XML: &str = "  <interface name=\"org.freedesktop.DBus.Properties\">\n    <method name=\"Get\">\n      <arg type=\"s\" direction=\"in\"/>\n      <arg type=\"s\" direction=\"in\"/>\n      <arg type=\"v\" direction=\"out\"/>\n    </method>\n    <method name=\"Set\">\n      <arg type=\"s\" direction=\"in\"/>\n      <arg type=\"s\" direction=\"in\"/>\n      <arg type=\"v\" direction=\"in\"/>\n    </method>\n    <method name=\"GetAll\">\n      <arg type=\"s\" direction=\"in\"/>\n      <arg type=\"a{sv}\" direction=\"out\"/>\n    </method>\n    <signal name=\"PropertiesChanged\">\n      <arg type=\"s\"/>\n      <arg type=\"a{sv}\"/>\n      <arg type=\"as\"/>\n    </signal>\n  </interface>\n";

const OBJECT_MANAGER_XML: &str = "  <interface name=\"org.freedesktop.DBus.ObjectManager\">\n    <method name=\"GetManagedObjects\">\n      <arg type=\"a{oa{sa{sv}}}\" direction=\"out\"/>\n    </method>\n    <signal name=\"InterfacesAdded\">\n      <arg type=\"o\"/>\n      <arg type=\"a{sa{sv}}\"/>\n    </signal>\n    <signal name=\"InterfacesRemoved\">\n      <arg type=\"o\"/>\n      <arg type=\"as\"/>\n    </signal>\n  </interface>\n";

fn escape(s: &str, out: &mut String) {
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
}

fn write_args(out: &mut String, sig: &Signature, direction: Option<&str>) {
    for ty in sig.types() {
        out.push_str("      <arg type=\"");
        escape(&ty.to_string(), out);
        out.push('"');
        if let Some(dir) = direction {
            out.push_str(" direction=\"");
            out.push_str(dir);
            out.push('"');
        }
        out.push_str("/>\n");
    }
}

fn write_interface(out: &mut String, iface: &Interface) {
    out.push_str("  <interface name=\"");
    escape(iface.name(), out);
    out.push_str("\">\n");
    for method in iface.methods() {
        out.push_str("    <method name=\"");
        escape(method.name(), out);
        if method.in_sig.is_empty() && method.out_sig.is_empty() {
            out.push_str("\"/>\n");
            continue;
        }
        out.push_str("\">\n");
        write_args(out, &method.in_sig, Some("in"));
        write_args(out, &method.out_sig, Some("out"));
        out.push_str("    </method>\n");
    }
    for property in iface.properties() {
        out.push_str("    <property name=\"");
        escape(property.name(), out);
        out.push_str("\" type=\"");
        escape(&property.ty.to_string(), out);
        out.push_str("\" access=\"");
        out.push_str(property.access.as_str());
        if property.emits_changed == EmitsChanged::True {
            out.push_str("\"/>\n");
        } else {
            out.push_str("\">\n      <annotation name=\"");
            out.push_str(EMITS_CHANGED_ANNOTATION);
            out.push_str("\" value=\"");
            out.push_str(property.emits_changed.as_str());
            out.push_str("\"/>\n    </property>\n");
        }
    }
    for signal in iface.signals() {
        out.push_str("    <signal name=\"");
        escape(signal.name(), out);
        if signal.sig.is_empty() {
            out.push_str("\"/>\n");
            continue;
        }
        out.push_str("\">\n");
        write_args(out, &signal.sig, None);
        out.push_str("    </signal>\n");
    }
    out.push_str("  </interface>\n");
}

/// Render the introspection document for one exported node
pub fn generate(
    interfaces: &[&Interface],
    has_object_manager: bool,
    children: &[String],
) -> String {
    let mut out = String::with_capacity(1024);
    out.push_str(DOCTYPE);
    out.push_str("<node>\n");
    for iface in interfaces {
        write_interface(&mut out, iface);
    }
    out.push_str(INTROSPECTABLE_XML);
    out.push_str(PEER_XML);
    out.push_str(PROPERTIES_XML);
    if has_object_manager {
        out.push_str(OBJECT_MANAGER_XML);
    }
    for child in children {
        out.push_str("  <node name=\"");
        escape(child, &mut out);
        out.push_str("\"/>\n");
    }
    out.push_str("</node>\n");
    out
}

/// A parsed introspection document
#[derive(Debug, Clone, Default)]
pub struct Node {
    pub interfaces: Vec<InterfaceInfo>,
    pub children: Vec<String>,
}

impl Node {
    pub fn interface(&self, name: &str) -> Option<&InterfaceInfo> {
        self.interfaces.iter().find(|i| i.name == name)
    }
}

#[derive(Debug, Clone)]
pub struct InterfaceInfo {
    pub name: String,
    pub methods: Vec<MethodInfo>,
    pub properties: Vec<PropertyInfo>,
    pub signals: Vec<SignalInfo>,
}

impl InterfaceInfo {
    pub fn method(&self, name: &str) -> Option<&MethodInfo> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn property(&self, name: &str) -> Option<&PropertyInfo> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn signal(&self, name: &str) -> Option<&SignalInfo> {
        self.signals.iter().find(|s| s.name == name)
    }
}

#[derive(Debug, Clone)]
pub struct MethodInfo {
    pub name: String,
    pub in_sig: Signature,
    pub out_sig: Signature,
}

#[derive(Debug, Clone)]
pub struct PropertyInfo {
    pub name: String,
    pub ty: Type,
    pub access: Access,
    pub emits_changed: EmitsChanged,
}

#[derive(Debug, Clone)]
pub struct SignalInfo {
    pub name: String,
    pub sig: Signature,
}

fn find_attr(
    attributes: &[xml::attribute::OwnedAttribute],
    name: &str,
) -> Option<String> {
    attributes
        .iter()
        .find(|a| a.name.local_name == name)
        .map(|a| a.value.clone())
}

/// Parse an introspection document
pub fn parse(data: &str) -> Result<Node> {
    let bad = |what: &str| Error::Introspection(what.to_string());

    let mut node = Node::default();
    let mut node_depth = 0usize;
    let mut cur_iface: Option<InterfaceInfo> = None;
    let mut cur_method: Option<MethodInfo> = None;
    let mut cur_signal: Option<SignalInfo> = None;
    let mut cur_property: Option<PropertyInfo> = None;

    let parser = EventReader::new(Cursor::new(data));
    for event in parser {
        let event = event.map_err(|e| Error::Introspection(e.to_string()))?;
        match event {
            XmlEvent::StartElement {
                name, attributes, ..
            } => match name.local_name.as_str() {
                "node" => {
                    node_depth += 1;
                    if node_depth == 2 {
                        if let Some(child) = find_attr(&attributes, "name") {
                            node.children.push(child);
                        }
                    }
                }
                "interface" if node_depth == 1 => {
                    if cur_iface.is_some() {
                        return Err(bad("nested interface element"));
                    }
                    cur_iface = Some(InterfaceInfo {
                        name: find_attr(&attributes, "name")
                            .ok_or_else(|| bad("interface without name"))?,
                        methods: Vec::new(),
                        properties: Vec::new(),
                        signals: Vec::new(),
                    });
                }
                "method" if cur_iface.is_some() => {
                    cur_method = Some(MethodInfo {
                        name: find_attr(&attributes, "name")
                            .ok_or_else(|| bad("method without name"))?,
                        in_sig: Signature::empty(),
                        out_sig: Signature::empty(),
                    });
                }
                "signal" if cur_iface.is_some() => {
                    cur_signal = Some(SignalInfo {
                        name: find_attr(&attributes, "name")
                            .ok_or_else(|| bad("signal without name"))?,
                        sig: Signature::empty(),
                    });
                }
                "property" if cur_iface.is_some() => {
                    let ty_attr = find_attr(&attributes, "type")
                        .ok_or_else(|| bad("property without type"))?;
                    let access_attr = find_attr(&attributes, "access")
                        .ok_or_else(|| bad("property without access"))?;
                    cur_property = Some(PropertyInfo {
                        name: find_attr(&attributes, "name")
                            .ok_or_else(|| bad("property without name"))?,
                        ty: Signature::parse_single(&ty_attr)?,
                        access: Access::from_str(&access_attr)
                            .ok_or_else(|| bad("unknown property access"))?,
                        emits_changed: EmitsChanged::True,
                    });
                }
                "arg" => {
                    let ty_attr = find_attr(&attributes, "type")
                        .ok_or_else(|| bad("arg without type"))?;
                    let ty = Signature::parse_single(&ty_attr)?;
                    if let Some(method) = cur_method.as_mut() {
                        let direction = find_attr(&attributes, "direction");
                        match direction.as_deref() {
                            Some("out") => method.out_sig.push(ty),
                            // Method args default to "in"
                            _ => method.in_sig.push(ty),
                        }
                    } else if let Some(signal) = cur_signal.as_mut() {
                        signal.sig.push(ty);
                    }
                }
                "annotation" => {
                    if let Some(property) = cur_property.as_mut() {
                        if find_attr(&attributes, "name").as_deref()
                            == Some(EMITS_CHANGED_ANNOTATION)
                        {
                            if let Some(mode) = find_attr(&attributes, "value")
                                .as_deref()
                                .and_then(EmitsChanged::from_str)
                            {
                                property.emits_changed = mode;
                            }
                        }
                    }
                }
                _ => {}
            },
            XmlEvent::EndElement { name } => match name.local_name.as_str() {
                "node" => {
                    node_depth = node_depth.saturating_sub(1);
                }
                "interface" => {
                    if let Some(iface) = cur_iface.take() {
                        node.interfaces.push(iface);
                    }
                }
                "method" => {
                    if let (Some(method), Some(iface)) = (cur_method.take(), cur_iface.as_mut()) {
                        iface.methods.push(method);
                    }
                }
                "signal" => {
                    if let (Some(signal), Some(iface)) = (cur_signal.take(), cur_iface.as_mut()) {
                        iface.signals.push(signal);
                    }
                }
                "property" => {
                    if let (Some(property), Some(iface)) =
                        (cur_property.take(), cur_iface.as_mut())
                    {
                        iface.properties.push(property);
                    }
                }
                _ => {}
            },
            _ => {}
        }
    }

    if node_depth != 0 {
        return Err(bad("unbalanced node elements"));
    }
    Ok(node)
}
