//! D-Bus introspection XML generation for the GATT tree.
//!
//! BlueZ introspects our objects before it registers the application, so
//! the emitted XML must describe exactly the interfaces, methods,
//! properties and signals the dispatcher actually serves.

use std::fmt::Write;

use crate::interface::{Interface, Method, MethodArg, Property, SignalSpec};
use crate::tree::{GattTree, NodeId};

const DOCTYPE: &str = "<!DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\" \"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">\n";

/// Emits the introspection XML for the subtree rooted at `path`.
///
/// Returns `None` if `path` does not address a node in the tree.
pub fn introspection_xml(tree: &GattTree, path: &str) -> Option<String> {
    let id = tree.find_node(path)?;
    let mut xml = String::with_capacity(1024);
    xml.push_str(DOCTYPE);
    write_node(tree, id, None, 0, &mut xml);
    Some(xml)
}

fn write_node(tree: &GattTree, id: NodeId, name: Option<&str>, depth: usize, out: &mut String) {
    let pad = Indent(depth);
    match name {
        Some(name) => writeln!(out, "{pad}<node name=\"{name}\">").unwrap(),
        None => writeln!(out, "{pad}<node>").unwrap(),
    }

    let node = tree.node(id);

    write_introspectable(depth + 1, out);
    if node.interfaces().iter().any(|i| !i.properties().is_empty()) {
        write_properties_interface(depth + 1, out);
    }
    for interface in node.interfaces() {
        write_interface(interface, depth + 1, out);
    }

    for &child in node.children() {
        let child_name = tree.node(child).name().to_string();
        write_node(tree, child, Some(&child_name), depth + 1, out);
    }

    writeln!(out, "{pad}</node>").unwrap();
}

fn write_introspectable(depth: usize, out: &mut String) {
    let pad = Indent(depth);
    let inner = Indent(depth + 1);
    writeln!(
        out,
        "{pad}<interface name=\"org.freedesktop.DBus.Introspectable\">"
    )
    .unwrap();
    writeln!(out, "{inner}<method name=\"Introspect\">").unwrap();
    writeln!(
        out,
        "{}<arg name=\"xml_data\" type=\"s\" direction=\"out\"/>",
        Indent(depth + 2)
    )
    .unwrap();
    writeln!(out, "{inner}</method>").unwrap();
    writeln!(out, "{pad}</interface>").unwrap();
}

fn write_properties_interface(depth: usize, out: &mut String) {
    let pad = Indent(depth);
    let inner = Indent(depth + 1);
    let arg = Indent(depth + 2);
    writeln!(
        out,
        "{pad}<interface name=\"org.freedesktop.DBus.Properties\">"
    )
    .unwrap();

    writeln!(out, "{inner}<method name=\"Get\">").unwrap();
    writeln!(out, "{arg}<arg name=\"interface_name\" type=\"s\" direction=\"in\"/>").unwrap();
    writeln!(out, "{arg}<arg name=\"property_name\" type=\"s\" direction=\"in\"/>").unwrap();
    writeln!(out, "{arg}<arg name=\"value\" type=\"v\" direction=\"out\"/>").unwrap();
    writeln!(out, "{inner}</method>").unwrap();

    writeln!(out, "{inner}<method name=\"GetAll\">").unwrap();
    writeln!(out, "{arg}<arg name=\"interface_name\" type=\"s\" direction=\"in\"/>").unwrap();
    writeln!(out, "{arg}<arg name=\"properties\" type=\"a{{sv}}\" direction=\"out\"/>").unwrap();
    writeln!(out, "{inner}</method>").unwrap();

    writeln!(out, "{inner}<method name=\"Set\">").unwrap();
    writeln!(out, "{arg}<arg name=\"interface_name\" type=\"s\" direction=\"in\"/>").unwrap();
    writeln!(out, "{arg}<arg name=\"property_name\" type=\"s\" direction=\"in\"/>").unwrap();
    writeln!(out, "{arg}<arg name=\"value\" type=\"v\" direction=\"in\"/>").unwrap();
    writeln!(out, "{inner}</method>").unwrap();

    writeln!(out, "{inner}<signal name=\"PropertiesChanged\">").unwrap();
    writeln!(out, "{arg}<arg name=\"interface_name\" type=\"s\"/>").unwrap();
    writeln!(out, "{arg}<arg name=\"changed_properties\" type=\"a{{sv}}\"/>").unwrap();
    writeln!(out, "{arg}<arg name=\"invalidated_properties\" type=\"as\"/>").unwrap();
    writeln!(out, "{inner}</signal>").unwrap();

    writeln!(out, "{pad}</interface>").unwrap();
}

fn write_interface(interface: &Interface, depth: usize, out: &mut String) {
    let pad = Indent(depth);
    writeln!(out, "{pad}<interface name=\"{}\">", interface.name()).unwrap();
    for method in interface.methods() {
        write_method(method, depth + 1, out);
    }
    for signal in interface.signals() {
        write_signal(signal, depth + 1, out);
    }
    for property in interface.properties() {
        write_property(property, depth + 1, out);
    }
    writeln!(out, "{pad}</interface>").unwrap();
}

fn write_method(method: &Method, depth: usize, out: &mut String) {
    let pad = Indent(depth);
    if method.in_args.is_empty() && method.out_args.is_empty() {
        writeln!(out, "{pad}<method name=\"{}\"/>", method.name).unwrap();
        return;
    }

    writeln!(out, "{pad}<method name=\"{}\">", method.name).unwrap();
    for arg in method.in_args {
        write_arg(arg, Some("in"), depth + 1, out);
    }
    for arg in method.out_args {
        write_arg(arg, Some("out"), depth + 1, out);
    }
    writeln!(out, "{pad}</method>").unwrap();
}

fn write_signal(signal: &SignalSpec, depth: usize, out: &mut String) {
    let pad = Indent(depth);
    writeln!(out, "{pad}<signal name=\"{}\">", signal.name).unwrap();
    for arg in signal.args {
        write_arg(arg, None, depth + 1, out);
    }
    writeln!(out, "{pad}</signal>").unwrap();
}

fn write_arg(arg: &MethodArg, direction: Option<&str>, depth: usize, out: &mut String) {
    let pad = Indent(depth);
    match direction {
        Some(direction) => writeln!(
            out,
            "{pad}<arg name=\"{}\" type=\"{}\" direction=\"{direction}\"/>",
            arg.name, arg.signature
        )
        .unwrap(),
        None => writeln!(
            out,
            "{pad}<arg name=\"{}\" type=\"{}\"/>",
            arg.name, arg.signature
        )
        .unwrap(),
    }
}

fn write_property(property: &Property, depth: usize, out: &mut String) {
    let pad = Indent(depth);
    let access = match (property.read, property.write) {
        (true, true) => "readwrite",
        (true, false) => "read",
        (false, true) => "write",
        (false, false) => "read",
    };
    writeln!(
        out,
        "{pad}<property name=\"{}\" type=\"{}\" access=\"{access}\"/>",
        property.name, property.signature
    )
    .unwrap();
}

struct Indent(usize);

impl std::fmt::Display for Indent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for _ in 0..self.0 {
            f.write_str("  ")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use crate::interface::{CharFlags, HandlerSlots, UpdateContext};
    use crate::uuid::GattUuid;

    fn sample_tree() -> GattTree {
        let mut tree = GattTree::new("/com/bzperi".parse().unwrap());
        let root = tree.root();
        let service = tree.add_child(root, "battery").unwrap();
        tree.add_interface(service, Interface::gatt_service(GattUuid::from_u16(0x180F), true))
            .unwrap();
        let chr = tree.add_child(service, "level").unwrap();
        tree.add_interface(
            chr,
            Interface::gatt_characteristic(
                GattUuid::from_u16(0x2A19),
                service,
                CharFlags::READ | CharFlags::NOTIFY,
                HandlerSlots {
                    on_updated: Some(Arc::new(|_: &UpdateContext<'_>| None)),
                    ..Default::default()
                },
            ),
        )
        .unwrap();
        tree
    }

    #[test]
    fn root_xml_nests_the_full_subtree() {
        let tree = sample_tree();
        let xml = introspection_xml(&tree, "/com/bzperi").unwrap();

        assert!(xml.starts_with("<!DOCTYPE node"));
        assert!(xml.contains("<interface name=\"org.freedesktop.DBus.ObjectManager\">"));
        assert!(xml.contains("<method name=\"GetManagedObjects\">"));
        assert!(xml.contains("<node name=\"battery\">"));
        assert!(xml.contains("<node name=\"level\">"));
        assert!(xml.contains("<interface name=\"org.bluez.GattService1\">"));
        assert!(xml.contains("<property name=\"UUID\" type=\"s\" access=\"read\"/>"));

        // Balanced node elements: root + battery + level.
        assert_eq!(xml.matches("<node").count(), 3);
        assert_eq!(xml.matches("</node>").count(), 3);
    }

    #[test]
    fn characteristic_xml_describes_the_gatt_surface() {
        let tree = sample_tree();
        let xml = introspection_xml(&tree, "/com/bzperi/battery/level").unwrap();

        assert!(xml.contains("<interface name=\"org.bluez.GattCharacteristic1\">"));
        assert!(xml.contains("<method name=\"ReadValue\">"));
        assert!(xml.contains("<arg name=\"value\" type=\"ay\" direction=\"out\"/>"));
        assert!(xml.contains("<method name=\"StartNotify\"/>"));
        assert!(xml.contains("<property name=\"Service\" type=\"o\" access=\"read\"/>"));
        assert!(xml.contains("<property name=\"Flags\" type=\"as\" access=\"read\"/>"));
        // The object-manager interface belongs to the root only.
        assert!(!xml.contains("ObjectManager"));
    }

    #[test]
    fn unknown_paths_produce_no_xml() {
        let tree = sample_tree();
        assert!(introspection_xml(&tree, "/org/elsewhere").is_none());
    }
}
