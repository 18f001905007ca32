//! The in-memory GATT object tree.
//!
//! The tree is an arena: nodes live in a `Vec` and refer to each other by
//! stable [`NodeId`] indices. Back-references (a characteristic's `Service`
//! property, a descriptor's `Characteristic` property) are stored as node
//! ids and resolved to fully-qualified object paths at emission time.
//!
//! The tree is pure data with no bus I/O. It is mutable while configurators
//! run and frozen (shared behind an `Arc`) once registration starts.

use std::collections::HashMap;

use zbus::zvariant::{Array, ObjectPath, OwnedObjectPath, OwnedValue, Value};

use crate::error::{Error, Result};
use crate::interface::{
    DataAccess, Interface, InterfaceKind, Invocation, MethodCall, PropValue, Property,
};
use crate::path::NodePath;
use crate::uuid::GattUuid;

/// A stable index into the tree arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    pub(crate) fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

/// A tree node: one D-Bus object path with its interfaces and children.
pub struct Node {
    name: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    interfaces: Vec<Interface>,
    published: bool,
}

impl Node {
    /// The path element naming this node below its parent. Empty for the
    /// root.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    /// Whether this node contributes to `GetManagedObjects`. The root
    /// (object-manager) node and the advertisement node are unpublished.
    pub fn published(&self) -> bool {
        self.published
    }

    pub fn find_interface(&self, name: &str) -> Option<&Interface> {
        self.interfaces.iter().find(|i| i.name() == name)
    }
}

/// The mapping returned by `GetManagedObjects`:
/// object path → interface name → property name → value.
pub type ManagedObjects = HashMap<OwnedObjectPath, HashMap<String, HashMap<String, OwnedValue>>>;

/// The GATT object tree rooted at the server's derived root path.
pub struct GattTree {
    nodes: Vec<Node>,
    root_path: NodePath,
}

impl GattTree {
    /// Creates a tree whose root carries the object-manager interface.
    ///
    /// The root is unpublished: it answers `GetManagedObjects` but is not
    /// itself listed in the result.
    pub fn new(root_path: NodePath) -> Self {
        let root = Node {
            name: String::new(),
            parent: None,
            children: Vec::new(),
            interfaces: vec![Interface::object_manager()],
            published: false,
        };
        Self {
            nodes: vec![root],
            root_path,
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn root_path(&self) -> &NodePath {
        &self.root_path
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    /// Appends a child with a unique name under `parent`.
    pub fn add_child(&mut self, parent: NodeId, name: &str) -> Result<NodeId> {
        // Validates the segment as a side effect.
        let child_path = self.node_path(parent).append(name)?;

        let duplicate = self.nodes[parent.index()]
            .children
            .iter()
            .any(|&c| self.nodes[c.index()].name == name);
        if duplicate {
            return Err(Error::DuplicatePath(child_path.to_string()));
        }

        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            name: name.to_string(),
            parent: Some(parent),
            children: Vec::new(),
            interfaces: Vec::new(),
            published: true,
        });
        self.nodes[parent.index()].children.push(id);
        Ok(id)
    }

    /// Attaches an interface to a node. A node holds at most one interface
    /// of each kind.
    pub fn add_interface(&mut self, id: NodeId, interface: Interface) -> Result<()> {
        let node = &mut self.nodes[id.index()];
        if node
            .interfaces
            .iter()
            .any(|i| i.kind().tag() == interface.kind().tag())
        {
            return Err(Error::AlreadyExists(format!(
                "node already holds a {:?} interface",
                interface.kind().tag()
            )));
        }
        node.interfaces.push(interface);
        Ok(())
    }

    pub fn set_published(&mut self, id: NodeId, published: bool) {
        self.nodes[id.index()].published = published;
    }

    /// Returns the fully-qualified object path of a node.
    pub fn node_path(&self, id: NodeId) -> NodePath {
        let mut segments = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let node = &self.nodes[current.index()];
            if node.parent.is_some() {
                segments.push(node.name.as_str());
            }
            cursor = node.parent;
        }
        segments.reverse();

        let mut path = self.root_path.clone();
        for segment in segments {
            // Segments were validated when the nodes were added.
            path = path
                .append(segment)
                .expect("tree segment no longer a valid path element");
        }
        path
    }

    /// Locates the node at an absolute object path.
    pub fn find_node(&self, path: &str) -> Option<NodeId> {
        if path == self.root_path.as_str() {
            return Some(self.root());
        }

        let rest = path
            .strip_prefix(self.root_path.as_str())?
            .strip_prefix('/')?;
        let mut cursor = self.root();
        'segment: for segment in rest.split('/') {
            for &child in &self.nodes[cursor.index()].children {
                if self.nodes[child.index()].name == segment {
                    cursor = child;
                    continue 'segment;
                }
            }
            return None;
        }
        Some(cursor)
    }

    /// Looks up an interface by path and name.
    pub fn find_interface(&self, path: &str, interface: &str) -> Option<&Interface> {
        self.node(self.find_node(path)?).find_interface(interface)
    }

    /// Looks up a property descriptor by path, interface and name.
    pub fn find_property(&self, path: &str, interface: &str, name: &str) -> Option<&Property> {
        self.find_interface(path, interface)?.find_property(name)
    }

    /// Invokes the handler of the addressed method.
    ///
    /// Returns `true` iff a handler was invoked; the handler is responsible
    /// for completing the invocation through `inv`. Methods without a
    /// handler (`GetManagedObjects`) are the publisher's job and return
    /// `false` here.
    pub fn call_method(
        &self,
        path: &str,
        interface: &str,
        member: &str,
        msg: &zbus::Message,
        data: &DataAccess,
        inv: &mut Invocation,
    ) -> bool {
        let Some(iface) = self.find_interface(path, interface) else {
            return false;
        };
        let Some(method) = iface.find_method(member) else {
            return false;
        };
        let Some(handler) = &method.handler else {
            return false;
        };

        let call = MethodCall {
            path,
            interface,
            member,
            msg,
            data,
        };
        handler(&call, inv);
        true
    }

    /// Resolves a property descriptor to its current wire value.
    ///
    /// Returns `None` for a cached-bytes property with no cached value yet
    /// (the optional `Value` of a never-read characteristic).
    pub fn property_value(&self, property: &Property) -> Option<OwnedValue> {
        let value: Value<'static> = match &property.value {
            PropValue::Uuid(uuid) => Value::from(uuid.to_string()),
            PropValue::Bool(b) => Value::from(*b),
            PropValue::Str(s) => Value::from(s.clone()),
            PropValue::StrList(items) => Value::Array(Array::from(items.clone())),
            PropValue::BackRef(id) => {
                let path = self.node_path(*id).to_string();
                Value::from(ObjectPath::from_string_unchecked(path))
            }
            PropValue::CachedBytes(cache) => {
                let bytes = cache.lock().clone()?;
                Value::Array(Array::from(bytes))
            }
        };
        Some(OwnedValue::from(value))
    }

    /// Returns all current property values of an interface.
    pub fn interface_properties(&self, interface: &Interface) -> HashMap<String, OwnedValue> {
        let mut props = HashMap::new();
        for property in interface.properties() {
            if let Some(value) = self.property_value(property) {
                props.insert(property.name.to_string(), value);
            }
        }
        props
    }

    /// Assembles the `GetManagedObjects` result: every published node in
    /// stable pre-order, with back-references resolved to object paths.
    pub fn managed_objects(&self) -> ManagedObjects {
        let mut objects = ManagedObjects::new();
        for id in self.preorder() {
            let node = self.node(id);
            if !node.published() || node.interfaces().is_empty() {
                continue;
            }

            let mut interfaces = HashMap::new();
            for interface in node.interfaces() {
                interfaces.insert(
                    interface.name().to_string(),
                    self.interface_properties(interface),
                );
            }
            objects.insert(self.node_path(id).to_object_path(), interfaces);
        }
        objects
    }

    /// Returns all node ids in stable pre-order (parents before children,
    /// siblings in insertion order).
    pub fn preorder(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root()];
        while let Some(id) = stack.pop() {
            order.push(id);
            for &child in self.nodes[id.index()].children.iter().rev() {
                stack.push(child);
            }
        }
        order
    }

    /// Collects the UUIDs of all GATT services in the tree, in pre-order.
    pub fn service_uuids(&self) -> Vec<GattUuid> {
        let mut uuids = Vec::new();
        for id in self.preorder() {
            for interface in self.node(id).interfaces() {
                if let InterfaceKind::Service(state) = interface.kind() {
                    uuids.push(state.uuid);
                }
            }
        }
        uuids
    }

    /// Checks the notification invariant: every characteristic or
    /// descriptor carrying `notify`/`indicate` must have an update handler
    /// for the dispatcher to invoke.
    pub fn validate_update_handlers(&self) -> Result<()> {
        for id in self.preorder() {
            for interface in self.node(id).interfaces() {
                let (flags, has_handler) = match interface.kind() {
                    InterfaceKind::Characteristic(c) => {
                        (c.flags, c.handlers.on_updated.is_some())
                    }
                    InterfaceKind::Descriptor(d) => (d.flags, d.handlers.on_updated.is_some()),
                    _ => continue,
                };
                if flags.intersects(crate::interface::CharFlags::NOTIFIABLE) && !has_handler {
                    return Err(Error::InvalidArgument(format!(
                        "{} declares notify/indicate but has no update handler",
                        self.node_path(id)
                    )));
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for GattTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GattTree")
            .field("root_path", &self.root_path)
            .field("nodes", &self.nodes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::interface::{CharFlags, HandlerSlots, UpdateContext};

    use std::sync::Arc;

    fn tree() -> GattTree {
        GattTree::new("/com/bzperi".parse().unwrap())
    }

    fn noop_updated() -> HandlerSlots {
        HandlerSlots {
            on_updated: Some(Arc::new(|_: &UpdateContext<'_>| None)),
            ..Default::default()
        }
    }

    #[test]
    fn duplicate_children_are_rejected() {
        let mut tree = tree();
        let root = tree.root();
        tree.add_child(root, "battery").unwrap();
        let err = tree.add_child(root, "battery").unwrap_err();
        assert!(matches!(err, Error::DuplicatePath(p) if p == "/com/bzperi/battery"));
    }

    #[test]
    fn node_paths_compose_from_segments() {
        let mut tree = tree();
        let root = tree.root();
        let service = tree.add_child(root, "device_info").unwrap();
        let chr = tree.add_child(service, "mfgr_name").unwrap();
        assert_eq!(
            tree.node_path(chr).as_str(),
            "/com/bzperi/device_info/mfgr_name"
        );
        assert_eq!(tree.find_node("/com/bzperi/device_info/mfgr_name"), Some(chr));
        assert_eq!(tree.find_node("/com/bzperi/device_info"), Some(service));
        assert_eq!(tree.find_node("/com/bzperi"), Some(root));
        assert_eq!(tree.find_node("/com/bzperi/nope"), None);
        assert_eq!(tree.find_node("/org/bluez"), None);
    }

    #[test]
    fn one_interface_per_kind_per_node() {
        let mut tree = tree();
        let root = tree.root();
        let service = tree.add_child(root, "battery").unwrap();
        tree.add_interface(service, Interface::gatt_service(GattUuid::from_u16(0x180F), true))
            .unwrap();
        let err = tree
            .add_interface(service, Interface::gatt_service(GattUuid::from_u16(0x180A), true))
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[test]
    fn managed_objects_resolves_back_references() {
        let mut tree = tree();
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
                noop_updated(),
            ),
        )
        .unwrap();

        let objects = tree.managed_objects();
        // The unpublished root is elided.
        assert_eq!(objects.len(), 2);

        let chr_path = OwnedObjectPath::try_from("/com/bzperi/battery/level").unwrap();
        let ifaces = &objects[&chr_path];
        let props = &ifaces["org.bluez.GattCharacteristic1"];
        let uuid = String::try_from(props["UUID"].clone()).unwrap();
        assert_eq!(uuid, "00002A19-0000-1000-8000-00805F9B34FB");

        let service_ref = OwnedObjectPath::try_from(props["Service"].clone()).unwrap();
        assert_eq!(service_ref.as_str(), "/com/bzperi/battery");

        // No value cached yet: the optional Value property is elided.
        assert!(!props.contains_key("Value"));
    }

    #[test]
    fn unpublished_subtrees_are_elided() {
        let mut tree = tree();
        let root = tree.root();
        let ad = tree.add_child(root, "advertisement0").unwrap();
        tree.set_published(ad, false);
        tree.add_interface(
            ad,
            Interface::advertisement(crate::interface::AdvertisementState {
                ad_type: "peripheral".into(),
                service_uuids: vec![],
                includes: vec!["local-name".into()],
            }),
        )
        .unwrap();

        assert!(tree.managed_objects().is_empty());
        // But the node is still addressable for dispatch.
        assert!(tree
            .find_interface("/com/bzperi/advertisement0", "org.bluez.LEAdvertisement1")
            .is_some());
    }

    #[test]
    fn preorder_is_stable() {
        let mut tree = tree();
        let root = tree.root();
        let a = tree.add_child(root, "a").unwrap();
        let b = tree.add_child(root, "b").unwrap();
        let a1 = tree.add_child(a, "one").unwrap();
        let a2 = tree.add_child(a, "two").unwrap();
        assert_eq!(tree.preorder(), vec![root, a, a1, a2, b]);
    }

    #[test]
    fn notify_without_update_handler_fails_validation() {
        let mut tree = tree();
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
                HandlerSlots::default(),
            ),
        )
        .unwrap();

        let err = tree.validate_update_handlers().unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn service_uuid_collection() {
        let mut tree = tree();
        let root = tree.root();
        for (name, uuid) in [("battery", 0x180Fu16), ("device_info", 0x180A)] {
            let id = tree.add_child(root, name).unwrap();
            tree.add_interface(id, Interface::gatt_service(GattUuid::from_u16(uuid), true))
                .unwrap();
        }
        let uuids = tree.service_uuids();
        assert_eq!(uuids.len(), 2);
        assert_eq!(uuids[0].as_u16(), Some(0x180F));
        assert_eq!(uuids[1].as_u16(), Some(0x180A));
    }
}
