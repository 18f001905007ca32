//! The service-definition DSL and the configurator registry.
//!
//! Applications describe their GATT hierarchy with nested closures:
//!
//! ```
//! use bzperi::dsl::ServerBuilder;
//! use bzperi::tree::GattTree;
//!
//! fn battery_service(server: &mut ServerBuilder<'_>) -> bzperi::Result<()> {
//!     server.service("battery", "180F", |service| {
//!         service.characteristic("level", "2A19", &["read", "notify"], |level| {
//!             level.on_read(|request| {
//!                 Ok(vec![request.data.get_u8("battery/level").unwrap_or(0)])
//!             });
//!             level.on_updated(|ctx| ctx.data.get("battery/level"));
//!             Ok(())
//!         })
//!     })
//! }
//!
//! let mut tree = GattTree::new("/com/bzperi".parse().unwrap());
//! battery_service(&mut ServerBuilder::new(&mut tree)).unwrap();
//! ```
//!
//! Configurators are plain functions registered on a process-wide list
//! before `start`; the server snapshots the list at startup and applies
//! each configurator in registration order.

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::error::{HandlerError, Result};
use crate::interface::{
    CharFlags, HandlerSlots, Interface, ReadRequest, UpdateContext, WriteRequest,
};
use crate::tree::{GattTree, NodeId};
use crate::uuid::GattUuid;

use std::sync::Arc;

/// The mutable view of a server under construction, handed to
/// configurators.
pub struct ServerBuilder<'a> {
    tree: &'a mut GattTree,
}

impl<'a> ServerBuilder<'a> {
    pub fn new(tree: &'a mut GattTree) -> Self {
        Self { tree }
    }

    /// The object path under which services are created.
    pub fn root_path(&self) -> String {
        self.tree.root_path().to_string()
    }

    /// Declares a primary GATT service under the root.
    pub fn service(
        &mut self,
        name: &str,
        uuid: &str,
        build: impl FnOnce(&mut ServiceScope<'_>) -> Result<()>,
    ) -> Result<()> {
        self.add_service(name, uuid, true, build)
    }

    /// Declares a secondary GATT service under the root.
    pub fn secondary_service(
        &mut self,
        name: &str,
        uuid: &str,
        build: impl FnOnce(&mut ServiceScope<'_>) -> Result<()>,
    ) -> Result<()> {
        self.add_service(name, uuid, false, build)
    }

    fn add_service(
        &mut self,
        name: &str,
        uuid: &str,
        primary: bool,
        build: impl FnOnce(&mut ServiceScope<'_>) -> Result<()>,
    ) -> Result<()> {
        let uuid: GattUuid = uuid.parse()?;
        let root = self.tree.root();
        let node = self.tree.add_child(root, name)?;
        self.tree
            .add_interface(node, Interface::gatt_service(uuid, primary))?;

        let mut scope = ServiceScope {
            tree: &mut *self.tree,
            node,
        };
        build(&mut scope)
    }
}

/// Scope for declaring characteristics of one service.
pub struct ServiceScope<'a> {
    tree: &'a mut GattTree,
    node: NodeId,
}

impl ServiceScope<'_> {
    /// Declares a characteristic of this service.
    ///
    /// `flags` uses the BlueZ string form (`"read"`, `"notify"`, …); an
    /// unknown flag fails with `InvalidArgument`.
    pub fn characteristic(
        &mut self,
        name: &str,
        uuid: &str,
        flags: &[&str],
        build: impl FnOnce(&mut CharacteristicScope<'_>) -> Result<()>,
    ) -> Result<()> {
        let uuid: GattUuid = uuid.parse()?;
        let flags = CharFlags::parse(flags)?;
        let node = self.tree.add_child(self.node, name)?;

        let mut scope = CharacteristicScope {
            tree: &mut *self.tree,
            service: self.node,
            node,
            uuid,
            flags,
            handlers: HandlerSlots::default(),
        };
        build(&mut scope)?;
        scope.finish()
    }
}

/// Scope for wiring one characteristic's handlers and descriptors.
pub struct CharacteristicScope<'a> {
    tree: &'a mut GattTree,
    service: NodeId,
    node: NodeId,
    uuid: GattUuid,
    flags: CharFlags,
    handlers: HandlerSlots,
}

impl CharacteristicScope<'_> {
    /// Installs the `ReadValue` handler.
    pub fn on_read(
        &mut self,
        handler: impl Fn(&ReadRequest<'_>) -> std::result::Result<Vec<u8>, HandlerError>
            + Send
            + Sync
            + 'static,
    ) -> &mut Self {
        self.handlers.on_read = Some(Arc::new(handler));
        self
    }

    /// Installs the `WriteValue` handler.
    pub fn on_write(
        &mut self,
        handler: impl Fn(&WriteRequest<'_>) -> std::result::Result<(), HandlerError>
            + Send
            + Sync
            + 'static,
    ) -> &mut Self {
        self.handlers.on_write = Some(Arc::new(handler));
        self
    }

    /// Installs the update handler invoked by the queue dispatcher. The
    /// returned bytes are broadcast as a `Value` change; `None` suppresses
    /// the broadcast.
    pub fn on_updated(
        &mut self,
        handler: impl Fn(&UpdateContext<'_>) -> Option<Vec<u8>> + Send + Sync + 'static,
    ) -> &mut Self {
        self.handlers.on_updated = Some(Arc::new(handler));
        self
    }

    /// Declares a descriptor of this characteristic.
    pub fn descriptor(
        &mut self,
        name: &str,
        uuid: &str,
        flags: &[&str],
        build: impl FnOnce(&mut DescriptorScope<'_>) -> Result<()>,
    ) -> Result<()> {
        let uuid: GattUuid = uuid.parse()?;
        let flags = CharFlags::parse(flags)?;
        let node = self.tree.add_child(self.node, name)?;

        let mut scope = DescriptorScope {
            tree: &mut *self.tree,
            characteristic: self.node,
            node,
            uuid,
            flags,
            handlers: HandlerSlots::default(),
        };
        build(&mut scope)?;
        scope.finish()
    }

    fn finish(self) -> Result<()> {
        self.tree.add_interface(
            self.node,
            Interface::gatt_characteristic(self.uuid, self.service, self.flags, self.handlers),
        )
    }
}

/// Scope for wiring one descriptor's handlers.
pub struct DescriptorScope<'a> {
    tree: &'a mut GattTree,
    characteristic: NodeId,
    node: NodeId,
    uuid: GattUuid,
    flags: CharFlags,
    handlers: HandlerSlots,
}

impl DescriptorScope<'_> {
    pub fn on_read(
        &mut self,
        handler: impl Fn(&ReadRequest<'_>) -> std::result::Result<Vec<u8>, HandlerError>
            + Send
            + Sync
            + 'static,
    ) -> &mut Self {
        self.handlers.on_read = Some(Arc::new(handler));
        self
    }

    pub fn on_write(
        &mut self,
        handler: impl Fn(&WriteRequest<'_>) -> std::result::Result<(), HandlerError>
            + Send
            + Sync
            + 'static,
    ) -> &mut Self {
        self.handlers.on_write = Some(Arc::new(handler));
        self
    }

    pub fn on_updated(
        &mut self,
        handler: impl Fn(&UpdateContext<'_>) -> Option<Vec<u8>> + Send + Sync + 'static,
    ) -> &mut Self {
        self.handlers.on_updated = Some(Arc::new(handler));
        self
    }

    fn finish(self) -> Result<()> {
        self.tree.add_interface(
            self.node,
            Interface::gatt_descriptor(self.uuid, self.characteristic, self.flags, self.handlers),
        )
    }
}

/// A service configurator: a plain function that populates the tree.
pub type Configurator = fn(&mut ServerBuilder<'_>) -> Result<()>;

static REGISTRY: Lazy<Mutex<Vec<Configurator>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// Appends a configurator to the process-wide registry. Thread-safe; may
/// be called from any thread before `start`.
pub fn register_configurator(configurator: Configurator) {
    REGISTRY.lock().push(configurator);
}

/// Removes all registered configurators. Only meaningful before `start`.
pub fn clear_configurators() {
    REGISTRY.lock().clear();
}

/// Returns the number of registered configurators.
pub fn configurator_count() -> usize {
    REGISTRY.lock().len()
}

/// Applies every registered configurator in registration order.
///
/// The list is snapshotted under the lock and the lock dropped before any
/// configurator runs, so a configurator can safely call
/// [`register_configurator`] (the addition takes effect on the next start)
/// but cannot observe itself being applied.
pub fn apply_all(builder: &mut ServerBuilder<'_>) -> Result<()> {
    let snapshot: Vec<Configurator> = REGISTRY.lock().clone();
    for configurator in snapshot {
        configurator(builder)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::interface::{InterfaceKind, GATT_CHARACTERISTIC_IFACE};

    fn tree() -> GattTree {
        GattTree::new("/com/bzperi".parse().unwrap())
    }

    #[test]
    fn nested_closures_build_the_hierarchy() {
        let mut tree = tree();
        let mut builder = ServerBuilder::new(&mut tree);
        builder
            .service("device_info", "180A", |service| {
                service.characteristic("mfgr_name", "2A29", &["read"], |chr| {
                    chr.on_read(|_req| Ok(b"Acme Inc.".to_vec()));
                    Ok(())
                })
            })
            .unwrap();

        let iface = tree
            .find_interface("/com/bzperi/device_info/mfgr_name", GATT_CHARACTERISTIC_IFACE)
            .unwrap();
        match iface.kind() {
            InterfaceKind::Characteristic(c) => {
                assert_eq!(c.uuid.to_string(), "00002A29-0000-1000-8000-00805F9B34FB");
                assert!(c.handlers.on_read.is_some());
                assert!(c.handlers.on_write.is_none());
            }
            other => panic!("wrong kind {:?}", std::mem::discriminant(other)),
        }
    }

    #[test]
    fn descriptors_nest_under_characteristics() {
        let mut tree = tree();
        let mut builder = ServerBuilder::new(&mut tree);
        builder
            .service("text", "00000001-1E3C-FAD4-74E2-97A033F1BFAA", |service| {
                service.characteristic(
                    "string",
                    "00000002-1E3C-FAD4-74E2-97A033F1BFAA",
                    &["read", "write"],
                    |chr| {
                        chr.on_read(|req| Ok(req.data.get("text/string").unwrap_or_default()));
                        chr.on_write(|req| {
                            req.data.set("text/string", req.value);
                            Ok(())
                        });
                        chr.descriptor("description", "2901", &["read"], |desc| {
                            desc.on_read(|_req| Ok(b"A text string".to_vec()));
                            Ok(())
                        })
                    },
                )
            })
            .unwrap();

        assert!(tree
            .find_interface(
                "/com/bzperi/text/string/description",
                "org.bluez.GattDescriptor1"
            )
            .is_some());
    }

    #[test]
    fn path_conflicts_surface_duplicate_path() {
        let mut tree = tree();
        let mut builder = ServerBuilder::new(&mut tree);
        builder.service("battery", "180F", |_| Ok(())).unwrap();
        let err = builder.service("battery", "180F", |_| Ok(())).unwrap_err();
        assert!(matches!(err, crate::Error::DuplicatePath(_)));
    }

    #[test]
    fn bad_uuids_and_flags_are_rejected() {
        let mut tree = tree();
        let mut builder = ServerBuilder::new(&mut tree);
        assert!(matches!(
            builder.service("a", "not-a-uuid", |_| Ok(())),
            Err(crate::Error::InvalidUuid(_))
        ));
        assert!(matches!(
            builder.service("b", "180F", |service| {
                service.characteristic("c", "2A19", &["fly"], |_| Ok(()))
            }),
            Err(crate::Error::InvalidArgument(_))
        ));
    }

    // The registry is process-wide; tests touching it must not interleave.
    static REGISTRY_TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn registry_applies_in_registration_order() {
        let _guard = REGISTRY_TEST_LOCK.lock();
        clear_configurators();

        fn first(server: &mut ServerBuilder<'_>) -> Result<()> {
            server.service("one", "180A", |_| Ok(()))
        }
        fn second(server: &mut ServerBuilder<'_>) -> Result<()> {
            server.service("two", "180F", |_| Ok(()))
        }

        register_configurator(first);
        register_configurator(second);
        assert_eq!(configurator_count(), 2);

        let mut tree = tree();
        apply_all(&mut ServerBuilder::new(&mut tree)).unwrap();
        assert!(tree.find_node("/com/bzperi/one").is_some());
        assert!(tree.find_node("/com/bzperi/two").is_some());

        clear_configurators();
        assert_eq!(configurator_count(), 0);
    }

    #[test]
    fn conflicting_configurators_fail_second() {
        let _guard = REGISTRY_TEST_LOCK.lock();
        clear_configurators();

        fn one(server: &mut ServerBuilder<'_>) -> Result<()> {
            server.service("clash", "180A", |_| Ok(()))
        }
        fn two(server: &mut ServerBuilder<'_>) -> Result<()> {
            server.service("clash", "180F", |_| Ok(()))
        }

        register_configurator(one);
        register_configurator(two);

        let mut tree = tree();
        let err = apply_all(&mut ServerBuilder::new(&mut tree)).unwrap_err();
        assert!(matches!(err, crate::Error::DuplicatePath(_)));
        // First registration wins: the node exists with the first UUID.
        assert!(tree.find_node("/com/bzperi/clash").is_some());

        clear_configurators();
    }
}
