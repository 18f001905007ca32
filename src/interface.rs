//! D-Bus interfaces attached to GATT tree nodes.
//!
//! Every node in the tree carries a list of [`Interface`]s. An interface
//! owns its method, property and signal descriptors; the descriptors feed
//! both introspection XML generation and inbound dispatch. Interfaces are
//! polymorphic over [`InterfaceKind`]: GATT services, characteristics and
//! descriptors, the root object manager, and the LE advertisement.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use zbus::zvariant::OwnedValue;

use crate::error::{Error, HandlerError, Result};
use crate::tree::NodeId;
use crate::uuid::GattUuid;

/// The BlueZ GATT service interface name.
pub const GATT_SERVICE_IFACE: &str = "org.bluez.GattService1";
/// The BlueZ GATT characteristic interface name.
pub const GATT_CHARACTERISTIC_IFACE: &str = "org.bluez.GattCharacteristic1";
/// The BlueZ GATT descriptor interface name.
pub const GATT_DESCRIPTOR_IFACE: &str = "org.bluez.GattDescriptor1";
/// The BlueZ LE advertisement interface name.
pub const LE_ADVERTISEMENT_IFACE: &str = "org.bluez.LEAdvertisement1";
/// The standard object manager interface name.
pub const OBJECT_MANAGER_IFACE: &str = "org.freedesktop.DBus.ObjectManager";
/// The standard properties interface name.
pub const PROPERTIES_IFACE: &str = "org.freedesktop.DBus.Properties";
/// The standard introspection interface name.
pub const INTROSPECTABLE_IFACE: &str = "org.freedesktop.DBus.Introspectable";

/// Application callback that produces the current value for a named datum.
pub type DataGetter = Arc<dyn Fn(&str) -> Option<Vec<u8>> + Send + Sync>;
/// Application callback that accepts a new value for a named datum.
pub type DataSetter = Arc<dyn Fn(&str, &[u8]) -> bool + Send + Sync>;

/// The pair of data callbacks shared with every handler invocation.
///
/// Both callbacks are invoked on the event-loop thread, potentially
/// interleaved with pushes from foreign threads, so the application must
/// make them thread-safe.
#[derive(Clone)]
pub struct DataAccess {
    getter: DataGetter,
    setter: DataSetter,
}

impl DataAccess {
    pub fn new(getter: DataGetter, setter: DataSetter) -> Self {
        Self { getter, setter }
    }

    /// Fetches the named datum from the application.
    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        (self.getter)(name)
    }

    /// Fetches the named datum, interpreting it as UTF-8 text.
    pub fn get_string(&self, name: &str) -> Option<String> {
        self.get(name)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Fetches a single-byte datum (e.g. a battery percentage).
    pub fn get_u8(&self, name: &str) -> Option<u8> {
        self.get(name).and_then(|bytes| bytes.first().copied())
    }

    /// Hands the named datum to the application. Returns whether it was
    /// accepted.
    pub fn set(&self, name: &str, data: &[u8]) -> bool {
        (self.setter)(name, data)
    }
}

impl std::fmt::Debug for DataAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataAccess").finish_non_exhaustive()
    }
}

bitflags::bitflags! {
    /// GATT characteristic and descriptor access flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CharFlags: u16 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const WRITE_WITHOUT_RESPONSE = 1 << 2;
        const NOTIFY = 1 << 3;
        const INDICATE = 1 << 4;
        const AUTHENTICATED_SIGNED_WRITES = 1 << 5;
        const ENCRYPT_READ = 1 << 6;
        const ENCRYPT_WRITE = 1 << 7;
        const ENCRYPT_AUTHENTICATED_READ = 1 << 8;
        const ENCRYPT_AUTHENTICATED_WRITE = 1 << 9;
        const SECURE_READ = 1 << 10;
        const SECURE_WRITE = 1 << 11;
    }
}

const FLAG_NAMES: &[(CharFlags, &str)] = &[
    (CharFlags::READ, "read"),
    (CharFlags::WRITE, "write"),
    (CharFlags::WRITE_WITHOUT_RESPONSE, "write-without-response"),
    (CharFlags::NOTIFY, "notify"),
    (CharFlags::INDICATE, "indicate"),
    (
        CharFlags::AUTHENTICATED_SIGNED_WRITES,
        "authenticated-signed-writes",
    ),
    (CharFlags::ENCRYPT_READ, "encrypt-read"),
    (CharFlags::ENCRYPT_WRITE, "encrypt-write"),
    (
        CharFlags::ENCRYPT_AUTHENTICATED_READ,
        "encrypt-authenticated-read",
    ),
    (
        CharFlags::ENCRYPT_AUTHENTICATED_WRITE,
        "encrypt-authenticated-write",
    ),
    (CharFlags::SECURE_READ, "secure-read"),
    (CharFlags::SECURE_WRITE, "secure-write"),
];

impl CharFlags {
    /// Flags that permit `ReadValue`.
    pub const READABLE: Self = Self::READ
        .union(Self::ENCRYPT_READ)
        .union(Self::ENCRYPT_AUTHENTICATED_READ)
        .union(Self::SECURE_READ);

    /// Flags that permit `WriteValue`.
    pub const WRITABLE: Self = Self::WRITE
        .union(Self::WRITE_WITHOUT_RESPONSE)
        .union(Self::AUTHENTICATED_SIGNED_WRITES)
        .union(Self::ENCRYPT_WRITE)
        .union(Self::ENCRYPT_AUTHENTICATED_WRITE)
        .union(Self::SECURE_WRITE);

    /// Flags that permit change notifications.
    pub const NOTIFIABLE: Self = Self::NOTIFY.union(Self::INDICATE);

    /// Parses the BlueZ string form (`"read"`, `"encrypt-write"`, …).
    pub fn parse(names: &[&str]) -> Result<Self> {
        let mut flags = Self::empty();
        for name in names {
            let flag = FLAG_NAMES
                .iter()
                .find(|(_, s)| s == name)
                .map(|(f, _)| *f)
                .ok_or_else(|| Error::InvalidArgument(format!("unknown GATT flag '{name}'")))?;
            flags |= flag;
        }
        Ok(flags)
    }

    /// Renders the BlueZ string form in declaration order.
    pub fn to_strings(&self) -> Vec<String> {
        FLAG_NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, s)| s.to_string())
            .collect()
    }
}

/// The shared cache holding a characteristic's or descriptor's last value.
pub type ValueCache = Arc<Mutex<Option<Vec<u8>>>>;

/// Context handed to a read handler.
pub struct ReadRequest<'a> {
    /// Object path of the characteristic or descriptor being read.
    pub path: &'a str,
    /// The application data callbacks.
    pub data: &'a DataAccess,
    /// Decoded `ReadValue` options (`offset`, `mtu`, `device`, …).
    pub options: &'a HashMap<String, OwnedValue>,
}

/// Context handed to a write handler.
pub struct WriteRequest<'a> {
    pub path: &'a str,
    pub data: &'a DataAccess,
    /// The bytes the remote client wrote.
    pub value: &'a [u8],
    pub options: &'a HashMap<String, OwnedValue>,
}

/// Context handed to an update handler by the queue dispatcher.
pub struct UpdateContext<'a> {
    pub path: &'a str,
    pub data: &'a DataAccess,
}

/// Produces the bytes to return for a `ReadValue` call.
pub type ReadHandler = Arc<dyn Fn(&ReadRequest<'_>) -> std::result::Result<Vec<u8>, HandlerError> + Send + Sync>;
/// Accepts the bytes of a `WriteValue` call.
pub type WriteHandler = Arc<dyn Fn(&WriteRequest<'_>) -> std::result::Result<(), HandlerError> + Send + Sync>;
/// Produces the new value to broadcast after an update notification, or
/// `None` to suppress the broadcast.
pub type UpdateHandler = Arc<dyn Fn(&UpdateContext<'_>) -> Option<Vec<u8>> + Send + Sync>;

/// The handler slots of a characteristic or descriptor.
#[derive(Default, Clone)]
pub struct HandlerSlots {
    pub on_read: Option<ReadHandler>,
    pub on_write: Option<WriteHandler>,
    pub on_updated: Option<UpdateHandler>,
}

/// Context handed to a method handler.
pub struct MethodCall<'a> {
    pub path: &'a str,
    pub interface: &'a str,
    pub member: &'a str,
    /// The raw message; handlers decode their own argument tuple from it.
    pub msg: &'a zbus::Message,
    pub data: &'a DataAccess,
}

/// Dispatch target of an inbound method call.
pub type MethodHandler = Arc<dyn Fn(&MethodCall<'_>, &mut Invocation) + Send + Sync>;

/// The reply body recorded by a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyBody {
    /// An empty `()` reply.
    Empty,
    /// A byte-array (`ay`) reply.
    Bytes(Vec<u8>),
}

/// A characteristic change queued for emission after the reply is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChange {
    pub path: String,
    pub interface: String,
    pub value: Vec<u8>,
}

/// Collects the outcome of one inbound method invocation.
///
/// Handlers run synchronously on the event-loop thread and record their
/// reply (or error) here; the publisher then performs the asynchronous
/// sends. A handler that records nothing produces an
/// `org.bluez.Error.Failed` reply, so a remote client is never left
/// hanging.
#[derive(Debug, Default)]
pub struct Invocation {
    outcome: Option<std::result::Result<ReplyBody, HandlerError>>,
    pending_changes: Vec<PendingChange>,
}

impl Invocation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an empty success reply.
    pub fn reply_empty(&mut self) {
        self.outcome = Some(Ok(ReplyBody::Empty));
    }

    /// Records a byte-array success reply.
    pub fn reply_bytes(&mut self, bytes: Vec<u8>) {
        self.outcome = Some(Ok(ReplyBody::Bytes(bytes)));
    }

    /// Records an error reply.
    pub fn reply_error(&mut self, error: HandlerError) {
        self.outcome = Some(Err(error));
    }

    /// Queues a `PropertiesChanged` emission carrying `Value` for after the
    /// reply has been sent.
    pub fn notify_value(&mut self, path: impl Into<String>, interface: impl Into<String>, value: Vec<u8>) {
        self.pending_changes.push(PendingChange {
            path: path.into(),
            interface: interface.into(),
            value,
        });
    }

    pub(crate) fn take_outcome(&mut self) -> Option<std::result::Result<ReplyBody, HandlerError>> {
        self.outcome.take()
    }

    pub(crate) fn take_changes(&mut self) -> Vec<PendingChange> {
        std::mem::take(&mut self.pending_changes)
    }
}

/// State behind a `org.bluez.GattService1` interface.
#[derive(Debug)]
pub struct ServiceState {
    pub uuid: GattUuid,
    pub primary: bool,
}

/// State behind a `org.bluez.GattCharacteristic1` interface.
pub struct CharState {
    pub uuid: GattUuid,
    /// Tree node of the owning service; rendered as the `Service` property.
    pub service: NodeId,
    pub flags: CharFlags,
    pub handlers: HandlerSlots,
    pub notifying: AtomicBool,
    pub value: ValueCache,
}

/// State behind a `org.bluez.GattDescriptor1` interface.
pub struct DescState {
    pub uuid: GattUuid,
    /// Tree node of the owning characteristic; rendered as the
    /// `Characteristic` property.
    pub characteristic: NodeId,
    pub flags: CharFlags,
    pub handlers: HandlerSlots,
    pub value: ValueCache,
}

/// State behind a `org.bluez.LEAdvertisement1` interface.
#[derive(Debug, Clone)]
pub struct AdvertisementState {
    /// `"peripheral"` or `"broadcast"`.
    pub ad_type: String,
    /// Canonical UUID strings, already budgeted to the 31-byte AD limit.
    pub service_uuids: Vec<String>,
    /// Subset of `{"local-name", "tx-power"}`.
    pub includes: Vec<String>,
}

/// The polymorphic payload of an [`Interface`].
pub enum InterfaceKind {
    Service(Arc<ServiceState>),
    Characteristic(Arc<CharState>),
    Descriptor(Arc<DescState>),
    ObjectManager,
    Advertisement(Arc<AdvertisementState>),
}

/// Discriminant used to enforce "at most one interface of each kind per
/// node".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceTag {
    Service,
    Characteristic,
    Descriptor,
    ObjectManager,
    Advertisement,
}

impl InterfaceKind {
    pub fn tag(&self) -> InterfaceTag {
        match self {
            InterfaceKind::Service(_) => InterfaceTag::Service,
            InterfaceKind::Characteristic(_) => InterfaceTag::Characteristic,
            InterfaceKind::Descriptor(_) => InterfaceTag::Descriptor,
            InterfaceKind::ObjectManager => InterfaceTag::ObjectManager,
            InterfaceKind::Advertisement(_) => InterfaceTag::Advertisement,
        }
    }
}

/// A named argument of a method or signal.
#[derive(Debug, Clone, Copy)]
pub struct MethodArg {
    pub name: &'static str,
    pub signature: &'static str,
}

/// A method descriptor: name, signatures, and the invocation handler.
///
/// Descriptors with no handler (`GetManagedObjects`) are dispatched by the
/// publisher engine itself, which needs whole-tree context.
pub struct Method {
    pub name: &'static str,
    pub in_args: &'static [MethodArg],
    pub out_args: &'static [MethodArg],
    pub handler: Option<MethodHandler>,
}

/// A signal descriptor, used for introspection XML only.
#[derive(Debug, Clone, Copy)]
pub struct SignalSpec {
    pub name: &'static str,
    pub args: &'static [MethodArg],
}

/// How a property's current value is produced at emission time.
pub enum PropValue {
    /// A GATT UUID, rendered canonical uppercase.
    Uuid(GattUuid),
    Bool(bool),
    Str(String),
    StrList(Vec<String>),
    /// A reference to another tree node, resolved to its object path.
    BackRef(NodeId),
    /// The shared value cache; elided while no value has been cached.
    CachedBytes(ValueCache),
}

/// A property descriptor attached to an interface.
pub struct Property {
    pub name: &'static str,
    pub signature: &'static str,
    pub read: bool,
    pub write: bool,
    pub emits_change: bool,
    pub value: PropValue,
}

impl Property {
    fn read_only(name: &'static str, signature: &'static str, value: PropValue) -> Self {
        Self {
            name,
            signature,
            read: true,
            write: false,
            emits_change: false,
            value,
        }
    }
}

/// A named D-Bus interface attached to a tree node.
pub struct Interface {
    name: &'static str,
    kind: InterfaceKind,
    methods: Vec<Method>,
    properties: Vec<Property>,
    signals: Vec<SignalSpec>,
}

const READ_VALUE_IN: &[MethodArg] = &[MethodArg {
    name: "options",
    signature: "a{sv}",
}];
const READ_VALUE_OUT: &[MethodArg] = &[MethodArg {
    name: "value",
    signature: "ay",
}];
const WRITE_VALUE_IN: &[MethodArg] = &[
    MethodArg {
        name: "value",
        signature: "ay",
    },
    MethodArg {
        name: "options",
        signature: "a{sv}",
    },
];
const MANAGED_OBJECTS_OUT: &[MethodArg] = &[MethodArg {
    name: "objects",
    signature: "a{oa{sa{sv}}}",
}];
const INTERFACES_ADDED_ARGS: &[MethodArg] = &[
    MethodArg {
        name: "object",
        signature: "o",
    },
    MethodArg {
        name: "interfaces",
        signature: "a{sa{sv}}",
    },
];
const INTERFACES_REMOVED_ARGS: &[MethodArg] = &[
    MethodArg {
        name: "object",
        signature: "o",
    },
    MethodArg {
        name: "interfaces",
        signature: "as",
    },
];

impl Interface {
    /// Builds a `org.bluez.GattService1` interface.
    pub fn gatt_service(uuid: GattUuid, primary: bool) -> Self {
        let state = Arc::new(ServiceState { uuid, primary });
        Self {
            name: GATT_SERVICE_IFACE,
            properties: vec![
                Property::read_only("UUID", "s", PropValue::Uuid(uuid)),
                Property::read_only("Primary", "b", PropValue::Bool(primary)),
            ],
            methods: Vec::new(),
            signals: Vec::new(),
            kind: InterfaceKind::Service(state),
        }
    }

    /// Builds a `org.bluez.GattCharacteristic1` interface with its four
    /// method descriptors wired to the handler slots.
    pub fn gatt_characteristic(
        uuid: GattUuid,
        service: NodeId,
        flags: CharFlags,
        handlers: HandlerSlots,
    ) -> Self {
        let state = Arc::new(CharState {
            uuid,
            service,
            flags,
            handlers,
            notifying: AtomicBool::new(false),
            value: Arc::new(Mutex::new(None)),
        });

        let methods = vec![
            Method {
                name: "ReadValue",
                in_args: READ_VALUE_IN,
                out_args: READ_VALUE_OUT,
                handler: Some(read_value_handler(state.clone())),
            },
            Method {
                name: "WriteValue",
                in_args: WRITE_VALUE_IN,
                out_args: &[],
                handler: Some(write_value_handler(state.clone())),
            },
            Method {
                name: "StartNotify",
                in_args: &[],
                out_args: &[],
                handler: Some(start_notify_handler(state.clone(), true)),
            },
            Method {
                name: "StopNotify",
                in_args: &[],
                out_args: &[],
                handler: Some(start_notify_handler(state.clone(), false)),
            },
        ];

        Self {
            name: GATT_CHARACTERISTIC_IFACE,
            properties: vec![
                Property::read_only("UUID", "s", PropValue::Uuid(uuid)),
                Property::read_only("Service", "o", PropValue::BackRef(service)),
                Property::read_only("Flags", "as", PropValue::StrList(flags.to_strings())),
                Property {
                    name: "Value",
                    signature: "ay",
                    read: true,
                    write: false,
                    emits_change: true,
                    value: PropValue::CachedBytes(state.value.clone()),
                },
            ],
            methods,
            signals: Vec::new(),
            kind: InterfaceKind::Characteristic(state),
        }
    }

    /// Builds a `org.bluez.GattDescriptor1` interface.
    pub fn gatt_descriptor(
        uuid: GattUuid,
        characteristic: NodeId,
        flags: CharFlags,
        handlers: HandlerSlots,
    ) -> Self {
        let state = Arc::new(DescState {
            uuid,
            characteristic,
            flags,
            handlers,
            value: Arc::new(Mutex::new(None)),
        });

        let methods = vec![
            Method {
                name: "ReadValue",
                in_args: READ_VALUE_IN,
                out_args: READ_VALUE_OUT,
                handler: Some(desc_read_handler(state.clone())),
            },
            Method {
                name: "WriteValue",
                in_args: WRITE_VALUE_IN,
                out_args: &[],
                handler: Some(desc_write_handler(state.clone())),
            },
        ];

        Self {
            name: GATT_DESCRIPTOR_IFACE,
            properties: vec![
                Property::read_only("UUID", "s", PropValue::Uuid(uuid)),
                Property::read_only(
                    "Characteristic",
                    "o",
                    PropValue::BackRef(characteristic),
                ),
                Property::read_only("Flags", "as", PropValue::StrList(flags.to_strings())),
            ],
            methods,
            signals: Vec::new(),
            kind: InterfaceKind::Descriptor(state),
        }
    }

    /// Builds the `org.freedesktop.DBus.ObjectManager` interface for the
    /// root node. `GetManagedObjects` is dispatched by the publisher, which
    /// holds the tree.
    pub fn object_manager() -> Self {
        Self {
            name: OBJECT_MANAGER_IFACE,
            properties: Vec::new(),
            methods: vec![Method {
                name: "GetManagedObjects",
                in_args: &[],
                out_args: MANAGED_OBJECTS_OUT,
                handler: None,
            }],
            signals: vec![
                SignalSpec {
                    name: "InterfacesAdded",
                    args: INTERFACES_ADDED_ARGS,
                },
                SignalSpec {
                    name: "InterfacesRemoved",
                    args: INTERFACES_REMOVED_ARGS,
                },
            ],
            kind: InterfaceKind::ObjectManager,
        }
    }

    /// Builds a `org.bluez.LEAdvertisement1` interface.
    pub fn advertisement(state: AdvertisementState) -> Self {
        let state = Arc::new(state);
        Self {
            name: LE_ADVERTISEMENT_IFACE,
            properties: vec![
                Property::read_only("Type", "s", PropValue::Str(state.ad_type.clone())),
                Property::read_only(
                    "ServiceUUIDs",
                    "as",
                    PropValue::StrList(state.service_uuids.clone()),
                ),
                Property::read_only(
                    "Includes",
                    "as",
                    PropValue::StrList(state.includes.clone()),
                ),
            ],
            methods: vec![Method {
                name: "Release",
                in_args: &[],
                out_args: &[],
                handler: Some(Arc::new(|call: &MethodCall<'_>, inv: &mut Invocation| {
                    log::info!("advertisement at {} released by BlueZ", call.path);
                    inv.reply_empty();
                })),
            }],
            signals: Vec::new(),
            kind: InterfaceKind::Advertisement(state),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn kind(&self) -> &InterfaceKind {
        &self.kind
    }

    pub fn methods(&self) -> &[Method] {
        &self.methods
    }

    pub fn properties(&self) -> &[Property] {
        &self.properties
    }

    pub fn signals(&self) -> &[SignalSpec] {
        &self.signals
    }

    pub fn find_method(&self, name: &str) -> Option<&Method> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn find_property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Returns the update handler slot for characteristic and descriptor
    /// interfaces.
    pub fn update_handler(&self) -> Option<&UpdateHandler> {
        match &self.kind {
            InterfaceKind::Characteristic(c) => c.handlers.on_updated.as_ref(),
            InterfaceKind::Descriptor(d) => d.handlers.on_updated.as_ref(),
            _ => None,
        }
    }

    /// Returns the shared value cache for characteristic and descriptor
    /// interfaces.
    pub fn value_cache(&self) -> Option<&ValueCache> {
        match &self.kind {
            InterfaceKind::Characteristic(c) => Some(&c.value),
            InterfaceKind::Descriptor(d) => Some(&d.value),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Interface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interface")
            .field("name", &self.name)
            .field("methods", &self.methods.len())
            .field("properties", &self.properties.len())
            .finish()
    }
}

fn decode_read_options(msg: &zbus::Message) -> HashMap<String, OwnedValue> {
    msg.body::<HashMap<String, OwnedValue>>().unwrap_or_default()
}

fn read_value_handler(state: Arc<CharState>) -> MethodHandler {
    Arc::new(move |call: &MethodCall<'_>, inv: &mut Invocation| {
        if !state.flags.intersects(CharFlags::READABLE) {
            inv.reply_error(HandlerError::not_permitted("characteristic is not readable"));
            return;
        }

        let Some(on_read) = &state.handlers.on_read else {
            inv.reply_error(HandlerError::not_supported("no read handler registered"));
            return;
        };

        let options = decode_read_options(call.msg);
        let request = ReadRequest {
            path: call.path,
            data: call.data,
            options: &options,
        };
        match on_read(&request) {
            Ok(bytes) => {
                *state.value.lock() = Some(bytes.clone());
                inv.reply_bytes(bytes);
            }
            Err(e) => inv.reply_error(e),
        }
    })
}

fn write_value_handler(state: Arc<CharState>) -> MethodHandler {
    Arc::new(move |call: &MethodCall<'_>, inv: &mut Invocation| {
        if !state.flags.intersects(CharFlags::WRITABLE) {
            inv.reply_error(HandlerError::not_permitted("characteristic is not writable"));
            return;
        }

        let Some(on_write) = &state.handlers.on_write else {
            inv.reply_error(HandlerError::not_supported("no write handler registered"));
            return;
        };

        let (value, options) = match call
            .msg
            .body::<(Vec<u8>, HashMap<String, OwnedValue>)>()
        {
            Ok(args) => args,
            Err(e) => {
                inv.reply_error(HandlerError::new(
                    "org.freedesktop.DBus.Error.InvalidArgs",
                    e.to_string(),
                ));
                return;
            }
        };

        let request = WriteRequest {
            path: call.path,
            data: call.data,
            value: &value,
            options: &options,
        };
        match on_write(&request) {
            Ok(()) => {
                *state.value.lock() = Some(value);
                inv.reply_empty();

                // A successful write on a notifying characteristic pushes the
                // new value out through the update handler.
                if state.flags.intersects(CharFlags::NOTIFIABLE) {
                    if let Some(on_updated) = &state.handlers.on_updated {
                        let ctx = UpdateContext {
                            path: call.path,
                            data: call.data,
                        };
                        if let Some(new_value) = on_updated(&ctx) {
                            *state.value.lock() = Some(new_value.clone());
                            inv.notify_value(call.path, call.interface, new_value);
                        }
                    }
                }
            }
            Err(e) => inv.reply_error(e),
        }
    })
}

fn start_notify_handler(state: Arc<CharState>, enable: bool) -> MethodHandler {
    Arc::new(move |_call: &MethodCall<'_>, inv: &mut Invocation| {
        if !state.flags.intersects(CharFlags::NOTIFIABLE) {
            inv.reply_error(HandlerError::not_permitted(
                "characteristic does not support notifications",
            ));
            return;
        }
        state.notifying.store(enable, Ordering::Release);
        inv.reply_empty();
    })
}

fn desc_read_handler(state: Arc<DescState>) -> MethodHandler {
    Arc::new(move |call: &MethodCall<'_>, inv: &mut Invocation| {
        let Some(on_read) = &state.handlers.on_read else {
            inv.reply_error(HandlerError::not_supported("no read handler registered"));
            return;
        };

        let options = decode_read_options(call.msg);
        let request = ReadRequest {
            path: call.path,
            data: call.data,
            options: &options,
        };
        match on_read(&request) {
            Ok(bytes) => {
                *state.value.lock() = Some(bytes.clone());
                inv.reply_bytes(bytes);
            }
            Err(e) => inv.reply_error(e),
        }
    })
}

fn desc_write_handler(state: Arc<DescState>) -> MethodHandler {
    Arc::new(move |call: &MethodCall<'_>, inv: &mut Invocation| {
        let Some(on_write) = &state.handlers.on_write else {
            inv.reply_error(HandlerError::not_supported("no write handler registered"));
            return;
        };

        let (value, options) = match call
            .msg
            .body::<(Vec<u8>, HashMap<String, OwnedValue>)>()
        {
            Ok(args) => args,
            Err(e) => {
                inv.reply_error(HandlerError::new(
                    "org.freedesktop.DBus.Error.InvalidArgs",
                    e.to_string(),
                ));
                return;
            }
        };

        let request = WriteRequest {
            path: call.path,
            data: call.data,
            value: &value,
            options: &options,
        };
        match on_write(&request) {
            Ok(()) => {
                *state.value.lock() = Some(value);
                inv.reply_empty();
            }
            Err(e) => inv.reply_error(e),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_roundtrip_through_the_bluez_string_form() {
        let flags = CharFlags::parse(&["read", "notify", "encrypt-write"]).unwrap();
        assert!(flags.contains(CharFlags::READ));
        assert!(flags.contains(CharFlags::NOTIFY));
        assert!(flags.contains(CharFlags::ENCRYPT_WRITE));
        assert_eq!(flags.to_strings(), vec!["read", "notify", "encrypt-write"]);
    }

    #[test]
    fn unknown_flags_are_rejected() {
        let err = CharFlags::parse(&["read", "levitate"]).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn readable_and_writable_masks() {
        assert!(CharFlags::SECURE_READ.intersects(CharFlags::READABLE));
        assert!(!CharFlags::SECURE_READ.intersects(CharFlags::WRITABLE));
        assert!(CharFlags::WRITE_WITHOUT_RESPONSE.intersects(CharFlags::WRITABLE));
        assert!(CharFlags::INDICATE.intersects(CharFlags::NOTIFIABLE));
    }

    #[test]
    fn one_interface_of_each_kind() {
        let uuid = GattUuid::from_u16(0x180F);
        let service = Interface::gatt_service(uuid, true);
        assert_eq!(service.kind().tag(), InterfaceTag::Service);
        assert_eq!(service.name(), GATT_SERVICE_IFACE);
        assert!(service.find_property("UUID").is_some());
        assert!(service.find_property("Primary").is_some());
        assert!(service.find_property("Flags").is_none());
    }

    #[test]
    fn invocation_records_the_last_outcome() {
        let mut inv = Invocation::new();
        inv.reply_bytes(vec![1, 2]);
        inv.reply_error(HandlerError::failed("changed my mind"));
        match inv.take_outcome() {
            Some(Err(e)) => assert_eq!(e.name(), "org.bluez.Error.Failed"),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(inv.take_outcome().is_none());
    }

    #[test]
    fn characteristic_interface_has_the_bluez_surface() {
        let iface = Interface::gatt_characteristic(
            GattUuid::from_u16(0x2A19),
            NodeId::from_raw(1),
            CharFlags::READ | CharFlags::NOTIFY,
            HandlerSlots::default(),
        );
        let names: Vec<_> = iface.methods().iter().map(|m| m.name).collect();
        assert_eq!(names, ["ReadValue", "WriteValue", "StartNotify", "StopNotify"]);
        assert_eq!(iface.find_property("Service").unwrap().signature, "o");
        assert_eq!(iface.find_property("Flags").unwrap().signature, "as");
    }
}
