//! The BlueZ adapter controller.
//!
//! Owns the relationship with the BlueZ daemon: adapter discovery and
//! selection through the object manager, adapter property configuration,
//! GATT application registration, LE advertisement registration, and
//! tracking of connected remote devices.

use std::collections::HashMap;
use std::time::Duration;

use zbus::fdo::{ObjectManagerProxy, PropertiesProxy};
use zbus::names::InterfaceName;
use zbus::zvariant::{ObjectPath, OwnedValue, Value};
use zbus::Connection;

use crate::address::Address;
use crate::error::{Error, Result};
use crate::path::NodePath;
use crate::retry::{self, CancelToken, RetryPolicy};

mod private {
    use std::collections::HashMap;

    use zbus::dbus_proxy;
    use zbus::zvariant::{ObjectPath, Value};

    #[dbus_proxy(
        interface = "org.bluez.Adapter1",
        default_service = "org.bluez",
        assume_defaults = false
    )]
    trait Adapter {
        #[dbus_proxy(property)]
        fn address(&self) -> zbus::Result<String>;

        #[dbus_proxy(property)]
        fn name(&self) -> zbus::Result<String>;

        #[dbus_proxy(property)]
        fn alias(&self) -> zbus::Result<String>;

        #[dbus_proxy(property)]
        fn powered(&self) -> zbus::Result<bool>;

        #[dbus_proxy(property)]
        fn discoverable(&self) -> zbus::Result<bool>;

        #[dbus_proxy(property)]
        fn pairable(&self) -> zbus::Result<bool>;

        #[dbus_proxy(property)]
        fn discovering(&self) -> zbus::Result<bool>;

        #[dbus_proxy(property, name = "UUIDs")]
        fn uuids(&self) -> zbus::Result<Vec<String>>;
    }

    #[dbus_proxy(
        interface = "org.bluez.GattManager1",
        default_service = "org.bluez",
        assume_defaults = false
    )]
    trait GattManager {
        fn register_application(
            &self,
            application: &ObjectPath<'_>,
            options: HashMap<&str, &Value<'_>>,
        ) -> zbus::Result<()>;

        fn unregister_application(&self, application: &ObjectPath<'_>) -> zbus::Result<()>;
    }

    #[dbus_proxy(
        interface = "org.bluez.LEAdvertisingManager1",
        default_service = "org.bluez",
        assume_defaults = false
    )]
    trait LeAdvertisingManager {
        fn register_advertisement(
            &self,
            advertisement: &ObjectPath<'_>,
            options: HashMap<&str, &Value<'_>>,
        ) -> zbus::Result<()>;

        fn unregister_advertisement(&self, advertisement: &ObjectPath<'_>) -> zbus::Result<()>;
    }

    #[dbus_proxy(
        interface = "org.bluez.Device1",
        default_service = "org.bluez",
        assume_defaults = false
    )]
    trait Device {
        #[dbus_proxy(property)]
        fn address(&self) -> zbus::Result<String>;

        #[dbus_proxy(property)]
        fn name(&self) -> zbus::Result<String>;

        #[dbus_proxy(property)]
        fn alias(&self) -> zbus::Result<String>;

        #[dbus_proxy(property)]
        fn connected(&self) -> zbus::Result<bool>;

        #[dbus_proxy(property)]
        fn paired(&self) -> zbus::Result<bool>;

        #[dbus_proxy(property)]
        fn trusted(&self) -> zbus::Result<bool>;

        #[dbus_proxy(property)]
        fn rssi(&self) -> zbus::Result<i16>;

        #[dbus_proxy(property, name = "UUIDs")]
        fn uuids(&self) -> zbus::Result<Vec<String>>;
    }
}

use private::{AdapterProxy, DeviceProxy, GattManagerProxy, LeAdvertisingManagerProxy};

/// Bounded call timeouts (see the concurrency model).
const PROPERTY_TIMEOUT: Duration = Duration::from_secs(3);
const METHOD_TIMEOUT: Duration = Duration::from_secs(5);
const REGISTER_ADVERTISEMENT_TIMEOUT: Duration = Duration::from_secs(15);
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Adapter1 properties BlueZ exposes read-only; writes are rejected
/// locally without an RPC.
const READ_ONLY_PROPERTIES: &[&str] = &[
    "Address",
    "AddressType",
    "Name",
    "Class",
    "UUIDs",
    "Modalias",
    "Roles",
    "ExperimentalFeatures",
];

/// Returns whether `name` is a read-only Adapter1 property.
pub fn is_read_only_property(name: &str) -> bool {
    READ_ONLY_PROPERTIES.contains(&name)
}

/// A snapshot of one BlueZ adapter, captured at discovery time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdapterInfo {
    pub path: String,
    pub address: String,
    pub name: String,
    pub alias: String,
    pub powered: bool,
    pub discoverable: bool,
    pub connectable: bool,
    pub pairable: bool,
    pub discovering: bool,
    pub uuids: Vec<String>,
}

impl AdapterInfo {
    /// The adapter's address as a typed [`Address`], when BlueZ reported
    /// one.
    pub fn parsed_address(&self) -> Option<Address> {
        self.address.parse().ok()
    }
}

/// A tracked remote peer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceInfo {
    pub path: String,
    pub address: String,
    pub name: String,
    pub alias: String,
    pub connected: bool,
    pub paired: bool,
    pub trusted: bool,
    pub rssi: Option<i16>,
    pub uuids: Vec<String>,
}

impl DeviceInfo {
    /// The device's address as a typed [`Address`], when known.
    pub fn parsed_address(&self) -> Option<Address> {
        self.address.parse().ok()
    }
}

/// The adapter configuration applied at initialisation and re-applied
/// during recovery.
#[derive(Debug, Clone, Default)]
pub struct AdapterSettings {
    /// New adapter alias, or `None` to leave the system name untouched.
    pub alias: Option<String>,
    pub bondable: bool,
    pub discoverable: bool,
}

/// Host-visible device connection callback: `(connected, device path)`.
pub type ConnectionCallback = std::sync::Arc<dyn Fn(bool, &str) + Send + Sync>;

fn prop_str(props: &HashMap<String, OwnedValue>, name: &str) -> String {
    props
        .get(name)
        .and_then(|v| String::try_from(v.clone()).ok())
        .unwrap_or_default()
}

fn prop_bool(props: &HashMap<String, OwnedValue>, name: &str) -> bool {
    props
        .get(name)
        .and_then(|v| bool::try_from(v.clone()).ok())
        .unwrap_or(false)
}

fn prop_str_list(props: &HashMap<String, OwnedValue>, name: &str) -> Vec<String> {
    props
        .get(name)
        .and_then(|v| Vec::<String>::try_from(v.clone()).ok())
        .unwrap_or_default()
}

/// Builds an [`AdapterInfo`] from the cached property map the object
/// manager returned for one `org.bluez.Adapter1` object.
pub fn adapter_info_from_props(path: &str, props: &HashMap<String, OwnedValue>) -> AdapterInfo {
    AdapterInfo {
        path: path.to_string(),
        address: prop_str(props, "Address"),
        name: prop_str(props, "Name"),
        alias: prop_str(props, "Alias"),
        powered: prop_bool(props, "Powered"),
        discoverable: prop_bool(props, "Discoverable"),
        connectable: prop_bool(props, "Connectable"),
        pairable: prop_bool(props, "Pairable"),
        discovering: prop_bool(props, "Discovering"),
        uuids: prop_str_list(props, "UUIDs"),
    }
}

/// Builds a [`DeviceInfo`] from a `org.bluez.Device1` property map.
pub fn device_info_from_props(path: &str, props: &HashMap<String, OwnedValue>) -> DeviceInfo {
    DeviceInfo {
        path: path.to_string(),
        address: prop_str(props, "Address"),
        name: prop_str(props, "Name"),
        alias: prop_str(props, "Alias"),
        connected: prop_bool(props, "Connected"),
        paired: prop_bool(props, "Paired"),
        trusted: prop_bool(props, "Trusted"),
        rssi: props
            .get("RSSI")
            .and_then(|v| i16::try_from(v.clone()).ok()),
        uuids: prop_str_list(props, "UUIDs"),
    }
}

/// Enumerates every adapter BlueZ currently exposes.
pub async fn discover_adapters(conn: &Connection) -> Result<Vec<AdapterInfo>> {
    let manager = ObjectManagerProxy::builder(conn)
        .destination("org.bluez")
        .map_err(Error::from_dbus)?
        .path("/")
        .map_err(Error::from_dbus)?
        .build()
        .await
        .map_err(Error::from_dbus)?;

    let objects = retry::timeout(DISCOVERY_TIMEOUT, async {
        manager.get_managed_objects().await.map_err(Error::from_fdo)
    })
    .await?;

    let mut adapters = Vec::new();
    for (path, interfaces) in &objects {
        if let Some(props) = interfaces.get("org.bluez.Adapter1") {
            log::debug!("found BlueZ adapter at path {}", path);
            adapters.push(adapter_info_from_props(path.as_str(), props));
        }
    }
    adapters.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(adapters)
}

/// Picks the adapter to use.
///
/// A `preferred` hint matches by full path, by address, or by trailing
/// path substring (`"hci0"`). Without a hint the first powered adapter
/// wins, falling back to the first enumerated one.
pub fn select_adapter<'a>(
    adapters: &'a [AdapterInfo],
    preferred: Option<&str>,
) -> Option<&'a AdapterInfo> {
    if let Some(hint) = preferred {
        let found = adapters.iter().find(|a| {
            a.path == hint
                || a.address.eq_ignore_ascii_case(hint)
                || a.path.ends_with(hint)
        });
        if found.is_some() {
            return found;
        }
        log::warn!("preferred adapter '{hint}' not found; falling back to automatic selection");
    }

    adapters
        .iter()
        .find(|a| a.powered)
        .or_else(|| adapters.first())
}

/// The controller owning the selected adapter and everything registered
/// against it.
pub struct AdapterController {
    conn: Connection,
    info: AdapterInfo,
    adapter: AdapterProxy<'static>,
    properties: PropertiesProxy<'static>,
    gatt_manager: GattManagerProxy<'static>,
    adv_manager: LeAdvertisingManagerProxy<'static>,
    cancel: CancelToken,
    settings: AdapterSettings,
    advertisement_path: NodePath,
    advertisement_registered: bool,
    application_path: NodePath,
    application_registered: bool,
    connected: HashMap<String, DeviceInfo>,
    on_connection_change: Option<ConnectionCallback>,
}

impl AdapterController {
    /// Discovers adapters, selects one, and binds the BlueZ proxies to it.
    pub async fn initialize(
        conn: Connection,
        preferred: Option<&str>,
        settings: AdapterSettings,
        application_path: NodePath,
        advertisement_path: NodePath,
        cancel: CancelToken,
        on_connection_change: Option<ConnectionCallback>,
    ) -> Result<Self> {
        let adapters = retry::retry(&RetryPolicy::DEFAULT, &cancel, "adapter discovery", || {
            discover_adapters(&conn)
        })
        .await?;

        if adapters.is_empty() {
            return Err(Error::NotFound("no BlueZ adapters present".into()));
        }

        let info = select_adapter(&adapters, preferred)
            .ok_or_else(|| Error::NotFound("no usable BlueZ adapter".into()))?
            .clone();
        log::info!(
            "selected adapter {} ({}, powered={})",
            info.path,
            info.address,
            info.powered
        );

        let adapter_path = ObjectPath::try_from(info.path.clone()).map_err(|e| {
            Error::InvalidArgument(format!("adapter path {}: {e}", info.path))
        })?;

        let adapter = AdapterProxy::builder(&conn)
            .path(adapter_path.clone())
            .map_err(Error::from_dbus)?
            .build()
            .await
            .map_err(Error::from_dbus)?;
        let properties = PropertiesProxy::builder(&conn)
            .destination("org.bluez")
            .map_err(Error::from_dbus)?
            .path(adapter_path.clone())
            .map_err(Error::from_dbus)?
            .build()
            .await
            .map_err(Error::from_dbus)?;
        let gatt_manager = GattManagerProxy::builder(&conn)
            .path(adapter_path.clone())
            .map_err(Error::from_dbus)?
            .build()
            .await
            .map_err(Error::from_dbus)?;
        let adv_manager = LeAdvertisingManagerProxy::builder(&conn)
            .path(adapter_path)
            .map_err(Error::from_dbus)?
            .build()
            .await
            .map_err(Error::from_dbus)?;

        Ok(Self {
            conn,
            info,
            adapter,
            properties,
            gatt_manager,
            adv_manager,
            cancel,
            settings,
            advertisement_path,
            advertisement_registered: false,
            application_path,
            application_registered: false,
            connected: HashMap::new(),
            on_connection_change,
        })
    }

    /// The snapshot captured at selection time.
    pub fn adapter_info(&self) -> &AdapterInfo {
        &self.info
    }

    pub fn connected_device_count(&self) -> usize {
        self.connected.len()
    }

    pub fn connected_devices(&self) -> impl Iterator<Item = &DeviceInfo> {
        self.connected.values()
    }

    /// Writes an `Adapter1` property through `org.freedesktop.DBus.Properties.Set`
    /// with the property timeout and default retry policy.
    ///
    /// Read-only properties fail with [`Error::NotSupported`] without an
    /// RPC.
    pub async fn set_property(&self, name: &str, value: Value<'_>) -> Result<()> {
        if is_read_only_property(name) {
            return Err(Error::NotSupported(format!(
                "adapter property '{name}' is read-only"
            )));
        }

        let properties = self.properties.clone();
        let what = format!("set adapter property {name}");
        retry::retry(&RetryPolicy::DEFAULT, &self.cancel, &what, move || {
            let properties = properties.clone();
            let value = value.clone();
            async move {
                let iface = InterfaceName::try_from("org.bluez.Adapter1").expect("static name");
                retry::timeout(PROPERTY_TIMEOUT, async move {
                    properties
                        .set(iface, name, &value)
                        .await
                        .map_err(Error::from_fdo)
                })
                .await
            }
        })
        .await
    }

    pub async fn set_powered(&self, enabled: bool) -> Result<()> {
        self.set_property("Powered", Value::from(enabled)).await
    }

    /// Enables or disables general discoverability, optionally bounding it
    /// with a timeout in seconds.
    pub async fn set_discoverable(&self, enabled: bool, timeout: Option<u32>) -> Result<()> {
        if let Some(seconds) = timeout {
            self.set_property("DiscoverableTimeout", Value::from(seconds))
                .await?;
        }
        self.set_property("Discoverable", Value::from(enabled)).await
    }

    /// Controls whether the adapter accepts pairing requests.
    pub async fn set_bondable(&self, enabled: bool) -> Result<()> {
        self.set_property("Pairable", Value::from(enabled)).await
    }

    /// Renames the adapter by writing its `Alias`. An empty alias leaves
    /// the system-wide name untouched.
    pub async fn set_name(&self, alias: &str) -> Result<()> {
        if alias.is_empty() {
            return Ok(());
        }
        self.set_property("Alias", Value::from(alias.to_string()))
            .await
    }

    /// `Connectable` does not exist on modern BlueZ LE adapters; the
    /// connectable state is a function of the advertisement type.
    pub async fn set_connectable(&self, _enabled: bool) -> Result<()> {
        Err(Error::NotSupported(
            "Connectable is not supported on modern BlueZ; use the advertisement type".into(),
        ))
    }

    /// Applies the configured adapter state: power, pairing policy,
    /// discoverability, and alias.
    pub async fn configure(&mut self) -> Result<()> {
        self.ensure_powered().await?;
        self.set_bondable(self.settings.bondable).await?;
        self.set_discoverable(self.settings.discoverable, None).await?;
        if let Some(alias) = self.settings.alias.clone() {
            self.set_name(&alias).await?;
        }
        Ok(())
    }

    /// Powers the adapter on if it is not already.
    async fn ensure_powered(&mut self) -> Result<()> {
        let powered = retry::timeout(PROPERTY_TIMEOUT, async {
            self.adapter.powered().await.map_err(Error::from_dbus)
        })
        .await
        .unwrap_or(self.info.powered);

        if !powered {
            log::info!("adapter {} is off; powering on", self.info.path);
            self.set_powered(true).await?;
        }
        self.info.powered = true;
        Ok(())
    }

    /// Registers the GATT application rooted at the server's object
    /// manager with BlueZ.
    pub async fn register_application(&mut self) -> Result<()> {
        if self.application_registered {
            return Ok(());
        }

        let gatt_manager = self.gatt_manager.clone();
        let path = self.application_path.to_object_path();
        retry::retry(
            &RetryPolicy::DEFAULT,
            &self.cancel,
            "RegisterApplication",
            move || {
                let gatt_manager = gatt_manager.clone();
                let path = path.clone();
                async move {
                    retry::timeout(METHOD_TIMEOUT, async move {
                        gatt_manager
                            .register_application(&path, HashMap::new())
                            .await
                            .map_err(Error::from_dbus)
                    })
                    .await
                }
            },
        )
        .await?;

        self.application_registered = true;
        log::info!("GATT application registered at {}", self.application_path);
        Ok(())
    }

    /// Unregisters the GATT application, tolerating a BlueZ that already
    /// forgot about us.
    pub async fn unregister_application(&mut self) {
        if !self.application_registered {
            return;
        }
        self.application_registered = false;

        let gatt_manager = self.gatt_manager.clone();
        let path = self.application_path.to_object_path();
        let result = retry::timeout(METHOD_TIMEOUT, async move {
            gatt_manager
                .unregister_application(&path)
                .await
                .map_err(Error::from_dbus)
        })
        .await;
        if let Err(e) = result {
            log::debug!("UnregisterApplication failed during teardown: {e}");
        }
    }

    /// Enables or disables LE advertising.
    ///
    /// Enabling verifies the adapter is powered (powering it on if not)
    /// and registers the advertisement object with the aggressive
    /// advertising retry policy. Disabling unregisters it.
    pub async fn set_advertising(&mut self, enabled: bool) -> Result<()> {
        if enabled {
            if self.advertisement_registered {
                return Ok(());
            }
            self.ensure_powered().await?;

            let adv_manager = self.adv_manager.clone();
            let path = self.advertisement_path.to_object_path();
            retry::retry(
                &RetryPolicy::ADVERTISING,
                &self.cancel,
                "RegisterAdvertisement",
                move || {
                    let adv_manager = adv_manager.clone();
                    let path = path.clone();
                    async move {
                        retry::timeout(REGISTER_ADVERTISEMENT_TIMEOUT, async move {
                            adv_manager
                                .register_advertisement(&path, HashMap::new())
                                .await
                                .map_err(Error::from_dbus)
                        })
                        .await
                    }
                },
            )
            .await?;

            self.advertisement_registered = true;
            log::info!("LE advertisement registered at {}", self.advertisement_path);
        } else if self.advertisement_registered {
            self.advertisement_registered = false;
            let adv_manager = self.adv_manager.clone();
            let path = self.advertisement_path.to_object_path();
            let result = retry::timeout(METHOD_TIMEOUT, async move {
                adv_manager
                    .unregister_advertisement(&path)
                    .await
                    .map_err(Error::from_dbus)
            })
            .await;
            if let Err(e) = result {
                log::debug!("UnregisterAdvertisement failed: {e}");
            }
        }
        Ok(())
    }

    pub fn is_advertising(&self) -> bool {
        self.advertisement_registered
    }

    /// Handles a `Device1` `PropertiesChanged` carrying `Connected`.
    pub async fn handle_device_properties_changed(
        &mut self,
        path: &str,
        changed: &HashMap<String, OwnedValue>,
    ) {
        let Some(connected) = changed
            .get("Connected")
            .and_then(|v| bool::try_from(v.clone()).ok())
        else {
            return;
        };

        if connected {
            let info = self.fetch_device_info(path).await;
            self.device_connected(info);
        } else {
            self.device_disconnected(path);
        }
    }

    /// Handles `InterfacesAdded` containing a `Device1`.
    pub fn handle_interfaces_added(
        &mut self,
        path: &str,
        interfaces: &HashMap<String, HashMap<String, OwnedValue>>,
    ) {
        let Some(props) = interfaces.get("org.bluez.Device1") else {
            return;
        };
        let info = device_info_from_props(path, props);
        if info.connected {
            self.device_connected(info);
        }
    }

    /// Handles `InterfacesRemoved` naming a `Device1`.
    pub fn handle_interfaces_removed(&mut self, path: &str, interfaces: &[String]) {
        if interfaces.iter().any(|i| i == "org.bluez.Device1") {
            self.device_disconnected(path);
        }
    }

    fn device_connected(&mut self, info: DeviceInfo) {
        let path = info.path.clone();
        let first_seen = self.connected.insert(path.clone(), info).is_none();
        if first_seen {
            log::info!(
                "device connected: {} ({} total)",
                path,
                self.connected.len()
            );
            if let Some(callback) = &self.on_connection_change {
                callback(true, &path);
            }
        }
    }

    fn device_disconnected(&mut self, path: &str) {
        if self.connected.remove(path).is_some() {
            log::info!(
                "device disconnected: {} ({} remain)",
                path,
                self.connected.len()
            );
            if let Some(callback) = &self.on_connection_change {
                callback(false, path);
            }
        }
    }

    /// Best-effort fetch of a device's properties; anything unreadable
    /// falls back to what the object path encodes.
    async fn fetch_device_info(&self, path: &str) -> DeviceInfo {
        let mut info = DeviceInfo {
            path: path.to_string(),
            address: Address::from_device_path(path)
                .map(|a| a.to_string())
                .unwrap_or_default(),
            connected: true,
            ..Default::default()
        };

        let Ok(object_path) = ObjectPath::try_from(path.to_string()) else {
            return info;
        };
        // One-shot reads; property caching would add a signal subscription
        // per connecting device.
        let proxy = match DeviceProxy::builder(&self.conn)
            .cache_properties(zbus::CacheProperties::No)
            .path(object_path)
        {
            Ok(builder) => match builder.build().await {
                Ok(proxy) => proxy,
                Err(_) => return info,
            },
            Err(_) => return info,
        };

        if let Ok(address) = proxy.address().await {
            info.address = address;
        }
        if let Ok(name) = proxy.name().await {
            info.name = name;
        }
        if let Ok(alias) = proxy.alias().await {
            info.alias = alias;
        }
        info.paired = proxy.paired().await.unwrap_or(false);
        info.trusted = proxy.trusted().await.unwrap_or(false);
        info.rssi = proxy.rssi().await.ok();
        info.uuids = proxy.uuids().await.unwrap_or_default();
        info
    }

    /// Tears down everything registered against the adapter, in reverse
    /// registration order.
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.set_advertising(false).await {
            log::debug!("disabling advertising during shutdown: {e}");
        }
        self.unregister_application().await;
        self.connected.clear();
    }

    /// Re-runs discovery, configuration and registration after BlueZ
    /// returned from a restart.
    pub async fn recover(&mut self) -> Result<()> {
        log::warn!("recovering BlueZ session on {}", self.info.path);
        self.advertisement_registered = false;
        self.application_registered = false;
        self.connected.clear();

        let adapters = discover_adapters(&self.conn).await?;
        if adapters.is_empty() {
            return Err(Error::NotReady("BlueZ returned with no adapters".into()));
        }
        let preferred = self.info.path.clone();
        if let Some(info) = select_adapter(&adapters, Some(&preferred)) {
            self.info = info.clone();
        }

        self.configure().await?;
        self.register_application().await?;
        self.set_advertising(true).await?;
        log::info!("BlueZ recovery complete on {}", self.info.path);
        Ok(())
    }
}

impl std::fmt::Debug for AdapterController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterController")
            .field("adapter", &self.info.path)
            .field("advertising", &self.advertisement_registered)
            .field("connected", &self.connected.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(path: &str, address: &str, powered: bool) -> AdapterInfo {
        AdapterInfo {
            path: path.to_string(),
            address: address.to_string(),
            powered,
            ..Default::default()
        }
    }

    #[test]
    fn selection_prefers_the_hinted_adapter() {
        let adapters = vec![
            adapter("/org/bluez/hci0", "AA:BB:CC:00:11:22", false),
            adapter("/org/bluez/hci1", "AA:BB:CC:33:44:55", true),
        ];

        let byname = select_adapter(&adapters, Some("hci0")).unwrap();
        assert_eq!(byname.path, "/org/bluez/hci0");

        let bypath = select_adapter(&adapters, Some("/org/bluez/hci1")).unwrap();
        assert_eq!(bypath.path, "/org/bluez/hci1");

        let byaddr = select_adapter(&adapters, Some("aa:bb:cc:33:44:55")).unwrap();
        assert_eq!(byaddr.path, "/org/bluez/hci1");
    }

    #[test]
    fn selection_falls_back_to_first_powered_then_first() {
        let adapters = vec![
            adapter("/org/bluez/hci0", "AA:BB:CC:00:11:22", false),
            adapter("/org/bluez/hci1", "AA:BB:CC:33:44:55", true),
        ];
        assert_eq!(
            select_adapter(&adapters, None).unwrap().path,
            "/org/bluez/hci1"
        );
        assert_eq!(
            select_adapter(&adapters, Some("hci9")).unwrap().path,
            "/org/bluez/hci1"
        );

        let unpowered = vec![adapter("/org/bluez/hci0", "AA:BB:CC:00:11:22", false)];
        assert_eq!(
            select_adapter(&unpowered, None).unwrap().path,
            "/org/bluez/hci0"
        );
        assert!(select_adapter(&[], None).is_none());
    }

    #[test]
    fn read_only_properties_are_refused_locally() {
        for name in ["Address", "AddressType", "Name", "Class", "UUIDs", "Modalias", "Roles", "ExperimentalFeatures"] {
            assert!(is_read_only_property(name), "{name} should be read-only");
        }
        for name in ["Powered", "Alias", "Discoverable", "Pairable", "DiscoverableTimeout"] {
            assert!(!is_read_only_property(name), "{name} should be writable");
        }
    }

    #[test]
    fn adapter_info_parses_cached_properties() {
        let mut props: HashMap<String, OwnedValue> = HashMap::new();
        props.insert("Address".into(), Value::from("AA:BB:CC:00:11:22".to_string()).into());
        props.insert("Alias".into(), Value::from("BzPeri".to_string()).into());
        props.insert("Powered".into(), Value::from(true).into());

        let info = adapter_info_from_props("/org/bluez/hci0", &props);
        assert_eq!(info.path, "/org/bluez/hci0");
        assert_eq!(info.address, "AA:BB:CC:00:11:22");
        assert_eq!(info.alias, "BzPeri");
        assert!(info.powered);
        assert!(!info.discoverable);
        assert!(info.uuids.is_empty());
    }
}
