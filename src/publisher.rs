//! The D-Bus object publisher.
//!
//! Bridges the GATT tree to the system bus: owns the well-known name,
//! tracks which object paths are served, dispatches inbound method calls
//! and property reads against the tree, and emits `PropertiesChanged`
//! signals for characteristic value updates.
//!
//! The publisher deliberately avoids zbus's `ObjectServer`; the tree is a
//! dynamic structure assembled at runtime, so dispatch is done by hand
//! from the raw [`zbus::MessageStream`] the event loop consumes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use zbus::zvariant::{Array, Value};
use zbus::{fdo::DBusProxy, Connection, MatchRule, MessageType};

use crate::error::{Error, HandlerError, Result};
use crate::interface::{
    DataAccess, Invocation, ReplyBody, INTROSPECTABLE_IFACE, OBJECT_MANAGER_IFACE,
    PROPERTIES_IFACE,
};
use crate::introspect;
use crate::tree::GattTree;

/// Connects to the system message bus.
pub async fn acquire_bus() -> Result<Connection> {
    let mut conn = Connection::system()
        .await
        .map_err(|e| Error::BusUnavailable(e.to_string()))?;
    // Bursty BlueZ signal traffic must not overflow the message queue
    // while the event loop is busy inside a proxy call.
    conn.set_max_queued(256);
    Ok(conn)
}

/// Requests ownership of the well-known bus name.
pub async fn acquire_name(conn: &Connection, name: &str) -> Result<()> {
    conn.request_name(name).await.map_err(|e| match e {
        zbus::Error::NameTaken => Error::NameLost(format!("name '{name}' already owned")),
        other => Error::NameLost(other.to_string()),
    })
}

/// Releases the well-known bus name during teardown.
pub async fn release_name(conn: &Connection, name: &str) -> Result<()> {
    conn.release_name(name).await.map_err(Error::from_dbus)?;
    Ok(())
}

/// The signal subscriptions the server holds while running, scoped to
/// BlueZ traffic.
pub fn bluez_match_rules() -> Vec<MatchRule<'static>> {
    let properties_changed = MatchRule::builder()
        .msg_type(MessageType::Signal)
        .sender("org.bluez")
        .expect("static sender")
        .interface(PROPERTIES_IFACE)
        .expect("static interface")
        .member("PropertiesChanged")
        .expect("static member")
        .build();
    let interfaces_added = MatchRule::builder()
        .msg_type(MessageType::Signal)
        .sender("org.bluez")
        .expect("static sender")
        .interface(OBJECT_MANAGER_IFACE)
        .expect("static interface")
        .member("InterfacesAdded")
        .expect("static member")
        .build();
    let interfaces_removed = MatchRule::builder()
        .msg_type(MessageType::Signal)
        .sender("org.bluez")
        .expect("static sender")
        .interface(OBJECT_MANAGER_IFACE)
        .expect("static interface")
        .member("InterfacesRemoved")
        .expect("static member")
        .build();
    let name_owner_changed = MatchRule::builder()
        .msg_type(MessageType::Signal)
        .sender("org.freedesktop.DBus")
        .expect("static sender")
        .interface("org.freedesktop.DBus")
        .expect("static interface")
        .member("NameOwnerChanged")
        .expect("static member")
        .arg(0, "org.bluez")
        .expect("static arg")
        .build();

    vec![
        properties_changed,
        interfaces_added,
        interfaces_removed,
        name_owner_changed,
    ]
}

/// Publishes one [`GattTree`] on one bus connection.
pub struct Publisher {
    conn: Connection,
    tree: Arc<GattTree>,
    data: DataAccess,
    registered: HashSet<String>,
    subscriptions: Vec<MatchRule<'static>>,
}

impl Publisher {
    pub fn new(conn: Connection, tree: Arc<GattTree>, data: DataAccess) -> Self {
        Self {
            conn,
            tree,
            data,
            registered: HashSet::new(),
            subscriptions: Vec::new(),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn tree(&self) -> &Arc<GattTree> {
        &self.tree
    }

    /// Registers every node of the tree for dispatch.
    ///
    /// The registration set is built completely before it is committed; on
    /// any failure the partial set is released and nothing is served.
    pub fn register_tree(&mut self) -> Result<()> {
        let mut registered = HashSet::new();
        for id in self.tree.preorder() {
            let path = self.tree.node_path(id).to_string();
            if !registered.insert(path.clone()) {
                return Err(Error::DuplicatePath(path));
            }
        }
        self.registered = registered;
        log::debug!("registered {} object paths for dispatch", self.registered.len());
        Ok(())
    }

    /// Releases all registered paths.
    pub fn unregister_tree(&mut self) {
        self.registered.clear();
    }

    /// Installs the BlueZ-scoped signal subscriptions, tracking them for
    /// orderly teardown.
    pub async fn subscribe_signals(&mut self) -> Result<()> {
        let proxy = DBusProxy::new(&self.conn).await.map_err(Error::from_dbus)?;
        for rule in bluez_match_rules() {
            proxy
                .add_match_rule(rule.clone())
                .await
                .map_err(Error::from_fdo)?;
            self.subscriptions.push(rule);
        }
        Ok(())
    }

    /// Removes the signal subscriptions installed by
    /// [`Publisher::subscribe_signals`].
    pub async fn unsubscribe_signals(&mut self) {
        let Ok(proxy) = DBusProxy::new(&self.conn).await else {
            self.subscriptions.clear();
            return;
        };
        for rule in self.subscriptions.drain(..) {
            if let Err(e) = proxy.remove_match_rule(rule).await {
                log::debug!("failed to remove match rule during teardown: {e}");
            }
        }
    }

    /// Dispatches one inbound method call.
    ///
    /// Returns `true` if the message addressed an object this publisher
    /// serves (a reply has been sent in that case), `false` if the message
    /// is not ours.
    pub async fn handle_method_call(&self, msg: &zbus::Message) -> Result<bool> {
        if msg.message_type() != MessageType::MethodCall {
            return Ok(false);
        }

        let Some(path) = msg.path() else {
            return Ok(false);
        };
        let path = path.to_string();
        if !self.registered.contains(&path) {
            return Ok(false);
        }

        let interface = msg.interface().map(|i| i.to_string()).unwrap_or_default();
        let member = msg.member().map(|m| m.to_string()).unwrap_or_default();
        log::trace!("method call {interface}.{member} on {path}");

        match interface.as_str() {
            INTROSPECTABLE_IFACE if member == "Introspect" => {
                self.reply_introspect(msg, &path).await?;
            }
            PROPERTIES_IFACE => {
                self.dispatch_properties(msg, &path, &member).await?;
            }
            OBJECT_MANAGER_IFACE if member == "GetManagedObjects" => {
                self.reply_managed_objects(msg, &path).await?;
            }
            _ => {
                let mut inv = Invocation::new();
                if self
                    .tree
                    .call_method(&path, &interface, &member, msg, &self.data, &mut inv)
                {
                    self.send_outcome(msg, inv).await?;
                } else {
                    self.reply_dbus_error(
                        msg,
                        "org.freedesktop.DBus.Error.UnknownMethod",
                        &format!("no method {interface}.{member} on {path}"),
                    )
                    .await?;
                }
            }
        }

        Ok(true)
    }

    async fn reply_introspect(&self, msg: &zbus::Message, path: &str) -> Result<()> {
        match introspect::introspection_xml(&self.tree, path) {
            Some(xml) => {
                self.conn.reply(msg, &xml).await.map_err(Error::from_dbus)?;
            }
            None => {
                self.reply_dbus_error(
                    msg,
                    "org.freedesktop.DBus.Error.UnknownObject",
                    &format!("no object at {path}"),
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn reply_managed_objects(&self, msg: &zbus::Message, path: &str) -> Result<()> {
        let serves_object_manager = self
            .tree
            .find_interface(path, OBJECT_MANAGER_IFACE)
            .is_some();
        if !serves_object_manager {
            return self
                .reply_dbus_error(
                    msg,
                    "org.freedesktop.DBus.Error.UnknownInterface",
                    &format!("{path} does not implement {OBJECT_MANAGER_IFACE}"),
                )
                .await;
        }

        let objects = self.tree.managed_objects();
        log::debug!("GetManagedObjects: {} published objects", objects.len());
        self.conn
            .reply(msg, &objects)
            .await
            .map_err(Error::from_dbus)?;
        Ok(())
    }

    async fn dispatch_properties(
        &self,
        msg: &zbus::Message,
        path: &str,
        member: &str,
    ) -> Result<()> {
        match member {
            "Get" => {
                let (iface, name): (String, String) = match msg.body() {
                    Ok(args) => args,
                    Err(e) => {
                        return self
                            .reply_dbus_error(
                                msg,
                                "org.freedesktop.DBus.Error.InvalidArgs",
                                &e.to_string(),
                            )
                            .await;
                    }
                };

                if self.tree.find_interface(path, &iface).is_none() {
                    return self
                        .reply_dbus_error(
                            msg,
                            "org.freedesktop.DBus.Error.UnknownInterface",
                            &format!("{path} does not implement {iface}"),
                        )
                        .await;
                }

                let Some(property) = self.tree.find_property(path, &iface, &name) else {
                    return self
                        .reply_dbus_error(
                            msg,
                            "org.freedesktop.DBus.Error.UnknownProperty",
                            &format!("no property {iface}.{name} on {path}"),
                        )
                        .await;
                };

                let value = self.tree.property_value(property).unwrap_or_else(|| {
                    // An uncached optional value reads as an empty array.
                    Value::Array(Array::from(Vec::<u8>::new())).into()
                });
                self.conn.reply(msg, &value).await.map_err(Error::from_dbus)?;
            }
            "GetAll" => {
                let iface: String = match msg.body() {
                    Ok(args) => args,
                    Err(e) => {
                        return self
                            .reply_dbus_error(
                                msg,
                                "org.freedesktop.DBus.Error.InvalidArgs",
                                &e.to_string(),
                            )
                            .await;
                    }
                };

                let Some(interface) = self.tree.find_interface(path, &iface) else {
                    return self
                        .reply_dbus_error(
                            msg,
                            "org.freedesktop.DBus.Error.UnknownInterface",
                            &format!("{path} does not implement {iface}"),
                        )
                        .await;
                };

                let props = self.tree.interface_properties(interface);
                self.conn.reply(msg, &props).await.map_err(Error::from_dbus)?;
            }
            "Set" => {
                // Every property in the GATT hierarchy is read-only from
                // the bus side; writes go through WriteValue.
                self.reply_dbus_error(
                    msg,
                    "org.freedesktop.DBus.Error.PropertyReadOnly",
                    "properties of this object are read-only",
                )
                .await?;
            }
            other => {
                self.reply_dbus_error(
                    msg,
                    "org.freedesktop.DBus.Error.UnknownMethod",
                    &format!("unknown Properties method {other}"),
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Sends the outcome a handler recorded, then emits any queued value
    /// changes.
    async fn send_outcome(&self, msg: &zbus::Message, mut inv: Invocation) -> Result<()> {
        match inv.take_outcome() {
            Some(Ok(ReplyBody::Empty)) => {
                self.conn.reply(msg, &()).await.map_err(Error::from_dbus)?;
            }
            Some(Ok(ReplyBody::Bytes(bytes))) => {
                self.conn.reply(msg, &bytes).await.map_err(Error::from_dbus)?;
            }
            Some(Err(e)) => {
                self.reply_handler_error(msg, &e).await?;
            }
            None => {
                // A handler that records nothing must not leave the caller
                // hanging.
                self.reply_handler_error(
                    msg,
                    &HandlerError::failed("handler did not complete the invocation"),
                )
                .await?;
            }
        }

        for change in inv.take_changes() {
            if let Err(e) = self
                .emit_value_changed(&change.path, &change.interface, &change.value)
                .await
            {
                log::error!(
                    "failed to emit PropertiesChanged for {}: {e}",
                    change.path
                );
            }
        }
        Ok(())
    }

    async fn reply_handler_error(&self, msg: &zbus::Message, e: &HandlerError) -> Result<()> {
        self.reply_dbus_error(msg, e.name(), e.message()).await
    }

    async fn reply_dbus_error(&self, msg: &zbus::Message, name: &str, text: &str) -> Result<()> {
        self.conn
            .reply_error(msg, name, &text)
            .await
            .map_err(Error::from_dbus)?;
        Ok(())
    }

    /// Emits `PropertiesChanged` carrying a changed `Value` for a
    /// characteristic or descriptor. `invalidated` is always empty.
    pub async fn emit_value_changed(
        &self,
        path: &str,
        interface: &str,
        value: &[u8],
    ) -> Result<()> {
        let mut changed: HashMap<&str, Value<'_>> = HashMap::new();
        changed.insert("Value", Value::Array(Array::from(value.to_vec())));
        self.emit_properties_changed(path, interface, changed).await
    }

    /// Emits a raw `PropertiesChanged` signal on `path`.
    pub async fn emit_properties_changed(
        &self,
        path: &str,
        interface: &str,
        changed: HashMap<&str, Value<'_>>,
    ) -> Result<()> {
        let invalidated: Vec<&str> = Vec::new();
        self.conn
            .emit_signal(
                None::<&str>,
                path,
                PROPERTIES_IFACE,
                "PropertiesChanged",
                &(interface, changed, invalidated),
            )
            .await
            .map_err(Error::from_dbus)?;
        log::trace!("PropertiesChanged({interface}) emitted on {path}");
        Ok(())
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("registered", &self.registered.len())
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_rules_cover_the_bluez_surface() {
        let rules = bluez_match_rules();
        assert_eq!(rules.len(), 4);

        let strings: Vec<String> = rules.iter().map(|r| r.to_string()).collect();
        assert!(strings
            .iter()
            .any(|s| s.contains("PropertiesChanged") && s.contains("org.bluez")));
        assert!(strings.iter().any(|s| s.contains("InterfacesAdded")));
        assert!(strings.iter().any(|s| s.contains("InterfacesRemoved")));
        assert!(strings
            .iter()
            .any(|s| s.contains("NameOwnerChanged") && s.contains("org.bluez")));
    }
}
