//! A BlueZ GATT peripheral library.
//!
//! `bzperi` lets a Linux application declare a hierarchy of GATT services,
//! characteristics and descriptors, publishes that hierarchy on the system
//! D-Bus under the `org.bluez` contract, drives the local adapter into an
//! advertising peripheral state, and forwards read/write/notify traffic
//! between remote GATT clients and application-supplied data callbacks.
//!
//! # Overview
//!
//! 1. Register one or more *configurators* with
//!    [`dsl::register_configurator`]. A configurator declares services
//!    with the nested-closure DSL.
//! 2. Call [`Server::start`] with a [`ServerConfig`]. The server owns
//!    `com.<service_name>` on the system bus, registers the GATT
//!    application with BlueZ and starts advertising.
//! 3. When application data changes, push a notification with
//!    [`Server::notify_updated_characteristic`]; the event loop invokes
//!    the characteristic's update handler and broadcasts the new value to
//!    subscribed clients.
//! 4. Stop with [`Server::shutdown_and_wait`].
//!
//! The library requires a running BlueZ daemon and permission to own the
//! derived name on the system bus.

pub mod address;
pub mod adapter;
pub mod advertising;
pub mod dsl;
mod error;
pub mod interface;
mod introspect;
pub mod logger;
pub mod path;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod server;
pub mod tree;
pub mod uuid;

pub use error::{Error, HandlerError, Result};
pub use introspect::introspection_xml;
pub use server::{
    derived_bus_name, derived_root_path, Health, RunState, Server, ServerConfig,
};

pub use adapter::{AdapterInfo, DeviceInfo};
pub use address::Address;
pub use dsl::{clear_configurators, configurator_count, register_configurator, Configurator};
pub use interface::{CharFlags, DataGetter, DataSetter};
pub use queue::UpdateEntry;
pub use retry::RetryPolicy;
pub use uuid::GattUuid;
