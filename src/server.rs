//! Server configuration, lifecycle and the event-loop engine.
//!
//! [`Server::start`] validates the configuration, builds the GATT tree by
//! applying every registered configurator, spawns the event-loop thread,
//! and blocks until the initialisation checklist reaches `Running` (or the
//! init timeout expires). The event loop then owns all bus traffic; the
//! handle's methods are the only cross-thread surface.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use async_io::Timer;
use futures_util::future::{self, Either};
use futures_util::StreamExt;
use parking_lot::{Condvar, Mutex};
use zbus::{MessageStream, MessageType};

use crate::adapter::{AdapterController, AdapterInfo, AdapterSettings, ConnectionCallback};
use crate::advertising;
use crate::dsl::{self, ServerBuilder};
use crate::error::{Error, Result};
use crate::interface::{
    DataAccess, DataGetter, DataSetter, UpdateContext, GATT_CHARACTERISTIC_IFACE,
    GATT_DESCRIPTOR_IFACE, OBJECT_MANAGER_IFACE, PROPERTIES_IFACE,
};
use crate::logger;
use crate::path::NodePath;
use crate::publisher::{self, Publisher};
use crate::queue::{UpdateEntry, UpdateQueue};
use crate::retry::CancelToken;
use crate::tree::GattTree;

/// The dispatcher tick period.
const TICK_PERIOD: Duration = Duration::from_millis(10);
/// Delay between re-attempts of a failed initialisation milestone.
const INIT_RETRY_DELAY: Duration = Duration::from_secs(2);
/// Delay before recovery after BlueZ disappears from the bus.
const RECOVERY_DELAY: Duration = Duration::from_secs(5);
/// Backoff before the second (and last) recovery attempt.
const RECOVERY_RETRY_DELAY: Duration = Duration::from_secs(15);

/// Derives the well-known bus name from a validated service name.
pub fn derived_bus_name(service_name: &str) -> String {
    format!("com.{service_name}")
}

/// Derives the root object path from a validated service name.
pub fn derived_root_path(service_name: &str) -> String {
    format!("/com/{}", service_name.replace('.', "/"))
}

/// Validates a service name: lower-case, at most 255 bytes, and either
/// `"bzperi"` or `"bzperi."` followed by dot-separated identifier
/// segments.
pub fn validate_service_name(name: &str) -> Result<()> {
    let invalid = |why: &str| Error::InvalidServiceName(format!("'{name}': {why}"));

    if name.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if name.len() > 255 {
        return Err(invalid("must be at most 255 bytes"));
    }
    if name == "bzperi" {
        return Ok(());
    }
    let Some(rest) = name.strip_prefix("bzperi.") else {
        return Err(invalid("must be 'bzperi' or start with 'bzperi.'"));
    };
    for segment in rest.split('.') {
        if segment.is_empty() {
            return Err(invalid("empty name segment"));
        }
        if !segment
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
        {
            return Err(invalid("segments must match [a-z0-9_]+"));
        }
    }
    Ok(())
}

/// The immutable server configuration. Built once, consumed by
/// [`Server::start`].
#[derive(Clone)]
pub struct ServerConfig {
    /// The service name; lower-cased and validated at start. Derives the
    /// owned bus name (`com.<name>`) and the root object path.
    pub service_name: String,
    /// The adapter name advertised over LE. Empty leaves the system-wide
    /// adapter name untouched.
    pub advertising_name: String,
    /// The shortened name used when the full name does not fit the
    /// advertising payload.
    pub advertising_short_name: String,
    /// Whether the adapter accepts pairing requests.
    pub enable_bondable: bool,
    /// Whether the adapter is made generally discoverable.
    pub enable_discoverable: bool,
    /// Whether LE advertising is switched on after registration.
    pub enable_advertising: bool,
    /// Optional adapter hint: a path, an address, or a trailing path
    /// substring such as `"hci0"`.
    pub preferred_adapter: Option<String>,
    /// How long [`Server::start`] waits for the `Running` state.
    pub init_timeout: Duration,
    pub data_getter: DataGetter,
    pub data_setter: DataSetter,
    /// Optional host callback for device connect/disconnect events.
    pub on_connection_change: Option<ConnectionCallback>,
}

impl ServerConfig {
    /// Creates a configuration with the conventional defaults: bondable,
    /// discoverable, advertising, 30 s init timeout.
    pub fn new(
        service_name: impl Into<String>,
        advertising_name: impl Into<String>,
        advertising_short_name: impl Into<String>,
        data_getter: DataGetter,
        data_setter: DataSetter,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            advertising_name: advertising_name.into(),
            advertising_short_name: advertising_short_name.into(),
            enable_bondable: true,
            enable_discoverable: true,
            enable_advertising: true,
            preferred_adapter: None,
            init_timeout: Duration::from_secs(30),
            data_getter,
            data_setter,
            on_connection_change: None,
        }
    }

    /// Validates the configuration and returns the lower-cased service
    /// name.
    fn validate(&self) -> Result<String> {
        let service_name = self.service_name.to_lowercase();
        validate_service_name(&service_name)?;

        let millis = self.init_timeout.as_millis();
        if !(100..=60_000).contains(&millis) {
            return Err(Error::InvalidArgument(format!(
                "init_timeout must be within [100, 60000] ms, got {millis}"
            )));
        }
        Ok(service_name)
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("service_name", &self.service_name)
            .field("advertising_name", &self.advertising_name)
            .field("enable_bondable", &self.enable_bondable)
            .field("enable_discoverable", &self.enable_discoverable)
            .field("enable_advertising", &self.enable_advertising)
            .field("init_timeout", &self.init_timeout)
            .finish_non_exhaustive()
    }
}

/// The externally observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunState {
    Uninitialized,
    Initializing,
    Running,
    Stopping,
    Stopped,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Uninitialized => "uninitialized",
            RunState::Initializing => "initializing",
            RunState::Running => "running",
            RunState::Stopping => "stopping",
            RunState::Stopped => "stopped",
        }
    }
}

/// Server health, separate from the run state and monotone non-improving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Ok,
    /// A failure before `Running` was reached.
    FailedInit,
    /// A failure after `Running` was reached.
    FailedRun,
}

impl Health {
    pub fn as_str(&self) -> &'static str {
        match self {
            Health::Ok => "ok",
            Health::FailedInit => "failed-init",
            Health::FailedRun => "failed-run",
        }
    }
}

/// State shared between the handle and the event-loop thread.
struct Shared {
    run_state: Mutex<RunState>,
    run_state_cv: Condvar,
    health: Mutex<Health>,
    queue: UpdateQueue,
    cancel: CancelToken,
    shutdown: AtomicBool,
    adapter_info: Mutex<Option<AdapterInfo>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            run_state: Mutex::new(RunState::Uninitialized),
            run_state_cv: Condvar::new(),
            health: Mutex::new(Health::Ok),
            queue: UpdateQueue::new(),
            cancel: CancelToken::new(),
            shutdown: AtomicBool::new(false),
            adapter_info: Mutex::new(None),
        }
    }

    fn set_run_state(&self, state: RunState) {
        let mut guard = self.run_state.lock();
        if *guard != state {
            log::debug!("run state {} -> {}", guard.as_str(), state.as_str());
            *guard = state;
            self.run_state_cv.notify_all();
        }
    }

    fn run_state(&self) -> RunState {
        *self.run_state.lock()
    }

    /// Records a failure. Health never improves once degraded.
    fn degrade(&self, health: Health) {
        let mut guard = self.health.lock();
        if *guard == Health::Ok {
            *guard = health;
        }
    }

    fn health(&self) -> Health {
        *self.health.lock()
    }

    fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.cancel.cancel();
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Blocks until the run state satisfies `done` or the deadline passes;
    /// returns the state observed last.
    fn wait_run_state(&self, deadline: Instant, done: impl Fn(RunState) -> bool) -> RunState {
        let mut guard = self.run_state.lock();
        while !done(*guard) {
            if self.run_state_cv.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
        *guard
    }
}

/// A running GATT peripheral server.
///
/// Returned by [`Server::start`]. Dropping the handle does not stop the
/// server; call [`Server::shutdown_and_wait`].
pub struct Server {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Validates `config`, applies all registered configurators, launches
    /// the event-loop thread and waits for the server to reach `Running`.
    ///
    /// On failure the event loop is already torn down when this returns;
    /// the error describes the first fatal condition.
    pub fn start(config: ServerConfig) -> Result<Server> {
        let service_name = config.validate()?;
        let bus_name = derived_bus_name(&service_name);
        let root_path: NodePath = derived_root_path(&service_name).parse()?;

        let data = DataAccess::new(config.data_getter.clone(), config.data_setter.clone());

        // Build the tree: configurators first, then the advertisement node.
        let mut tree = GattTree::new(root_path.clone());
        dsl::apply_all(&mut ServerBuilder::new(&mut tree))?;
        tree.validate_update_handlers()?;

        let ad_state = advertising::advertisement_state(
            &tree,
            &config.advertising_short_name,
            false,
        );
        let advertisement_path = advertising::install_advertisement(&mut tree, ad_state)?;

        let shared = Arc::new(Shared::new());
        let engine = Engine {
            shared: shared.clone(),
            tree: Arc::new(tree),
            data,
            bus_name: bus_name.clone(),
            root_path,
            advertisement_path,
            settings: AdapterSettings {
                alias: if config.advertising_name.is_empty() {
                    None
                } else {
                    Some(config.advertising_name.clone())
                },
                bondable: config.enable_bondable,
                discoverable: config.enable_discoverable,
            },
            enable_advertising: config.enable_advertising,
            preferred_adapter: config.preferred_adapter.clone(),
            on_connection_change: config.on_connection_change.clone(),
        };

        logger::status(&format!(
            "starting GATT server '{bus_name}' (advertising: {})",
            config.enable_advertising
        ));

        let thread = std::thread::Builder::new()
            .name("bzperi-server".into())
            .spawn(move || async_io::block_on(engine.run()))
            .map_err(Error::Io)?;

        let server = Server {
            shared,
            thread: Mutex::new(Some(thread)),
        };

        let deadline = Instant::now() + config.init_timeout;
        let observed = server.shared.wait_run_state(deadline, |state| {
            state == RunState::Running || state == RunState::Stopped
        });

        match observed {
            RunState::Running => Ok(server),
            RunState::Stopped => {
                server.join_thread();
                Err(Error::Failed(format!(
                    "server failed to initialise (health: {})",
                    server.health().as_str()
                )))
            }
            _ => {
                server.shared.degrade(Health::FailedInit);
                server.trigger_shutdown();
                server.join_thread();
                Err(Error::Timeout(config.init_timeout))
            }
        }
    }

    /// Enqueues a change notification for the object at `path`.
    pub fn push_update(&self, path: impl Into<String>, interface: impl Into<String>) {
        self.shared
            .queue
            .push_front(UpdateEntry::new(path, interface));
    }

    /// Enqueues a change notification for a characteristic.
    pub fn notify_updated_characteristic(&self, path: impl Into<String>) {
        self.push_update(path, GATT_CHARACTERISTIC_IFACE);
    }

    /// Enqueues a change notification for a descriptor.
    pub fn notify_updated_descriptor(&self, path: impl Into<String>) {
        self.push_update(path, GATT_DESCRIPTOR_IFACE);
    }

    /// Pops the oldest queued update. With `keep`, the entry stays queued.
    pub fn pop_update(&self, keep: bool) -> Option<UpdateEntry> {
        self.shared.queue.pop_back(keep)
    }

    /// Pops the oldest queued update into `buf` in the
    /// `"<path>|<interface>"` encoding; see [`UpdateQueue::pop_back_encoded`].
    pub fn pop_update_encoded(&self, buf: &mut [u8], keep: bool) -> i32 {
        self.shared.queue.pop_back_encoded(buf, keep)
    }

    pub fn update_queue_size(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn update_queue_is_empty(&self) -> bool {
        self.shared.queue.is_empty()
    }

    pub fn update_queue_clear(&self) {
        self.shared.queue.clear()
    }

    /// The adapter snapshot captured at selection time, once initialised.
    pub fn adapter_info(&self) -> Option<AdapterInfo> {
        self.shared.adapter_info.lock().clone()
    }

    pub fn run_state(&self) -> RunState {
        self.shared.run_state()
    }

    pub fn health(&self) -> Health {
        self.shared.health()
    }

    pub fn is_running(&self) -> bool {
        self.run_state() == RunState::Running
    }

    /// Asks the event loop to stop. Non-blocking; pending retries are
    /// cancelled and the advertisement is unregistered during teardown.
    pub fn trigger_shutdown(&self) {
        if !self.shared.shutdown_requested() {
            logger::status("shutdown requested");
        }
        self.shared.request_shutdown();
    }

    /// Blocks until the event-loop thread has exited. Returns `true` iff
    /// the server is healthy (no recorded failure).
    pub fn wait_until_stopped(&self) -> bool {
        self.join_thread();
        logger::status("server stopped");
        logger::reset_sinks();
        self.health() == Health::Ok
    }

    /// [`Server::trigger_shutdown`] followed by [`Server::wait_until_stopped`].
    pub fn shutdown_and_wait(&self) -> bool {
        self.trigger_shutdown();
        self.wait_until_stopped()
    }

    fn join_thread(&self) {
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                log::error!("event-loop thread panicked");
                self.shared.degrade(Health::FailedRun);
            }
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("run_state", &self.run_state().as_str())
            .field("health", &self.health().as_str())
            .finish()
    }
}

/// Pending BlueZ-loss recovery bookkeeping.
struct Recovery {
    deadline: Instant,
    attempt: u32,
}

/// The event-loop engine: owns the connection, publisher and adapter
/// controller for the lifetime of the server thread.
struct Engine {
    shared: Arc<Shared>,
    tree: Arc<GattTree>,
    data: DataAccess,
    bus_name: String,
    root_path: NodePath,
    advertisement_path: NodePath,
    settings: AdapterSettings,
    enable_advertising: bool,
    preferred_adapter: Option<String>,
    on_connection_change: Option<ConnectionCallback>,
}

impl Engine {
    async fn run(self) {
        self.shared.set_run_state(RunState::Initializing);

        match self.init().await {
            Ok((mut publisher, mut controller)) => {
                *self.shared.adapter_info.lock() =
                    Some(controller.adapter_info().clone());
                self.shared.set_run_state(RunState::Running);
                logger::status(&format!(
                    "GATT server running on {} as {}",
                    controller.adapter_info().path,
                    self.bus_name
                ));

                self.serve(&publisher, &mut controller).await;

                self.shared.set_run_state(RunState::Stopping);
                self.teardown(&mut publisher, &mut controller).await;
            }
            Err(e) => {
                logger::fatal(&format!("server initialisation failed: {e}"));
                self.shared.degrade(Health::FailedInit);
            }
        }

        self.shared.set_run_state(RunState::Stopped);
    }

    /// Walks the initialisation checklist:
    /// bus → owned name → signal subscriptions → adapter → configuration →
    /// tree registration → application registration → advertising.
    ///
    /// Each milestone is re-attempted on the init retry clock while it
    /// fails with a retryable error; terminal errors and shutdown abort
    /// the checklist.
    async fn init(&self) -> Result<(Publisher, AdapterController)> {
        /// One checklist arrow; re-evaluates `$op` on every attempt.
        macro_rules! milestone {
            ($what:expr, $op:expr) => {
                'attempt: loop {
                    if self.shared.shutdown_requested() {
                        break 'attempt Err(Error::Failed(format!(
                            "shutdown during init step '{}'",
                            $what
                        )));
                    }
                    match $op {
                        Ok(value) => {
                            log::debug!("init: {} complete", $what);
                            break 'attempt Ok(value);
                        }
                        Err(e) if e.is_retryable() => {
                            log::warn!(
                                "init step '{}' failed: {e}; retrying in {INIT_RETRY_DELAY:?}",
                                $what
                            );
                            Timer::after(INIT_RETRY_DELAY).await;
                        }
                        Err(e) => break 'attempt Err(e),
                    }
                }
            };
        }

        let conn: zbus::Connection =
            milestone!("acquire system bus", publisher::acquire_bus().await)?;

        milestone!(
            "acquire bus name",
            publisher::acquire_name(&conn, &self.bus_name).await
        )?;

        let mut publisher = Publisher::new(conn.clone(), self.tree.clone(), self.data.clone());
        milestone!("subscribe BlueZ signals", publisher.subscribe_signals().await)?;

        let mut controller = milestone!(
            "select BlueZ adapter",
            AdapterController::initialize(
                conn.clone(),
                self.preferred_adapter.as_deref(),
                self.settings.clone(),
                self.root_path.clone(),
                self.advertisement_path.clone(),
                self.shared.cancel.clone(),
                self.on_connection_change.clone(),
            )
            .await
        )?;

        milestone!("configure adapter", controller.configure().await)?;

        milestone!("register object tree", publisher.register_tree())?;

        milestone!(
            "register GATT application",
            controller.register_application().await
        )?;

        if self.enable_advertising {
            milestone!(
                "enable LE advertising",
                controller.set_advertising(true).await
            )?;
        }

        Ok((publisher, controller))
    }

    /// The running phase: drains inbound messages and runs the periodic
    /// dispatcher tick until shutdown.
    async fn serve(&self, publisher: &Publisher, controller: &mut AdapterController) {
        let mut stream = MessageStream::from(publisher.connection());
        let mut tick = Timer::interval(TICK_PERIOD);
        let mut recovery: Option<Recovery> = None;

        loop {
            if self.shared.shutdown_requested() {
                break;
            }

            match future::select(stream.next(), tick.next()).await {
                Either::Left((Some(Ok(msg)), _)) => {
                    self.handle_message(publisher, controller, &mut recovery, &msg)
                        .await;
                }
                Either::Left((Some(Err(e)), _)) => {
                    log::warn!("error on message stream: {e}");
                }
                Either::Left((None, _)) => {
                    logger::fatal("bus connection closed unexpectedly");
                    self.shared.degrade(Health::FailedRun);
                    break;
                }
                Either::Right(_) => {
                    self.on_tick(publisher, controller, &mut recovery).await;
                }
            }
        }
    }

    async fn handle_message(
        &self,
        publisher: &Publisher,
        controller: &mut AdapterController,
        recovery: &mut Option<Recovery>,
        msg: &Arc<zbus::Message>,
    ) {
        match msg.message_type() {
            MessageType::MethodCall => match publisher.handle_method_call(msg).await {
                Ok(true) => {}
                Ok(false) => log::trace!("ignoring method call for foreign path"),
                Err(e) => log::error!("failed to dispatch method call: {e}"),
            },
            MessageType::Signal => {
                self.handle_signal(publisher, controller, recovery, msg).await;
            }
            _ => {}
        }
    }

    async fn handle_signal(
        &self,
        publisher: &Publisher,
        controller: &mut AdapterController,
        recovery: &mut Option<Recovery>,
        msg: &Arc<zbus::Message>,
    ) {
        let interface = msg.interface().map(|i| i.to_string()).unwrap_or_default();
        let member = msg.member().map(|m| m.to_string()).unwrap_or_default();

        match (interface.as_str(), member.as_str()) {
            (PROPERTIES_IFACE, "PropertiesChanged") => {
                let Ok((iface, changed, _invalidated)) =
                    msg.body::<(String, HashMap<String, zbus::zvariant::OwnedValue>, Vec<String>)>()
                else {
                    return;
                };
                if iface == "org.bluez.Device1" {
                    let path = msg.path().map(|p| p.to_string()).unwrap_or_default();
                    controller
                        .handle_device_properties_changed(&path, &changed)
                        .await;
                }
            }
            (OBJECT_MANAGER_IFACE, "InterfacesAdded") => {
                let Ok((path, interfaces)) = msg.body::<(
                    zbus::zvariant::OwnedObjectPath,
                    HashMap<String, HashMap<String, zbus::zvariant::OwnedValue>>,
                )>() else {
                    return;
                };
                controller.handle_interfaces_added(path.as_str(), &interfaces);
            }
            (OBJECT_MANAGER_IFACE, "InterfacesRemoved") => {
                let Ok((path, interfaces)) =
                    msg.body::<(zbus::zvariant::OwnedObjectPath, Vec<String>)>()
                else {
                    return;
                };
                controller.handle_interfaces_removed(path.as_str(), &interfaces);
            }
            ("org.freedesktop.DBus", "NameOwnerChanged") => {
                let Ok((name, _old, new)) = msg.body::<(String, String, String)>() else {
                    return;
                };
                if name == "org.bluez" {
                    if new.is_empty() {
                        logger::status(
                            "BlueZ disappeared from the bus; scheduling recovery",
                        );
                        *recovery = Some(Recovery {
                            deadline: Instant::now() + RECOVERY_DELAY,
                            attempt: 0,
                        });
                    } else {
                        log::info!("BlueZ returned to the bus (owner {new})");
                    }
                }
            }
            ("org.freedesktop.DBus", "NameLost") => {
                let Ok(name) = msg.body::<String>() else {
                    return;
                };
                if name == self.bus_name {
                    log::warn!("lost bus name {name}; attempting to re-acquire");
                    self.reacquire_name(publisher).await;
                }
            }
            _ => {}
        }
    }

    /// Tries to win the well-known name back after a `NameLost`. The name
    /// is load-bearing: without it remote clients cannot reach the tree,
    /// so exhausting the retries degrades health and stops the server.
    async fn reacquire_name(&self, publisher: &Publisher) {
        let policy = crate::retry::RetryPolicy::DEFAULT;
        for attempt in 1..=policy.max_attempts {
            match publisher::acquire_name(publisher.connection(), &self.bus_name).await {
                Ok(()) => {
                    logger::status(&format!("re-acquired bus name {}", self.bus_name));
                    return;
                }
                Err(e) if attempt < policy.max_attempts => {
                    let delay = policy.delay(attempt);
                    log::warn!("re-acquiring {} failed: {e}; retrying in {delay:?}", self.bus_name);
                    Timer::after(delay).await;
                }
                Err(e) => {
                    logger::fatal(&format!("could not re-acquire bus name: {e}"));
                    self.shared.degrade(Health::FailedRun);
                    self.shared.request_shutdown();
                }
            }
        }
    }

    async fn on_tick(
        &self,
        publisher: &Publisher,
        controller: &mut AdapterController,
        recovery: &mut Option<Recovery>,
    ) {
        if let Some(pending) = recovery.take() {
            if Instant::now() >= pending.deadline {
                match controller.recover().await {
                    Ok(()) => logger::status("BlueZ recovery succeeded"),
                    Err(e) if pending.attempt == 0 => {
                        log::warn!(
                            "BlueZ recovery failed: {e}; retrying in {RECOVERY_RETRY_DELAY:?}"
                        );
                        *recovery = Some(Recovery {
                            deadline: Instant::now() + RECOVERY_RETRY_DELAY,
                            attempt: 1,
                        });
                    }
                    Err(e) => {
                        logger::fatal(&format!("BlueZ recovery failed twice: {e}"));
                        self.shared.degrade(Health::FailedRun);
                    }
                }
                return;
            }
            *recovery = Some(pending);
            return;
        }

        if self.shared.run_state() != RunState::Running {
            return;
        }

        // One entry per tick caps latency amplification under load.
        self.dispatch_one_update(publisher).await;
    }

    /// Pops one queued update and runs the matching update handler, which
    /// yields the value broadcast via `PropertiesChanged`.
    async fn dispatch_one_update(&self, publisher: &Publisher) {
        let Some(entry) = self.shared.queue.pop_back(false) else {
            return;
        };

        let path = entry.object_path();
        let Some(interface) = self.tree.find_interface(path, entry.interface_name()) else {
            log::warn!("queued update for unknown object {}", entry.encode());
            return;
        };

        let Some(on_updated) = interface.update_handler() else {
            log::debug!("no update handler for {}", entry.encode());
            return;
        };

        let ctx = UpdateContext {
            path,
            data: &self.data,
        };
        if let Some(value) = on_updated(&ctx) {
            if let Some(cache) = interface.value_cache() {
                *cache.lock() = Some(value.clone());
            }
            if let Err(e) = publisher
                .emit_value_changed(path, entry.interface_name(), &value)
                .await
            {
                log::error!("failed to emit value change for {path}: {e}");
            }
        }
    }

    /// Ordered teardown, the reverse of the initialisation checklist.
    async fn teardown(&self, publisher: &mut Publisher, controller: &mut AdapterController) {
        controller.shutdown().await;
        publisher.unsubscribe_signals().await;
        publisher.unregister_tree();
        if let Err(e) = publisher::release_name(publisher.connection(), &self.bus_name).await {
            log::debug!("failed to release bus name during teardown: {e}");
        }
        logger::status("teardown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn getter() -> DataGetter {
        Arc::new(|_name| None)
    }

    fn setter() -> DataSetter {
        Arc::new(|_name, _data| true)
    }

    fn config(service_name: &str) -> ServerConfig {
        ServerConfig::new(service_name, "BzPeri", "BzPeri", getter(), setter())
    }

    #[test]
    fn derivations_match_the_bus_contract() {
        assert_eq!(derived_bus_name("bzperi"), "com.bzperi");
        assert_eq!(derived_root_path("bzperi"), "/com/bzperi");
        assert_eq!(derived_bus_name("bzperi.myapp"), "com.bzperi.myapp");
        assert_eq!(derived_root_path("bzperi.myapp"), "/com/bzperi/myapp");
        assert_eq!(
            derived_root_path("bzperi.org.example"),
            "/com/bzperi/org/example"
        );
    }

    #[test]
    fn service_name_validation_boundaries() {
        assert!(validate_service_name("bzperi").is_ok());
        assert!(validate_service_name("bzperi.myapp").is_ok());
        assert!(validate_service_name("bzperi.my_app.v2").is_ok());

        for name in ["", "other", "bzperi.", "bzperi..x", "bzperi.MyApp", "bzperi.my-app", "bzperix"] {
            assert!(
                matches!(validate_service_name(name), Err(Error::InvalidServiceName(_))),
                "accepted {name:?}"
            );
        }

        let long = format!("bzperi.{}", "a".repeat(255));
        assert!(validate_service_name(&long).is_err());
    }

    #[test]
    fn config_validation_lowercases_and_bounds_timeout() {
        let cfg = config("BzPeri.MyApp");
        assert_eq!(cfg.validate().unwrap(), "bzperi.myapp");

        let mut too_short = config("bzperi");
        too_short.init_timeout = Duration::from_millis(99);
        assert!(matches!(
            too_short.validate(),
            Err(Error::InvalidArgument(_))
        ));

        let mut too_long = config("bzperi");
        too_long.init_timeout = Duration::from_millis(60_001);
        assert!(too_long.validate().is_err());

        let mut edge = config("bzperi");
        edge.init_timeout = Duration::from_millis(100);
        assert!(edge.validate().is_ok());
        edge.init_timeout = Duration::from_millis(60_000);
        assert!(edge.validate().is_ok());
    }

    #[test]
    fn run_state_and_health_stringify() {
        assert_eq!(RunState::Running.as_str(), "running");
        assert_eq!(RunState::Stopped.as_str(), "stopped");
        assert_eq!(Health::Ok.as_str(), "ok");
        assert_eq!(Health::FailedInit.as_str(), "failed-init");
        assert_eq!(Health::FailedRun.as_str(), "failed-run");
    }

    #[test]
    fn health_is_monotone_non_improving() {
        let shared = Shared::new();
        assert_eq!(shared.health(), Health::Ok);
        shared.degrade(Health::FailedInit);
        assert_eq!(shared.health(), Health::FailedInit);
        shared.degrade(Health::FailedRun);
        assert_eq!(shared.health(), Health::FailedInit);
    }

    #[test]
    fn run_state_waiters_observe_transitions() {
        let shared = Arc::new(Shared::new());
        let waiter = shared.clone();
        let handle = std::thread::spawn(move || {
            waiter.wait_run_state(Instant::now() + Duration::from_secs(5), |s| {
                s == RunState::Running
            })
        });

        std::thread::sleep(Duration::from_millis(20));
        shared.set_run_state(RunState::Initializing);
        shared.set_run_state(RunState::Running);
        assert_eq!(handle.join().unwrap(), RunState::Running);
    }

    #[test]
    fn run_state_wait_times_out() {
        let shared = Shared::new();
        let observed = shared.wait_run_state(Instant::now() + Duration::from_millis(30), |s| {
            s == RunState::Running
        });
        assert_eq!(observed, RunState::Uninitialized);
    }
}
