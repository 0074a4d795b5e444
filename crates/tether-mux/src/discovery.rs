//! Wi-Fi discovery bridge
//!
//! Bridges a DNS-SD back-end to the muxer as a state machine driven by the
//! manager loop: `Browse → Resolve(name) → GetAddr(host) → Finalize(device)`.
//! Each transition owns a query handle; address results accumulate per query
//! until the back-end signals that no more are coming, at which point the
//! collected record is committed as a device.
//!
//! Query teardown is deferred onto a pending-close list that the loop drains
//! at the start of each wake-up, before dispatching the next event. The list
//! preserves insertion order, and an address query is always recorded before
//! the resolve query it originated from: closing them in that order is a
//! contract with the discovery back-end.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::device::{Device, DeviceLink};
use crate::error::MuxError;
use crate::muxer::Muxer;

/// Opaque identifier of one active discovery query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryId(pub u64);

/// Wi-Fi discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// DNS-SD service type browsed for device advertisements
    pub service_type: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service_type: "_apple-mobdev2._tcp".to_string(),
        }
    }
}

/// Events produced by the DNS-SD back-end
#[derive(Debug, Clone)]
pub enum DnssdEvent {
    /// A browse query saw a new service instance
    ServiceFound {
        query: QueryId,
        name: String,
        service_type: String,
        domain: String,
    },
    /// A browse query saw a service instance disappear
    ServiceLost { query: QueryId, name: String },
    /// A resolve query produced the full service name and target host
    Resolved {
        query: QueryId,
        fullname: String,
        host: String,
    },
    /// An address query produced one address; `more_coming` keeps the
    /// accumulation phase open
    Address {
        query: QueryId,
        address: String,
        more_coming: bool,
    },
    /// A query failed; it is torn down and discovery continues
    Failure { query: QueryId, message: String },
}

/// DNS-SD back-end driven by the bridge
///
/// Implementations wrap an mDNS responder client; queries report back through
/// the event channel handed to the manager.
pub trait DnssdSession: Send {
    /// Start the root browse query for a service type
    fn browse(&mut self, service_type: &str) -> Result<QueryId, MuxError>;

    /// Resolve one advertised service instance
    fn resolve(&mut self, name: &str, service_type: &str, domain: &str)
        -> Result<QueryId, MuxError>;

    /// Look up the addresses of a resolved host
    fn query_addresses(&mut self, host: &str) -> Result<QueryId, MuxError>;

    /// Tear down a query; the bridge controls the order of these calls
    fn close(&mut self, query: QueryId);
}

/// Maps a Wi-Fi mac address to the stable device serial
pub trait SerialLookup: Send + Sync {
    /// May fail; failure aborts that discovery event only
    fn serial_for_mac(&self, mac: &str) -> Result<String, MuxError>;
}

/// Opens the device stream link for a discovered Wi-Fi device
pub trait WifiLinkFactory: Send + Sync {
    fn open(
        &self,
        serial: &str,
        addresses: &[String],
        service_name: &str,
    ) -> Result<Box<dyn DeviceLink>, MuxError>;
}

/// Collaborators the Wi-Fi discovery bridge drives
pub struct WifiBackend {
    pub config: DiscoveryConfig,
    pub session: Box<dyn DnssdSession>,
    pub events: mpsc::Receiver<DnssdEvent>,
    pub lookup: Arc<dyn SerialLookup>,
    pub links: Arc<dyn WifiLinkFactory>,
}

/// Discovery state machine
struct DiscoveryState {
    session: Box<dyn DnssdSession>,
    browse: Option<QueryId>,
    /// Accumulated results per address query; the first entry is the full
    /// service name stashed when the query was created
    addresses: HashMap<QueryId, Vec<String>>,
    /// Address query back to the resolve query it originated from, so both
    /// can be torn down together
    linked_resolve: HashMap<QueryId, QueryId>,
    pending_close: Vec<QueryId>,
}

impl DiscoveryState {
    fn new(session: Box<dyn DnssdSession>) -> Self {
        Self {
            session,
            browse: None,
            addresses: HashMap::new(),
            linked_resolve: HashMap::new(),
            pending_close: Vec::new(),
        }
    }

    fn start_browse(&mut self, service_type: &str) -> Result<(), MuxError> {
        let query = self.session.browse(service_type)?;
        debug!("browsing {} as query {:?}", service_type, query);
        self.browse = Some(query);
        Ok(())
    }

    fn close_browse(&mut self) {
        if let Some(query) = self.browse.take() {
            self.session.close(query);
        }
    }

    /// Tear down queries scheduled on previous dispatches, in order
    fn drain_removals(&mut self) {
        for query in std::mem::take(&mut self.pending_close) {
            self.session.close(query);
        }
    }

    fn handle_event(
        &mut self,
        mux: &Muxer,
        lookup: &dyn SerialLookup,
        links: &dyn WifiLinkFactory,
        event: DnssdEvent,
    ) {
        match event {
            DnssdEvent::ServiceFound {
                name,
                service_type,
                domain,
                ..
            } => {
                debug!("service {} found in {}", name, domain);
                if let Err(e) = self.session.resolve(&name, &service_type, &domain) {
                    warn!("resolve for {} failed: {}", name, e);
                }
            }
            DnssdEvent::ServiceLost { name, .. } => {
                debug!("ignoring removal of {}; only additions are handled", name);
            }
            DnssdEvent::Resolved {
                query,
                fullname,
                host,
            } => match self.session.query_addresses(&host) {
                Ok(addr_query) => {
                    self.addresses.insert(addr_query, vec![fullname]);
                    self.linked_resolve.insert(addr_query, query);
                }
                Err(e) => {
                    warn!("address query for {} failed: {}", host, e);
                    self.pending_close.push(query);
                }
            },
            DnssdEvent::Address {
                query,
                address,
                more_coming,
            } => {
                match self.addresses.get_mut(&query) {
                    Some(collected) => collected.push(address),
                    None => {
                        debug!("address event for unknown query {:?}", query);
                        return;
                    }
                }
                if !more_coming {
                    self.finalize(mux, lookup, links, query);
                }
            }
            DnssdEvent::Failure { query, message } => {
                warn!("discovery query {:?} failed: {}", query, message);
                self.abandon(query);
            }
        }
    }

    /// Commit one accumulated record as a device
    fn finalize(
        &mut self,
        mux: &Muxer,
        lookup: &dyn SerialLookup,
        links: &dyn WifiLinkFactory,
        query: QueryId,
    ) {
        let mut collected = self.addresses.remove(&query).unwrap_or_default();
        // Schedule teardown up front so every exit path below runs it: the
        // address query strictly before its originating resolve query.
        self.pending_close.push(query);
        if let Some(resolve) = self.linked_resolve.remove(&query) {
            self.pending_close.push(resolve);
        }

        if collected.is_empty() {
            warn!("address query {:?} finalized with no service name", query);
            return;
        }
        let service_name = collected.remove(0);
        let addresses = collected;
        let mac = service_name
            .split('@')
            .next()
            .unwrap_or_default()
            .to_string();

        let serial = match lookup.serial_for_mac(&mac) {
            Ok(serial) => serial,
            Err(e) => {
                warn!("no serial recorded for mac {}: {}", mac, e);
                return;
            }
        };
        if mux.have_wifi_device(&mac) {
            debug!("wifi device {} already registered", mac);
            return;
        }
        if addresses.is_empty() {
            warn!("no addresses collected for {}", service_name);
            return;
        }

        let link = match links.open(&serial, &addresses, &service_name) {
            Ok(link) => link,
            Err(e) => {
                warn!("failed to open link for {}: {}", service_name, e);
                return;
            }
        };
        let dev = Arc::new(Device::wifi(serial, service_name, addresses, link));
        if let Err(e) = mux.add_device(dev) {
            warn!("failed to add wifi device: {}", e);
        }
    }

    /// Failure path: forget the query and schedule it (and any linked
    /// resolve query) for teardown
    fn abandon(&mut self, query: QueryId) {
        self.addresses.remove(&query);
        let linked = self.linked_resolve.remove(&query);
        self.pending_close.push(query);
        if let Some(resolve) = linked {
            self.pending_close.push(resolve);
        }
    }
}

/// Wi-Fi device manager loop
pub(crate) async fn run_wifi_device_manager(
    mux: Arc<Muxer>,
    backend: WifiBackend,
    cancel: CancellationToken,
) {
    let WifiBackend {
        config,
        session,
        mut events,
        lookup,
        links,
    } = backend;

    let mut state = DiscoveryState::new(session);
    if let Err(e) = state.start_browse(&config.service_type) {
        error!("failed to start browsing {}: {}", config.service_type, e);
        return;
    }
    info!("wifi device manager started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => {
                    state.drain_removals();
                    state.handle_event(&mux, lookup.as_ref(), links.as_ref(), event);
                }
                None => break,
            },
        }
    }

    state.drain_removals();
    state.close_browse();
    info!("wifi device manager stopped");
}
