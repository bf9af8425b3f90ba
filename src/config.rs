// Copyright 2024 meshp2p developers
//
// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
// OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

//! Node configuration.

use crate::{
    addresses::AnnounceFilter,
    connection::{
        dial_queue::{default_address_sorter, AddressSorter, DialQueueConfig},
        manager::ConnectionLimits,
    },
    crypto::ed25519::Keypair,
    executor::{DefaultExecutor, Executor},
    gater::{AllowAll, ConnectionGater},
    mux::StreamMuxerFactory,
    peer_store::{Datastore, MemoryDatastore},
    protocol::identify::IdentifyConfig,
    security::{ConnectionProtector, ConnectionSecurity},
    transport::Transport,
};

use multiaddr::Multiaddr;
use trust_dns_resolver::TokioAsyncResolver;

use std::{sync::Arc, time::Duration};

/// Default number of observed addresses tracked.
const DEFAULT_MAX_OBSERVED_ADDRESSES: usize = 10;

/// Default inbound-upgrade timeout.
const DEFAULT_INBOUND_UPGRADE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time allowed for a graceful stop.
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// Node configuration, built with [`ConfigBuilder`].
pub struct Config {
    pub(crate) keypair: Keypair,
    pub(crate) transports: Vec<Arc<dyn Transport>>,
    pub(crate) security: Vec<Arc<dyn ConnectionSecurity>>,
    pub(crate) muxers: Vec<Arc<dyn StreamMuxerFactory>>,
    pub(crate) protector: Option<Arc<dyn ConnectionProtector>>,
    pub(crate) gater: Arc<dyn ConnectionGater>,
    pub(crate) datastore: Arc<dyn Datastore>,
    pub(crate) listen_addresses: Vec<Multiaddr>,
    pub(crate) announce_addresses: Vec<Multiaddr>,
    pub(crate) announce_filter: Option<AnnounceFilter>,
    pub(crate) max_observed_addresses: usize,
    pub(crate) limits: ConnectionLimits,
    pub(crate) dial: DialQueueConfig,
    pub(crate) inbound_upgrade_timeout: Duration,
    pub(crate) stop_timeout: Duration,
    pub(crate) identify: IdentifyConfig,
    pub(crate) resolver: Option<Arc<TokioAsyncResolver>>,
    pub(crate) address_sorter: AddressSorter,
    pub(crate) executor: Arc<dyn Executor>,
}

impl Config {
    /// Get the keypair.
    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }
}

/// Builder for [`Config`].
pub struct ConfigBuilder {
    keypair: Option<Keypair>,
    transports: Vec<Arc<dyn Transport>>,
    security: Vec<Arc<dyn ConnectionSecurity>>,
    muxers: Vec<Arc<dyn StreamMuxerFactory>>,
    protector: Option<Arc<dyn ConnectionProtector>>,
    gater: Option<Arc<dyn ConnectionGater>>,
    datastore: Option<Arc<dyn Datastore>>,
    listen_addresses: Vec<Multiaddr>,
    announce_addresses: Vec<Multiaddr>,
    announce_filter: Option<AnnounceFilter>,
    max_observed_addresses: usize,
    limits: ConnectionLimits,
    dial: DialQueueConfig,
    inbound_upgrade_timeout: Duration,
    stop_timeout: Duration,
    identify: IdentifyConfig,
    resolver: Option<Arc<TokioAsyncResolver>>,
    address_sorter: Option<AddressSorter>,
    executor: Option<Arc<dyn Executor>>,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    /// Create a new, empty builder.
    pub fn new() -> Self {
        Self {
            keypair: None,
            transports: Vec::new(),
            security: Vec::new(),
            muxers: Vec::new(),
            protector: None,
            gater: None,
            datastore: None,
            listen_addresses: Vec::new(),
            announce_addresses: Vec::new(),
            announce_filter: None,
            max_observed_addresses: DEFAULT_MAX_OBSERVED_ADDRESSES,
            limits: ConnectionLimits::default(),
            dial: DialQueueConfig::default(),
            inbound_upgrade_timeout: DEFAULT_INBOUND_UPGRADE_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            identify: IdentifyConfig::default(),
            resolver: None,
            address_sorter: None,
            executor: None,
        }
    }

    /// Set the node keypair.
    pub fn with_keypair(mut self, keypair: Keypair) -> Self {
        self.keypair = Some(keypair);
        self
    }

    /// Register a transport.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.push(transport);
        self
    }

    /// Register a connection encryption method.
    pub fn with_security(mut self, security: Arc<dyn ConnectionSecurity>) -> Self {
        self.security.push(security);
        self
    }

    /// Register a stream muxer.
    pub fn with_muxer(mut self, muxer: Arc<dyn StreamMuxerFactory>) -> Self {
        self.muxers.push(muxer);
        self
    }

    /// Set a private-network protector.
    pub fn with_protector(mut self, protector: Arc<dyn ConnectionProtector>) -> Self {
        self.protector = Some(protector);
        self
    }

    /// Set the connection gater.
    pub fn with_connection_gater(mut self, gater: Arc<dyn ConnectionGater>) -> Self {
        self.gater = Some(gater);
        self
    }

    /// Set the datastore backing the peer store.
    pub fn with_datastore(mut self, datastore: Arc<dyn Datastore>) -> Self {
        self.datastore = Some(datastore);
        self
    }

    /// Add a listen address.
    pub fn with_listen_address(mut self, address: Multiaddr) -> Self {
        self.listen_addresses.push(address);
        self
    }

    /// Override the advertised addresses.
    pub fn with_announce_addresses(mut self, addresses: Vec<Multiaddr>) -> Self {
        self.announce_addresses = addresses;
        self
    }

    /// Set the filter applied to the advertised address set.
    pub fn with_announce_filter(mut self, filter: AnnounceFilter) -> Self {
        self.announce_filter = Some(filter);
        self
    }

    /// Cap the observed-address set.
    pub fn with_max_observed_addresses(mut self, max: usize) -> Self {
        self.max_observed_addresses = max;
        self
    }

    /// Set the connection limits.
    pub fn with_connection_limits(mut self, limits: ConnectionLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Set the dial-queue limits and timeouts.
    pub fn with_dial_config(mut self, dial: DialQueueConfig) -> Self {
        self.dial = dial;
        self
    }

    /// Set the inbound-upgrade timeout.
    pub fn with_inbound_upgrade_timeout(mut self, timeout: Duration) -> Self {
        self.inbound_upgrade_timeout = timeout;
        self
    }

    /// Set the time allowed for a graceful stop.
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Set the identify configuration.
    pub fn with_identify_config(mut self, identify: IdentifyConfig) -> Self {
        self.identify = identify;
        self
    }

    /// Set the DNS resolver used for address expansion.
    pub fn with_dns_resolver(mut self, resolver: Arc<TokioAsyncResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Set the candidate-address sorter used by the dial queue.
    pub fn with_address_sorter(mut self, sorter: AddressSorter) -> Self {
        self.address_sorter = Some(sorter);
        self
    }

    /// Set the executor used for background service loops.
    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Build the [`Config`], generating a keypair if none was provided.
    pub fn build(self) -> Config {
        Config {
            keypair: self.keypair.unwrap_or_else(Keypair::generate),
            transports: self.transports,
            security: self.security,
            muxers: self.muxers,
            protector: self.protector,
            gater: self.gater.unwrap_or_else(|| Arc::new(AllowAll)),
            datastore: self.datastore.unwrap_or_else(|| Arc::new(MemoryDatastore::default())),
            listen_addresses: self.listen_addresses,
            announce_addresses: self.announce_addresses,
            announce_filter: self.announce_filter,
            max_observed_addresses: self.max_observed_addresses,
            limits: self.limits,
            dial: self.dial,
            inbound_upgrade_timeout: self.inbound_upgrade_timeout,
            stop_timeout: self.stop_timeout,
            identify: self.identify,
            resolver: self.resolver,
            address_sorter: self.address_sorter.unwrap_or_else(default_address_sorter),
            executor: self.executor.unwrap_or_else(|| Arc::new(DefaultExecutor)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_generates_keypair_when_missing() {
        let config = ConfigBuilder::new().build();
        let other = ConfigBuilder::new().build();

        assert_ne!(config.keypair().public(), other.keypair().public());
    }
}
