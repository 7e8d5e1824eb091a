//! Resolution of instance names to their internal and floating IPv4 addresses.
//!
//! The provider reports addresses as text shaped like
//! `<network>=<addr1>[, <addr2>][; <network>=...]`. The first IPv4 address is taken as the
//! internal one and the second as the floating one. This is positional, not
//! semantic: it holds for a topology where the floating IP is associated after
//! the port is created on the private network, and breaks if the provider ever
//! lists them the other way around.
use std::fmt;
use std::net::Ipv4Addr;

use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, warn};

use crate::stack::CloudStackClient;

lazy_static! {
    static ref IPV4_TOKEN: Regex =
        Regex::new(r"^\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}$").expect("hardcoded regex is valid");
}

/// The addresses of one instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceAddress {
    /// The instance (server) name
    pub instance_name: String,
    /// Address on the cluster's private network
    pub internal_ip: Option<Ipv4Addr>,
    /// Floating address mapped onto the internal one
    pub floating_ip: Option<Ipv4Addr>,
}

impl InstanceAddress {
    /// The address an operator or Ansible should connect to: the floating IP
    /// when there is one, the internal one otherwise.
    pub fn connect_ip(&self) -> Option<Ipv4Addr> {
        self.floating_ip.or(self.internal_ip)
    }
}

impl fmt::Display for InstanceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |ip: Option<Ipv4Addr>| match ip {
            Some(ip) => ip.to_string(),
            None => "-".to_owned(),
        };
        write!(
            f,
            "{} internal={} floating={}",
            self.instance_name,
            show(self.internal_ip),
            show(self.floating_ip)
        )
    }
}

/// Parse provider address text into an [`InstanceAddress`].
///
/// Several networks may be listed, separated by `;`. The first network that
/// carries two IPv4 addresses wins, otherwise the first one with any IPv4
/// address. Within a network, tokens are separated by commas or whitespace and
/// anything that is not an IPv4 dotted quad is dropped. Returns `None` when no
/// IPv4 address survives.
pub fn parse_addresses(instance_name: &str, text: &str) -> Option<InstanceAddress> {
    let networks: Vec<Vec<Ipv4Addr>> = text
        .split(';')
        .map(network_addresses)
        .filter(|ips| !ips.is_empty())
        .collect();

    let ips = networks
        .iter()
        .find(|ips| ips.len() >= 2)
        .or_else(|| networks.first())?;

    Some(InstanceAddress {
        instance_name: instance_name.to_owned(),
        internal_ip: ips.first().copied(),
        floating_ip: ips.get(1).copied(),
    })
}

fn network_addresses(segment: &str) -> Vec<Ipv4Addr> {
    let list = match segment.split_once('=') {
        Some((_network, rest)) => rest,
        None => segment,
    };
    list.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|token| IPV4_TOKEN.is_match(token))
        .filter_map(|token| token.parse::<Ipv4Addr>().ok())
        .collect()
}

/// Returned when the provider has no usable address for an instance.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// The instance is missing or reports no IPv4 address.
    #[error("no address found for instance {0}")]
    AddressNotFound(String),
    /// The provider could not be queried.
    #[error("unable to look up addresses of instance {instance}: {source}")]
    Lookup {
        /// The instance that was looked up
        instance: String,
        /// The underlying provider error
        source: anyhow::Error,
    },
}

/// Looks up instance addresses through a [`CloudStackClient`].
pub struct AddressResolver<'a> {
    client: &'a dyn CloudStackClient,
}

impl<'a> AddressResolver<'a> {
    /// Create a resolver backed by the given client.
    pub fn new(client: &'a dyn CloudStackClient) -> Self {
        AddressResolver { client }
    }

    /// Resolve the addresses of a single instance.
    pub async fn resolve(&self, instance: &str) -> Result<InstanceAddress, ResolveError> {
        let text = self
            .client
            .server_addresses(instance)
            .await
            .map_err(|source| ResolveError::Lookup {
                instance: instance.to_owned(),
                source,
            })?
            .ok_or_else(|| ResolveError::AddressNotFound(instance.to_owned()))?;

        debug!(instance, addresses = %text, "Parsing instance addresses");
        let address = parse_addresses(instance, &text)
            .ok_or_else(|| ResolveError::AddressNotFound(instance.to_owned()))?;

        if let Some(floating) = address.floating_ip {
            if floating.is_loopback() || floating.is_unspecified() || floating.is_broadcast() {
                warn!(
                    instance,
                    %floating,
                    "Floating address is not routable; address order may not match the expected topology"
                );
            }
        }
        Ok(address)
    }
}
