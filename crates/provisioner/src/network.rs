//! Network topology for one environment.
//!
//! Describes the VPC address block, the private and public subnet layout
//! across availability zones, NAT egress and the ownership tags the cluster
//! stage relies on to discover its subnets.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::EnvironmentParams;
use crate::error::{ProvisionError, Result};

/// An IPv4 CIDR block (`10.0.0.0/16`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv4Cidr {
    addr: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Cidr {
    /// Create a block, rejecting host bits and prefixes longer than 32.
    ///
    /// # Errors
    ///
    /// Returns an error if the prefix is out of range or host bits are set.
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self> {
        if prefix > 32 {
            return Err(ProvisionError::InvalidConfig(format!(
                "prefix /{prefix} is longer than 32"
            )));
        }
        let cidr = Self { addr, prefix };
        if u32::from(addr) & !cidr.mask() != 0 {
            return Err(ProvisionError::InvalidConfig(format!(
                "{addr}/{prefix} has host bits set"
            )));
        }
        Ok(cidr)
    }

    /// Network address.
    #[must_use]
    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    /// Prefix length.
    #[must_use]
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    fn mask(&self) -> u32 {
        if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(self.prefix))
        }
    }

    fn first(&self) -> u32 {
        u32::from(self.addr)
    }

    fn last(&self) -> u32 {
        self.first() | !self.mask()
    }

    /// Whether `other` lies entirely inside this block.
    #[must_use]
    pub fn contains(&self, other: &Self) -> bool {
        other.prefix >= self.prefix && other.first() & self.mask() == self.first()
    }

    /// Whether the two blocks share at least one address.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.first() <= other.last() && other.first() <= self.last()
    }
}

impl std::fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| ProvisionError::InvalidConfig(format!("'{s}' is not a CIDR block")))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| ProvisionError::InvalidConfig(format!("'{s}' has an invalid address")))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| ProvisionError::InvalidConfig(format!("'{s}' has an invalid prefix")))?;
        Self::new(addr, prefix)
    }
}

impl TryFrom<String> for Ipv4Cidr {
    type Error = ProvisionError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Ipv4Cidr> for String {
    fn from(value: Ipv4Cidr) -> Self {
        value.to_string()
    }
}

/// NAT egress mode for private subnets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NatMode {
    /// One NAT gateway shared by all zones.
    #[default]
    Single,
    /// One NAT gateway per availability zone.
    OnePerAz,
    /// No NAT egress.
    None,
}

impl std::fmt::Display for NatMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Single => write!(f, "single"),
            Self::OnePerAz => write!(f, "one_per_az"),
            Self::None => write!(f, "none"),
        }
    }
}

/// Desired network layout.
///
/// Subnet lists and zones are positional: the n-th private and public
/// subnet live in the n-th zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkTopology {
    /// VPC address block.
    pub cidr: Ipv4Cidr,
    /// Private subnet blocks, one per zone.
    pub private_subnets: Vec<Ipv4Cidr>,
    /// Public subnet blocks, one per zone.
    pub public_subnets: Vec<Ipv4Cidr>,
    /// Availability zones. Empty means "`a`, `b`, `c` of the region".
    #[serde(default)]
    pub azs: Vec<String>,
    /// NAT egress mode.
    #[serde(default)]
    pub nat: NatMode,
}

impl Default for NetworkTopology {
    fn default() -> Self {
        let block = |third: u8, prefix: u8| Ipv4Cidr {
            addr: Ipv4Addr::new(10, 0, third, 0),
            prefix,
        };
        Self {
            cidr: block(0, 16),
            private_subnets: (1..=3).map(|i| block(i, 24)).collect(),
            public_subnets: (4..=6).map(|i| block(i, 24)).collect(),
            azs: Vec::new(),
            nat: NatMode::Single,
        }
    }
}

impl NetworkTopology {
    /// Zones for `region`, defaulting to its first three zones.
    #[must_use]
    pub fn zones_for(&self, region: &str) -> Vec<String> {
        if self.azs.is_empty() {
            ["a", "b", "c"]
                .iter()
                .take(self.private_subnets.len().max(1))
                .map(|suffix| format!("{region}{suffix}"))
                .collect()
        } else {
            self.azs.clone()
        }
    }

    /// Validate the layout against the environment's region.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` describing the first violated rule.
    pub fn validate(&self, region: &str) -> Result<()> {
        let zones = self.zones_for(region);

        if self.private_subnets.len() != zones.len() || self.public_subnets.len() != zones.len() {
            return Err(ProvisionError::InvalidConfig(format!(
                "expected one private and one public subnet per zone ({} zones), got {} private and {} public",
                zones.len(),
                self.private_subnets.len(),
                self.public_subnets.len()
            )));
        }

        if let Some(zone) = zones.iter().find(|z| !z.starts_with(region)) {
            return Err(ProvisionError::InvalidConfig(format!(
                "availability zone {zone} is not in region {region}"
            )));
        }

        let subnets: Vec<&Ipv4Cidr> = self
            .private_subnets
            .iter()
            .chain(self.public_subnets.iter())
            .collect();

        if let Some(outside) = subnets.iter().find(|s| !self.cidr.contains(s)) {
            return Err(ProvisionError::InvalidConfig(format!(
                "subnet {outside} is outside the VPC block {}",
                self.cidr
            )));
        }

        for (i, a) in subnets.iter().enumerate() {
            if let Some(b) = subnets[i + 1..].iter().find(|b| a.overlaps(b)) {
                return Err(ProvisionError::InvalidConfig(format!(
                    "subnets {a} and {b} overlap"
                )));
            }
        }

        Ok(())
    }

    /// Number of NAT gateways the layout requests.
    #[must_use]
    pub fn nat_gateway_count(&self, region: &str) -> usize {
        match self.nat {
            NatMode::Single => 1,
            NatMode::OnePerAz => self.zones_for(region).len(),
            NatMode::None => 0,
        }
    }
}

/// Tags applied to every network resource of an environment.
#[must_use]
pub fn ownership_tags(env: &EnvironmentParams) -> BTreeMap<String, String> {
    BTreeMap::from([
        (cluster_tag_key(&env.cluster_name), "shared".to_string()),
        ("Environment".to_string(), env.env_prefix.clone()),
        ("ManagedBy".to_string(), "eksprov".to_string()),
    ])
}

/// Tags that let load balancers discover public subnets.
#[must_use]
pub fn public_subnet_tags(env: &EnvironmentParams) -> BTreeMap<String, String> {
    BTreeMap::from([
        (cluster_tag_key(&env.cluster_name), "shared".to_string()),
        ("kubernetes.io/role/elb".to_string(), "1".to_string()),
    ])
}

/// Tags that let internal load balancers discover private subnets.
#[must_use]
pub fn private_subnet_tags(env: &EnvironmentParams) -> BTreeMap<String, String> {
    BTreeMap::from([
        (cluster_tag_key(&env.cluster_name), "shared".to_string()),
        ("kubernetes.io/role/internal-elb".to_string(), "1".to_string()),
    ])
}

/// The tag key encoding cluster ownership.
#[must_use]
pub fn cluster_tag_key(cluster_name: &str) -> String {
    format!("kubernetes.io/cluster/{cluster_name}")
}

/// An existing VPC as reported by the cloud API.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExistingVpc {
    /// VPC identifier.
    pub vpc_id: String,
    /// Primary address block.
    pub cidr_block: String,
    /// Resource tags.
    #[serde(default)]
    pub tags: Vec<AwsTag>,
}

/// A cloud API tag pair.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AwsTag {
    /// Tag key.
    pub key: String,
    /// Tag value.
    pub value: String,
}

/// Find an existing VPC, not owned by this environment, whose block
/// overlaps the desired one.
///
/// # Errors
///
/// Returns `AddressOverlap` for the first conflicting VPC.
pub fn check_overlap(
    desired: &Ipv4Cidr,
    env: &EnvironmentParams,
    existing: &[ExistingVpc],
) -> Result<()> {
    for vpc in existing {
        let owned = vpc
            .tags
            .iter()
            .any(|t| t.key == "Environment" && t.value == env.env_prefix)
            && vpc
                .tags
                .iter()
                .any(|t| t.key == cluster_tag_key(&env.cluster_name));
        if owned {
            continue;
        }
        let Ok(block) = vpc.cidr_block.parse::<Ipv4Cidr>() else {
            continue;
        };
        if block.overlaps(desired) {
            return Err(ProvisionError::AddressOverlap {
                cidr: desired.to_string(),
                detail: format!("{} uses {}", vpc.vpc_id, vpc.cidr_block),
            });
        }
    }
    Ok(())
}
