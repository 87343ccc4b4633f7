// Topology: emulated RFSS nodes, subscriber units and groups

pub mod location;

pub use location::LocationMap;

use serde::{Deserialize, Serialize};

use crate::error::IssiTesterError;

/// One emulated RFSS (network node)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RfssConfig {
    pub id: String,
    /// SIP domain, e.g. "rfss_1.p25dr"
    pub domain: String,
    pub rf_resources_available: bool,
    /// Whether the node honours the resource-availability check flag on
    /// incoming call setups
    pub availability_check_supported: bool,
}

impl Default for RfssConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            domain: String::new(),
            rf_resources_available: true,
            availability_check_supported: false,
        }
    }
}

/// A subscriber unit (SU), the emulated endpoint behind an actor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuConfig {
    pub id: String,
    pub home_rfss: String,
    /// Serving node at run start. Empty means the home node.
    pub serving_rfss: String,
    pub transmit_priority: u8,
    /// Administratively available for incoming calls
    pub available: bool,
    pub initially_on: bool,
    /// Callee processing delay before the setup decision is made
    pub callee_processing_delay_secs: u64,
}

impl Default for SuConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            home_rfss: String::new(),
            serving_rfss: String::new(),
            transmit_priority: 1,
            available: true,
            initially_on: true,
            callee_processing_delay_secs: 0,
        }
    }
}

impl SuConfig {
    pub fn initial_serving_rfss(&self) -> &str {
        if self.serving_rfss.is_empty() {
            &self.home_rfss
        } else {
            &self.serving_rfss
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    pub id: String,
    pub home_rfss: String,
    pub members: Vec<String>,
}

/// One topology document (system, global or per-test). Documents are merged
/// by id, later ones overriding earlier entries.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyDoc {
    pub rfss: Vec<RfssConfig>,
    pub units: Vec<SuConfig>,
    pub groups: Vec<GroupConfig>,
}

/// Validated, immutable topology shared by every component of one run
#[derive(Debug, Clone, Default)]
pub struct Topology {
    rfss: Vec<RfssConfig>,
    units: Vec<SuConfig>,
    groups: Vec<GroupConfig>,
    /// Self-test mode: a single process emulates every node
    pub self_test: bool,
}

fn upsert<T: Clone>(target: &mut Vec<T>, item: &T, id: impl Fn(&T) -> &str) {
    match target.iter_mut().find(|existing| id(existing) == id(item)) {
        Some(existing) => *existing = item.clone(),
        None => target.push(item.clone()),
    }
}

impl Topology {
    /// Merge documents in order and validate the result.
    pub fn merge<'a>(
        docs: impl IntoIterator<Item = &'a TopologyDoc>,
    ) -> Result<Self, IssiTesterError> {
        let mut topology = Topology::default();
        for doc in docs {
            for rfss in &doc.rfss {
                upsert(&mut topology.rfss, rfss, |r| &r.id);
            }
            for unit in &doc.units {
                upsert(&mut topology.units, unit, |u| &u.id);
            }
            for group in &doc.groups {
                upsert(&mut topology.groups, group, |g| &g.id);
            }
        }
        topology.validate()?;
        Ok(topology)
    }

    pub fn with_self_test(mut self, self_test: bool) -> Self {
        self.self_test = self_test;
        self
    }

    pub fn validate(&self) -> Result<(), IssiTesterError> {
        for rfss in &self.rfss {
            if rfss.id.is_empty() || rfss.domain.is_empty() {
                return Err(IssiTesterError::ConfigError(
                    "every RFSS needs an id and a domain".to_string(),
                ));
            }
        }
        for unit in &self.units {
            if self.rfss(&unit.home_rfss).is_none() {
                return Err(IssiTesterError::UnknownNode(unit.home_rfss.clone()));
            }
            if self.rfss(unit.initial_serving_rfss()).is_none() {
                return Err(IssiTesterError::UnknownNode(unit.serving_rfss.clone()));
            }
        }
        for group in &self.groups {
            if self.rfss(&group.home_rfss).is_none() {
                return Err(IssiTesterError::UnknownNode(group.home_rfss.clone()));
            }
            if let Some(member) = group.members.iter().find(|m| self.unit(m).is_none()) {
                return Err(IssiTesterError::UnknownActor(member.clone()));
            }
        }
        Ok(())
    }

    pub fn rfss(&self, id: &str) -> Option<&RfssConfig> {
        self.rfss.iter().find(|r| r.id == id)
    }

    pub fn rfss_by_domain(&self, domain: &str) -> Option<&RfssConfig> {
        self.rfss.iter().find(|r| r.domain.eq_ignore_ascii_case(domain))
    }

    pub fn unit(&self, id: &str) -> Option<&SuConfig> {
        self.units.iter().find(|u| u.id == id)
    }

    pub fn group(&self, id: &str) -> Option<&GroupConfig> {
        self.groups.iter().find(|g| g.id == id)
    }

    pub fn rfss_nodes(&self) -> &[RfssConfig] {
        &self.rfss
    }

    pub fn units(&self) -> &[SuConfig] {
        &self.units
    }

    pub fn groups(&self) -> &[GroupConfig] {
        &self.groups
    }

    /// SIP URI of a unit or group, addressed at its home domain
    pub fn uri(&self, id: &str) -> Result<String, IssiTesterError> {
        let home = match (self.unit(id), self.group(id)) {
            (Some(unit), _) => &unit.home_rfss,
            (None, Some(group)) => &group.home_rfss,
            (None, None) => return Err(IssiTesterError::UnknownActor(id.to_string())),
        };
        let rfss = self
            .rfss(home)
            .ok_or_else(|| IssiTesterError::UnknownNode(home.clone()))?;
        Ok(format!("sip:{}@{}", id, rfss.domain))
    }

    /// Fresh actor-location map seeded from configured serving nodes
    pub fn initial_locations(&self) -> LocationMap {
        let map = LocationMap::new();
        for unit in &self.units {
            map.move_unit(&unit.id, unit.initial_serving_rfss());
        }
        map
    }
}

/// User part of a SIP URI ("sip:su_1@rfss_1.p25dr" or "<sip:su_1@...>;tag=x")
pub fn uri_user(uri: &str) -> Option<&str> {
    let start = uri.find("sip:")? + 4;
    let rest = &uri[start..];
    let end = rest.find('@')?;
    Some(&rest[..end])
}

/// Host part of a SIP URI or Via value
pub fn uri_host(uri: &str) -> Option<&str> {
    let rest = match uri.find('@') {
        Some(at) => &uri[at + 1..],
        None => uri.rsplit(' ').next()?,
    };
    let end = rest
        .find(|c: char| c == '>' || c == ';' || c == ':' || c.is_whitespace())
        .unwrap_or(rest.len());
    let host = &rest[..end];
    (!host.is_empty()).then_some(host)
}
