//! Capability snapshot negotiated with a device.
//!
//! Module capabilities have the form `namespace?module=NAME&revision=DATE`.
//! Everything else (base versions, `:candidate`, `:writable-running`, ...) is
//! a non-module capability.

use std::collections::BTreeSet;
use std::fmt;

use indexmap::IndexMap;
use log::{debug, warn};

use crate::rpc::message::BASE_1_1;
use crate::schema::SourceIdentifier;

const CANDIDATE: &str = "urn:ietf:params:netconf:capability:candidate:1.0";
const WRITABLE_RUNNING: &str = "urn:ietf:params:netconf:capability:writable-running:1.0";
const ROLLBACK_ON_ERROR: &str = "urn:ietf:params:netconf:capability:rollback-on-error:1.0";
const NOTIFICATIONS: &str = "urn:ietf:params:netconf:capability:notification:1.0";
const MONITORING_NS: &str = "urn:ietf:params:xml:ns:yang:ietf-netconf-monitoring";
const NOTIFICATIONS_MODULE: &str = "ietf-netconf-notifications";

/// Modules the notification capability implies but devices rarely advertise.
const NOTIFICATION_SOURCES: [(&str, &str); 2] = [
    ("notifications", "2008-07-14"),
    ("ietf-yang-types", "2013-07-15"),
];

/// Where a capability came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilityOrigin {
    DeviceAdvertised,
    UserDefined,
}

/// A module advertised as a capability.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleCapability {
    pub namespace: String,
    pub source: SourceIdentifier,
}

/// Immutable set of capabilities for one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionPreferences {
    module_caps: IndexMap<ModuleCapability, CapabilityOrigin>,
    non_module_caps: IndexMap<String, CapabilityOrigin>,
}

impl SessionPreferences {
    /// Parse device-advertised capability strings.
    pub fn from_capabilities<S: AsRef<str>>(capabilities: &[S]) -> Self {
        Self::from_capabilities_with_origin(capabilities, CapabilityOrigin::DeviceAdvertised)
    }

    pub fn from_capabilities_with_origin<S: AsRef<str>>(
        capabilities: &[S],
        origin: CapabilityOrigin,
    ) -> Self {
        let mut prefs = Self::default();
        for capability in capabilities {
            let capability = capability.as_ref().trim();
            if capability.is_empty() {
                continue;
            }
            match parse_module_capability(capability) {
                Some(module) => {
                    prefs.module_caps.insert(module, origin);
                }
                None => {
                    prefs.non_module_caps.insert(capability.to_string(), origin);
                }
            }
        }
        prefs
    }

    pub fn module_capabilities(&self) -> &IndexMap<ModuleCapability, CapabilityOrigin> {
        &self.module_caps
    }

    pub fn non_module_capabilities(&self) -> &IndexMap<String, CapabilityOrigin> {
        &self.non_module_caps
    }

    /// The schema sources the device requires.
    ///
    /// With `:notification` advertised, the notification modules are
    /// required as well.
    pub fn required_sources(&self) -> BTreeSet<SourceIdentifier> {
        let mut sources: BTreeSet<SourceIdentifier> =
            self.module_caps.keys().map(|m| m.source.clone()).collect();
        if self.contains_non_module_capability(NOTIFICATIONS) {
            for (name, revision) in NOTIFICATION_SOURCES {
                sources.insert(SourceIdentifier::new(name, Some(revision.to_string())));
            }
        }
        sources
    }

    pub fn contains_non_module_capability(&self, capability: &str) -> bool {
        self.non_module_caps.contains_key(capability)
    }

    /// Whether any non-module capability starts with `prefix`.
    pub fn contains_partial_non_module_capability(&self, prefix: &str) -> bool {
        self.non_module_caps.keys().any(|c| c.starts_with(prefix))
    }

    pub fn contains_module(&self, name: &str) -> bool {
        self.module_caps.keys().any(|m| m.source.name() == name)
    }

    /// Whether both sides can use chunked framing.
    pub fn is_chunked_framing(&self) -> bool {
        self.contains_non_module_capability(BASE_1_1)
    }

    pub fn is_candidate_supported(&self) -> bool {
        self.contains_non_module_capability(CANDIDATE)
    }

    pub fn is_running_writable(&self) -> bool {
        self.contains_non_module_capability(WRITABLE_RUNNING)
    }

    pub fn is_rollback_supported(&self) -> bool {
        self.contains_non_module_capability(ROLLBACK_ON_ERROR)
    }

    pub fn is_notifications_supported(&self) -> bool {
        self.contains_partial_non_module_capability(NOTIFICATIONS)
            || self.contains_module(NOTIFICATIONS_MODULE)
    }

    pub fn is_monitoring_supported(&self) -> bool {
        self.module_caps.keys().any(|m| m.namespace == MONITORING_NS)
            || self.contains_partial_non_module_capability(MONITORING_NS)
    }

    /// Add `other`'s module capabilities, keeping existing ones.
    pub fn merge_module_caps(&self, other: &SessionPreferences) -> Self {
        let mut merged = self.clone();
        for (cap, origin) in &other.module_caps {
            merged.module_caps.insert(cap.clone(), *origin);
        }
        merged
    }

    /// Use `other`'s module capabilities instead of these.
    pub fn replace_module_caps(&self, other: &SessionPreferences) -> Self {
        Self {
            module_caps: other.module_caps.clone(),
            non_module_caps: self.non_module_caps.clone(),
        }
    }

    pub fn merge_non_module_caps(&self, other: &SessionPreferences) -> Self {
        let mut merged = self.clone();
        for (cap, origin) in &other.non_module_caps {
            merged.non_module_caps.insert(cap.clone(), *origin);
        }
        merged
    }

    pub fn replace_non_module_caps(&self, other: &SessionPreferences) -> Self {
        Self {
            module_caps: self.module_caps.clone(),
            non_module_caps: other.non_module_caps.clone(),
        }
    }

    /// Apply user-supplied capability overrides.
    pub fn with_overrides(&self, overrides: &CapabilityOverrides) -> Self {
        let mut prefs = self.clone();
        if let Some(modules) = &overrides.module {
            let user = SessionPreferences::from_capabilities_with_origin(
                &modules.capabilities,
                CapabilityOrigin::UserDefined,
            );
            prefs = if modules.replace {
                prefs.replace_module_caps(&user)
            } else {
                prefs.merge_module_caps(&user)
            };
        }
        if let Some(non_modules) = &overrides.non_module {
            let user = SessionPreferences::from_capabilities_with_origin(
                &non_modules.capabilities,
                CapabilityOrigin::UserDefined,
            );
            prefs = if non_modules.replace {
                prefs.replace_non_module_caps(&user)
            } else {
                prefs.merge_non_module_caps(&user)
            };
        }
        prefs
    }
}

impl fmt::Display for SessionPreferences {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} modules, {} capabilities (candidate: {}, writable-running: {}, rollback: {}, monitoring: {})",
            self.module_caps.len(),
            self.non_module_caps.len(),
            self.is_candidate_supported(),
            self.is_running_writable(),
            self.is_rollback_supported(),
            self.is_monitoring_supported()
        )
    }
}

/// One set of user capabilities.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize)]
pub struct CapabilityOverride {
    pub capabilities: Vec<String>,
    /// Replace the advertised set instead of adding to it.
    #[serde(default)]
    pub replace: bool,
}

/// User overrides for module and non-module capabilities.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize)]
pub struct CapabilityOverrides {
    #[serde(default)]
    pub module: Option<CapabilityOverride>,
    #[serde(default)]
    pub non_module: Option<CapabilityOverride>,
}

fn parse_module_capability(capability: &str) -> Option<ModuleCapability> {
    let (namespace, query) = capability.split_once('?')?;
    let params: Vec<&str> = query.split('&').collect();

    let module = param(&params, "module=").filter(|m| !m.is_empty())?;

    let revision = match param(&params, "revision=").filter(|r| !r.is_empty()) {
        Some(rev) => Some(rev),
        None if params.iter().any(|p| p.contains("revision=")) => {
            debug!("Device mis-escaped revision in {}, trying amp;revision=", capability);
            let broken = param(&params, "amp;revision=").filter(|r| !r.is_empty());
            if broken.is_none() {
                warn!(
                    "Device returned revision incorrectly escaped for {}, ignoring it",
                    capability
                );
            }
            broken
        }
        None => None,
    };

    Some(ModuleCapability {
        namespace: namespace.to_string(),
        source: SourceIdentifier::new(module, revision.map(str::to_string)),
    })
}

fn param<'a>(params: &[&'a str], name: &str) -> Option<&'a str> {
    params
        .iter()
        .find_map(|p| p.strip_prefix(name))
}
