//! Declared VM configuration and its canonical form.
//!
//! [`normalize`] turns a [`RawVmConfig`] (tri-state fields, as declared) into
//! a [`VmSpec`] (every field resolved) or a list of error diagnostics. It is a
//! pure function: the same input always yields the same spec and the same
//! diagnostics.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use flintlock_reconcile::SpecHash;
use serde::{Deserialize, Serialize};

use crate::config::Configured;
use crate::diagnostics::{AttributePath, Diagnostic, Diagnostics};

/// vCPUs given to a VM that does not declare any.
pub const DEFAULT_VCPU: u32 = 1;

/// Memory (MiB) given to a VM that does not declare any.
pub const DEFAULT_MEMORY_MB: u32 = 512;

/// Longest accepted VM identifier.
pub const MAX_ID_LEN: usize = 63;

/// Network device flavour attached to the guest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceKind {
    #[default]
    Tap,
    Macvtap,
}

impl InterfaceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tap => "tap",
            Self::Macvtap => "macvtap",
        }
    }
}

/// Shape fields that may be filled in from defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeField {
    Vcpu,
    MemoryMb,
}

impl ShapeField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vcpu => "vcpu",
            Self::MemoryMb => "memory_mb",
        }
    }
}

/// Declared network interface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawNetworkInterface {
    #[serde(default)]
    pub guest_device_name: Configured<String>,
    #[serde(default)]
    pub kind: Configured<InterfaceKind>,
    #[serde(default)]
    pub guest_mac: Configured<String>,
    #[serde(default)]
    pub address: Configured<String>,
    #[serde(default)]
    pub dhcp: Configured<bool>,
}

/// Declared VM, as handed over by the provider framework.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawVmConfig {
    #[serde(default)]
    pub id: Configured<String>,
    #[serde(default)]
    pub vcpu: Configured<u32>,
    #[serde(default)]
    pub memory_mb: Configured<u32>,
    #[serde(default)]
    pub image: Configured<String>,
    #[serde(default)]
    pub network_interfaces: Configured<Vec<RawNetworkInterface>>,
    #[serde(default)]
    pub labels: Configured<BTreeMap<String, String>>,
}

impl RawVmConfig {
    /// The declared identifier, when it is known and non-empty.
    pub fn declared_id(&self) -> Option<&str> {
        self.id.value().map(String::as_str).filter(|id| !id.is_empty())
    }
}

/// Canonical network interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub guest_device_name: String,
    pub kind: InterfaceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_mac: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub dhcp: bool,
}

impl NetworkInterface {
    /// This interface with the fields it leaves open taken from `observed`.
    ///
    /// The control plane assigns a MAC or an address when none is declared;
    /// those assignments are not drift.
    pub fn with_observed(&self, observed: &NetworkInterface) -> Self {
        Self {
            guest_mac: self.guest_mac.clone().or_else(|| observed.guest_mac.clone()),
            address: self.address.clone().or_else(|| observed.address.clone()),
            ..self.clone()
        }
    }

    fn hash_view(&self) -> serde_json::Value {
        serde_json::json!({
            "guest_device_name": self.guest_device_name,
            "kind": self.kind.as_str(),
            "guest_mac": self.guest_mac,
            "address": self.address,
            "dhcp": self.dhcp,
        })
    }
}

/// Canonical VM specification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSpec {
    pub id: String,
    pub vcpu: u32,
    pub memory_mb: u32,
    pub image: String,
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterface>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Shape fields filled from defaults rather than declared.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub defaulted: BTreeSet<ShapeField>,
}

impl VmSpec {
    /// A spec with explicit shape and no interfaces or labels.
    pub fn new(id: impl Into<String>, vcpu: u32, memory_mb: u32, image: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            vcpu,
            memory_mb,
            image: image.into(),
            network_interfaces: Vec::new(),
            labels: BTreeMap::new(),
            defaulted: BTreeSet::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Fingerprint of everything the remote sees. Default bookkeeping is not
    /// part of it.
    pub fn spec_hash(&self) -> SpecHash {
        let interfaces: Vec<_> = self
            .network_interfaces
            .iter()
            .map(NetworkInterface::hash_view)
            .collect();
        SpecHash::from_json(&serde_json::json!({
            "id": self.id,
            "vcpu": self.vcpu,
            "memory_mb": self.memory_mb,
            "image": self.image,
            "network_interfaces": interfaces,
            "labels": self.labels,
        }))
    }

    pub fn is_defaulted(&self, field: ShapeField) -> bool {
        self.defaulted.contains(&field)
    }

    pub fn shape(&self, field: ShapeField) -> u32 {
        match field {
            ShapeField::Vcpu => self.vcpu,
            ShapeField::MemoryMb => self.memory_mb,
        }
    }
}

/// Partial update: only the fields that are present are sent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSpecPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vcpu: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_interfaces: Option<Vec<NetworkInterface>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
}

impl VmSpecPatch {
    /// Fields that differ between what was applied and what is desired.
    pub fn between(applied: &VmSpec, desired: &VmSpec) -> Self {
        fn changed<T: PartialEq + Clone>(old: &T, new: &T) -> Option<T> {
            (old != new).then(|| new.clone())
        }

        Self {
            vcpu: changed(&applied.vcpu, &desired.vcpu),
            memory_mb: changed(&applied.memory_mb, &desired.memory_mb),
            image: changed(&applied.image, &desired.image),
            network_interfaces: changed(&applied.network_interfaces, &desired.network_interfaces),
            labels: changed(&applied.labels, &desired.labels),
        }
    }

    /// Set a shape field explicitly.
    pub fn set_shape(&mut self, field: ShapeField, value: u32) {
        match field {
            ShapeField::Vcpu => self.vcpu = Some(value),
            ShapeField::MemoryMb => self.memory_mb = Some(value),
        }
    }

    /// Drop a shape field from the patch.
    pub fn clear_shape(&mut self, field: ShapeField) {
        match field {
            ShapeField::Vcpu => self.vcpu = None,
            ShapeField::MemoryMb => self.memory_mb = None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields().is_empty()
    }

    /// Names of the fields carried by the patch.
    pub fn fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.vcpu.is_some() {
            fields.push("vcpu");
        }
        if self.memory_mb.is_some() {
            fields.push("memory_mb");
        }
        if self.image.is_some() {
            fields.push("image");
        }
        if self.network_interfaces.is_some() {
            fields.push("network_interfaces");
        }
        if self.labels.is_some() {
            fields.push("labels");
        }
        fields
    }

    /// Apply the patch on top of `spec`.
    pub fn apply_to(&self, spec: &VmSpec) -> VmSpec {
        let mut out = spec.clone();
        if let Some(vcpu) = self.vcpu {
            out.vcpu = vcpu;
        }
        if let Some(memory_mb) = self.memory_mb {
            out.memory_mb = memory_mb;
        }
        if let Some(image) = &self.image {
            out.image = image.clone();
        }
        if let Some(interfaces) = &self.network_interfaces {
            out.network_interfaces = interfaces.clone();
        }
        if let Some(labels) = &self.labels {
            out.labels = labels.clone();
        }
        out
    }
}

/// Convert a declared VM into its canonical specification.
///
/// Returns `None` together with at least one error diagnostic when the
/// declaration cannot be turned into a spec.
pub fn normalize(raw: &RawVmConfig) -> (Option<VmSpec>, Diagnostics) {
    let mut diags = Diagnostics::new();
    let mut defaulted = BTreeSet::new();

    let id = required_string(&raw.id, AttributePath::root("id"), &mut diags);
    if let Some(id) = &id {
        if let Err(reason) = validate_id(id) {
            diags.append(
                Diagnostic::error("Invalid VM identifier", reason).at(AttributePath::root("id")),
            );
        }
    }

    let vcpu = positive_or_default(
        &raw.vcpu,
        DEFAULT_VCPU,
        ShapeField::Vcpu,
        &mut defaulted,
        &mut diags,
    );
    let memory_mb = positive_or_default(
        &raw.memory_mb,
        DEFAULT_MEMORY_MB,
        ShapeField::MemoryMb,
        &mut defaulted,
        &mut diags,
    );

    let image = required_string(&raw.image, AttributePath::root("image"), &mut diags);

    let network_interfaces = match &raw.network_interfaces {
        Configured::Null => Vec::new(),
        Configured::Unknown => {
            diags.append(unknown_value(AttributePath::root("network_interfaces")));
            Vec::new()
        }
        Configured::Value(raw_ifaces) => normalize_interfaces(raw_ifaces, &mut diags),
    };

    let labels = match &raw.labels {
        Configured::Null => BTreeMap::new(),
        Configured::Unknown => {
            diags.append(unknown_value(AttributePath::root("labels")));
            BTreeMap::new()
        }
        Configured::Value(labels) => {
            if labels.keys().any(|k| k.trim().is_empty()) {
                diags.append(
                    Diagnostic::error("Invalid label", "Label keys must not be empty.")
                        .at(AttributePath::root("labels")),
                );
            }
            labels.clone()
        }
    };

    if diags.has_error() {
        let diags = match raw.declared_id() {
            Some(id) => tag_resource(diags, id),
            None => diags,
        };
        return (None, diags);
    }

    match (id, vcpu, memory_mb, image) {
        (Some(id), Some(vcpu), Some(memory_mb), Some(image)) => (
            Some(VmSpec {
                id,
                vcpu,
                memory_mb,
                image,
                network_interfaces,
                labels,
                defaulted,
            }),
            diags,
        ),
        // Every None above has already produced an error.
        _ => (None, diags),
    }
}

fn tag_resource(diags: Diagnostics, id: &str) -> Diagnostics {
    let mut tagged = Diagnostics::new();
    for diag in diags {
        tagged.append(diag.for_resource(id));
    }
    tagged
}

fn unknown_value(path: AttributePath) -> Diagnostic {
    Diagnostic::error(
        "Unknown configuration value",
        format!("The value of `{path}` is not known yet. Apply its source first or set it statically."),
    )
    .at(path)
}

fn required_string(
    value: &Configured<String>,
    path: AttributePath,
    diags: &mut Diagnostics,
) -> Option<String> {
    match value {
        Configured::Value(s) if !s.trim().is_empty() => Some(s.clone()),
        Configured::Value(_) | Configured::Null => {
            diags.append(
                Diagnostic::error(
                    "Missing required attribute",
                    format!("The attribute `{path}` is required."),
                )
                .at(path),
            );
            None
        }
        Configured::Unknown => {
            diags.append(unknown_value(path));
            None
        }
    }
}

fn positive_or_default(
    value: &Configured<u32>,
    default: u32,
    field: ShapeField,
    defaulted: &mut BTreeSet<ShapeField>,
    diags: &mut Diagnostics,
) -> Option<u32> {
    let path = AttributePath::root(field.as_str());
    match value {
        Configured::Null => {
            defaulted.insert(field);
            Some(default)
        }
        Configured::Unknown => {
            diags.append(unknown_value(path));
            None
        }
        Configured::Value(0) => {
            diags.append(
                Diagnostic::error(
                    "Invalid VM shape",
                    format!("`{path}` must be greater than zero."),
                )
                .at(path),
            );
            None
        }
        Configured::Value(v) => Some(*v),
    }
}

fn normalize_interfaces(
    raw_ifaces: &[RawNetworkInterface],
    diags: &mut Diagnostics,
) -> Vec<NetworkInterface> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::with_capacity(raw_ifaces.len());

    for (i, raw) in raw_ifaces.iter().enumerate() {
        let base = AttributePath::root("network_interfaces").index(i);
        let errors_before = diags.errors().count();

        let name = required_string(
            &raw.guest_device_name,
            base.clone().key("guest_device_name"),
            diags,
        );
        if let Some(name) = &name {
            if !seen.insert(name.clone()) {
                diags.append(
                    Diagnostic::error(
                        "Duplicate network interface",
                        format!("Guest device `{name}` is declared more than once."),
                    )
                    .at(base.clone().key("guest_device_name")),
                );
            }
        }

        let kind = match raw.kind {
            Configured::Null => InterfaceKind::default(),
            Configured::Unknown => {
                diags.append(unknown_value(base.clone().key("kind")));
                InterfaceKind::default()
            }
            Configured::Value(kind) => kind,
        };

        let guest_mac = optional_string(&raw.guest_mac, base.clone().key("guest_mac"), diags);
        if let Some(mac) = &guest_mac {
            if !is_valid_mac(mac) {
                diags.append(
                    Diagnostic::error(
                        "Invalid MAC address",
                        format!("`{mac}` is not six colon-separated hex octets."),
                    )
                    .at(base.clone().key("guest_mac")),
                );
            }
        }

        let address = optional_string(&raw.address, base.clone().key("address"), diags);
        if let Some(address) = &address {
            if let Err(reason) = validate_cidr(address) {
                diags.append(
                    Diagnostic::error("Invalid interface address", reason)
                        .at(base.clone().key("address")),
                );
            }
        }

        let dhcp = match raw.dhcp {
            Configured::Null => address.is_none(),
            Configured::Unknown => {
                diags.append(unknown_value(base.clone().key("dhcp")));
                false
            }
            Configured::Value(true) if address.is_some() => {
                diags.append(
                    Diagnostic::error(
                        "Conflicting interface addressing",
                        "`address` and `dhcp = true` are mutually exclusive.",
                    )
                    .at(base.clone().key("dhcp")),
                );
                true
            }
            Configured::Value(dhcp) => dhcp,
        };

        if diags.errors().count() == errors_before {
            if let Some(guest_device_name) = name {
                out.push(NetworkInterface {
                    guest_device_name,
                    kind,
                    guest_mac,
                    address,
                    dhcp,
                });
            }
        }
    }

    out
}

fn optional_string(
    value: &Configured<String>,
    path: AttributePath,
    diags: &mut Diagnostics,
) -> Option<String> {
    match value {
        Configured::Null => None,
        Configured::Unknown => {
            diags.append(unknown_value(path));
            None
        }
        Configured::Value(s) if s.is_empty() => None,
        Configured::Value(s) => Some(s.clone()),
    }
}

fn validate_id(id: &str) -> Result<(), String> {
    if id.len() > MAX_ID_LEN {
        return Err(format!(
            "Identifier `{id}` is longer than {MAX_ID_LEN} characters."
        ));
    }
    if let Some(c) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(format!("Identifier `{id}` contains invalid character {c:?}."));
    }
    Ok(())
}

fn is_valid_mac(mac: &str) -> bool {
    let octets: Vec<_> = mac.split(':').collect();
    octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()))
}

fn validate_cidr(address: &str) -> Result<(), String> {
    let (ip, prefix) = address
        .split_once('/')
        .ok_or_else(|| format!("`{address}` is not in CIDR notation (a.b.c.d/len)."))?;
    ip.parse::<Ipv4Addr>()
        .map_err(|e| format!("`{ip}` is not an IPv4 address: {e}"))?;
    match prefix.parse::<u8>() {
        Ok(len) if len <= 32 => Ok(()),
        _ => Err(format!("`{prefix}` is not a valid prefix length.")),
    }
}
