//! Service definition canonicalization.
//!
//! User-supplied service definitions are free-form YAML/JSON mappings with a
//! number of shorthand spellings (a bare command string, a `port:` shortcut,
//! a list of port names). [`canonicalize`] normalizes a raw definition into a
//! [`Definition`] with one spelling per concept, so that two definitions can
//! be compared structurally to decide whether a service changed.
//!
//! Canonicalization is a pure function: it is idempotent and independent of
//! input key order. Everything the canonicalizer does not recognize survives
//! untouched in [`Definition::kwargs`] for plugins to interpret.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

// ─── PortSpec ─────────────────────────────────────────────────────────────────

/// A container port in a canonical definition: either a concrete port number
/// or the request to assign one at deploy time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSpec {
    /// Pick a free host port and use the same number inside the container.
    Assign,
    /// A fixed container port.
    Number(u16),
}

impl PortSpec {
    /// Parses a port value from raw definition data.
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::String(s) if s == "assign" => Ok(PortSpec::Assign),
            Value::String(s) => s
                .parse::<u16>()
                .map(PortSpec::Number)
                .map_err(|_| Error::InvalidDefinition(format!("not a port number: {s:?}"))),
            Value::Number(n) => n
                .as_u64()
                .filter(|n| *n <= u16::MAX as u64)
                .map(|n| PortSpec::Number(n as u16))
                .ok_or_else(|| Error::InvalidDefinition(format!("not a port number: {n}"))),
            other => Err(Error::InvalidDefinition(format!(
                "not a port number: {other}"
            ))),
        }
    }
}

impl Serialize for PortSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            PortSpec::Assign => serializer.serialize_str("assign"),
            PortSpec::Number(n) => serializer.serialize_u16(*n),
        }
    }
}

impl<'de> Deserialize<'de> for PortSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        PortSpec::from_value(&value).map_err(D::Error::custom)
    }
}

// ─── HostBinding ──────────────────────────────────────────────────────────────

/// A host-side address a container port is published on.
///
/// Spelled `ip`, `ip:port` or a bare port number in definitions; a missing
/// port means "any free port on that address".
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostBinding {
    pub ip: String,
    pub port: Option<u16>,
}

impl HostBinding {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        HostBinding {
            ip: ip.into(),
            port: Some(port),
        }
    }
}

impl fmt::Display for HostBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.ip, port),
            None => write!(f, "{}", self.ip),
        }
    }
}

impl FromStr for HostBinding {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Ok(port) = s.parse::<u16>() {
            return Ok(HostBinding {
                ip: String::new(),
                port: Some(port),
            });
        }
        match s.split_once(':') {
            Some((ip, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    Error::InvalidDefinition(format!("invalid host binding: {s:?}"))
                })?;
                Ok(HostBinding {
                    ip: ip.to_string(),
                    port: Some(port),
                })
            }
            None => Ok(HostBinding {
                ip: s.to_string(),
                port: None,
            }),
        }
    }
}

impl Serialize for HostBinding {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HostBinding {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

// ─── Definition ───────────────────────────────────────────────────────────────

/// The canonical, field-complete form of a service definition.
///
/// Two definitions compare equal iff they are deep-equal field by field;
/// `Clone` produces a fully independent copy (plugins mutate working copies
/// during runcfg synthesis without affecting the stored version).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Definition {
    /// Container image reference. Defaults to the service name.
    pub image: String,
    /// Command; a string input is lowered to `["/bin/sh", "-c", input]`.
    #[serde(default)]
    pub cmd: Vec<String>,
    /// Entrypoint; a string input is split shell-style.
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Volume name to container path.
    #[serde(default)]
    pub volumes: BTreeMap<String, String>,
    #[serde(default)]
    pub privileged: bool,
    /// Port name to container port. The empty string is the default port.
    #[serde(default)]
    pub ports: IndexMap<String, PortSpec>,
    /// Extra host bindings, keyed by the binding, mapping to a port name.
    #[serde(default)]
    pub wan_map: BTreeMap<HostBinding, String>,
    /// All fields the canonicalizer does not recognize, owned by plugins.
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl Definition {
    /// Looks up a plugin-owned key.
    pub fn kwarg(&self, key: &str) -> Option<&Value> {
        self.kwargs.get(key)
    }
}

// ─── Canonicalization ─────────────────────────────────────────────────────────

fn scalar_string(name: &str, field: &str, value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(Error::InvalidDefinition(format!(
            "service {name}: {field} must be a scalar, got {other}"
        ))),
    }
}

fn string_seq(name: &str, field: &str, items: &[Value]) -> Result<Vec<String>> {
    items
        .iter()
        .map(|item| scalar_string(name, field, item))
        .collect()
}

fn string_map(name: &str, field: &str, value: Value) -> Result<BTreeMap<String, String>> {
    match value {
        Value::Null => Ok(BTreeMap::new()),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| Ok((k.clone(), scalar_string(name, field, v)?)))
            .collect(),
        other => Err(Error::InvalidDefinition(format!(
            "service {name}: {field} must be a mapping, got {other}"
        ))),
    }
}

/// Normalizes a raw service definition.
///
/// Returns the effective service name alongside the canonical definition:
/// when no explicit `image` is given the input name doubles as the image
/// reference and its last path segment becomes the service name.
///
/// Fails with [`Error::InvalidDefinition`] when both `port` and `ports` are
/// set, or when a field has an unusable shape.
pub fn canonicalize(name: &str, raw: &Value) -> Result<(String, Definition)> {
    let mut fields = match raw {
        Value::Object(map) => map.clone(),
        // A bare string is a command-only shorthand.
        Value::String(cmd) => {
            let mut map = Map::new();
            map.insert("cmd".to_string(), Value::String(cmd.clone()));
            map
        }
        Value::Null => Map::new(),
        other => {
            return Err(Error::InvalidDefinition(format!(
                "service {name}: expected a mapping, got {other}"
            )));
        }
    };

    // The image can be given instead of an explicit name; only the last
    // path segment is then used as the name.
    let (effective_name, image) = match fields.remove("image") {
        Some(Value::String(image)) => (name.to_string(), image),
        Some(other) => {
            return Err(Error::InvalidDefinition(format!(
                "service {name}: image must be a string, got {other}"
            )));
        }
        None => {
            let short = name.rsplit('/').next().unwrap_or(name).to_string();
            (short, name.to_string())
        }
    };

    let cmd = match fields.remove("cmd") {
        None | Some(Value::Null) => Vec::new(),
        // The container runtime accepts a plain string and runs it through
        // a shell; normalize to the list form it would use.
        Some(Value::String(s)) => vec!["/bin/sh".to_string(), "-c".to_string(), s],
        Some(Value::Array(items)) => string_seq(name, "cmd", &items)?,
        Some(other) => {
            return Err(Error::InvalidDefinition(format!(
                "service {name}: cmd must be a string or list, got {other}"
            )));
        }
    };

    let entrypoint = match fields.remove("entrypoint") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::String(s)) => shlex::split(&s).ok_or_else(|| {
            Error::InvalidDefinition(format!("service {name}: unbalanced quotes in entrypoint"))
        })?,
        Some(Value::Array(items)) => string_seq(name, "entrypoint", &items)?,
        Some(other) => {
            return Err(Error::InvalidDefinition(format!(
                "service {name}: entrypoint must be a string or list, got {other}"
            )));
        }
    };

    let env = string_map(name, "env", fields.remove("env").unwrap_or(Value::Null))?;
    let volumes = string_map(
        name,
        "volumes",
        fields.remove("volumes").unwrap_or(Value::Null),
    )?;

    let privileged = match fields.remove("privileged") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => b,
        Some(other) => {
            return Err(Error::InvalidDefinition(format!(
                "service {name}: privileged must be a boolean, got {other}"
            )));
        }
    };

    let wan_map = match fields.remove("wan_map") {
        None | Some(Value::Null) => BTreeMap::new(),
        Some(Value::Object(map)) => map
            .iter()
            .map(|(binding, port_name)| {
                Ok((
                    binding.parse::<HostBinding>()?,
                    scalar_string(name, "wan_map", port_name)?,
                ))
            })
            .collect::<Result<BTreeMap<_, _>>>()?,
        Some(other) => {
            return Err(Error::InvalidDefinition(format!(
                "service {name}: wan_map must be a mapping, got {other}"
            )));
        }
    };

    let port = fields.remove("port").filter(|p| !p.is_null());
    let ports_field = fields.remove("ports");
    if port.is_some() && ports_field.as_ref().is_some_and(|p| !p.is_null()) {
        return Err(Error::InvalidDefinition(format!(
            "service {name}: specify either port or ports, not both"
        )));
    }
    let ports: IndexMap<String, PortSpec> = if let Some(port) = port {
        // Shortcut to specify the default port.
        IndexMap::from([(String::new(), PortSpec::from_value(&port)?)])
    } else {
        match ports_field {
            // If no ports are given, always provide a default port.
            None | Some(Value::Null) => IndexMap::from([(String::new(), PortSpec::Assign)]),
            Some(Value::Object(map)) if map.is_empty() => {
                IndexMap::from([(String::new(), PortSpec::Assign)])
            }
            // A list of port names means: assign each one.
            Some(Value::Array(names)) => names
                .iter()
                .map(|n| Ok((scalar_string(name, "ports", n)?, PortSpec::Assign)))
                .collect::<Result<IndexMap<_, _>>>()?,
            Some(Value::Object(map)) => map
                .iter()
                .map(|(port_name, spec)| Ok((port_name.clone(), PortSpec::from_value(spec)?)))
                .collect::<Result<IndexMap<_, _>>>()?,
            Some(other) => {
                return Err(Error::InvalidDefinition(format!(
                    "service {name}: ports must be a mapping or list, got {other}"
                )));
            }
        }
    };

    // Hide all other, non-default keys in the kwargs bag.
    let mut kwargs = match fields.remove("kwargs") {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    for (key, value) in fields {
        kwargs.insert(key, value);
    }

    Ok((
        effective_name,
        Definition {
            image,
            cmd,
            entrypoint,
            env,
            volumes,
            privileged,
            ports,
            wan_map,
            kwargs,
        },
    ))
}
